//! `cmdx cmd list` and `cmdx cmd desc`.

use anyhow::{anyhow, Result};

use crate::catalog;
use crate::config::{Config, ParamKind};

pub fn run_list(config: &Config) -> Result<()> {
    let summaries = catalog::command_summaries(config);
    println!("{}", serde_json::to_string_pretty(&summaries)?);
    Ok(())
}

/// Describe one subcommand, named either `command.sub` or `command sub`.
pub fn run_desc(config: &Config, target: &str, sub: Option<&str>, as_json: bool) -> Result<()> {
    let (cmd_name, sub_name) = match sub {
        Some(s) => (target, s),
        None => target
            .split_once('.')
            .or_else(|| target.trim().split_once(char::is_whitespace))
            .map(|(c, s)| (c.trim(), s.trim()))
            .ok_or_else(|| anyhow!("expected 'command.subcommand', got '{}'", target))?,
    };

    let (cmd, sub) = config
        .find_subcommand(cmd_name, sub_name)
        .ok_or_else(|| anyhow!("unknown command '{} {}'", cmd_name, sub_name))?;
    let description = catalog::describe(sub);

    if as_json {
        let schema = catalog::serialize_schema(cmd, sub, &description);
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    println!("{} {}", cmd.name, sub.name);
    if !description.is_empty() {
        println!("  {}", description);
    }
    println!();
    println!("Request: {} {}", sub.request.method.to_uppercase(), sub.request.url);

    if !sub.arguments.is_empty() {
        println!();
        println!("Arguments:");
        for arg in &sub.arguments {
            let shown = match arg.param_type {
                ParamKind::Argument => format!("<{}>", arg.name),
                ParamKind::Option => arg.flag_name(),
            };
            let mut traits = vec![
                arg.value_type.as_str().to_string(),
                arg.location.as_str().to_string(),
            ];
            if arg.required {
                traits.push("required".to_string());
            }
            if let Some(default) = arg.default.as_ref().filter(|d| !d.is_null()) {
                traits.push(format!("default {}", default));
            }
            println!("  {:<24} {} ({})", shown, arg.help, traits.join(", "));
        }
    }
    Ok(())
}
