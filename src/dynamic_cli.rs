//! Config-driven command line parsing.
//!
//! Each configured command becomes a clap subcommand group and each of its
//! subcommands a leaf with one clap argument per [`ArgumentDefinition`].
//! Positional arguments keep their configured order; options become
//! `--kebab-case` flags (or the configured `cli_name`), with `aliases`
//! starting with `--` added as long aliases and single-dash ones as short
//! flags. `bool` options are plain switches.

use clap::parser::ValueSource;
use clap::{Arg, ArgAction, ArgMatches, Command};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::config::{ArgumentDefinition, Config, ParamKind, SubcommandDefinition, ValueType};

/// A parsed `<command> <subcommand> [args...]` invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub command: String,
    pub subcommand: String,
    /// Values actually given on the command line, keyed by argument name.
    pub values: BTreeMap<String, Value>,
}

/// Build the clap tree for every configured command.
pub fn build_command(config: &Config) -> Command {
    let mut root = Command::new("cmdx")
        .no_binary_name(true)
        .subcommand_required(true)
        .arg_required_else_help(true);

    for cmd in &config.commands {
        let mut group = Command::new(cmd.name.clone())
            .about(cmd.help.clone())
            .subcommand_required(true)
            .arg_required_else_help(true);
        for sub in &cmd.subcommands {
            group = group.subcommand(build_subcommand(sub));
        }
        root = root.subcommand(group);
    }
    root
}

/// Leaf subcommands drop clap's built-in help flag, since configs may use
/// `-h` or `--help` for their own arguments, and re-add whichever of the
/// two is still free.
fn build_subcommand(sub: &SubcommandDefinition) -> Command {
    let mut command = Command::new(sub.name.clone())
        .about(sub.help.clone())
        .disable_help_flag(true);
    if let Some(help) = help_arg(sub) {
        command = command.arg(help);
    }
    let mut position = 0;
    for def in &sub.arguments {
        let arg = match def.param_type {
            ParamKind::Argument => {
                position += 1;
                positional_arg(def, position)
            }
            ParamKind::Option => option_arg(def),
        };
        command = command.arg(arg);
    }
    command
}

fn help_arg(sub: &SubcommandDefinition) -> Option<Arg> {
    let options = || {
        sub.arguments
            .iter()
            .filter(|d| d.param_type == ParamKind::Option)
    };
    let long_taken = options()
        .any(|d| d.flag_name() == "--help" || d.aliases.iter().any(|a| a == "--help"));
    let short_taken = options().any(|d| d.aliases.iter().any(|a| a == "-h"));

    let mut arg = Arg::new(HELP_ID)
        .action(ArgAction::Help)
        .help("Print help");
    match (long_taken, short_taken) {
        (true, true) => return None,
        (false, true) => arg = arg.long("help"),
        (true, false) => arg = arg.short('h'),
        (false, false) => arg = arg.long("help").short('h'),
    }
    Some(arg)
}

/// Kept distinct from any argument name so a configured `help` argument
/// can coexist with the help flag.
const HELP_ID: &str = "cmdx-help";

fn positional_arg(def: &ArgumentDefinition, index: usize) -> Arg {
    Arg::new(def.name.clone())
        .index(index)
        .required(cli_required(def))
        .value_name(def.name.to_uppercase())
        .help(def.help.clone())
        .action(ArgAction::Set)
}

fn option_arg(def: &ArgumentDefinition) -> Arg {
    let long = def.flag_name().trim_start_matches('-').to_string();
    let mut arg = Arg::new(def.name.clone())
        .long(long)
        .required(cli_required(def))
        .help(def.help.clone());

    let mut has_short = false;
    for alias in &def.aliases {
        if let Some(long_alias) = alias.strip_prefix("--") {
            arg = arg.visible_alias(long_alias.to_string());
        } else if let Some(short) = alias.strip_prefix('-') {
            let mut chars = short.chars();
            if let (Some(c), None) = (chars.next(), chars.next()) {
                arg = if has_short {
                    arg.visible_short_alias(c)
                } else {
                    has_short = true;
                    arg.short(c)
                };
            }
        }
    }

    if def.value_type == ValueType::Bool {
        arg.action(ArgAction::SetTrue)
    } else {
        arg.action(ArgAction::Set)
            .value_name(def.value_type.as_str().to_uppercase())
    }
}

/// Required on the command line only when there is nothing to fall back to.
fn cli_required(def: &ArgumentDefinition) -> bool {
    def.required && def.default.as_ref().map_or(true, Value::is_null)
}

/// Parse `args` (starting with the command name) against the config.
pub fn parse_invocation(config: &Config, args: &[String]) -> Result<Invocation, clap::Error> {
    let matches = build_command(config).try_get_matches_from(args)?;

    let Some((command, group_matches)) = matches.subcommand() else {
        return Err(missing_subcommand());
    };
    let Some((subcommand, sub_matches)) = group_matches.subcommand() else {
        return Err(missing_subcommand());
    };

    let values = config
        .find_subcommand(command, subcommand)
        .map(|(_, sub)| collect_values(sub, sub_matches))
        .unwrap_or_default();

    Ok(Invocation {
        command: command.to_string(),
        subcommand: subcommand.to_string(),
        values,
    })
}

fn collect_values(sub: &SubcommandDefinition, matches: &ArgMatches) -> BTreeMap<String, Value> {
    let mut values = BTreeMap::new();
    for def in &sub.arguments {
        if matches.value_source(&def.name) != Some(ValueSource::CommandLine) {
            continue;
        }
        let value = if def.value_type == ValueType::Bool && def.param_type == ParamKind::Option {
            Value::Bool(matches.get_flag(&def.name))
        } else {
            match matches.get_one::<String>(&def.name) {
                Some(v) => Value::String(v.clone()),
                None => continue,
            }
        };
        values.insert(def.name.clone(), value);
    }
    values
}

fn missing_subcommand() -> clap::Error {
    clap::Error::raw(
        clap::error::ErrorKind::MissingSubcommand,
        "a command and subcommand are required\n",
    )
}
