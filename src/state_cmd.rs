//! `cmdx state ...` commands.

use anyhow::{bail, Result};
use serde_json::Value;

use crate::config::Config;
use crate::runtime::render_output;
use crate::state::StateStore;

fn open(config: &Config) -> StateStore {
    StateStore::new(config.state_file())
}

pub fn run_show(config: &Config) -> Result<()> {
    let all = open(config).get_all()?;
    println!("{}", serde_json::to_string_pretty(&Value::Object(all))?);
    Ok(())
}

pub fn run_get(config: &Config, key: &str) -> Result<()> {
    match open(config).get(key)? {
        Some(value) => {
            if let Some(text) = render_output(&value) {
                println!("{}", text);
            }
            Ok(())
        }
        None => bail!("key '{}' not found", key),
    }
}

/// `VALUE` is stored as JSON when it parses, as a string otherwise.
pub fn run_set(config: &Config, key: &str, raw: &str) -> Result<()> {
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    open(config).set(key, value)?;
    println!("Set '{}'.", key);
    Ok(())
}

pub fn run_delete(config: &Config, key: &str) -> Result<()> {
    if !open(config).delete(key)? {
        bail!("key '{}' not found", key);
    }
    println!("Deleted '{}'.", key);
    Ok(())
}

pub fn run_clear(config: &Config) -> Result<()> {
    open(config).clear()?;
    println!("State cleared.");
    Ok(())
}

pub fn run_keys(config: &Config) -> Result<()> {
    for key in open(config).list_keys()? {
        println!("{}", key);
    }
    Ok(())
}
