//! Secret resolution for script helpers.

use std::collections::BTreeMap;
use std::process::Command;

use crate::config::{expand_home, SecretDefinition};
use crate::error::{Error, Result};

/// Resolve the secret called `name` using its configured strategy.
pub fn resolve_secret(secrets: &BTreeMap<String, SecretDefinition>, name: &str) -> Result<String> {
    let def = secrets
        .get(name)
        .ok_or_else(|| Error::SecretNotFound(name.to_string()))?;

    match def {
        SecretDefinition::Env { env } => std::env::var(env).map_err(|_| {
            Error::SecretNotFound(format!(
                "{} (environment variable '{}' is not set)",
                name, env
            ))
        }),
        SecretDefinition::Value { value } => Ok(value.clone()),
        SecretDefinition::File { path, encoding } => {
            let enc = encoding.to_ascii_lowercase().replace('_', "-");
            if enc != "utf-8" && enc != "utf8" {
                return Err(Error::SecretResolution {
                    name: name.to_string(),
                    reason: format!("unsupported encoding '{}'", encoding),
                });
            }
            let path = expand_home(path);
            let content = std::fs::read_to_string(&path).map_err(|e| Error::SecretResolution {
                name: name.to_string(),
                reason: format!("cannot read {}: {}", path.display(), e),
            })?;
            Ok(content.trim().to_string())
        }
        SecretDefinition::Command { value } => run_secret_command(name, value),
    }
}

fn run_secret_command(name: &str, command: &str) -> Result<String> {
    tracing::debug!(secret = name, "resolving secret via shell command");
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .map_err(|e| Error::SecretResolution {
            name: name.to_string(),
            reason: format!("failed to spawn command: {}", e),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::SecretResolution {
            name: name.to_string(),
            reason: format!("command exited with {}: {}", output.status, stderr.trim()),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
