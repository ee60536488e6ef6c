//! End-to-end execution of one configured subcommand.
//!
//! bind → `prepare` → HTTP → `process_response`. Script hooks run on a
//! blocking thread via [`tokio::task::spawn_blocking`].

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::binder;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::RequestExecutor;
use crate::models::section_id;
use crate::script::{PrepareOutcome, ScriptRuntime};
use crate::state::StateStore;

/// Per-process execution context: config, script cache, HTTP client and
/// state store. Rebuilding it after a config reload drops every cache.
pub struct CommandRuntime {
    config: Arc<Config>,
    scripts: ScriptRuntime,
    executor: RequestExecutor,
    state: Arc<StateStore>,
}

impl CommandRuntime {
    pub fn new(config: Config) -> Result<Self> {
        let state = Arc::new(StateStore::new(config.state_file()));
        let scripts = ScriptRuntime::new(config.secrets.clone(), state.clone());
        Ok(Self {
            config: Arc::new(config),
            scripts,
            executor: RequestExecutor::new()?,
            state,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    /// Run `command subcommand` with argument values keyed by name.
    ///
    /// Returns whatever `process_response` produced.
    pub async fn run(
        &self,
        command: &str,
        subcommand: &str,
        values: &BTreeMap<String, Value>,
    ) -> Result<Value> {
        let (_, sub) = self
            .config
            .find_subcommand(command, subcommand)
            .ok_or_else(|| {
                Error::Binding(format!("unknown command '{} {}'", command, subcommand))
            })?;
        let label = section_id(command, subcommand);

        let descriptor = binder::bind(sub, values)?;
        let script = self.scripts.compile(&label, sub)?;

        let prepare_script = script.clone();
        let outcome = tokio::task::spawn_blocking(move || prepare_script.prepare(&descriptor))
            .await
            .map_err(|e| Error::ScriptExecution {
                function: "prepare".into(),
                message: e.to_string(),
            })??;

        let result_data = match outcome {
            PrepareOutcome::Send(request) => {
                let timeout = effective_timeout(request.timeout, self.config.http_timeout);
                tracing::info!(command = %label, method = %request.method, url = %request.url, "dispatching");
                self.executor
                    .execute(&request, &sub.request.response, timeout)
                    .await?
            }
            PrepareOutcome::Skip => {
                tracing::info!(command = %label, "prepare returned nil, skipping request");
                Value::Null
            }
        };

        tokio::task::spawn_blocking(move || script.process_response(&result_data))
            .await
            .map_err(|e| Error::ScriptExecution {
                function: "process_response".into(),
                message: e.to_string(),
            })?
    }
}

/// The prepared request's timeout (which already defaults to the
/// subcommand's own) wins over the global `http_timeout`.
pub fn effective_timeout(prepared: Option<f64>, global: Option<f64>) -> Option<f64> {
    prepared.filter(|t| *t > 0.0).or(global)
}

/// Text printed for a command result: strings raw, structures as pretty
/// JSON, nothing for `null`.
pub fn render_output(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string())),
    }
}
