//! Compiled `prepare` / `process_response` script units.
//!
//! A subcommand's `prepare_code` and `response_code` are loaded together
//! into one sandboxed VM. Compiled units are cached by a SHA-256 digest of
//! the two sources, so repeated invocations of the same subcommand reuse
//! the VM. The cache belongs to a [`ScriptRuntime`] and is dropped with it.

use mlua::prelude::*;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::config::{SecretDefinition, SubcommandDefinition, DEFAULT_RESPONSE_CODE};
use crate::error::{Error, Result};
use crate::lua_runtime::{
    json_value_to_lua, lua_value_to_json, register_helpers, root_message, sandbox_globals,
    HelperContext, HELPERS_KEY,
};
use crate::models::RequestDescriptor;
use crate::state::StateStore;

/// Result of running `prepare`.
#[derive(Debug, Clone, PartialEq)]
pub enum PrepareOutcome {
    /// Dispatch this request.
    Send(RequestDescriptor),
    /// `prepare` returned `nil`: no network call.
    Skip,
}

/// Owns the helper context and the compilation cache.
pub struct ScriptRuntime {
    ctx: HelperContext,
    cache: Mutex<HashMap<String, Arc<CompiledScript>>>,
}

impl ScriptRuntime {
    pub fn new(secrets: BTreeMap<String, SecretDefinition>, state: Arc<StateStore>) -> Self {
        Self {
            ctx: HelperContext {
                secrets: Arc::new(secrets),
                state,
            },
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Compile (or fetch from cache) the script unit for a subcommand.
    ///
    /// `label` names the subcommand in compile errors, e.g. `storage.list`.
    pub fn compile(&self, label: &str, sub: &SubcommandDefinition) -> Result<Arc<CompiledScript>> {
        let key = script_hash(&sub.prepare_code, &sub.response_code);

        let mut cache = self
            .cache
            .lock()
            .map_err(|_| Error::Store("script cache lock poisoned".into()))?;
        if let Some(hit) = cache.get(&key) {
            tracing::debug!(subcommand = label, "script cache hit");
            return Ok(hit.clone());
        }

        let compiled = Arc::new(CompiledScript::load(
            label,
            &sub.prepare_code,
            &sub.response_code,
            &self.ctx,
        )?);
        cache.insert(key, compiled.clone());
        tracing::debug!(subcommand = label, "compiled script");
        Ok(compiled)
    }

    /// Number of distinct compiled units held.
    pub fn cached_units(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }
}

fn script_hash(prepare: &str, response: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prepare.as_bytes());
    hasher.update([0u8]);
    hasher.update(response.as_bytes());
    hex::encode(hasher.finalize())
}

/// One loaded VM exposing `prepare` and `process_response`.
pub struct CompiledScript {
    lua: Mutex<Lua>,
}

impl CompiledScript {
    fn load(label: &str, prepare: &str, response: &str, ctx: &HelperContext) -> Result<Self> {
        let compile_err = |message: String| Error::ScriptCompile {
            subcommand: label.to_string(),
            message,
        };

        let lua = Lua::new();
        sandbox_globals(&lua).map_err(|e| compile_err(root_message(&e)))?;

        let source = format!("{}\n\n{}", prepare, response);
        lua.load(source.as_str())
            .set_name(label)
            .exec()
            .map_err(|e| compile_err(root_message(&e)))?;

        let globals = lua.globals();
        let prepare_fn: LuaValue = globals
            .get("prepare")
            .map_err(|e| compile_err(root_message(&e)))?;
        if !prepare_fn.is_function() {
            return Err(compile_err("no 'prepare' function defined".into()));
        }

        let response_fn: LuaValue = globals
            .get("process_response")
            .map_err(|e| compile_err(root_message(&e)))?;
        if !response_fn.is_function() {
            lua.load(DEFAULT_RESPONSE_CODE)
                .set_name("process_response")
                .exec()
                .map_err(|e| compile_err(root_message(&e)))?;
        }

        register_helpers(&lua, ctx).map_err(|e| compile_err(root_message(&e)))?;

        Ok(Self {
            lua: Mutex::new(lua),
        })
    }

    /// Run `prepare(request, helpers)`.
    ///
    /// A returned table is merged onto `request`; `nil` means skip.
    pub fn prepare(&self, request: &RequestDescriptor) -> Result<PrepareOutcome> {
        let returned = self.call("prepare", &request.to_script_value())?;
        match returned {
            Value::Null => Ok(PrepareOutcome::Skip),
            v @ Value::Object(_) => Ok(PrepareOutcome::Send(request.merged_with_script_value(&v))),
            other => Err(Error::ScriptExecution {
                function: "prepare".into(),
                message: format!("expected a table or nil, got {}", json_kind(&other)),
            }),
        }
    }

    /// Run `process_response(response, helpers)`.
    pub fn process_response(&self, response: &Value) -> Result<Value> {
        self.call("process_response", response)
    }

    fn call(&self, function: &str, input: &Value) -> Result<Value> {
        let exec_err = |message: String| Error::ScriptExecution {
            function: function.to_string(),
            message,
        };

        let lua = self
            .lua
            .lock()
            .map_err(|_| exec_err("script VM lock poisoned".into()))?;

        let func: LuaFunction = lua
            .globals()
            .get(function)
            .map_err(|e| exec_err(root_message(&e)))?;
        let helpers: LuaTable = lua
            .named_registry_value(HELPERS_KEY)
            .map_err(|e| exec_err(root_message(&e)))?;
        let arg = json_value_to_lua(&lua, input).map_err(|e| exec_err(root_message(&e)))?;

        let result: LuaValue = func
            .call((arg, helpers))
            .map_err(|e| exec_err(root_message(&e)))?;
        lua_value_to_json(&lua, result).map_err(|e| exec_err(root_message(&e)))
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "nil",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "table",
    }
}
