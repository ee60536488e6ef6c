//! Sandboxed Lua 5.4 VM setup for subcommand scripts.
//!
//! Every compiled script gets its own VM with the dangerous standard
//! libraries removed and a single `helpers` table registered. The helper
//! table is the whole capability surface a script has:
//!
//! | Helper | Behaviour |
//! |--------|-----------|
//! | `secret(name)` | resolve a configured secret |
//! | `env(key, default?)` | read an environment variable |
//! | `json(value)` | parse a string (unparseable text comes back as is), pass a table through, encode anything else |
//! | `dumps(value)` / `loads(text)` | JSON encode (indented) / decode |
//! | `get(map, key, default)` | lookup with fallback |
//! | `filter(list, key, value)` | keep entries whose `key` equals `value` |
//! | `map(list, keys)` | project each entry onto `keys` |
//! | `state_get/state_set/state_delete/state_clear` | state store access |
//! | `log/warn/error(...)` | diagnostics |
//! | `null` | sentinel for a JSON `null` nested in a table |
//!
//! JSON arrays arrive as tables carrying mlua's array metatable, so an
//! empty array stays an array on the way back out. A top-level `null` is
//! passed as `nil`.
//!
//! Scripts run on a blocking thread, so every helper is synchronous.

use colored::Colorize;
use mlua::prelude::*;
use mlua::{DeserializeOptions, LuaSerdeExt, Variadic};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::SecretDefinition;
use crate::secrets::resolve_secret;
use crate::state::StateStore;

/// Registry slot holding the helpers table of a VM.
pub(crate) const HELPERS_KEY: &str = "helpers";

/// What the helper functions are allowed to reach.
#[derive(Clone)]
pub struct HelperContext {
    pub secrets: Arc<BTreeMap<String, SecretDefinition>>,
    pub state: Arc<StateStore>,
}

/// Remove dangerous standard library functions from the Lua globals.
pub(crate) fn sandbox_globals(lua: &Lua) -> LuaResult<()> {
    let globals = lua.globals();
    globals.set("os", LuaValue::Nil)?;
    globals.set("io", LuaValue::Nil)?;
    globals.set("loadfile", LuaValue::Nil)?;
    globals.set("dofile", LuaValue::Nil)?;
    globals.set("debug", LuaValue::Nil)?;
    Ok(())
}

/// Build the helpers table and store it in the VM's named registry.
pub(crate) fn register_helpers(lua: &Lua, ctx: &HelperContext) -> LuaResult<()> {
    let helpers = lua.create_table()?;

    let secrets = ctx.secrets.clone();
    helpers.set(
        "secret",
        lua.create_function(move |_lua, name: String| {
            resolve_secret(&secrets, &name).map_err(LuaError::external)
        })?,
    )?;

    helpers.set(
        "env",
        lua.create_function(|_lua, (key, default): (String, Option<String>)| {
            match (std::env::var(&key), default) {
                (Ok(v), _) => Ok(v),
                (Err(_), Some(d)) => Ok(d),
                (Err(_), None) => Err(LuaError::external(anyhow::anyhow!(
                    "environment variable '{}' is not set",
                    key
                ))),
            }
        })?,
    )?;

    helpers.set(
        "json",
        lua.create_function(|lua, value: LuaValue| match value {
            LuaValue::String(s) => {
                let parsed = serde_json::from_str::<Value>(&s.to_str()?);
                match parsed {
                    Ok(parsed) => json_value_to_lua(lua, &parsed),
                    Err(_) => Ok(LuaValue::String(s)),
                }
            }
            LuaValue::Table(_) => Ok(value),
            other => {
                let text = encode_json(lua_value_to_json(lua, other)?)?;
                lua.create_string(&text).map(LuaValue::String)
            }
        })?,
    )?;

    helpers.set(
        "dumps",
        lua.create_function(|lua, value: LuaValue| {
            let value = lua_value_to_json(lua, value)?;
            serde_json::to_string_pretty(&value)
                .map_err(|e| LuaError::external(anyhow::anyhow!("cannot encode JSON: {}", e)))
        })?,
    )?;

    helpers.set(
        "loads",
        lua.create_function(|lua, text: String| {
            let parsed = parse_json_text(&text)?;
            json_value_to_lua(lua, &parsed)
        })?,
    )?;

    helpers.set(
        "get",
        lua.create_function(
            |_lua, (map, key, default): (Option<LuaTable>, LuaValue, LuaValue)| {
                let Some(map) = map else {
                    return Ok(default);
                };
                let found: LuaValue = map.get(key)?;
                Ok(if found.is_nil() { default } else { found })
            },
        )?,
    )?;

    helpers.set(
        "filter",
        lua.create_function(|lua, (list, key, value): (LuaTable, String, LuaValue)| {
            let wanted = lua_value_to_json(lua, value)?;
            let out = new_array(lua)?;
            let mut n = 0;
            for item in list.sequence_values::<LuaValue>() {
                let LuaValue::Table(entry) = item? else {
                    continue;
                };
                let field = lua_value_to_json(lua, entry.get::<LuaValue>(key.as_str())?)?;
                if json_loosely_equal(&field, &wanted) {
                    n += 1;
                    out.raw_set(n, entry)?;
                }
            }
            Ok(out)
        })?,
    )?;

    helpers.set(
        "map",
        lua.create_function(|lua, (list, keys): (LuaTable, Vec<String>)| {
            let out = new_array(lua)?;
            let mut n = 0;
            for item in list.sequence_values::<LuaValue>() {
                let LuaValue::Table(entry) = item? else {
                    continue;
                };
                let projected = lua.create_table()?;
                for k in &keys {
                    projected.set(k.as_str(), entry.get::<LuaValue>(k.as_str())?)?;
                }
                n += 1;
                out.raw_set(n, projected)?;
            }
            Ok(out)
        })?,
    )?;

    helpers.set("null", lua.null())?;

    register_state_helpers(lua, &helpers, ctx.state.clone())?;
    register_log_helpers(lua, &helpers)?;

    lua.set_named_registry_value(HELPERS_KEY, helpers)?;
    Ok(())
}

fn register_state_helpers(lua: &Lua, helpers: &LuaTable, state: Arc<StateStore>) -> LuaResult<()> {
    let s = state.clone();
    helpers.set(
        "state_get",
        lua.create_function(move |lua, (key, default): (String, LuaValue)| {
            match s.get(&key).map_err(LuaError::external)? {
                Some(v) => json_value_to_lua(lua, &v),
                None => Ok(default),
            }
        })?,
    )?;

    let s = state.clone();
    helpers.set(
        "state_set",
        lua.create_function(move |lua, (key, value): (String, LuaValue)| {
            s.set(&key, lua_value_to_json(lua, value)?)
                .map_err(LuaError::external)
        })?,
    )?;

    let s = state.clone();
    helpers.set(
        "state_delete",
        lua.create_function(move |_lua, key: String| s.delete(&key).map_err(LuaError::external))?,
    )?;

    let s = state;
    helpers.set(
        "state_clear",
        lua.create_function(move |_lua, ()| s.clear().map_err(LuaError::external))?,
    )?;

    Ok(())
}

fn register_log_helpers(lua: &Lua, helpers: &LuaTable) -> LuaResult<()> {
    helpers.set(
        "log",
        lua.create_function(|lua, args: Variadic<LuaValue>| {
            println!("{}", render_log_args(lua, args)?);
            Ok(())
        })?,
    )?;

    helpers.set(
        "warn",
        lua.create_function(|lua, args: Variadic<LuaValue>| {
            let line = render_log_args(lua, args)?;
            if atty::is(atty::Stream::Stderr) {
                eprintln!("{}", line.yellow());
            } else {
                eprintln!("{}", line);
            }
            Ok(())
        })?,
    )?;

    helpers.set(
        "error",
        lua.create_function(|lua, args: Variadic<LuaValue>| {
            let line = render_log_args(lua, args)?;
            if atty::is(atty::Stream::Stderr) {
                eprintln!("{}", line.red());
            } else {
                eprintln!("{}", line);
            }
            Ok(())
        })?,
    )?;

    Ok(())
}

/// Join log arguments with spaces; tables render as compact JSON.
fn render_log_args(lua: &Lua, args: Variadic<LuaValue>) -> LuaResult<String> {
    let mut parts = Vec::with_capacity(args.len());
    for arg in args {
        let part = match arg {
            LuaValue::String(s) => s.to_str()?.to_string(),
            LuaValue::Nil => "nil".to_string(),
            other => encode_json(lua_value_to_json(lua, other)?)?,
        };
        parts.push(part);
    }
    Ok(parts.join(" "))
}

/// An empty table that converts back to a JSON array.
fn new_array(lua: &Lua) -> LuaResult<LuaTable> {
    match lua.to_value(&Vec::<Value>::new())? {
        LuaValue::Table(t) => Ok(t),
        _ => lua.create_table(),
    }
}

fn parse_json_text(text: &str) -> LuaResult<Value> {
    serde_json::from_str(text)
        .map_err(|e| LuaError::external(anyhow::anyhow!("invalid JSON: {}", e)))
}

fn encode_json(value: Value) -> LuaResult<String> {
    serde_json::to_string(&value)
        .map_err(|e| LuaError::external(anyhow::anyhow!("cannot encode JSON: {}", e)))
}

/// JSON equality where `1` and `1.0` compare equal.
fn json_loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Convert a JSON value into a Lua value.
///
/// Nested nulls become [`Lua::null`] so object keys and array slots are
/// kept; arrays get the array metatable.
pub(crate) fn json_value_to_lua(lua: &Lua, value: &Value) -> LuaResult<LuaValue> {
    if value.is_null() {
        return Ok(LuaValue::Nil);
    }
    lua.to_value(value)
}

/// Convert a Lua value to a JSON value.
///
/// Tables with a sequence part or the array metatable become arrays, other
/// tables become objects. Functions and userdata are dropped.
pub(crate) fn lua_value_to_json(lua: &Lua, value: LuaValue) -> LuaResult<Value> {
    let options = DeserializeOptions::new().deny_unsupported_types(false);
    lua.from_value_with(value, options)
}

/// Innermost human-readable message of a Lua error.
///
/// Helper failures arrive wrapped in one or more callback layers; the
/// caller only wants the message the helper or `error()` produced.
pub(crate) fn root_message(err: &LuaError) -> String {
    match err {
        LuaError::CallbackError { cause, .. } => root_message(cause),
        LuaError::WithContext { cause, .. } => root_message(cause),
        LuaError::RuntimeError(msg) => msg.clone(),
        LuaError::SyntaxError { message, .. } => message.clone(),
        LuaError::ExternalError(e) => e.to_string(),
        other => other.to_string(),
    }
}
