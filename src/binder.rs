//! Argument binding: supplied values → [`RequestDescriptor`].
//!
//! Binding starts from the subcommand's request templates and routes each
//! supplied (or defaulted) argument value into headers, query parameters,
//! URL placeholders or the body. String values starting with `@` are
//! replaced with the contents of the named file before type coercion.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::{ArgumentDefinition, BodyMode, Location, SubcommandDefinition, ValueType};
use crate::error::{Error, Result};
use crate::models::{value_to_plain_string, RequestBody, RequestDescriptor};

/// Bind argument values to a subcommand's request definition.
///
/// `values` is keyed by argument name. Missing optional arguments without
/// a default are left out of the request entirely.
pub fn bind(
    subcommand: &SubcommandDefinition,
    values: &BTreeMap<String, Value>,
) -> Result<RequestDescriptor> {
    let request = &subcommand.request;
    let mut headers = request.headers.clone();
    let mut params: BTreeMap<String, Value> = request
        .query
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let mut body: Map<String, Value> = request.body.template.clone();
    let mut path_params: BTreeMap<String, String> = BTreeMap::new();

    for arg in &subcommand.arguments {
        let supplied = values.get(&arg.name).filter(|v| !v.is_null());
        let raw = match (supplied, &arg.default) {
            (Some(v), _) => v.clone(),
            (None, Some(default)) if !default.is_null() => default.clone(),
            _ => {
                if arg.required {
                    return Err(Error::Binding(format!(
                        "missing required argument '{}'",
                        arg.name
                    )));
                }
                continue;
            }
        };

        let imported = import_file_value(raw)?;
        let value = coerce(arg, imported)?;
        let key = arg.target_key().to_string();

        match arg.location {
            Location::Header => {
                headers.insert(key, value_to_plain_string(&value));
            }
            Location::Query => {
                params.insert(key, value);
            }
            Location::Path => {
                path_params.insert(key, value_to_plain_string(&value));
            }
            Location::Json => {
                body.insert(key, value);
            }
        }
    }

    let url = format_url(&request.url, &path_params)?;

    let body = if body.is_empty() {
        RequestBody::None
    } else {
        match request.body.mode {
            BodyMode::Json => RequestBody::Json(Value::Object(body)),
            BodyMode::Raw => RequestBody::Raw(Value::Object(body)),
        }
    };

    Ok(RequestDescriptor {
        method: request.method.to_uppercase(),
        url,
        headers,
        params,
        body,
        timeout: request.timeout,
    })
}

/// Replace an `@path` string with the file's contents.
fn import_file_value(value: Value) -> Result<Value> {
    let Value::String(s) = &value else {
        return Ok(value);
    };
    let Some(rest) = s.strip_prefix('@') else {
        return Ok(value);
    };

    let path = resolve_import_path(rest)?;
    if !path.exists() {
        return Err(Error::FileImport {
            path,
            reason: "file not found".to_string(),
        });
    }
    let text = std::fs::read_to_string(&path).map_err(|e| Error::FileImport {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    Ok(Value::String(text))
}

fn resolve_import_path(raw: &str) -> Result<PathBuf> {
    let path = Path::new(raw);
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|e| Error::FileImport {
        path: path.to_path_buf(),
        reason: format!("cannot determine working directory: {}", e),
    })?;
    Ok(cwd.join(path))
}

/// Convert a value to the argument's declared type.
fn coerce(arg: &ArgumentDefinition, value: Value) -> Result<Value> {
    let fail = |detail: String| {
        Error::Binding(format!(
            "argument '{}' expects {}: {}",
            arg.name,
            arg.value_type.as_str(),
            detail
        ))
    };

    match (arg.value_type, value) {
        (ValueType::Json, Value::String(s)) => {
            serde_json::from_str(&s).map_err(|e| fail(format!("invalid JSON ({})", e)))
        }
        (ValueType::Json, other) => Ok(other),

        (ValueType::Int, Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| fail(format!("'{}' is not an integer", s))),
        (ValueType::Int, v @ Value::Number(_)) if v.is_i64() || v.is_u64() => Ok(v),
        (ValueType::Int, other) => Err(fail(format!("got {}", other))),

        (ValueType::Float, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| fail(format!("'{}' is not a number", s))),
        (ValueType::Float, v @ Value::Number(_)) => Ok(v),
        (ValueType::Float, other) => Err(fail(format!("got {}", other))),

        (ValueType::Bool, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Value::Bool(true)),
            "false" | "0" | "no" | "off" => Ok(Value::Bool(false)),
            _ => Err(fail(format!("'{}' is not a boolean", s))),
        },
        (ValueType::Bool, v @ Value::Bool(_)) => Ok(v),
        (ValueType::Bool, other) => Err(fail(format!("got {}", other))),

        (ValueType::Str, v) => Ok(v),
    }
}

/// Substitute `{name}` placeholders. `{{` and `}}` are literal braces.
pub fn format_url(template: &str, params: &BTreeMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for n in chars.by_ref() {
                    if n == '}' {
                        closed = true;
                        break;
                    }
                    name.push(n);
                }
                if !closed {
                    return Err(Error::Binding(format!(
                        "unterminated placeholder in URL template '{}'",
                        template
                    )));
                }
                let value = params.get(&name).ok_or_else(|| {
                    Error::Binding(format!(
                        "URL placeholder '{{{}}}' has no value in '{}'",
                        name, template
                    ))
                })?;
                out.push_str(value);
            }
            other => out.push(other),
        }
    }

    Ok(out)
}
