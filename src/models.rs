//! Core data models shared by the execution engine and the command index.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Body of an outgoing request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RequestBody {
    None,
    /// Sent as `application/json`.
    Json(Value),
    /// Strings are sent verbatim; objects as form fields.
    Raw(Value),
}

/// A fully bound HTTP call, ready for `prepare` and dispatch.
///
/// Maps are ordered so that binding the same values twice serializes to
/// identical bytes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestDescriptor {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub params: BTreeMap<String, Value>,
    pub body: RequestBody,
    /// Seconds; `None` defers to the global `http_timeout`.
    pub timeout: Option<f64>,
}

impl RequestDescriptor {
    /// The shape scripts see: `{method, url, headers, params, json, data, timeout}`.
    pub fn to_script_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("method".into(), Value::String(self.method.clone()));
        map.insert("url".into(), Value::String(self.url.clone()));
        map.insert(
            "headers".into(),
            Value::Object(
                self.headers
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            ),
        );
        map.insert(
            "params".into(),
            Value::Object(
                self.params
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
        );
        // Absent fields are left out so scripts see them as `nil`.
        match &self.body {
            RequestBody::None => {}
            RequestBody::Json(v) => {
                map.insert("json".into(), v.clone());
            }
            RequestBody::Raw(v) => {
                map.insert("data".into(), v.clone());
            }
        }
        if let Some(t) = self.timeout.and_then(serde_json::Number::from_f64) {
            map.insert("timeout".into(), Value::Number(t));
        }
        Value::Object(map)
    }

    /// Apply a script's returned table on top of this descriptor.
    ///
    /// Fields the script left out keep their bound values. A script that
    /// sets `json` wins over `data`.
    pub fn merged_with_script_value(&self, value: &Value) -> RequestDescriptor {
        let Some(obj) = value.as_object() else {
            return self.clone();
        };
        let mut out = self.clone();

        if let Some(m) = obj.get("method").and_then(Value::as_str) {
            out.method = m.to_string();
        }
        if let Some(u) = obj.get("url").and_then(Value::as_str) {
            out.url = u.to_string();
        }
        if let Some(h) = obj.get("headers").and_then(Value::as_object) {
            out.headers = h
                .iter()
                .map(|(k, v)| (k.clone(), value_to_plain_string(v)))
                .collect();
        }
        if let Some(p) = obj.get("params").and_then(Value::as_object) {
            out.params = p.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        }

        let json = obj.get("json").filter(|v| !v.is_null());
        let data = obj.get("data").filter(|v| !v.is_null());
        if obj.contains_key("json") || obj.contains_key("data") {
            out.body = match (json, data) {
                (Some(j), _) => RequestBody::Json(j.clone()),
                (None, Some(d)) => RequestBody::Raw(d.clone()),
                (None, None) => RequestBody::None,
            };
        }
        if let Some(t) = obj.get("timeout").and_then(Value::as_f64) {
            out.timeout = Some(t);
        }
        out
    }
}

/// Render a JSON value the way it appears in a header, query string or URL.
pub fn value_to_plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// One indexed subcommand.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbeddingRecord {
    /// `"<command>.<subcommand>"`.
    pub section_id: String,
    pub command: String,
    pub subcommand: String,
    pub description: String,
    pub schema: Value,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub description_hash: Option<String>,
}

impl EmbeddingRecord {
    pub fn new(command: &str, subcommand: &str, description: String, schema: Value) -> Self {
        Self {
            section_id: section_id(command, subcommand),
            command: command.to_string(),
            subcommand: subcommand.to_string(),
            description,
            schema,
            embedding: Vec::new(),
            description_hash: None,
        }
    }
}

pub fn section_id(command: &str, subcommand: &str) -> String {
    format!("{}.{}", command, subcommand)
}

/// Operator-curated exact query → command mapping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidatedQuery {
    pub id: i64,
    pub query_text: String,
    pub command: String,
    pub subcommand: String,
    pub confidence: f64,
    /// RFC 3339 timestamp of the last write.
    pub created_at: String,
}

/// A ranked index result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub record: EmbeddingRecord,
    pub score: f64,
    /// `true` when the hit came from a validated query.
    pub validated: bool,
}
