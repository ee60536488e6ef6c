//! Config → index records, and the views built on top of them.

use serde_json::{json, Value};

use crate::config::{BodyMode, CommandDefinition, Config, ResponseMode, SubcommandDefinition};
use crate::models::{EmbeddingRecord, SearchHit};

/// One record per configured subcommand, in configuration order.
pub fn build_records(config: &Config) -> Vec<EmbeddingRecord> {
    let mut records = Vec::new();
    for command in &config.commands {
        for sub in &command.subcommands {
            let description = describe(sub);
            let schema = serialize_schema(command, sub, &description);
            records.push(EmbeddingRecord::new(
                &command.name,
                &sub.name,
                description,
                schema,
            ));
        }
    }
    records
}

/// Help text followed by the `--` comment lines of `prepare_code`.
pub fn describe(sub: &SubcommandDefinition) -> String {
    let comments: Vec<&str> = sub
        .prepare_code
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("--") && !l.starts_with("--[[") && !l.starts_with("--]]"))
        .map(|l| l.trim_start_matches('-').trim())
        .filter(|l| !l.is_empty())
        .collect();

    let mut description = sub.help.trim().to_string();
    if !comments.is_empty() {
        if !description.is_empty() {
            description.push(' ');
        }
        description.push_str(&comments.join(" "));
    }
    description
}

/// Argument and request metadata shown next to index hits.
pub fn serialize_schema(
    command: &CommandDefinition,
    sub: &SubcommandDefinition,
    description: &str,
) -> Value {
    let arguments: Vec<Value> = sub
        .arguments
        .iter()
        .map(|arg| {
            json!({
                "name": arg.name,
                "help": arg.help,
                "type": arg.value_type.as_str(),
                "required": arg.required,
                "location": arg.location.as_str(),
                "target": arg.target,
            })
        })
        .collect();

    let request = &sub.request;
    let description = if description.is_empty() {
        sub.help.as_str()
    } else {
        description
    };
    let body_mode = match request.body.mode {
        BodyMode::Json => "json",
        BodyMode::Raw => "raw",
    };
    let response_mode = match request.response.mode {
        ResponseMode::Json => "json",
        ResponseMode::Text => "text",
    };
    json!({
        "command": command.name,
        "subcommand": sub.name,
        "description": description,
        "arguments": arguments,
        "request": {
            "method": request.method,
            "url": request.url,
            "headers": request.headers,
            "query": request.query,
            "body": {
                "mode": body_mode,
                "template": request.body.template,
            },
            "response": {
                "mode": response_mode,
                "success_codes": request.response.success_codes,
            },
        },
    })
}

/// Commands with their subcommand names and help, for listings.
pub fn command_summaries(config: &Config) -> Value {
    Value::Array(
        config
            .commands
            .iter()
            .map(|c| {
                let subcommands: Vec<Value> = c
                    .subcommands
                    .iter()
                    .map(|s| json!({ "name": s.name, "help": s.help }))
                    .collect();
                json!({
                    "name": c.name,
                    "help": c.help,
                    "subcommands": subcommands,
                })
            })
            .collect(),
    )
}

/// Hits at or above `threshold`. Validated hits always pass.
pub fn confident_hits(hits: &[SearchHit], threshold: f64) -> Vec<SearchHit> {
    hits.iter()
        .filter(|h| h.validated || h.score >= threshold)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    fn config() -> Config {
        parse_config(
            r#"{ "commands": [
                { "name": "storage", "help": "Object storage", "subcommands": [
                    { "name": "list", "help": "List buckets",
                      "prepare_code": "-- paginates through all pages\nfunction prepare(r, h)\n  -- adds auth\n  return r\nend",
                      "arguments": [{ "name": "prefix", "location": "query" }],
                      "request": { "method": "GET", "url": "http://h/b" } },
                    { "name": "delete", "help": "Delete a bucket",
                      "request": { "method": "DELETE", "url": "http://h/b/{name}" } }
                ] },
                { "name": "users", "subcommands": [
                    { "name": "get", "request": { "method": "GET", "url": "http://h/u" } }
                ] }
            ] }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_build_records_in_config_order() {
        let records = build_records(&config());
        let ids: Vec<&str> = records.iter().map(|r| r.section_id.as_str()).collect();
        assert_eq!(ids, vec!["storage.list", "storage.delete", "users.get"]);
    }

    #[test]
    fn test_description_includes_script_comments() {
        let records = build_records(&config());
        assert_eq!(
            records[0].description,
            "List buckets paginates through all pages adds auth"
        );
        assert_eq!(records[1].description, "Delete a bucket");
        assert_eq!(records[2].description, "");
    }

    #[test]
    fn test_schema_shape() {
        let records = build_records(&config());
        let schema = &records[0].schema;
        assert_eq!(schema["command"], "storage");
        assert_eq!(schema["arguments"][0]["location"], "query");
        assert_eq!(schema["arguments"][0]["type"], "str");
        assert_eq!(schema["request"]["method"], "GET");
        assert_eq!(schema["request"]["body"]["mode"], "json");
    }

    #[test]
    fn test_confident_hits() {
        let records = build_records(&config());
        let hits = vec![
            SearchHit {
                record: records[0].clone(),
                score: 0.9,
                validated: false,
            },
            SearchHit {
                record: records[1].clone(),
                score: 0.2,
                validated: false,
            },
            SearchHit {
                record: records[2].clone(),
                score: 0.1,
                validated: true,
            },
        ];
        let kept: Vec<String> = confident_hits(&hits, 0.4)
            .into_iter()
            .map(|h| h.record.section_id)
            .collect();
        assert_eq!(kept, vec!["storage.list", "users.get"]);
    }
}
