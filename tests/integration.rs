use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn cmdx_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_cmdx"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_content = r#"{
  "http_timeout": 5,
  "secrets": { "token": { "type": "value", "value": "abc123" } },
  "commands": [
    {
      "name": "storage",
      "help": "Object storage",
      "subcommands": [
        {
          "name": "list",
          "help": "List every bucket in the account",
          "arguments": [
            { "name": "prefix", "help": "Only buckets starting with this" },
            { "name": "page_size", "type": "int", "location": "query", "default": 50 }
          ],
          "prepare_code": "function prepare(request, helpers)\n  helpers.state_set('last_page_size', request.params.page_size)\n  return nil\nend",
          "response_code": "function process_response(response, helpers)\n  return 'offline: ' .. tostring(helpers.state_get('last_page_size'))\nend",
          "request": { "method": "GET", "url": "http://127.0.0.1:9/buckets" }
        },
        {
          "name": "get",
          "help": "Download an object",
          "arguments": [
            { "name": "bucket", "param_type": "argument", "location": "path", "required": true },
            { "name": "key", "param_type": "argument", "location": "path", "required": true }
          ],
          "prepare_code": "-- Echo the auth token for testing\nfunction prepare(request, helpers)\n  return nil\nend",
          "response_code": "function process_response(response, helpers)\n  return { token = helpers.secret('token') }\nend",
          "request": { "method": "GET", "url": "http://127.0.0.1:9/b/{bucket}/o/{key}" }
        }
      ]
    },
    {
      "name": "users",
      "help": "User accounts",
      "subcommands": [
        {
          "name": "show",
          "help": "Show a user profile",
          "arguments": [{ "name": "id", "param_type": "argument", "location": "path", "required": true }],
          "prepare_code": "function prepare(request, helpers)\n  return nil\nend",
          "request": { "method": "GET", "url": "http://127.0.0.1:9/users/{id}" }
        }
      ]
    }
  ],
  "index": { "provider": "hash", "persist_path": "data/index.sqlite" }
}"#;

    let config_path = root.join("cli_config.json");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_cmdx(config_path: &Path, args: &[&str]) -> (String, String, i32) {
    let binary = cmdx_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path)
        .args(args)
        .env_remove("OPENAI_API_KEY")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run cmdx binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.code().unwrap_or(-1))
}

fn run_ok(config_path: &Path, args: &[&str]) -> String {
    let (stdout, stderr, code) = run_cmdx(config_path, args);
    assert_eq!(code, 0, "cmdx {:?} failed: {}", args, stderr);
    stdout
}

#[test]
fn test_missing_config_exits_with_usage_code() {
    let tmp = TempDir::new().unwrap();
    let output = Command::new(cmdx_binary())
        .args(["cmd", "list"])
        .current_dir(tmp.path())
        .env_remove("CMDX_CONFIG")
        .env("HOME", tmp.path())
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no configuration file found"), "{}", stderr);

    let (_, stderr, code) = run_cmdx(&tmp.path().join("nope.json"), &["cmd", "list"]);
    assert_eq!(code, 2);
    assert!(stderr.contains("not found"));
}

#[test]
fn test_config_from_env_var() {
    let (tmp, config) = setup_test_env();
    let output = Command::new(cmdx_binary())
        .args(["cmd", "list"])
        .current_dir(tmp.path().parent().unwrap())
        .env("CMDX_CONFIG", &config)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));
}

#[test]
fn test_state_commands() {
    let (tmp, config) = setup_test_env();

    run_ok(&config, &["state", "set", "count", "3"]);
    run_ok(&config, &["state", "set", "name", "ada"]);
    assert_eq!(run_ok(&config, &["state", "get", "count"]).trim(), "3");
    assert_eq!(run_ok(&config, &["state", "get", "name"]).trim(), "ada");

    let keys = run_ok(&config, &["state", "keys"]);
    assert_eq!(keys.lines().collect::<Vec<_>>(), vec!["count", "name"]);

    let shown: Value = serde_json::from_str(&run_ok(&config, &["state", "show"])).unwrap();
    assert_eq!(shown["count"], 3);
    assert!(tmp.path().join("state.json").exists());

    run_ok(&config, &["state", "delete", "count"]);
    let (_, stderr, code) = run_cmdx(&config, &["state", "get", "count"]);
    assert_eq!(code, 1);
    assert!(stderr.contains("not found"));
    let (_, _, code) = run_cmdx(&config, &["state", "delete", "count"]);
    assert_eq!(code, 1);

    run_ok(&config, &["state", "clear"]);
    assert!(run_ok(&config, &["state", "keys"]).trim().is_empty());
}

#[test]
fn test_cmd_list_and_desc() {
    let (_tmp, config) = setup_test_env();

    let listed: Value = serde_json::from_str(&run_ok(&config, &["cmd", "list"])).unwrap();
    let text = listed.to_string();
    assert!(text.contains("storage"));
    assert!(text.contains("users"));

    let desc = run_ok(&config, &["cmd", "desc", "storage.get"]);
    assert!(desc.contains("Download an object"));
    assert!(desc.contains("Echo the auth token for testing"));
    assert!(desc.contains("GET http://127.0.0.1:9/b/{bucket}/o/{key}"));
    assert!(desc.contains("<bucket>"));

    let schema: Value =
        serde_json::from_str(&run_ok(&config, &["cmd", "desc", "storage", "list", "--json"]))
            .unwrap();
    assert!(schema.to_string().contains("page_size"));

    let (_, _, code) = run_cmdx(&config, &["cmd", "desc", "storage.delete"]);
    assert_eq!(code, 1);
}

#[test]
fn test_configured_command_runs_hooks() {
    let (_tmp, config) = setup_test_env();

    let out = run_ok(&config, &["storage", "list", "--page-size", "10"]);
    assert_eq!(out.trim(), "offline: 10");

    let out = run_ok(&config, &["storage", "list"]);
    assert_eq!(out.trim(), "offline: 50");
    assert_eq!(
        run_ok(&config, &["state", "get", "last_page_size"]).trim(),
        "50"
    );

    let out: Value =
        serde_json::from_str(&run_ok(&config, &["storage", "get", "photos", "cat.png"])).unwrap();
    assert_eq!(out["token"], "abc123");

    // process_response returns nil for users.show, so nothing is printed.
    assert!(run_ok(&config, &["users", "show", "7"]).trim().is_empty());
}

#[test]
fn test_configured_command_errors() {
    let (_tmp, config) = setup_test_env();

    let (_, stderr, code) = run_cmdx(&config, &["storage", "list", "--page-size", "ten"]);
    assert_eq!(code, 1, "{}", stderr);
    assert!(stderr.contains("page_size"), "{}", stderr);

    let (_, _, code) = run_cmdx(&config, &["storage", "get", "photos"]);
    assert_eq!(code, 2);

    let (_, _, code) = run_cmdx(&config, &["storage", "nope"]);
    assert_eq!(code, 2);
}

#[test]
fn test_index_workflow() {
    let (tmp, config) = setup_test_env();

    let out = run_ok(&config, &["index", "rebuild"]);
    assert!(out.contains("commands: 3"), "{}", out);
    assert!(out.contains("embedded: 3"));
    assert!(out.contains("model: hash-sha256"));
    assert!(tmp.path().join("data/index.sqlite").exists());

    let out = run_ok(&config, &["index", "rebuild"]);
    assert!(out.contains("embedded: 0"));
    assert!(out.contains("unchanged: 3"));

    let listed: Value = serde_json::from_str(&run_ok(&config, &["index", "list"])).unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 3);
    assert_eq!(listed[0]["section_id"], "storage.list");

    let hits: Value = serde_json::from_str(&run_ok(
        &config,
        &["index", "query", "show me a user", "--top-k", "2"],
    ))
    .unwrap();
    assert_eq!(hits.as_array().unwrap().len(), 2);

    let added: Value = serde_json::from_str(&run_ok(
        &config,
        &[
            "index", "validated", "add", "who is 7", "users", "show", "--confidence", "0.9",
        ],
    ))
    .unwrap();
    let id = added["id"].as_i64().unwrap();

    let hits: Value =
        serde_json::from_str(&run_ok(&config, &["index", "query", "who is 7"])).unwrap();
    let hits = hits.as_array().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["section_id"], "users.show");
    assert_eq!(hits[0]["score"], 0.9);
    assert_eq!(hits[0]["validated"], true);

    let listed: Value =
        serde_json::from_str(&run_ok(&config, &["index", "validated", "list"])).unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let (_, stderr, code) = run_cmdx(
        &config,
        &["index", "validated", "add", "x", "users", "delete"],
    );
    assert_eq!(code, 1);
    assert!(stderr.contains("unknown command"));

    run_ok(&config, &["index", "validated", "remove", &id.to_string()]);
    let (_, _, code) = run_cmdx(&config, &["index", "validated", "remove", &id.to_string()]);
    assert_eq!(code, 1);

    let out = run_ok(&config, &["index", "cache", "clear"]);
    assert!(out.contains("Cleared 1 cached query vector(s)."), "{}", out);
}

#[test]
fn test_index_maintenance_without_credential() {
    let (_tmp, config) = setup_test_env();
    let text = fs::read_to_string(&config).unwrap().replace(
        r#""provider": "hash""#,
        r#""provider": "openai", "api_key_env": "CMDX_TEST_MISSING_EMBEDDINGS_KEY""#,
    );
    fs::write(&config, text).unwrap();

    let listed: Value = serde_json::from_str(&run_ok(&config, &["index", "list"])).unwrap();
    assert!(listed.as_array().unwrap().is_empty());
    run_ok(&config, &["index", "validated", "list"]);
    run_ok(&config, &["index", "cache", "clear"]);

    let (_, stderr, code) = run_cmdx(&config, &["index", "rebuild"]);
    assert_eq!(code, 1);
    assert!(stderr.contains("CMDX_TEST_MISSING_EMBEDDINGS_KEY"), "{}", stderr);
}
