//! Command catalog configuration.
//!
//! The catalog is a single JSON document describing every HTTP-backed
//! command, the secrets its scripts may ask for, and where the semantic
//! index lives. [`load_config`] parses and validates it; the resulting
//! [`Config`] is read-only for the rest of the process. Reloading means
//! calling [`load_config`] again and swapping the whole tree.
//!
//! ```json
//! {
//!   "http_timeout": 10,
//!   "secrets": { "api_key": { "type": "env", "env": "MOCK_API_KEY" } },
//!   "commands": [{
//!     "name": "mock",
//!     "help": "Mock service",
//!     "subcommands": [{
//!       "name": "call",
//!       "help": "Send a payload",
//!       "arguments": [
//!         { "name": "payload", "type": "json", "required": true, "location": "json" }
//!       ],
//!       "request": { "method": "POST", "url": "http://localhost:8080/call" }
//!     }]
//!   }],
//!   "index": { "embedding_model": "text-embedding-3-small", "persist_path": "index.sqlite" }
//! }
//! ```

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Lua source used when a subcommand has no `prepare_code`.
pub const DEFAULT_PREPARE_CODE: &str = "function prepare(request, helpers)\n  return request\nend";

/// Lua source used when a subcommand has no `response_code`.
pub const DEFAULT_RESPONSE_CODE: &str =
    "function process_response(response, helpers)\n  return response\nend";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Global request timeout in seconds, used when neither the script nor
    /// the request definition sets one.
    #[serde(default)]
    pub http_timeout: Option<f64>,
    #[serde(default)]
    pub secrets: BTreeMap<String, SecretDefinition>,
    #[serde(default)]
    pub commands: Vec<CommandDefinition>,
    #[serde(default, alias = "mcp")]
    pub index: IndexSettings,
    /// File backing the script state store.
    #[serde(default)]
    pub state_path: Option<PathBuf>,
    /// Directory of the loaded document; relative paths resolve against it.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CommandDefinition {
    pub name: String,
    #[serde(default)]
    pub help: String,
    #[serde(default)]
    pub subcommands: Vec<SubcommandDefinition>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SubcommandDefinition {
    pub name: String,
    #[serde(default)]
    pub help: String,
    #[serde(default)]
    pub arguments: Vec<ArgumentDefinition>,
    #[serde(default = "default_prepare_code")]
    pub prepare_code: String,
    #[serde(default = "default_response_code")]
    pub response_code: String,
    pub request: RequestDefinition,
}

fn default_prepare_code() -> String {
    DEFAULT_PREPARE_CODE.to_string()
}
fn default_response_code() -> String {
    DEFAULT_RESPONSE_CODE.to_string()
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    /// Named `--flag` option.
    #[default]
    Option,
    /// Positional argument.
    Argument,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    #[default]
    #[serde(alias = "string")]
    Str,
    Int,
    Float,
    Bool,
    Json,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Str => "str",
            ValueType::Int => "int",
            ValueType::Float => "float",
            ValueType::Bool => "bool",
            ValueType::Json => "json",
        }
    }
}

/// Where a bound argument value ends up in the outgoing request.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    #[default]
    #[serde(alias = "body")]
    Json,
    Query,
    Path,
    Header,
}

impl Location {
    pub fn as_str(&self) -> &'static str {
        match self {
            Location::Json => "json",
            Location::Query => "query",
            Location::Path => "path",
            Location::Header => "header",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArgumentDefinition {
    pub name: String,
    #[serde(default)]
    pub help: String,
    #[serde(default)]
    pub param_type: ParamKind,
    /// Explicit long flag, e.g. `--bucket-name`.
    #[serde(default)]
    pub cli_name: Option<String>,
    /// Extra flags such as `-b`.
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default, rename = "type")]
    pub value_type: ValueType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub location: Location,
    /// Key used at the target location; defaults to `name`.
    #[serde(default)]
    pub target: Option<String>,
}

impl ArgumentDefinition {
    pub fn target_key(&self) -> &str {
        self.target.as_deref().unwrap_or(&self.name)
    }

    /// The long flag shown on the command line for an option.
    pub fn flag_name(&self) -> String {
        match &self.cli_name {
            Some(name) => name.clone(),
            None => format!("--{}", self.name.replace('_', "-")),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BodyMode {
    #[default]
    Json,
    Raw,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BodyDefinition {
    #[serde(default)]
    pub mode: BodyMode,
    #[serde(default)]
    pub template: Map<String, Value>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    #[default]
    Json,
    Text,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ResponseDefinition {
    #[serde(default)]
    pub mode: ResponseMode,
    /// Accepted status codes; empty means any 2xx.
    #[serde(default)]
    pub success_codes: Vec<u16>,
}

impl ResponseDefinition {
    pub fn is_success(&self, status: u16) -> bool {
        if self.success_codes.is_empty() {
            (200..300).contains(&status)
        } else {
            self.success_codes.contains(&status)
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RequestDefinition {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: Map<String, Value>,
    #[serde(default)]
    pub body: BodyDefinition,
    #[serde(default)]
    pub response: ResponseDefinition,
    #[serde(default)]
    pub timeout: Option<f64>,
}

/// How a named secret is resolved at script run time.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SecretDefinition {
    /// Read an environment variable.
    Env { env: String },
    /// Literal value stored in the config.
    Value { value: String },
    /// Contents of a file, trimmed.
    File {
        path: PathBuf,
        #[serde(default = "default_encoding")]
        encoding: String,
    },
    /// Stdout of a shell command, trimmed.
    Command { value: String },
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Remote provider when the credential is present, hash otherwise.
    #[default]
    Auto,
    Openai,
    Hash,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexSettings {
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_persist_path")]
    pub persist_path: PathBuf,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default = "default_collection_name")]
    pub collection_name: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Caller-side threshold below which a hit is not acted on.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default = "default_index_timeout")]
    pub timeout: f64,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            embedding_model: default_embedding_model(),
            persist_path: default_persist_path(),
            api_key_env: default_api_key_env(),
            api_base: None,
            collection_name: default_collection_name(),
            top_k: default_top_k(),
            min_confidence: default_min_confidence(),
            provider: ProviderKind::Auto,
            timeout: default_index_timeout(),
        }
    }
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_persist_path() -> PathBuf {
    PathBuf::from("embeddings.sqlite")
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_collection_name() -> String {
    "command_descriptions".to_string()
}
fn default_top_k() -> usize {
    3
}
fn default_min_confidence() -> f64 {
    0.4
}
fn default_index_timeout() -> f64 {
    15.0
}

impl Config {
    /// Look up a subcommand by command and subcommand name.
    pub fn find_subcommand(
        &self,
        command: &str,
        subcommand: &str,
    ) -> Option<(&CommandDefinition, &SubcommandDefinition)> {
        let cmd = self.commands.iter().find(|c| c.name == command)?;
        let sub = cmd.subcommands.iter().find(|s| s.name == subcommand)?;
        Some((cmd, sub))
    }

    /// Absolute location of the embedding store.
    pub fn index_path(&self) -> PathBuf {
        resolve_relative(&self.base_dir, &self.index.persist_path)
    }

    /// Absolute location of the script state file.
    pub fn state_file(&self) -> PathBuf {
        match &self.state_path {
            Some(p) => resolve_relative(&self.base_dir, p),
            None => self.base_dir.join("state.json"),
        }
    }
}

fn resolve_relative(base: &Path, path: &Path) -> PathBuf {
    let expanded = expand_home(path);
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs_next::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

/// Read, parse and validate a configuration document.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::ConfigParse(format!(
            "failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;

    let mut config = parse_config(&content)?;
    config.base_dir = path
        .parent()
        .map(|p| {
            if p.as_os_str().is_empty() {
                PathBuf::from(".")
            } else {
                p.to_path_buf()
            }
        })
        .unwrap_or_else(|| PathBuf::from("."));
    Ok(config)
}

/// Parse and validate a configuration document from a string.
///
/// Relative paths resolve against the current directory; [`load_config`]
/// rebases them onto the file's directory.
pub fn parse_config(content: &str) -> Result<Config> {
    let mut config: Config = serde_json::from_str(content)
        .map_err(|e| Error::ConfigParse(format!("failed to parse config: {}", e)))?;
    config.base_dir = PathBuf::from(".");
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let mut command_names = HashSet::new();
    for cmd in &config.commands {
        if cmd.name.trim().is_empty() {
            return Err(Error::ConfigParse("command name must not be empty".into()));
        }
        if !command_names.insert(cmd.name.as_str()) {
            return Err(Error::ConfigParse(format!(
                "duplicate command name '{}'",
                cmd.name
            )));
        }

        let mut sub_names = HashSet::new();
        for sub in &cmd.subcommands {
            if !sub_names.insert(sub.name.as_str()) {
                return Err(Error::ConfigParse(format!(
                    "duplicate subcommand '{}' in command '{}'",
                    sub.name, cmd.name
                )));
            }
            let method = &sub.request.method;
            if method.is_empty() || !method.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(Error::ConfigParse(format!(
                    "{}.{}: invalid HTTP method '{}'",
                    cmd.name, sub.name, method
                )));
            }
            if sub.request.timeout.is_some_and(|t| t <= 0.0) {
                return Err(Error::ConfigParse(format!(
                    "{}.{}: request.timeout must be > 0",
                    cmd.name, sub.name
                )));
            }
            let mut arg_names = HashSet::new();
            for arg in &sub.arguments {
                if !arg_names.insert(arg.name.as_str()) {
                    return Err(Error::ConfigParse(format!(
                        "{}.{}: duplicate argument '{}'",
                        cmd.name, sub.name, arg.name
                    )));
                }
            }
        }
    }

    if config.http_timeout.is_some_and(|t| t <= 0.0) {
        return Err(Error::ConfigParse("http_timeout must be > 0".into()));
    }
    if config.index.top_k == 0 {
        return Err(Error::ConfigParse("index.top_k must be >= 1".into()));
    }
    if !(0.0..=1.0).contains(&config.index.min_confidence) {
        return Err(Error::ConfigParse(
            "index.min_confidence must be in [0.0, 1.0]".into(),
        ));
    }

    Ok(())
}

/// Locate a configuration file when `--config` was not given.
///
/// Checks `CMDX_CONFIG`, then `./cli_config.json`, `./config/cli_config.json`
/// and `~/.config/cmdx/config.json`.
pub fn find_config_file() -> Option<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(p) = std::env::var("CMDX_CONFIG") {
        if !p.is_empty() {
            candidates.push(PathBuf::from(p));
        }
    }
    candidates.push(PathBuf::from("cli_config.json"));
    candidates.push(PathBuf::from("config").join("cli_config.json"));
    if let Some(home) = dirs_next::home_dir() {
        candidates.push(home.join(".config").join("cmdx").join("config.json"));
    }
    candidates.into_iter().find(|p| p.is_file())
}
