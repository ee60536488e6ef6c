//! Error taxonomy shared by every layer of the harness.
//!
//! Library code returns [`Error`]; the `cmdx` binary wraps it in
//! `anyhow` and maps it to an exit code. Each variant is one failure class
//! a caller may want to tell apart (bad configuration, a binding problem,
//! a broken script, an upstream HTTP failure, ...).

use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or incomplete configuration document.
    #[error("invalid configuration: {0}")]
    ConfigParse(String),

    /// Argument values could not be mapped onto the request template.
    #[error("binding error: {0}")]
    Binding(String),

    /// An `@path` argument value pointed at an unreadable file.
    #[error("cannot import file {}: {reason}", path.display())]
    FileImport { path: PathBuf, reason: String },

    /// A secret name or environment key that is not defined or not set.
    #[error("secret not found: {0}")]
    SecretNotFound(String),

    /// A defined secret whose strategy failed to produce a value.
    #[error("failed to resolve secret '{name}': {reason}")]
    SecretResolution { name: String, reason: String },

    /// The Lua source for a subcommand failed to load.
    #[error("failed to compile script for '{subcommand}': {message}")]
    ScriptCompile { subcommand: String, message: String },

    /// A script hook raised an error at runtime.
    #[error("error in {function}(): {message}")]
    ScriptExecution { function: String, message: String },

    /// DNS, connection or timeout failure before a response arrived.
    #[error("request failed: {0}")]
    RequestTransport(String),

    /// The upstream answered with a status outside the success set.
    #[error(
        "HTTP {status}: {reason}{}",
        body.as_deref().map(|b| format!("\nResponse body:\n{b}")).unwrap_or_default()
    )]
    HttpStatus {
        status: u16,
        reason: String,
        body: Option<String>,
    },

    /// A `json` response mode body that is not valid JSON.
    #[error("failed to parse JSON response: {0}")]
    ResponseDecode(String),

    /// Missing credential or upstream failure while embedding text.
    #[error("embedding provider error: {0}")]
    EmbeddingProvider(String),

    /// Persistence failure in the embedding store or the state file.
    #[error("store error: {0}")]
    Store(String),

    /// Administrative input rejected before touching any store.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Store(err.to_string())
    }
}

impl Error {
    /// Build an [`Error::HttpStatus`], pretty-printing the body when it is JSON.
    pub fn http_status(status: u16, reason: &str, body: &str) -> Self {
        let trimmed = body.trim();
        let body = if trimmed.is_empty() {
            None
        } else {
            Some(
                serde_json::from_str::<serde_json::Value>(trimmed)
                    .ok()
                    .and_then(|v| serde_json::to_string_pretty(&v).ok())
                    .unwrap_or_else(|| trimmed.to_string()),
            )
        };
        Error::HttpStatus {
            status,
            reason: reason.to_string(),
            body,
        }
    }
}
