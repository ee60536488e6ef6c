//! # Command Harness
//!
//! Declarative HTTP-backed CLI commands with Lua hooks, plus a semantic
//! index that maps natural-language queries to those commands.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────┐   ┌───────────┐   ┌──────────┐   ┌──────────────────┐
//! │ config JSON │──▶│  binder  │──▶│ prepare() │──▶│ executor │──▶│ process_response │
//! └──────┬──────┘   └──────────┘   └───────────┘   └──────────┘   └──────────────────┘
//!        │
//!        ▼
//! ┌─────────────┐   ┌──────────────────────────────┐
//! │   catalog   │──▶│ index (SQLite + embeddings)  │◀── query text
//! └─────────────┘   └──────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | JSON catalog parsing and validation |
//! | [`models`] | Request descriptors, index records |
//! | [`binder`] | Argument values → request descriptor |
//! | [`lua_runtime`] | Sandboxed Lua VM and the helper table |
//! | [`script`] | Compiled `prepare` / `process_response` units |
//! | [`executor`] | Single-attempt HTTP dispatch |
//! | [`runtime`] | End-to-end command execution |
//! | [`embedding`] | Embedding providers and vector helpers |
//! | [`index`] | Persistent embedding store |
//! | [`catalog`] | Config → index records |
//! | [`dynamic_cli`] | Config-driven clap parsing |

pub mod binder;
pub mod catalog;
pub mod config;
pub mod db;
pub mod describe;
pub mod dynamic_cli;
pub mod embedding;
pub mod error;
pub mod executor;
pub mod index;
pub mod index_cmd;
pub mod lua_runtime;
pub mod migrate;
pub mod models;
pub mod runtime;
pub mod script;
pub mod secrets;
pub mod state;
pub mod state_cmd;

pub use error::{Error, Result};
