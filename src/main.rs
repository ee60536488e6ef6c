//! # Command Harness CLI (`cmdx`)
//!
//! Runs the HTTP commands declared in a JSON catalog and manages the
//! semantic index built from them.
//!
//! ## Usage
//!
//! ```bash
//! cmdx --config ./cli_config.json <command> <subcommand> [args...]
//! ```
//!
//! ## Built-in commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cmdx state show\|get\|set\|delete\|clear\|keys` | Inspect the script state store |
//! | `cmdx cmd list` | List configured commands |
//! | `cmdx cmd desc <command.sub>` | Show one subcommand's arguments and request |
//! | `cmdx index rebuild` | Embed the catalog into the index |
//! | `cmdx index query "<text>"` | Rank commands for a natural-language query |
//! | `cmdx index validated add\|list\|remove` | Manage exact-match overrides |
//! | `cmdx index cache clear` | Drop cached query vectors |
//!
//! Anything else is looked up in the catalog, e.g.
//! `cmdx storage list photos --page-size 10`.
//!
//! Exit codes: 0 on success, 1 on any command failure, 2 on usage errors
//! or when no configuration file can be found.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use command_harness::runtime::{render_output, CommandRuntime};
use command_harness::{config, describe, dynamic_cli, index_cmd, state_cmd};

/// Declarative HTTP commands with Lua hooks and a semantic command index.
#[derive(Parser)]
#[command(
    name = "cmdx",
    version,
    about = "Declarative HTTP commands with Lua hooks and a semantic command index",
    after_help = "Configured commands are invoked as `cmdx <command> <subcommand> [args...]`; \
    run `cmdx cmd list` to see them."
)]
struct Cli {
    /// Path to the JSON command catalog.
    ///
    /// Defaults to `$CMDX_CONFIG`, `./cli_config.json`,
    /// `./config/cli_config.json` or `~/.config/cmdx/config.json`,
    /// whichever exists first.
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and edit the state store shared by scripts.
    State {
        #[command(subcommand)]
        action: StateAction,
    },

    /// Inspect configured commands.
    Cmd {
        #[command(subcommand)]
        action: CmdAction,
    },

    /// Manage the semantic command index.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// A configured `<command> <subcommand> [args...]`.
    #[command(external_subcommand)]
    Run(Vec<String>),
}

#[derive(Subcommand)]
enum StateAction {
    /// Print the whole store as JSON.
    Show,
    /// Print one value.
    Get { key: String },
    /// Store a value (parsed as JSON when possible).
    Set { key: String, value: String },
    /// Remove a key.
    Delete { key: String },
    /// Remove every key.
    Clear,
    /// List keys, one per line.
    Keys,
}

#[derive(Subcommand)]
enum CmdAction {
    /// List commands and subcommands as JSON.
    List,
    /// Describe a subcommand: `storage.list` or `storage list`.
    Desc {
        target: String,
        subcommand: Option<String>,
        /// Print the schema as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum IndexAction {
    /// Embed every configured subcommand, reusing unchanged vectors.
    Rebuild,
    /// List indexed commands.
    List,
    /// Rank commands against a natural-language query.
    Query {
        text: String,
        /// Number of results (defaults to the configured `top_k`).
        #[arg(long)]
        top_k: Option<usize>,
    },
    /// Manage validated (exact-match) queries.
    Validated {
        #[command(subcommand)]
        action: ValidatedAction,
    },
    /// Manage the query vector cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum ValidatedAction {
    /// Map a query text to a command.
    Add {
        text: String,
        command: String,
        subcommand: String,
        #[arg(long, default_value_t = 1.0)]
        confidence: f64,
    },
    /// List validated queries.
    List,
    /// Remove a validated query by id.
    Remove { id: i64 },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Drop all cached query vectors.
    Clear,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("CMDX_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let config_path = match cli.config.clone().or_else(config::find_config_file) {
        Some(path) if path.is_file() => path,
        Some(path) => {
            eprintln!("Error: configuration file not found: {}", path.display());
            return ExitCode::from(2);
        }
        None => {
            eprintln!(
                "Error: no configuration file found; pass --config PATH or set CMDX_CONFIG"
            );
            return ExitCode::from(2);
        }
    };

    match run(cli.command, &config_path).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands, config_path: &Path) -> anyhow::Result<()> {
    let cfg = config::load_config(config_path)?;
    tracing::debug!(path = %config_path.display(), commands = cfg.commands.len(), "loaded config");

    match command {
        Commands::State { action } => match action {
            StateAction::Show => state_cmd::run_show(&cfg)?,
            StateAction::Get { key } => state_cmd::run_get(&cfg, &key)?,
            StateAction::Set { key, value } => state_cmd::run_set(&cfg, &key, &value)?,
            StateAction::Delete { key } => state_cmd::run_delete(&cfg, &key)?,
            StateAction::Clear => state_cmd::run_clear(&cfg)?,
            StateAction::Keys => state_cmd::run_keys(&cfg)?,
        },
        Commands::Cmd { action } => match action {
            CmdAction::List => describe::run_list(&cfg)?,
            CmdAction::Desc {
                target,
                subcommand,
                json,
            } => describe::run_desc(&cfg, &target, subcommand.as_deref(), json)?,
        },
        Commands::Index { action } => match action {
            IndexAction::Rebuild => index_cmd::run_rebuild(&cfg).await?,
            IndexAction::List => index_cmd::run_list(&cfg).await?,
            IndexAction::Query { text, top_k } => {
                index_cmd::run_query(&cfg, &text, top_k).await?
            }
            IndexAction::Validated { action } => match action {
                ValidatedAction::Add {
                    text,
                    command,
                    subcommand,
                    confidence,
                } => {
                    index_cmd::run_validated_add(&cfg, &text, &command, &subcommand, confidence)
                        .await?
                }
                ValidatedAction::List => index_cmd::run_validated_list(&cfg).await?,
                ValidatedAction::Remove { id } => {
                    index_cmd::run_validated_remove(&cfg, id).await?
                }
            },
            IndexAction::Cache { action } => match action {
                CacheAction::Clear => index_cmd::run_cache_clear(&cfg).await?,
            },
        },
        Commands::Run(args) => {
            let invocation = match dynamic_cli::parse_invocation(&cfg, &args) {
                Ok(inv) => inv,
                Err(e) => e.exit(),
            };
            let runtime = CommandRuntime::new(cfg)?;
            let output = runtime
                .run(&invocation.command, &invocation.subcommand, &invocation.values)
                .await?;
            if let Some(text) = render_output(&output) {
                println!("{}", text);
            }
        }
    }

    Ok(())
}
