//! # Space Harness CLI (`spx`)
//!
//! Builds multi-space vector indexes from CSV/JSON files and searches them,
//! either directly from the command line or through the tool surface
//! (MCP stdio, HTTP, or the chat front-end).
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `spx preview <path>` | Row count, columns, types, sample rows, detected roles |
//! | `spx create <path>` | Create (or recreate) an index from a file |
//! | `spx list` | List indexes |
//! | `spx query <index> "<text>"` | Search an index |
//! | `spx serve mcp` | MCP over stdio |
//! | `spx serve http` | HTTP tool API + MCP Streamable HTTP at `/mcp` |
//! | `spx framework start\|stop\|status` | Manage the framework server |
//! | `spx chat` | Terminal conversation with tool use |
//!
//! ## Examples
//!
//! ```bash
//! spx preview data/tickets.csv --rows 3
//! spx create data/tickets.csv --map body=text_similarity --map opened=recency --weight opened=0.6
//! spx query tickets "printer on fire" --limit 3 --weight body=2
//! ```
//!
//! Results are printed to stdout as JSON; logs go to stderr.

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use space_harness::backend::OutOfProcessBackend;
use space_harness::chat::{run_repl, ChatSession};
use space_harness::config::{self, Config};
use space_harness::error::RagError;
use space_harness::logging::init_logging;
use space_harness::mcp::{serve_stdio, McpBridge};
use space_harness::metadata::create_store;
use space_harness::models::{RoleSpec, SpaceWeights};
use space_harness::server::run_server;
use space_harness::service::{
    CreateIndexRequest, IndexService, QueryIndexRequest, DEFAULT_LIMIT, DEFAULT_PREVIEW_ROWS,
};
use space_harness::traits::{ToolContext, ToolRegistry};

const DEFAULT_CONFIG: &str = "./config/spx.toml";

/// Space Harness: multi-space vector indexes over tabular files.
#[derive(Parser)]
#[command(name = "spx", version, about)]
struct Cli {
    /// Path to configuration file (TOML). Defaults to `./config/spx.toml`
    /// when it exists, otherwise built-in defaults.
    #[arg(long, global = true, env = "SPX_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter (e.g. `debug`, `space_harness=trace`). Overrides RUST_LOG.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Disable colored log output.
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Preview a CSV or JSON file.
    Preview {
        path: String,

        /// Number of sample rows.
        #[arg(long, default_value_t = DEFAULT_PREVIEW_ROWS)]
        rows: usize,
    },

    /// Create an index from a file.
    ///
    /// Without `--map`, every column's role is detected.
    Create {
        path: String,

        /// Column role as `column=role` (`text_similarity`, `recency`,
        /// `number`, `category` or `auto`). Repeatable.
        #[arg(long = "map", value_parser = parse_role_pair)]
        mapping: Vec<(String, RoleSpec)>,

        /// Default weight as `column=weight`. Repeatable.
        #[arg(long = "weight", value_parser = parse_weight_pair)]
        weights: Vec<(String, f64)>,

        /// Replace the index if it already exists.
        #[arg(long)]
        recreate: bool,
    },

    /// List indexes.
    List,

    /// Search an index.
    Query {
        index: String,
        text: String,

        #[arg(long, default_value_t = DEFAULT_LIMIT)]
        limit: usize,

        /// Weight override as `column=weight`. Repeatable.
        #[arg(long = "weight", value_parser = parse_weight_pair)]
        weights: Vec<(String, f64)>,

        /// Category to match as `column=value`. Repeatable.
        #[arg(long = "category", value_parser = parse_key_val)]
        categories: Vec<(String, String)>,
    },

    /// Serve the tool surface.
    Serve {
        #[command(subcommand)]
        service: ServeService,
    },

    /// Manage the out-of-process framework server.
    Framework {
        #[command(subcommand)]
        action: FrameworkAction,
    },

    /// Chat with an assistant that can call the index tools.
    Chat,
}

#[derive(Subcommand)]
enum ServeService {
    /// MCP over stdin/stdout.
    Mcp,
    /// HTTP tool API and MCP Streamable HTTP at `/mcp`.
    Http {
        /// Overrides `[server].bind`.
        #[arg(long)]
        bind: Option<String>,
    },
}

#[derive(Subcommand)]
enum FrameworkAction {
    /// (Re)start the server with every recorded index and rebuild them.
    Start,
    /// Force-stop the server.
    Stop,
    /// Show URL, health and log location.
    Status,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].trim().to_string(), s[pos + 1..].trim().to_string()))
}

fn parse_role_pair(s: &str) -> Result<(String, RoleSpec), String> {
    let (column, role) = parse_key_val(s)?;
    Ok((column, role.parse()?))
}

fn parse_weight_pair(s: &str) -> Result<(String, f64), String> {
    let (column, weight) = parse_key_val(s)?;
    let w: f64 = weight
        .parse()
        .map_err(|_| format!("weight for '{}' is not a number: '{}'", column, weight))?;
    Ok((column, w))
}

fn resolve_config(explicit: Option<&Path>) -> anyhow::Result<Config> {
    match explicit {
        Some(path) => config::load_config(path),
        None if Path::new(DEFAULT_CONFIG).exists() => config::load_config(Path::new(DEFAULT_CONFIG)),
        None => Config::minimal().finalize(),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Structured errors go to stdout like results; the exit code signals failure.
fn report(result: Result<(), RagError>) -> anyhow::Result<ExitCode> {
    match result {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            tracing::error!(code = e.code(), error = %e, "command failed");
            print_json(&e.to_json())?;
            Ok(ExitCode::FAILURE)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref(), cli.no_color)?;

    let cfg = resolve_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Preview { path, rows } => {
            let service = IndexService::new(cfg);
            report(async {
                let preview = service.preview_file(&path, rows).await?;
                print_json(&preview).map_err(|e| RagError::Internal(e.to_string()))
            }
            .await)
        }
        Commands::Create {
            path,
            mapping,
            weights,
            recreate,
        } => {
            let service = IndexService::new(cfg);
            let request = CreateIndexRequest {
                path,
                column_mapping: mapping,
                weights: weights.into_iter().collect::<SpaceWeights>(),
                recreate,
            };
            report(async {
                let result = service.create_index(request).await?;
                print_json(&result).map_err(|e| RagError::Internal(e.to_string()))
            }
            .await)
        }
        Commands::List => {
            let service = IndexService::new(cfg);
            report(async {
                let listed = service.list_indexes().await?;
                print_json(&listed).map_err(|e| RagError::Internal(e.to_string()))
            }
            .await)
        }
        Commands::Query {
            index,
            text,
            limit,
            weights,
            categories,
        } => {
            let service = IndexService::new(cfg);
            let request = QueryIndexRequest {
                index_name: index,
                query_text: text,
                limit,
                weights: weights.into_iter().collect(),
                categories: categories.into_iter().collect(),
            };
            report(async {
                let hits = service.query_index(request).await?;
                print_json(&hits).map_err(|e| RagError::Internal(e.to_string()))
            }
            .await)
        }
        Commands::Serve { service } => {
            let bind = match &service {
                ServeService::Http { bind } => bind.clone().unwrap_or_else(|| cfg.server.bind.clone()),
                ServeService::Mcp => String::new(),
            };
            let ctx = ToolContext::new(Arc::new(IndexService::new(cfg)));
            let tools = Arc::new(ToolRegistry::with_builtins());
            match service {
                ServeService::Mcp => serve_stdio(McpBridge::new(tools, ctx)).await?,
                ServeService::Http { .. } => run_server(&bind, tools, ctx).await?,
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Framework { action } => {
            let backend = Arc::new(OutOfProcessBackend::new(&cfg));
            match action {
                FrameworkAction::Start => {
                    let store = create_store(&cfg);
                    let service = IndexService::with_parts(cfg, backend.clone(), store);
                    report(async {
                        let deployed = service.deploy_all(true).await?;
                        let status = backend.server().status().await;
                        print_json(&serde_json::json!({ "deployed": deployed, "server": status }))
                            .map_err(|e| RagError::Internal(e.to_string()))
                    }
                    .await)
                }
                FrameworkAction::Stop => report(async {
                    let stopped = backend.server().stop().await?;
                    print_json(&serde_json::json!({ "stopped": stopped }))
                        .map_err(|e| RagError::Internal(e.to_string()))
                }
                .await),
                FrameworkAction::Status => {
                    print_json(&backend.server().status().await)?;
                    Ok(ExitCode::SUCCESS)
                }
            }
        }
        Commands::Chat => {
            let chat_config = cfg.chat.clone();
            let ctx = ToolContext::new(Arc::new(IndexService::new(cfg)));
            let session = ChatSession::from_env(&chat_config, ToolRegistry::with_builtins(), ctx)?;
            run_repl(session).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
