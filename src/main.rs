//! # radquery CLI (`radq`)
//!
//! ```bash
//! radq --config ./config/radq.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `radq init` | Create the analytics store and its audit tables |
//! | `radq status` | Show which backends are available |
//! | `radq tools` | List tools with their parameter schemas |
//! | `radq call <tool> --params '<json>'` | Run one tool and print its JSON result |
//! | `radq serve` | Start the REST + MCP HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! radq call search_area --params '{"min_lat":35,"max_lat":36,"min_lon":139,"max_lon":140}'
//! DATABASE_URL=postgres://localhost/safecast radq serve
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use radquery::backend::Backends;
use radquery::config::{self, Config};
use radquery::dispatch::{invoke_tool, Caller};
use radquery::traits::ToolRegistry;
use radquery::{migrate, server, stats};

const DEFAULT_CONFIG: &str = "./config/radq.toml";

/// radquery: radiation measurement queries over a PostGIS database and the
/// upstream REST API, for AI tools and HTTP clients.
#[derive(Parser)]
#[command(
    name = "radq",
    about = "radquery: dual-source radiation measurement query gateway",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// When the default path does not exist, built-in defaults plus
    /// environment overrides are used.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the analytics store schema. Idempotent.
    Init,

    /// Report backend availability.
    Status,

    /// List registered tools with their parameter schemas (JSON).
    Tools,

    /// Run one tool through the same dispatcher as the servers.
    Call {
        /// Tool name, e.g. `query_radiation`.
        tool: String,

        /// Parameters as a JSON object.
        #[arg(long, default_value = "{}")]
        params: String,
    },

    /// Start the HTTP server (REST, /tools and MCP).
    Serve,
}

fn load(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() && path == Path::new(DEFAULT_CONFIG) {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        let mut cfg = Config::minimal();
        cfg.apply_env_overrides(|k| std::env::var(k).ok())?;
        return Ok(cfg);
    }
    config::load_config(path)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("radquery=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = || -> anyhow::Result<Arc<Config>> { Ok(Arc::new(load(&cli.config)?)) };

    match &cli.command {
        Commands::Tools => {
            let infos = ToolRegistry::with_builtins().infos();
            println!("{}", serde_json::to_string_pretty(&infos)?);
        }
        Commands::Init => {
            migrate::run_migrations(&*config()?).await?;
            println!("Analytics store initialized successfully.");
        }
        Commands::Status => {
            let backends = Backends::connect(config()?).await?;
            stats::print_status(&backends);
        }
        Commands::Call { tool, params } => {
            let params: serde_json::Value =
                serde_json::from_str(params).context("--params must be a JSON object")?;
            let backends = Backends::connect(config()?).await?;
            let tools = ToolRegistry::with_builtins();
            let outcome = invoke_tool(&tools, &backends, tool, params, &Caller::new("cli")).await;
            backends.telemetry.drain(Duration::from_secs(5)).await;
            match outcome {
                Ok(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                Err(failure) => {
                    println!("{}", serde_json::to_string_pretty(&failure.body())?);
                    return Err(failure.into());
                }
            }
        }
        Commands::Serve => {
            let backends = Backends::connect(config()?).await?;
            server::run_server(backends).await?;
        }
    }

    Ok(())
}
