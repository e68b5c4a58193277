//! # Context Feeder CLI (`feeder`)
//!
//! ## Usage
//!
//! ```bash
//! feeder --config ./config/feeder.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `feeder run` | Start the receiver and every task until Ctrl-C |
//! | `feeder check` | Validate the config and probe every broker and store |

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use context_feeder::{check, config, orchestrator::Orchestrator, server};

/// Context Feeder: context broker entities into search indices.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/feeder.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "feeder",
    about = "Context Feeder: feeds context broker entities into Elasticsearch",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/feeder.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` takes
    /// precedence when set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the notification receiver and all configured tasks.
    ///
    /// Runs until interrupted. On Ctrl-C every task removes its
    /// subscription before the process exits.
    Run,

    /// Check that every task's broker and store are reachable.
    ///
    /// Exits non-zero if any endpoint cannot be reached.
    Check,
}

fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        EnvFilter::new(level.as_str())
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_json);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Check => {
            check::run_check(&cfg).await?;
        }
        Commands::Run => {
            info!("Context Feeder v{}", env!("CARGO_PKG_VERSION"));

            let mut orchestrator = Orchestrator::from_config(&cfg)?;
            let listener = TcpListener::bind(&cfg.endpoint.bind)
                .await
                .with_context(|| format!("Failed to bind {}", cfg.endpoint.bind))?;

            let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
            let receiver = tokio::spawn(server::serve(
                listener,
                orchestrator.registry(),
                async move {
                    let _ = stop_rx.await;
                },
            ));

            let interrupted = tokio::select! {
                _ = orchestrator.start() => false,
                _ = tokio::signal::ctrl_c() => true,
            };
            if !interrupted {
                tokio::signal::ctrl_c()
                    .await
                    .context("Failed to listen for Ctrl-C")?;
            }
            info!("shutting down");

            orchestrator.shutdown().await;
            let _ = stop_tx.send(());
            receiver.await??;
        }
    }

    Ok(())
}
