use anyhow::Result;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use pgsink::schema::load_documents;
use pgsink::settings::Settings;
use pgsink::sync::{Sync, pipeline};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Schema config: one document or an array of documents
    #[arg(long, short = 'c', default_value = "schema.json", global = true)]
    config: PathBuf,

    /// Enable verbose output (info level)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// Suppress all non-essential output (error level only)
    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    /// Enable debug output (debug level)
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the replication slot, triggers, manifest view and index
    Bootstrap,

    /// Catch up from the checkpoint; optionally stay resident
    Run {
        /// Keep receiving changes after the initial pull
        #[arg(long, short = 'd')]
        daemon: bool,
    },

    /// Drop the triggers, slot, checkpoint, queue and index
    Teardown,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    initialize_logging(&cli);

    let stop = Arc::new(AtomicBool::new(false));
    tokio::spawn(watch_for_shutdown(stop.clone()));

    run_main(cli, stop).await
}

fn initialize_logging(cli: &Cli) {
    let level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else if cli.quiet {
        "error"
    } else {
        "warn"
    };

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(level)
    };

    fmt().with_env_filter(filter).with_target(false).init();
}

async fn watch_for_shutdown(stop: Arc<AtomicBool>) {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("received shutdown signal, draining...");
    stop.store(true, Ordering::Relaxed);
}

async fn run_main(cli: Cli, stop: Arc<AtomicBool>) -> Result<()> {
    let settings = Settings::from_env()?;
    let documents = load_documents(&cli.config)?;
    anyhow::ensure!(!documents.is_empty(), "no schema documents in config");

    match cli.command {
        Commands::Bootstrap => {
            for document in documents {
                let index = document.index.clone();
                info!(%index, "bootstrapping");
                let sync = Sync::new(document, settings.clone()).await?;
                sync.validate(false).await?;
                sync.bootstrap().await?;
            }
        }
        Commands::Run { daemon } => {
            let mut syncs = Vec::new();
            for document in documents {
                let sync = Sync::new(document, settings.clone()).await?;
                sync.validate(true).await?;
                syncs.push(Arc::new(sync));
            }

            if daemon {
                let mut handles = Vec::new();
                for sync in syncs {
                    info!(index = %sync.index, "starting pipeline");
                    handles.push(tokio::spawn(pipeline::run(sync, stop.clone())));
                }
                for handle in handles {
                    handle.await??;
                }
            } else {
                for sync in syncs {
                    info!(index = %sync.index, "pulling");
                    sync.pull().await?;
                }
            }
        }
        Commands::Teardown => {
            for document in documents {
                let index = document.index.clone();
                info!(%index, "tearing down");
                let sync = Sync::new(document, settings.clone()).await?;
                sync.teardown().await?;
            }
        }
    }

    Ok(())
}
