//! delayq: persistent delayed-message queue server.
//!
//! Speaks a subset of the Redis protocol (`SADD`, `SPOP`, `LLEN`, `DEL`,
//! `KEYS`, `PING`, `QUIT`) over TCP, backed by a fjall or redb store.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use delayq::config::{Backend, Config, DEFAULT_CONFIG_FILE};
use delayq::server::Server;
use delayq::store::QueueStore;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "delayq", version)]
#[command(about = "Persistent delayed-message queue with a Redis-protocol front-end")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open the store and serve clients until Ctrl-C
    Serve {
        /// Configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,

        /// Listen port (overrides server.port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Storage backend (overrides engine.backend)
        #[arg(long, value_enum)]
        backend: Option<Backend>,

        /// Log output format
        #[arg(long, value_enum, default_value_t = LogFormat::Text)]
        log_format: LogFormat,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            port,
            backend,
            log_format,
        } => {
            init_logging(log_format);
            serve(&config, port, backend).await
        },
    }
}

fn init_logging(format: LogFormat) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

async fn serve(path: &Path, port: Option<u16>, backend: Option<Backend>) -> Result<()> {
    let mut config = Config::load_or_default(path)?;
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(backend) = backend {
        config.engine.backend = backend;
    }

    let validation = config.validate()?;
    for warning in &validation.warnings {
        warn!("{warning}");
    }

    let store = QueueStore::open(&config).context("Failed to open queue store")?;
    info!(backend = ?config.engine.backend, "Queue store ready");

    let addr = config.listen_addr();
    let server = match Server::bind(&addr, store.clone()).await {
        Ok(server) => server,
        Err(e) => {
            // Release the store before bailing so its files are flushed.
            if let Err(close_err) = store.close().await {
                warn!(error = %close_err, "Failed to close queue store");
            }
            return Err(e).with_context(|| format!("Failed to bind {addr}"));
        },
    };

    server.run().await.context("Server failed")?;

    store.close().await.context("Failed to close queue store")?;
    info!("Queue store closed");
    Ok(())
}
