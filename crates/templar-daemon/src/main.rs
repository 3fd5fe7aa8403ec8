//! templar-daemon - websocket contract compiler service.
//!
//! Serves the template catalog over a websocket at `/`, with `/healthz` and
//! Prometheus `/metrics` on the same listener. Configuration is read from an
//! optional TOML file; command-line flags override it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use templar_core::config::DaemonConfig;
use templar_daemon::metrics::new_shared_registry;
use templar_daemon::{server, ServerState};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// templar daemon - compiles contract templates over a websocket
#[derive(Parser, Debug)]
#[command(name = "templar-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "TEMPLAR_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, overriding `server.listen`
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Directory for saved contracts, overriding `store.path`
    #[arg(long)]
    store: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => DaemonConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => DaemonConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(store) = &args.store {
        config.store.path = Some(store.clone());
    }
    config.validate().context("invalid configuration")?;

    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    runtime.block_on(async_main(args, config))
}

fn init_logging(args: &Args) {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn async_main(args: Args, config: DaemonConfig) -> Result<()> {
    init_logging(&args);

    let catalog = templar_core::default_catalog().context("failed to build template catalog")?;
    info!(
        templates = catalog.len(),
        network = ?config.compiler.network,
        policy = ?config.compiler.reference_policy,
        "template catalog ready"
    );

    let metrics = new_shared_registry().context("failed to initialize metrics registry")?;
    let state = Arc::new(
        ServerState::from_config(&config, Arc::new(catalog), metrics)
            .context("failed to initialize server state")?,
    );

    let listener = tokio::net::TcpListener::bind(config.server.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen))?;

    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;
    let shutdown = async move {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    };

    if let Err(e) = server::serve(listener, state, shutdown).await {
        error!("server error: {}", e);
        return Err(e).context("server error");
    }

    info!("templar daemon stopped");
    Ok(())
}
