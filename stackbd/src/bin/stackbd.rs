//! stackbd daemon - NBD server over a composable backend chain.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use stackbd::{Config, Daemon};

#[derive(Parser)]
#[command(name = "stackbd", about = "NBD server over a composable backend chain")]
struct Cli {
    /// Path to config file. If omitted, uses defaults (1GB in-memory export).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address. Overrides config file if specified.
    #[arg(long)]
    address: Option<String>,

    /// Export size in bytes. Overrides config file if specified.
    #[arg(long)]
    size_bytes: Option<u64>,

    /// Serve the export read-only.
    #[arg(long)]
    readonly: bool,

    /// Enable debug logging (including the chain's control and data paths).
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn resolve_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)
                .with_context(|| format!("cannot load config {}", path.display()))?,
            None => Config::default(),
        };
        if let Some(address) = &self.address {
            config.nbd.address = address.clone();
        }
        if let Some(size_bytes) = self.size_bytes {
            config.plugin.size_bytes = size_bytes;
        }
        if self.readonly {
            config.export.readonly = true;
        }
        Ok(config)
    }
}

fn init_logging(debug: bool) -> Result<()> {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).context("logging already initialised")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug)?;
    let config = cli.resolve_config()?;

    let daemon = Daemon::from_config(config).context("cannot assemble the backend chain")?;

    // Bind up front so a bad address fails the start, not a background task.
    let address = daemon.nbd_address().to_string();
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("cannot listen on {address}"))?;

    info!(
        address = %address,
        export = %daemon.config().export.name,
        plugin = %daemon.config().plugin.name,
        filters = daemon.config().filters.len(),
        readonly = daemon.config().export.readonly,
        "stackbd serving"
    );

    let accept_task = {
        let daemon = daemon.clone();
        tokio::spawn(async move {
            if let Err(e) = daemon.listen(listener).await {
                error!(error = %e, "accept loop failed");
            }
        })
    };

    wait_for_stop().await;

    accept_task.abort();
    daemon.shutdown().await;

    Ok(())
}

/// Block until the operator asks the daemon to stop.
async fn wait_for_stop() {
    #[cfg(unix)]
    {
        use signal::unix::{signal as unix_signal, SignalKind};
        match unix_signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = signal::ctrl_c() => info!("stopping on interrupt"),
                    _ = terminate.recv() => info!("stopping on terminate"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "no terminate handler; interrupt only"),
        }
    }
    if signal::ctrl_c().await.is_ok() {
        info!("stopping on interrupt");
    }
}
