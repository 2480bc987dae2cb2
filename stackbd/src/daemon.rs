//! Daemon API for running stackbd.
//!
//! Assembles the backend chain from configuration and serves NBD
//! connections over it.
//!
//! # Example
//!
//! ```ignore
//! use stackbd::{Config, Daemon};
//! use tokio::net::TcpListener;
//!
//! let daemon = Daemon::from_config(Config::default())?;
//! let listener = TcpListener::bind(daemon.nbd_address()).await?;
//! daemon.listen(listener).await?;
//! ```

use std::io;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::chain::Chain;
use crate::config::Config;
use crate::error::{Error, NbdError};
use crate::server::{Accept, NbdServer};

/// A running stackbd instance.
#[derive(Clone)]
pub struct Daemon {
    chain: Arc<Chain>,
    server: NbdServer,
    config: Arc<Config>,
}

impl Daemon {
    /// Create a new daemon from configuration: build the plugin and filter
    /// stack, assemble the chain, and set up the per-connection server.
    pub fn from_config(config: Config) -> Result<Self, Error> {
        config.plugin.validate()?;
        let plugin = config.plugin.build_plugin()?;
        let filters = config
            .filters
            .iter()
            .map(|f| f.build_filter())
            .collect::<Result<Vec<_>, _>>()?;
        let chain = Chain::build(plugin, filters)?;
        let server = NbdServer::new(chain.clone(), config.export.clone());
        Ok(Self {
            chain,
            server,
            config: Arc::new(config),
        })
    }

    /// Get the daemon configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the NBD address from config.
    pub fn nbd_address(&self) -> &str {
        &self.config.nbd.address
    }

    /// The assembled backend chain.
    pub fn chain(&self) -> &Arc<Chain> {
        &self.chain
    }

    /// Serve NBD connections from `source` until it runs out.
    ///
    /// Socket listeners never run out, so in production this returns only
    /// on an accept error; an in-memory [`ConnQueue`] ends the loop when
    /// its sender is dropped. Every connection is served on its own task.
    ///
    /// [`ConnQueue`]: crate::server::ConnQueue
    pub async fn listen<A>(&self, mut source: A) -> io::Result<()>
    where
        A: Accept,
    {
        info!(
            export = %self.config.export.name,
            layers = self.chain.len(),
            "accepting NBD clients"
        );

        while let Some(stream) = source.next_conn().await? {
            let server = self.server.clone();
            tokio::spawn(async move {
                match server.serve(stream).await {
                    // A client going away mid-stream surfaces as plain I/O;
                    // only protocol trouble is worth a log line.
                    Ok(()) | Err(NbdError::Io(_)) => {}
                    Err(e) => warn!(error = %e, "connection ended abnormally"),
                }
            });
        }
        debug!("connection source exhausted");
        Ok(())
    }

    /// Run every layer's unload hook. Call once all connections are done.
    pub async fn shutdown(&self) {
        self.chain.unload_all().await;
    }
}
