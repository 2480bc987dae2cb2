//! stackbd: an NBD server over a composable backend chain.
//!
//! Every client request is dispatched through a chain of layers: one
//! innermost plugin (the data source) plus zero or more filters. Filters
//! forward, transform, or synthesise answers through a "next ops" handle
//! bound to their inner neighbour, and the dispatcher enforces lifecycle,
//! range, flag, and capability rules at every hop.
//!
//! # Library Usage
//!
//! The primary API for running stackbd is the [`Daemon`] struct:
//!
//! ```ignore
//! use stackbd::{Config, Daemon};
//!
//! let daemon = Daemon::from_config(Config::default())?;
//! daemon.listen(listener).await?;
//! ```
//!
//! Chains can also be driven directly, which is what custom layers and the
//! integration tests do:
//!
//! ```ignore
//! use stackbd::{Chain, Connection};
//!
//! let chain = Chain::build(plugin, filters)?;
//! let conn = Connection::new(chain);
//! let ctx = conn.open_chain(false, "").await?;
//! conn.prepare(&ctx).await?;
//! conn.pread(&ctx, &mut buf, 0, 0).await?;
//! ```

pub mod chain;
pub mod config;
pub mod daemon;
pub mod error;
pub mod extents;
pub mod layer;
pub mod layers;
pub mod server;

pub use chain::{Chain, Connection, Context, LayerEntry, Next};
pub use config::{Config, ExportConfig, FilterConfig, NbdConfig, PluginConfig};
pub use daemon::Daemon;
pub use error::{ConfigError, Errno, Error, NbdError, Result};
pub use extents::{
    extents_aligned, Extent, ExtentList, EXTENT_HOLE, EXTENT_ZERO, MAX_EXTENTS,
};
pub use layer::{
    valid_layer_name, CacheMode, Export, FuaMode, Layer, LayerIo, LayerKind, ThreadModel,
    ZeroMode, FLAG_FAST_ZERO, FLAG_FUA, FLAG_MAY_TRIM, FLAG_REQ_ONE, MAX_REQUEST_SIZE, MAX_STRING,
};
pub use server::{Accept, ConnQueue, NbdServer};

pub use nbd;
