//! The uniform operation surface every layer of a chain implements.
//!
//! A chain is one innermost *plugin* (the data source) plus zero or more
//! *filters* stacked outward. Both implement the same two traits; the only
//! difference is that a filter's [`Next`] handle leads somewhere, so the
//! default method bodies forward inward, while a plugin's `Next` is a dead
//! end and the defaults fall back to the safe answer.
//!
//! [`Layer`] covers registration-scope operations (no open handle);
//! [`LayerIo`] is the per-connection handle produced by [`Layer::open`] and
//! carries the capability queries and the data path. Dropping a `LayerIo`
//! closes the handle.

use std::fmt;

use async_trait::async_trait;
use tracing::error;

use crate::chain::Next;
use crate::error::Errno;
use crate::extents::ExtentList;

/// Force-unit-access: the write must reach stable storage before replying.
pub const FLAG_FUA: u32 = 1 << 0;
/// The zeroed range may be deallocated instead of written.
pub const FLAG_MAY_TRIM: u32 = 1 << 1;
/// The extents query wants at most one record.
pub const FLAG_REQ_ONE: u32 = 1 << 2;
/// The zero request must not fall back to writing zeroes.
pub const FLAG_FAST_ZERO: u32 = 1 << 3;

/// Maximum byte length of export names and descriptions.
pub const MAX_STRING: usize = 4096;

/// Largest single data request the dispatcher will pass to a layer.
pub const MAX_REQUEST_SIZE: u32 = 32 * 1024 * 1024;

/// Chunk size for the pwrite-of-zeroes fallback in [`LayerIo::zero`].
const ZERO_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    /// The innermost data source.
    Plugin,
    /// A transforming interposer with an inner neighbour.
    Filter,
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerKind::Plugin => write!(f, "plugin"),
            LayerKind::Filter => write!(f, "filter"),
        }
    }
}

/// How a layer supports write-zeroes requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ZeroMode {
    None,
    /// Zeroing works, implemented by the layer writing zeroes.
    Emulate,
    Native,
}

/// How a layer supports force-unit-access writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FuaMode {
    None,
    /// FUA honoured by flushing after the write.
    Emulate,
    Native,
}

/// How a layer supports cache (prefetch) requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CacheMode {
    None,
    /// The dispatcher emulates by reading into a scratch buffer.
    Emulate,
    Native,
}

impl ZeroMode {
    pub(crate) fn from_raw(v: i8) -> Self {
        match v {
            0 => ZeroMode::None,
            1 => ZeroMode::Emulate,
            _ => ZeroMode::Native,
        }
    }
}

impl FuaMode {
    pub(crate) fn from_raw(v: i8) -> Self {
        match v {
            0 => FuaMode::None,
            1 => FuaMode::Emulate,
            _ => FuaMode::Native,
        }
    }
}

impl CacheMode {
    pub(crate) fn from_raw(v: i8) -> Self {
        match v {
            0 => CacheMode::None,
            1 => CacheMode::Emulate,
            _ => CacheMode::Native,
        }
    }
}

/// Request parallelism a layer tolerates within one connection, most
/// restrictive first. A chain runs at the most restrictive model any of
/// its layers declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThreadModel {
    SerializeConnections,
    SerializeAllRequests,
    SerializeRequests,
    Parallel,
}

/// One export a layer offers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub name: String,
    pub description: Option<String>,
}

impl Export {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
        }
    }
}

/// Check a layer name: non-empty, first byte ASCII alphanumeric, the rest
/// alphanumerics or dashes.
pub fn valid_layer_name(name: &str) -> bool {
    let mut bytes = name.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    bytes.all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

/// Registration-scope operations of a layer.
///
/// One instance serves every connection; per-connection state lives in the
/// [`LayerIo`] returned by [`Layer::open`].
#[async_trait]
pub trait Layer: Send + Sync {
    /// Short name used in logs and configuration.
    fn name(&self) -> &str;

    /// Provenance string recorded in the chain.
    fn filename(&self) -> &str {
        self.name()
    }

    fn kind(&self) -> LayerKind;

    /// Request parallelism this layer tolerates.
    fn thread_model(&self) -> ThreadModel {
        ThreadModel::Parallel
    }

    /// Called once when the chain is assembled.
    fn load(&self) {}

    /// Called once at chain teardown, under the exclusive unload lock.
    fn unload(&self) {}

    /// Exports this layer offers. An empty answer makes the dispatcher
    /// synthesise an entry for the default export.
    async fn list_exports(&self, next: &Next<'_>, readonly: bool) -> Result<Vec<Export>, Errno> {
        if next.has_inner() {
            next.list_exports(readonly).await
        } else {
            Ok(Vec::new())
        }
    }

    /// The canonical name served when a client asks for the empty export
    /// name. `None` refuses the default export entirely.
    async fn default_export(&self, next: &Next<'_>, readonly: bool) -> Option<String> {
        if next.has_inner() {
            next.default_export(readonly).await
        } else {
            Some(String::new())
        }
    }

    /// Open a per-connection handle. Filters usually call [`Next::open`]
    /// first, producing inner-first handle creation.
    async fn open(
        &self,
        next: &Next<'_>,
        readonly: bool,
        exportname: &str,
    ) -> Result<Box<dyn LayerIo>, Errno>;
}

/// Per-connection handle of a layer: capability queries and the data path.
///
/// Every method receives the [`Next`] handle bound to this connection's
/// inner neighbour. Unimplemented operations forward inward on filters and
/// answer the safe default on plugins. Dropping the handle closes it.
#[async_trait]
pub trait LayerIo: Send + Sync {
    /// Second initialisation step, called inner-to-outer once the whole
    /// chain is open.
    async fn prepare(&self, _next: &Next<'_>, _readonly: bool) -> Result<(), Errno> {
        Ok(())
    }

    /// Graceful shutdown step, called outer-to-inner before close.
    async fn finalize(&self, _next: &Next<'_>) -> Result<(), Errno> {
        Ok(())
    }

    /// Free-form description of the open export. Never cached.
    async fn export_description(&self, next: &Next<'_>) -> Option<String> {
        if next.has_inner() {
            next.export_description().await
        } else {
            None
        }
    }

    /// Size of the export in bytes. Plugins must implement this.
    async fn get_size(&self, next: &Next<'_>) -> Result<u64, Errno> {
        if next.has_inner() {
            next.get_size().await
        } else {
            error!("plugin does not implement get_size");
            Err(Errno::Io)
        }
    }

    async fn can_write(&self, next: &Next<'_>) -> Result<bool, Errno> {
        if next.has_inner() {
            next.can_write().await
        } else {
            Ok(false)
        }
    }

    async fn can_flush(&self, next: &Next<'_>) -> Result<bool, Errno> {
        if next.has_inner() {
            next.can_flush().await
        } else {
            Ok(false)
        }
    }

    async fn is_rotational(&self, next: &Next<'_>) -> Result<bool, Errno> {
        if next.has_inner() {
            next.is_rotational().await
        } else {
            Ok(false)
        }
    }

    async fn can_trim(&self, next: &Next<'_>) -> Result<bool, Errno> {
        if next.has_inner() {
            next.can_trim().await
        } else {
            Ok(false)
        }
    }

    /// Plugins default to `Emulate`: the fallback [`LayerIo::zero`] writes
    /// zeroes through `pwrite`, so any writable plugin can zero.
    async fn can_zero(&self, next: &Next<'_>) -> Result<ZeroMode, Errno> {
        if next.has_inner() {
            next.can_zero().await
        } else {
            Ok(ZeroMode::Emulate)
        }
    }

    async fn can_fast_zero(&self, next: &Next<'_>) -> Result<bool, Errno> {
        if next.has_inner() {
            next.can_fast_zero().await
        } else {
            Ok(false)
        }
    }

    async fn can_fua(&self, next: &Next<'_>) -> Result<FuaMode, Errno> {
        if next.has_inner() {
            next.can_fua().await
        } else {
            Ok(FuaMode::None)
        }
    }

    async fn can_multi_conn(&self, next: &Next<'_>) -> Result<bool, Errno> {
        if next.has_inner() {
            next.can_multi_conn().await
        } else {
            Ok(false)
        }
    }

    async fn can_extents(&self, next: &Next<'_>) -> Result<bool, Errno> {
        if next.has_inner() {
            next.can_extents().await
        } else {
            Ok(false)
        }
    }

    async fn can_cache(&self, next: &Next<'_>) -> Result<CacheMode, Errno> {
        if next.has_inner() {
            next.can_cache().await
        } else {
            Ok(CacheMode::None)
        }
    }

    /// Fill `buf` from the export at `offset`. Plugins must implement this.
    async fn pread(
        &self,
        next: &Next<'_>,
        buf: &mut [u8],
        offset: u64,
        flags: u32,
    ) -> Result<(), Errno> {
        if next.has_inner() {
            next.pread(buf, offset, flags).await
        } else {
            error!("plugin does not implement pread");
            Err(Errno::Io)
        }
    }

    async fn pwrite(
        &self,
        next: &Next<'_>,
        buf: &[u8],
        offset: u64,
        flags: u32,
    ) -> Result<(), Errno> {
        if next.has_inner() {
            next.pwrite(buf, offset, flags).await
        } else {
            error!("plugin advertises writes but does not implement pwrite");
            Err(Errno::Io)
        }
    }

    async fn flush(&self, next: &Next<'_>, flags: u32) -> Result<(), Errno> {
        if next.has_inner() {
            next.flush(flags).await
        } else {
            error!("plugin advertises flush but does not implement it");
            Err(Errno::Io)
        }
    }

    async fn trim(
        &self,
        next: &Next<'_>,
        count: u32,
        offset: u64,
        flags: u32,
    ) -> Result<(), Errno> {
        if next.has_inner() {
            next.trim(count, offset, flags).await
        } else {
            error!("plugin advertises trim but does not implement it");
            Err(Errno::Io)
        }
    }

    /// Write zeroes. The plugin fallback loops `pwrite` over a zero buffer,
    /// which is why [`LayerIo::can_zero`] defaults to `Emulate`; a fast-zero
    /// request cannot take that path and fails with `NotSup`.
    async fn zero(
        &self,
        next: &Next<'_>,
        count: u32,
        offset: u64,
        flags: u32,
    ) -> Result<(), Errno> {
        if next.has_inner() {
            return next.zero(count, offset, flags).await;
        }
        if flags & FLAG_FAST_ZERO != 0 {
            return Err(Errno::NotSup);
        }
        let zeroes = vec![0u8; ZERO_CHUNK.min(count as usize)];
        let mut remaining = count as usize;
        let mut pos = offset;
        while remaining > 0 {
            let n = remaining.min(zeroes.len());
            self.pwrite(next, &zeroes[..n], pos, flags & FLAG_FUA)
                .await?;
            remaining -= n;
            pos += n as u64;
        }
        Ok(())
    }

    /// Describe `[offset, offset + count)`. The plugin fallback reports the
    /// whole range as allocated data, the safe worst case.
    async fn extents(
        &self,
        next: &Next<'_>,
        count: u32,
        offset: u64,
        flags: u32,
        extents: &mut ExtentList,
    ) -> Result<(), Errno> {
        if next.has_inner() {
            next.extents(count, offset, flags, extents).await
        } else {
            extents.add(offset, count as u64, 0)
        }
    }

    async fn cache(
        &self,
        next: &Next<'_>,
        count: u32,
        offset: u64,
        flags: u32,
    ) -> Result<(), Errno> {
        if next.has_inner() {
            next.cache(count, offset, flags).await
        } else {
            error!("plugin advertises native cache but does not implement it");
            Err(Errno::Io)
        }
    }
}
