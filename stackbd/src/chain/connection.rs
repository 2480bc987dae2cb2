//! Per-connection state: the context registry and the "next ops" handle.
//!
//! A [`Connection`] owns one context slot per layer of the chain, indexed by
//! the layer's position, plus a memo of each layer's default-export answer.
//! A [`Context`] is one layer's open handle for one connection, together
//! with its state flags and write-once capability caches. Layers never hold
//! references back to contexts; the connection's slot array is the
//! authoritative lookup.

use std::sync::atomic::{AtomicI64, AtomicI8, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::error;

use crate::chain::{Chain, LayerEntry};
use crate::error::Errno;
use crate::extents::ExtentList;
use crate::layer::{CacheMode, Export, FuaMode, LayerIo, ZeroMode};

pub(crate) const STATE_OPEN: u8 = 1 << 0;
pub(crate) const STATE_CONNECTED: u8 = 1 << 1;
pub(crate) const STATE_FAILED: u8 = 1 << 2;

/// Write-once capability memo: negative means unknown.
///
/// Under a parallel thread model two first-query racers may both consult the
/// layer; answers are required to be deterministic per context, so the last
/// writer wins and relaxed ordering suffices.
pub(crate) struct CapCell(AtomicI8);

impl CapCell {
    fn unknown() -> Self {
        Self(AtomicI8::new(-1))
    }

    fn preset(v: i8) -> Self {
        Self(AtomicI8::new(v))
    }

    pub(crate) fn get(&self) -> Option<i8> {
        let v = self.0.load(Ordering::Relaxed);
        (v >= 0).then_some(v)
    }

    pub(crate) fn set(&self, v: i8) {
        self.0.store(v, Ordering::Relaxed);
    }
}

/// One layer's per-connection state: its open handle, lifecycle flags, and
/// cached capability answers.
pub struct Context {
    entry: Arc<LayerEntry>,
    pub(crate) io: Box<dyn LayerIo>,
    state: AtomicU8,
    /// Cached export size; negative means not yet queried.
    exportsize: AtomicI64,
    pub(crate) can_write: CapCell,
    pub(crate) can_flush: CapCell,
    pub(crate) is_rotational: CapCell,
    pub(crate) can_trim: CapCell,
    pub(crate) can_zero: CapCell,
    pub(crate) can_fast_zero: CapCell,
    pub(crate) can_fua: CapCell,
    pub(crate) can_multi_conn: CapCell,
    pub(crate) can_extents: CapCell,
    pub(crate) can_cache: CapCell,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("index", &self.index())
            .field("state", &self.state())
            .finish()
    }
}

impl Context {
    pub(crate) fn new(entry: Arc<LayerEntry>, io: Box<dyn LayerIo>, readonly: bool) -> Self {
        Self {
            entry,
            io,
            state: AtomicU8::new(STATE_OPEN),
            exportsize: AtomicI64::new(-1),
            // A read-only open pins can_write without consulting the layer.
            can_write: if readonly {
                CapCell::preset(0)
            } else {
                CapCell::unknown()
            },
            can_flush: CapCell::unknown(),
            is_rotational: CapCell::unknown(),
            can_trim: CapCell::unknown(),
            can_zero: CapCell::unknown(),
            can_fast_zero: CapCell::unknown(),
            can_fua: CapCell::unknown(),
            can_multi_conn: CapCell::unknown(),
            can_extents: CapCell::unknown(),
            can_cache: CapCell::unknown(),
        }
    }

    /// Position of this context's layer in the chain (0 = innermost).
    pub fn index(&self) -> usize {
        self.entry.index()
    }

    pub fn layer_name(&self) -> &str {
        self.entry.name()
    }

    fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.state() & STATE_OPEN != 0
    }

    pub fn is_connected(&self) -> bool {
        self.state() & STATE_CONNECTED != 0
    }

    pub fn is_failed(&self) -> bool {
        self.state() & STATE_FAILED != 0
    }

    pub(crate) fn set_connected(&self) {
        self.state.fetch_or(STATE_CONNECTED, Ordering::AcqRel);
    }

    pub(crate) fn set_failed(&self) {
        self.state.fetch_or(STATE_FAILED, Ordering::AcqRel);
    }

    /// End the connected window: data-path calls are refused from here on.
    pub(crate) fn clear_connected(&self) {
        self.state.fetch_and(!STATE_CONNECTED, Ordering::AcqRel);
    }

    /// Invalidate the context entirely. Stray `Arc`s may keep the
    /// allocation alive past close, so the state flags carry the "gone"
    /// answer instead.
    pub(crate) fn mark_closed(&self) {
        self.state
            .fetch_and(!(STATE_OPEN | STATE_CONNECTED), Ordering::AcqRel);
    }

    /// The cached export size, if known.
    pub(crate) fn cached_size(&self) -> Option<u64> {
        let v = self.exportsize.load(Ordering::Relaxed);
        (v >= 0).then_some(v as u64)
    }

    pub(crate) fn set_size(&self, size: u64) {
        debug_assert!(size <= i64::MAX as u64);
        self.exportsize.store(size as i64, Ordering::Relaxed);
    }
}

/// Per-connection chain state: one context slot per layer, plus the
/// default-export memo.
///
/// The slot arrays are written only by the thread performing open, close, or
/// default-export resolution for this connection; data-path threads only
/// read them. The `using_tls` flag is fixed at construction and passed to
/// layers that vary their answers by transport security.
pub struct Connection {
    chain: Arc<Chain>,
    contexts: Vec<RwLock<Option<Arc<Context>>>>,
    default_exportname: Vec<Mutex<Option<String>>>,
    /// The export name the client negotiated, recorded by the first
    /// whole-chain open.
    exportname: Mutex<Option<String>>,
    using_tls: bool,
}

impl Connection {
    pub fn new(chain: Arc<Chain>) -> Self {
        Self::with_tls(chain, false)
    }

    pub fn with_tls(chain: Arc<Chain>, using_tls: bool) -> Self {
        let n = chain.len();
        Self {
            chain,
            contexts: (0..n).map(|_| RwLock::new(None)).collect(),
            default_exportname: (0..n).map(|_| Mutex::new(None)).collect(),
            exportname: Mutex::new(None),
            using_tls,
        }
    }

    /// The export name negotiated for this connection, if a chain open has
    /// happened.
    pub fn exportname(&self) -> Option<String> {
        self.exportname.lock().clone()
    }

    pub(crate) fn set_exportname(&self, name: &str) {
        *self.exportname.lock() = Some(name.to_string());
    }

    pub fn chain(&self) -> &Arc<Chain> {
        &self.chain
    }

    pub fn using_tls(&self) -> bool {
        self.using_tls
    }

    /// The open context for layer `i`, if any.
    pub fn context(&self, i: usize) -> Option<Arc<Context>> {
        self.contexts[i].read().clone()
    }

    /// The outermost layer's context, if the chain is open.
    pub fn top_context(&self) -> Option<Arc<Context>> {
        self.context(self.chain.len() - 1)
    }

    pub(crate) fn set_context(&self, i: usize, ctx: Arc<Context>) {
        let mut slot = self.contexts[i].write();
        debug_assert!(slot.is_none());
        *slot = Some(ctx);
    }

    pub(crate) fn clear_context(&self, i: usize) {
        *self.contexts[i].write() = None;
    }

    pub(crate) fn default_export_memo(&self, i: usize) -> Option<String> {
        self.default_exportname[i].lock().clone()
    }

    pub(crate) fn memoize_default_export(&self, i: usize, name: &str) {
        *self.default_exportname[i].lock() = Some(name.to_string());
    }

    /// The `Next` handle layer `i` sees: bound to its inner neighbour, or a
    /// dead end for the innermost layer.
    pub(crate) fn next_for_layer(&self, i: usize) -> Next<'_> {
        Next {
            conn: self,
            inner: i.checked_sub(1),
        }
    }

    pub(crate) fn next_for(&self, ctx: &Context) -> Next<'_> {
        self.next_for_layer(ctx.index())
    }
}

/// Handle a layer uses to call into its inner neighbour.
///
/// Each call re-enters the dispatcher against the inner layer's context, so
/// the inner layer sees the same precondition checks and capability caching
/// as a call arriving from the wire. For the innermost layer the handle is a
/// dead end: [`Next::has_inner`] is false and every forwarding call fails.
pub struct Next<'a> {
    conn: &'a Connection,
    inner: Option<usize>,
}

impl<'a> Next<'a> {
    /// Whether there is an inner neighbour to forward to.
    pub fn has_inner(&self) -> bool {
        self.inner.is_some()
    }

    pub fn using_tls(&self) -> bool {
        self.conn.using_tls
    }

    fn inner_index(&self) -> Result<usize, Errno> {
        self.inner.ok_or_else(|| {
            error!("innermost layer tried to forward a call inward");
            Errno::Inval
        })
    }

    fn inner_context(&self) -> Result<Arc<Context>, Errno> {
        let i = self.inner_index()?;
        self.conn.context(i).ok_or_else(|| {
            error!(layer = i, "no open context for inner layer");
            Errno::Inval
        })
    }

    /// Open the inner layer (and transitively its inner neighbours).
    pub async fn open(&self, readonly: bool, exportname: &str) -> Result<(), Errno> {
        let i = self.inner_index()?;
        self.conn.open_layer(i, readonly, exportname).await?;
        Ok(())
    }

    /// Tear down and re-establish the inner part of the chain. Intended for
    /// retry-style filters recovering from a fatal inner failure.
    pub async fn reopen(&self, readonly: bool, exportname: &str) -> Result<(), Errno> {
        let i = self.inner_index()?;
        self.conn.reopen(i, readonly, exportname).await
    }

    pub async fn list_exports(&self, readonly: bool) -> Result<Vec<Export>, Errno> {
        let i = self.inner_index()?;
        self.conn.list_exports(i, readonly).await
    }

    pub async fn default_export(&self, readonly: bool) -> Option<String> {
        let i = self.inner_index().ok()?;
        self.conn.default_export(i, readonly).await
    }

    pub async fn export_description(&self) -> Option<String> {
        let ctx = self.inner_context().ok()?;
        self.conn.export_description(&ctx).await
    }

    pub async fn get_size(&self) -> Result<u64, Errno> {
        let ctx = self.inner_context()?;
        self.conn.get_size(&ctx).await
    }

    pub async fn can_write(&self) -> Result<bool, Errno> {
        let ctx = self.inner_context()?;
        self.conn.can_write(&ctx).await
    }

    pub async fn can_flush(&self) -> Result<bool, Errno> {
        let ctx = self.inner_context()?;
        self.conn.can_flush(&ctx).await
    }

    pub async fn is_rotational(&self) -> Result<bool, Errno> {
        let ctx = self.inner_context()?;
        self.conn.is_rotational(&ctx).await
    }

    pub async fn can_trim(&self) -> Result<bool, Errno> {
        let ctx = self.inner_context()?;
        self.conn.can_trim(&ctx).await
    }

    pub async fn can_zero(&self) -> Result<ZeroMode, Errno> {
        let ctx = self.inner_context()?;
        self.conn.can_zero(&ctx).await
    }

    pub async fn can_fast_zero(&self) -> Result<bool, Errno> {
        let ctx = self.inner_context()?;
        self.conn.can_fast_zero(&ctx).await
    }

    pub async fn can_fua(&self) -> Result<FuaMode, Errno> {
        let ctx = self.inner_context()?;
        self.conn.can_fua(&ctx).await
    }

    pub async fn can_multi_conn(&self) -> Result<bool, Errno> {
        let ctx = self.inner_context()?;
        self.conn.can_multi_conn(&ctx).await
    }

    pub async fn can_extents(&self) -> Result<bool, Errno> {
        let ctx = self.inner_context()?;
        self.conn.can_extents(&ctx).await
    }

    pub async fn can_cache(&self) -> Result<CacheMode, Errno> {
        let ctx = self.inner_context()?;
        self.conn.can_cache(&ctx).await
    }

    pub async fn pread(&self, buf: &mut [u8], offset: u64, flags: u32) -> Result<(), Errno> {
        let ctx = self.inner_context()?;
        self.conn.pread(&ctx, buf, offset, flags).await
    }

    pub async fn pwrite(&self, buf: &[u8], offset: u64, flags: u32) -> Result<(), Errno> {
        let ctx = self.inner_context()?;
        self.conn.pwrite(&ctx, buf, offset, flags).await
    }

    pub async fn flush(&self, flags: u32) -> Result<(), Errno> {
        let ctx = self.inner_context()?;
        self.conn.flush(&ctx, flags).await
    }

    pub async fn trim(&self, count: u32, offset: u64, flags: u32) -> Result<(), Errno> {
        let ctx = self.inner_context()?;
        self.conn.trim(&ctx, count, offset, flags).await
    }

    pub async fn zero(&self, count: u32, offset: u64, flags: u32) -> Result<(), Errno> {
        let ctx = self.inner_context()?;
        self.conn.zero(&ctx, count, offset, flags).await
    }

    pub async fn extents(
        &self,
        count: u32,
        offset: u64,
        flags: u32,
        extents: &mut ExtentList,
    ) -> Result<(), Errno> {
        let ctx = self.inner_context()?;
        self.conn.extents(&ctx, count, offset, flags, extents).await
    }

    pub async fn cache(&self, count: u32, offset: u64, flags: u32) -> Result<(), Errno> {
        let ctx = self.inner_context()?;
        self.conn.cache(&ctx, count, offset, flags).await
    }
}
