//! The chain dispatcher: every operation on a connection's chain funnels
//! through these wrappers, which enforce lifecycle and precondition rules
//! before handing the call to the layer.
//!
//! Control-path and data-path logging use the `stackbd::controlpath` and
//! `stackbd::datapath` tracing targets so either can be filtered out
//! independently.
//!
//! The dispatcher is reentrant and keeps no state of its own: a filter
//! forwarding through [`Next`](super::Next) re-enters these same wrappers
//! against the inner layer's context.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::chain::connection::{Connection, Context};
use crate::error::Errno;
use crate::extents::ExtentList;
use crate::layer::{
    CacheMode, Export, FuaMode, ZeroMode, FLAG_FAST_ZERO, FLAG_FUA, FLAG_MAY_TRIM, FLAG_REQ_ONE,
    MAX_REQUEST_SIZE, MAX_STRING,
};

impl Connection {
    // ---- Chain control ----------------------------------------------------

    /// Open the whole chain for `exportname`, outermost layer first.
    ///
    /// Layers typically forward their open inward via [`Next::open`], so
    /// handles come into existence inner-first even though the call starts
    /// at the outermost layer. The returned context is the outermost one;
    /// pass it to [`Connection::prepare`] before any data-path call.
    ///
    /// [`Next::open`]: super::Next::open
    pub async fn open_chain(&self, readonly: bool, exportname: &str) -> Result<Arc<Context>, Errno> {
        let ctx = self
            .open_layer(self.chain().len() - 1, readonly, exportname)
            .await?;
        self.set_exportname(exportname);
        Ok(ctx)
    }

    pub(crate) async fn open_layer(
        &self,
        i: usize,
        readonly: bool,
        exportname: &str,
    ) -> Result<Arc<Context>, Errno> {
        let entry = self.chain().entry(i).clone();
        debug!(
            target: "stackbd::controlpath",
            layer = %entry.name(),
            readonly,
            exportname,
            tls = self.using_tls(),
            "open"
        );

        if self.context(i).is_some() {
            error!(layer = %entry.name(), "layer already has an open context");
            return Err(Errno::Inval);
        }

        // Determine the canonical name for the default export.
        let resolved;
        let exportname = if exportname.is_empty() {
            match self.default_export(i, readonly).await {
                Some(name) => {
                    resolved = name;
                    &resolved
                }
                None => {
                    error!(layer = %entry.name(), "default export (\"\") not permitted");
                    return Err(Errno::Inval);
                }
            }
        } else {
            exportname
        };

        let next = self.next_for_layer(i);
        match entry.layer().open(&next, readonly, exportname).await {
            Ok(io) => {
                debug!(target: "stackbd::controlpath", layer = %entry.name(), "open succeeded");
                let ctx = Arc::new(Context::new(entry, io, readonly));
                self.set_context(i, ctx.clone());
                Ok(ctx)
            }
            Err(e) => {
                debug!(target: "stackbd::controlpath", layer = %entry.name(), error = %e, "open failed");
                // Do not strand an already-open inner context.
                if i > 0 {
                    if let Some(inner) = self.context(i - 1) {
                        self.close(&inner);
                    }
                }
                Err(e)
            }
        }
    }

    /// Second initialisation pass, walking inner-to-outer.
    ///
    /// Each layer is told whether the chain below it is effectively
    /// read-only (`can_write` pinned to no). Layers already prepared stay
    /// prepared if an outer one fails.
    pub async fn prepare(&self, ctx: &Arc<Context>) -> Result<(), Errno> {
        // Collect the contiguous run of open contexts at and below this
        // layer; a filter may legitimately have skipped opening its inner
        // neighbour, which ends the run.
        let mut stack = vec![ctx.clone()];
        let mut i = ctx.index();
        while i > 0 {
            match self.context(i - 1) {
                Some(c) => {
                    stack.push(c);
                    i -= 1;
                }
                None => break,
            }
        }

        for c in stack.iter().rev() {
            if c.is_connected() {
                continue;
            }
            let readonly = c.can_write.get() == Some(0);
            debug!(target: "stackbd::controlpath", layer = %c.layer_name(), readonly, "prepare");
            c.io.prepare(&self.next_for(c), readonly).await?;
            c.set_connected();
        }
        Ok(())
    }

    /// Graceful shutdown pass, walking outer-to-inner (the reverse of
    /// prepare). A context that already failed refuses further work; a
    /// layer failing here marks its context failed and stops the walk.
    pub async fn finalize(&self, ctx: &Arc<Context>) -> Result<(), Errno> {
        let mut current = Some(ctx.clone());
        while let Some(c) = current {
            if c.is_failed() {
                return Err(Errno::Shutdown);
            }
            if c.is_connected() {
                debug!(target: "stackbd::controlpath", layer = %c.layer_name(), "finalize");
                if let Err(e) = c.io.finalize(&self.next_for(&c)).await {
                    c.set_failed();
                    return Err(e);
                }
                c.clear_connected();
            }
            current = c.index().checked_sub(1).and_then(|i| self.context(i));
        }
        Ok(())
    }

    /// Release the chain's handles, walking outer-to-inner (the reverse of
    /// the open sequence). Each layer's handle is dropped once the last
    /// reference to its context goes away.
    pub fn close(&self, ctx: &Arc<Context>) {
        let mut current = Some(ctx.clone());
        while let Some(c) = current {
            debug_assert!(c.is_open());
            debug!(target: "stackbd::controlpath", layer = %c.layer_name(), "close");
            self.clear_context(c.index());
            c.mark_closed();
            current = c.index().checked_sub(1).and_then(|i| self.context(i));
        }
    }

    /// Tear down layer `i`'s context (if any) and establish a fresh,
    /// prepared one. On failure the partially created context is finalised
    /// and closed before the error propagates.
    pub async fn reopen(&self, i: usize, readonly: bool, exportname: &str) -> Result<(), Errno> {
        debug!(
            target: "stackbd::controlpath",
            layer = %self.chain().entry(i).name(),
            readonly,
            exportname,
            "reopen"
        );
        if let Some(c) = self.context(i) {
            self.finalize(&c).await?;
            self.close(&c);
        }
        let ctx = self.open_layer(i, readonly, exportname).await?;
        if let Err(e) = self.prepare(&ctx).await {
            let _ = self.finalize(&ctx).await;
            self.close(&ctx);
            return Err(e);
        }
        Ok(())
    }

    // ---- Export listing ---------------------------------------------------

    /// List layer `i`'s exports. Called with no open context for the layer.
    ///
    /// Over-length names are dropped; an empty answer is replaced by an
    /// entry for the layer's default export, so a client always has
    /// something to pick.
    pub async fn list_exports(&self, i: usize, readonly: bool) -> Result<Vec<Export>, Errno> {
        let entry = self.chain().entry(i);
        debug!(
            target: "stackbd::controlpath",
            layer = %entry.name(),
            readonly,
            tls = self.using_tls(),
            "list_exports"
        );
        debug_assert!(self.context(i).is_none());

        let next = self.next_for_layer(i);
        let mut exports = match entry.layer().list_exports(&next, readonly).await {
            Ok(exports) => exports,
            Err(e) => {
                debug!(target: "stackbd::controlpath", layer = %entry.name(), "list_exports failed");
                return Err(e);
            }
        };
        exports.retain(|e| e.name.len() <= MAX_STRING);
        if exports.is_empty() {
            if let Some(name) = self.default_export(i, readonly).await {
                exports.push(Export::named(name));
            }
        }
        debug!(
            target: "stackbd::controlpath",
            layer = %entry.name(),
            count = exports.len(),
            "list_exports returned"
        );
        Ok(exports)
    }

    /// Layer `i`'s default-export name, memoised per connection.
    ///
    /// Caching is best effort; over-length answers are treated as absent.
    pub async fn default_export(&self, i: usize, readonly: bool) -> Option<String> {
        let entry = self.chain().entry(i);
        debug!(
            target: "stackbd::controlpath",
            layer = %entry.name(),
            readonly,
            tls = self.using_tls(),
            "default_export"
        );

        if let Some(name) = self.default_export_memo(i) {
            return Some(name);
        }

        let next = self.next_for_layer(i);
        let name = entry.layer().default_export(&next, readonly).await?;
        if name.len() > MAX_STRING {
            debug!(
                target: "stackbd::controlpath",
                layer = %entry.name(),
                "default_export: ignoring over-length string"
            );
            return None;
        }
        self.memoize_default_export(i, &name);
        Some(name)
    }

    // ---- Capability resolver ----------------------------------------------

    fn connected(&self, ctx: &Context) -> Result<(), Errno> {
        if !ctx.is_connected() || ctx.is_failed() {
            warn!(
                layer = %ctx.layer_name(),
                "call on a context outside its connected window"
            );
            return Err(Errno::Shutdown);
        }
        Ok(())
    }

    /// Export description; unlike the capabilities this may legitimately
    /// change between calls, so it is never cached.
    pub async fn export_description(&self, ctx: &Arc<Context>) -> Option<String> {
        self.connected(ctx).ok()?;
        debug!(target: "stackbd::controlpath", layer = %ctx.layer_name(), "export_description");
        let s = ctx.io.export_description(&self.next_for(ctx)).await?;
        if s.len() > MAX_STRING {
            debug!(
                target: "stackbd::controlpath",
                layer = %ctx.layer_name(),
                "export_description: ignoring over-length string"
            );
            return None;
        }
        Some(s)
    }

    /// Export size, cached on first success and reused by every range
    /// check until the context is closed.
    pub async fn get_size(&self, ctx: &Arc<Context>) -> Result<u64, Errno> {
        self.connected(ctx)?;
        if let Some(size) = ctx.cached_size() {
            return Ok(size);
        }
        debug!(target: "stackbd::controlpath", layer = %ctx.layer_name(), "get_size");
        let size = ctx.io.get_size(&self.next_for(ctx)).await?;
        if size > i64::MAX as u64 {
            error!(layer = %ctx.layer_name(), size, "export size exceeds i64::MAX");
            return Err(Errno::Inval);
        }
        ctx.set_size(size);
        Ok(size)
    }

    pub async fn can_write(&self, ctx: &Arc<Context>) -> Result<bool, Errno> {
        self.connected(ctx)?;
        if let Some(v) = ctx.can_write.get() {
            return Ok(v != 0);
        }
        debug!(target: "stackbd::controlpath", layer = %ctx.layer_name(), "can_write");
        let v = ctx.io.can_write(&self.next_for(ctx)).await?;
        ctx.can_write.set(i8::from(v));
        Ok(v)
    }

    pub async fn can_flush(&self, ctx: &Arc<Context>) -> Result<bool, Errno> {
        self.connected(ctx)?;
        if let Some(v) = ctx.can_flush.get() {
            return Ok(v != 0);
        }
        debug!(target: "stackbd::controlpath", layer = %ctx.layer_name(), "can_flush");
        let v = ctx.io.can_flush(&self.next_for(ctx)).await?;
        ctx.can_flush.set(i8::from(v));
        Ok(v)
    }

    pub async fn is_rotational(&self, ctx: &Arc<Context>) -> Result<bool, Errno> {
        self.connected(ctx)?;
        if let Some(v) = ctx.is_rotational.get() {
            return Ok(v != 0);
        }
        debug!(target: "stackbd::controlpath", layer = %ctx.layer_name(), "is_rotational");
        let v = ctx.io.is_rotational(&self.next_for(ctx)).await?;
        ctx.is_rotational.set(i8::from(v));
        Ok(v)
    }

    /// Trim requires writability regardless of what the layer claims.
    pub async fn can_trim(&self, ctx: &Arc<Context>) -> Result<bool, Errno> {
        self.connected(ctx)?;
        if let Some(v) = ctx.can_trim.get() {
            return Ok(v != 0);
        }
        debug!(target: "stackbd::controlpath", layer = %ctx.layer_name(), "can_trim");
        if !self.can_write(ctx).await? {
            ctx.can_trim.set(0);
            return Ok(false);
        }
        let v = ctx.io.can_trim(&self.next_for(ctx)).await?;
        ctx.can_trim.set(i8::from(v));
        Ok(v)
    }

    /// Zeroing requires writability regardless of what the layer claims.
    pub async fn can_zero(&self, ctx: &Arc<Context>) -> Result<ZeroMode, Errno> {
        self.connected(ctx)?;
        if let Some(v) = ctx.can_zero.get() {
            return Ok(ZeroMode::from_raw(v));
        }
        debug!(target: "stackbd::controlpath", layer = %ctx.layer_name(), "can_zero");
        if !self.can_write(ctx).await? {
            ctx.can_zero.set(ZeroMode::None as i8);
            return Ok(ZeroMode::None);
        }
        let mode = ctx.io.can_zero(&self.next_for(ctx)).await?;
        ctx.can_zero.set(mode as i8);
        Ok(mode)
    }

    /// Fast zero requires some zero support to begin with.
    pub async fn can_fast_zero(&self, ctx: &Arc<Context>) -> Result<bool, Errno> {
        self.connected(ctx)?;
        if let Some(v) = ctx.can_fast_zero.get() {
            return Ok(v != 0);
        }
        debug!(target: "stackbd::controlpath", layer = %ctx.layer_name(), "can_fast_zero");
        if self.can_zero(ctx).await? < ZeroMode::Emulate {
            ctx.can_fast_zero.set(0);
            return Ok(false);
        }
        let v = ctx.io.can_fast_zero(&self.next_for(ctx)).await?;
        ctx.can_fast_zero.set(i8::from(v));
        Ok(v)
    }

    /// FUA requires writability regardless of what the layer claims.
    pub async fn can_fua(&self, ctx: &Arc<Context>) -> Result<FuaMode, Errno> {
        self.connected(ctx)?;
        if let Some(v) = ctx.can_fua.get() {
            return Ok(FuaMode::from_raw(v));
        }
        debug!(target: "stackbd::controlpath", layer = %ctx.layer_name(), "can_fua");
        if !self.can_write(ctx).await? {
            ctx.can_fua.set(FuaMode::None as i8);
            return Ok(FuaMode::None);
        }
        let mode = ctx.io.can_fua(&self.next_for(ctx)).await?;
        ctx.can_fua.set(mode as i8);
        Ok(mode)
    }

    pub async fn can_multi_conn(&self, ctx: &Arc<Context>) -> Result<bool, Errno> {
        self.connected(ctx)?;
        if let Some(v) = ctx.can_multi_conn.get() {
            return Ok(v != 0);
        }
        debug!(target: "stackbd::controlpath", layer = %ctx.layer_name(), "can_multi_conn");
        let v = ctx.io.can_multi_conn(&self.next_for(ctx)).await?;
        ctx.can_multi_conn.set(i8::from(v));
        Ok(v)
    }

    pub async fn can_extents(&self, ctx: &Arc<Context>) -> Result<bool, Errno> {
        self.connected(ctx)?;
        if let Some(v) = ctx.can_extents.get() {
            return Ok(v != 0);
        }
        debug!(target: "stackbd::controlpath", layer = %ctx.layer_name(), "can_extents");
        let v = ctx.io.can_extents(&self.next_for(ctx)).await?;
        ctx.can_extents.set(i8::from(v));
        Ok(v)
    }

    pub async fn can_cache(&self, ctx: &Arc<Context>) -> Result<CacheMode, Errno> {
        self.connected(ctx)?;
        if let Some(v) = ctx.can_cache.get() {
            return Ok(CacheMode::from_raw(v));
        }
        debug!(target: "stackbd::controlpath", layer = %ctx.layer_name(), "can_cache");
        let mode = ctx.io.can_cache(&self.next_for(ctx)).await?;
        ctx.can_cache.set(mode as i8);
        Ok(mode)
    }

    // ---- Data path --------------------------------------------------------

    /// Validate `[offset, offset + count)` against the cached export size.
    async fn check_range(&self, ctx: &Arc<Context>, offset: u64, count: u32) -> Result<(), Errno> {
        let size = self.get_size(ctx).await?;
        if count == 0 || offset > size || offset + count as u64 > size {
            warn!(
                target: "stackbd::datapath",
                layer = %ctx.layer_name(),
                offset,
                count,
                size,
                "request out of range"
            );
            return Err(Errno::Inval);
        }
        Ok(())
    }

    fn check_flags(&self, ctx: &Context, flags: u32, allowed: u32) -> Result<(), Errno> {
        if flags & !allowed != 0 {
            warn!(
                target: "stackbd::datapath",
                layer = %ctx.layer_name(),
                flags,
                allowed,
                "request carries flags the operation does not accept"
            );
            return Err(Errno::Inval);
        }
        Ok(())
    }

    async fn check_fua(&self, ctx: &Arc<Context>, flags: u32) -> Result<(), Errno> {
        if flags & FLAG_FUA != 0 && self.can_fua(ctx).await? == FuaMode::None {
            warn!(
                target: "stackbd::datapath",
                layer = %ctx.layer_name(),
                "FUA requested but the layer cannot honour it"
            );
            return Err(Errno::Inval);
        }
        Ok(())
    }

    /// Read `buf.len()` bytes at `offset`.
    pub async fn pread(
        &self,
        ctx: &Arc<Context>,
        buf: &mut [u8],
        offset: u64,
        flags: u32,
    ) -> Result<(), Errno> {
        self.connected(ctx)?;
        let count = u32::try_from(buf.len()).map_err(|_| Errno::Inval)?;
        self.check_range(ctx, offset, count).await?;
        self.check_flags(ctx, flags, 0)?;
        debug!(
            target: "stackbd::datapath",
            layer = %ctx.layer_name(),
            count,
            offset,
            "pread"
        );
        ctx.io.pread(&self.next_for(ctx), buf, offset, flags).await
    }

    /// Write `buf` at `offset`. Accepts the FUA flag.
    pub async fn pwrite(
        &self,
        ctx: &Arc<Context>,
        buf: &[u8],
        offset: u64,
        flags: u32,
    ) -> Result<(), Errno> {
        self.connected(ctx)?;
        if !self.can_write(ctx).await? {
            warn!(target: "stackbd::datapath", layer = %ctx.layer_name(), "pwrite on read-only chain");
            return Err(Errno::Inval);
        }
        let count = u32::try_from(buf.len()).map_err(|_| Errno::Inval)?;
        self.check_range(ctx, offset, count).await?;
        self.check_flags(ctx, flags, FLAG_FUA)?;
        self.check_fua(ctx, flags).await?;
        debug!(
            target: "stackbd::datapath",
            layer = %ctx.layer_name(),
            count,
            offset,
            fua = flags & FLAG_FUA != 0,
            "pwrite"
        );
        ctx.io.pwrite(&self.next_for(ctx), buf, offset, flags).await
    }

    /// Flush prior writes to stable storage. Accepts no flags.
    pub async fn flush(&self, ctx: &Arc<Context>, flags: u32) -> Result<(), Errno> {
        self.connected(ctx)?;
        if !self.can_flush(ctx).await? {
            warn!(target: "stackbd::datapath", layer = %ctx.layer_name(), "flush not supported");
            return Err(Errno::Inval);
        }
        self.check_flags(ctx, flags, 0)?;
        debug!(target: "stackbd::datapath", layer = %ctx.layer_name(), "flush");
        ctx.io.flush(&self.next_for(ctx), flags).await
    }

    /// Discard a range. Accepts the FUA flag.
    pub async fn trim(
        &self,
        ctx: &Arc<Context>,
        count: u32,
        offset: u64,
        flags: u32,
    ) -> Result<(), Errno> {
        self.connected(ctx)?;
        if !self.can_write(ctx).await? || !self.can_trim(ctx).await? {
            warn!(target: "stackbd::datapath", layer = %ctx.layer_name(), "trim not supported");
            return Err(Errno::Inval);
        }
        self.check_range(ctx, offset, count).await?;
        self.check_flags(ctx, flags, FLAG_FUA)?;
        self.check_fua(ctx, flags).await?;
        debug!(
            target: "stackbd::datapath",
            layer = %ctx.layer_name(),
            count,
            offset,
            fua = flags & FLAG_FUA != 0,
            "trim"
        );
        ctx.io.trim(&self.next_for(ctx), count, offset, flags).await
    }

    /// Write zeroes over a range. Accepts FUA, MAY_TRIM and FAST_ZERO.
    ///
    /// A fast-zero request is only dispatched when the layer advertised
    /// fast-zero support, and a "not supported" error is only tolerated on
    /// that path; anywhere else it is a layer bug and degrades to EIO.
    pub async fn zero(
        &self,
        ctx: &Arc<Context>,
        count: u32,
        offset: u64,
        flags: u32,
    ) -> Result<(), Errno> {
        self.connected(ctx)?;
        if !self.can_write(ctx).await? || self.can_zero(ctx).await? == ZeroMode::None {
            warn!(target: "stackbd::datapath", layer = %ctx.layer_name(), "zero not supported");
            return Err(Errno::Inval);
        }
        self.check_range(ctx, offset, count).await?;
        self.check_flags(ctx, flags, FLAG_FUA | FLAG_MAY_TRIM | FLAG_FAST_ZERO)?;
        self.check_fua(ctx, flags).await?;
        let fast = flags & FLAG_FAST_ZERO != 0;
        if fast && !self.can_fast_zero(ctx).await? {
            warn!(
                target: "stackbd::datapath",
                layer = %ctx.layer_name(),
                "fast zero requested but the layer cannot honour it"
            );
            return Err(Errno::Inval);
        }
        debug!(
            target: "stackbd::datapath",
            layer = %ctx.layer_name(),
            count,
            offset,
            may_trim = flags & FLAG_MAY_TRIM != 0,
            fua = flags & FLAG_FUA != 0,
            fast,
            "zero"
        );
        match ctx.io.zero(&self.next_for(ctx), count, offset, flags).await {
            Err(Errno::NotSup) if !fast => {
                error!(
                    layer = %ctx.layer_name(),
                    "layer returned \"not supported\" from a zero without the fast-zero flag"
                );
                Err(Errno::Io)
            }
            r => r,
        }
    }

    /// Describe the extents of `[offset, offset + count)`. Accepts REQ_ONE.
    ///
    /// When the layer does not support extents queries the whole range is
    /// reported as allocated data, the safe worst case.
    pub async fn extents(
        &self,
        ctx: &Arc<Context>,
        count: u32,
        offset: u64,
        flags: u32,
        extents: &mut ExtentList,
    ) -> Result<(), Errno> {
        self.connected(ctx)?;
        self.check_range(ctx, offset, count).await?;
        self.check_flags(ctx, flags, FLAG_REQ_ONE)?;
        let can = self.can_extents(ctx).await?;
        debug!(
            target: "stackbd::datapath",
            layer = %ctx.layer_name(),
            count,
            offset,
            req_one = flags & FLAG_REQ_ONE != 0,
            "extents"
        );
        if !can {
            return extents.add(offset, count as u64, 0);
        }
        ctx.io
            .extents(&self.next_for(ctx), count, offset, flags, extents)
            .await
    }

    /// Prefetch a range. Accepts no flags.
    ///
    /// With `CacheMode::Emulate` the dispatcher itself issues reads into a
    /// throwaway buffer, bounded by the maximum request size.
    pub async fn cache(
        &self,
        ctx: &Arc<Context>,
        count: u32,
        offset: u64,
        flags: u32,
    ) -> Result<(), Errno> {
        self.connected(ctx)?;
        let mode = self.can_cache(ctx).await?;
        if mode == CacheMode::None {
            warn!(target: "stackbd::datapath", layer = %ctx.layer_name(), "cache not supported");
            return Err(Errno::Inval);
        }
        self.check_range(ctx, offset, count).await?;
        self.check_flags(ctx, flags, 0)?;
        debug!(
            target: "stackbd::datapath",
            layer = %ctx.layer_name(),
            count,
            offset,
            "cache"
        );
        if mode == CacheMode::Emulate {
            let mut sink = vec![0u8; count.min(MAX_REQUEST_SIZE) as usize];
            let mut remaining = count;
            let mut pos = offset;
            while remaining > 0 {
                let limit = remaining.min(sink.len() as u32) as usize;
                self.pread(ctx, &mut sink[..limit], pos, 0).await?;
                remaining -= limit as u32;
                pos += limit as u64;
            }
            return Ok(());
        }
        ctx.io.cache(&self.next_for(ctx), count, offset, flags).await
    }
}
