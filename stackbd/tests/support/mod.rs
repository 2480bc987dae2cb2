//! Instrumented layers for driving chains in tests.
//!
//! Shared between several integration-test binaries, so not every binary
//! touches every helper.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use stackbd::{
    CacheMode, Errno, Extent, ExtentList, FuaMode, Layer, LayerIo, LayerKind, Next, ZeroMode,
    FLAG_REQ_ONE,
};

/// Observable side effects of a mock layer.
#[derive(Default)]
pub struct Counters {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub prepares: AtomicUsize,
    pub finalizes: AtomicUsize,
    pub size_queries: AtomicUsize,
    pub write_queries: AtomicUsize,
    pub default_export_queries: AtomicUsize,
    pub flushes: AtomicUsize,
    pub trims: AtomicUsize,
    pub caches: AtomicUsize,
    pub open_names: Mutex<Vec<String>>,
    /// (offset, count) per pread.
    pub preads: Mutex<Vec<(u64, u32)>>,
    /// (offset, count, flags) per pwrite.
    pub pwrites: Mutex<Vec<(u64, u32, u32)>>,
    /// (offset, count, flags) per zero.
    pub zeros: Mutex<Vec<(u64, u32, u32)>>,
}

impl Counters {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Behaviour knobs for [`MockPlugin`]. Build one, tweak fields, wrap in an
/// `Arc`, and hand it to the plugin.
pub struct MockConfig {
    pub size: AtomicU64,
    pub writable: bool,
    pub flushable: bool,
    pub trimmable: bool,
    pub zero_mode: ZeroMode,
    pub fast_zero: bool,
    pub fua_mode: FuaMode,
    pub cache_mode: CacheMode,
    /// Absolute extent runs covering the device; `None` answers
    /// `can_extents` with no.
    pub extent_map: Option<Vec<Extent>>,
    /// Force every `zero` call to fail with this error.
    pub zero_error: Option<Errno>,
    pub fail_open: bool,
    pub fail_prepare: bool,
    pub fail_finalize: bool,
    pub default_export: Option<String>,
    pub counters: Counters,
}

impl MockConfig {
    pub fn new(size: u64) -> Self {
        Self {
            size: AtomicU64::new(size),
            writable: true,
            flushable: true,
            trimmable: true,
            zero_mode: ZeroMode::Native,
            fast_zero: true,
            fua_mode: FuaMode::Native,
            cache_mode: CacheMode::Native,
            extent_map: None,
            zero_error: None,
            fail_open: false,
            fail_prepare: false,
            fail_finalize: false,
            default_export: Some(String::new()),
            counters: Counters::default(),
        }
    }

    pub fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::SeqCst);
    }
}

/// Innermost test plugin with configurable capabilities and counters.
pub struct MockPlugin {
    cfg: Arc<MockConfig>,
}

impl MockPlugin {
    pub fn new(cfg: Arc<MockConfig>) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl Layer for MockPlugin {
    fn name(&self) -> &str {
        "mock"
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Plugin
    }

    async fn default_export(&self, _next: &Next<'_>, _readonly: bool) -> Option<String> {
        self.cfg
            .counters
            .default_export_queries
            .fetch_add(1, Ordering::SeqCst);
        self.cfg.default_export.clone()
    }

    async fn open(
        &self,
        _next: &Next<'_>,
        _readonly: bool,
        exportname: &str,
    ) -> Result<Box<dyn LayerIo>, Errno> {
        if self.cfg.fail_open {
            return Err(Errno::Io);
        }
        self.cfg.counters.opens.fetch_add(1, Ordering::SeqCst);
        self.cfg
            .counters
            .open_names
            .lock()
            .push(exportname.to_string());
        Ok(Box::new(MockIo {
            cfg: Arc::clone(&self.cfg),
        }))
    }
}

struct MockIo {
    cfg: Arc<MockConfig>,
}

impl Drop for MockIo {
    fn drop(&mut self) {
        self.cfg.counters.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LayerIo for MockIo {
    async fn prepare(&self, _next: &Next<'_>, _readonly: bool) -> Result<(), Errno> {
        self.cfg.counters.prepares.fetch_add(1, Ordering::SeqCst);
        if self.cfg.fail_prepare {
            return Err(Errno::Io);
        }
        Ok(())
    }

    async fn finalize(&self, _next: &Next<'_>) -> Result<(), Errno> {
        self.cfg.counters.finalizes.fetch_add(1, Ordering::SeqCst);
        if self.cfg.fail_finalize {
            return Err(Errno::Io);
        }
        Ok(())
    }

    async fn get_size(&self, _next: &Next<'_>) -> Result<u64, Errno> {
        self.cfg.counters.size_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.cfg.size.load(Ordering::SeqCst))
    }

    async fn can_write(&self, _next: &Next<'_>) -> Result<bool, Errno> {
        self.cfg
            .counters
            .write_queries
            .fetch_add(1, Ordering::SeqCst);
        Ok(self.cfg.writable)
    }

    async fn can_flush(&self, _next: &Next<'_>) -> Result<bool, Errno> {
        Ok(self.cfg.flushable)
    }

    async fn can_trim(&self, _next: &Next<'_>) -> Result<bool, Errno> {
        Ok(self.cfg.trimmable)
    }

    async fn can_zero(&self, _next: &Next<'_>) -> Result<ZeroMode, Errno> {
        Ok(self.cfg.zero_mode)
    }

    async fn can_fast_zero(&self, _next: &Next<'_>) -> Result<bool, Errno> {
        Ok(self.cfg.fast_zero)
    }

    async fn can_fua(&self, _next: &Next<'_>) -> Result<FuaMode, Errno> {
        Ok(self.cfg.fua_mode)
    }

    async fn can_extents(&self, _next: &Next<'_>) -> Result<bool, Errno> {
        Ok(self.cfg.extent_map.is_some())
    }

    async fn can_cache(&self, _next: &Next<'_>) -> Result<CacheMode, Errno> {
        Ok(self.cfg.cache_mode)
    }

    async fn pread(
        &self,
        _next: &Next<'_>,
        buf: &mut [u8],
        offset: u64,
        _flags: u32,
    ) -> Result<(), Errno> {
        self.cfg
            .counters
            .preads
            .lock()
            .push((offset, buf.len() as u32));
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = (offset + i as u64) as u8;
        }
        Ok(())
    }

    async fn pwrite(
        &self,
        _next: &Next<'_>,
        buf: &[u8],
        offset: u64,
        flags: u32,
    ) -> Result<(), Errno> {
        self.cfg
            .counters
            .pwrites
            .lock()
            .push((offset, buf.len() as u32, flags));
        Ok(())
    }

    async fn flush(&self, _next: &Next<'_>, _flags: u32) -> Result<(), Errno> {
        self.cfg.counters.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn trim(
        &self,
        _next: &Next<'_>,
        _count: u32,
        _offset: u64,
        _flags: u32,
    ) -> Result<(), Errno> {
        self.cfg.counters.trims.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn zero(
        &self,
        _next: &Next<'_>,
        count: u32,
        offset: u64,
        flags: u32,
    ) -> Result<(), Errno> {
        if let Some(err) = self.cfg.zero_error {
            return Err(err);
        }
        self.cfg.counters.zeros.lock().push((offset, count, flags));
        Ok(())
    }

    async fn extents(
        &self,
        _next: &Next<'_>,
        _count: u32,
        _offset: u64,
        flags: u32,
        extents: &mut ExtentList,
    ) -> Result<(), Errno> {
        let map = self.cfg.extent_map.as_ref().ok_or(Errno::Io)?;
        for rec in map {
            extents.add(rec.offset, rec.length, rec.flags)?;
            if flags & FLAG_REQ_ONE != 0 && !extents.is_empty() {
                break;
            }
        }
        Ok(())
    }

    async fn cache(
        &self,
        _next: &Next<'_>,
        _count: u32,
        _offset: u64,
        _flags: u32,
    ) -> Result<(), Errno> {
        self.cfg.counters.caches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Pass-through filter that counts opens/closes and can be told to fail its
/// open after the inner chain already opened.
pub struct PassFilter {
    pub fail_open: bool,
    pub fail_prepare: bool,
    pub counters: Arc<Counters>,
}

impl PassFilter {
    pub fn new() -> Self {
        Self {
            fail_open: false,
            fail_prepare: false,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn failing_open() -> Self {
        Self {
            fail_open: true,
            ..Self::new()
        }
    }

    pub fn failing_prepare() -> Self {
        Self {
            fail_prepare: true,
            ..Self::new()
        }
    }
}

impl Default for PassFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Layer for PassFilter {
    fn name(&self) -> &str {
        "pass"
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Filter
    }

    async fn open(
        &self,
        next: &Next<'_>,
        readonly: bool,
        exportname: &str,
    ) -> Result<Box<dyn LayerIo>, Errno> {
        next.open(readonly, exportname).await?;
        if self.fail_open {
            return Err(Errno::Io);
        }
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(PassIo {
            fail_prepare: self.fail_prepare,
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct PassIo {
    fail_prepare: bool,
    counters: Arc<Counters>,
}

impl Drop for PassIo {
    fn drop(&mut self) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LayerIo for PassIo {
    async fn prepare(&self, _next: &Next<'_>, _readonly: bool) -> Result<(), Errno> {
        self.counters.prepares.fetch_add(1, Ordering::SeqCst);
        if self.fail_prepare {
            return Err(Errno::Io);
        }
        Ok(())
    }

    async fn finalize(&self, _next: &Next<'_>) -> Result<(), Errno> {
        self.counters.finalizes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
