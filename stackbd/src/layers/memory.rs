//! Sparse in-memory plugin.
//!
//! Backs an export with a page map that only materialises written pages.
//! All connections to the same chain share the store, so writes made on one
//! connection are visible on every other, and the export honestly reports
//! `can_multi_conn`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::chain::Next;
use crate::error::Errno;
use crate::extents::{ExtentList, EXTENT_HOLE, EXTENT_ZERO};
use crate::layer::{CacheMode, FuaMode, Layer, LayerIo, LayerKind, ZeroMode};

/// Allocation granularity of the sparse store.
pub const PAGE_SIZE: usize = 4096;

type PageMap = HashMap<u64, Box<[u8; PAGE_SIZE]>>;

/// The `memory` plugin: a writable, sparse, volatile export.
pub struct MemoryLayer {
    size: u64,
    pages: Arc<RwLock<PageMap>>,
}

impl MemoryLayer {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            pages: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl Layer for MemoryLayer {
    fn name(&self) -> &str {
        "memory"
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Plugin
    }

    async fn open(
        &self,
        _next: &Next<'_>,
        _readonly: bool,
        _exportname: &str,
    ) -> Result<Box<dyn LayerIo>, Errno> {
        Ok(Box::new(MemoryIo {
            size: self.size,
            pages: Arc::clone(&self.pages),
        }))
    }
}

struct MemoryIo {
    size: u64,
    pages: Arc<RwLock<PageMap>>,
}

impl MemoryIo {
    /// Discard `[offset, offset + count)`: whole pages are dropped from the
    /// map, partial pages are zeroed in place.
    async fn punch(&self, count: u32, offset: u64) {
        let mut pages = self.pages.write().await;
        let mut remaining = count as usize;
        let mut pos = offset;
        while remaining > 0 {
            let page = pos / PAGE_SIZE as u64;
            let in_page = (pos % PAGE_SIZE as u64) as usize;
            let n = remaining.min(PAGE_SIZE - in_page);
            if in_page == 0 && n == PAGE_SIZE {
                pages.remove(&page);
            } else if let Some(buf) = pages.get_mut(&page) {
                buf[in_page..in_page + n].fill(0);
            }
            remaining -= n;
            pos += n as u64;
        }
    }
}

#[async_trait]
impl LayerIo for MemoryIo {
    async fn get_size(&self, _next: &Next<'_>) -> Result<u64, Errno> {
        Ok(self.size)
    }

    async fn export_description(&self, _next: &Next<'_>) -> Option<String> {
        Some(format!("sparse in-memory export ({} bytes)", self.size))
    }

    async fn can_write(&self, _next: &Next<'_>) -> Result<bool, Errno> {
        Ok(true)
    }

    async fn can_flush(&self, _next: &Next<'_>) -> Result<bool, Errno> {
        Ok(true)
    }

    async fn can_trim(&self, _next: &Next<'_>) -> Result<bool, Errno> {
        Ok(true)
    }

    async fn can_zero(&self, _next: &Next<'_>) -> Result<ZeroMode, Errno> {
        Ok(ZeroMode::Native)
    }

    async fn can_fast_zero(&self, _next: &Next<'_>) -> Result<bool, Errno> {
        // Dropping pages never degrades to a data write.
        Ok(true)
    }

    async fn can_fua(&self, _next: &Next<'_>) -> Result<FuaMode, Errno> {
        // Writes land in memory immediately; there is nothing left to force.
        Ok(FuaMode::Native)
    }

    async fn can_multi_conn(&self, _next: &Next<'_>) -> Result<bool, Errno> {
        Ok(true)
    }

    async fn can_extents(&self, _next: &Next<'_>) -> Result<bool, Errno> {
        Ok(true)
    }

    async fn can_cache(&self, _next: &Next<'_>) -> Result<CacheMode, Errno> {
        // There is no faster tier to prefetch into; let the dispatcher
        // satisfy cache requests with emulated reads.
        Ok(CacheMode::Emulate)
    }

    async fn pread(
        &self,
        _next: &Next<'_>,
        buf: &mut [u8],
        offset: u64,
        _flags: u32,
    ) -> Result<(), Errno> {
        let pages = self.pages.read().await;
        let mut filled = 0;
        let mut pos = offset;
        while filled < buf.len() {
            let page = pos / PAGE_SIZE as u64;
            let in_page = (pos % PAGE_SIZE as u64) as usize;
            let n = (buf.len() - filled).min(PAGE_SIZE - in_page);
            match pages.get(&page) {
                Some(data) => buf[filled..filled + n].copy_from_slice(&data[in_page..in_page + n]),
                None => buf[filled..filled + n].fill(0),
            }
            filled += n;
            pos += n as u64;
        }
        Ok(())
    }

    async fn pwrite(
        &self,
        _next: &Next<'_>,
        buf: &[u8],
        offset: u64,
        _flags: u32,
    ) -> Result<(), Errno> {
        let mut pages = self.pages.write().await;
        let mut written = 0;
        let mut pos = offset;
        while written < buf.len() {
            let page = pos / PAGE_SIZE as u64;
            let in_page = (pos % PAGE_SIZE as u64) as usize;
            let n = (buf.len() - written).min(PAGE_SIZE - in_page);
            let data = pages
                .entry(page)
                .or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
            data[in_page..in_page + n].copy_from_slice(&buf[written..written + n]);
            written += n;
            pos += n as u64;
        }
        Ok(())
    }

    async fn flush(&self, _next: &Next<'_>, _flags: u32) -> Result<(), Errno> {
        Ok(())
    }

    async fn trim(
        &self,
        _next: &Next<'_>,
        count: u32,
        offset: u64,
        _flags: u32,
    ) -> Result<(), Errno> {
        self.punch(count, offset).await;
        Ok(())
    }

    async fn zero(
        &self,
        _next: &Next<'_>,
        count: u32,
        offset: u64,
        _flags: u32,
    ) -> Result<(), Errno> {
        // Punching reads back as zeroes whether or not MAY_TRIM was set.
        self.punch(count, offset).await;
        Ok(())
    }

    async fn extents(
        &self,
        _next: &Next<'_>,
        count: u32,
        offset: u64,
        _flags: u32,
        extents: &mut ExtentList,
    ) -> Result<(), Errno> {
        let pages = self.pages.read().await;
        let first = offset / PAGE_SIZE as u64;
        let last = (offset + count as u64 - 1) / PAGE_SIZE as u64;
        for page in first..=last {
            let flags = if pages.contains_key(&page) {
                0
            } else {
                EXTENT_HOLE | EXTENT_ZERO
            };
            extents.add(page * PAGE_SIZE as u64, PAGE_SIZE as u64, flags)?;
        }
        Ok(())
    }
}
