//! Offset-window filter.
//!
//! Serves a sub-range of the inner export: every request is shifted by a
//! fixed byte offset, and the advertised size shrinks to the window. Extents
//! answers from the inner layer are rebuilt with the shift removed.

use async_trait::async_trait;
use tracing::error;

use crate::chain::Next;
use crate::error::Errno;
use crate::extents::ExtentList;
use crate::layer::{Layer, LayerIo, LayerKind};

/// The `offset` filter: exposes `[offset, offset + range)` of the inner
/// export, or everything from `offset` onward when `range` is `None`.
pub struct OffsetLayer {
    offset: u64,
    range: Option<u64>,
}

impl OffsetLayer {
    pub fn new(offset: u64, range: Option<u64>) -> Self {
        Self { offset, range }
    }
}

#[async_trait]
impl Layer for OffsetLayer {
    fn name(&self) -> &str {
        "offset"
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
        Ok(Box::new(OffsetIo {
            shift: self.offset,
            range: self.range,
        }))
    }
}

struct OffsetIo {
    shift: u64,
    range: Option<u64>,
}

#[async_trait]
impl LayerIo for OffsetIo {
    async fn prepare(&self, next: &Next<'_>, _readonly: bool) -> Result<(), Errno> {
        let inner = next.get_size().await?;
        let window_end = self.shift + self.range.unwrap_or(0);
        if inner < self.shift || inner < window_end {
            error!(
                inner,
                offset = self.shift,
                range = self.range,
                "window extends beyond the inner export"
            );
            return Err(Errno::Inval);
        }
        Ok(())
    }

    async fn get_size(&self, next: &Next<'_>) -> Result<u64, Errno> {
        let inner = next.get_size().await?;
        Ok(self.range.unwrap_or(inner.saturating_sub(self.shift)))
    }

    async fn pread(
        &self,
        next: &Next<'_>,
        buf: &mut [u8],
        offset: u64,
        flags: u32,
    ) -> Result<(), Errno> {
        next.pread(buf, offset + self.shift, flags).await
    }

    async fn pwrite(
        &self,
        next: &Next<'_>,
        buf: &[u8],
        offset: u64,
        flags: u32,
    ) -> Result<(), Errno> {
        next.pwrite(buf, offset + self.shift, flags).await
    }

    async fn trim(
        &self,
        next: &Next<'_>,
        count: u32,
        offset: u64,
        flags: u32,
    ) -> Result<(), Errno> {
        next.trim(count, offset + self.shift, flags).await
    }

    async fn zero(
        &self,
        next: &Next<'_>,
        count: u32,
        offset: u64,
        flags: u32,
    ) -> Result<(), Errno> {
        next.zero(count, offset + self.shift, flags).await
    }

    async fn cache(
        &self,
        next: &Next<'_>,
        count: u32,
        offset: u64,
        flags: u32,
    ) -> Result<(), Errno> {
        next.cache(count, offset + self.shift, flags).await
    }

    async fn extents(
        &self,
        next: &Next<'_>,
        count: u32,
        offset: u64,
        flags: u32,
        extents: &mut ExtentList,
    ) -> Result<(), Errno> {
        // Query the inner layer over the shifted window, then replay the
        // records with the shift removed.
        let start = offset + self.shift;
        let mut inner = ExtentList::new(start, start + count as u64)?;
        next.extents(count, start, flags, &mut inner).await?;
        for rec in inner.records() {
            extents.add(rec.offset - self.shift, rec.length, rec.flags)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::chain::{Chain, Connection};
    use crate::extents::{EXTENT_HOLE, EXTENT_ZERO};
    use crate::layers::memory::PAGE_SIZE;
    use crate::layers::MemoryLayer;

    const PAGE: u64 = PAGE_SIZE as u64;

    async fn open_window(
        inner_pages: u64,
        offset: u64,
        range: Option<u64>,
    ) -> (Connection, Arc<crate::chain::Context>) {
        let chain = Chain::build(
            Arc::new(MemoryLayer::new(PAGE * inner_pages)),
            [Arc::new(OffsetLayer::new(offset, range)) as Arc<dyn Layer>],
        )
        .unwrap();
        let conn = Connection::new(chain);
        let ctx = conn.open_chain(false, "").await.unwrap();
        conn.prepare(&ctx).await.unwrap();
        (conn, ctx)
    }

    #[tokio::test]
    async fn size_shrinks_to_the_window() {
        let (conn, ctx) = open_window(4, PAGE, None).await;
        assert_eq!(conn.get_size(&ctx).await.unwrap(), PAGE * 3);

        let (conn, ctx) = open_window(4, PAGE, Some(PAGE)).await;
        assert_eq!(conn.get_size(&ctx).await.unwrap(), PAGE);
    }

    #[tokio::test]
    async fn window_beyond_inner_size_fails_prepare() {
        let chain = Chain::build(
            Arc::new(MemoryLayer::new(PAGE)),
            [Arc::new(OffsetLayer::new(PAGE * 2, None)) as Arc<dyn Layer>],
        )
        .unwrap();
        let conn = Connection::new(chain);
        let ctx = conn.open_chain(false, "").await.unwrap();
        assert_eq!(conn.prepare(&ctx).await.unwrap_err(), Errno::Inval);
    }

    #[tokio::test]
    async fn io_is_shifted() {
        let (conn, ctx) = open_window(4, PAGE, None).await;

        conn.pwrite(&ctx, b"shifted", 10, 0).await.unwrap();

        let mut buf = [0u8; 7];
        conn.pread(&ctx, &mut buf, 10, 0).await.unwrap();
        assert_eq!(&buf, b"shifted");

        // The write really landed one page in: the first window byte is
        // still a hole.
        let mut probe = [0xFFu8; 1];
        conn.pread(&ctx, &mut probe, PAGE + 10, 0).await.unwrap();
        assert_eq!(probe, [0u8; 1]);
    }

    #[tokio::test]
    async fn extents_are_shifted_back() {
        let (conn, ctx) = open_window(4, PAGE, None).await;

        // Allocate the page at window offset 0 (inner page 1).
        conn.pwrite(&ctx, &[1u8; 1], 0, 0).await.unwrap();

        let mut exts = ExtentList::new(0, PAGE * 2).unwrap();
        conn.extents(&ctx, PAGE as u32 * 2, 0, 0, &mut exts)
            .await
            .unwrap();
        let records = exts.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].offset, 0);
        assert_eq!(records[0].length, PAGE);
        assert_eq!(records[0].flags, 0);
        assert_eq!(records[1].flags, EXTENT_HOLE | EXTENT_ZERO);
    }
}
