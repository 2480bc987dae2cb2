//! Write-veto filter.
//!
//! Forces the chain below it open read-only and answers `can_write` with no,
//! which makes the dispatcher collapse trim, zero and FUA support as well.

use async_trait::async_trait;

use crate::chain::Next;
use crate::error::Errno;
use crate::layer::{Layer, LayerIo, LayerKind};

/// The `readonly` filter.
pub struct ReadonlyLayer;

#[async_trait]
impl Layer for ReadonlyLayer {
    fn name(&self) -> &str {
        "readonly"
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Filter
    }

    async fn open(
        &self,
        next: &Next<'_>,
        _readonly: bool,
        exportname: &str,
    ) -> Result<Box<dyn LayerIo>, Errno> {
        next.open(true, exportname).await?;
        Ok(Box::new(ReadonlyIo))
    }
}

struct ReadonlyIo;

#[async_trait]
impl LayerIo for ReadonlyIo {
    async fn can_write(&self, _next: &Next<'_>) -> Result<bool, Errno> {
        Ok(false)
    }

    // The dispatcher refuses writes before they get here; these answers
    // cover a buggy outer layer calling in regardless.
    async fn pwrite(
        &self,
        _next: &Next<'_>,
        _buf: &[u8],
        _offset: u64,
        _flags: u32,
    ) -> Result<(), Errno> {
        Err(Errno::ReadOnly)
    }

    async fn trim(
        &self,
        _next: &Next<'_>,
        _count: u32,
        _offset: u64,
        _flags: u32,
    ) -> Result<(), Errno> {
        Err(Errno::ReadOnly)
    }

    async fn zero(
        &self,
        _next: &Next<'_>,
        _count: u32,
        _offset: u64,
        _flags: u32,
    ) -> Result<(), Errno> {
        Err(Errno::ReadOnly)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::chain::{Chain, Connection};
    use crate::layer::ZeroMode;
    use crate::layers::MemoryLayer;

    #[tokio::test]
    async fn vetoes_writes_and_coupled_capabilities() {
        let chain = Chain::build(
            Arc::new(MemoryLayer::new(4096)),
            [Arc::new(ReadonlyLayer) as Arc<dyn Layer>],
        )
        .unwrap();
        let conn = Connection::new(chain);
        let ctx = conn.open_chain(false, "").await.unwrap();
        conn.prepare(&ctx).await.unwrap();

        assert!(!conn.can_write(&ctx).await.unwrap());
        assert!(!conn.can_trim(&ctx).await.unwrap());
        assert_eq!(conn.can_zero(&ctx).await.unwrap(), ZeroMode::None);
        assert!(!conn.can_fast_zero(&ctx).await.unwrap());

        assert_eq!(
            conn.pwrite(&ctx, b"no", 0, 0).await.unwrap_err(),
            Errno::Inval
        );

        // Reads still flow through to the plugin.
        let mut buf = [0u8; 16];
        conn.pread(&ctx, &mut buf, 0, 0).await.unwrap();
        assert_eq!(buf, [0u8; 16]);
    }
}
