//! Chain assembly and the per-connection dispatcher.
//!
//! A [`Chain`] is the immutable, ordered composition of one plugin and zero
//! or more filters, assembled once at startup. Each client connection gets a
//! [`Connection`] over the chain; all per-connection mutable state lives
//! there and in its [`Context`]s, so the chain itself can be shared freely
//! across connection tasks.

mod connection;
mod dispatch;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::debug;

use crate::error::Error;
use crate::layer::{valid_layer_name, Layer, LayerKind, ThreadModel};

pub use connection::{Connection, Context, Next};

/// A registered layer: the layer itself plus its immutable chain metadata.
pub struct LayerEntry {
    layer: Arc<dyn Layer>,
    name: String,
    filename: String,
    kind: LayerKind,
    i: usize,
}

impl LayerEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    /// Position in the chain: 0 is the innermost plugin.
    pub fn index(&self) -> usize {
        self.i
    }

    pub(crate) fn layer(&self) -> &Arc<dyn Layer> {
        &self.layer
    }
}

/// The ordered composition of one plugin and zero or more filters.
pub struct Chain {
    entries: Vec<Arc<LayerEntry>>,
    /// Held shared for the duration of any layer callback; held exclusively
    /// by [`Chain::unload_all`], which therefore excludes all callbacks.
    unload_lock: RwLock<()>,
    unloaded: AtomicBool,
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("len", &self.entries.len())
            .field("unloaded", &self.unloaded.load(Ordering::Relaxed))
            .finish()
    }
}

impl Chain {
    /// Assemble a chain from its innermost plugin and its filters, given
    /// outermost first (the order they would appear on a command line).
    ///
    /// Validates each layer's name and kind, assigns positions, and calls
    /// every layer's `load` hook innermost first.
    pub fn build(
        plugin: Arc<dyn Layer>,
        filters: impl IntoIterator<Item = Arc<dyn Layer>>,
    ) -> Result<Arc<Self>, Error> {
        let mut layers: Vec<Arc<dyn Layer>> = vec![plugin];
        let mut outer: Vec<_> = filters.into_iter().collect();
        outer.reverse();
        layers.extend(outer);

        let mut entries = Vec::with_capacity(layers.len());
        for (i, layer) in layers.into_iter().enumerate() {
            let name = layer.name().to_string();
            if !valid_layer_name(&name) {
                return Err(Error::InvalidLayerName { name });
            }
            let expected = if i == 0 {
                LayerKind::Plugin
            } else {
                LayerKind::Filter
            };
            if layer.kind() != expected {
                return Err(Error::MisplacedLayer {
                    name,
                    kind: if layer.kind() == LayerKind::Plugin {
                        "plugin"
                    } else {
                        "filter"
                    },
                    index: i,
                });
            }
            let filename = layer.filename().to_string();
            debug!(
                target: "stackbd::controlpath",
                layer = %name,
                kind = %layer.kind(),
                filename = %filename,
                index = i,
                "registering layer"
            );
            entries.push(Arc::new(LayerEntry {
                layer,
                name,
                filename,
                kind: expected,
                i,
            }));
        }

        for entry in &entries {
            debug!(target: "stackbd::controlpath", layer = %entry.name(), "load");
            entry.layer.load();
        }

        Ok(Arc::new(Self {
            entries,
            unload_lock: RwLock::new(()),
            unloaded: AtomicBool::new(false),
        }))
    }

    /// Number of layers in the chain.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, i: usize) -> &Arc<LayerEntry> {
        &self.entries[i]
    }

    /// The outermost layer.
    pub fn top(&self) -> &Arc<LayerEntry> {
        &self.entries[self.entries.len() - 1]
    }

    /// Position of the outermost layer, the usual starting point for
    /// export listing and default-export resolution.
    pub fn top_index(&self) -> usize {
        self.entries.len() - 1
    }

    /// The most restrictive thread model any layer declares.
    pub fn thread_model(&self) -> ThreadModel {
        self.entries
            .iter()
            .map(|e| e.layer.thread_model())
            .min()
            .unwrap_or(ThreadModel::Parallel)
    }

    /// Take the shared side of the unload lock for the duration of a batch
    /// of layer callbacks. Callers serving a connection hold this across
    /// each request so that `unload_all` cannot run mid-callback.
    pub async fn lock_callbacks(&self) -> RwLockReadGuard<'_, ()> {
        self.unload_lock.read().await
    }

    /// Run every layer's `unload` hook, outermost first, excluding all
    /// other layer callbacks for the duration. Idempotent.
    pub async fn unload_all(&self) {
        if self.unloaded.swap(true, Ordering::SeqCst) {
            return;
        }
        let _guard = self.unload_lock.write().await;
        for entry in self.entries.iter().rev() {
            debug!(
                target: "stackbd::controlpath",
                layer = %entry.name(),
                kind = %entry.kind(),
                "unload"
            );
            entry.layer.unload();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Errno;
    use crate::layer::LayerIo;
    use async_trait::async_trait;

    struct NullLayer {
        name: &'static str,
        kind: LayerKind,
        model: ThreadModel,
    }

    struct NullIo;

    #[async_trait]
    impl LayerIo for NullIo {}

    #[async_trait]
    impl Layer for NullLayer {
        fn name(&self) -> &str {
            self.name
        }

        fn kind(&self) -> LayerKind {
            self.kind
        }

        fn thread_model(&self) -> ThreadModel {
            self.model
        }

        async fn open(
            &self,
            _next: &Next<'_>,
            _readonly: bool,
            _exportname: &str,
        ) -> Result<Box<dyn LayerIo>, Errno> {
            Ok(Box::new(NullIo))
        }
    }

    fn plugin(name: &'static str) -> Arc<dyn Layer> {
        Arc::new(NullLayer {
            name,
            kind: LayerKind::Plugin,
            model: ThreadModel::Parallel,
        })
    }

    fn filter(name: &'static str, model: ThreadModel) -> Arc<dyn Layer> {
        Arc::new(NullLayer {
            name,
            kind: LayerKind::Filter,
            model,
        })
    }

    #[test]
    fn build_assigns_positions_inner_to_outer() {
        let chain = Chain::build(
            plugin("base"),
            [
                filter("outer", ThreadModel::Parallel),
                filter("mid", ThreadModel::Parallel),
            ],
        )
        .unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.entry(0).name(), "base");
        assert_eq!(chain.entry(1).name(), "mid");
        assert_eq!(chain.entry(2).name(), "outer");
        assert_eq!(chain.top().name(), "outer");
        for i in 0..chain.len() {
            assert_eq!(chain.entry(i).index(), i);
        }
    }

    #[test]
    fn build_rejects_bad_names() {
        let err = Chain::build(plugin("-bad"), []).unwrap_err();
        assert!(matches!(err, Error::InvalidLayerName { .. }));
    }

    #[test]
    fn build_rejects_misplaced_kinds() {
        let err = Chain::build(filter("f", ThreadModel::Parallel), []).unwrap_err();
        assert!(matches!(err, Error::MisplacedLayer { .. }));

        let err = Chain::build(plugin("base"), [plugin("other")]).unwrap_err();
        assert!(matches!(err, Error::MisplacedLayer { .. }));
    }

    #[test]
    fn thread_model_takes_the_most_restrictive() {
        let chain = Chain::build(
            plugin("base"),
            [
                filter("a", ThreadModel::Parallel),
                filter("b", ThreadModel::SerializeRequests),
            ],
        )
        .unwrap();
        assert_eq!(chain.thread_model(), ThreadModel::SerializeRequests);
    }

    #[tokio::test]
    async fn unload_is_idempotent() {
        let chain = Chain::build(plugin("base"), []).unwrap();
        chain.unload_all().await;
        chain.unload_all().await;
    }
}
