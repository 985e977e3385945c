//! Optional observability hooks (low-cardinality counters and spans).
//! No-ops by default; integrations may register a global observer to emit
//! metrics and traces via tracing or OpenTelemetry backends.

use std::any::Any;
use std::sync::OnceLock;

/// Counter and span callbacks invoked on repository operations.
pub trait RepoObserver: Send + Sync {
    /// Plaintext bytes accepted by save operations.
    fn saved_bytes(&self, _n: u64) {}
    /// Plaintext bytes returned by load operations.
    fn loaded_bytes(&self, _n: u64) {}
    /// Blobs skipped because the index already knew them.
    fn duplicate_blobs(&self, _n: u64) {}
    /// Finished packs written to the store, by size.
    fn pack_bytes(&self, _n: u64) {}
    /// Chunks emitted while ingesting a stream.
    fn chunks(&self, _n: u64) {}
    /// Start an optional span; dropping ends it.
    fn span(&self, _name: &'static str) -> RepoSpan {
        RepoSpan::noop()
    }
}

/// Guard object for optional spans. Holds a type-erased guard that exits on
/// drop.
pub struct RepoSpan {
    _guard: Option<Box<dyn Any + 'static>>,
}

impl RepoSpan {
    /// Create a no-op span guard.
    pub fn noop() -> Self {
        Self { _guard: None }
    }

    /// Create a span guard from an arbitrary guard object; dropping this
    /// drops the guard.
    pub fn from_guard<G: 'static>(guard: G) -> Self {
        Self { _guard: Some(Box::new(guard)) }
    }
}

struct NoopObserver;
impl RepoObserver for NoopObserver {}

static NOOP_OBSERVER: NoopObserver = NoopObserver;
static OBSERVER: OnceLock<&'static dyn RepoObserver> = OnceLock::new();

/// Register a global observer for repository metrics and spans (optional).
/// Safe to call at most once; subsequent calls are ignored.
pub fn set_observer(observer: &'static dyn RepoObserver) {
    let _ = OBSERVER.set(observer);
}

pub(crate) fn observer() -> &'static dyn RepoObserver {
    match OBSERVER.get() {
        Some(o) => *o,
        None => &NOOP_OBSERVER,
    }
}
