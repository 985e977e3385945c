//! Observer bridging repository counters to tracing spans, with OTel-backed
//! counters behind the `otel` feature. Spans are best-effort.

use repository::{RepoObserver, RepoSpan};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

static INSTANCE: OnceLock<TracingRepoObserver> = OnceLock::new();

// Test-visible mirrors to assert increments in tests without exporter
// plumbing.
static SAVED_ACC: AtomicU64 = AtomicU64::new(0);
static LOADED_ACC: AtomicU64 = AtomicU64::new(0);
static DUP_ACC: AtomicU64 = AtomicU64::new(0);
static PACK_ACC: AtomicU64 = AtomicU64::new(0);
static CHUNK_ACC: AtomicU64 = AtomicU64::new(0);

#[cfg(feature = "otel")]
mod instruments {
    use once_cell::sync::OnceCell;
    use opentelemetry::global;
    use opentelemetry::metrics::{Counter, Meter, Unit};

    pub(super) struct Instruments {
        pub(super) saved_bytes: Counter<u64>,
        pub(super) loaded_bytes: Counter<u64>,
        pub(super) duplicate_blobs: Counter<u64>,
        pub(super) pack_bytes: Counter<u64>,
        pub(super) chunks: Counter<u64>,
    }

    static INSTR: OnceCell<Instruments> = OnceCell::new();

    pub(super) fn get() -> &'static Instruments {
        INSTR.get_or_init(|| {
            // Use the global meter provider (a no-op unless OTLP is set up).
            let meter: Meter = global::meter("holdfast.repository");
            Instruments {
                saved_bytes: meter
                    .u64_counter("repo.save.bytes")
                    .with_description("Plaintext bytes accepted by save()")
                    .with_unit(Unit::new("By"))
                    .init(),
                loaded_bytes: meter
                    .u64_counter("repo.load.bytes")
                    .with_description("Plaintext bytes returned by load_blob()")
                    .with_unit(Unit::new("By"))
                    .init(),
                duplicate_blobs: meter
                    .u64_counter("repo.save.duplicates")
                    .with_description("Blobs skipped as already indexed")
                    .init(),
                pack_bytes: meter
                    .u64_counter("repo.pack.bytes")
                    .with_description("Finished pack bytes written to the store")
                    .with_unit(Unit::new("By"))
                    .init(),
                chunks: meter
                    .u64_counter("repo.stream.chunks")
                    .with_description("Chunks emitted while ingesting streams")
                    .init(),
            }
        })
    }
}

/// Repository observer emitting tracing spans and counters.
#[derive(Clone, Copy)]
pub struct TracingRepoObserver;

impl RepoObserver for TracingRepoObserver {
    fn saved_bytes(&self, n: u64) {
        if n > 0 {
            SAVED_ACC.fetch_add(n, Ordering::Relaxed);
            #[cfg(feature = "otel")]
            instruments::get().saved_bytes.add(n, &[]);
        }
    }

    fn loaded_bytes(&self, n: u64) {
        if n > 0 {
            LOADED_ACC.fetch_add(n, Ordering::Relaxed);
            #[cfg(feature = "otel")]
            instruments::get().loaded_bytes.add(n, &[]);
        }
    }

    fn duplicate_blobs(&self, n: u64) {
        if n > 0 {
            DUP_ACC.fetch_add(n, Ordering::Relaxed);
            #[cfg(feature = "otel")]
            instruments::get().duplicate_blobs.add(n, &[]);
        }
    }

    fn pack_bytes(&self, n: u64) {
        if n > 0 {
            PACK_ACC.fetch_add(n, Ordering::Relaxed);
            #[cfg(feature = "otel")]
            instruments::get().pack_bytes.add(n, &[]);
        }
    }

    fn chunks(&self, n: u64) {
        if n > 0 {
            CHUNK_ACC.fetch_add(n, Ordering::Relaxed);
            #[cfg(feature = "otel")]
            instruments::get().chunks.add(n, &[]);
        }
    }

    fn span(&self, name: &'static str) -> RepoSpan {
        let span = tracing::span!(tracing::Level::INFO, "repo", op = name);
        RepoSpan::from_guard(span.entered())
    }
}

/// A `'static` instance suitable for [`repository::set_observer`].
pub fn global() -> &'static TracingRepoObserver {
    INSTANCE.get_or_init(|| TracingRepoObserver)
}

/// Snapshot of the test mirrors:
/// (saved bytes, loaded bytes, duplicate blobs, pack bytes, chunks).
pub fn snapshot_counters() -> (u64, u64, u64, u64, u64) {
    (
        SAVED_ACC.load(Ordering::Relaxed),
        LOADED_ACC.load(Ordering::Relaxed),
        DUP_ACC.load(Ordering::Relaxed),
        PACK_ACC.load(Ordering::Relaxed),
        CHUNK_ACC.load(Ordering::Relaxed),
    )
}
