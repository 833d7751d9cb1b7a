//! In-process client metrics
//!
//! Lock-free counters shared by the slab builder, the upload pipeline and the
//! transport router. Rendered in Prometheus text format for the end-of-command
//! summary.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::transport::Backend;

#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    units_committed: AtomicU64,
    bytes_encoded: AtomicU64,

    units_uploaded: AtomicU64,
    units_failed: AtomicU64,
    bytes_uploaded: AtomicU64,

    // indexed by Backend::index()
    transport_attempts: [AtomicU64; Backend::COUNT],
    transport_failures: [AtomicU64; Backend::COUNT],
    bytes_fetched: AtomicU64,

    cache_hits: AtomicU64,
    cache_misses: AtomicU64,

    started: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                units_committed: AtomicU64::new(0),
                bytes_encoded: AtomicU64::new(0),
                units_uploaded: AtomicU64::new(0),
                units_failed: AtomicU64::new(0),
                bytes_uploaded: AtomicU64::new(0),
                transport_attempts: Default::default(),
                transport_failures: Default::default(),
                bytes_fetched: AtomicU64::new(0),
                cache_hits: AtomicU64::new(0),
                cache_misses: AtomicU64::new(0),
                started: Instant::now(),
            }),
        }
    }

    // Slab building

    pub fn unit_committed(&self, raw_bytes: usize) {
        self.inner.units_committed.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_encoded
            .fetch_add(raw_bytes as u64, Ordering::Relaxed);
    }

    pub fn units_committed(&self) -> u64 {
        self.inner.units_committed.load(Ordering::Relaxed)
    }

    pub fn bytes_encoded(&self) -> u64 {
        self.inner.bytes_encoded.load(Ordering::Relaxed)
    }

    // Upload

    pub fn unit_uploaded(&self, size: usize) {
        self.inner.units_uploaded.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_uploaded
            .fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn unit_failed(&self) {
        self.inner.units_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn units_uploaded(&self) -> u64 {
        self.inner.units_uploaded.load(Ordering::Relaxed)
    }

    pub fn units_failed(&self) -> u64 {
        self.inner.units_failed.load(Ordering::Relaxed)
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.inner.bytes_uploaded.load(Ordering::Relaxed)
    }

    // Transport

    pub fn transport_attempt(&self, backend: Backend) {
        self.inner.transport_attempts[backend.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn transport_failure(&self, backend: Backend) {
        self.inner.transport_failures[backend.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn transport_attempts(&self, backend: Backend) -> u64 {
        self.inner.transport_attempts[backend.index()].load(Ordering::Relaxed)
    }

    pub fn transport_failures(&self, backend: Backend) -> u64 {
        self.inner.transport_failures[backend.index()].load(Ordering::Relaxed)
    }

    pub fn bytes_fetched(&self, size: usize) {
        self.inner
            .bytes_fetched
            .fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn total_bytes_fetched(&self) -> u64 {
        self.inner.bytes_fetched.load(Ordering::Relaxed)
    }

    // Cache

    pub fn cache_hit(&self) {
        self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_miss(&self) {
        self.inner.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hits(&self) -> u64 {
        self.inner.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.inner.cache_misses.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.inner.started.elapsed().as_secs()
    }

    /// One-line summary for logs
    pub fn summary(&self) -> String {
        format!(
            "units_committed={} bytes_encoded={} units_uploaded={} units_failed={} \
             bytes_fetched={} cache_hits={} cache_misses={}",
            self.units_committed(),
            self.bytes_encoded(),
            self.units_uploaded(),
            self.units_failed(),
            self.total_bytes_fetched(),
            self.cache_hits(),
            self.cache_misses(),
        )
    }

    /// Generate Prometheus-formatted metrics text
    pub fn to_prometheus(&self) -> String {
        let mut out = format!(
            "# HELP nilstore_units_committed_total Units committed by the engine\n\
             # TYPE nilstore_units_committed_total counter\n\
             nilstore_units_committed_total {}\n\
             \n\
             # HELP nilstore_bytes_encoded_total Raw bytes packed into units\n\
             # TYPE nilstore_bytes_encoded_total counter\n\
             nilstore_bytes_encoded_total {}\n\
             \n\
             # HELP nilstore_units_uploaded_total Units accepted by a provider\n\
             # TYPE nilstore_units_uploaded_total counter\n\
             nilstore_units_uploaded_total {}\n\
             \n\
             # HELP nilstore_units_failed_total Unit uploads that failed\n\
             # TYPE nilstore_units_failed_total counter\n\
             nilstore_units_failed_total {}\n\
             \n\
             # HELP nilstore_cache_hits_total Local cache hits\n\
             # TYPE nilstore_cache_hits_total counter\n\
             nilstore_cache_hits_total {}\n\
             \n\
             # HELP nilstore_cache_misses_total Local cache misses\n\
             # TYPE nilstore_cache_misses_total counter\n\
             nilstore_cache_misses_total {}\n\
             \n\
             # HELP nilstore_transport_attempts_total Transport attempts per backend\n\
             # TYPE nilstore_transport_attempts_total counter\n",
            self.units_committed(),
            self.bytes_encoded(),
            self.units_uploaded(),
            self.units_failed(),
            self.cache_hits(),
            self.cache_misses(),
        );
        for backend in Backend::ALL {
            let _ = writeln!(
                out,
                "nilstore_transport_attempts_total{{backend=\"{}\"}} {}",
                backend,
                self.transport_attempts(backend)
            );
        }
        out.push_str(
            "\n# HELP nilstore_transport_failures_total Failed transport attempts per backend\n\
             # TYPE nilstore_transport_failures_total counter\n",
        );
        for backend in Backend::ALL {
            let _ = writeln!(
                out,
                "nilstore_transport_failures_total{{backend=\"{}\"}} {}",
                backend,
                self.transport_failures(backend)
            );
        }
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
