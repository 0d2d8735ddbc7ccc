// Prometheus metrics definitions for the emcache service.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ── Gauges ───────────────────────────────────────────────────────

    /// Tokens currently sitting in the dispatcher's bucket.
    pub static ref TOKENS_AVAILABLE: IntGauge =
        IntGauge::new("emcache_tokens_available", "Tokens currently available").unwrap();

    /// Entries held by each store, by database and store name.
    pub static ref STORE_ENTRIES: IntGaugeVec = IntGaugeVec::new(
        Opts::new("emcache_store_entries", "Entries held in each store"),
        &["database", "store"],
    )
    .unwrap();

    // ── Counters ─────────────────────────────────────────────────────

    /// Refills discarded because the bucket was already full.
    pub static ref TOKENS_DROPPED_TOTAL: IntCounter = IntCounter::new(
        "emcache_tokens_dropped_total",
        "Refills discarded on a full bucket",
    )
    .unwrap();

    /// Tokens taken from the bucket, by mode (wait, immediate).
    pub static ref TOKENS_ACQUIRED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("emcache_tokens_acquired_total", "Tokens taken from the bucket"),
        &["mode"],
    )
    .unwrap();

    /// Tasks that obtained a token and ran, by submission mode (sync, async, inline).
    pub static ref TASKS_DISPATCHED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("emcache_tasks_dispatched_total", "Tasks run through the dispatcher"),
        &["mode"],
    )
    .unwrap();

    /// Chunks issued by the query orchestrator, by mode (sequential, concurrent).
    pub static ref CHUNKS_ISSUED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("emcache_chunks_issued_total", "Query chunks issued"),
        &["mode"],
    )
    .unwrap();

    /// Chunks that returned an error, by mode.
    pub static ref CHUNKS_FAILED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("emcache_chunks_failed_total", "Query chunks that failed"),
        &["mode"],
    )
    .unwrap();

    /// Store snapshots written, by outcome (ok, error).
    pub static ref SNAPSHOTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("emcache_snapshots_total", "Store snapshots attempted"),
        &["outcome"],
    )
    .unwrap();

    // ── Histograms ───────────────────────────────────────────────────

    /// Time spent writing one store snapshot, in seconds.
    pub static ref SNAPSHOT_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new("emcache_snapshot_duration_seconds", "Store snapshot write time")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
    )
    .unwrap();

    /// Outbound request duration in seconds, by endpoint.
    pub static ref REMOTE_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "emcache_remote_request_duration_seconds",
            "Official API request duration in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["endpoint"],
    )
    .unwrap();
}

/// Register all metrics with the custom registry. Call once at startup.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(TOKENS_AVAILABLE.clone()),
        Box::new(STORE_ENTRIES.clone()),
        Box::new(TOKENS_DROPPED_TOTAL.clone()),
        Box::new(TOKENS_ACQUIRED_TOTAL.clone()),
        Box::new(TASKS_DISPATCHED_TOTAL.clone()),
        Box::new(CHUNKS_ISSUED_TOTAL.clone()),
        Box::new(CHUNKS_FAILED_TOTAL.clone()),
        Box::new(SNAPSHOTS_TOTAL.clone()),
        Box::new(SNAPSHOT_DURATION_SECONDS.clone()),
        Box::new(REMOTE_REQUEST_DURATION_SECONDS.clone()),
    ];

    for c in collectors {
        if let Err(e) = REGISTRY.register(c) {
            tracing::warn!("failed to register metric: {e}");
        }
    }
}

/// Serialize all registered metrics to the Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("failed to encode metrics: {e}");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_metrics_returns_string() {
        // Registering twice only logs; gathering must not panic
        register_metrics();
        register_metrics();
        let output = gather_metrics();
        assert!(output.is_empty() || output.contains("emcache_"));
    }

    #[test]
    fn test_metric_increments() {
        TOKENS_DROPPED_TOTAL.inc();
        TASKS_DISPATCHED_TOTAL.with_label_values(&["sync"]).inc();
        CHUNKS_ISSUED_TOTAL.with_label_values(&["concurrent"]).inc();
        CHUNKS_FAILED_TOTAL.with_label_values(&["sequential"]).inc();
        SNAPSHOTS_TOTAL.with_label_values(&["ok"]).inc();
        SNAPSHOT_DURATION_SECONDS.observe(0.002);
        REMOTE_REQUEST_DURATION_SECONDS
            .with_label_values(&["towns"])
            .observe(0.3);

        STORE_ENTRIES.with_label_values(&["aurora", "towns"]).set(12);
        assert_eq!(STORE_ENTRIES.with_label_values(&["aurora", "towns"]).get(), 12);
    }
}
