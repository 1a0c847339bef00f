//! Process-wide metrics registry backing `GET /health/metrics` (spec §6).
//!
//! Design Note 2 asks for an explicitly injected collector with a default
//! process-wide instance constructed at startup, rather than the teacher
//! codebase's habit of reaching for ambient globals everywhere. `Metrics`
//! is therefore a plain struct of `prometheus` handles that callers pass
//! down (`Arc<Metrics>`); `Metrics::default_registry()` is the one process
//! singleton, built once and handed to the accept loop at startup.

use prometheus::{
    exponential_buckets, register_histogram_vec_with_registry,
    register_int_counter_vec_with_registry, register_int_gauge_vec_with_registry, Encoder,
    HistogramVec, IntCounterVec, IntGaugeVec, Registry, TextEncoder,
};
use std::sync::Arc;

/// Histogram observation cap per series (spec §6).
pub const MAX_HISTOGRAM_OBSERVATIONS: u64 = 1000;

pub struct Metrics {
    pub registry: Registry,
    pub requests_total: IntCounterVec,
    pub responses_total: IntCounterVec,
    pub connections_active: IntGaugeVec,
    pub request_duration_seconds: HistogramVec,
    pub rate_limited_total: IntCounterVec,
    pub cache_hits_total: IntCounterVec,
    pub cache_misses_total: IntCounterVec,
}

impl Metrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        let registry = Registry::new();
        let requests_total = register_int_counter_vec_with_registry!(
            "http_requests_total",
            "Total requests received, by protocol",
            &["protocol"],
            registry
        )
        .expect("metric registration");
        let responses_total = register_int_counter_vec_with_registry!(
            "http_responses_total",
            "Total responses sent, by status class",
            &["status_class"],
            registry
        )
        .expect("metric registration");
        let connections_active = register_int_gauge_vec_with_registry!(
            "http_connections_active",
            "Currently open connections, by protocol",
            &["protocol"],
            registry
        )
        .expect("metric registration");
        // Fixed, stable-across-restart bucket boundaries: 1ms .. ~16s.
        let buckets = exponential_buckets(0.001, 2.0, 15).expect("valid bucket geometry");
        let request_duration_seconds = register_histogram_vec_with_registry!(
            "http_request_duration_seconds",
            "Handler latency",
            &["protocol"],
            buckets,
            registry
        )
        .expect("metric registration");
        let rate_limited_total = register_int_counter_vec_with_registry!(
            "http_rate_limited_total",
            "Requests rejected by the rate limiter",
            &["reason"],
            registry
        )
        .expect("metric registration");
        let cache_hits_total = register_int_counter_vec_with_registry!(
            "http_cache_hits_total",
            "Cache hits, by cache name",
            &["cache"],
            registry
        )
        .expect("metric registration");
        let cache_misses_total = register_int_counter_vec_with_registry!(
            "http_cache_misses_total",
            "Cache misses, by cache name",
            &["cache"],
            registry
        )
        .expect("metric registration");

        Arc::new(Self {
            registry,
            requests_total,
            responses_total,
            connections_active,
            request_duration_seconds,
            rate_limited_total,
            cache_hits_total,
            cache_misses_total,
        })
    }

    /// Render the default registry as Prometheus text-format exposition.
    #[must_use]
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder
            .encode(&families, &mut buffer)
            .expect("prometheus text encoding never fails on our own metric families");
        String::from_utf8(buffer).expect("prometheus text encoder emits valid UTF-8")
    }
}

impl Default for Metrics {
    fn default() -> Self {
        // Arc::new(Self::new()) would double-wrap; build the inner value directly.
        let arc = Metrics::new();
        Arc::try_unwrap(arc).unwrap_or_else(|arc| (*arc).clone_handles())
    }
}

impl Metrics {
    /// `prometheus` collectors are themselves cheap `Arc`-backed clones;
    /// used only by the rarely-hit `Default` fallback above.
    fn clone_handles(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            requests_total: self.requests_total.clone(),
            responses_total: self.responses_total.clone(),
            connections_active: self.connections_active.clone(),
            request_duration_seconds: self.request_duration_seconds.clone(),
            rate_limited_total: self.rate_limited_total.clone(),
            cache_hits_total: self.cache_hits_total.clone(),
            cache_misses_total: self.cache_misses_total.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_exposition_text() {
        let metrics = Metrics::new();
        metrics.requests_total.with_label_values(&["h1"]).inc();
        let text = metrics.render();
        assert!(text.contains("http_requests_total"));
    }
}
