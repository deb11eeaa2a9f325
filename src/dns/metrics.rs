//! Prometheus metrics exported by the monitoring listener (`dns::monitor`).
//!
//! Counters follow the error taxonomy in the specification's §7: SERVFAIL and
//! 5xx outcomes are always counted, alongside the basics (queries by
//! front-end/protocol, cache hit/miss/store, single-flight coalescing,
//! upstream call latency).

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, Encoder, HistogramVec,
    IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    /// Queries received, labeled by front-end (`dns`, `doh-json`, `doh-wire`)
    /// and query type.
    pub static ref DNS_QUERIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "dohbridge_queries_total",
        "Total number of queries accepted by a front-end",
        &["frontend", "query_type"]
    )
    .unwrap();

    /// Responses sent, labeled by front-end and RCODE name.
    pub static ref DNS_RESPONSES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "dohbridge_responses_total",
        "Total number of responses returned by a front-end",
        &["frontend", "rcode"]
    )
    .unwrap();

    /// Cache operations: hit, negative_hit, miss, store, evict.
    pub static ref DNS_CACHE_OPERATIONS: IntCounterVec = register_int_counter_vec!(
        "dohbridge_cache_operations_total",
        "Cache lookup/store/eviction operations",
        &["operation"]
    )
    .unwrap();

    pub static ref DNS_CACHE_SIZE: IntGauge = register_int_gauge!(
        "dohbridge_cache_entries",
        "Current number of entries held in the cache"
    )
    .unwrap();

    /// Number of single-flight waiters that coalesced onto an in-flight
    /// resolution rather than triggering their own upstream call.
    pub static ref SINGLE_FLIGHT_COALESCED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "dohbridge_single_flight_coalesced_total",
        "Lookups that coalesced onto an in-flight resolution",
        &["frontend"]
    )
    .unwrap();

    /// Outbound upstream calls, labeled by upstream kind (`doh`, `classic-dns`,
    /// `override`) and outcome (`ok`, `servfail`, `timeout`).
    pub static ref UPSTREAM_QUERIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "dohbridge_upstream_queries_total",
        "Outbound upstream resolution attempts",
        &["upstream", "outcome"]
    )
    .unwrap();

    pub static ref UPSTREAM_QUERY_DURATION: HistogramVec = register_histogram_vec!(
        "dohbridge_upstream_query_duration_seconds",
        "Latency of outbound upstream resolution calls",
        &["upstream"]
    )
    .unwrap();

    /// Errors by component and taxonomy kind, per the specification's §7
    /// table (formerr, notimp, servfail, internal).
    pub static ref ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "dohbridge_errors_total",
        "Errors observed, labeled by component and kind",
        &["component", "kind"]
    )
    .unwrap();
}

/// Renders the process-wide registry in Prometheus text exposition format,
/// for the monitoring listener's `/metrics` endpoint.
pub fn encode_text() -> Vec<u8> {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&metric_families, &mut buffer).ok();
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_registered_and_incrementable() {
        DNS_QUERIES_TOTAL.with_label_values(&["dns", "A"]).inc();
        DNS_CACHE_OPERATIONS.with_label_values(&["hit"]).inc();
        assert!(!encode_text().is_empty());
    }
}
