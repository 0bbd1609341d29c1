//! Metrics module for the relayer.

#![allow(missing_docs)]

use ibc_header_relayer_lib::metrics::RelayMetrics;
use prometheus::{register_int_counter_vec, Encoder, IntCounterVec, TextEncoder};
use std::sync::LazyLock;

const LABELS: &[&str] = &["src_chain", "dst_chain"];

/// Prometheus metric for headers relayed, distinguished by `src_chain` and `dst_chain`
pub static RELAYED_HEADERS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "header_relayer_relayed_headers_total",
        "Total number of headers relayed",
        LABELS
    )
    .unwrap()
});

/// Prometheus metric for failed header relays, distinguished by `src_chain` and `dst_chain`
pub static FAILED_HEADERS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "header_relayer_failed_headers_total",
        "Total number of headers that failed to be relayed",
        LABELS
    )
    .unwrap()
});

/// Prometheus metric for paths started, distinguished by `src_chain` and `dst_chain`
pub static RELAYED_PAIRS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "header_relayer_relayed_pairs_total",
        "Total number of chain pairs bootstrapped and relayed",
        LABELS
    )
    .unwrap()
});

/// Prometheus metric for failed paths, distinguished by `src_chain` and `dst_chain`
pub static FAILED_PAIRS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "header_relayer_failed_pairs_total",
        "Total number of chain pairs that failed to start or stopped relaying",
        LABELS
    )
    .unwrap()
});

/// Reports relayer outcomes to the default Prometheus registry.
#[derive(Clone, Copy, Debug, Default)]
pub struct PrometheusMetrics;

impl RelayMetrics for PrometheusMetrics {
    fn relayed_header(&self, src_chain: &str, dst_chain: &str) {
        RELAYED_HEADERS
            .with_label_values(&[src_chain, dst_chain])
            .inc();
    }

    fn failed_header(&self, src_chain: &str, dst_chain: &str) {
        FAILED_HEADERS.with_label_values(&[src_chain, dst_chain]).inc();
    }

    fn relayed_pair(&self, src_chain: &str, dst_chain: &str) {
        RELAYED_PAIRS.with_label_values(&[src_chain, dst_chain]).inc();
    }

    fn failed_pair(&self, src_chain: &str, dst_chain: &str) {
        FAILED_PAIRS.with_label_values(&[src_chain, dst_chain]).inc();
    }
}

/// Encode every registered metric in the Prometheus text format.
/// # Errors
/// Returns an error if the metrics cannot be encoded.
pub fn encode_metrics() -> anyhow::Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
