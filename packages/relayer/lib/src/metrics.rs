//! Defines the [`RelayMetrics`] sink the relayer reports outcomes to.

/// Counters incremented by the relayer, keyed by home chain and counterparty chain.
///
/// The relayer holds no metrics state itself; exporting is left to the implementation.
#[allow(clippy::module_name_repetitions)]
pub trait RelayMetrics: Send + Sync {
    /// A header of `dst_chain` was relayed to `src_chain`.
    fn relayed_header(&self, src_chain: &str, dst_chain: &str);

    /// Relaying a header of `dst_chain` to `src_chain` failed.
    fn failed_header(&self, src_chain: &str, dst_chain: &str);

    /// The path from `src_chain` to `dst_chain` was bootstrapped and is being relayed.
    fn relayed_pair(&self, src_chain: &str, dst_chain: &str);

    /// The path from `src_chain` to `dst_chain` could not be started or stopped relaying.
    fn failed_pair(&self, src_chain: &str, dst_chain: &str);
}

/// A sink that drops every metric.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl RelayMetrics for NoopMetrics {
    fn relayed_header(&self, _src_chain: &str, _dst_chain: &str) {}

    fn failed_header(&self, _src_chain: &str, _dst_chain: &str) {}

    fn relayed_pair(&self, _src_chain: &str, _dst_chain: &str) {}

    fn failed_pair(&self, _src_chain: &str, _dst_chain: &str) {}
}
