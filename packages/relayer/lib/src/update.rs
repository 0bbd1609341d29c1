//! Defines the [`ClientUpdater`] which builds and submits header updates for a path.

use std::{sync::Arc, time::Duration};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{
    chain::{ChainPair, ChainProvider, Height, SendOutcome},
    error::RelayerError,
    keyring_lock::KeyringLock,
    metrics::RelayMetrics,
    retry::{query_latest_heights, RetryPolicy},
};

/// Default interval between two update attempts.
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Builds and submits client updates, once or periodically.
#[derive(Clone)]
#[allow(clippy::module_name_repetitions)]
pub struct ClientUpdater {
    keyring_lock: KeyringLock,
    retry: RetryPolicy,
    memo: String,
    interval: Duration,
    metrics: Arc<dyn RelayMetrics>,
}

impl std::fmt::Debug for ClientUpdater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientUpdater")
            .field("keyring_lock", &self.keyring_lock)
            .field("retry", &self.retry)
            .field("memo", &self.memo)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl ClientUpdater {
    /// Create a new updater.
    #[must_use]
    pub fn new(
        keyring_lock: KeyringLock,
        retry: RetryPolicy,
        memo: impl Into<String>,
        interval: Duration,
        metrics: Arc<dyn RelayMetrics>,
    ) -> Self {
        Self {
            keyring_lock,
            retry,
            memo: memo.into(),
            interval,
            metrics,
        }
    }

    /// The interval between two update attempts.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Update the client of `pair.dst` on `pair.src` once.
    ///
    /// # Errors
    /// Returns an error if the pair has no client id, a query keeps failing, the keyring lock
    /// cannot be taken or the transaction is not accepted.
    #[tracing::instrument(skip_all, fields(
        path = %pair.name,
        src_chain = %pair.src.chain_id(),
        dst_chain = %pair.dst.chain_id(),
    ))]
    pub async fn update_once<P: ChainProvider>(
        &self,
        pair: &ChainPair<P>,
        cancel: &CancellationToken,
    ) -> Result<SendOutcome, RelayerError> {
        let client_id = pair.client_id()?;
        let (src_height, dst_height) =
            query_latest_heights(&self.retry, cancel, &pair.src, &pair.dst).await?;

        let message = self
            .build_update_message(pair, client_id, src_height, dst_height, cancel)
            .await?;

        let src_provider = pair.src.provider();
        let outcome = self
            .keyring_lock
            .with_lock(|| src_provider.submit(pair.src.key_name(), vec![message], &self.memo))
            .await?
            .map_err(|cause| RelayerError::network("submit update client", cause))?;

        match &outcome {
            SendOutcome::Committed { tx_hash } => {
                tracing::info!(client_id, tx_hash, "Successfully updated the client");
            }
            SendOutcome::Unconfirmed { tx_hash, reason } => {
                tracing::warn!(
                    client_id,
                    tx_hash,
                    reason,
                    "Partial success when updating the client"
                );
            }
        }

        Ok(outcome)
    }

    /// Query the client state on the home chain and the latest and trusted headers on the
    /// counterparty, then build the update message.
    async fn build_update_message<P: ChainProvider>(
        &self,
        pair: &ChainPair<P>,
        client_id: &str,
        src_height: Height,
        dst_height: Height,
        cancel: &CancellationToken,
    ) -> Result<P::Message, RelayerError> {
        let (src_provider, dst_provider) = (pair.src.provider(), pair.dst.provider());

        let client_state = self
            .retry
            .run(cancel, "query client state", || {
                src_provider.query_client_state(src_height, client_id)
            })
            .await?;
        let trusted_height = client_state.latest_height;

        let (latest_header, trusted_header) = futures::try_join!(
            self.retry.run(cancel, "query counterparty header", || {
                dst_provider.query_ibc_header(dst_height)
            }),
            self.retry.run(cancel, "query trusted header", || {
                dst_provider.query_ibc_header(trusted_height.increment())
            }),
        )?;

        tracing::debug!(
            client_id,
            trusted_height = %trusted_height,
            target_height = %dst_height,
            "Building update client message"
        );

        let client_message = self
            .retry
            .run(cancel, "build update client header", || {
                dst_provider.build_update_header(&latest_header, trusted_height, &trusted_header)
            })
            .await?;

        src_provider
            .build_update_message(client_id, client_message)
            .await
            .map_err(|cause| RelayerError::network("build update client message", cause))
    }

    /// Update the client every interval, starting immediately, until `cancel` fires.
    ///
    /// A failed tick is logged and counted; only storage or configuration errors end the loop.
    ///
    /// # Errors
    /// Returns the fatal error that stopped the loop.
    #[tracing::instrument(skip_all, fields(
        path = %pair.name,
        src_chain = %pair.src.chain_id(),
        dst_chain = %pair.dst.chain_id(),
    ))]
    pub async fn keep_updating<P: ChainProvider>(
        &self,
        pair: &ChainPair<P>,
        cancel: &CancellationToken,
    ) -> Result<(), RelayerError> {
        let (src_chain, dst_chain) = (pair.src.chain_id(), pair.dst.chain_id());
        tracing::info!(
            client_id = pair.src.client_id(),
            interval = ?self.interval,
            "Keep updating client"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.update_once(pair, cancel).await {
                Ok(_) => self.metrics.relayed_header(src_chain, dst_chain),
                Err(RelayerError::Cancelled) => break,
                Err(err) if err.is_fatal() => {
                    self.metrics.failed_header(src_chain, dst_chain);
                    tracing::error!(error = %err, "Stopped updating the client");
                    return Err(err);
                }
                Err(err) => {
                    self.metrics.failed_header(src_chain, dst_chain);
                    tracing::error!(error = %err, "Failed to update the client, retrying next tick");
                }
            }
        }

        tracing::info!("Stopped updating client on shutdown");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::ChainEndpoint,
        mock::{CountingMetrics, MockChain},
    };

    struct Fixture {
        dir: tempfile::TempDir,
        updater: ClientUpdater,
        metrics: Arc<CountingMetrics>,
        home: Arc<MockChain>,
        cz: Arc<MockChain>,
        pair: ChainPair<MockChain>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(CountingMetrics::default());
        let updater = ClientUpdater::new(
            KeyringLock::new(dir.path()),
            RetryPolicy::new(3, Duration::from_millis(5)),
            "memo",
            Duration::from_millis(20),
            Arc::clone(&metrics) as Arc<dyn RelayMetrics>,
        );

        let home = Arc::new(MockChain::new("babylon-1", 100));
        let cz = Arc::new(MockChain::new("osmosis-1", 40));
        home.host_client("07-tendermint-0", "osmosis-1", Height::new(1, 20));

        let src = ChainEndpoint::new(Arc::clone(&home), "relayer")
            .with_client_id(Some("07-tendermint-0".to_string()));
        let pair = ChainPair::new(
            "babylon-osmosis",
            &src,
            &ChainEndpoint::new(Arc::clone(&cz), "relayer"),
        );

        Fixture {
            dir,
            updater,
            metrics,
            home,
            cz,
            pair,
        }
    }

    #[tokio::test]
    async fn update_advances_the_client_to_the_lagged_counterparty_height() {
        let f = fixture();

        let outcome = f
            .updater
            .update_once(&f.pair, &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcome, SendOutcome::Committed { .. }));
        assert_eq!(
            f.home.hosted_client("07-tendermint-0").unwrap().latest_height,
            Height::new(1, 39)
        );
        assert_eq!(
            *f.home.client_state_queries.lock().unwrap(),
            vec![Height::new(1, 99)]
        );
        // Latest header at H-1, trusted header right above the client's height.
        let mut header_heights = f.cz.header_queries.lock().unwrap().clone();
        header_heights.sort();
        assert_eq!(header_heights, vec![Height::new(1, 21), Height::new(1, 39)]);
    }

    #[tokio::test]
    async fn update_without_client_id_is_a_configuration_error() {
        let mut f = fixture();
        f.pair.src = ChainEndpoint::new(Arc::clone(&f.home), "relayer");

        let err = f
            .updater
            .update_once(&f.pair, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RelayerError::Configuration(_)));
        assert_eq!(f.home.submit_count(), 0);
    }

    #[tokio::test]
    async fn partial_send_is_reported_distinctly() {
        let f = fixture();
        f.home.leave_submits_unconfirmed(true);

        let outcome = f
            .updater
            .update_once(&f.pair, &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.is_partial());
        assert!(matches!(
            outcome.into_result(),
            Err(RelayerError::PartialSend { .. })
        ));
    }

    #[tokio::test]
    async fn loop_survives_partial_sends_and_failures() {
        let f = fixture();
        f.home.leave_submits_unconfirmed(true);
        let cancel = CancellationToken::new();

        let task = {
            let updater = f.updater.clone();
            let pair = f.pair.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { updater.keep_updating(&pair, &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(70)).await;
        f.home.leave_submits_unconfirmed(false);
        f.home.fail_submits(true);
        tokio::time::sleep(Duration::from_millis(70)).await;
        f.home.fail_submits(false);
        tokio::time::sleep(Duration::from_millis(70)).await;
        cancel.cancel();

        task.await.unwrap().unwrap();

        let relayed =
            CountingMetrics::get(&f.metrics.relayed_headers, "babylon-1", "osmosis-1");
        let failed = CountingMetrics::get(&f.metrics.failed_headers, "babylon-1", "osmosis-1");
        assert!(relayed >= 2, "relayed {relayed}");
        assert!(failed >= 1, "failed {failed}");
        assert!(f.home.submit_count() >= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_keeps_ticking_while_the_counterparty_is_down() {
        let f = fixture();
        f.cz.fail_next_height_queries(u32::MAX);
        let cancel = CancellationToken::new();

        let task = {
            let updater = f.updater.clone();
            let pair = f.pair.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { updater.keep_updating(&pair, &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(105)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert!(CountingMetrics::get(&f.metrics.failed_headers, "babylon-1", "osmosis-1") >= 3);
        assert_eq!(f.home.submit_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_stops_on_configuration_errors() {
        let mut f = fixture();
        f.pair.src = ChainEndpoint::new(Arc::clone(&f.home), "relayer");

        let err = f
            .updater
            .keep_updating(&f.pair, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(
            CountingMetrics::get(&f.metrics.failed_headers, "babylon-1", "osmosis-1"),
            1
        );
    }

    #[tokio::test]
    async fn lock_failures_are_failed_ticks_and_the_loop_recovers() {
        let f = fixture();
        let keyring = f.dir.path().join("keyring");
        std::fs::write(&keyring, b"").unwrap();
        let updater = ClientUpdater::new(
            KeyringLock::new(&keyring),
            RetryPolicy::new(3, Duration::from_millis(5)),
            "memo",
            Duration::from_millis(20),
            Arc::clone(&f.metrics) as Arc<dyn RelayMetrics>,
        );
        let cancel = CancellationToken::new();

        let task = {
            let pair = f.pair.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { updater.keep_updating(&pair, &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(70)).await;
        let failed = CountingMetrics::get(&f.metrics.failed_headers, "babylon-1", "osmosis-1");
        assert!(failed >= 2, "failed {failed}");
        assert_eq!(f.home.submit_count(), 0);

        std::fs::remove_file(&keyring).unwrap();
        tokio::time::sleep(Duration::from_millis(70)).await;
        cancel.cancel();

        task.await.unwrap().unwrap();
        assert!(CountingMetrics::get(&f.metrics.relayed_headers, "babylon-1", "osmosis-1") >= 1);
        assert!(f.home.submit_count() >= 1);
    }
}
