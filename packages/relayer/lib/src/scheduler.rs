//! Defines the [`PathScheduler`] which bootstraps every configured path and runs its update
//! loop.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::{
    bootstrap::ClientBootstrapper,
    chain::{ChainPair, ChainProvider},
    error::RelayerError,
    metrics::RelayMetrics,
    update::ClientUpdater,
};

/// Drives bootstrap and periodic updates for a set of paths.
///
/// A failing path is logged and counted, and never stops the others.
#[derive(Clone)]
#[allow(clippy::module_name_repetitions)]
pub struct PathScheduler {
    bootstrapper: ClientBootstrapper,
    updater: ClientUpdater,
    metrics: Arc<dyn RelayMetrics>,
}

impl std::fmt::Debug for PathScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathScheduler")
            .field("bootstrapper", &self.bootstrapper)
            .field("updater", &self.updater)
            .finish_non_exhaustive()
    }
}

impl PathScheduler {
    /// Create a new scheduler.
    #[must_use]
    pub fn new(
        bootstrapper: ClientBootstrapper,
        updater: ClientUpdater,
        metrics: Arc<dyn RelayMetrics>,
    ) -> Self {
        Self {
            bootstrapper,
            updater,
            metrics,
        }
    }

    /// The bootstrapper used for every path.
    #[must_use]
    pub const fn bootstrapper(&self) -> &ClientBootstrapper {
        &self.bootstrapper
    }

    /// The updater used for every path.
    #[must_use]
    pub const fn updater(&self) -> &ClientUpdater {
        &self.updater
    }

    /// Bootstrap a single path and keep updating its client until `cancel` fires.
    ///
    /// # Errors
    /// Returns an error if the signing key is missing, the bootstrap fails or the update loop
    /// hits a fatal error.
    pub async fn bootstrap_and_update<P: ChainProvider>(
        &self,
        mut pair: ChainPair<P>,
        cancel: &CancellationToken,
    ) -> Result<(), RelayerError> {
        match self.prepare(&mut pair, cancel).await {
            Ok(()) => {}
            Err(RelayerError::Cancelled) => return Err(RelayerError::Cancelled),
            Err(err) => {
                self.metrics
                    .failed_pair(pair.src.chain_id(), pair.dst.chain_id());
                return Err(err);
            }
        }

        self.metrics
            .relayed_pair(pair.src.chain_id(), pair.dst.chain_id());
        let result = self.updater.keep_updating(&pair, cancel).await;
        if result.is_err() {
            self.metrics
                .failed_pair(pair.src.chain_id(), pair.dst.chain_id());
        }
        result
    }

    /// Bootstrap every path in order, then run the update loops concurrently until all of
    /// them have stopped.
    ///
    /// Paths whose signing key is missing or whose bootstrap fails are skipped. Returns the
    /// number of paths whose update loop was started.
    #[tracing::instrument(skip_all, fields(paths = pairs.len()))]
    pub async fn run_all<P: ChainProvider>(
        &self,
        pairs: Vec<ChainPair<P>>,
        cancel: CancellationToken,
    ) -> usize {
        let mut tasks = JoinSet::new();

        for mut pair in pairs {
            if cancel.is_cancelled() {
                tracing::info!("Shutdown requested, not starting the remaining paths");
                break;
            }

            let (src_chain, dst_chain) =
                (pair.src.chain_id().to_string(), pair.dst.chain_id().to_string());
            match self.prepare(&mut pair, &cancel).await {
                Ok(()) => {}
                Err(RelayerError::Cancelled) => break,
                Err(err) => {
                    self.metrics.failed_pair(&src_chain, &dst_chain);
                    tracing::error!(
                        path = %pair.name,
                        src_chain,
                        dst_chain,
                        error = %err,
                        "Skipping path"
                    );
                    continue;
                }
            }

            self.metrics.relayed_pair(&src_chain, &dst_chain);
            let updater = self.updater.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let result = updater.keep_updating(&pair, &cancel).await;
                (pair.name, src_chain, dst_chain, result)
            });
        }

        let started = tasks.len();
        tracing::info!(started, "Started relaying");

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((path, _, _, Ok(()))) => tracing::debug!(path, "Update loop stopped"),
                Ok((path, src_chain, dst_chain, Err(err))) => {
                    self.metrics.failed_pair(&src_chain, &dst_chain);
                    tracing::error!(path, src_chain, dst_chain, error = %err, "Update loop failed");
                }
                Err(err) => tracing::error!(error = %err, "Update loop panicked"),
            }
        }

        started
    }

    async fn prepare<P: ChainProvider>(
        &self,
        pair: &mut ChainPair<P>,
        cancel: &CancellationToken,
    ) -> Result<(), RelayerError> {
        if !pair.src.provider().key_exists(pair.src.key_name()) {
            return Err(RelayerError::Configuration(format!(
                "key {} not found on {}",
                pair.src.key_name(),
                pair.src.chain_id()
            )));
        }

        let client_id = self.bootstrapper.ensure_client(pair, cancel).await?;
        tracing::info!(
            path = %pair.name,
            src_chain = %pair.src.chain_id(),
            dst_chain = %pair.dst.chain_id(),
            client_id,
            "Bootstrapped path"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        chain::{ChainEndpoint, Height},
        client_id_store::ClientIdStore,
        keyring_lock::KeyringLock,
        mock::{CountingMetrics, MockChain},
        retry::RetryPolicy,
    };

    fn scheduler(dir: &std::path::Path, metrics: &Arc<CountingMetrics>) -> PathScheduler {
        let keyring_lock = KeyringLock::new(dir.join("keys"));
        let retry = RetryPolicy::new(3, Duration::from_millis(5));
        let metrics = Arc::clone(metrics) as Arc<dyn RelayMetrics>;
        PathScheduler::new(
            ClientBootstrapper::new(
                ClientIdStore::new(dir.join("db")),
                keyring_lock.clone(),
                retry,
                "memo",
            )
            .with_poll_interval(Duration::from_millis(5)),
            ClientUpdater::new(
                keyring_lock,
                retry,
                "memo",
                Duration::from_millis(20),
                Arc::clone(&metrics),
            ),
            metrics,
        )
    }

    #[tokio::test]
    async fn paths_with_a_missing_key_are_skipped_without_stopping_the_others() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(CountingMetrics::default());
        let scheduler = scheduler(dir.path(), &metrics);

        let a = Arc::new(MockChain::new("a-1", 100));
        let c = Arc::new(MockChain::new("c-1", 60).without_key());
        let b = Arc::new(MockChain::new("b-1", 40));

        let a_end = ChainEndpoint::new(Arc::clone(&a), "relayer");
        let b_end = ChainEndpoint::new(Arc::clone(&b), "relayer");
        let c_end = ChainEndpoint::new(Arc::clone(&c), "relayer");
        let pairs = vec![
            ChainPair::new("c-a", &c_end, &a_end),
            ChainPair::new("a-b", &a_end, &b_end),
        ];

        let cancel = CancellationToken::new();
        let run = {
            let scheduler = scheduler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.run_all(pairs, cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let started = run.await.unwrap();

        assert_eq!(started, 1);
        assert_eq!(c.create_count(), 0);
        assert_eq!(a.create_count(), 1);
        assert!(a.submit_count() >= 1);
        assert_eq!(CountingMetrics::get(&metrics.failed_pairs, "c-1", "a-1"), 1);
        assert_eq!(CountingMetrics::get(&metrics.relayed_pairs, "a-1", "b-1"), 1);
        assert!(CountingMetrics::get(&metrics.relayed_headers, "a-1", "b-1") >= 1);

        let client_id = ClientIdStore::new(dir.path().join("db"))
            .get("a-b")
            .await
            .unwrap()
            .unwrap();
        assert!(a.hosted_client(&client_id).unwrap().latest_height >= Height::new(1, 39));
    }

    #[tokio::test]
    async fn failed_bootstrap_skips_only_that_path() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(CountingMetrics::default());
        let scheduler = scheduler(dir.path(), &metrics);

        let home = Arc::new(MockChain::new("home-1", 100));
        let down = Arc::new(MockChain::new("down-1", 50));
        let up = Arc::new(MockChain::new("up-1", 50));
        down.fail_next_height_queries(u32::MAX);

        let home_end = ChainEndpoint::new(Arc::clone(&home), "relayer");
        let pairs = vec![
            ChainPair::new(
                "home-down",
                &home_end,
                &ChainEndpoint::new(Arc::clone(&down), "relayer"),
            ),
            ChainPair::new(
                "home-up",
                &home_end,
                &ChainEndpoint::new(Arc::clone(&up), "relayer"),
            ),
        ];

        let cancel = CancellationToken::new();
        let run = {
            let scheduler = scheduler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.run_all(pairs, cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        assert_eq!(run.await.unwrap(), 1);
        assert_eq!(home.create_count(), 1);
        assert_eq!(CountingMetrics::get(&metrics.failed_pairs, "home-1", "down-1"), 1);
        assert_eq!(CountingMetrics::get(&metrics.relayed_pairs, "home-1", "up-1"), 1);
    }

    #[tokio::test]
    async fn already_cancelled_run_starts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(CountingMetrics::default());
        let scheduler = scheduler(dir.path(), &metrics);

        let a = ChainEndpoint::new(Arc::new(MockChain::new("a-1", 100)), "relayer");
        let b = ChainEndpoint::new(Arc::new(MockChain::new("b-1", 40)), "relayer");
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(
            scheduler
                .run_all(vec![ChainPair::new("a-b", &a, &b)], cancel)
                .await,
            0
        );
    }

    #[tokio::test]
    async fn single_path_fails_fast_on_a_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(CountingMetrics::default());
        let scheduler = scheduler(dir.path(), &metrics);

        let a = ChainEndpoint::new(Arc::new(MockChain::new("a-1", 100).without_key()), "relayer");
        let b = ChainEndpoint::new(Arc::new(MockChain::new("b-1", 40)), "relayer");

        let err = scheduler
            .bootstrap_and_update(ChainPair::new("a-b", &a, &b), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RelayerError::Configuration(_)));
        assert_eq!(CountingMetrics::get(&metrics.failed_pairs, "a-1", "b-1"), 1);
    }

    #[tokio::test]
    async fn cancelled_bootstrap_is_not_counted_as_a_failed_path() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(CountingMetrics::default());
        let scheduler = scheduler(dir.path(), &metrics);

        let home = Arc::new(MockChain::new("a-1", 100));
        let a = ChainEndpoint::new(Arc::clone(&home), "relayer");
        let b = ChainEndpoint::new(Arc::new(MockChain::new("b-1", 40)), "relayer");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = scheduler
            .bootstrap_and_update(ChainPair::new("a-b", &a, &b), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, RelayerError::Cancelled));
        assert_eq!(home.create_count(), 0);
        assert_eq!(CountingMetrics::get(&metrics.failed_pairs, "a-1", "b-1"), 0);
        assert_eq!(CountingMetrics::get(&metrics.relayed_pairs, "a-1", "b-1"), 0);
    }
}
