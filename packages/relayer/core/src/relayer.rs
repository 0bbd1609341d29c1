//! Defines the [`Relayer`], assembled from a [`RelayerConfig`].

use std::{collections::BTreeMap, sync::Arc};

use anyhow::Context;
use ibc_header_relayer_lib::{
    bootstrap::ClientBootstrapper,
    chain::{ChainEndpoint, ChainPair, ChainProvider},
    client_id_store::ClientIdStore,
    cosmos::CosmosChain,
    error::RelayerError,
    keyring_lock::KeyringLock,
    metrics::RelayMetrics,
    scheduler::PathScheduler,
    update::ClientUpdater,
};
use tokio_util::sync::CancellationToken;

use crate::{config::RelayerConfig, metrics::PrometheusMetrics};

/// Relays headers over every configured path.
#[derive(Debug)]
pub struct Relayer {
    store: ClientIdStore,
    scheduler: PathScheduler,
    pairs: BTreeMap<String, ChainPair<CosmosChain>>,
}

impl Relayer {
    /// Build the relayer described by `config`, reporting to the Prometheus registry.
    ///
    /// # Errors
    /// Returns an error if a chain cannot be set up.
    pub fn from_config(config: &RelayerConfig) -> anyhow::Result<Self> {
        Self::with_metrics(config, Arc::new(PrometheusMetrics))
    }

    /// Build the relayer described by `config` with the given metrics sink.
    ///
    /// # Errors
    /// Returns an error if a chain cannot be set up.
    pub fn with_metrics(
        config: &RelayerConfig,
        metrics: Arc<dyn RelayMetrics>,
    ) -> anyhow::Result<Self> {
        let keys_dir = config.keys_dir();

        let mut endpoints = BTreeMap::new();
        for (name, chain) in &config.chains {
            let provider = CosmosChain::new(chain.to_cosmos_config(keys_dir.clone())?)
                .with_context(|| format!("failed to set up chain {name}"))?;
            tracing::debug!(chain = %name, chain_id = %chain.chain_id, "Configured chain");
            endpoints.insert(
                chain.chain_id.clone(),
                ChainEndpoint::new(Arc::new(provider), chain.key.clone()),
            );
        }

        let mut pairs = BTreeMap::new();
        for (name, path) in &config.paths {
            let (Some(src), Some(dst)) = (endpoints.get(&path.src), endpoints.get(&path.dst))
            else {
                let missing = if endpoints.contains_key(&path.src) {
                    &path.dst
                } else {
                    &path.src
                };
                let err = RelayerError::Configuration(format!(
                    "path {name} references unknown chain {missing}"
                ));
                tracing::error!(
                    path = %name,
                    src_chain = %path.src,
                    dst_chain = %path.dst,
                    error = %err,
                    "Skipping path"
                );
                metrics.failed_pair(&path.src, &path.dst);
                continue;
            };
            let src = src.clone().with_client_id(path.client_id.clone());
            pairs.insert(name.clone(), ChainPair::new(name.clone(), &src, dst));
        }

        let store = ClientIdStore::new(config.db_path());
        let keyring_lock = KeyringLock::new(&keys_dir);
        let retry = config.retry_policy();
        let bootstrapper = ClientBootstrapper::new(
            store.clone(),
            keyring_lock.clone(),
            retry,
            config.global.memo.clone(),
        );
        let updater = ClientUpdater::new(
            keyring_lock,
            retry,
            config.global.memo.clone(),
            config.global.interval,
            Arc::clone(&metrics),
        );

        Ok(Self {
            store,
            scheduler: PathScheduler::new(bootstrapper, updater, metrics),
            pairs,
        })
    }

    /// The configured paths, by name.
    #[must_use]
    pub const fn pairs(&self) -> &BTreeMap<String, ChainPair<CosmosChain>> {
        &self.pairs
    }

    /// Bootstrap every path and keep updating their clients until `cancel` fires.
    ///
    /// Returns the number of paths that were started.
    pub async fn run_all(&self, cancel: CancellationToken) -> usize {
        self.scheduler
            .run_all(self.pairs.values().cloned().collect(), cancel)
            .await
    }

    /// Bootstrap the path named `path` and keep updating its client until `cancel` fires.
    ///
    /// # Errors
    /// Returns an error if the path is unknown, the bootstrap fails or the update loop stops
    /// on a fatal error.
    pub async fn keep_update_client(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<(), RelayerError> {
        let pair = self.pair(path)?.clone();
        self.scheduler.bootstrap_and_update(pair, cancel).await
    }

    /// Update the client of the path named `path` once, returning the transaction hash.
    ///
    /// # Errors
    /// Returns an error if the path is unknown, its key is missing or it has no client yet,
    /// or if the update is not confirmed.
    pub async fn update_client(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<String, RelayerError> {
        let mut pair = self.pair(path)?.clone();
        if !pair.src.provider().key_exists(pair.src.key_name()) {
            return Err(RelayerError::Configuration(format!(
                "key {} not found on {}",
                pair.src.key_name(),
                pair.src.chain_id()
            )));
        }
        if let Some(client_id) = self.resolve_client_id(path).await? {
            pair.src.set_client_id(client_id);
        }

        self.scheduler
            .updater()
            .update_once(&pair, cancel)
            .await?
            .into_result()
    }

    /// The client id of the path named `path`: the stored one, else the configured one.
    ///
    /// # Errors
    /// Returns an error if the path is unknown or the store cannot be read.
    pub async fn resolve_client_id(&self, path: &str) -> Result<Option<String>, RelayerError> {
        let pair = self.pair(path)?;
        match self.store.get(&pair.name).await? {
            Some(client_id) => Ok(Some(client_id)),
            None => Ok(pair.src.client_id().map(str::to_string)),
        }
    }

    fn pair(&self, path: &str) -> Result<&ChainPair<CosmosChain>, RelayerError> {
        self.pairs
            .get(path)
            .ok_or_else(|| RelayerError::Configuration(format!("unknown path {path}")))
    }
}
