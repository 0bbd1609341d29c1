//! Defines the [`ClientBootstrapper`] which makes sure a light client exists for a path before
//! it is updated.
//!
//! ```text
//! CHECK_CACHE -> (hit)  VERIFY_ON_CHAIN -> DONE
//! CHECK_CACHE -> (miss) CREATE -> AWAIT_QUERYABLE -> PERSIST -> DONE
//! ```
//!
//! A cached client that is not queryable falls through to creation. Any other failure aborts
//! the bootstrap of that path only.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio_util::sync::CancellationToken;

use crate::{
    chain::{ChainPair, ChainProvider, ClientState, CreateClientParams},
    client_id_store::ClientIdStore,
    error::RelayerError,
    keyring_lock::KeyringLock,
    retry::{query_latest_heights, RetryPolicy},
};

/// Interval between two checks of whether a new client is queryable.
pub const AWAIT_QUERYABLE_INTERVAL: Duration = Duration::from_secs(5);

/// Share of the counterparty unbonding period used as the trusting period of a new client.
pub const TRUSTING_PERIOD_PERCENTAGE: u32 = 85;

/// Derive the trusting period from the unbonding period.
#[must_use]
pub fn trusting_period(unbonding_period: Duration) -> Duration {
    unbonding_period / 100 * TRUSTING_PERIOD_PERCENTAGE
}

/// Ensures that a light client of the counterparty exists on the home chain of a path.
#[derive(Clone, Debug)]
#[allow(clippy::module_name_repetitions)]
pub struct ClientBootstrapper {
    store: ClientIdStore,
    keyring_lock: KeyringLock,
    retry: RetryPolicy,
    memo: String,
    poll_interval: Duration,
    in_flight: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl ClientBootstrapper {
    /// Create a new bootstrapper.
    #[must_use]
    pub fn new(
        store: ClientIdStore,
        keyring_lock: KeyringLock,
        retry: RetryPolicy,
        memo: impl Into<String>,
    ) -> Self {
        Self {
            store,
            keyring_lock,
            retry,
            memo: memo.into(),
            poll_interval: AWAIT_QUERYABLE_INTERVAL,
            in_flight: Arc::default(),
        }
    }

    /// Override the interval between two queryability checks.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// The retry policy applied to every remote query.
    #[must_use]
    pub const fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// The memo attached to submitted transactions.
    #[must_use]
    pub fn memo(&self) -> &str {
        &self.memo
    }

    /// The lock guarding keyring access.
    #[must_use]
    pub const fn keyring_lock(&self) -> &KeyringLock {
        &self.keyring_lock
    }

    /// Make sure a light client of `pair.dst` exists on `pair.src`, and record its id on
    /// `pair.src`.
    ///
    /// Bootstraps of the same path within this process are serialized, so racing callers
    /// create at most one client. Across processes a duplicate client is tolerated.
    ///
    /// # Errors
    /// Returns an error if a query keeps failing, the creation fails, the keyring lock cannot
    /// be taken, the client id cannot be persisted or `cancel` fires.
    #[tracing::instrument(skip_all, fields(
        path = %pair.name,
        src_chain = %pair.src.chain_id(),
        dst_chain = %pair.dst.chain_id(),
    ))]
    pub async fn ensure_client<P: ChainProvider>(
        &self,
        pair: &mut ChainPair<P>,
        cancel: &CancellationToken,
    ) -> Result<String, RelayerError> {
        let path_lock = self.path_lock(&pair.name);
        let _serialized = path_lock.lock().await;

        let cached = match self.store.get(&pair.name).await? {
            Some(client_id) => Some((client_id, true)),
            None => pair.src.client_id().map(|id| (id.to_string(), false)),
        };

        if let Some((client_id, persisted)) = cached {
            match self.verify_on_chain(pair, &client_id, cancel).await {
                Ok(state) if !state.frozen => {
                    if !persisted {
                        self.store.set(&pair.name, &client_id).await?;
                    }
                    tracing::info!(
                        client_id,
                        latest_height = %state.latest_height,
                        "The light client already exists, skip creating it"
                    );
                    pair.src.set_client_id(client_id.clone());
                    return Ok(client_id);
                }
                Ok(_) => {
                    tracing::warn!(client_id, "The cached light client is frozen, creating a new one");
                }
                Err(RelayerError::Cancelled) => return Err(RelayerError::Cancelled),
                Err(err) => {
                    tracing::warn!(
                        client_id,
                        error = %err,
                        "The cached light client is not queryable, creating a new one"
                    );
                }
            }
        }

        let client_id = self.create(pair, cancel).await?;
        pair.src.set_client_id(client_id.clone());
        tracing::info!(client_id, "Successfully created the light client");

        self.await_queryable(pair, &client_id, cancel).await?;

        self.store.set(&pair.name, &client_id).await?;
        tracing::info!(client_id, "Stored the light client id");

        Ok(client_id)
    }

    fn path_lock(&self, path: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(in_flight.entry(path.to_string()).or_default())
    }

    /// Query the client at the lagged latest height of the home chain, in a single attempt.
    async fn verify_on_chain<P: ChainProvider>(
        &self,
        pair: &ChainPair<P>,
        client_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ClientState, RelayerError> {
        let (src_height, _) = query_latest_heights(&self.retry, cancel, &pair.src, &pair.dst).await?;

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(RelayerError::Cancelled),
            result = pair.src.provider().query_client_state(src_height, client_id) => {
                result.map_err(|cause| RelayerError::network("query client state", cause))
            }
        }
    }

    async fn create<P: ChainProvider>(
        &self,
        pair: &ChainPair<P>,
        cancel: &CancellationToken,
    ) -> Result<String, RelayerError> {
        tracing::info!("The light client does not exist, creating a new light client");

        let (src_height, dst_height) =
            query_latest_heights(&self.retry, cancel, &pair.src, &pair.dst).await?;

        let (src_provider, dst_provider) = (pair.src.provider(), pair.dst.provider());
        let (src_header, dst_header) = futures::try_join!(
            self.retry.run(cancel, "query home header", || {
                src_provider.query_ibc_header(src_height)
            }),
            self.retry.run(cancel, "query counterparty header", || {
                dst_provider.query_ibc_header(dst_height)
            }),
        )?;

        let unbonding_period = match self
            .retry
            .run(cancel, "query counterparty unbonding period", || {
                dst_provider.query_unbonding_period()
            })
            .await
        {
            Ok(unbonding_period) => Some(unbonding_period),
            Err(RelayerError::Cancelled) => return Err(RelayerError::Cancelled),
            Err(err) => {
                tracing::warn!(error = %err, "Falling back to the default trusting period");
                None
            }
        };

        let params = CreateClientParams {
            trusting_period: unbonding_period.map(trusting_period),
            unbonding_period,
            ..CreateClientParams::default()
        };

        self.keyring_lock
            .with_lock(|| {
                src_provider.create_client(
                    pair.src.key_name(),
                    &src_header,
                    &dst_header,
                    &params,
                    &self.memo,
                )
            })
            .await?
            .map_err(|cause| RelayerError::network("create client", cause))
    }

    /// Poll until the new client is queryable. Every query is retry bounded, the number of
    /// polls is not: the caller bounds the wait through `cancel`.
    async fn await_queryable<P: ChainProvider>(
        &self,
        pair: &ChainPair<P>,
        client_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), RelayerError> {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(RelayerError::Cancelled),
                () = tokio::time::sleep(self.poll_interval) => {}
            }

            let (src_height, _) =
                query_latest_heights(&self.retry, cancel, &pair.src, &pair.dst).await?;

            let src_provider = pair.src.provider();
            match self
                .retry
                .run(cancel, "query new client state", || {
                    src_provider.query_client_state(src_height, client_id)
                })
                .await
            {
                Ok(_) => {
                    tracing::info!(
                        client_id,
                        "The light client is committed on chain, finished creating it"
                    );
                    return Ok(());
                }
                Err(RelayerError::Cancelled) => return Err(RelayerError::Cancelled),
                Err(err) => {
                    tracing::info!(
                        client_id,
                        error = %err,
                        "The light client has not been committed on chain yet, keep waiting"
                    );
                }
            }
        }
    }
}
