//! Defines the [`ChainProvider`] trait and the endpoint types that tie a provider to a path.

use std::{fmt, sync::Arc, time::Duration};

use anyhow::Result;

/// An IBC height.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Height {
    /// The revision (chain id epoch) number.
    pub revision_number: u64,
    /// The block height within the revision.
    pub revision_height: u64,
}

impl Height {
    /// Create a new height.
    #[must_use]
    pub const fn new(revision_number: u64, revision_height: u64) -> Self {
        Self {
            revision_number,
            revision_height,
        }
    }

    /// The height of the previous block, saturating at zero.
    #[must_use]
    pub const fn decrement(self) -> Self {
        Self::new(self.revision_number, self.revision_height.saturating_sub(1))
    }

    /// The height of the next block.
    #[must_use]
    pub const fn increment(self) -> Self {
        Self::new(self.revision_number, self.revision_height.saturating_add(1))
    }
}

impl fmt::Display for Height {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.revision_number, self.revision_height)
    }
}

/// The parts of an on-chain light client state the relayer needs.
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(clippy::module_name_repetitions)]
pub struct ClientState {
    /// Chain id of the tracked chain.
    pub chain_id: String,
    /// Latest height the client has been updated to.
    pub latest_height: Height,
    /// Whether the client has been frozen after misbehaviour.
    pub frozen: bool,
}

/// Parameters for creating a light client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateClientParams {
    /// Allow governance to recover the client after it expired.
    pub allow_update_after_expiry: bool,
    /// Allow governance to recover the client after misbehaviour.
    pub allow_update_after_misbehaviour: bool,
    /// Create a new client even if a matching one already exists.
    pub override_existing: bool,
    /// Trusting period of the new client; `None` lets the chain pick its default.
    pub trusting_period: Option<Duration>,
    /// Unbonding period of the counterparty; `None` if it could not be queried.
    pub unbonding_period: Option<Duration>,
}

impl Default for CreateClientParams {
    fn default() -> Self {
        Self {
            allow_update_after_expiry: true,
            allow_update_after_misbehaviour: true,
            override_existing: true,
            trusting_period: None,
            unbonding_period: None,
        }
    }
}

/// Result of a successful submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// The transaction was included in a block.
    Committed {
        /// Hash of the transaction.
        tx_hash: String,
    },
    /// The transaction was accepted by the node but its inclusion could not be confirmed.
    Unconfirmed {
        /// Hash of the transaction.
        tx_hash: String,
        /// Why inclusion could not be confirmed.
        reason: String,
    },
}

impl SendOutcome {
    /// Hash of the submitted transaction.
    #[must_use]
    pub fn tx_hash(&self) -> &str {
        match self {
            Self::Committed { tx_hash } | Self::Unconfirmed { tx_hash, .. } => tx_hash,
        }
    }

    /// Whether the transaction was only partially sent.
    #[must_use]
    pub const fn is_partial(&self) -> bool {
        matches!(self, Self::Unconfirmed { .. })
    }

    /// Treat a partial send as an error, for callers that require confirmed inclusion.
    ///
    /// # Errors
    /// Returns [`crate::error::RelayerError::PartialSend`] if the outcome is unconfirmed.
    pub fn into_result(self) -> Result<String, crate::error::RelayerError> {
        match self {
            Self::Committed { tx_hash } => Ok(tx_hash),
            Self::Unconfirmed { tx_hash, reason } => {
                Err(crate::error::RelayerError::PartialSend { tx_hash, reason })
            }
        }
    }
}

/// Header material queried from a chain.
pub trait IbcHeader: Clone + Send + Sync + 'static {
    /// The height of the header.
    fn height(&self) -> Height;
}

/// The query and submit capability of a single chain.
///
/// Providers are shared across paths, so implementations must not hold any path specific state.
#[async_trait::async_trait]
pub trait ChainProvider: Send + Sync + 'static {
    /// Header material used to create and update clients of this chain.
    type Header: IbcHeader;
    /// A header update for a client of this chain.
    type ClientMessage: Send + Sync + 'static;
    /// A message that can be submitted to this chain.
    type Message: Send + Sync + 'static;

    /// The chain id.
    fn chain_id(&self) -> &str;

    /// Whether the signing key exists in the keyring.
    fn key_exists(&self, key_name: &str) -> bool;

    /// Query the latest block height.
    async fn query_latest_height(&self) -> Result<Height>;

    /// Query the state of a client hosted on this chain at the given height.
    async fn query_client_state(&self, height: Height, client_id: &str) -> Result<ClientState>;

    /// Query the header material at the given height.
    async fn query_ibc_header(&self, height: Height) -> Result<Self::Header>;

    /// Query the staking unbonding period.
    async fn query_unbonding_period(&self) -> Result<Duration>;

    /// Create a client of the counterparty on this chain and return its id.
    ///
    /// The caller must hold the keyring lock.
    async fn create_client(
        &self,
        key_name: &str,
        own_header: &Self::Header,
        counterparty_header: &Self::Header,
        params: &CreateClientParams,
        memo: &str,
    ) -> Result<String>;

    /// Build a header update for a client of this chain.
    async fn build_update_header(
        &self,
        latest: &Self::Header,
        trusted_height: Height,
        trusted: &Self::Header,
    ) -> Result<Self::ClientMessage>;

    /// Build the message updating the given client hosted on this chain.
    async fn build_update_message(
        &self,
        client_id: &str,
        client_message: Self::ClientMessage,
    ) -> Result<Self::Message>;

    /// Sign and submit messages to this chain.
    ///
    /// The caller must hold the keyring lock.
    async fn submit(
        &self,
        key_name: &str,
        messages: Vec<Self::Message>,
        memo: &str,
    ) -> Result<SendOutcome>;
}

/// A chain as seen from one path: a shared provider, a signing key and the path's client id.
#[derive(Debug)]
#[allow(clippy::module_name_repetitions)]
pub struct ChainEndpoint<P> {
    provider: Arc<P>,
    key_name: String,
    client_id: Option<String>,
}

impl<P> Clone for ChainEndpoint<P> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            key_name: self.key_name.clone(),
            client_id: self.client_id.clone(),
        }
    }
}

impl<P: ChainProvider> ChainEndpoint<P> {
    /// Create a new endpoint without a client id.
    #[must_use]
    pub fn new(provider: Arc<P>, key_name: impl Into<String>) -> Self {
        Self {
            provider,
            key_name: key_name.into(),
            client_id: None,
        }
    }

    /// Attach a known client id to the endpoint.
    #[must_use]
    pub fn with_client_id(mut self, client_id: Option<String>) -> Self {
        self.client_id = client_id;
        self
    }

    /// The chain id of the provider.
    #[must_use]
    pub fn chain_id(&self) -> &str {
        self.provider.chain_id()
    }

    /// The provider.
    #[must_use]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// The name of the signing key.
    #[must_use]
    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    /// The client id attached to this endpoint, if any.
    #[must_use]
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Record the client id once it is known.
    pub fn set_client_id(&mut self, client_id: impl Into<String>) {
        self.client_id = Some(client_id.into());
    }
}

/// One relaying direction: `src` hosts a light client of `dst`.
#[derive(Debug)]
#[allow(clippy::module_name_repetitions)]
pub struct ChainPair<P> {
    /// The path name, used as the key of the client id store.
    pub name: String,
    /// The home chain, which hosts the client and signs the transactions.
    pub src: ChainEndpoint<P>,
    /// The counterparty chain, whose headers are relayed.
    pub dst: ChainEndpoint<P>,
}

impl<P> Clone for ChainPair<P> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            src: self.src.clone(),
            dst: self.dst.clone(),
        }
    }
}

impl<P: ChainProvider> ChainPair<P> {
    /// Create a pair from copies of the given endpoints, so that pairs never share a client id.
    #[must_use]
    pub fn new(name: impl Into<String>, src: &ChainEndpoint<P>, dst: &ChainEndpoint<P>) -> Self {
        Self {
            name: name.into(),
            src: src.clone(),
            dst: dst.clone(),
        }
    }

    /// The client id of the counterparty on the home chain.
    ///
    /// # Errors
    /// Returns a configuration error if the client has not been bootstrapped.
    pub fn client_id(&self) -> Result<&str, crate::error::RelayerError> {
        self.src.client_id().ok_or_else(|| {
            crate::error::RelayerError::Configuration(format!(
                "no client of {} is known on {} for path {}",
                self.dst.chain_id(),
                self.src.chain_id(),
                self.name
            ))
        })
    }
}
