//! Defines [`CosmosChain`], the [`ChainProvider`] of Cosmos SDK chains, reached over CometBFT RPC.

pub mod keyring;
pub mod query;
pub mod tx;

use std::{path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use ibc_core_host_types::identifiers::ChainId;
use ibc_proto::{
    google::protobuf::{Any, Duration as ProtoDuration, Timestamp},
    ibc::{
        core::{
            client::v1::{Height as ProtoHeight, MsgCreateClient, MsgUpdateClient},
            commitment::v1::MerkleRoot,
        },
        lightclients::tendermint::v1::{
            ClientState as TmClientState, ConsensusState as TmConsensusState, Fraction,
            Header as TmHeader,
        },
    },
};
use prost::Message;
use tendermint::{block::signed_header::SignedHeader, validator};
use tendermint_rpc::{Client, HttpClient, Paging};

use crate::chain::{
    ChainProvider, ClientState, CreateClientParams, Height, IbcHeader, SendOutcome,
};

use self::{
    keyring::Keyring,
    query::CosmosRpcExt,
    tx::{sign_and_encode_tx, GasPrice},
};

const MSG_CREATE_CLIENT_TYPE_URL: &str = "/ibc.core.client.v1.MsgCreateClient";
const MSG_UPDATE_CLIENT_TYPE_URL: &str = "/ibc.core.client.v1.MsgUpdateClient";
const TM_CLIENT_STATE_TYPE_URL: &str = "/ibc.lightclients.tendermint.v1.ClientState";
const TM_CONSENSUS_STATE_TYPE_URL: &str = "/ibc.lightclients.tendermint.v1.ConsensusState";
const TM_HEADER_TYPE_URL: &str = "/ibc.lightclients.tendermint.v1.Header";
const CREATE_CLIENT_EVENT: &str = "create_client";
const CLIENT_ID_ATTRIBUTE: &str = "client_id";

/// Unbonding period assumed when the counterparty's could not be queried.
pub const DEFAULT_UNBONDING_PERIOD: Duration = Duration::from_secs(21 * 24 * 60 * 60);
/// Default time to wait for a broadcast transaction to be included.
pub const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection and signing parameters of a Cosmos SDK chain.
#[derive(Clone, Debug)]
pub struct CosmosChainConfig {
    /// The chain id.
    pub chain_id: String,
    /// CometBFT RPC endpoint.
    pub rpc_url: String,
    /// Bech32 prefix of account addresses.
    pub account_prefix: String,
    /// Gas limit of every transaction.
    pub gas_limit: u64,
    /// Gas price used to compute the fee.
    pub gas_price: GasPrice,
    /// How long to wait for a broadcast transaction to be included.
    pub confirmation_timeout: Duration,
    /// The keyring directory, `<home>/keys`.
    pub keys_dir: PathBuf,
}

/// Header material of a Cosmos SDK chain: a signed header and the validator set that signed it.
#[derive(Clone, Debug)]
pub struct CosmosHeader {
    /// The signed header.
    pub signed_header: SignedHeader,
    /// The validator set at the header's height.
    pub validator_set: validator::Set,
    /// The IBC height of the header.
    pub height: Height,
}

impl IbcHeader for CosmosHeader {
    fn height(&self) -> Height {
        self.height
    }
}

impl CosmosHeader {
    /// The consensus state a tendermint client stores for this header.
    #[must_use]
    pub fn to_consensus_state(&self) -> TmConsensusState {
        let header = &self.signed_header.header;
        TmConsensusState {
            timestamp: Some(to_proto_timestamp(header.time)),
            root: Some(MerkleRoot {
                hash: header.app_hash.as_bytes().to_vec(),
            }),
            next_validators_hash: header.next_validators_hash.as_bytes().to_vec(),
        }
    }
}

/// A message to a Cosmos SDK chain. The signer is filled in at submission.
#[derive(Clone, Debug)]
pub enum CosmosMsg {
    /// Create a client.
    CreateClient(MsgCreateClient),
    /// Update a client.
    UpdateClient(MsgUpdateClient),
}

impl CosmosMsg {
    fn into_any(self, signer: &str) -> Any {
        match self {
            Self::CreateClient(mut msg) => {
                msg.signer = signer.to_string();
                to_any(MSG_CREATE_CLIENT_TYPE_URL, &msg)
            }
            Self::UpdateClient(mut msg) => {
                msg.signer = signer.to_string();
                to_any(MSG_UPDATE_CLIENT_TYPE_URL, &msg)
            }
        }
    }
}

/// A Cosmos SDK chain reached over CometBFT RPC.
#[derive(Clone, Debug)]
pub struct CosmosChain {
    config: CosmosChainConfig,
    revision_number: u64,
    client: HttpClient,
    keyring: Keyring,
}

impl CosmosChain {
    /// Create a provider for the chain described by `config`.
    ///
    /// # Errors
    /// Returns an error if the chain id or the RPC url is invalid.
    pub fn new(config: CosmosChainConfig) -> Result<Self> {
        let revision_number = ChainId::from_str(&config.chain_id)
            .with_context(|| format!("invalid chain id {}", config.chain_id))?
            .revision_number();
        let client = HttpClient::new(config.rpc_url.as_str())
            .with_context(|| format!("invalid rpc url {}", config.rpc_url))?;
        let keyring = Keyring::new(&config.keys_dir, &config.chain_id);

        Ok(Self {
            config,
            revision_number,
            client,
            keyring,
        })
    }

    /// The chain configuration.
    #[must_use]
    pub const fn config(&self) -> &CosmosChainConfig {
        &self.config
    }

    const fn height(&self, revision_height: u64) -> Height {
        Height::new(self.revision_number, revision_height)
    }

    /// Sign, broadcast and wait for a transaction. Returns the hash and the result, if the
    /// transaction was found before the confirmation timeout.
    async fn broadcast(
        &self,
        key_name: &str,
        messages: Vec<CosmosMsg>,
        memo: &str,
    ) -> Result<(String, Option<tendermint_rpc::endpoint::tx::Response>)> {
        let key = self.keyring.load(key_name)?;
        if !key.address().starts_with(&self.config.account_prefix) {
            anyhow::bail!(
                "key {key_name} has address {}, expected prefix {}",
                key.address(),
                self.config.account_prefix
            );
        }
        let account = self
            .client
            .base_account(key.address())
            .await
            .context("failed to query the signer account")?;

        let messages = messages
            .into_iter()
            .map(|msg| msg.into_any(key.address()))
            .collect();
        let tx_bytes = sign_and_encode_tx(
            &self.config.chain_id,
            &key,
            &account,
            memo,
            messages,
            self.config.gas_price.fee(self.config.gas_limit),
        )?;

        let response = self.client.broadcast_tx_sync(tx_bytes).await?;
        if response.code.is_err() {
            anyhow::bail!(
                "transaction rejected by {} with code {}: {}",
                self.config.chain_id,
                response.code.value(),
                response.log
            );
        }

        let tx_hash = response.hash.to_string();
        tracing::debug!(
            chain_id = %self.config.chain_id,
            tx_hash,
            sequence = account.sequence,
            "Broadcast transaction"
        );

        let result = self
            .client
            .wait_for_tx(response.hash, self.config.confirmation_timeout)
            .await?;
        if let Some(result) = &result {
            if result.tx_result.code.is_err() {
                anyhow::bail!(
                    "transaction {tx_hash} failed with code {}: {}",
                    result.tx_result.code.value(),
                    result.tx_result.log
                );
            }
        }

        Ok((tx_hash, result))
    }

    /// An existing, non frozen client of `counterparty_chain_id`, if any.
    async fn find_existing_client(&self, counterparty_chain_id: &str) -> Result<Option<String>> {
        Ok(self
            .client
            .tendermint_client_states()
            .await?
            .into_iter()
            .find(|(_, state)| state.chain_id == counterparty_chain_id && !is_frozen(state))
            .map(|(client_id, _)| client_id))
    }
}

#[async_trait::async_trait]
impl ChainProvider for CosmosChain {
    type Header = CosmosHeader;
    type ClientMessage = TmHeader;
    type Message = CosmosMsg;

    fn chain_id(&self) -> &str {
        &self.config.chain_id
    }

    fn key_exists(&self, key_name: &str) -> bool {
        self.keyring.exists(key_name)
    }

    async fn query_latest_height(&self) -> Result<Height> {
        let status = self.client.status().await?;
        Ok(self.height(status.sync_info.latest_block_height.value()))
    }

    async fn query_client_state(&self, height: Height, client_id: &str) -> Result<ClientState> {
        let state = self
            .client
            .tendermint_client_state(client_id, height.revision_height)
            .await?;

        let latest_height = state
            .latest_height
            .ok_or_else(|| anyhow::anyhow!("client {client_id} has no latest height"))?;
        Ok(ClientState {
            frozen: is_frozen(&state),
            chain_id: state.chain_id,
            latest_height: Height::new(
                latest_height.revision_number,
                latest_height.revision_height,
            ),
        })
    }

    async fn query_ibc_header(&self, height: Height) -> Result<CosmosHeader> {
        let block_height = tendermint::block::Height::try_from(height.revision_height)?;
        let (commit, validators) = futures::try_join!(
            self.client.commit(block_height),
            self.client.validators(block_height, Paging::All),
        )?;

        let signed_header = commit.signed_header;
        let validator_set = validator::Set::with_proposer(
            validators.validators,
            signed_header.header.proposer_address,
        )?;

        Ok(CosmosHeader {
            signed_header,
            validator_set,
            height,
        })
    }

    async fn query_unbonding_period(&self) -> Result<Duration> {
        let unbonding_time = self
            .client
            .staking_params()
            .await?
            .unbonding_time
            .ok_or_else(|| anyhow::anyhow!("no unbonding time found"))?;
        Ok(Duration::new(
            u64::try_from(unbonding_time.seconds)?,
            u32::try_from(unbonding_time.nanos)?,
        ))
    }

    #[tracing::instrument(skip_all, fields(chain_id = %self.config.chain_id))]
    async fn create_client(
        &self,
        key_name: &str,
        _own_header: &CosmosHeader,
        counterparty_header: &CosmosHeader,
        params: &CreateClientParams,
        memo: &str,
    ) -> Result<String> {
        let counterparty_chain_id = counterparty_header.signed_header.header.chain_id.as_str();
        if !params.override_existing {
            if let Some(client_id) = self.find_existing_client(counterparty_chain_id).await? {
                tracing::info!(client_id, "Reusing the existing light client");
                return Ok(client_id);
            }
        }

        let client_state =
            build_client_state(counterparty_chain_id, counterparty_header.height, params);
        let msg = MsgCreateClient {
            client_state: Some(to_any(TM_CLIENT_STATE_TYPE_URL, &client_state)),
            consensus_state: Some(to_any(
                TM_CONSENSUS_STATE_TYPE_URL,
                &counterparty_header.to_consensus_state(),
            )),
            signer: String::new(),
        };

        let (tx_hash, result) = self
            .broadcast(key_name, vec![CosmosMsg::CreateClient(msg)], memo)
            .await?;
        let result = result.ok_or_else(|| {
            anyhow::anyhow!("create client transaction {tx_hash} was not confirmed in time")
        })?;

        result
            .tx_result
            .events
            .iter()
            .filter(|event| event.kind == CREATE_CLIENT_EVENT)
            .flat_map(|event| event.attributes.iter())
            .find(|attribute| attribute.key_str().is_ok_and(|key| key == CLIENT_ID_ATTRIBUTE))
            .and_then(|attribute| attribute.value_str().ok())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("no client id found in the events of {tx_hash}"))
    }

    async fn build_update_header(
        &self,
        latest: &CosmosHeader,
        trusted_height: Height,
        trusted: &CosmosHeader,
    ) -> Result<TmHeader> {
        if trusted_height >= latest.height {
            anyhow::bail!(
                "the client is already at height {trusted_height}, not older than {}",
                latest.height
            );
        }

        Ok(TmHeader {
            signed_header: Some(latest.signed_header.clone().into()),
            validator_set: Some(latest.validator_set.clone().into()),
            trusted_height: Some(to_proto_height(trusted_height)),
            trusted_validators: Some(trusted.validator_set.clone().into()),
        })
    }

    async fn build_update_message(
        &self,
        client_id: &str,
        client_message: TmHeader,
    ) -> Result<CosmosMsg> {
        Ok(CosmosMsg::UpdateClient(MsgUpdateClient {
            client_id: client_id.to_string(),
            client_message: Some(to_any(TM_HEADER_TYPE_URL, &client_message)),
            signer: String::new(),
        }))
    }

    #[tracing::instrument(skip_all, fields(chain_id = %self.config.chain_id))]
    async fn submit(
        &self,
        key_name: &str,
        messages: Vec<CosmosMsg>,
        memo: &str,
    ) -> Result<SendOutcome> {
        let (tx_hash, result) = self.broadcast(key_name, messages, memo).await?;
        Ok(match result {
            Some(_) => SendOutcome::Committed { tx_hash },
            None => SendOutcome::Unconfirmed {
                tx_hash,
                reason: format!(
                    "not included within {:?}",
                    self.config.confirmation_timeout
                ),
            },
        })
    }
}

/// Build the state of a tendermint client tracking `chain_id` from `latest_height`.
#[allow(deprecated)]
fn build_client_state(
    chain_id: &str,
    latest_height: Height,
    params: &CreateClientParams,
) -> TmClientState {
    let unbonding_period = params.unbonding_period.unwrap_or(DEFAULT_UNBONDING_PERIOD);
    // Defaults to the recommended 2/3 of the unbonding period
    let trusting_period = params
        .trusting_period
        .unwrap_or_else(|| unbonding_period / 3 * 2);

    TmClientState {
        chain_id: chain_id.to_string(),
        trust_level: Some(Fraction {
            numerator: 1,
            denominator: 3,
        }),
        trusting_period: Some(to_proto_duration(trusting_period)),
        unbonding_period: Some(to_proto_duration(unbonding_period)),
        max_clock_drift: Some(ProtoDuration {
            seconds: 15,
            nanos: 0,
        }),
        latest_height: Some(to_proto_height(latest_height)),
        proof_specs: vec![ics23::iavl_spec(), ics23::tendermint_spec()],
        upgrade_path: vec!["upgrade".to_string(), "upgradedIBCState".to_string()],
        allow_update_after_expiry: params.allow_update_after_expiry,
        allow_update_after_misbehaviour: params.allow_update_after_misbehaviour,
        ..Default::default()
    }
}

fn is_frozen(state: &TmClientState) -> bool {
    state
        .frozen_height
        .as_ref()
        .is_some_and(|height| height.revision_number != 0 || height.revision_height != 0)
}

fn to_any<M: Message>(type_url: &str, msg: &M) -> Any {
    Any {
        type_url: type_url.to_string(),
        value: msg.encode_to_vec(),
    }
}

const fn to_proto_height(height: Height) -> ProtoHeight {
    ProtoHeight {
        revision_number: height.revision_number,
        revision_height: height.revision_height,
    }
}

#[allow(clippy::cast_possible_wrap)]
const fn to_proto_duration(duration: Duration) -> ProtoDuration {
    ProtoDuration {
        seconds: duration.as_secs() as i64,
        nanos: duration.subsec_nanos() as i32,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn to_proto_timestamp(time: tendermint::Time) -> Timestamp {
    let nanos = time.unix_timestamp_nanos();
    Timestamp {
        seconds: nanos.div_euclid(1_000_000_000) as i64,
        nanos: nanos.rem_euclid(1_000_000_000) as i32,
    }
}
