//! ABCI queries and transaction lookups over CometBFT RPC.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ibc_proto::{
    cosmos::{
        auth::v1beta1::{BaseAccount, QueryAccountRequest, QueryAccountResponse},
        staking::v1beta1::{Params as StakingParams, QueryParamsRequest, QueryParamsResponse},
    },
    ibc::{
        core::client::v1::{
            QueryClientStateRequest, QueryClientStateResponse, QueryClientStatesRequest,
            QueryClientStatesResponse,
        },
        lightclients::tendermint::v1::ClientState as TmClientState,
    },
};
use prost::Message;
use tendermint::{block, Hash};
use tendermint_rpc::{endpoint::tx, Client, HttpClient};

const TENDERMINT_CLIENT_STATE_TYPE_URL: &str = "/ibc.lightclients.tendermint.v1.ClientState";
const BASE_ACCOUNT_TYPE_URL: &str = "/cosmos.auth.v1beta1.BaseAccount";
const TX_POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Typed Cosmos SDK queries on top of the CometBFT RPC client.
#[async_trait::async_trait]
pub trait CosmosRpcExt {
    /// Run an ABCI query at `height`, or at the latest height if `None`.
    async fn abci_decode<Req, Res>(
        &self,
        path: &str,
        request: Req,
        height: Option<u64>,
    ) -> Result<Res>
    where
        Req: Message + Send + 'static,
        Res: Message + Default + Send;

    /// The tendermint client state of `client_id`.
    async fn tendermint_client_state(&self, client_id: &str, height: u64) -> Result<TmClientState>;

    /// Every tendermint client hosted on the chain, with its id.
    async fn tendermint_client_states(&self) -> Result<Vec<(String, TmClientState)>>;

    /// The staking module parameters.
    async fn staking_params(&self) -> Result<StakingParams>;

    /// The base account of `address`.
    async fn base_account(&self, address: &str) -> Result<BaseAccount>;

    /// Poll for the result of transaction `hash` until it is found or `timeout` elapses.
    async fn wait_for_tx(&self, hash: Hash, timeout: Duration) -> Result<Option<tx::Response>>;
}

#[async_trait::async_trait]
impl CosmosRpcExt for HttpClient {
    async fn abci_decode<Req, Res>(
        &self,
        path: &str,
        request: Req,
        height: Option<u64>,
    ) -> Result<Res>
    where
        Req: Message + Send + 'static,
        Res: Message + Default + Send,
    {
        let height = height.map(block::Height::try_from).transpose()?;
        let response = self
            .abci_query(Some(path.to_string()), request.encode_to_vec(), height, false)
            .await
            .with_context(|| format!("abci query {path} failed"))?;

        if response.code.is_err() {
            anyhow::bail!(
                "abci query {path} returned code {}: {}",
                response.code.value(),
                response.log
            );
        }

        Res::decode(response.value.as_slice())
            .with_context(|| format!("failed to decode the response of {path}"))
    }

    async fn tendermint_client_state(&self, client_id: &str, height: u64) -> Result<TmClientState> {
        let response: QueryClientStateResponse = self
            .abci_decode(
                "/ibc.core.client.v1.Query/ClientState",
                QueryClientStateRequest {
                    client_id: client_id.to_string(),
                },
                Some(height),
            )
            .await?;

        let any = response
            .client_state
            .ok_or_else(|| anyhow::anyhow!("client {client_id} not found"))?;
        decode_tendermint_client_state(&any.type_url, &any.value)
            .with_context(|| format!("unexpected client state for {client_id}"))
    }

    async fn tendermint_client_states(&self) -> Result<Vec<(String, TmClientState)>> {
        let response: QueryClientStatesResponse = self
            .abci_decode(
                "/ibc.core.client.v1.Query/ClientStates",
                QueryClientStatesRequest { pagination: None },
                None,
            )
            .await?;

        Ok(response
            .client_states
            .into_iter()
            .filter_map(|identified| {
                let any = identified.client_state?;
                decode_tendermint_client_state(&any.type_url, &any.value)
                    .ok()
                    .map(|state| (identified.client_id, state))
            })
            .collect())
    }

    async fn staking_params(&self) -> Result<StakingParams> {
        let response: QueryParamsResponse = self
            .abci_decode(
                "/cosmos.staking.v1beta1.Query/Params",
                QueryParamsRequest {},
                None,
            )
            .await?;

        response
            .params
            .ok_or_else(|| anyhow::anyhow!("no staking params found"))
    }

    async fn base_account(&self, address: &str) -> Result<BaseAccount> {
        let response: QueryAccountResponse = self
            .abci_decode(
                "/cosmos.auth.v1beta1.Query/Account",
                QueryAccountRequest {
                    address: address.to_string(),
                },
                None,
            )
            .await?;

        let any = response
            .account
            .ok_or_else(|| anyhow::anyhow!("account {address} not found"))?;
        if any.type_url != BASE_ACCOUNT_TYPE_URL {
            anyhow::bail!("account {address} has unsupported type {}", any.type_url);
        }
        Ok(BaseAccount::decode(any.value.as_slice())?)
    }

    async fn wait_for_tx(&self, hash: Hash, timeout: Duration) -> Result<Option<tx::Response>> {
        let start = Instant::now();
        loop {
            match self.tx(hash, false).await {
                Ok(response) => return Ok(Some(response)),
                Err(err) if start.elapsed() < timeout => {
                    tracing::trace!(%hash, error = %err, "Transaction not found yet");
                    tokio::time::sleep(TX_POLL_INTERVAL).await;
                }
                Err(err) => {
                    tracing::debug!(%hash, error = %err, "Gave up waiting for the transaction");
                    return Ok(None);
                }
            }
        }
    }
}

/// Decode a tendermint client state carried in an `Any`.
///
/// # Errors
/// Returns an error if the state is not a tendermint client state.
pub fn decode_tendermint_client_state(type_url: &str, value: &[u8]) -> Result<TmClientState> {
    if type_url != TENDERMINT_CLIENT_STATE_TYPE_URL {
        anyhow::bail!("expected a tendermint client state, got {type_url}");
    }
    Ok(TmClientState::decode(value)?)
}
