//! In-memory [`ChainProvider`] used by the unit tests.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Mutex,
    },
    time::Duration,
};

use anyhow::Result;

use crate::{
    chain::{ChainProvider, ClientState, CreateClientParams, Height, IbcHeader, SendOutcome},
    metrics::RelayMetrics,
};

const REVISION: u64 = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MockHeader {
    pub chain_id: String,
    pub height: Height,
}

impl IbcHeader for MockHeader {
    fn height(&self) -> Height {
        self.height
    }
}

#[derive(Debug)]
pub struct MockUpdate {
    pub client_id: String,
    pub new_height: Height,
}

#[derive(Debug)]
struct HostedClient {
    state: ClientState,
    hidden_queries: u32,
}

#[derive(Debug)]
pub struct MockChain {
    chain_id: String,
    latest_height: AtomicU64,
    key_present: AtomicBool,
    failing_height_queries: AtomicU32,
    failing_submits: AtomicBool,
    unconfirmed_submits: AtomicBool,
    creation_visibility_delay: AtomicU32,
    signing_time: Duration,
    clients: Mutex<HashMap<String, HostedClient>>,
    next_client: AtomicU32,
    pub create_calls: AtomicU32,
    pub submit_calls: AtomicU32,
    pub client_state_queries: Mutex<Vec<Height>>,
    pub header_queries: Mutex<Vec<Height>>,
    pub last_trusting_period: Mutex<Option<Duration>>,
    signing: AtomicU32,
    pub max_concurrent_signing: AtomicU32,
}

impl MockChain {
    pub fn new(chain_id: &str, latest_height: u64) -> Self {
        Self {
            chain_id: chain_id.to_string(),
            latest_height: AtomicU64::new(latest_height),
            key_present: AtomicBool::new(true),
            failing_height_queries: AtomicU32::new(0),
            failing_submits: AtomicBool::new(false),
            unconfirmed_submits: AtomicBool::new(false),
            creation_visibility_delay: AtomicU32::new(0),
            signing_time: Duration::from_millis(20),
            clients: Mutex::new(HashMap::new()),
            next_client: AtomicU32::new(0),
            create_calls: AtomicU32::new(0),
            submit_calls: AtomicU32::new(0),
            client_state_queries: Mutex::new(Vec::new()),
            header_queries: Mutex::new(Vec::new()),
            last_trusting_period: Mutex::new(None),
            signing: AtomicU32::new(0),
            max_concurrent_signing: AtomicU32::new(0),
        }
    }

    pub fn without_key(self) -> Self {
        self.key_present.store(false, Ordering::SeqCst);
        self
    }

    pub fn fail_next_height_queries(&self, n: u32) {
        self.failing_height_queries.store(n, Ordering::SeqCst);
    }

    pub fn fail_submits(&self, fail: bool) {
        self.failing_submits.store(fail, Ordering::SeqCst);
    }

    pub fn leave_submits_unconfirmed(&self, unconfirmed: bool) {
        self.unconfirmed_submits.store(unconfirmed, Ordering::SeqCst);
    }

    /// New clients only become queryable after this many client state queries.
    pub fn delay_client_visibility(&self, queries: u32) {
        self.creation_visibility_delay
            .store(queries, Ordering::SeqCst);
    }

    pub fn host_client(&self, client_id: &str, counterparty: &str, height: Height) {
        self.clients.lock().unwrap().insert(
            client_id.to_string(),
            HostedClient {
                state: ClientState {
                    chain_id: counterparty.to_string(),
                    latest_height: height,
                    frozen: false,
                },
                hidden_queries: 0,
            },
        );
    }

    pub fn hosted_client(&self, client_id: &str) -> Option<ClientState> {
        self.clients
            .lock()
            .unwrap()
            .get(client_id)
            .map(|client| client.state.clone())
    }

    pub fn create_count(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn submit_count(&self) -> u32 {
        self.submit_calls.load(Ordering::SeqCst)
    }

    async fn sign(&self) {
        let now = self.signing.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_signing.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.signing_time).await;
        self.signing.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl ChainProvider for MockChain {
    type Header = MockHeader;
    type ClientMessage = MockHeader;
    type Message = MockUpdate;

    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    fn key_exists(&self, _key_name: &str) -> bool {
        self.key_present.load(Ordering::SeqCst)
    }

    async fn query_latest_height(&self) -> Result<Height> {
        let failing = self.failing_height_queries.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_height_queries
                .store(failing - 1, Ordering::SeqCst);
            anyhow::bail!("{} rpc unavailable", self.chain_id);
        }
        Ok(Height::new(
            REVISION,
            self.latest_height.load(Ordering::SeqCst),
        ))
    }

    async fn query_client_state(&self, height: Height, client_id: &str) -> Result<ClientState> {
        self.client_state_queries.lock().unwrap().push(height);
        let mut clients = self.clients.lock().unwrap();
        let client = clients
            .get_mut(client_id)
            .ok_or_else(|| anyhow::anyhow!("client {client_id} not found"))?;
        if client.hidden_queries > 0 {
            client.hidden_queries -= 1;
            anyhow::bail!("client {client_id} not found");
        }
        Ok(client.state.clone())
    }

    async fn query_ibc_header(&self, height: Height) -> Result<MockHeader> {
        self.header_queries.lock().unwrap().push(height);
        Ok(MockHeader {
            chain_id: self.chain_id.clone(),
            height,
        })
    }

    async fn query_unbonding_period(&self) -> Result<Duration> {
        Ok(Duration::from_secs(100 * 60 * 60))
    }

    async fn create_client(
        &self,
        _key_name: &str,
        _own_header: &MockHeader,
        counterparty_header: &MockHeader,
        params: &CreateClientParams,
        _memo: &str,
    ) -> Result<String> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.sign().await;
        *self.last_trusting_period.lock().unwrap() = params.trusting_period;

        let client_id = format!(
            "07-tendermint-{}",
            self.next_client.fetch_add(1, Ordering::SeqCst)
        );
        self.clients.lock().unwrap().insert(
            client_id.clone(),
            HostedClient {
                state: ClientState {
                    chain_id: counterparty_header.chain_id.clone(),
                    latest_height: counterparty_header.height,
                    frozen: false,
                },
                hidden_queries: self.creation_visibility_delay.load(Ordering::SeqCst),
            },
        );
        Ok(client_id)
    }

    async fn build_update_header(
        &self,
        latest: &MockHeader,
        _trusted_height: Height,
        _trusted: &MockHeader,
    ) -> Result<MockHeader> {
        Ok(latest.clone())
    }

    async fn build_update_message(
        &self,
        client_id: &str,
        client_message: MockHeader,
    ) -> Result<MockUpdate> {
        Ok(MockUpdate {
            client_id: client_id.to_string(),
            new_height: client_message.height,
        })
    }

    async fn submit(
        &self,
        _key_name: &str,
        messages: Vec<MockUpdate>,
        _memo: &str,
    ) -> Result<SendOutcome> {
        let n = self.submit_calls.fetch_add(1, Ordering::SeqCst);
        self.sign().await;
        if self.failing_submits.load(Ordering::SeqCst) {
            anyhow::bail!("tx rejected");
        }

        for message in messages {
            if let Some(client) = self.clients.lock().unwrap().get_mut(&message.client_id) {
                client.state.latest_height = message.new_height;
            }
        }

        let tx_hash = format!("TX{n}");
        if self.unconfirmed_submits.load(Ordering::SeqCst) {
            return Ok(SendOutcome::Unconfirmed {
                tx_hash,
                reason: "tx not found before timeout".to_string(),
            });
        }
        Ok(SendOutcome::Committed { tx_hash })
    }
}

/// Counts every metric call keyed by `(src, dst)`.
#[derive(Debug, Default)]
pub struct CountingMetrics {
    pub relayed_headers: Mutex<HashMap<(String, String), u32>>,
    pub failed_headers: Mutex<HashMap<(String, String), u32>>,
    pub relayed_pairs: Mutex<HashMap<(String, String), u32>>,
    pub failed_pairs: Mutex<HashMap<(String, String), u32>>,
}

impl CountingMetrics {
    fn bump(counter: &Mutex<HashMap<(String, String), u32>>, src: &str, dst: &str) {
        *counter
            .lock()
            .unwrap()
            .entry((src.to_string(), dst.to_string()))
            .or_default() += 1;
    }

    pub fn get(counter: &Mutex<HashMap<(String, String), u32>>, src: &str, dst: &str) -> u32 {
        counter
            .lock()
            .unwrap()
            .get(&(src.to_string(), dst.to_string()))
            .copied()
            .unwrap_or_default()
    }
}

impl RelayMetrics for CountingMetrics {
    fn relayed_header(&self, src_chain: &str, dst_chain: &str) {
        Self::bump(&self.relayed_headers, src_chain, dst_chain);
    }

    fn failed_header(&self, src_chain: &str, dst_chain: &str) {
        Self::bump(&self.failed_headers, src_chain, dst_chain);
    }

    fn relayed_pair(&self, src_chain: &str, dst_chain: &str) {
        Self::bump(&self.relayed_pairs, src_chain, dst_chain);
    }

    fn failed_pair(&self, src_chain: &str, dst_chain: &str) {
        Self::bump(&self.failed_pairs, src_chain, dst_chain);
    }
}
