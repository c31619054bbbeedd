//! In-memory ledgers, gas feeds and stores for exercising the relay without a node.

use crate::{
    abi::TokensLocked,
    checkpoint::{CheckpointStore, MemoryCheckpointStore},
    connection::LedgerClient,
    error::{ChainError, CheckpointError, GasFeedError},
    gas_oracle::GasFeed,
    types::{BlockRange, LockEvent},
};
use alloy_primitives::{keccak256, Address, B256, U256};
use alloy_rpc_types::{Filter, Log};
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::SolEvent;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    io,
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
};

/// Address of the bridge contract the helper logs are emitted from
pub const BRIDGE_ADDRESS: Address = Address::repeat_byte(0x12);

/// Builds a mined `TokensLocked` log.
pub fn lock_log(block: u64, log_index: u64, from: Address, amount: u64, nonce: u64) -> Log {
    let event = TokensLocked {
        from,
        toChainId: U256::from(2),
        amount: U256::from(amount),
        nonce: U256::from(nonce),
    };
    Log {
        inner: alloy_primitives::Log { address: BRIDGE_ADDRESS, data: event.encode_log_data() },
        block_number: Some(block),
        transaction_hash: Some(tx_hash(block, log_index)),
        log_index: Some(log_index),
        ..Default::default()
    }
}

/// Builds a decoded lock event at `block`.
pub fn lock_event(block: u64, from: Address, amount: u64, nonce: u64) -> LockEvent {
    LockEvent {
        from,
        to_chain_id: U256::from(2),
        amount: U256::from(amount),
        nonce: U256::from(nonce),
        block_number: block,
        transaction_hash: tx_hash(block, 0),
        log_index: 0,
    }
}

fn tx_hash(block: u64, log_index: u64) -> B256 {
    keccak256([block.to_be_bytes(), log_index.to_be_bytes()].concat())
}

/// Deterministic relayer key
pub fn test_signer() -> PrivateKeySigner {
    PrivateKeySigner::from_bytes(&B256::repeat_byte(0x42)).expect("valid private key")
}

#[derive(Debug)]
struct LedgerState {
    head: u64,
    reachable: bool,
    logs: Vec<Log>,
    gas_price: u128,
    transaction_count: u64,
    chain_id: u64,
    transaction_count_error: Option<ChainError>,
    chain_id_error: Option<ChainError>,
    failing_ranges: HashMap<BlockRange, ChainError>,
    requested_ranges: Vec<BlockRange>,
}

/// Scriptable in-memory [`LedgerClient`].
///
/// While unreachable every call fails with [`ChainError::Unavailable`].
#[derive(Debug)]
pub struct MockLedger {
    state: Mutex<LedgerState>,
}

impl MockLedger {
    /// Creates a reachable ledger at `head` with no logs.
    pub fn new(head: u64) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                head,
                reachable: true,
                logs: Vec::new(),
                gas_price: 1_000_000_000,
                transaction_count: 0,
                chain_id: 1,
                transaction_count_error: None,
                chain_id_error: None,
                failing_ranges: HashMap::new(),
                requested_ranges: Vec::new(),
            }),
        }
    }

    /// Moves the chain head.
    pub fn set_head(&self, head: u64) {
        self.state.lock().head = head;
    }

    /// Takes the endpoint down or brings it back.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// Sets the node-suggested gas price.
    pub fn set_gas_price(&self, price: u128) {
        self.state.lock().gas_price = price;
    }

    /// Sets the transaction count reported for every account.
    pub fn set_transaction_count(&self, count: u64) {
        self.state.lock().transaction_count = count;
    }

    /// Sets the reported chain id.
    pub fn set_chain_id(&self, chain_id: u64) {
        self.state.lock().chain_id = chain_id;
    }

    /// Makes transaction count lookups fail with `error`.
    pub fn set_transaction_count_error(&self, error: Option<ChainError>) {
        self.state.lock().transaction_count_error = error;
    }

    /// Makes chain id lookups fail with `error`.
    pub fn set_chain_id_error(&self, error: Option<ChainError>) {
        self.state.lock().chain_id_error = error;
    }

    /// Adds a log to the chain.
    pub fn push_log(&self, log: Log) {
        self.state.lock().logs.push(log);
    }

    /// Makes every log query for exactly `[from, to]` fail with `error`.
    pub fn fail_range(&self, from: u64, to: u64, error: ChainError) {
        self.state.lock().failing_ranges.insert(BlockRange::new(from, to), error);
    }

    /// Removes all range failures.
    pub fn clear_failures(&self) {
        self.state.lock().failing_ranges.clear();
    }

    /// Every range passed to `get_logs` so far, failed ones included.
    pub fn requested_ranges(&self) -> Vec<BlockRange> {
        self.state.lock().requested_ranges.clone()
    }

    fn check_reachable(state: &LedgerState) -> Result<(), ChainError> {
        if state.reachable {
            Ok(())
        } else {
            Err(ChainError::Unavailable("connection refused".to_string()))
        }
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn block_number(&self) -> Result<u64, ChainError> {
        let state = self.state.lock();
        Self::check_reachable(&state)?;
        Ok(state.head)
    }

    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, ChainError> {
        let mut state = self.state.lock();
        Self::check_reachable(&state)?;

        let from = filter.get_from_block().unwrap_or_default();
        let to = filter.get_to_block().unwrap_or(state.head);
        let range = BlockRange::new(from, to);
        state.requested_ranges.push(range);

        if let Some(error) = state.failing_ranges.get(&range) {
            return Err(error.clone());
        }

        Ok(state
            .logs
            .iter()
            .filter(|log| log.block_number.is_some_and(|block| range.contains(block)))
            .cloned()
            .collect())
    }

    async fn transaction_count(&self, _address: Address) -> Result<u64, ChainError> {
        let state = self.state.lock();
        Self::check_reachable(&state)?;
        match &state.transaction_count_error {
            Some(error) => Err(error.clone()),
            None => Ok(state.transaction_count),
        }
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        let state = self.state.lock();
        Self::check_reachable(&state)?;
        Ok(state.gas_price)
    }

    async fn chain_id(&self) -> Result<u64, ChainError> {
        let state = self.state.lock();
        Self::check_reachable(&state)?;
        match &state.chain_id_error {
            Some(error) => Err(error.clone()),
            None => Ok(state.chain_id),
        }
    }
}

/// [`GasFeed`] that replays a fixed script, then fails.
#[derive(Debug)]
pub struct ScriptedGasFeed {
    script: Mutex<VecDeque<Result<u128, GasFeedError>>>,
}

impl ScriptedGasFeed {
    /// Creates a feed answering with `script` in order.
    pub fn new(script: Vec<Result<u128, GasFeedError>>) -> Self {
        Self { script: Mutex::new(script.into()) }
    }
}

#[async_trait]
impl GasFeed for ScriptedGasFeed {
    async fn fast_price_wei(&self) -> Result<u128, GasFeedError> {
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(GasFeedError::Request("script exhausted".to_string())))
    }
}

/// In-memory [`CheckpointStore`] whose writes can be switched off.
#[derive(Debug, Default)]
pub struct FlakyCheckpointStore {
    inner: MemoryCheckpointStore,
    failing: AtomicBool,
}

impl FlakyCheckpointStore {
    /// Makes subsequent saves fail (`true`) or succeed (`false`).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Last successfully persisted height
    pub fn get(&self) -> Option<u64> {
        self.inner.get()
    }
}

impl CheckpointStore for FlakyCheckpointStore {
    fn load(&self, default_height: u64) -> u64 {
        self.inner.load(default_height)
    }

    fn save(&self, height: u64) -> Result<(), CheckpointError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CheckpointError::PersistFailed {
                path: PathBuf::from("memory"),
                source: io::Error::other("disk full"),
            });
        }
        self.inner.save(height)
    }
}
