//! Liveness-tracked handle to one ledger.
//!
//! A [`ChainConnection`] wraps a [`LedgerClient`] and keeps a [`ConnectionState`]. The state
//! moves to `Connected` after a successful [`ChainConnection::connect`] check and back to
//! `Disconnected` whenever a call fails because the endpoint could not be reached. Callers
//! decide when to reconnect; nothing in here retries.

use crate::{abi::TokensLocked, error::ChainError, types::BlockRange, LockEvent};
use alloy_primitives::Address;
use alloy_rpc_types::{Filter, Log};
use alloy_sol_types::SolEvent;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::{fmt, sync::Arc};
use tracing::{debug, info, warn};

/// The RPC operations the relay engine needs from a ledger.
///
/// Implementations bound every call with a timeout and classify failures into
/// [`ChainError`]. They never retry.
#[async_trait]
pub trait LedgerClient: Send + Sync + fmt::Debug {
    /// Latest block height.
    async fn block_number(&self) -> Result<u64, ChainError>;

    /// Logs matching `filter`.
    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, ChainError>;

    /// Number of transactions sent from `address` (its next sequence number).
    async fn transaction_count(&self, address: Address) -> Result<u64, ChainError>;

    /// Gas price suggested by the node, in wei.
    async fn gas_price(&self) -> Result<u128, ChainError>;

    /// Chain id reported by the node.
    async fn chain_id(&self) -> Result<u64, ChainError>;
}

/// Connection state of a [`ChainConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No successful connection check since the last failure.
    #[default]
    Disconnected,
    /// The last check or call reached the endpoint.
    Connected,
}

/// Handle to one ledger.
pub struct ChainConnection {
    name: String,
    client: Arc<dyn LedgerClient>,
    state: RwLock<ConnectionState>,
}

impl fmt::Debug for ChainConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainConnection")
            .field("name", &self.name)
            .field("client", &self.client)
            .field("state", &*self.state.read())
            .finish()
    }
}

impl ChainConnection {
    /// Creates a disconnected handle. Call [`Self::connect`] before use.
    pub fn new(name: impl Into<String>, client: Arc<dyn LedgerClient>) -> Self {
        Self { name: name.into(), client, state: RwLock::new(ConnectionState::Disconnected) }
    }

    /// Name of the chain, for logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Whether the connection is currently considered live. Does no I/O.
    pub fn is_live(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Probes the endpoint and updates the state. Safe to call while connected.
    pub async fn connect(&self) -> Result<(), ChainError> {
        match self.client.block_number().await {
            Ok(head) => {
                self.set_state(ConnectionState::Connected);
                info!(target: "relayer::connection", chain = %self.name, head, "Connected");
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                warn!(target: "relayer::connection", chain = %self.name, error = %e, "Connection attempt failed");
                Err(e)
            }
        }
    }

    /// Latest block height of the chain.
    pub async fn latest_height(&self) -> Result<u64, ChainError> {
        self.ensure_live()?;
        match self.client.block_number().await {
            Ok(head) => Ok(head),
            Err(e) => Err(self.observe_failure(e)),
        }
    }

    /// Returns a handle for querying the bridge contract at `address`.
    pub fn bound_contract(&self, address: Address) -> Result<BoundContract<'_>, ChainError> {
        self.ensure_live()?;
        Ok(BoundContract { connection: self, address })
    }

    /// Next transaction sequence number of `account`.
    pub async fn transaction_count(&self, account: Address) -> Result<u64, ChainError> {
        self.ensure_live()?;
        self.client.transaction_count(account).await.map_err(|e| self.observe_failure(e))
    }

    /// Gas price suggested by the node, in wei.
    pub async fn gas_price(&self) -> Result<u128, ChainError> {
        self.ensure_live()?;
        self.client.gas_price().await.map_err(|e| self.observe_failure(e))
    }

    /// Chain id reported by the node.
    pub async fn chain_id(&self) -> Result<u64, ChainError> {
        self.ensure_live()?;
        self.client.chain_id().await.map_err(|e| self.observe_failure(e))
    }

    fn ensure_live(&self) -> Result<(), ChainError> {
        if self.is_live() {
            Ok(())
        } else {
            Err(ChainError::NotConnected { chain: self.name.clone() })
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    /// Marks the connection down when the endpoint could not be reached.
    fn observe_failure(&self, err: ChainError) -> ChainError {
        if err.is_connectivity() && self.is_live() {
            self.set_state(ConnectionState::Disconnected);
            warn!(target: "relayer::connection", chain = %self.name, error = %err, "Marked disconnected");
        }
        err
    }
}

/// The bridge contract bound to a live [`ChainConnection`].
#[derive(Debug)]
pub struct BoundContract<'a> {
    connection: &'a ChainConnection,
    address: Address,
}

impl BoundContract<'_> {
    /// Address of the contract.
    pub const fn address(&self) -> Address {
        self.address
    }

    /// `TokensLocked` events emitted in `range`, ordered by block and log index.
    ///
    /// Logs that do not decode as `TokensLocked` are skipped with a warning.
    pub async fn lock_events(&self, range: BlockRange) -> Result<Vec<LockEvent>, ChainError> {
        let filter = Filter::new()
            .address(self.address)
            .event_signature(TokensLocked::SIGNATURE_HASH)
            .from_block(range.from)
            .to_block(range.to);

        let logs = self
            .connection
            .client
            .get_logs(&filter)
            .await
            .map_err(|e| self.connection.observe_failure(e))?;

        let mut events = Vec::with_capacity(logs.len());
        for log in &logs {
            match LockEvent::from_log(log) {
                Some(event) => events.push(event),
                None => warn!(
                    target: "relayer::connection",
                    chain = %self.connection.name,
                    tx_hash = ?log.transaction_hash,
                    block = ?log.block_number,
                    "Skipping undecodable log"
                ),
            }
        }
        events.sort_by_key(|e| (e.block_number, e.log_index));

        debug!(
            target: "relayer::connection",
            chain = %self.connection.name,
            %range,
            logs = logs.len(),
            events = events.len(),
            "Fetched lock events"
        );
        Ok(events)
    }
}
