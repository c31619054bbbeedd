//! Values flowing between the scanner, the processor and the relay loop.

use crate::abi::TokensLocked;
use alloy_primitives::{Address, Bytes, Signature, B256, U256};
use alloy_rpc_types::Log;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Inclusive range of block heights, `from <= to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRange {
    /// First block of the range
    pub from: u64,
    /// Last block of the range
    pub to: u64,
}

impl BlockRange {
    /// Creates a new range. Callers guarantee `from <= to`.
    pub const fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }

    /// Number of blocks covered.
    pub const fn block_count(&self) -> u64 {
        self.to - self.from + 1
    }

    /// Whether `block` lies inside the range.
    pub const fn contains(&self, block: u64) -> bool {
        block >= self.from && block <= self.to
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}

/// A `TokensLocked` event observed on the source chain.
///
/// Identity is `(transaction_hash, nonce)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEvent {
    /// Account that locked the tokens
    pub from: Address,
    /// Chain the tokens are bound for
    pub to_chain_id: U256,
    /// Locked amount in the token's native precision
    pub amount: U256,
    /// Bridge nonce, strictly increasing per source contract
    pub nonce: U256,
    /// Source block height
    pub block_number: u64,
    /// Source transaction hash
    pub transaction_hash: B256,
    /// Position of the log in its block
    pub log_index: u64,
}

impl LockEvent {
    /// Identity of the event.
    pub const fn id(&self) -> (B256, U256) {
        (self.transaction_hash, self.nonce)
    }

    /// Decodes a raw log. Returns `None` for logs that are not `TokensLocked` or lack the
    /// block/transaction metadata of a mined log.
    pub fn from_log(log: &Log) -> Option<Self> {
        let block_number = log.block_number?;
        let transaction_hash = log.transaction_hash?;
        let decoded = log.log_decode::<TokensLocked>().ok()?;
        let event = decoded.inner.data;
        Some(Self {
            from: event.from,
            to_chain_id: event.toChainId,
            amount: event.amount,
            nonce: event.nonce,
            block_number,
            transaction_hash,
            log_index: log.log_index.unwrap_or_default(),
        })
    }
}

/// Where a gas price came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GasSource {
    /// External pricing service
    ExternalOracle,
    /// `eth_gasPrice` of the destination node
    NodeSuggested,
    /// Configured floor value
    HardcodedFloor,
}

impl GasSource {
    /// Label used in logs and metrics.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ExternalOracle => "external-oracle",
            Self::NodeSuggested => "node-suggested",
            Self::HardcodedFloor => "hardcoded-floor",
        }
    }
}

impl fmt::Display for GasSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gas price in wei, tagged with its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasQuote {
    /// Price in wei
    pub price: u128,
    /// Where the price came from
    pub source: GasSource,
}

/// A signed `unlockTokens` transaction for the destination chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockAction {
    /// Receiver of the unlocked tokens
    pub recipient: Address,
    /// Amount to unlock
    pub amount: U256,
    /// Nonce of the originating lock
    pub source_nonce: U256,
    /// Source transaction the lock came from
    pub source_tx: B256,
    /// Relayer account sending the transaction
    pub sender: Address,
    /// Transaction sequence number of the sender
    pub sequence: u64,
    /// Destination chain id
    pub chain_id: u64,
    /// Gas price in wei
    pub gas_price: u128,
    /// Where the gas price came from
    pub gas_source: GasSource,
    /// Gas limit ceiling
    pub gas_limit: u64,
    /// Signature over the transaction
    pub signature: Signature,
    /// Hash of the signed transaction
    pub tx_hash: B256,
    /// EIP-2718 encoded signed transaction, ready for broadcast
    pub raw: Bytes,
}
