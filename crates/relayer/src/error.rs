//! Failure kinds returned by the relay components.
//!
//! Each component returns one of these tagged errors instead of a catch-all, so the
//! [`RelayLoop`](crate::relay::RelayLoop) can branch on the kind of failure.

use crate::types::BlockRange;
use std::{path::PathBuf, time::Duration};
use thiserror::Error;

/// Errors produced by a ledger RPC client or a [`ChainConnection`](crate::ChainConnection).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainError {
    /// The connection is down; no request was sent.
    #[error("{chain} is not connected")]
    NotConnected {
        /// Name of the chain
        chain: String,
    },
    /// The endpoint could not be reached.
    #[error("endpoint unavailable: {0}")]
    Unavailable(String),
    /// The request did not complete in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// The node reported that a requested block does not exist. On a range query this
    /// usually means a reorganization replaced part of the range.
    #[error("block not found: {0}")]
    BlockNotFound(String),
    /// Any other RPC-level error.
    #[error("rpc error: {0}")]
    Rpc(String),
}

impl ChainError {
    /// Whether the error means the endpoint itself is unreachable, as opposed to a request
    /// the endpoint answered with an error.
    pub const fn is_connectivity(&self) -> bool {
        matches!(self, Self::NotConnected { .. } | Self::Unavailable(_) | Self::Timeout(_))
    }
}

/// Errors produced by [`EventScanner::next_batch`](crate::EventScanner::next_batch).
///
/// Neither variant moves the checkpoint; the next cycle asks for the same range again.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScanError {
    /// The range query hit a block-not-found class error.
    #[error("reorg suspected in blocks {range}: {reason}")]
    ReorgSuspected {
        /// The range that was being scanned
        range: BlockRange,
        /// Error reported by the node
        reason: String,
    },
    /// Any other failure while querying the range.
    #[error("scan of blocks {range} failed: {source}")]
    ScanFailed {
        /// The range that was being scanned
        range: BlockRange,
        /// Underlying chain error
        source: ChainError,
    },
}

impl ScanError {
    /// The range the failed scan covered.
    pub const fn range(&self) -> BlockRange {
        match self {
            Self::ReorgSuspected { range, .. } | Self::ScanFailed { range, .. } => *range,
        }
    }
}

/// Per-event failures of the [`ActionProcessor`](crate::ActionProcessor).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProcessError {
    /// The destination connection or contract is not ready.
    #[error("destination unavailable: {0}")]
    DestinationUnavailable(String),
    /// Sequence-number lookup, chain id lookup or signing failed.
    #[error("failed to build unlock transaction: {0}")]
    BuildFailed(String),
}

/// Checkpoint persistence failures.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The checkpoint could not be written.
    #[error("failed to persist checkpoint to {path}: {source}")]
    PersistFailed {
        /// Target file
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
    /// The checkpoint could not be serialized.
    #[error("failed to serialize checkpoint: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Failures of the external gas price feed. These never leave the
/// [`GasPriceOracle`](crate::GasPriceOracle); they only select the fallback.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GasFeedError {
    /// Transport failure or timeout.
    #[error("gas feed request failed: {0}")]
    Request(String),
    /// Non-2xx response.
    #[error("gas feed returned status {0}")]
    Status(u16),
    /// Body missing the `fast` field or holding a value that is not a price.
    #[error("malformed gas feed body: {0}")]
    Malformed(String),
}
