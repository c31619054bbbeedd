//! Block Range Scanner
//!
//! Plans bounded block ranges above the checkpoint and fetches `TokensLocked` events in them.
//! The scanner never holds or moves the checkpoint; the caller passes it in and decides
//! what to persist.

use crate::{
    connection::ChainConnection,
    error::{ChainError, ScanError},
    types::{BlockRange, LockEvent},
};
use alloy_primitives::Address;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Events found in one scanned range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBatch {
    /// The range that was fully scanned. `range.to` is the candidate checkpoint.
    pub range: BlockRange,
    /// Events in ascending block/log order
    pub events: Vec<LockEvent>,
}

/// Outcome of a successful [`EventScanner::next_batch`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// No block above the checkpoint yet.
    CaughtUp {
        /// Chain head at the time of the call
        head: u64,
    },
    /// A range was scanned.
    Batch(EventBatch),
}

/// Scans the source bridge contract in bounded batches
#[derive(Debug)]
pub struct EventScanner {
    source: Arc<ChainConnection>,
    contract: Address,
    batch_size: u64,
}

impl EventScanner {
    /// Creates a scanner. `batch_size` is clamped to at least one block.
    pub fn new(source: Arc<ChainConnection>, contract: Address, batch_size: u64) -> Self {
        Self { source, contract, batch_size: batch_size.max(1) }
    }

    /// Maximum number of blocks per scan
    pub const fn batch_size(&self) -> u64 {
        self.batch_size
    }

    /// Calculates the next range to scan, or `None` when `checkpoint` is at or past `head`.
    pub const fn plan(checkpoint: u64, head: u64, batch_size: u64) -> Option<BlockRange> {
        if checkpoint >= head {
            return None;
        }
        let from = checkpoint + 1;
        let to = from.saturating_add(batch_size.saturating_sub(1));
        Some(BlockRange::new(from, if to < head { to } else { head }))
    }

    /// Scans the range above `checkpoint`, bounded by `head` and the batch size.
    ///
    /// A block-not-found error is reported as [`ScanError::ReorgSuspected`], anything else as
    /// [`ScanError::ScanFailed`]. In both cases the caller should retry the same range later.
    pub async fn next_batch(&self, checkpoint: u64, head: u64) -> Result<ScanOutcome, ScanError> {
        let Some(range) = Self::plan(checkpoint, head, self.batch_size) else {
            debug!(
                target: "relayer::scanner",
                chain = %self.source.name(),
                checkpoint,
                head,
                "No new blocks to scan"
            );
            return Ok(ScanOutcome::CaughtUp { head });
        };

        info!(
            target: "relayer::scanner",
            chain = %self.source.name(),
            %range,
            head,
            "Scanning for TokensLocked events"
        );

        let result = match self.source.bound_contract(self.contract) {
            Ok(contract) => contract.lock_events(range).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(events) => {
                debug!(
                    target: "relayer::scanner",
                    chain = %self.source.name(),
                    %range,
                    events = events.len(),
                    "Range scanned"
                );
                Ok(ScanOutcome::Batch(EventBatch { range, events }))
            }
            Err(ChainError::BlockNotFound(reason)) => {
                warn!(
                    target: "relayer::scanner",
                    chain = %self.source.name(),
                    %range,
                    %reason,
                    "Block range not found, possibly a chain reorg. Will retry"
                );
                Err(ScanError::ReorgSuspected { range, reason })
            }
            Err(source) => {
                warn!(
                    target: "relayer::scanner",
                    chain = %self.source.name(),
                    %range,
                    error = %source,
                    "Failed to fetch events"
                );
                Err(ScanError::ScanFailed { range, source })
            }
        }
    }
}
