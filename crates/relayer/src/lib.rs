//! Lock Relayer
//!
//! Watches a bridge contract on a source chain for `TokensLocked` events and turns each one
//! into a signed `unlockTokens` transaction for the destination chain. Progress is tracked as
//! a persisted block checkpoint so the relayer resumes where it stopped.

/// Bridge contract bindings
pub mod abi;
/// Checkpoint persistence
pub mod checkpoint;
/// Layered configuration loading
pub mod config;
/// Liveness-tracked chain handles
pub mod connection;
/// Failure kinds
pub mod error;
/// Ethereum HTTP client functionality
pub mod eth_client;
/// Gas price selection
pub mod gas_oracle;
/// Component wiring
pub mod launch;
mod metrics;
/// Unlock transaction building
pub mod processor;
/// The relay engine
pub mod relay;
/// Block range scanning
pub mod scanner;
/// Shared value types
pub mod types;

/// Test helpers
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use config::{ConfigLoader, RelayerSettings};
pub use connection::{ChainConnection, ConnectionState, LedgerClient};
pub use error::{ChainError, CheckpointError, GasFeedError, ProcessError, ScanError};
pub use eth_client::EthHttpCli;
pub use gas_oracle::{GasFeed, GasPriceOracle, HttpGasFeed};
pub use launch::build_relay_loop;
pub use processor::ActionProcessor;
pub use relay::{CycleOutcome, CycleReport, RelayLoop, RelayState};
pub use scanner::{EventBatch, EventScanner, ScanOutcome};
pub use types::{BlockRange, GasQuote, GasSource, LockEvent, UnlockAction};
