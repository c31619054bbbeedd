use metrics::{Counter, Gauge, Histogram};
use metrics_derive::Metrics;

/// Metrics for the relay loop
#[derive(Metrics, Clone)]
#[metrics(scope = "lock_relayer")]
pub(crate) struct RelayLoopMetrics {
    /// Number of cycles started
    pub(crate) cycles: Counter,
    /// Number of unlock actions built and signed
    pub(crate) events_dispatched: Counter,
    /// Number of lock events whose processing failed
    pub(crate) events_failed: Counter,
    /// Number of scans that hit a block-not-found error
    pub(crate) reorgs_suspected: Counter,
    /// Number of scans that failed for other reasons
    pub(crate) scan_failures: Counter,
    /// Number of reconnect attempts
    pub(crate) reconnects: Counter,
    /// Number of cycles that ended in the longer backoff sleep
    pub(crate) backoffs: Counter,
    /// Number of checkpoint writes that failed
    pub(crate) persist_failures: Counter,
    /// Last checkpoint held in memory
    pub(crate) checkpoint: Gauge,
    /// How long it took to scan and dispatch one batch
    pub(crate) batch_duration: Histogram,
}

/// Metrics for the gas price oracle
#[derive(Metrics, Clone)]
#[metrics(scope = "lock_relayer.gas")]
pub(crate) struct GasOracleMetrics {
    /// Quotes served by the external feed
    pub(crate) external_oracle: Counter,
    /// Quotes served by the destination node
    pub(crate) node_suggested: Counter,
    /// Quotes served by the configured floor
    pub(crate) hardcoded_floor: Counter,
    /// Last quoted price in wei
    pub(crate) last_price: Gauge,
}

/// Metrics for one RPC endpoint
#[derive(Metrics, Clone)]
#[metrics(scope = "lock_relayer.rpc")]
pub(crate) struct RpcMetrics {
    /// Number of requests sent
    pub(crate) requests_sent: Counter,
    /// Number of failed requests
    pub(crate) requests_failed: Counter,
    /// Request latency
    pub(crate) latency: Histogram,
}
