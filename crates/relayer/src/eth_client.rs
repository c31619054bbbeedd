use crate::{connection::LedgerClient, error::ChainError, metrics::RpcMetrics};
use alloy_network::Ethereum;
use alloy_primitives::Address;
use alloy_provider::{Provider, ProviderBuilder, RootProvider};
use alloy_rpc_types::{Filter, Log};
use alloy_transport::{RpcError, TransportError};
use anyhow::{Context as AnyhowContext, Result};
use async_trait::async_trait;
use reqwest::ClientBuilder;
use std::{
    future::IntoFuture,
    time::{Duration, Instant},
};
use tracing::debug;
use url::Url;

/// Error messages nodes use when a block in a requested range does not exist.
const BLOCK_NOT_FOUND_MARKERS: [&str; 4] =
    ["block not found", "header not found", "unknown block", "block does not exist"];

/// Ethereum JSON-RPC client over HTTP
///
/// Every call is bounded by the configured timeout. Failures are classified into
/// [`ChainError`]; nothing is retried here.
#[derive(Clone, Debug)]
pub struct EthHttpCli {
    name: String,
    provider: RootProvider<Ethereum>,
    timeout: Duration,
    metrics: RpcMetrics,
}

impl EthHttpCli {
    /// Creates a new EthHttpCli instance
    ///
    /// # Arguments
    /// * `name` - Chain name, used as a metrics label
    /// * `rpc_url` - The RPC endpoint URL for blockchain communication
    /// * `timeout` - Upper bound for every request
    ///
    /// # Errors
    /// * Returns an error if the URL cannot be parsed or client cannot be built
    pub fn new(name: &str, rpc_url: &str, timeout: Duration) -> Result<Self> {
        debug!("Creating EthHttpCli for URL: {}", rpc_url);

        let url =
            Url::parse(rpc_url).with_context(|| format!("Failed to parse RPC URL: {}", rpc_url))?;

        let client = ClientBuilder::new()
            .no_proxy()
            .use_rustls_tls()
            .timeout(timeout)
            .build()
            .with_context(|| "Failed to build HTTP client")?;

        let provider: RootProvider<Ethereum> =
            ProviderBuilder::default().connect_reqwest(client, url);

        Ok(Self {
            name: name.to_string(),
            provider,
            timeout,
            metrics: RpcMetrics::new_with_labels(&[("chain", name.to_string())]),
        })
    }

    /// Name of the chain this client talks to
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `operation` under the request timeout and records metrics.
    async fn call<T, Fut>(&self, operation: Fut) -> Result<T, ChainError>
    where
        Fut: IntoFuture<Output = Result<T, TransportError>>,
    {
        let start = Instant::now();
        self.metrics.requests_sent.increment(1);

        let result = match tokio::time::timeout(self.timeout, operation).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(classify_transport_error(&e)),
            Err(_) => Err(ChainError::Timeout(self.timeout)),
        };

        if result.is_err() {
            self.metrics.requests_failed.increment(1);
        }
        self.metrics.latency.record(start.elapsed());
        result
    }
}

#[async_trait]
impl LedgerClient for EthHttpCli {
    async fn block_number(&self) -> Result<u64, ChainError> {
        self.call(self.provider.get_block_number()).await
    }

    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, ChainError> {
        self.call(self.provider.get_logs(filter)).await
    }

    async fn transaction_count(&self, address: Address) -> Result<u64, ChainError> {
        self.call(self.provider.get_transaction_count(address)).await
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        self.call(self.provider.get_gas_price()).await
    }

    async fn chain_id(&self) -> Result<u64, ChainError> {
        self.call(self.provider.get_chain_id()).await
    }
}

/// Maps a transport error onto the relay's failure kinds.
pub(crate) fn classify_transport_error(err: &TransportError) -> ChainError {
    match err {
        RpcError::ErrorResp(payload) if is_block_not_found(&payload.message) => {
            ChainError::BlockNotFound(payload.message.to_string())
        }
        RpcError::Transport(_) => ChainError::Unavailable(err.to_string()),
        _ => ChainError::Rpc(err.to_string()),
    }
}

/// Whether a node error message reports a missing block.
pub(crate) fn is_block_not_found(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    BLOCK_NOT_FOUND_MARKERS.iter().any(|marker| message.contains(marker))
}
