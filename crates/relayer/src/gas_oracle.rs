//! Gas price selection with graceful degradation.
//!
//! [`GasPriceOracle::quote`] asks the external feed first, then the destination node, then
//! falls back to a configured floor. It never fails.

use crate::{
    connection::ChainConnection,
    error::GasFeedError,
    metrics::GasOracleMetrics,
    types::{GasQuote, GasSource},
};
use alloy_primitives::utils::{parse_units, ParseUnits};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::{fmt, sync::Arc, time::Duration};
use tracing::{debug, warn};

/// Default floor: 20 gwei
pub const DEFAULT_GAS_PRICE_FLOOR_WEI: u128 = 20_000_000_000;

/// External gas price service
#[async_trait]
pub trait GasFeed: Send + Sync + fmt::Debug {
    /// The "fast" tier price, in wei.
    async fn fast_price_wei(&self) -> Result<u128, GasFeedError>;
}

/// [`GasFeed`] over HTTP: `GET <endpoint>?apiKey=<key>` returning `{ "fast": <gwei> }`.
#[derive(Debug, Clone)]
pub struct HttpGasFeed {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl HttpGasFeed {
    /// Creates a feed whose requests are bounded by `timeout`.
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .no_proxy()
            .timeout(timeout)
            .use_rustls_tls()
            .build()
            .context("Failed to build gas feed HTTP client")?;
        Ok(Self { client, endpoint: endpoint.into(), api_key: api_key.into() })
    }
}

#[async_trait]
impl GasFeed for HttpGasFeed {
    async fn fast_price_wei(&self) -> Result<u128, GasFeedError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("apiKey", self.api_key.as_str())])
            .send()
            .await
            .map_err(|e| GasFeedError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GasFeedError::Status(status.as_u16()));
        }

        let body: Value =
            response.json().await.map_err(|e| GasFeedError::Malformed(e.to_string()))?;
        parse_fast_price(&body)
    }
}

/// Extracts the `fast` tier from a feed body and converts it from gwei to wei.
///
/// Accepts integer or decimal values, as JSON numbers or strings. Zero and negative
/// prices are rejected.
pub fn parse_fast_price(body: &Value) -> Result<u128, GasFeedError> {
    let gwei = match body.get("fast") {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(other) => return Err(GasFeedError::Malformed(format!("unexpected `fast` value {other}"))),
        None => return Err(GasFeedError::Malformed("missing `fast` field".to_string())),
    };

    let wei = match parse_units(&gwei, "gwei") {
        Ok(ParseUnits::U256(wei)) => wei,
        Ok(ParseUnits::I256(_)) => {
            return Err(GasFeedError::Malformed(format!("negative price {gwei}")))
        }
        Err(e) => return Err(GasFeedError::Malformed(format!("invalid price {gwei}: {e}"))),
    };

    let wei = u128::try_from(wei)
        .map_err(|_| GasFeedError::Malformed(format!("price {gwei} out of range")))?;
    if wei == 0 {
        return Err(GasFeedError::Malformed("zero price".to_string()));
    }
    Ok(wei)
}

/// Gas price oracle for the destination chain
pub struct GasPriceOracle {
    feed: Option<Arc<dyn GasFeed>>,
    destination: Arc<ChainConnection>,
    floor: u128,
    metrics: GasOracleMetrics,
}

impl fmt::Debug for GasPriceOracle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GasPriceOracle")
            .field("feed", &self.feed)
            .field("destination", &self.destination.name())
            .field("floor", &self.floor)
            .finish()
    }
}

impl GasPriceOracle {
    /// Creates an oracle. Without a feed, quotes start at the node suggestion.
    pub fn new(feed: Option<Arc<dyn GasFeed>>, destination: Arc<ChainConnection>, floor: u128) -> Self {
        Self { feed, destination, floor, metrics: GasOracleMetrics::default() }
    }

    /// Floor price in wei
    pub const fn floor(&self) -> u128 {
        self.floor
    }

    /// Returns a gas price for the next destination transaction.
    pub async fn quote(&self) -> GasQuote {
        let quote = self.select().await;
        match quote.source {
            GasSource::ExternalOracle => self.metrics.external_oracle.increment(1),
            GasSource::NodeSuggested => self.metrics.node_suggested.increment(1),
            GasSource::HardcodedFloor => self.metrics.hardcoded_floor.increment(1),
        }
        self.metrics.last_price.set(quote.price as f64);
        debug!(target: "relayer::gas", price = quote.price, source = %quote.source, "Gas price selected");
        quote
    }

    async fn select(&self) -> GasQuote {
        if let Some(feed) = &self.feed {
            match feed.fast_price_wei().await {
                Ok(price) => return GasQuote { price, source: GasSource::ExternalOracle },
                Err(e) => warn!(
                    target: "relayer::gas",
                    error = %e,
                    "External gas feed failed, falling back to node suggestion"
                ),
            }
        }

        match self.destination.gas_price().await {
            Ok(price) => GasQuote { price, source: GasSource::NodeSuggested },
            Err(e) => {
                warn!(
                    target: "relayer::gas",
                    chain = %self.destination.name(),
                    error = %e,
                    floor = self.floor,
                    "Node gas price unavailable, using floor"
                );
                GasQuote { price: self.floor, source: GasSource::HardcodedFloor }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        connection::LedgerClient,
        test_utils::{MockLedger, ScriptedGasFeed},
    };
    use serde_json::json;
    use std::time::Instant;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        sync::oneshot,
    };

    const GWEI: u128 = 1_000_000_000;

    /// Serves one HTTP exchange. Resolves with the request head once it has been read.
    /// With `response == None` the connection is held open without an answer.
    async fn serve_once(response: Option<&'static str>) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}/v1/gas", listener.local_addr().unwrap());
        let (head_tx, head_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let head = read_head(&mut stream).await;
            let _ = head_tx.send(head);
            match response {
                Some(response) => {
                    stream.write_all(response.as_bytes()).await.unwrap();
                    let _ = stream.shutdown().await;
                }
                None => tokio::time::sleep(Duration::from_secs(30)).await,
            }
        });

        (endpoint, head_rx)
    }

    async fn read_head(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    fn feed(endpoint: String, timeout: Duration) -> HttpGasFeed {
        HttpGasFeed::new(endpoint, "k3y", timeout).unwrap()
    }

    #[tokio::test]
    async fn test_http_feed_reads_fast_price() {
        let (endpoint, head) = serve_once(Some(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 12\r\nConnection: close\r\n\r\n{\"fast\": 30}",
        ))
        .await;

        let price = feed(endpoint, Duration::from_secs(5)).fast_price_wei().await.unwrap();
        assert_eq!(price, 30 * GWEI);

        let head = head.await.unwrap();
        let request_line = head.lines().next().unwrap();
        assert!(request_line.starts_with("GET /v1/gas?apiKey=k3y "), "{request_line}");
    }

    #[tokio::test]
    async fn test_http_feed_error_status() {
        let (endpoint, _head) = serve_once(Some(
            "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        ))
        .await;

        let err = feed(endpoint, Duration::from_secs(5)).fast_price_wei().await.unwrap_err();
        assert_eq!(err, GasFeedError::Status(503));
    }

    #[tokio::test]
    async fn test_http_feed_garbage_body() {
        let (endpoint, _head) = serve_once(Some(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 9\r\nConnection: close\r\n\r\nnot json!",
        ))
        .await;

        let err = feed(endpoint, Duration::from_secs(5)).fast_price_wei().await.unwrap_err();
        assert!(matches!(err, GasFeedError::Malformed(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_http_feed_times_out() {
        let (endpoint, _head) = serve_once(None).await;

        let started = Instant::now();
        let err = feed(endpoint, Duration::from_millis(200)).fast_price_wei().await.unwrap_err();
        assert!(matches!(err, GasFeedError::Request(_)), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    async fn destination(gas_price: u128, reachable: bool) -> (Arc<MockLedger>, Arc<ChainConnection>) {
        let ledger = Arc::new(MockLedger::new(1));
        ledger.set_gas_price(gas_price);
        let conn = Arc::new(ChainConnection::new("destination", ledger.clone() as Arc<dyn LedgerClient>));
        conn.connect().await.unwrap();
        ledger.set_reachable(reachable);
        (ledger, conn)
    }

    #[test]
    fn test_parse_fast_price() {
        assert_eq!(parse_fast_price(&json!({ "fast": 35 })).unwrap(), 35 * GWEI);
        assert_eq!(parse_fast_price(&json!({ "fast": 12.5 })).unwrap(), 12_500_000_000);
        assert_eq!(parse_fast_price(&json!({ "fast": "7", "slow": 1 })).unwrap(), 7 * GWEI);
    }

    #[test]
    fn test_parse_fast_price_rejects_malformed() {
        assert!(parse_fast_price(&json!({ "slow": 1 })).is_err());
        assert!(parse_fast_price(&json!({ "fast": null })).is_err());
        assert!(parse_fast_price(&json!({ "fast": "fast" })).is_err());
        assert!(parse_fast_price(&json!({ "fast": -3 })).is_err());
        assert!(parse_fast_price(&json!({ "fast": 0 })).is_err());
        assert!(parse_fast_price(&json!([1, 2])).is_err());
    }

    #[tokio::test]
    async fn test_external_feed_wins() {
        let (_, dest) = destination(3 * GWEI, true).await;
        let feed = Arc::new(ScriptedGasFeed::new(vec![Ok(40 * GWEI)]));
        let oracle = GasPriceOracle::new(Some(feed), dest, DEFAULT_GAS_PRICE_FLOOR_WEI);
        assert_eq!(oracle.quote().await, GasQuote { price: 40 * GWEI, source: GasSource::ExternalOracle });
    }

    #[tokio::test]
    async fn test_falls_back_to_node() {
        let (_, dest) = destination(3 * GWEI, true).await;
        let feed = Arc::new(ScriptedGasFeed::new(vec![Err(GasFeedError::Status(503))]));
        let oracle = GasPriceOracle::new(Some(feed), dest, DEFAULT_GAS_PRICE_FLOOR_WEI);
        assert_eq!(oracle.quote().await, GasQuote { price: 3 * GWEI, source: GasSource::NodeSuggested });
    }

    #[tokio::test]
    async fn test_falls_back_to_floor() {
        let (_, dest) = destination(3 * GWEI, false).await;
        let feed = Arc::new(ScriptedGasFeed::new(vec![Err(GasFeedError::Request("timed out".into()))]));
        let oracle = GasPriceOracle::new(Some(feed), dest.clone(), DEFAULT_GAS_PRICE_FLOOR_WEI);
        assert_eq!(
            oracle.quote().await,
            GasQuote { price: DEFAULT_GAS_PRICE_FLOOR_WEI, source: GasSource::HardcodedFloor }
        );

        // the destination is now marked down, so the node is not asked again
        assert!(!dest.is_live());
        assert_eq!(oracle.quote().await.source, GasSource::HardcodedFloor);
    }

    #[tokio::test]
    async fn test_without_feed_uses_node() {
        let (_, dest) = destination(9 * GWEI, true).await;
        let oracle = GasPriceOracle::new(None, dest, 1);
        assert_eq!(oracle.quote().await.source, GasSource::NodeSuggested);
        assert_eq!(oracle.floor(), 1);
    }
}
