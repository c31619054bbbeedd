//! Wires the relay components together from [`RelayerSettings`].

use crate::{
    checkpoint::FileCheckpointStore,
    config::RelayerSettings,
    connection::{ChainConnection, LedgerClient},
    eth_client::EthHttpCli,
    gas_oracle::{GasFeed, GasPriceOracle, HttpGasFeed},
    processor::ActionProcessor,
    relay::RelayLoop,
    scanner::EventScanner,
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

/// Builds a [`RelayLoop`] for the chain pair described by `settings`.
///
/// No network request is made here; the loop connects both chains on its first cycle.
///
/// # Arguments
/// * `settings` - Validated relayer settings
///
/// # Errors
/// * Returns an error if an RPC URL or the gas feed endpoint is unusable
/// * Returns an error if the relayer private key cannot be parsed
pub fn build_relay_loop(settings: &RelayerSettings) -> Result<RelayLoop> {
    let timeout = settings.listener.rpc_timeout();

    let source_client = EthHttpCli::new(&settings.source.name, &settings.source.rpc_url, timeout)
        .context("Failed to create source RPC client")?;
    let destination_client =
        EthHttpCli::new(&settings.destination.name, &settings.destination.rpc_url, timeout)
            .context("Failed to create destination RPC client")?;

    let source = Arc::new(ChainConnection::new(
        settings.source.name.clone(),
        Arc::new(source_client) as Arc<dyn LedgerClient>,
    ));
    let destination = Arc::new(ChainConnection::new(
        settings.destination.name.clone(),
        Arc::new(destination_client) as Arc<dyn LedgerClient>,
    ));

    let feed = match &settings.gas_oracle.endpoint {
        Some(endpoint) => {
            let feed = HttpGasFeed::new(
                endpoint.clone(),
                settings.gas_oracle.api_key.clone().unwrap_or_default(),
                settings.gas_oracle.timeout(),
            )?;
            Some(Arc::new(feed) as Arc<dyn GasFeed>)
        }
        None => {
            info!(target: "relayer::launch", "No gas feed configured, using node suggestions");
            None
        }
    };
    let oracle =
        Arc::new(GasPriceOracle::new(feed, destination.clone(), settings.gas_oracle.floor_wei()));

    let signer = settings.destination.signer()?;
    info!(
        target: "relayer::launch",
        sender = %signer.address(),
        destination = %settings.destination.name,
        "Loaded relayer key"
    );

    let processor = ActionProcessor::new(
        destination.clone(),
        settings.destination.bridge_contract_address,
        signer,
        oracle,
    )
    .with_gas_limit(settings.destination.gas_limit);

    let scanner = EventScanner::new(
        source.clone(),
        settings.source.bridge_contract_address,
        settings.listener.batch_size,
    );

    let store = Arc::new(FileCheckpointStore::new(&settings.listener.checkpoint_path));

    Ok(RelayLoop::new(
        source,
        destination,
        scanner,
        processor,
        store,
        settings.source.start_block,
        settings.listener.poll_interval(),
    ))
}
