//! `lock-relayer` binary: loads settings, starts the relay loop and stops it on Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use lock_relayer::{build_relay_loop, ConfigLoader};
use std::{fs::File, path::PathBuf, sync::Arc};
use tokio::sync::mpsc::unbounded_channel;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Relays `TokensLocked` events into signed `unlockTokens` transactions.
#[derive(Debug, Parser)]
#[command(author, version, about = "Lock relayer", long_about = None)]
struct Args {
    /// Directory holding `base.yaml` and the per-environment layers.
    #[arg(long, value_name = "DIR", default_value = "config")]
    config_dir: PathBuf,

    /// Environment layer to apply on top of `base.yaml`.
    #[arg(long, value_name = "ENV", env = "RELAYER_ENV", default_value = "development")]
    env: String,

    /// Also write logs to this file.
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,
}

impl Args {
    fn init_tracing(&self) -> Result<()> {
        let filter = || {
            EnvFilter::builder().with_default_directive(LevelFilter::INFO.into()).from_env_lossy()
        };

        let file_layer = match &self.log_file {
            Some(path) => {
                let file = File::options()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("Failed to open log file {}", path.display()))?;
                Some(fmt::layer().with_ansi(false).with_writer(Arc::new(file)).with_filter(filter()))
            }
            None => None,
        };

        tracing_subscriber::registry()
            .with(fmt::layer().with_filter(filter()))
            .with(file_layer)
            .init();
        Ok(())
    }

    async fn run(self) -> Result<()> {
        self.init_tracing()?;

        let settings = ConfigLoader::new(&self.config_dir)
            .with_env(self.env.clone())
            .load()
            .with_context(|| format!("Failed to load settings from {}", self.config_dir.display()))?;
        info!(target: "relayer::main", env = %self.env, ?settings, "Loaded settings");

        let (action_tx, mut action_rx) = unbounded_channel();
        let relay = build_relay_loop(&settings)?.with_action_sink(action_tx);

        let cancel = CancellationToken::new();
        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => info!(target: "relayer::main", "Received Ctrl-C, shutting down"),
                    Err(e) => error!(target: "relayer::main", error = %e, "Failed to listen for Ctrl-C"),
                }
                cancel.cancel();
            }
        });

        tokio::spawn(async move {
            while let Some(action) = action_rx.recv().await {
                info!(
                    target: "relayer::main",
                    tx_hash = %action.tx_hash,
                    recipient = %action.recipient,
                    amount = %action.amount,
                    source_nonce = %action.source_nonce,
                    raw = %action.raw,
                    "Signed unlock transaction"
                );
            }
        });

        let checkpoint = relay.run(cancel).await;
        info!(target: "relayer::main", checkpoint, "Relayer stopped");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    Args::parse().run().await
}
