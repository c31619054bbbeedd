//! Relay Loop
//!
//! Drives one source → destination pair: reconnect, scan one bounded range, dispatch its
//! events in order, advance and persist the checkpoint, sleep. Cycles run strictly one
//! after another on a single task.
//!
//! Delivery is at-least-once. The checkpoint only moves after a whole batch has been
//! dispatched, so a crash between dispatch and save replays that batch on restart.

use crate::{
    checkpoint::CheckpointStore,
    connection::ChainConnection,
    error::ScanError,
    metrics::RelayLoopMetrics,
    processor::ActionProcessor,
    scanner::{EventScanner, ScanOutcome},
    types::{BlockRange, UnlockAction},
};
use futures::FutureExt;
use std::{
    any::Any,
    fmt,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Where the loop currently is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayState {
    /// Between cycles
    #[default]
    Idle,
    /// Querying the source chain
    Scanning,
    /// Building unlock actions for a batch
    Dispatching,
    /// Persisting the checkpoint
    Checkpointing,
    /// Waiting for a chain connection to come back
    Reconnecting,
    /// Sleeping off a crashed cycle
    BackingOff,
}

/// How a single cycle ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A connection was down; no scan happened.
    Reconnecting,
    /// The source head could not be read.
    HeadUnavailable,
    /// Nothing above the checkpoint.
    CaughtUp {
        /// Source head
        head: u64,
    },
    /// The scan failed; the checkpoint did not move.
    ScanFailed(ScanError),
    /// A range was scanned and its events dispatched.
    Relayed {
        /// The scanned range, whose end is the new checkpoint
        range: BlockRange,
        /// Events turned into unlock actions
        dispatched: usize,
        /// Events whose processing failed
        failed: usize,
    },
    /// The cycle panicked.
    Panicked(String),
}

/// Result of [`RelayLoop::run_cycle`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// How the cycle ended
    pub outcome: CycleOutcome,
    /// How long to wait before the next cycle
    pub sleep: Duration,
}

/// The relay engine for one chain pair
pub struct RelayLoop {
    source: Arc<ChainConnection>,
    destination: Arc<ChainConnection>,
    scanner: EventScanner,
    processor: ActionProcessor,
    store: Arc<dyn CheckpointStore>,
    checkpoint: u64,
    poll_interval: Duration,
    state: RelayState,
    action_sink: Option<UnboundedSender<UnlockAction>>,
    metrics: RelayLoopMetrics,
}

impl fmt::Debug for RelayLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayLoop")
            .field("source", &self.source.name())
            .field("destination", &self.destination.name())
            .field("checkpoint", &self.checkpoint)
            .field("poll_interval", &self.poll_interval)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl RelayLoop {
    /// Creates a loop resuming from the stored checkpoint, or from `start_block` when
    /// nothing is stored.
    pub fn new(
        source: Arc<ChainConnection>,
        destination: Arc<ChainConnection>,
        scanner: EventScanner,
        processor: ActionProcessor,
        store: Arc<dyn CheckpointStore>,
        start_block: u64,
        poll_interval: Duration,
    ) -> Self {
        let checkpoint = store.load(start_block);
        let metrics = RelayLoopMetrics::default();
        metrics.checkpoint.set(checkpoint as f64);
        Self {
            source,
            destination,
            scanner,
            processor,
            store,
            checkpoint,
            poll_interval,
            state: RelayState::Idle,
            action_sink: None,
            metrics,
        }
    }

    /// Forwards every signed unlock action to `sink`.
    pub fn with_action_sink(mut self, sink: UnboundedSender<UnlockAction>) -> Self {
        self.action_sink = Some(sink);
        self
    }

    /// Highest source block fully dispatched
    pub const fn checkpoint(&self) -> u64 {
        self.checkpoint
    }

    /// Current state
    pub const fn state(&self) -> RelayState {
        self.state
    }

    /// Runs until `cancel` fires and returns the final checkpoint.
    ///
    /// Cancellation is checked before every cycle and during the sleep that follows it. A
    /// cycle in progress always completes.
    pub async fn run(mut self, cancel: CancellationToken) -> u64 {
        info!(
            target: "relayer::relay",
            source = %self.source.name(),
            destination = %self.destination.name(),
            checkpoint = self.checkpoint,
            poll_interval = ?self.poll_interval,
            "Starting relay loop"
        );

        while !cancel.is_cancelled() {
            let report = self.run_cycle_guarded().await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(report.sleep) => {}
            }

            if self.state == RelayState::BackingOff {
                self.state = RelayState::Idle;
            }
        }

        info!(
            target: "relayer::relay",
            source = %self.source.name(),
            checkpoint = self.checkpoint,
            "Relay loop stopped"
        );
        self.checkpoint
    }

    /// Runs one cycle, turning a panic into a [`CycleOutcome::Panicked`] report with the
    /// longer backoff sleep.
    pub async fn run_cycle_guarded(&mut self) -> CycleReport {
        match AssertUnwindSafe(self.run_cycle()).catch_unwind().await {
            Ok(report) => report,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                self.state = RelayState::BackingOff;
                self.metrics.backoffs.increment(1);
                error!(
                    target: "relayer::relay",
                    source = %self.source.name(),
                    checkpoint = self.checkpoint,
                    panic = %message,
                    "Relay cycle crashed, backing off"
                );
                CycleReport { outcome: CycleOutcome::Panicked(message), sleep: self.poll_interval * 2 }
            }
        }
    }

    /// Runs one cycle.
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.metrics.cycles.increment(1);

        if let Some(report) = self.reconnect().await {
            return report;
        }

        self.state = RelayState::Scanning;
        let started = Instant::now();

        let head = match self.source.latest_height().await {
            Ok(head) => head,
            Err(e) => {
                warn!(
                    target: "relayer::relay",
                    chain = %self.source.name(),
                    error = %e,
                    "Failed to read chain head"
                );
                return self.idle(CycleOutcome::HeadUnavailable);
            }
        };

        let batch = match self.scanner.next_batch(self.checkpoint, head).await {
            Ok(ScanOutcome::Batch(batch)) => batch,
            Ok(ScanOutcome::CaughtUp { head }) => {
                debug!(
                    target: "relayer::relay",
                    checkpoint = self.checkpoint,
                    head,
                    "Caught up, waiting for new blocks"
                );
                return self.idle(CycleOutcome::CaughtUp { head });
            }
            Err(e) => {
                match &e {
                    ScanError::ReorgSuspected { .. } => self.metrics.reorgs_suspected.increment(1),
                    ScanError::ScanFailed { .. } => self.metrics.scan_failures.increment(1),
                }
                return self.idle(CycleOutcome::ScanFailed(e));
            }
        };

        self.state = RelayState::Dispatching;
        let mut dispatched = 0;
        let mut failed = 0;
        for event in &batch.events {
            match self.processor.process(event).await {
                Ok(action) => {
                    dispatched += 1;
                    info!(
                        target: "relayer::relay",
                        nonce = %event.nonce,
                        source_tx = %event.transaction_hash,
                        tx_hash = %action.tx_hash,
                        "Unlock action ready"
                    );
                    if let Some(sink) = &self.action_sink {
                        if sink.send(action).is_err() {
                            warn!(target: "relayer::relay", "Action receiver dropped");
                        }
                    }
                }
                Err(e) => {
                    failed += 1;
                    error!(
                        target: "relayer::relay",
                        nonce = %event.nonce,
                        source_tx = %event.transaction_hash,
                        block = event.block_number,
                        error = %e,
                        "Failed to process lock event"
                    );
                }
            }
        }
        self.metrics.events_dispatched.increment(dispatched as u64);
        self.metrics.events_failed.increment(failed as u64);

        self.state = RelayState::Checkpointing;
        self.advance_checkpoint(batch.range.to);
        self.metrics.batch_duration.record(started.elapsed());

        info!(
            target: "relayer::relay",
            range = %batch.range,
            events = batch.events.len(),
            dispatched,
            failed,
            checkpoint = self.checkpoint,
            "Batch relayed"
        );

        self.idle(CycleOutcome::Relayed { range: batch.range, dispatched, failed })
    }

    /// Reconnects whichever side is down. Returns a report when the cycle has to stop here.
    async fn reconnect(&mut self) -> Option<CycleReport> {
        let source_down = !self.source.is_live();
        if source_down {
            self.state = RelayState::Reconnecting;
            self.metrics.reconnects.increment(1);
            warn!(target: "relayer::relay", chain = %self.source.name(), "Source disconnected, reconnecting");
            if self.source.connect().await.is_ok() {
                info!(
                    target: "relayer::relay",
                    chain = %self.source.name(),
                    "Source reconnected, scanning resumes next cycle"
                );
            }
        }

        if !self.destination.is_live() {
            self.state = RelayState::Reconnecting;
            self.metrics.reconnects.increment(1);
            warn!(
                target: "relayer::relay",
                chain = %self.destination.name(),
                "Destination disconnected, reconnecting"
            );
            if self.destination.connect().await.is_err() {
                return Some(self.report(CycleOutcome::Reconnecting, self.poll_interval));
            }
        }

        source_down.then(|| self.report(CycleOutcome::Reconnecting, self.poll_interval))
    }

    fn advance_checkpoint(&mut self, height: u64) {
        if height <= self.checkpoint {
            return;
        }
        self.checkpoint = height;
        self.metrics.checkpoint.set(height as f64);

        if let Err(e) = self.store.save(height) {
            self.metrics.persist_failures.increment(1);
            error!(
                target: "relayer::relay",
                checkpoint = height,
                error = %e,
                "Failed to persist checkpoint, keeping progress in memory"
            );
        }
    }

    fn idle(&mut self, outcome: CycleOutcome) -> CycleReport {
        self.state = RelayState::Idle;
        self.report(outcome, self.poll_interval)
    }

    fn report(&self, outcome: CycleOutcome, sleep: Duration) -> CycleReport {
        CycleReport { outcome, sleep }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        checkpoint::MemoryCheckpointStore,
        connection::LedgerClient,
        error::{ChainError, CheckpointError},
        gas_oracle::{GasPriceOracle, DEFAULT_GAS_PRICE_FLOOR_WEI},
        test_utils::{lock_log, test_signer, FlakyCheckpointStore, MockLedger, BRIDGE_ADDRESS},
    };
    use alloy_primitives::{Address, U256};
    use assert_matches::assert_matches;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    const POLL: Duration = Duration::from_secs(15);

    struct Harness {
        source: Arc<MockLedger>,
        destination: Arc<MockLedger>,
    }

    impl Harness {
        fn new(head: u64) -> Self {
            Self { source: Arc::new(MockLedger::new(head)), destination: Arc::new(MockLedger::new(1)) }
        }

        fn relay(
            &self,
            store: Arc<dyn CheckpointStore>,
            start_block: u64,
            batch_size: u64,
        ) -> (RelayLoop, UnboundedReceiver<UnlockAction>) {
            let source =
                Arc::new(ChainConnection::new("source", self.source.clone() as Arc<dyn LedgerClient>));
            let destination = Arc::new(ChainConnection::new(
                "destination",
                self.destination.clone() as Arc<dyn LedgerClient>,
            ));
            let scanner = EventScanner::new(source.clone(), BRIDGE_ADDRESS, batch_size);
            let oracle =
                Arc::new(GasPriceOracle::new(None, destination.clone(), DEFAULT_GAS_PRICE_FLOOR_WEI));
            let processor =
                ActionProcessor::new(destination.clone(), Address::repeat_byte(0x0d), test_signer(), oracle);
            let (tx, rx) = unbounded_channel();
            let relay = RelayLoop::new(source, destination, scanner, processor, store, start_block, POLL)
                .with_action_sink(tx);
            (relay, rx)
        }
    }

    fn drain(rx: &mut UnboundedReceiver<UnlockAction>) -> Vec<UnlockAction> {
        let mut actions = Vec::new();
        while let Ok(action) = rx.try_recv() {
            actions.push(action);
        }
        actions
    }

    #[derive(Debug)]
    struct PanickingStore;

    impl CheckpointStore for PanickingStore {
        fn load(&self, default_height: u64) -> u64 {
            default_height
        }

        fn save(&self, _height: u64) -> Result<(), CheckpointError> {
            panic!("checkpoint volume vanished")
        }
    }

    #[tokio::test]
    async fn test_end_to_end_batches() {
        let harness = Harness::new(1_000_250);
        harness.source.push_log(lock_log(1_000_050, 0, Address::repeat_byte(1), 100, 1));
        harness.source.push_log(lock_log(1_000_150, 0, Address::repeat_byte(2), 200, 2));
        harness.source.push_log(lock_log(1_000_220, 1, Address::repeat_byte(3), 300, 3));
        let store = Arc::new(MemoryCheckpointStore::default());
        let (mut relay, mut rx) = harness.relay(store.clone(), 1_000_000, 100);

        // first cycle only connects the source
        assert_eq!(relay.run_cycle().await.outcome, CycleOutcome::Reconnecting);

        let expected = [
            BlockRange::new(1_000_001, 1_000_100),
            BlockRange::new(1_000_101, 1_000_200),
            BlockRange::new(1_000_201, 1_000_250),
        ];
        for range in expected {
            let report = relay.run_cycle().await;
            assert_eq!(report.sleep, POLL);
            assert_matches!(report.outcome, CycleOutcome::Relayed { range: r, dispatched: 1, failed: 0 } if r == range);
            assert_eq!(relay.checkpoint(), range.to);
            assert_eq!(store.get(), Some(range.to));
            assert_eq!(relay.state(), RelayState::Idle);
        }

        assert_eq!(relay.run_cycle().await.outcome, CycleOutcome::CaughtUp { head: 1_000_250 });
        assert_eq!(harness.source.requested_ranges(), expected.to_vec());

        let nonces: Vec<U256> = drain(&mut rx).into_iter().map(|a| a.source_nonce).collect();
        assert_eq!(nonces, vec![U256::from(1), U256::from(2), U256::from(3)]);
    }

    #[tokio::test]
    async fn test_reorg_retries_same_range() {
        let harness = Harness::new(150);
        harness.source.fail_range(100, 150, ChainError::BlockNotFound("header not found".into()));
        let store = Arc::new(MemoryCheckpointStore::with_height(99));
        let (mut relay, _rx) = harness.relay(store.clone(), 0, 51);
        relay.run_cycle().await;

        let report = relay.run_cycle().await;
        assert_matches!(report.outcome, CycleOutcome::ScanFailed(ScanError::ReorgSuspected { .. }));
        assert_eq!(relay.checkpoint(), 99);
        assert_eq!(store.get(), Some(99));

        harness.source.clear_failures();
        assert_matches!(relay.run_cycle().await.outcome, CycleOutcome::Relayed { .. });
        assert_eq!(harness.source.requested_ranges(), vec![BlockRange::new(100, 150); 2]);
        assert_eq!(relay.checkpoint(), 150);
    }

    #[tokio::test]
    async fn test_failed_save_redelivers_after_restart() {
        let harness = Harness::new(1_000_100);
        harness.source.push_log(lock_log(1_000_010, 0, Address::repeat_byte(1), 5, 9));
        let store = Arc::new(FlakyCheckpointStore::default());
        store.set_failing(true);

        let (mut relay, mut rx) = harness.relay(store.clone(), 1_000_000, 100);
        relay.run_cycle().await;
        assert_matches!(relay.run_cycle().await.outcome, CycleOutcome::Relayed { dispatched: 1, .. });
        // progress is kept in memory even though the write failed
        assert_eq!(relay.checkpoint(), 1_000_100);
        assert_eq!(store.get(), None);
        assert_eq!(drain(&mut rx).len(), 1);

        // restart from the persisted state delivers the same event again
        store.set_failing(false);
        let (mut restarted, mut rx) = harness.relay(store.clone(), 1_000_000, 100);
        assert_eq!(restarted.checkpoint(), 1_000_000);
        restarted.run_cycle().await;
        restarted.run_cycle().await;
        let actions = drain(&mut rx);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].source_nonce, U256::from(9));
        assert_eq!(store.get(), Some(1_000_100));
    }

    #[tokio::test]
    async fn test_restart_scans_identical_ranges() {
        let harness = Harness::new(1_000_250);
        let store = Arc::new(MemoryCheckpointStore::with_height(1_000_100));

        for _ in 0..2 {
            let (mut relay, _rx) = harness.relay(store.clone(), 1_000_000, 100);
            relay.run_cycle().await;
            assert_matches!(
                relay.run_cycle().await.outcome,
                CycleOutcome::Relayed { range, .. } if range == BlockRange::new(1_000_101, 1_000_200)
            );
            store.save(1_000_100).unwrap();
        }
    }

    #[tokio::test]
    async fn test_processing_failure_does_not_stop_batch() {
        let harness = Harness::new(200);
        harness.source.push_log(lock_log(120, 0, Address::repeat_byte(1), 1, 1));
        harness.source.push_log(lock_log(130, 0, Address::repeat_byte(1), 1, 2));
        harness.destination.set_transaction_count_error(Some(ChainError::Rpc("nonce too low".into())));
        let store = Arc::new(MemoryCheckpointStore::default());
        let (mut relay, mut rx) = harness.relay(store.clone(), 100, 100);
        relay.run_cycle().await;

        assert_matches!(relay.run_cycle().await.outcome, CycleOutcome::Relayed { dispatched: 0, failed: 2, .. });
        assert_eq!(store.get(), Some(200));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_destination_down_blocks_scanning() {
        let harness = Harness::new(500);
        harness.destination.set_reachable(false);
        let store = Arc::new(MemoryCheckpointStore::default());
        let (mut relay, _rx) = harness.relay(store.clone(), 0, 100);

        for _ in 0..3 {
            let report = relay.run_cycle().await;
            assert_eq!(report.outcome, CycleOutcome::Reconnecting);
            assert_eq!(report.sleep, POLL);
            assert_eq!(relay.state(), RelayState::Reconnecting);
        }
        assert!(harness.source.requested_ranges().is_empty());
        assert_eq!(relay.checkpoint(), 0);

        harness.destination.set_reachable(true);
        assert_matches!(relay.run_cycle().await.outcome, CycleOutcome::Relayed { .. });
    }

    #[tokio::test]
    async fn test_source_outage_reconnects() {
        let harness = Harness::new(500);
        let store = Arc::new(MemoryCheckpointStore::default());
        let (mut relay, _rx) = harness.relay(store.clone(), 400, 100);
        relay.run_cycle().await;
        assert_matches!(relay.run_cycle().await.outcome, CycleOutcome::Relayed { .. });

        harness.source.set_head(600);
        harness.source.set_reachable(false);
        assert_eq!(relay.run_cycle().await.outcome, CycleOutcome::HeadUnavailable);
        assert_eq!(relay.run_cycle().await.outcome, CycleOutcome::Reconnecting);
        assert_eq!(relay.checkpoint(), 500);

        harness.source.set_reachable(true);
        assert_eq!(relay.run_cycle().await.outcome, CycleOutcome::Reconnecting);
        assert_matches!(
            relay.run_cycle().await.outcome,
            CycleOutcome::Relayed { range, .. } if range == BlockRange::new(501, 600)
        );
    }

    #[tokio::test]
    async fn test_panic_backs_off() {
        let harness = Harness::new(50);
        let (mut relay, _rx) = harness.relay(Arc::new(PanickingStore), 0, 100);
        relay.run_cycle_guarded().await;

        let report = relay.run_cycle_guarded().await;
        assert_eq!(report.outcome, CycleOutcome::Panicked("checkpoint volume vanished".to_string()));
        assert_eq!(report.sleep, POLL * 2);
        assert_eq!(relay.state(), RelayState::BackingOff);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let harness = Harness::new(1_000_250);
        let (relay, _rx) = harness.relay(Arc::new(MemoryCheckpointStore::default()), 1_000_000, 100);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(relay.run(cancel).await, 1_000_000);
        assert!(harness.source.requested_ranges().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_cancelled() {
        let harness = Harness::new(1_000_250);
        let store = Arc::new(MemoryCheckpointStore::default());
        let (relay, _rx) = harness.relay(store.clone(), 1_000_000, 100);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(relay.run(cancel.clone()));

        tokio::time::sleep(POLL * 10).await;
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), 1_000_250);
        assert_eq!(store.get(), Some(1_000_250));
    }
}
