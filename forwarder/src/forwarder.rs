//! Forwarder - the tick-driven delivery loop
//!
//! Every tick runs one cycle:
//!
//! ```text
//! Idle ──► Fetching ──► Serializing ──► Transacting ──► Committing ──► Idle
//!             │              │               │
//!             └──────────────┴───────────────┴──► Aborted (retry next tick)
//! ```
//!
//! The offset only moves after the downstream transaction completed, so a
//! failure anywhere before that re-sends the whole batch on the next tick.
//! If the offset save fails after completion the batch is delivered again
//! later; downstream must tolerate duplicate batches. A transaction that did
//! not complete is cancelled so the remote can release it.
//!
//! # Example
//!
//! ```ignore
//! use siirto_forwarder::{FileOffsetStore, Forwarder, JournalSource, WireEncoder};
//!
//! let forwarder = Forwarder::new(
//!     Arc::new(JournalSource::new("events.ndjson")),
//!     Arc::new(transport),
//!     Arc::new(FileOffsetStore::new("conf/siirto.state")),
//!     WireEncoder::new(WireSettings::default()),
//! )
//! .batch_size(500);
//!
//! forwarder.run(shutdown_signal()).await?;
//! ```

use crate::error::{Result, SiirtoError, TransportError};
use crate::metrics_server::Liveness;
use crate::offset::OffsetStore;
use crate::source::{EventSource, validate_batch};
use crate::transport::{Transaction, TransactionState, TransferDirection, Transport};
use crate::wire::WireEncoder;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Attribute carrying the per-transaction correlation id
pub const TRANSACTION_ID_ATTRIBUTE: &str = "siirto.transaction.id";

/// Attribute carrying the number of records in the payload
pub const RECORD_COUNT_ATTRIBUTE: &str = "siirto.record.count";

/// Attribute carrying the first sequence id in the payload
pub const FIRST_SEQUENCE_ATTRIBUTE: &str = "siirto.first.sequence";

pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Where a cycle currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Fetching,
    Serializing,
    Transacting,
    Committing,
    /// The last cycle stopped early; nothing was committed
    Aborted,
}

impl CyclePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CyclePhase::Idle => "idle",
            CyclePhase::Fetching => "fetching",
            CyclePhase::Serializing => "serializing",
            CyclePhase::Transacting => "transacting",
            CyclePhase::Committing => "committing",
            CyclePhase::Aborted => "aborted",
        }
    }
}

/// Result of one cycle
#[derive(Debug)]
pub enum CycleOutcome {
    /// Nothing new to forward
    Idle,
    /// A batch was delivered downstream
    Delivered {
        count: usize,
        transaction_id: String,
        next_offset: u64,
        /// False when the offset save failed; the batch will be sent again
        persisted: bool,
    },
    /// The remote refused to open a transaction; try again next tick
    Penalized,
    /// The cycle stopped in `phase` without moving the offset
    Aborted {
        phase: CyclePhase,
        error: SiirtoError,
    },
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Idle => "idle",
            CycleOutcome::Delivered { .. } => "delivered",
            CycleOutcome::Penalized => "penalized",
            CycleOutcome::Aborted { .. } => "aborted",
        }
    }
}

/// Counters owned by one forwarder
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwarderStats {
    pub cycles: u64,
    pub idle_cycles: u64,
    pub batches_delivered: u64,
    pub records_forwarded: u64,
    pub penalized: u64,
    pub aborted: u64,
    /// Delivered batches whose offset could not be saved
    pub duplicates_risked: u64,
}

/// Moves records from a source to a transport, one batch per tick
pub struct Forwarder {
    source: Arc<dyn EventSource>,
    transport: Arc<dyn Transport>,
    offsets: Arc<dyn OffsetStore>,
    encoder: WireEncoder,
    batch_size: usize,
    timeout: Duration,
    tick_interval: Duration,
    /// Resume position; `None` until first loaded from the store
    next_offset: Option<u64>,
    phase: CyclePhase,
    stats: ForwarderStats,
    liveness: Arc<Liveness>,
}

impl Forwarder {
    pub fn new(
        source: Arc<dyn EventSource>,
        transport: Arc<dyn Transport>,
        offsets: Arc<dyn OffsetStore>,
        encoder: WireEncoder,
    ) -> Self {
        Self {
            source,
            transport,
            offsets,
            encoder,
            batch_size: DEFAULT_BATCH_SIZE,
            timeout: DEFAULT_TIMEOUT,
            tick_interval: DEFAULT_TICK_INTERVAL,
            next_offset: None,
            phase: CyclePhase::Idle,
            stats: ForwarderStats::default(),
            liveness: Arc::new(Liveness::new(
                DEFAULT_TICK_INTERVAL + DEFAULT_TIMEOUT * 3,
            )),
        }
    }

    /// Maximum records per batch. Zero is raised to one.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Bound for send, confirm and complete together
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Share progress with a health endpoint
    pub fn liveness(mut self, liveness: Arc<Liveness>) -> Self {
        self.liveness = liveness;
        self
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    pub fn stats(&self) -> ForwarderStats {
        self.stats
    }

    /// In-memory resume position, if loaded
    pub fn next_offset(&self) -> Option<u64> {
        self.next_offset
    }

    /// Run one cycle. Errors are reported in the outcome, never returned.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        self.stats.cycles += 1;
        let outcome = self.cycle().await;

        match &outcome {
            CycleOutcome::Idle => self.stats.idle_cycles += 1,
            CycleOutcome::Delivered {
                count, persisted, ..
            } => {
                self.stats.batches_delivered += 1;
                self.stats.records_forwarded += *count as u64;
                if !persisted {
                    self.stats.duplicates_risked += 1;
                }
                crate::metrics::try_record_forwarded(*count as u64);
            }
            CycleOutcome::Penalized => self.stats.penalized += 1,
            CycleOutcome::Aborted { error, .. } => {
                self.stats.aborted += 1;
                crate::metrics::try_record_error(error.kind());
            }
        }
        crate::metrics::try_record_cycle(outcome.label());
        self.liveness.beat();

        outcome
    }

    async fn cycle(&mut self) -> CycleOutcome {
        self.phase = CyclePhase::Fetching;
        let after = match self.resume_position().await {
            Ok(after) => after,
            Err(e) => return self.abort(e),
        };

        let records = match self.source.fetch(after, self.batch_size).await {
            Ok(records) => records,
            Err(e) => return self.abort(e.into()),
        };
        if let Err(e) = validate_batch(after, self.batch_size, &records) {
            return self.abort(e.into());
        }
        let (Some(first), Some(last)) = (records.first(), records.last()) else {
            debug!(source = self.source.name(), after, "No new records");
            self.phase = CyclePhase::Idle;
            return CycleOutcome::Idle;
        };
        let first_sequence = first.sequence_id;
        let next_offset = last.sequence_id.saturating_add(1);
        let count = records.len();

        self.phase = CyclePhase::Serializing;
        let payload = match self.encoder.encode_batch(&records) {
            Ok(payload) => payload,
            Err(e) => return self.abort(e.into()),
        };

        self.phase = CyclePhase::Transacting;
        let started = Instant::now();
        let mut transaction = match self
            .transport
            .create_transaction(TransferDirection::Send)
            .await
        {
            Ok(Some(transaction)) => transaction,
            Ok(None) => {
                debug!(
                    transport = self.transport.name(),
                    pending = count,
                    "Remote penalized, skipping cycle"
                );
                self.phase = CyclePhase::Idle;
                return CycleOutcome::Penalized;
            }
            Err(e) => return self.abort(e.into()),
        };

        let transaction_id = ulid::Ulid::new().to_string();
        let attributes = HashMap::from([
            (TRANSACTION_ID_ATTRIBUTE.to_string(), transaction_id.clone()),
            (RECORD_COUNT_ATTRIBUTE.to_string(), count.to_string()),
            (FIRST_SEQUENCE_ATTRIBUTE.to_string(), first_sequence.to_string()),
        ]);
        let payload_bytes = payload.len();

        let delivery = async {
            transaction.send(payload, attributes).await?;
            transaction.confirm().await?;
            transaction.complete().await
        };
        let delivered = match tokio::time::timeout(self.timeout, delivery).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.timeout)),
        };
        if let Err(e) = delivered {
            let reached = transaction.state();
            self.cancel(transaction.as_mut()).await;
            warn!(
                transaction_id = %transaction_id,
                remote_transaction = transaction.id(),
                reached = ?reached,
                state = ?transaction.state(),
                "Transaction not completed"
            );
            return self.abort(e.into());
        }

        let elapsed = started.elapsed();
        crate::metrics::try_record_transaction_latency(elapsed.as_secs_f64());
        info!(
            count,
            first_sequence,
            bytes = payload_bytes,
            transaction_id = %transaction_id,
            duration_ms = elapsed.as_millis() as u64,
            "Batch delivered"
        );

        self.phase = CyclePhase::Committing;
        let persisted = match self.offsets.save(next_offset).await {
            Ok(()) => {
                self.next_offset = Some(next_offset);
                crate::metrics::try_set_offset(next_offset);
                true
            }
            Err(e) => {
                error!(
                    error = %e,
                    next_offset,
                    "Offset save failed after delivery, batch will be sent again"
                );
                crate::metrics::try_record_error("storage");
                false
            }
        };

        self.phase = CyclePhase::Idle;
        CycleOutcome::Delivered {
            count,
            transaction_id,
            next_offset,
            persisted,
        }
    }

    /// Release an unfinished transaction; failures are only logged
    async fn cancel(&self, transaction: &mut dyn Transaction) {
        if transaction.state() == TransactionState::Completed {
            return;
        }
        let result = tokio::time::timeout(self.timeout, transaction.cancel()).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(
                remote_transaction = transaction.id(),
                error = %e,
                "Transaction cancel failed"
            ),
            Err(_) => debug!(
                remote_transaction = transaction.id(),
                "Transaction cancel timed out"
            ),
        }
    }

    async fn resume_position(&mut self) -> Result<u64> {
        if let Some(offset) = self.next_offset {
            return Ok(offset);
        }

        let offset = self.offsets.load().await?.unwrap_or(0);
        info!(offset, "Resume position loaded");
        crate::metrics::try_set_offset(offset);
        self.next_offset = Some(offset);
        Ok(offset)
    }

    fn abort(&mut self, error: SiirtoError) -> CycleOutcome {
        let phase = self.phase;
        self.phase = CyclePhase::Aborted;
        error!(
            phase = phase.as_str(),
            kind = error.kind(),
            error = %error,
            "Cycle aborted"
        );
        CycleOutcome::Aborted { phase, error }
    }

    /// Run a cycle on every tick until `shutdown` resolves
    ///
    /// A cycle in progress always finishes before shutdown is honoured.
    /// Returns the final stats, or the error that made continuing unsafe.
    pub async fn run<F>(mut self, shutdown: F) -> Result<ForwarderStats>
    where
        F: Future<Output = ()>,
    {
        info!(
            source = self.source.name(),
            transport = self.transport.name(),
            batch_size = self.batch_size,
            tick_ms = self.tick_interval.as_millis() as u64,
            "Forwarder started"
        );

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break Ok(());
                }
                _ = ticker.tick() => {
                    if let CycleOutcome::Aborted { error, phase } = self.run_cycle().await {
                        if error.is_fatal() {
                            error!(
                                phase = phase.as_str(),
                                error = %error,
                                "Unrecoverable error, stopping forwarder"
                            );
                            break Err(error);
                        }
                    }
                }
            }
        };

        self.liveness.stop();
        if let Err(e) = self.transport.close().await {
            warn!(error = %e, "Transport close failed");
        }

        let stats = self.stats;
        info!(
            cycles = stats.cycles,
            records = stats.records_forwarded,
            aborted = stats.aborted,
            "Forwarder stopped"
        );

        result.map(|()| stats)
    }
}
