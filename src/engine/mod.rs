mod availability;
mod conflict;
mod error;
mod ledger;
mod lifecycle;
mod mutations;
mod queries;
mod store;
mod txn;

pub use availability::{merge_overlapping, open_slots, subtract_intervals};
pub use conflict::{check_availability, ConflictResult};
pub use error::{BookingError, ResourceConflict, ValidationError};
pub(crate) use error::span_of;
pub use ledger::{ResourceLedger, SharedLedger};
pub use lifecycle::{can_transition, is_terminal};
pub use store::{BookingStore, ResourceDirectory};
pub use txn::ScheduleTxn;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{error, warn};
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::limits::MAX_RELOCK_ATTEMPTS;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut pending = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            pending = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = pending {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

/// Append and fsync the whole batch, or leave the log as it was before it.
/// Every caller in a failed batch is refused and none of its events are
/// applied, so none of them may survive on disk either.
fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if let Err(ref e) = result {
        warn!("WAL batch of {} failed, rolling back: {e}", batch.len());
        if let Err(rollback) = wal.discard_unsynced() {
            error!("WAL rollback failed, refusing further appends: {rollback}");
        }
    }
    result
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let batch = vec![(event, response)];
            let result = flush_batch(wal, &batch);
            respond_batch(batch, &result);
        }
    }
}

/// One tenant's booking engine: store, durable log, notifications.
pub struct Engine {
    pub store: BookingStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) config: EngineConfig,
    /// Commits hold this shared across WAL append and apply; compaction holds
    /// it exclusively so its snapshot matches the log it replaces.
    pub(super) commit_gate: RwLock<()>,
    /// Serializes directory registrations (existence check + insert).
    pub(super) registration: Mutex<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::with_options(wal_path, notify, Arc::new(SystemClock), EngineConfig::default())
    }

    pub fn with_options(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = BookingStore::new();
        // Sole owner of every ledger here, so try_begin never contends. Never
        // block: this can run inside an async context (lazy tenant creation).
        for event in &events {
            let mut txn = ScheduleTxn::try_begin(&store, store.event_keys(event))
                .ok_or_else(|| io::Error::other("replay: ledger unexpectedly locked"))?;
            store.apply_event(&mut txn, event);
        }

        Ok(Self {
            store,
            wal_tx,
            notify,
            clock,
            config,
            commit_gate: RwLock::new(()),
            registration: Mutex::new(()),
        })
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), BookingError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| BookingError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| BookingError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| BookingError::Storage(e.to_string()))
    }

    /// Durable append, then apply under the caller's ledger locks.
    /// A failed append leaves memory untouched.
    pub(super) async fn commit(&self, txn: &mut ScheduleTxn, event: &Event) -> Result<(), BookingError> {
        let _gate = self.commit_gate.read().await;
        self.wal_append(event).await?;
        self.store.apply_event(txn, event);
        Ok(())
    }

    /// Fire-and-forget notice on both resources' channels.
    pub(super) fn publish(&self, previous: Option<BookingStatus>, booking: &Booking) {
        self.notify.publish(&BookingNotice {
            booking_id: booking.id,
            staff_id: booking.staff_id,
            subject_id: booking.subject_id,
            previous_status: previous,
            new_status: booking.status,
            span: booking.span,
        });
    }

    /// Lock the ledgers of booking `id` together with `extra`, then re-read
    /// the record under those locks. If the booking moved to other resources
    /// while we waited, release and try again.
    pub(super) async fn lock_booking(
        &self,
        id: Ulid,
        extra: &[ResourceKey],
    ) -> Result<(Booking, ScheduleTxn), BookingError> {
        for _ in 0..MAX_RELOCK_ATTEMPTS {
            let snapshot = self.store.booking(&id).ok_or(BookingError::NotFound(id))?;
            let keys = snapshot.resource_keys().into_iter().chain(extra.iter().copied());
            let txn = ScheduleTxn::begin(&self.store, keys, self.config.lock_timeout).await?;
            let current = self.store.booking(&id).ok_or(BookingError::NotFound(id))?;
            if current.resource_keys() == snapshot.resource_keys() {
                return Ok((current, txn));
            }
            tracing::debug!("booking {id} moved while locking, retrying");
        }
        Err(BookingError::Timeout("booking kept moving between resources"))
    }
}
