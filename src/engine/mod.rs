mod conflict;
mod error;
mod mutations;
mod queries;
mod store;

pub use conflict::{find_booking_conflict, find_conflict, validate_range};
pub use error::{Conflict, EngineError, Entity, RangeError};
pub use store::{PropertyStore, PropertyTxn, SharedPropertyState};

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use tokio::sync::{mpsc, oneshot};
use ulid::{Generator, Ulid};

use crate::clock::Clock;
use crate::model::*;
use crate::wal::Wal;

const WAL_CHANNEL_CAPACITY: usize = 4096;

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

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Every append that is already queued when the first one
/// arrives joins the same batch and shares a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_control(&mut wal, cmd);
            continue;
        };

        let mut batch: Vec<PendingAppend> = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    // Control commands must observe every append queued before them.
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut outcome = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            outcome = Err(e);
            break;
        }
    }
    // Flush even after a failed append so half-written bytes do not bleed
    // into the next batch.
    let flushed = wal.flush_sync();
    if outcome.is_ok() {
        outcome = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let reply = match &outcome {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { response, .. } => {
            let _ = response.send(Err(io::Error::other("append routed to control path")));
        }
    }
}

/// The availability/conflict engine for one tenant.
pub struct Engine {
    pub(super) store: PropertyStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    clock: Arc<dyn Clock>,
    ids: Mutex<Generator>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task.
    /// Must be called from inside a Tokio runtime.
    pub fn new(wal_path: PathBuf, clock: Arc<dyn Clock>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(WAL_CHANNEL_CAPACITY);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: PropertyStore::new(),
            wal_tx,
            clock,
            ids: Mutex::new(Generator::new()),
        };

        // Sole owner during replay: try_lock never contends, and blocking
        // locks are off limits because this may run inside async code.
        for event in &events {
            let previous = engine.store.previous_property(event);
            let mut txn = engine
                .store
                .try_lock(event.property_id(), previous.as_deref())
                .ok_or_else(|| io::Error::other("replay: property state contended"))?;
            engine.store.apply(&mut txn, event);
        }

        Ok(engine)
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    /// Monotonic within this engine, so ids sort in creation order.
    pub(super) fn next_id(&self) -> Ulid {
        let mut generator = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        generator.generate().unwrap_or_else(|_| Ulid::new())
    }

    pub fn property_ids(&self) -> Vec<PropertyId> {
        self.store.property_ids()
    }

    pub fn get_property(&self, property_id: &str) -> Option<SharedPropertyState> {
        self.store.get_property(property_id)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Make the event durable, then apply it to the locked states.
    pub(super) async fn persist_and_apply(
        &self,
        txn: &mut PropertyTxn,
        event: Event,
    ) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        self.store.apply(txn, &event);
        Ok(())
    }

    /// Lookup booking → property, then lock it together with `target`.
    /// Retries if the booking moved to another property in the meantime.
    pub(super) async fn lock_booking(
        &self,
        id: Ulid,
        target: Option<&str>,
    ) -> Result<(Booking, PropertyTxn), EngineError> {
        loop {
            let current = self
                .store
                .property_of_booking(&id)
                .ok_or_else(|| EngineError::booking_not_found(id))?;
            let txn = match target {
                Some(t) => self.store.lock(t, Some(&current)).await,
                None => self.store.lock(&current, None).await,
            };
            if let Some(booking) = txn.state(&current).and_then(|s| s.booking(id)) {
                return Ok((booking.clone(), txn));
            }
        }
    }

    pub(super) async fn lock_block(
        &self,
        id: Ulid,
        target: Option<&str>,
    ) -> Result<(Block, PropertyTxn), EngineError> {
        loop {
            let current = self
                .store
                .property_of_block(&id)
                .ok_or_else(|| EngineError::block_not_found(id))?;
            let txn = match target {
                Some(t) => self.store.lock(t, Some(&current)).await,
                None => self.store.lock(&current, None).await,
            };
            if let Some(block) = txn.state(&current).and_then(|s| s.block(id)) {
                return Ok((block.clone(), txn));
            }
        }
    }
}
