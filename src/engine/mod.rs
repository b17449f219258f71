mod error;
mod mutations;
mod queries;
mod quota;
mod window;

pub use error::EngineError;
pub use window::window_containing;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedSubjectState = Arc<RwLock<SubjectState>>;

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
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                                .record(batch.len() as f64);
                            let flush_start = std::time::Instant::now();
                            let result = flush_batch(&mut wal, &mut batch);
                            metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                                .record(flush_start.elapsed().as_secs_f64());
                            respond_batch(&mut batch, &result);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                        .record(batch.len() as f64);
                    let flush_start = std::time::Instant::now();
                    let result = flush_batch(&mut wal, &mut batch);
                    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                        .record(flush_start.elapsed().as_secs_f64());
                    respond_batch(&mut batch, &result);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
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
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedSubjectState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: booking id → subject id
    pub(super) booking_to_subject: DashMap<Ulid, Ulid>,
}

/// Apply an event directly to a SubjectState (no locking — caller holds the lock).
fn apply_to_subject(st: &mut SubjectState, event: &Event, booking_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::LimitsReplaced { kind, limits, .. } => {
            st.set_limits(*kind, *limits);
        }
        Event::BookingRecorded {
            id,
            subject_id,
            span,
            label,
        } => {
            st.insert_booking(Booking {
                id: *id,
                span: *span,
                label: label.clone(),
            });
            booking_map.insert(*id, *subject_id);
        }
        Event::BookingCancelled { id, .. } => {
            st.remove_booking(*id);
            booking_map.remove(id);
        }
        Event::SubjectUpdated { name, .. } => {
            st.name = name.clone();
        }
        // SubjectCreated/Deleted are handled at the DashMap level, not here
        Event::SubjectCreated { .. } | Event::SubjectDeleted { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            booking_to_subject: DashMap::new(),
        };

        // Replay events — we're the sole owner of these Arcs, so try_read/try_write
        // always succeed instantly (no contention). Never use blocking_read/blocking_write
        // here because this may run inside an async context (e.g. lazy tenant creation).
        for event in &events {
            match event {
                Event::SubjectCreated { id, name } => {
                    let st = SubjectState::new(*id, name.clone());
                    engine.state.insert(*id, Arc::new(RwLock::new(st)));
                }
                Event::SubjectDeleted { id } => {
                    if let Some(entry) = engine.state.get(id) {
                        let st = entry.try_read().expect("replay: uncontended read");
                        for booking in &st.bookings {
                            engine.booking_to_subject.remove(&booking.id);
                        }
                    }
                    engine.state.remove(id);
                }
                other => {
                    if let Some(subject_id) = event_subject_id(other)
                        && let Some(entry) = engine.state.get(&subject_id)
                    {
                        let st_arc = entry.clone();
                        let mut guard = st_arc.try_write().expect("replay: uncontended write");
                        apply_to_subject(&mut guard, other, &engine.booking_to_subject);
                    }
                }
            }
        }

        Ok(engine)
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

    pub fn get_subject(&self, id: &Ulid) -> Option<SharedSubjectState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn subject_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_subject.get(booking_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify in one call. Eliminates the repeated 3-line pattern.
    pub(super) async fn persist_and_apply(
        &self,
        subject_id: Ulid,
        st: &mut SubjectState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_subject(st, event, &self.booking_to_subject);
        self.notify.send(subject_id, event);
        Ok(())
    }

    /// Lookup booking → subject, get subject, acquire write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<SubjectState>), EngineError> {
        let subject_id = self
            .subject_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let st = self
            .get_subject(&subject_id)
            .ok_or(EngineError::NotFound(subject_id))?;
        let guard = st.write_owned().await;
        Ok((subject_id, guard))
    }
}

/// Extract the subject_id from an event (for non-Create/Delete events).
fn event_subject_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::LimitsReplaced { subject_id, .. }
        | Event::BookingRecorded { subject_id, .. }
        | Event::BookingCancelled { subject_id, .. } => Some(*subject_id),
        Event::SubjectUpdated { id, .. } => Some(*id),
        Event::SubjectCreated { .. } | Event::SubjectDeleted { .. } => None,
    }
}
