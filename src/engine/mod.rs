mod availability;
mod error;
mod mutations;
mod queries;
mod validate;

pub use availability::{effective_availability, free_windows, merge_ranges, subtract_ranges};
pub use error::EngineError;
pub use validate::validate_booking;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedInstructorState = Arc<RwLock<InstructorState>>;

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

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
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

fn respond_batch(
    batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>,
    result: &io::Result<()>,
) {
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
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedInstructorState>,
    /// Sessions with no instructor (simple trainings, or orphaned after
    /// instructor removal). They never undergo booking validation.
    pub(super) floating: DashMap<Ulid, Session>,
    /// Serializes floating-pool writes. Instructor-owned sessions are
    /// covered by the per-instructor lock; floating ones have no owner.
    /// Lock order: instructor locks first, this lock innermost.
    pub(super) floating_write: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: slot/session id → owning instructor id.
    pub(super) entity_to_instructor: DashMap<Ulid, Ulid>,
}

/// Apply an instructor-scoped event to an InstructorState (no locking —
/// the caller holds the write lock). Session events are routed at the
/// Engine level because they can move between instructors.
fn apply_to_instructor(rs: &mut InstructorState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::SlotCreated { slot } | Event::SlotUpdated { slot } => {
            entity_map.insert(slot.id, slot.instructor_id);
            rs.upsert_slot(slot.clone());
        }
        Event::SlotRemoved { id, .. } => {
            rs.remove_slot(*id);
            entity_map.remove(id);
        }
        Event::SlotAvailabilitySet { id, available, .. } => {
            if let Some(slot) = rs.slots.iter_mut().find(|s| s.id == *id) {
                slot.available = *available;
            }
        }
        Event::InstructorUpdated { name, age, .. } => {
            rs.name = name.clone();
            rs.age = *age;
        }
        Event::InstructorAvailabilitySet { available, .. } => {
            rs.available = *available;
        }
        _ => {}
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
            floating: DashMap::new(),
            floating_write: Mutex::new(()),
            wal_tx,
            notify,
            entity_to_instructor: DashMap::new(),
        };

        // Replay events — we're the sole owner of these Arcs, so try_read/try_write
        // always succeed instantly (no contention). Never use blocking_read/blocking_write
        // here because this may run inside an async context (e.g. lazy tenant creation).
        for event in &events {
            match event {
                Event::InstructorRegistered {
                    id,
                    name,
                    age,
                    available,
                } => {
                    let rs = InstructorState::new(*id, name.clone(), *age, *available);
                    engine.state.insert(*id, Arc::new(RwLock::new(rs)));
                }
                Event::InstructorRemoved { id } => {
                    engine.detach_instructor_replay(id);
                }
                Event::SessionBooked { session } | Event::SessionUpdated { session } => {
                    engine.replay_upsert_session(session.clone());
                }
                Event::SessionCancelled { id } => {
                    engine.replay_remove_session(id);
                }
                Event::SessionCompletedSet { id, completed } => {
                    engine.replay_set_completed(id, *completed);
                }
                other => {
                    if let Some(instructor_id) = event_instructor_id(other)
                        && let Some(entry) = engine.state.get(&instructor_id) {
                            let rs_arc = entry.clone();
                            let mut guard =
                                rs_arc.try_write().expect("replay: uncontended write");
                            apply_to_instructor(&mut guard, other, &engine.entity_to_instructor);
                        }
                }
            }
        }

        Ok(engine)
    }

    /// Remove an instructor's state during replay: slots vanish, sessions
    /// move to the floating pool (never auto-cancelled).
    fn detach_instructor_replay(&self, id: &Ulid) {
        if let Some((_, rs_arc)) = self.state.remove(id) {
            let guard = rs_arc.try_read().expect("replay: uncontended read");
            for slot in &guard.slots {
                self.entity_to_instructor.remove(&slot.id);
            }
            for session in &guard.sessions {
                self.entity_to_instructor.remove(&session.id);
                self.floating.insert(session.id, session.clone());
            }
        }
    }

    fn replay_upsert_session(&self, session: Session) {
        self.replay_remove_session(&session.id);
        match session.instructor_id {
            Some(iid) if self.state.contains_key(&iid) => {
                if let Some(entry) = self.state.get(&iid) {
                    let rs_arc = entry.clone();
                    let mut guard = rs_arc.try_write().expect("replay: uncontended write");
                    self.entity_to_instructor.insert(session.id, iid);
                    guard.insert_session(session);
                }
            }
            _ => {
                self.floating.insert(session.id, session);
            }
        }
    }

    fn replay_remove_session(&self, id: &Ulid) {
        if self.floating.remove(id).is_some() {
            return;
        }
        if let Some((_, iid)) = self.entity_to_instructor.remove(id)
            && let Some(entry) = self.state.get(&iid) {
                let rs_arc = entry.clone();
                let mut guard = rs_arc.try_write().expect("replay: uncontended write");
                guard.remove_session(*id);
            }
    }

    fn replay_set_completed(&self, id: &Ulid, completed: bool) {
        if let Some(mut session) = self.floating.get_mut(id) {
            session.completed = completed;
            return;
        }
        if let Some(iid) = self.instructor_for_entity(id)
            && let Some(entry) = self.state.get(&iid) {
                let rs_arc = entry.clone();
                let mut guard = rs_arc.try_write().expect("replay: uncontended write");
                if let Some(session) = guard.sessions.iter_mut().find(|s| s.id == *id) {
                    session.completed = completed;
                }
            }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
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

    pub fn get_instructor(&self, id: &Ulid) -> Option<SharedInstructorState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn instructor_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_instructor.get(entity_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify in one call for instructor-scoped events.
    pub(super) async fn persist_and_apply(
        &self,
        instructor_id: Ulid,
        rs: &mut InstructorState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_instructor(rs, event, &self.entity_to_instructor);
        self.notify.send(instructor_id, event);
        Ok(())
    }

    /// Lookup entity → instructor, get instructor, acquire write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<InstructorState>), EngineError> {
        let instructor_id = self
            .instructor_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let rs = self
            .get_instructor(&instructor_id)
            .ok_or(EngineError::NotFound(instructor_id))?;
        let guard = rs.write_owned().await;
        Ok((instructor_id, guard))
    }
}

/// Extract the owning instructor id from an instructor-scoped event.
fn event_instructor_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::SlotCreated { slot } | Event::SlotUpdated { slot } => Some(slot.instructor_id),
        Event::SlotRemoved { instructor_id, .. }
        | Event::SlotAvailabilitySet { instructor_id, .. } => Some(*instructor_id),
        Event::InstructorUpdated { id, .. } | Event::InstructorAvailabilitySet { id, .. } => {
            Some(*id)
        }
        _ => None,
    }
}
