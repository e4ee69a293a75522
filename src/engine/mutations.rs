use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use tokio::sync::{RwLock, oneshot};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::pattern::WeekdayPattern;

use super::validate::validate_booking;
use super::{Engine, EngineError, WalCommand};

fn build_window(
    start: Option<NaiveTime>,
    end: Option<NaiveTime>,
) -> Result<Option<TimeRange>, EngineError> {
    match (start, end) {
        (Some(s), Some(e)) => {
            if s >= e {
                return Err(EngineError::InvalidRange { start: s, end: e });
            }
            Ok(Some(TimeRange::new(s, e)))
        }
        (None, None) => Ok(None),
        _ => Err(EngineError::MissingSchedule(
            "start and end must be given together",
        )),
    }
}

fn parse_pattern(text: &str) -> Result<WeekdayPattern, EngineError> {
    if text.len() > MAX_PATTERN_LEN {
        return Err(EngineError::LimitExceeded("pattern too long"));
    }
    WeekdayPattern::parse(text).map_err(|e| EngineError::InvalidPattern(e.to_string()))
}

fn check_text(value: &Option<String>, what: &'static str) -> Result<(), EngineError> {
    if let Some(v) = value
        && v.len() > MAX_TEXT_LEN {
            return Err(EngineError::LimitExceeded(what));
        }
    Ok(())
}

impl Engine {
    // ── Instructors ──────────────────────────────────────

    pub async fn register_instructor(
        &self,
        id: Ulid,
        name: String,
        age: u32,
        available: bool,
    ) -> Result<(), EngineError> {
        if self.state.len() >= MAX_INSTRUCTORS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many instructors"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("instructor name too long"));
        }
        if age < MIN_INSTRUCTOR_AGE {
            return Err(EngineError::LimitExceeded("instructor under minimum age"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::InstructorRegistered {
            id,
            name: name.clone(),
            age,
            available,
        };
        self.wal_append(&event).await?;
        let rs = InstructorState::new(id, name, age, available);
        self.state.insert(id, Arc::new(RwLock::new(rs)));
        self.notify.send(id, &event);
        Ok(())
    }

    pub async fn update_instructor(
        &self,
        id: Ulid,
        changes: InstructorChanges,
    ) -> Result<(), EngineError> {
        if changes.is_empty() {
            return Err(EngineError::EmptyUpdate);
        }
        if let Some(name) = &changes.name
            && name.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("instructor name too long"));
            }
        if let Some(age) = changes.age
            && age < MIN_INSTRUCTOR_AGE {
                return Err(EngineError::LimitExceeded("instructor under minimum age"));
            }
        let rs = self.get_instructor(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;

        let event = Event::InstructorUpdated {
            id,
            name: changes.name.unwrap_or_else(|| guard.name.clone()),
            age: changes.age.unwrap_or(guard.age),
        };
        self.persist_and_apply(id, &mut guard, &event).await
    }

    /// Remove an instructor. Slots vanish with the instructor; sessions
    /// are never auto-cancelled — they move to the floating pool and keep
    /// their (now dangling) references for display.
    pub async fn remove_instructor(&self, id: Ulid) -> Result<(), EngineError> {
        let rs = self.get_instructor(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write_owned().await;

        let _pool = self.floating_write.lock().await;
        if self.floating.len() + guard.sessions.len() > MAX_FLOATING_SESSIONS {
            return Err(EngineError::LimitExceeded("too many floating sessions"));
        }

        let event = Event::InstructorRemoved { id };
        self.wal_append(&event).await?;

        for slot in &guard.slots {
            self.entity_to_instructor.remove(&slot.id);
        }
        for session in guard.sessions.drain(..) {
            self.entity_to_instructor.remove(&session.id);
            self.floating.insert(session.id, session);
        }
        self.state.remove(&id);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        Ok(())
    }

    /// Flip the instructor's global flag. Returns the new value. Existing
    /// sessions are left alone — the flag only gates future bookings.
    pub async fn toggle_instructor_availability(&self, id: Ulid) -> Result<bool, EngineError> {
        let rs = self.get_instructor(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;

        let available = !guard.available;
        let event = Event::InstructorAvailabilitySet { id, available };
        self.persist_and_apply(id, &mut guard, &event).await?;
        Ok(available)
    }

    // ── Slots ────────────────────────────────────────────

    pub async fn create_slot(
        &self,
        id: Ulid,
        instructor_id: Ulid,
        pattern: &str,
        start: NaiveTime,
        end: NaiveTime,
        available: bool,
    ) -> Result<(), EngineError> {
        let pattern = parse_pattern(pattern)?;
        if start >= end {
            return Err(EngineError::InvalidRange { start, end });
        }
        if self.entity_to_instructor.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let rs = self
            .get_instructor(&instructor_id)
            .ok_or(EngineError::NotFound(instructor_id))?;
        let mut guard = rs.write().await;
        if guard.slots.len() >= MAX_SLOTS_PER_INSTRUCTOR {
            return Err(EngineError::LimitExceeded("too many slots on instructor"));
        }

        let event = Event::SlotCreated {
            slot: RecurringSlot {
                id,
                instructor_id,
                pattern,
                window: TimeRange::new(start, end),
                available,
            },
        };
        self.persist_and_apply(instructor_id, &mut guard, &event)
            .await
    }

    /// Partial slot update. Existing sessions booked through the slot are
    /// NOT revalidated — they observe the new pattern and window lazily,
    /// the next time each one is validated.
    pub async fn update_slot(&self, id: Ulid, changes: SlotChanges) -> Result<Ulid, EngineError> {
        if changes.is_empty() {
            return Err(EngineError::EmptyUpdate);
        }
        let (instructor_id, mut guard) = self.resolve_entity_write(&id).await?;
        let current = guard.slot(id).ok_or(EngineError::NotFound(id))?;

        let pattern = match &changes.pattern {
            Some(text) => parse_pattern(text)?,
            None => current.pattern.clone(),
        };
        let start = changes.start.unwrap_or(current.window.start);
        let end = changes.end.unwrap_or(current.window.end);
        if start >= end {
            return Err(EngineError::InvalidRange { start, end });
        }
        let available = changes.available.unwrap_or(current.available);

        let event = Event::SlotUpdated {
            slot: RecurringSlot {
                id,
                instructor_id,
                pattern,
                window: TimeRange::new(start, end),
                available,
            },
        };
        self.persist_and_apply(instructor_id, &mut guard, &event)
            .await?;
        Ok(instructor_id)
    }

    /// Delete a slot. Sessions referencing it stay stored with a dangling
    /// reference; queries flag them as orphaned.
    pub async fn remove_slot(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (instructor_id, mut guard) = self.resolve_entity_write(&id).await?;
        if guard.slot(id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::SlotRemoved { id, instructor_id };
        self.persist_and_apply(instructor_id, &mut guard, &event)
            .await?;
        Ok(instructor_id)
    }

    /// Flip one slot's own flag. Returns `(owner, new value)`.
    pub async fn toggle_slot_availability(&self, id: Ulid) -> Result<(Ulid, bool), EngineError> {
        let (instructor_id, mut guard) = self.resolve_entity_write(&id).await?;
        let current = guard.slot(id).ok_or(EngineError::NotFound(id))?;

        let available = !current.available;
        let event = Event::SlotAvailabilitySet {
            id,
            instructor_id,
            available,
        };
        self.persist_and_apply(instructor_id, &mut guard, &event)
            .await?;
        Ok((instructor_id, available))
    }

    // ── Sessions ─────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn book_session(
        &self,
        id: Ulid,
        student_id: Ulid,
        kind: SessionKind,
        name: String,
        instructor_id: Option<Ulid>,
        slot_id: Option<Ulid>,
        date: Option<NaiveDate>,
        start: Option<NaiveTime>,
        end: Option<NaiveTime>,
        description: Option<String>,
        level: Option<String>,
    ) -> Result<(), EngineError> {
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("session name too long"));
        }
        check_text(&description, "description too long")?;
        check_text(&level, "level too long")?;
        if self.floating.contains_key(&id) || self.entity_to_instructor.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let window = build_window(start, end)?;

        // A slot reference pins the owner even when none was given.
        let instructor_id = match (instructor_id, slot_id) {
            (Some(iid), _) => Some(iid),
            (None, Some(sid)) => {
                Some(self.instructor_for_entity(&sid).ok_or(EngineError::NotFound(sid))?)
            }
            (None, None) => None,
        };

        if kind == SessionKind::Personalized
            && (date.is_none() || window.is_none() || instructor_id.is_none()) {
                return Err(EngineError::MissingSchedule(
                    "personalized sessions require date, time and instructor",
                ));
            }

        let session = Session {
            id,
            student_id,
            kind,
            name,
            instructor_id,
            slot_id,
            date,
            window,
            description,
            level,
            completed: false,
        };

        match instructor_id {
            Some(iid) => {
                let rs = self.get_instructor(&iid).ok_or(EngineError::NotFound(iid))?;
                let mut guard = rs.write().await;
                if guard.sessions.len() >= MAX_SESSIONS_PER_INSTRUCTOR {
                    return Err(EngineError::LimitExceeded(
                        "too many sessions on instructor",
                    ));
                }

                validate_booking(&guard, &session)?;

                let event = Event::SessionBooked {
                    session: session.clone(),
                };
                self.wal_append(&event).await?;
                self.entity_to_instructor.insert(session.id, iid);
                guard.insert_session(session);
                self.notify.send(iid, &event);
                Ok(())
            }
            None => {
                let _pool = self.floating_write.lock().await;
                if self.floating.len() >= MAX_FLOATING_SESSIONS {
                    return Err(EngineError::LimitExceeded("too many floating sessions"));
                }
                let event = Event::SessionBooked {
                    session: session.clone(),
                };
                self.wal_append(&event).await?;
                self.floating.insert(session.id, session);
                self.notify.send(Ulid::nil(), &event);
                Ok(())
            }
        }
    }

    /// Partial session update. Schedule-touching changes re-run the full
    /// booking validation (against the target instructor when the session
    /// moves); cosmetic changes skip it entirely.
    pub async fn update_session(
        &self,
        id: Ulid,
        changes: SessionChanges,
    ) -> Result<(), EngineError> {
        if changes.is_empty() {
            return Err(EngineError::EmptyUpdate);
        }
        check_text(
            &changes.description.clone().flatten(),
            "description too long",
        )?;
        check_text(&changes.level.clone().flatten(), "level too long")?;
        if let Some(name) = &changes.name
            && name.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("session name too long"));
            }

        let old_instructor = self.locate_session(&id)?;
        // A session only moves when the update names a new owner; slot or
        // date changes alone never relocate it.
        let new_instructor = changes.instructor_id.unwrap_or(old_instructor);

        if new_instructor == old_instructor {
            match old_instructor {
                Some(iid) => {
                    let rs = self.get_instructor(&iid).ok_or(EngineError::NotFound(iid))?;
                    let mut guard = rs.write().await;
                    let current = guard.session(id).ok_or(EngineError::NotFound(id))?;
                    let updated = apply_session_changes(current, &changes)?;
                    if changes.touches_schedule() {
                        validate_booking(&guard, &updated)?;
                    }
                    let event = Event::SessionUpdated {
                        session: updated.clone(),
                    };
                    self.wal_append(&event).await?;
                    guard.remove_session(id);
                    guard.insert_session(updated);
                    self.notify.send(iid, &event);
                }
                None => {
                    // Floating sessions are never validated.
                    let _pool = self.floating_write.lock().await;
                    let current = self
                        .floating
                        .get(&id)
                        .map(|s| s.clone())
                        .ok_or(EngineError::NotFound(id))?;
                    let updated = apply_session_changes(&current, &changes)?;
                    let event = Event::SessionUpdated {
                        session: updated.clone(),
                    };
                    self.wal_append(&event).await?;
                    self.floating.insert(id, updated);
                    self.notify.send(Ulid::nil(), &event);
                }
            }
            return Ok(());
        }

        // Relocation: lock both owners in sorted ULID order so two
        // concurrent moves between the same pair cannot deadlock.
        let mut lock_ids: Vec<Ulid> = [old_instructor, new_instructor]
            .into_iter()
            .flatten()
            .collect();
        lock_ids.sort();
        lock_ids.dedup();

        let mut guards = Vec::with_capacity(lock_ids.len());
        for iid in &lock_ids {
            let rs = self.get_instructor(iid).ok_or(EngineError::NotFound(*iid))?;
            guards.push((*iid, rs.write_owned().await));
        }
        let _pool = self.floating_write.lock().await;

        let current = match old_instructor {
            Some(old_iid) => {
                let (_, old) = guards
                    .iter()
                    .find(|(iid, _)| *iid == old_iid)
                    .ok_or(EngineError::NotFound(old_iid))?;
                old.session(id).ok_or(EngineError::NotFound(id))?.clone()
            }
            None => self
                .floating
                .get(&id)
                .map(|s| s.clone())
                .ok_or(EngineError::NotFound(id))?,
        };
        let updated = apply_session_changes(&current, &changes)?;

        if let Some(new_iid) = new_instructor {
            let (_, target) = guards
                .iter()
                .find(|(iid, _)| *iid == new_iid)
                .ok_or(EngineError::NotFound(new_iid))?;
            if target.sessions.len() >= MAX_SESSIONS_PER_INSTRUCTOR {
                return Err(EngineError::LimitExceeded(
                    "too many sessions on instructor",
                ));
            }
            // A relocation always revalidates against the target.
            validate_booking(target, &updated)?;
        } else if self.floating.len() >= MAX_FLOATING_SESSIONS {
            return Err(EngineError::LimitExceeded("too many floating sessions"));
        }

        let event = Event::SessionUpdated {
            session: updated.clone(),
        };
        self.wal_append(&event).await?;

        match old_instructor {
            Some(old_iid) => {
                let (_, old) = guards
                    .iter_mut()
                    .find(|(iid, _)| *iid == old_iid)
                    .ok_or(EngineError::NotFound(old_iid))?;
                old.remove_session(id);
                self.entity_to_instructor.remove(&id);
            }
            None => {
                self.floating.remove(&id);
            }
        }
        match new_instructor {
            Some(new_iid) => {
                let (_, target) = guards
                    .iter_mut()
                    .find(|(iid, _)| *iid == new_iid)
                    .ok_or(EngineError::NotFound(new_iid))?;
                self.entity_to_instructor.insert(id, new_iid);
                target.insert_session(updated);
            }
            None => {
                self.floating.insert(id, updated);
            }
        }

        self.notify
            .send(old_instructor.unwrap_or_else(Ulid::nil), &event);
        self.notify
            .send(new_instructor.unwrap_or_else(Ulid::nil), &event);
        Ok(())
    }

    pub async fn cancel_session(&self, id: Ulid) -> Result<Option<Ulid>, EngineError> {
        if self.floating.contains_key(&id) {
            let _pool = self.floating_write.lock().await;
            if !self.floating.contains_key(&id) {
                return Err(EngineError::NotFound(id));
            }
            let event = Event::SessionCancelled { id };
            self.wal_append(&event).await?;
            self.floating.remove(&id);
            self.notify.send(Ulid::nil(), &event);
            return Ok(None);
        }

        let (instructor_id, mut guard) = self.resolve_entity_write(&id).await?;
        if guard.session(id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::SessionCancelled { id };
        self.wal_append(&event).await?;
        guard.remove_session(id);
        self.entity_to_instructor.remove(&id);
        self.notify.send(instructor_id, &event);
        Ok(Some(instructor_id))
    }

    /// Flip the completion flag. Returns the new value. Idempotent in the
    /// sense that two flips restore the original state.
    pub async fn toggle_session_completed(&self, id: Ulid) -> Result<bool, EngineError> {
        if self.floating.contains_key(&id) {
            let _pool = self.floating_write.lock().await;
            let current = self
                .floating
                .get(&id)
                .map(|s| s.completed)
                .ok_or(EngineError::NotFound(id))?;
            let completed = !current;
            let event = Event::SessionCompletedSet { id, completed };
            self.wal_append(&event).await?;
            if let Some(mut session) = self.floating.get_mut(&id) {
                session.completed = completed;
            }
            self.notify.send(Ulid::nil(), &event);
            return Ok(completed);
        }

        let (instructor_id, mut guard) = self.resolve_entity_write(&id).await?;
        let current = guard.session(id).ok_or(EngineError::NotFound(id))?;

        let completed = !current.completed;
        let event = Event::SessionCompletedSet { id, completed };
        self.wal_append(&event).await?;
        if let Some(session) = guard.sessions.iter_mut().find(|s| s.id == id) {
            session.completed = completed;
        }
        self.notify.send(instructor_id, &event);
        Ok(completed)
    }

    /// Where does a session live right now? `Ok(None)` means floating.
    fn locate_session(&self, id: &Ulid) -> Result<Option<Ulid>, EngineError> {
        if self.floating.contains_key(id) {
            return Ok(None);
        }
        self.instructor_for_entity(id)
            .map(Some)
            .ok_or(EngineError::NotFound(*id))
    }

    // ── WAL maintenance ──────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        for entry in self.state.iter() {
            let rs = entry.value().clone();
            let guard = rs.read().await;

            events.push(Event::InstructorRegistered {
                id: guard.id,
                name: guard.name.clone(),
                age: guard.age,
                available: guard.available,
            });
            for slot in &guard.slots {
                events.push(Event::SlotCreated { slot: slot.clone() });
            }
            for session in &guard.sessions {
                events.push(Event::SessionBooked {
                    session: session.clone(),
                });
            }
        }
        for entry in self.floating.iter() {
            events.push(Event::SessionBooked {
                session: entry.value().clone(),
            });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn apply_session_changes(
    current: &Session,
    changes: &SessionChanges,
) -> Result<Session, EngineError> {
    let start = match changes.start {
        Some(v) => v,
        None => current.window.map(|w| w.start),
    };
    let end = match changes.end {
        Some(v) => v,
        None => current.window.map(|w| w.end),
    };
    let window = match (start, end) {
        (Some(s), Some(e)) => {
            if s >= e {
                return Err(EngineError::InvalidRange { start: s, end: e });
            }
            Some(TimeRange::new(s, e))
        }
        (None, None) => None,
        _ => {
            return Err(EngineError::MissingSchedule(
                "start and end must be set together",
            ));
        }
    };

    let updated = Session {
        id: current.id,
        student_id: changes.student_id.unwrap_or(current.student_id),
        kind: changes.kind.unwrap_or(current.kind),
        name: changes.name.clone().unwrap_or_else(|| current.name.clone()),
        instructor_id: changes.instructor_id.unwrap_or(current.instructor_id),
        slot_id: changes.slot_id.unwrap_or(current.slot_id),
        date: changes.date.unwrap_or(current.date),
        window,
        description: changes
            .description
            .clone()
            .unwrap_or_else(|| current.description.clone()),
        level: changes.level.clone().unwrap_or_else(|| current.level.clone()),
        completed: current.completed,
    };

    if updated.kind == SessionKind::Personalized
        && (updated.date.is_none() || updated.window.is_none() || updated.instructor_id.is_none())
    {
        return Err(EngineError::MissingSchedule(
            "personalized sessions require date, time and instructor",
        ));
    }
    if updated.slot_id.is_some() && updated.instructor_id.is_none() {
        return Err(EngineError::MissingSchedule(
            "slot reference requires an instructor",
        ));
    }

    Ok(updated)
}
