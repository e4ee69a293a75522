use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::availability::{effective_availability, free_windows};
use super::{Engine, EngineError};

impl Engine {
    pub async fn list_instructors(&self) -> Vec<InstructorInfo> {
        let mut out = Vec::new();
        for entry in self.state.iter() {
            let rs = entry.value().clone();
            let guard = rs.read().await;
            out.push(InstructorInfo {
                id: guard.id,
                name: guard.name.clone(),
                age: guard.age,
                available: guard.available,
            });
        }
        out
    }

    /// List slots, optionally for one instructor. `effective` is computed
    /// here from both flags and is never stored.
    pub async fn list_slots(
        &self,
        instructor_id: Option<Ulid>,
    ) -> Result<Vec<SlotInfo>, EngineError> {
        let mut out = Vec::new();
        match instructor_id {
            Some(iid) => {
                let rs = match self.get_instructor(&iid) {
                    Some(rs) => rs,
                    None => return Ok(out),
                };
                let guard = rs.read().await;
                collect_slots(&guard, &mut out);
            }
            None => {
                for entry in self.state.iter() {
                    let rs = entry.value().clone();
                    let guard = rs.read().await;
                    collect_slots(&guard, &mut out);
                }
            }
        }
        Ok(out)
    }

    /// List sessions, instructor-owned first, then floating. Orphans —
    /// sessions whose slot no longer exists — are flagged, never hidden.
    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>, EngineError> {
        let mut out = Vec::new();
        for entry in self.state.iter() {
            let rs = entry.value().clone();
            let guard = rs.read().await;
            for session in &guard.sessions {
                let slot_missing = session
                    .slot_id
                    .is_some_and(|sid| guard.slot(sid).is_none());
                out.push(session_info(session, slot_missing));
            }
        }
        for entry in self.floating.iter() {
            let session = entry.value();
            // A floating session's slot reference always dangles: the
            // owning instructor (and its slots) are gone.
            out.push(session_info(session, session.slot_id.is_some()));
        }
        Ok(out)
    }

    /// Dashboard counts, computed fresh on every call.
    pub async fn stats(&self) -> Result<Stats, EngineError> {
        let mut stats = Stats::default();
        for entry in self.state.iter() {
            let rs = entry.value().clone();
            let guard = rs.read().await;
            stats.instructors += 1;
            stats.slots += guard.slots.len();
            stats.available_slots += guard
                .slots
                .iter()
                .filter(|s| effective_availability(guard.available, s))
                .count();
            stats.sessions += guard.sessions.len();
            stats.completed += guard.sessions.iter().filter(|s| s.completed).count();
        }
        stats.sessions += self.floating.len();
        stats.completed += self.floating.iter().filter(|e| e.value().completed).count();
        stats.pending = stats.sessions - stats.completed;
        Ok(stats)
    }

    /// Free sub-windows of one slot on a concrete date.
    pub async fn slot_free_windows(
        &self,
        slot_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<TimeRange>, EngineError> {
        let instructor_id = self
            .instructor_for_entity(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let rs = self
            .get_instructor(&instructor_id)
            .ok_or(EngineError::NotFound(instructor_id))?;
        let guard = rs.read().await;
        let slot = guard.slot(slot_id).ok_or(EngineError::NotFound(slot_id))?;
        Ok(free_windows(&guard, slot, date))
    }

    /// Instructors who could take a booking at `date` + `range`: globally
    /// available, with an effective slot whose pattern matches the date,
    /// whose window contains the range, and with no clashing session.
    pub async fn available_instructors(
        &self,
        date: NaiveDate,
        range: TimeRange,
    ) -> Result<Vec<InstructorInfo>, EngineError> {
        let mut out = Vec::new();
        for entry in self.state.iter() {
            let rs = entry.value().clone();
            let guard = rs.read().await;
            if !guard.available {
                continue;
            }
            let fits = guard.slots.iter().any(|slot| {
                effective_availability(guard.available, slot)
                    && slot.pattern.matches(date)
                    && slot.window.contains_range(&range)
            });
            if !fits {
                continue;
            }
            let clashes = guard.sessions.iter().any(|s| {
                guard
                    .resolved_range(s)
                    .is_some_and(|(d, r)| d == date && r.overlaps(&range))
            });
            if clashes {
                continue;
            }
            out.push(InstructorInfo {
                id: guard.id,
                name: guard.name.clone(),
                age: guard.age,
                available: guard.available,
            });
        }
        Ok(out)
    }
}

fn collect_slots(guard: &InstructorState, out: &mut Vec<SlotInfo>) {
    for slot in &guard.slots {
        out.push(SlotInfo {
            id: slot.id,
            instructor_id: slot.instructor_id,
            pattern: slot.pattern.as_str().to_string(),
            window: slot.window,
            available: slot.available,
            effective: effective_availability(guard.available, slot),
        });
    }
}

fn session_info(session: &Session, slot_missing: bool) -> SessionInfo {
    SessionInfo {
        id: session.id,
        student_id: session.student_id,
        kind: session.kind,
        name: session.name.clone(),
        instructor_id: session.instructor_id,
        slot_id: session.slot_id,
        date: session.date,
        window: session.window,
        completed: session.completed,
        slot_missing,
    }
}
