use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::pattern::WeekdayPattern;

/// Half-open time-of-day range `[start, end)` on a single calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "TimeRange start must be before end");
        Self { start, end }
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_range(&self, other: &TimeRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start.format("%H:%M"),
            self.end.format("%H:%M")
        )
    }
}

/// A weekly-recurring availability window owned by one instructor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringSlot {
    pub id: Ulid,
    pub instructor_id: Ulid,
    pub pattern: WeekdayPattern,
    pub window: TimeRange,
    /// Slot-level flag; the instructor's global flag can still veto it.
    pub available: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionKind {
    /// Name-only training, optionally tied to a slot.
    Simple,
    /// Date/time-bound training with an instructor.
    Personalized,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Simple => "simple",
            SessionKind::Personalized => "personalized",
        }
    }
}

impl std::str::FromStr for SessionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "simple" => Ok(SessionKind::Simple),
            "personalized" => Ok(SessionKind::Personalized),
            other => Err(format!("unknown session kind: {other}")),
        }
    }
}

/// A single training engagement for one student.
///
/// `window` is the explicit time range; when absent and a slot is
/// referenced, the slot's window is inherited at validation time. The
/// planned duration is always derived from the resolved range, never
/// stored separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Ulid,
    pub student_id: Ulid,
    pub kind: SessionKind,
    pub name: String,
    pub instructor_id: Option<Ulid>,
    pub slot_id: Option<Ulid>,
    pub date: Option<NaiveDate>,
    pub window: Option<TimeRange>,
    pub description: Option<String>,
    pub level: Option<String>,
    pub completed: bool,
}

impl Session {
    /// True if the session carries anything the booking validator cares about.
    pub fn has_schedule(&self) -> bool {
        self.slot_id.is_some() || (self.date.is_some() && self.window.is_some())
    }
}

/// Everything the engine holds for one instructor. The write lock on one
/// instance is the serialization scope for that instructor's bookings.
#[derive(Debug, Clone)]
pub struct InstructorState {
    pub id: Ulid,
    pub name: String,
    pub age: u32,
    /// Global flag; overrides every slot's own flag when false.
    pub available: bool,
    pub slots: Vec<RecurringSlot>,
    /// Sorted by (date, window start) for deterministic iteration.
    pub sessions: Vec<Session>,
}

impl InstructorState {
    pub fn new(id: Ulid, name: String, age: u32, available: bool) -> Self {
        Self {
            id,
            name,
            age,
            available,
            slots: Vec::new(),
            sessions: Vec::new(),
        }
    }

    pub fn slot(&self, id: Ulid) -> Option<&RecurringSlot> {
        self.slots.iter().find(|s| s.id == id)
    }

    pub fn upsert_slot(&mut self, slot: RecurringSlot) {
        if let Some(existing) = self.slots.iter_mut().find(|s| s.id == slot.id) {
            *existing = slot;
        } else {
            self.slots.push(slot);
        }
    }

    pub fn remove_slot(&mut self, id: Ulid) -> Option<RecurringSlot> {
        let pos = self.slots.iter().position(|s| s.id == id)?;
        Some(self.slots.remove(pos))
    }

    pub fn session(&self, id: Ulid) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    /// Insert maintaining (date, start) order.
    pub fn insert_session(&mut self, session: Session) {
        let key = (session.date, session.window.map(|w| w.start));
        let pos = self
            .sessions
            .partition_point(|s| (s.date, s.window.map(|w| w.start)) <= key);
        self.sessions.insert(pos, session);
    }

    pub fn remove_session(&mut self, id: Ulid) -> Option<Session> {
        let pos = self.sessions.iter().position(|s| s.id == id)?;
        Some(self.sessions.remove(pos))
    }

    /// Resolve the concrete `(date, range)` a session occupies, inheriting
    /// the window from the referenced slot when no explicit range is set.
    /// `None` means the session does not occupy calendar time (unscheduled,
    /// or its slot is gone and it carried no explicit range).
    pub fn resolved_range(&self, session: &Session) -> Option<(NaiveDate, TimeRange)> {
        let date = session.date?;
        let range = match session.window {
            Some(w) => w,
            None => self.slot(session.slot_id?)?.window,
        };
        Some((date, range))
    }
}

// ── WAL record format ────────────────────────────────────────────

/// The event types — flat, no nesting. Availability flips are logged as
/// absolute values so replay is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    InstructorRegistered {
        id: Ulid,
        name: String,
        age: u32,
        available: bool,
    },
    InstructorUpdated {
        id: Ulid,
        name: String,
        age: u32,
    },
    InstructorRemoved {
        id: Ulid,
    },
    InstructorAvailabilitySet {
        id: Ulid,
        available: bool,
    },
    SlotCreated {
        slot: RecurringSlot,
    },
    SlotUpdated {
        slot: RecurringSlot,
    },
    SlotRemoved {
        id: Ulid,
        instructor_id: Ulid,
    },
    SlotAvailabilitySet {
        id: Ulid,
        instructor_id: Ulid,
        available: bool,
    },
    SessionBooked {
        session: Session,
    },
    SessionUpdated {
        session: Session,
    },
    SessionCancelled {
        id: Ulid,
    },
    SessionCompletedSet {
        id: Ulid,
        completed: bool,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructorInfo {
    pub id: Ulid,
    pub name: String,
    pub age: u32,
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub id: Ulid,
    pub instructor_id: Ulid,
    pub pattern: String,
    pub window: TimeRange,
    pub available: bool,
    /// Instructor flag AND slot flag, computed at read time.
    pub effective: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: Ulid,
    pub student_id: Ulid,
    pub kind: SessionKind,
    pub name: String,
    pub instructor_id: Option<Ulid>,
    pub slot_id: Option<Ulid>,
    pub date: Option<NaiveDate>,
    pub window: Option<TimeRange>,
    pub completed: bool,
    /// The referenced slot no longer exists (orphan, display-only flag).
    pub slot_missing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    pub instructors: usize,
    pub slots: usize,
    pub available_slots: usize,
    pub sessions: usize,
    pub completed: usize,
    pub pending: usize,
}

// ── Partial-update carriers for the SQL surface ──────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstructorChanges {
    pub name: Option<String>,
    pub age: Option<u32>,
}

impl InstructorChanges {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.age.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotChanges {
    pub pattern: Option<String>,
    pub start: Option<NaiveTime>,
    pub end: Option<NaiveTime>,
    pub available: Option<bool>,
}

impl SlotChanges {
    pub fn is_empty(&self) -> bool {
        self.pattern.is_none()
            && self.start.is_none()
            && self.end.is_none()
            && self.available.is_none()
    }
}

/// Double-`Option` fields distinguish "leave alone" (outer `None`) from
/// "clear" (`Some(None)`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionChanges {
    pub student_id: Option<Ulid>,
    pub kind: Option<SessionKind>,
    pub name: Option<String>,
    pub instructor_id: Option<Option<Ulid>>,
    pub slot_id: Option<Option<Ulid>>,
    pub date: Option<Option<NaiveDate>>,
    pub start: Option<Option<NaiveTime>>,
    pub end: Option<Option<NaiveTime>>,
    pub description: Option<Option<String>>,
    pub level: Option<Option<String>>,
}

impl SessionChanges {
    pub fn is_empty(&self) -> bool {
        *self == SessionChanges::default()
    }

    /// Fields that require re-running the booking validator.
    pub fn touches_schedule(&self) -> bool {
        self.kind.is_some()
            || self.instructor_id.is_some()
            || self.slot_id.is_some()
            || self.date.is_some()
            || self.start.is_some()
            || self.end.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn tr(h1: u32, m1: u32, h2: u32, m2: u32) -> TimeRange {
        TimeRange::new(t(h1, m1), t(h2, m2))
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn range_overlap_half_open() {
        let a = tr(9, 0, 10, 0);
        let b = tr(9, 30, 10, 30);
        let c = tr(10, 0, 11, 0);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // touching, not overlapping
    }

    #[test]
    fn range_containment() {
        let outer = tr(8, 0, 12, 0);
        let inner = tr(9, 0, 10, 0);
        let partial = tr(11, 30, 12, 30);
        assert!(outer.contains_range(&inner));
        assert!(outer.contains_range(&outer));
        assert!(!outer.contains_range(&partial));
    }

    #[test]
    fn range_duration() {
        assert_eq!(tr(9, 0, 10, 30).duration_minutes(), 90);
    }

    #[test]
    fn sessions_kept_ordered() {
        let mut state = InstructorState::new(Ulid::new(), "Ana".into(), 30, true);
        let iid = state.id;
        let mk = |date, start, end| Session {
            id: Ulid::new(),
            student_id: Ulid::new(),
            kind: SessionKind::Personalized,
            name: "x".into(),
            instructor_id: Some(iid),
            slot_id: None,
            date: Some(date),
            window: Some(TimeRange::new(start, end)),
            description: None,
            level: None,
            completed: false,
        };
        state.insert_session(mk(d(2025, 6, 5), t(9, 0), t(10, 0)));
        state.insert_session(mk(d(2025, 6, 4), t(14, 0), t(15, 0)));
        state.insert_session(mk(d(2025, 6, 4), t(8, 0), t(9, 0)));

        let order: Vec<_> = state
            .sessions
            .iter()
            .map(|s| (s.date.unwrap(), s.window.unwrap().start))
            .collect();
        assert_eq!(
            order,
            vec![
                (d(2025, 6, 4), t(8, 0)),
                (d(2025, 6, 4), t(14, 0)),
                (d(2025, 6, 5), t(9, 0)),
            ]
        );
    }

    #[test]
    fn resolved_range_inherits_slot_window() {
        let mut state = InstructorState::new(Ulid::new(), "Ana".into(), 30, true);
        let slot = RecurringSlot {
            id: Ulid::new(),
            instructor_id: state.id,
            pattern: crate::pattern::WeekdayPattern::parse("Mon-Fri").unwrap(),
            window: tr(8, 0, 12, 0),
            available: true,
        };
        let slot_id = slot.id;
        state.upsert_slot(slot);

        let session = Session {
            id: Ulid::new(),
            student_id: Ulid::new(),
            kind: SessionKind::Simple,
            name: "musculação".into(),
            instructor_id: Some(state.id),
            slot_id: Some(slot_id),
            date: Some(d(2025, 6, 4)),
            window: None,
            description: None,
            level: None,
            completed: false,
        };
        assert_eq!(
            state.resolved_range(&session),
            Some((d(2025, 6, 4), tr(8, 0, 12, 0)))
        );

        // Slot gone: no explicit window means no occupied time.
        state.remove_slot(slot_id);
        assert_eq!(state.resolved_range(&session), None);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::SlotCreated {
            slot: RecurringSlot {
                id: Ulid::new(),
                instructor_id: Ulid::new(),
                pattern: crate::pattern::WeekdayPattern::parse("Mon-Fri").unwrap(),
                window: tr(8, 0, 12, 0),
                available: true,
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
