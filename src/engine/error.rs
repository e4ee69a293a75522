use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::TimeRange;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    InvalidPattern(String),
    InvalidRange {
        start: chrono::NaiveTime,
        end: chrono::NaiveTime,
    },
    SlotUnavailable(Ulid),
    DateNotInPattern {
        slot_id: Ulid,
        date: NaiveDate,
    },
    TimeOutsideWindow {
        requested: TimeRange,
        window: TimeRange,
    },
    BookingConflict {
        session_id: Ulid,
        range: TimeRange,
    },
    MissingSchedule(&'static str),
    EmptyUpdate,
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidPattern(p) => write!(f, "invalid weekday pattern: {p}"),
            EngineError::InvalidRange { start, end } => {
                write!(
                    f,
                    "invalid time range: [{}, {})",
                    start.format("%H:%M"),
                    end.format("%H:%M")
                )
            }
            EngineError::SlotUnavailable(id) => write!(f, "unavailable: {id}"),
            EngineError::DateNotInPattern { slot_id, date } => {
                write!(f, "date {date} not in recurrence pattern of slot {slot_id}")
            }
            EngineError::TimeOutsideWindow { requested, window } => {
                write!(f, "requested time {requested} outside slot window {window}")
            }
            EngineError::BookingConflict { session_id, range } => {
                write!(f, "conflicts with session {session_id} at {range}")
            }
            EngineError::MissingSchedule(what) => write!(f, "incomplete schedule: {what}"),
            EngineError::EmptyUpdate => write!(f, "empty update"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
