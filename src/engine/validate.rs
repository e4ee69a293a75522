use crate::model::*;

use super::EngineError;

/// Booking checks in a fixed order: availability, recurrence pattern,
/// window containment, overlap. The first failure wins, so callers see
/// a stable error for any given bad request.
///
/// Sessions carrying no schedule at all (no slot, no date/time) skip
/// every check. The overlap scan excludes `proposal.id` itself so the
/// same function serves both create and reschedule.
pub fn validate_booking(state: &InstructorState, proposal: &Session) -> Result<(), EngineError> {
    if !proposal.has_schedule() {
        return Ok(());
    }

    let slot = match proposal.slot_id {
        Some(sid) => Some(state.slot(sid).ok_or(EngineError::NotFound(sid))?),
        None => None,
    };

    // 1. Availability: the instructor flag vetoes everything.
    if !state.available {
        return Err(EngineError::SlotUnavailable(
            slot.map(|s| s.id).unwrap_or(state.id),
        ));
    }
    if let Some(slot) = slot
        && !slot.available {
            return Err(EngineError::SlotUnavailable(slot.id));
        }

    // 2. The date must fall on one of the slot's weekdays.
    if let Some(slot) = slot
        && let Some(date) = proposal.date
        && !slot.pattern.matches(date) {
            return Err(EngineError::DateNotInPattern {
                slot_id: slot.id,
                date,
            });
        }

    // 3. An explicit time must sit inside the slot window.
    if let Some(slot) = slot
        && let Some(window) = proposal.window
        && !slot.window.contains_range(&window) {
            return Err(EngineError::TimeOutsideWindow {
                requested: window,
                window: slot.window,
            });
        }

    // 4. No overlap with any other scheduled session on the same date.
    if let Some((date, range)) = state.resolved_range(proposal) {
        for other in &state.sessions {
            if other.id == proposal.id {
                continue;
            }
            if let Some((other_date, other_range)) = state.resolved_range(other)
                && other_date == date
                && other_range.overlaps(&range) {
                    return Err(EngineError::BookingConflict {
                        session_id: other.id,
                        range: other_range,
                    });
                }
        }
    }

    Ok(())
}
