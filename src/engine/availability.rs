use chrono::NaiveDate;

use crate::model::*;

// ── Availability Algorithm ────────────────────────────────────────

/// Effective availability of a slot: the instructor's global flag AND the
/// slot's own flag. Always computed on read, never stored.
pub fn effective_availability(instructor_available: bool, slot: &RecurringSlot) -> bool {
    instructor_available && slot.available
}

/// Free sub-windows of a slot on a concrete date: the slot window minus
/// the owner's booked sessions resolved onto that date.
///
/// Empty when the slot is not effectively available or the date falls
/// outside its recurrence pattern.
pub fn free_windows(
    state: &InstructorState,
    slot: &RecurringSlot,
    date: NaiveDate,
) -> Vec<TimeRange> {
    if !effective_availability(state.available, slot) {
        return Vec::new();
    }
    if !slot.pattern.matches(date) {
        return Vec::new();
    }

    let mut booked: Vec<TimeRange> = state
        .sessions
        .iter()
        .filter_map(|s| state.resolved_range(s))
        .filter(|(d, _)| *d == date)
        .map(|(_, r)| r)
        .collect();
    booked.sort_by_key(|r| r.start);
    let booked = merge_ranges(&booked);

    subtract_ranges(&[slot.window], &booked)
}

/// Merge sorted overlapping/adjacent ranges into disjoint ranges.
pub fn merge_ranges(sorted: &[TimeRange]) -> Vec<TimeRange> {
    let mut merged: Vec<TimeRange> = Vec::new();
    for &range in sorted {
        if let Some(last) = merged.last_mut()
            && range.start <= last.end {
                last.end = last.end.max(range.end);
                continue;
            }
        merged.push(range);
    }
    merged
}

/// Subtract a sorted set of ranges from a sorted base set.
pub fn subtract_ranges(base: &[TimeRange], to_remove: &[TimeRange]) -> Vec<TimeRange> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(TimeRange::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(TimeRange::new(current_start, current_end));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::WeekdayPattern;
    use chrono::NaiveTime;
    use ulid::Ulid;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn tr(h1: u32, m1: u32, h2: u32, m2: u32) -> TimeRange {
        TimeRange::new(t(h1, m1), t(h2, m2))
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn make_instructor(available: bool) -> InstructorState {
        InstructorState::new(Ulid::new(), "Ana".into(), 30, available)
    }

    fn make_slot(owner: &InstructorState, pattern: &str, window: TimeRange) -> RecurringSlot {
        RecurringSlot {
            id: Ulid::new(),
            instructor_id: owner.id,
            pattern: WeekdayPattern::parse(pattern).unwrap(),
            window,
            available: true,
        }
    }

    fn booked(owner: &InstructorState, date: NaiveDate, range: TimeRange) -> Session {
        Session {
            id: Ulid::new(),
            student_id: Ulid::new(),
            kind: SessionKind::Personalized,
            name: "treino".into(),
            instructor_id: Some(owner.id),
            slot_id: None,
            date: Some(date),
            window: Some(range),
            description: None,
            level: None,
            completed: false,
        }
    }

    // ── subtract_ranges ────────────────────────────────

    #[test]
    fn subtract_no_overlap() {
        let base = vec![tr(8, 0, 9, 0), tr(10, 0, 11, 0)];
        let remove = vec![tr(9, 0, 10, 0)];
        assert_eq!(subtract_ranges(&base, &remove), base);
    }

    #[test]
    fn subtract_full_overlap() {
        let base = vec![tr(9, 0, 10, 0)];
        let remove = vec![tr(8, 0, 11, 0)];
        assert!(subtract_ranges(&base, &remove).is_empty());
    }

    #[test]
    fn subtract_middle_punch() {
        let base = vec![tr(8, 0, 12, 0)];
        let remove = vec![tr(9, 0, 10, 0)];
        assert_eq!(
            subtract_ranges(&base, &remove),
            vec![tr(8, 0, 9, 0), tr(10, 0, 12, 0)]
        );
    }

    #[test]
    fn subtract_multiple_punches() {
        let base = vec![tr(8, 0, 18, 0)];
        let remove = vec![tr(9, 0, 10, 0), tr(12, 0, 13, 0), tr(16, 0, 17, 0)];
        assert_eq!(
            subtract_ranges(&base, &remove),
            vec![
                tr(8, 0, 9, 0),
                tr(10, 0, 12, 0),
                tr(13, 0, 16, 0),
                tr(17, 0, 18, 0),
            ]
        );
    }

    // ── merge_ranges ────────────────────────────────

    #[test]
    fn merge_overlapping_and_adjacent() {
        let ranges = vec![tr(8, 0, 10, 0), tr(9, 0, 11, 0), tr(11, 0, 12, 0), tr(14, 0, 15, 0)];
        assert_eq!(
            merge_ranges(&ranges),
            vec![tr(8, 0, 12, 0), tr(14, 0, 15, 0)]
        );
    }

    // ── effective availability ────────────────────────

    #[test]
    fn effective_needs_both_flags() {
        let owner = make_instructor(true);
        let mut slot = make_slot(&owner, "Mon-Fri", tr(8, 0, 12, 0));
        assert!(effective_availability(true, &slot));
        assert!(!effective_availability(false, &slot));
        slot.available = false;
        assert!(!effective_availability(true, &slot));
        assert!(!effective_availability(false, &slot));
    }

    // ── free_windows ─────────────────────────────────

    #[test]
    fn free_windows_subtract_bookings() {
        let mut owner = make_instructor(true);
        let slot = make_slot(&owner, "Mon-Fri", tr(8, 0, 12, 0));
        owner.upsert_slot(slot.clone());
        // 2025-06-04 is a Wednesday
        owner.insert_session(booked(&owner, d(2025, 6, 4), tr(9, 0, 10, 0)));

        let free = free_windows(&owner, &slot, d(2025, 6, 4));
        assert_eq!(free, vec![tr(8, 0, 9, 0), tr(10, 0, 12, 0)]);
    }

    #[test]
    fn free_windows_ignore_other_dates() {
        let mut owner = make_instructor(true);
        let slot = make_slot(&owner, "Mon-Fri", tr(8, 0, 12, 0));
        owner.upsert_slot(slot.clone());
        owner.insert_session(booked(&owner, d(2025, 6, 5), tr(9, 0, 10, 0)));

        let free = free_windows(&owner, &slot, d(2025, 6, 4));
        assert_eq!(free, vec![tr(8, 0, 12, 0)]);
    }

    #[test]
    fn free_windows_empty_when_instructor_off() {
        let mut owner = make_instructor(false);
        let slot = make_slot(&owner, "Mon-Fri", tr(8, 0, 12, 0));
        owner.upsert_slot(slot.clone());
        assert!(free_windows(&owner, &slot, d(2025, 6, 4)).is_empty());
    }

    #[test]
    fn free_windows_empty_outside_pattern() {
        let mut owner = make_instructor(true);
        let slot = make_slot(&owner, "Mon-Fri", tr(8, 0, 12, 0));
        owner.upsert_slot(slot.clone());
        // 2025-06-07 is a Saturday
        assert!(free_windows(&owner, &slot, d(2025, 6, 7)).is_empty());
    }
}
