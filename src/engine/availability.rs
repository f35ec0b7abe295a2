use std::collections::BTreeMap;

use crate::model::*;

// ── Availability Algorithm ────────────────────────────────────────

/// Unit numbers in `1..=capacity` that no active reservation overlaps within
/// `requested`, ascending. Pure: the caller decides which snapshot it scans.
///
/// Reservations on units above `capacity` (left over after a pool shrank)
/// are ignored, and so are cancelled or completed ones.
pub fn available_units<'a>(
    existing: impl IntoIterator<Item = &'a Reservation>,
    requested: &Span,
    capacity: u32,
) -> Vec<u32> {
    if capacity == 0 {
        return Vec::new();
    }

    let mut by_unit: BTreeMap<u32, Vec<Span>> = BTreeMap::new();
    for r in existing {
        if !r.status.is_active() || r.unit_number == 0 || r.unit_number > capacity {
            continue;
        }
        by_unit.entry(r.unit_number).or_default().push(r.span);
    }

    (1..=capacity)
        .filter(|unit| {
            by_unit
                .get(unit)
                .is_none_or(|spans| !spans.iter().any(|s| s.overlaps(requested)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use ulid::Ulid;

    use super::*;

    fn booked(unit_number: u32, start: Minutes, end: Minutes, status: ReservationStatus) -> Reservation {
        let span = Span::new(start, end);
        Reservation {
            id: Ulid::new(),
            requester_id: "someone".into(),
            pool_id: Ulid::nil(),
            unit: UnitKind::Generic,
            unit_number,
            date: NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(),
            start: TimeOfDay::from_hm(start / 60 % 24, start % 60).unwrap(),
            end: TimeOfDay::from_hm(end / 60 % 24, end % 60).unwrap(),
            span,
            duration_hours: span.duration_hours(),
            unit_rate: 0.0,
            total_amount: 0.0,
            status,
            payment_status: PaymentStatus::Unpaid,
            notes: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn empty_pool_has_nothing() {
        let existing = [booked(1, 600, 660, ReservationStatus::Confirmed)];
        assert!(available_units(&existing, &Span::new(0, 60), 0).is_empty());
    }

    #[test]
    fn no_reservations_all_free() {
        assert_eq!(available_units([], &Span::new(600, 660), 3), vec![1, 2, 3]);
    }

    #[test]
    fn overlapping_unit_is_excluded() {
        let existing = [booked(1, 600, 720, ReservationStatus::Confirmed)];
        assert_eq!(available_units(&existing, &Span::new(660, 780), 2), vec![2]);
    }

    #[test]
    fn touching_boundaries_stay_free() {
        let existing = [
            booked(1, 540, 600, ReservationStatus::Confirmed),
            booked(1, 660, 720, ReservationStatus::Pending),
        ];
        assert_eq!(available_units(&existing, &Span::new(600, 660), 1), vec![1]);
    }

    #[test]
    fn inactive_reservations_do_not_block() {
        let existing = [
            booked(1, 600, 720, ReservationStatus::Cancelled),
            booked(2, 600, 720, ReservationStatus::Completed),
            booked(3, 600, 720, ReservationStatus::Pending),
        ];
        assert_eq!(available_units(&existing, &Span::new(630, 690), 3), vec![1, 2]);
    }

    #[test]
    fn units_above_capacity_are_ignored() {
        let existing = [booked(5, 600, 720, ReservationStatus::Confirmed)];
        assert_eq!(available_units(&existing, &Span::new(600, 720), 2), vec![1, 2]);
    }

    #[test]
    fn exhausted_pool_is_empty() {
        let existing = [
            booked(1, 600, 720, ReservationStatus::Confirmed),
            booked(2, 630, 660, ReservationStatus::Confirmed),
        ];
        assert!(available_units(&existing, &Span::new(640, 700), 2).is_empty());
    }

    #[test]
    fn post_midnight_segment() {
        // 23:00-01:00 on a late-night venue vs. a 00:30 start.
        let existing = [booked(1, 1380, 1500, ReservationStatus::Confirmed)];
        assert_eq!(available_units(&existing, &Span::new(1470, 1530), 2), vec![2]);
        assert_eq!(available_units(&existing, &Span::new(1500, 1530), 2), vec![1, 2]);
    }
}
