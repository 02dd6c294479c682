use crate::model::*;

use super::conflict::{validate_notes, validate_span};
use super::error::{span_of, ValidationError};
use super::BookingError;

/// Scheduled is the only non-terminal status; every transition leaves it.
pub fn can_transition(from: BookingStatus, to: BookingStatus) -> bool {
    from == to || from == BookingStatus::Scheduled
}

pub fn is_terminal(status: BookingStatus) -> bool {
    status != BookingStatus::Scheduled
}

/// Merge `changes` into `current` and enforce the status machine.
///
/// Returns the booking as it would be stored. Availability is not checked
/// here; the caller re-checks when `schedule_differs` and the result still
/// holds its slot.
pub(crate) fn apply_changes(
    current: &Booking,
    changes: &BookingChanges,
    now: Ms,
) -> Result<Booking, BookingError> {
    let status = changes.status.unwrap_or(current.status);
    if !can_transition(current.status, status) {
        return Err(BookingError::InvalidTransition {
            id: current.id,
            from: current.status,
            to: status,
        });
    }

    let start = changes.start.unwrap_or(current.span.start);
    let end = changes.end.unwrap_or(current.span.end);
    let next = Booking {
        id: current.id,
        staff_id: changes.staff_id.unwrap_or(current.staff_id),
        subject_id: changes.subject_id.unwrap_or(current.subject_id),
        span: span_of(start, end)?,
        status,
        kind: changes.kind.unwrap_or(current.kind),
        notes: changes.notes.clone().or_else(|| current.notes.clone()),
    };

    if next.schedule_differs(current) {
        if current.status != BookingStatus::Scheduled {
            return Err(BookingError::IntervalFrozen {
                id: current.id,
                status: current.status,
            });
        }
        validate_span(&next.span)?;
        if next.staff_id == next.subject_id {
            return Err(ValidationError::SameResource(next.staff_id).into());
        }
        if next.span != current.span && next.span.start < now {
            return Err(ValidationError::InPast {
                start: next.span.start,
                now,
            }
            .into());
        }
    }
    validate_notes(&next.notes)?;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    const NOW: Ms = 10_000;

    fn scheduled() -> Booking {
        Booking {
            id: Ulid::new(),
            staff_id: Ulid::new(),
            subject_id: Ulid::new(),
            span: Span::new(20_000, 30_000),
            status: BookingStatus::Scheduled,
            kind: BookingKind::Consultation,
            notes: None,
        }
    }

    fn with_status(status: BookingStatus) -> BookingChanges {
        BookingChanges {
            status: Some(status),
            ..Default::default()
        }
    }

    #[test]
    fn transitions_out_of_scheduled_only() {
        use BookingStatus::*;
        for to in [Scheduled, Completed, Cancelled, NoShow] {
            assert!(can_transition(Scheduled, to));
        }
        for from in [Completed, Cancelled, NoShow] {
            assert!(is_terminal(from));
            assert!(can_transition(from, from));
            assert!(!can_transition(from, Scheduled));
        }
        assert!(!can_transition(Completed, Cancelled));
        assert!(!can_transition(NoShow, Completed));
    }

    #[test]
    fn terminal_status_rejects_transition() {
        let mut b = scheduled();
        b.status = BookingStatus::Completed;
        let err = apply_changes(&b, &with_status(BookingStatus::Cancelled), NOW).unwrap_err();
        assert!(matches!(
            err,
            BookingError::InvalidTransition {
                from: BookingStatus::Completed,
                to: BookingStatus::Cancelled,
                ..
            }
        ));
    }

    #[test]
    fn same_status_is_a_noop() {
        let mut b = scheduled();
        b.status = BookingStatus::NoShow;
        let next = apply_changes(&b, &with_status(BookingStatus::NoShow), NOW).unwrap();
        assert_eq!(next, b);
    }

    #[test]
    fn completed_booking_interval_is_frozen() {
        let mut b = scheduled();
        b.status = BookingStatus::Completed;
        let changes = BookingChanges {
            end: Some(40_000),
            ..Default::default()
        };
        assert!(matches!(
            apply_changes(&b, &changes, NOW),
            Err(BookingError::IntervalFrozen { status: BookingStatus::Completed, .. })
        ));
    }

    #[test]
    fn frozen_booking_still_takes_notes() {
        let mut b = scheduled();
        b.status = BookingStatus::Cancelled;
        let changes = BookingChanges {
            notes: Some("client called".into()),
            ..Default::default()
        };
        let next = apply_changes(&b, &changes, NOW).unwrap();
        assert_eq!(next.notes.as_deref(), Some("client called"));
        assert_eq!(next.status, BookingStatus::Cancelled);
    }

    #[test]
    fn restating_the_same_interval_is_not_a_change() {
        let mut b = scheduled();
        b.status = BookingStatus::Completed;
        let changes = BookingChanges {
            start: Some(b.span.start),
            end: Some(b.span.end),
            ..Default::default()
        };
        assert!(apply_changes(&b, &changes, NOW).is_ok());
    }

    #[test]
    fn moving_into_the_past_rejected() {
        let b = scheduled();
        let changes = BookingChanges {
            start: Some(NOW - 1),
            ..Default::default()
        };
        assert!(matches!(
            apply_changes(&b, &changes, NOW),
            Err(BookingError::Validation(ValidationError::InPast { .. }))
        ));
    }

    #[test]
    fn past_booking_can_change_staff_without_moving() {
        let b = scheduled();
        let changes = BookingChanges {
            staff_id: Some(Ulid::new()),
            ..Default::default()
        };
        assert!(apply_changes(&b, &changes, 25_000).is_ok());
    }

    #[test]
    fn partial_span_update_must_stay_nonempty() {
        let b = scheduled();
        let changes = BookingChanges {
            end: Some(b.span.start),
            ..Default::default()
        };
        assert!(matches!(
            apply_changes(&b, &changes, NOW),
            Err(BookingError::Validation(ValidationError::EmptySpan { .. }))
        ));
    }
}
