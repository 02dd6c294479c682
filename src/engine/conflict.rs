use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::error::{span_of, ResourceConflict, ValidationError};
use super::store::ResourceDirectory;
use super::txn::ScheduleTxn;
use super::BookingError;

/// Outcome of checking one proposal against both resources' ledgers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConflictResult {
    /// One entry per busy resource; empty when the proposal fits.
    pub conflicts: Vec<ResourceConflict>,
}

impl ConflictResult {
    pub fn is_available(&self) -> bool {
        self.conflicts.is_empty()
    }

    pub fn into_result(self) -> Result<(), BookingError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(BookingError::Conflict(self.conflicts))
        }
    }
}

/// Bounds check only. Must pass before any arithmetic on the span.
pub(crate) fn validate_window(span: &Span) -> Result<(), ValidationError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(ValidationError::OutOfRange("timestamp"));
    }
    Ok(())
}

pub(crate) fn validate_span(span: &Span) -> Result<(), ValidationError> {
    validate_window(span)?;
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(ValidationError::OutOfRange("appointment duration"));
    }
    Ok(())
}

pub(crate) fn validate_notes(notes: &Option<String>) -> Result<(), ValidationError> {
    if let Some(n) = notes
        && n.len() > MAX_NOTES_LEN {
            return Err(ValidationError::TooLong("notes"));
        }
    Ok(())
}

/// Structural checks for a schedule about to be booked. `now` gates past dates.
pub(crate) fn validate_proposal(proposal: &Proposal, now: Ms) -> Result<(), ValidationError> {
    validate_span(&proposal.span)?;
    if proposal.staff_id == proposal.subject_id {
        return Err(ValidationError::SameResource(proposal.staff_id));
    }
    if proposal.span.start < now {
        return Err(ValidationError::InPast {
            start: proposal.span.start,
            now,
        });
    }
    Ok(())
}

/// Turn a create request into a proposal, or say which field is wrong.
pub(crate) fn validate_new(req: &NewBooking, now: Ms) -> Result<Proposal, ValidationError> {
    let start = req.start.ok_or(ValidationError::Missing("start"))?;
    let end = req.end.ok_or(ValidationError::Missing("end"))?;
    let staff_id = req.staff_id.ok_or(ValidationError::Missing("staff_id"))?;
    let subject_id = req.subject_id.ok_or(ValidationError::Missing("subject_id"))?;
    let proposal = Proposal {
        staff_id,
        subject_id,
        span: span_of(start, end)?,
    };
    validate_proposal(&proposal, now)?;
    validate_notes(&req.notes)?;
    Ok(proposal)
}

/// Both resources must be in the directory before any ledger is queried.
pub(crate) fn ensure_resources_exist(
    directory: &impl ResourceDirectory,
    proposal: &Proposal,
) -> Result<(), BookingError> {
    for key in proposal.resource_keys() {
        if !directory.exists(&key) {
            return Err(BookingError::ResourceNotFound {
                kind: key.kind,
                id: key.id,
            });
        }
    }
    Ok(())
}

/// Query the staff ledger and the subject ledger independently.
///
/// `exclude` is the booking being updated, so it never collides with its own
/// previous reservation. The caller's transaction must hold both ledgers.
pub fn check_availability(
    txn: &ScheduleTxn,
    proposal: &Proposal,
    exclude: Option<Ulid>,
) -> Result<ConflictResult, BookingError> {
    let mut result = ConflictResult::default();
    for key in proposal.resource_keys() {
        let ledger = txn.ledger(&key).ok_or(BookingError::ResourceNotFound {
            kind: key.kind,
            id: key.id,
        })?;
        let bookings = ledger.find_overlapping(&proposal.span, exclude);
        if !bookings.is_empty() {
            debug!(resource = %key, span = %proposal.span, busy = bookings.len(), "resource busy");
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL, "resource" => key.kind.as_str())
                .increment(1);
            result.conflicts.push(ResourceConflict { resource: key, bookings });
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: Ms = 1_000_000;

    fn request(start: Option<Ms>, end: Option<Ms>) -> NewBooking {
        NewBooking {
            staff_id: Some(Ulid::new()),
            subject_id: Some(Ulid::new()),
            start,
            end,
            kind: None,
            notes: None,
        }
    }

    #[test]
    fn missing_fields_are_named() {
        assert_eq!(
            validate_new(&request(None, Some(NOW + 10)), NOW),
            Err(ValidationError::Missing("start"))
        );
        assert_eq!(
            validate_new(&request(Some(NOW), None), NOW),
            Err(ValidationError::Missing("end"))
        );
        let mut req = request(Some(NOW), Some(NOW + 10));
        req.staff_id = None;
        assert_eq!(validate_new(&req, NOW), Err(ValidationError::Missing("staff_id")));
        let mut req = request(Some(NOW), Some(NOW + 10));
        req.subject_id = None;
        assert_eq!(validate_new(&req, NOW), Err(ValidationError::Missing("subject_id")));
    }

    #[test]
    fn degenerate_and_inverted_spans_rejected() {
        assert!(matches!(
            validate_new(&request(Some(NOW + 5), Some(NOW + 5)), NOW),
            Err(ValidationError::EmptySpan { .. })
        ));
        assert!(matches!(
            validate_new(&request(Some(NOW + 9), Some(NOW + 5)), NOW),
            Err(ValidationError::EmptySpan { .. })
        ));
    }

    #[test]
    fn past_start_rejected_but_now_accepted() {
        assert_eq!(
            validate_new(&request(Some(NOW - 1), Some(NOW + 10)), NOW),
            Err(ValidationError::InPast { start: NOW - 1, now: NOW })
        );
        assert!(validate_new(&request(Some(NOW), Some(NOW + 10)), NOW).is_ok());
    }

    #[test]
    fn same_staff_and_subject_rejected() {
        let id = Ulid::new();
        let mut req = request(Some(NOW), Some(NOW + 10));
        req.staff_id = Some(id);
        req.subject_id = Some(id);
        assert_eq!(validate_new(&req, NOW), Err(ValidationError::SameResource(id)));
    }

    #[test]
    fn overlong_appointment_rejected() {
        let req = request(Some(NOW), Some(NOW + MAX_SPAN_DURATION_MS + 1));
        assert_eq!(
            validate_new(&req, NOW),
            Err(ValidationError::OutOfRange("appointment duration"))
        );
    }

    #[test]
    fn notes_length_bounded() {
        let mut req = request(Some(NOW), Some(NOW + 10));
        req.notes = Some("x".repeat(MAX_NOTES_LEN + 1));
        assert_eq!(validate_new(&req, NOW), Err(ValidationError::TooLong("notes")));
    }

    #[test]
    fn empty_result_is_available() {
        let r = ConflictResult::default();
        assert!(r.is_available());
        assert!(r.into_result().is_ok());
    }
}
