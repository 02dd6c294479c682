use thiserror::Error;
use ulid::Ulid;

use crate::model::{BookingSlot, BookingStatus, Ms, ResourceKey, ResourceKind, Span};

/// Malformed input. Always the caller's to fix; never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing field: {0}")]
    Missing(&'static str),
    #[error("empty interval: start {start} is not before end {end}")]
    EmptySpan { start: Ms, end: Ms },
    #[error("appointment cannot start in the past: {start} < now {now}")]
    InPast { start: Ms, now: Ms },
    #[error("staff and subject must differ: {0}")]
    SameResource(Ulid),
    #[error("{0} too long")]
    TooLong(&'static str),
    #[error("{0} out of range")]
    OutOfRange(&'static str),
}

/// One busy resource and the bookings that make it busy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceConflict {
    pub resource: ResourceKey,
    pub bookings: Vec<BookingSlot>,
}

impl std::fmt::Display for ResourceConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} busy with", self.resource)?;
        for (i, slot) in self.bookings.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            write!(f, "{sep}{} {}", slot.booking_id, slot.span)?;
        }
        Ok(())
    }
}

fn describe_conflicts(conflicts: &[ResourceConflict]) -> String {
    conflicts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum BookingError {
    #[error("invalid booking: {0}")]
    Validation(#[from] ValidationError),
    #[error("{kind} not found: {id}")]
    ResourceNotFound { kind: ResourceKind, id: Ulid },
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("conflict: {}", describe_conflicts(.0))]
    Conflict(Vec<ResourceConflict>),
    #[error("booking {id}: cannot go from {from} to {to}")]
    InvalidTransition {
        id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
    },
    #[error("booking {id} is {status}; its interval and resources can no longer change")]
    IntervalFrozen { id: Ulid, status: BookingStatus },
    #[error("cannot delete booking {id}: referenced by {references:?}")]
    ReferentialIntegrity { id: Ulid, references: Vec<Ulid> },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("timed out: {0}")]
    Timeout(&'static str),
    #[error("storage error: {0}")]
    Storage(String),
}

impl BookingError {
    /// Transient failures; safe to retry with identical input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BookingError::Timeout(_) | BookingError::Storage(_))
    }

    /// The busy resources, if this is a conflict.
    pub fn conflicts(&self) -> Option<&[ResourceConflict]> {
        match self {
            BookingError::Conflict(c) => Some(c),
            _ => None,
        }
    }
}

pub(crate) fn span_of(start: Ms, end: Ms) -> Result<Span, ValidationError> {
    if start >= end {
        return Err(ValidationError::EmptySpan { start, end });
    }
    Ok(Span::new(start, end))
}
