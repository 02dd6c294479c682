use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Span of `duration` ms beginning at `start`.
    pub fn with_duration(start: Ms, duration: Ms) -> Self {
        Self::new(start, start + duration)
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

// ── Resources ────────────────────────────────────────────────────

/// The two kinds of resource whose time cannot be double-booked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Staff,
    /// A case / client.
    Subject,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Staff => "staff",
            ResourceKind::Subject => "subject",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one ledger. The derived `Ord` is the global lock order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub id: Ulid,
}

impl ResourceKey {
    pub fn staff(id: Ulid) -> Self {
        Self { kind: ResourceKind::Staff, id }
    }

    pub fn subject(id: Ulid) -> Self {
        Self { kind: ResourceKind::Subject, id }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Scheduled,
    Completed,
    Cancelled,
    NoShow,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Scheduled => "scheduled",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::NoShow => "no_show",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "scheduled" => Some(BookingStatus::Scheduled),
            "completed" => Some(BookingStatus::Completed),
            "cancelled" | "canceled" => Some(BookingStatus::Cancelled),
            "no_show" | "noshow" | "no-show" => Some(BookingStatus::NoShow),
            _ => None,
        }
    }

    /// Whether a booking in this status occupies its resources' ledgers.
    pub fn holds_slot(&self) -> bool {
        !matches!(self, BookingStatus::Cancelled)
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BookingKind {
    #[default]
    Consultation,
    Assessment,
    Therapy,
    FollowUp,
    Other,
}

impl BookingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingKind::Consultation => "consultation",
            BookingKind::Assessment => "assessment",
            BookingKind::Therapy => "therapy",
            BookingKind::FollowUp => "follow_up",
            BookingKind::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "consultation" => Some(BookingKind::Consultation),
            "assessment" => Some(BookingKind::Assessment),
            "therapy" => Some(BookingKind::Therapy),
            "follow_up" | "followup" | "follow-up" => Some(BookingKind::FollowUp),
            "other" => Some(BookingKind::Other),
            _ => None,
        }
    }
}

impl std::fmt::Display for BookingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An appointment between one staff member and one subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub staff_id: Ulid,
    pub subject_id: Ulid,
    pub span: Span,
    pub status: BookingStatus,
    pub kind: BookingKind,
    pub notes: Option<String>,
}

impl Booking {
    /// Ledgers this booking lives in, in lock order.
    pub fn resource_keys(&self) -> [ResourceKey; 2] {
        [ResourceKey::staff(self.staff_id), ResourceKey::subject(self.subject_id)]
    }

    pub fn proposal(&self) -> Proposal {
        Proposal {
            staff_id: self.staff_id,
            subject_id: self.subject_id,
            span: self.span,
        }
    }

    /// True if span or either resource differs from `other`.
    pub fn schedule_differs(&self, other: &Booking) -> bool {
        self.span != other.span
            || self.staff_id != other.staff_id
            || self.subject_id != other.subject_id
    }
}

/// The slice of a booking the conflict detector looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proposal {
    pub staff_id: Ulid,
    pub subject_id: Ulid,
    pub span: Span,
}

impl Proposal {
    pub fn resource_keys(&self) -> [ResourceKey; 2] {
        [ResourceKey::staff(self.staff_id), ResourceKey::subject(self.subject_id)]
    }
}

/// Input to `create_booking`. Every schedule field is optional so that missing
/// input surfaces as a validation error rather than a parse failure upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewBooking {
    pub staff_id: Option<Ulid>,
    pub subject_id: Option<Ulid>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub kind: Option<BookingKind>,
    pub notes: Option<String>,
}

impl NewBooking {
    pub fn new(staff_id: Ulid, subject_id: Ulid, span: Span) -> Self {
        Self {
            staff_id: Some(staff_id),
            subject_id: Some(subject_id),
            start: Some(span.start),
            end: Some(span.end),
            kind: None,
            notes: None,
        }
    }
}

/// Input to `update_booking`. `None` leaves the stored field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingChanges {
    pub staff_id: Option<Ulid>,
    pub subject_id: Option<Ulid>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub status: Option<BookingStatus>,
    pub kind: Option<BookingKind>,
    pub notes: Option<String>,
}

impl BookingChanges {
    pub fn is_empty(&self) -> bool {
        *self == BookingChanges::default()
    }

    /// A bare `status = cancelled` request.
    pub fn is_cancel_only(&self) -> bool {
        *self
            == BookingChanges {
                status: Some(BookingStatus::Cancelled),
                ..Default::default()
            }
    }
}

/// The WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceRegistered {
        key: ResourceKey,
        name: Option<String>,
    },
    /// Full state of a booking after create or update (upsert).
    BookingSaved {
        booking: Booking,
    },
    BookingDeleted {
        id: Ulid,
    },
    ReferenceAttached {
        booking_id: Ulid,
        ref_id: Ulid,
    },
    ReferenceDetached {
        booking_id: Ulid,
        ref_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub key: ResourceKey,
    pub name: Option<String>,
    /// Number of non-cancelled bookings in the ledger.
    pub booked: usize,
}

/// A booked interval as seen from one ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingSlot {
    pub booking_id: Ulid,
    pub span: Span,
}

/// Domain event emitted after a committed create, update or cancel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingNotice {
    pub booking_id: Ulid,
    pub staff_id: Ulid,
    pub subject_id: Ulid,
    /// `None` on create.
    pub previous_status: Option<BookingStatus>,
    pub new_status: BookingStatus,
    pub span: Span,
}
