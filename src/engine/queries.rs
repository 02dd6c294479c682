use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::open_slots;
use super::conflict::validate_window;
use super::error::ValidationError;
use super::store::ResourceDirectory;
use super::{BookingError, Engine};

impl Engine {
    pub fn get_booking(&self, id: &Ulid) -> Result<Booking, BookingError> {
        self.store.booking(id).ok_or(BookingError::NotFound(*id))
    }

    /// Bookings where `resource_id` is the staff member or the subject, in
    /// any status unless `status` narrows it. Ordered by start.
    pub fn list_by_resource(&self, resource_id: &Ulid, status: Option<BookingStatus>) -> Vec<Booking> {
        self.store.bookings_where(|b| {
            (b.staff_id == *resource_id || b.subject_id == *resource_id)
                && status.is_none_or(|s| b.status == s)
        })
    }

    /// Bookings across all resources in `status`, or every booking when
    /// `status` is `None`. Ordered by start.
    pub fn list_by_status(&self, status: Option<BookingStatus>) -> Vec<Booking> {
        self.store.bookings_where(|b| status.is_none_or(|s| b.status == s))
    }

    /// Every booking, any status, whose span overlaps `window`.
    pub fn list_by_time_range(&self, window: &Span) -> Result<Vec<Booking>, BookingError> {
        validate_window(window)?;
        if window.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(BookingError::LimitExceeded("query window too wide"));
        }
        Ok(self.store.bookings_where(|b| b.span.overlaps(window)))
    }

    /// The non-cancelled bookings occupying one resource, ordered by start.
    /// Read from the ledger under its read lock, so it never observes a
    /// half-applied move.
    pub async fn resource_schedule(&self, key: &ResourceKey) -> Result<Vec<Booking>, BookingError> {
        let ledger = self.store.ledger(key).ok_or(BookingError::ResourceNotFound {
            kind: key.kind,
            id: key.id,
        })?;
        let guard = ledger.read().await;
        Ok(guard
            .entries
            .iter()
            .filter_map(|slot| self.store.booking(&slot.booking_id))
            .collect())
    }

    /// Windows of at least `duration` inside `window` where both the staff
    /// member and the subject are free. Starts no earlier than now.
    pub async fn find_open_slots(
        &self,
        staff_id: Ulid,
        subject_id: Ulid,
        window: Span,
        duration: Ms,
    ) -> Result<Vec<Span>, BookingError> {
        if duration <= 0 || duration > MAX_SPAN_DURATION_MS {
            return Err(ValidationError::OutOfRange("duration").into());
        }
        validate_window(&window)?;
        if window.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(BookingError::LimitExceeded("query window too wide"));
        }
        let keys = [ResourceKey::staff(staff_id), ResourceKey::subject(subject_id)];
        for key in &keys {
            if !self.store.exists(key) {
                return Err(BookingError::ResourceNotFound {
                    kind: key.kind,
                    id: key.id,
                });
            }
        }

        let start = window.start.max(self.now_ms());
        if start >= window.end {
            return Ok(Vec::new());
        }
        let window = Span::new(start, window.end);

        let mut busy = Vec::new();
        for key in &keys {
            if let Some(ledger) = self.store.ledger(key) {
                let guard = ledger.read().await;
                busy.extend(guard.overlapping(&window).map(|slot| slot.span));
            }
        }
        Ok(open_slots(&window, &busy, duration))
    }

    pub async fn list_resources(&self, kind: ResourceKind) -> Vec<ResourceInfo> {
        let mut out = Vec::new();
        for (key, name, ledger) in self.store.resources_of(kind) {
            let booked = ledger.read().await.len();
            out.push(ResourceInfo { key, name, booked });
        }
        out
    }
}
