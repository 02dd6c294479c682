use tokio::sync::oneshot;
use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_availability, ensure_resources_exist, validate_new};
use super::lifecycle::apply_changes;
use super::{BookingError, Engine, ScheduleTxn, WalCommand};

impl Engine {
    // ── Directory ────────────────────────────────────────────

    pub async fn register_staff(&self, id: Ulid, name: Option<String>) -> Result<(), BookingError> {
        self.register(ResourceKey::staff(id), name).await
    }

    pub async fn register_subject(&self, id: Ulid, name: Option<String>) -> Result<(), BookingError> {
        self.register(ResourceKey::subject(id), name).await
    }

    async fn register(&self, key: ResourceKey, name: Option<String>) -> Result<(), BookingError> {
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN {
                return Err(BookingError::LimitExceeded("resource name too long"));
            }

        let _registering = self.registration.lock().await;
        if self.store.is_registered(&key.id) {
            return Err(BookingError::AlreadyExists(key.id));
        }
        if self.store.resource_count() >= MAX_RESOURCES_PER_TENANT {
            return Err(BookingError::LimitExceeded("too many resources"));
        }

        let event = Event::ResourceRegistered { key, name };
        self.commit(&mut ScheduleTxn::empty(), &event).await
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Validate, lock both ledgers, check availability, persist as scheduled.
    /// Notices go out before the ledger guards drop, so they follow commit
    /// order on each resource.
    pub async fn create_booking(&self, req: NewBooking) -> Result<Booking, BookingError> {
        let proposal = validate_new(&req, self.now_ms())?;
        ensure_resources_exist(&self.store, &proposal)?;

        let mut txn = ScheduleTxn::begin(&self.store, proposal.resource_keys(), self.config.lock_timeout).await?;
        for key in proposal.resource_keys() {
            if txn.ledger(&key).is_some_and(|l| l.len() >= MAX_BOOKINGS_PER_RESOURCE) {
                return Err(BookingError::LimitExceeded("too many bookings on resource"));
            }
        }
        check_availability(&txn, &proposal, None)?.into_result()?;

        let booking = Booking {
            id: Ulid::new(),
            staff_id: proposal.staff_id,
            subject_id: proposal.subject_id,
            span: proposal.span,
            status: BookingStatus::Scheduled,
            kind: req.kind.unwrap_or_default(),
            notes: req.notes,
        };
        self.commit(&mut txn, &Event::BookingSaved { booking: booking.clone() }).await?;
        self.publish(None, &booking);
        Ok(booking)
    }

    /// Merge `changes` into the stored booking. Availability is re-checked
    /// (excluding the booking itself) only when the schedule moved and the
    /// result still occupies its resources.
    pub async fn update_booking(&self, id: Ulid, changes: BookingChanges) -> Result<Booking, BookingError> {
        if changes.is_empty() {
            return self.get_booking(&id);
        }
        if changes.is_cancel_only() {
            return self.cancel_booking(id).await;
        }

        let mut extra = Vec::with_capacity(2);
        if let Some(staff) = changes.staff_id {
            extra.push(ResourceKey::staff(staff));
        }
        if let Some(subject) = changes.subject_id {
            extra.push(ResourceKey::subject(subject));
        }

        let (current, mut txn) = self.lock_booking(id, &extra).await?;
        let next = apply_changes(&current, &changes, self.now_ms()).inspect_err(|e| {
            if matches!(e, BookingError::InvalidTransition { .. } | BookingError::IntervalFrozen { .. }) {
                debug!("update of {id} rejected: {e}");
            }
        })?;
        if next == current {
            return Ok(current);
        }

        if next.schedule_differs(&current) && next.status.holds_slot() {
            for key in next.resource_keys() {
                let moved_in = !current.resource_keys().contains(&key);
                if moved_in && txn.ledger(&key).is_some_and(|l| l.len() >= MAX_BOOKINGS_PER_RESOURCE) {
                    return Err(BookingError::LimitExceeded("too many bookings on resource"));
                }
            }
            check_availability(&txn, &next.proposal(), Some(id))?.into_result()?;
        }

        self.commit(&mut txn, &Event::BookingSaved { booking: next.clone() }).await?;
        self.publish(Some(current.status), &next);
        Ok(next)
    }

    /// Idempotent: a cancelled booking is returned as is, with no write and
    /// no notice.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, BookingError> {
        let (current, mut txn) = self.lock_booking(id, &[]).await?;
        match current.status {
            BookingStatus::Cancelled => return Ok(current),
            BookingStatus::Scheduled => {}
            from => {
                debug!("cancel of {id} rejected: booking is {from}");
                return Err(BookingError::InvalidTransition {
                    id,
                    from,
                    to: BookingStatus::Cancelled,
                });
            }
        }

        let next = Booking {
            status: BookingStatus::Cancelled,
            ..current.clone()
        };
        self.commit(&mut txn, &Event::BookingSaved { booking: next.clone() }).await?;
        self.publish(Some(current.status), &next);
        Ok(next)
    }

    /// Hard delete. Refused while any dependent record references the booking.
    pub async fn delete_booking(&self, id: Ulid) -> Result<(), BookingError> {
        let (_, mut txn) = self.lock_booking(id, &[]).await?;
        let references = self.store.references(&id);
        if !references.is_empty() {
            return Err(BookingError::ReferentialIntegrity { id, references });
        }
        self.commit(&mut txn, &Event::BookingDeleted { id }).await
    }

    // ── References ───────────────────────────────────────────

    /// Record that `ref_id` (a payment, a report) depends on the booking.
    /// Attaching twice is a no-op.
    pub async fn attach_reference(&self, booking_id: Ulid, ref_id: Ulid) -> Result<(), BookingError> {
        // Same locks as delete, so a delete can't slip between check and attach.
        let (_, mut txn) = self.lock_booking(booking_id, &[]).await?;
        let references = self.store.references(&booking_id);
        if references.contains(&ref_id) {
            return Ok(());
        }
        if references.len() >= MAX_REFERENCES_PER_BOOKING {
            return Err(BookingError::LimitExceeded("too many references on booking"));
        }
        self.commit(&mut txn, &Event::ReferenceAttached { booking_id, ref_id }).await
    }

    pub async fn detach_reference(&self, booking_id: Ulid, ref_id: Ulid) -> Result<(), BookingError> {
        let (_, mut txn) = self.lock_booking(booking_id, &[]).await?;
        if !self.store.references(&booking_id).contains(&ref_id) {
            return Err(BookingError::NotFound(ref_id));
        }
        self.commit(&mut txn, &Event::ReferenceDetached { booking_id, ref_id }).await
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as the minimal event sequence for the current state.
    pub async fn compact_wal(&self) -> Result<(), BookingError> {
        let _exclusive = self.commit_gate.write().await;
        let events = self.store.snapshot_events();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| BookingError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| BookingError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| BookingError::Storage(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
