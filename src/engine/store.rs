use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::ledger::{ResourceLedger, SharedLedger};
use super::txn::ScheduleTxn;

/// Existence lookups the conflict detector needs before it queries any ledger.
pub trait ResourceDirectory {
    fn staff_exists(&self, id: &Ulid) -> bool;
    fn subject_exists(&self, id: &Ulid) -> bool;

    fn exists(&self, key: &ResourceKey) -> bool {
        match key.kind {
            ResourceKind::Staff => self.staff_exists(&key.id),
            ResourceKind::Subject => self.subject_exists(&key.id),
        }
    }
}

pub struct ResourceEntry {
    pub name: Option<String>,
    pub ledger: SharedLedger,
}

/// The booking tables: directory, records, per-resource ledgers, references.
///
/// A booking record and its ledger entries only change through `apply_event`,
/// and only while the caller's `ScheduleTxn` holds the write locks of every
/// resource the booking referenced before and after the event.
pub struct BookingStore {
    resources: DashMap<ResourceKey, ResourceEntry>,
    bookings: DashMap<Ulid, Booking>,
    /// Booking id → ids of dependent records (payments, reports).
    references: DashMap<Ulid, Vec<Ulid>>,
}

impl Default for BookingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BookingStore {
    pub fn new() -> Self {
        Self {
            resources: DashMap::new(),
            bookings: DashMap::new(),
            references: DashMap::new(),
        }
    }

    // ── Directory ────────────────────────────────────────────

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// True if `id` is registered under any kind.
    pub fn is_registered(&self, id: &Ulid) -> bool {
        self.resources.contains_key(&ResourceKey::staff(*id))
            || self.resources.contains_key(&ResourceKey::subject(*id))
    }

    pub fn ledger(&self, key: &ResourceKey) -> Option<SharedLedger> {
        self.resources.get(key).map(|e| e.ledger.clone())
    }

    /// `(key, name, ledger)` for every resource of `kind`, sorted by id.
    pub fn resources_of(&self, kind: ResourceKind) -> Vec<(ResourceKey, Option<String>, SharedLedger)> {
        let mut out: Vec<_> = self
            .resources
            .iter()
            .filter(|e| e.key().kind == kind)
            .map(|e| (*e.key(), e.name.clone(), e.ledger.clone()))
            .collect();
        out.sort_by_key(|(k, _, _)| *k);
        out
    }

    // ── Records ──────────────────────────────────────────────

    pub fn booking(&self, id: &Ulid) -> Option<Booking> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    pub fn booking_count(&self) -> usize {
        self.bookings.len()
    }

    /// Every booking matching `pred`, ordered by start then id.
    pub fn bookings_where(&self, pred: impl Fn(&Booking) -> bool) -> Vec<Booking> {
        let mut out: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|e| pred(e.value()))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|b| (b.span.start, b.id));
        out
    }

    pub fn references(&self, booking_id: &Ulid) -> Vec<Ulid> {
        self.references
            .get(booking_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Ledger keys an event will touch, given the current state.
    pub fn event_keys(&self, event: &Event) -> Vec<ResourceKey> {
        match event {
            Event::BookingSaved { booking } => {
                let mut keys = booking.resource_keys().to_vec();
                if let Some(prev) = self.booking(&booking.id) {
                    keys.extend(prev.resource_keys());
                }
                keys
            }
            Event::BookingDeleted { id } => self
                .booking(id)
                .map(|b| b.resource_keys().to_vec())
                .unwrap_or_default(),
            Event::ResourceRegistered { .. }
            | Event::ReferenceAttached { .. }
            | Event::ReferenceDetached { .. } => Vec::new(),
        }
    }

    // ── Event application ────────────────────────────────────

    pub fn apply_event(&self, txn: &mut ScheduleTxn, event: &Event) {
        match event {
            Event::ResourceRegistered { key, name } => {
                self.resources.insert(
                    *key,
                    ResourceEntry {
                        name: name.clone(),
                        ledger: Arc::new(RwLock::new(ResourceLedger::new(*key))),
                    },
                );
            }
            Event::BookingSaved { booking } => {
                if let Some(prev) = self.bookings.insert(booking.id, booking.clone()) {
                    for key in prev.resource_keys() {
                        if let Some(ledger) = txn.ledger_mut(&key) {
                            ledger.remove(prev.id);
                        }
                    }
                }
                if booking.status.holds_slot() {
                    let slot = BookingSlot {
                        booking_id: booking.id,
                        span: booking.span,
                    };
                    for key in booking.resource_keys() {
                        if let Some(ledger) = txn.ledger_mut(&key) {
                            ledger.insert(slot);
                        }
                    }
                }
            }
            Event::BookingDeleted { id } => {
                if let Some((_, prev)) = self.bookings.remove(id) {
                    for key in prev.resource_keys() {
                        if let Some(ledger) = txn.ledger_mut(&key) {
                            ledger.remove(prev.id);
                        }
                    }
                }
                self.references.remove(id);
            }
            Event::ReferenceAttached { booking_id, ref_id } => {
                self.references.entry(*booking_id).or_default().push(*ref_id);
            }
            Event::ReferenceDetached { booking_id, ref_id } => {
                if let Some(mut refs) = self.references.get_mut(booking_id) {
                    refs.retain(|r| r != ref_id);
                }
                self.references.remove_if(booking_id, |_, refs| refs.is_empty());
            }
        }
    }

    /// Minimal event sequence that recreates the current state.
    /// Takes no ledger locks; the caller must keep commits out while it runs.
    pub fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();

        let mut keys: Vec<(ResourceKey, Option<String>)> = self
            .resources
            .iter()
            .map(|e| (*e.key(), e.name.clone()))
            .collect();
        keys.sort_by_key(|(k, _)| *k);
        for (key, name) in keys {
            events.push(Event::ResourceRegistered { key, name });
        }

        for booking in self.bookings_where(|_| true) {
            events.push(Event::BookingSaved { booking });
        }

        let mut refs: Vec<(Ulid, Vec<Ulid>)> = self
            .references
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        refs.sort_by_key(|(id, _)| *id);
        for (booking_id, ref_ids) in refs {
            for ref_id in ref_ids {
                events.push(Event::ReferenceAttached { booking_id, ref_id });
            }
        }

        events
    }
}

impl ResourceDirectory for BookingStore {
    fn staff_exists(&self, id: &Ulid) -> bool {
        self.resources.contains_key(&ResourceKey::staff(*id))
    }

    fn subject_exists(&self, id: &Ulid) -> bool {
        self.resources.contains_key(&ResourceKey::subject(*id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registered(store: &BookingStore, key: ResourceKey) {
        store.apply_event(
            &mut ScheduleTxn::empty(),
            &Event::ResourceRegistered { key, name: None },
        );
    }

    fn booking(staff_id: Ulid, subject_id: Ulid, span: Span) -> Booking {
        Booking {
            id: Ulid::new(),
            staff_id,
            subject_id,
            span,
            status: BookingStatus::Scheduled,
            kind: BookingKind::default(),
            notes: None,
        }
    }

    fn save(store: &BookingStore, b: &Booking) {
        let event = Event::BookingSaved { booking: b.clone() };
        let mut txn = ScheduleTxn::try_begin(store, store.event_keys(&event)).unwrap();
        store.apply_event(&mut txn, &event);
    }

    #[test]
    fn directory_is_kind_aware() {
        let store = BookingStore::new();
        let id = Ulid::new();
        registered(&store, ResourceKey::staff(id));
        assert!(store.staff_exists(&id));
        assert!(!store.subject_exists(&id));
        assert!(store.is_registered(&id));
        assert_eq!(store.resource_count(), 1);
    }

    #[test]
    fn saved_booking_lands_in_both_ledgers() {
        let store = BookingStore::new();
        let (s, c) = (Ulid::new(), Ulid::new());
        registered(&store, ResourceKey::staff(s));
        registered(&store, ResourceKey::subject(c));

        let b = booking(s, c, Span::new(100, 200));
        save(&store, &b);

        for key in b.resource_keys() {
            let ledger = store.ledger(&key).unwrap();
            let guard = ledger.try_read().unwrap();
            assert_eq!(guard.entries.len(), 1);
            assert_eq!(guard.entries[0].booking_id, b.id);
        }
    }

    #[test]
    fn moving_a_booking_updates_old_and_new_ledgers() {
        let store = BookingStore::new();
        let (s1, s2, c) = (Ulid::new(), Ulid::new(), Ulid::new());
        registered(&store, ResourceKey::staff(s1));
        registered(&store, ResourceKey::staff(s2));
        registered(&store, ResourceKey::subject(c));

        let mut b = booking(s1, c, Span::new(100, 200));
        save(&store, &b);
        b.staff_id = s2;
        b.span = Span::new(300, 400);
        save(&store, &b);

        let old = store.ledger(&ResourceKey::staff(s1)).unwrap();
        assert!(old.try_read().unwrap().is_empty());
        let new = store.ledger(&ResourceKey::staff(s2)).unwrap();
        assert_eq!(new.try_read().unwrap().entries[0].span, Span::new(300, 400));
        let subj = store.ledger(&ResourceKey::subject(c)).unwrap();
        assert_eq!(subj.try_read().unwrap().len(), 1);
    }

    #[test]
    fn cancelled_booking_leaves_ledgers_but_keeps_record() {
        let store = BookingStore::new();
        let (s, c) = (Ulid::new(), Ulid::new());
        registered(&store, ResourceKey::staff(s));
        registered(&store, ResourceKey::subject(c));

        let mut b = booking(s, c, Span::new(100, 200));
        save(&store, &b);
        b.status = BookingStatus::Cancelled;
        save(&store, &b);

        assert!(store.ledger(&ResourceKey::staff(s)).unwrap().try_read().unwrap().is_empty());
        assert_eq!(store.booking(&b.id).unwrap().status, BookingStatus::Cancelled);
    }

    #[test]
    fn references_attach_detach_and_delete() {
        let store = BookingStore::new();
        let (bid, r1, r2) = (Ulid::new(), Ulid::new(), Ulid::new());
        let mut txn = ScheduleTxn::empty();
        store.apply_event(&mut txn, &Event::ReferenceAttached { booking_id: bid, ref_id: r1 });
        store.apply_event(&mut txn, &Event::ReferenceAttached { booking_id: bid, ref_id: r2 });
        assert_eq!(store.references(&bid), vec![r1, r2]);

        store.apply_event(&mut txn, &Event::ReferenceDetached { booking_id: bid, ref_id: r1 });
        assert_eq!(store.references(&bid), vec![r2]);
        store.apply_event(&mut txn, &Event::ReferenceDetached { booking_id: bid, ref_id: r2 });
        assert!(store.references(&bid).is_empty());
    }

    #[test]
    fn snapshot_replays_to_same_state() {
        let store = BookingStore::new();
        let (s, c) = (Ulid::new(), Ulid::new());
        registered(&store, ResourceKey::staff(s));
        registered(&store, ResourceKey::subject(c));
        let b1 = booking(s, c, Span::new(100, 200));
        let mut b2 = booking(s, c, Span::new(200, 300));
        save(&store, &b1);
        save(&store, &b2);
        b2.status = BookingStatus::Cancelled;
        save(&store, &b2);

        let copy = BookingStore::new();
        for event in store.snapshot_events() {
            let mut txn = ScheduleTxn::try_begin(&copy, copy.event_keys(&event)).unwrap();
            copy.apply_event(&mut txn, &event);
        }

        assert_eq!(copy.booking(&b1.id), store.booking(&b1.id));
        assert_eq!(copy.booking(&b2.id), store.booking(&b2.id));
        let ledger = copy.ledger(&ResourceKey::staff(s)).unwrap();
        assert_eq!(ledger.try_read().unwrap().len(), 1);
    }
}
