use std::sync::Arc;

use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

pub type SharedLedger = Arc<RwLock<ResourceLedger>>;

/// Booked time of one resource: every non-cancelled booking that references it.
#[derive(Debug, Clone)]
pub struct ResourceLedger {
    pub key: ResourceKey,
    /// Sorted by `span.start`.
    pub entries: Vec<BookingSlot>,
}

impl ResourceLedger {
    pub fn new(key: ResourceKey) -> Self {
        Self {
            key,
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert(&mut self, slot: BookingSlot) {
        let pos = self
            .entries
            .binary_search_by_key(&slot.span.start, |e| e.span.start)
            .unwrap_or_else(|e| e);
        self.entries.insert(pos, slot);
    }

    pub fn remove(&mut self, booking_id: Ulid) -> Option<BookingSlot> {
        let pos = self.entries.iter().position(|e| e.booking_id == booking_id)?;
        Some(self.entries.remove(pos))
    }

    /// Entries whose span overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &BookingSlot> {
        let right_bound = self.entries.partition_point(|e| e.span.start < query.end);
        self.entries[..right_bound]
            .iter()
            .filter(move |e| e.span.end > query.start)
    }

    /// The overlap query the conflict detector is built on.
    pub fn find_overlapping(&self, query: &Span, exclude: Option<Ulid>) -> Vec<BookingSlot> {
        self.overlapping(query)
            .filter(|e| Some(e.booking_id) != exclude)
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> ResourceLedger {
        ResourceLedger::new(ResourceKey::staff(Ulid::new()))
    }

    fn slot(start: Ms, end: Ms) -> BookingSlot {
        BookingSlot {
            booking_id: Ulid::new(),
            span: Span::new(start, end),
        }
    }

    #[test]
    fn insert_keeps_start_order() {
        let mut l = ledger();
        l.insert(slot(300, 400));
        l.insert(slot(100, 200));
        l.insert(slot(200, 300));
        let starts: Vec<Ms> = l.entries.iter().map(|e| e.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn remove_middle_preserves_order() {
        let mut l = ledger();
        let slots: Vec<_> = (0..3).map(|i| slot(i * 100, i * 100 + 50)).collect();
        for s in &slots {
            l.insert(*s);
        }
        assert_eq!(l.remove(slots[1].booking_id), Some(slots[1]));
        assert_eq!(l.len(), 2);
        assert_eq!(l.entries[0], slots[0]);
        assert_eq!(l.entries[1], slots[2]);
    }

    #[test]
    fn remove_nonexistent_returns_none() {
        let mut l = ledger();
        l.insert(slot(100, 200));
        assert!(l.remove(Ulid::new()).is_none());
        assert_eq!(l.len(), 1);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut l = ledger();
        l.insert(slot(100, 200));
        l.insert(slot(450, 600));
        l.insert(slot(1000, 1100));
        let hits: Vec<_> = l.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn touching_endpoints_do_not_overlap() {
        let mut l = ledger();
        l.insert(slot(100, 200));
        assert!(l.find_overlapping(&Span::new(200, 300), None).is_empty());
        assert!(l.find_overlapping(&Span::new(0, 100), None).is_empty());
    }

    #[test]
    fn single_ms_overlap_counts() {
        let mut l = ledger();
        l.insert(slot(100, 201));
        assert_eq!(l.find_overlapping(&Span::new(200, 300), None).len(), 1);
    }

    #[test]
    fn long_entry_spanning_query_is_found() {
        let mut l = ledger();
        l.insert(slot(0, 10_000));
        l.insert(slot(20_000, 30_000));
        assert_eq!(l.find_overlapping(&Span::new(500, 600), None).len(), 1);
    }

    #[test]
    fn exclude_drops_only_that_booking() {
        let mut l = ledger();
        let own = slot(100, 200);
        let other = slot(150, 250);
        l.insert(own);
        l.insert(other);
        let hits = l.find_overlapping(&Span::new(100, 300), Some(own.booking_id));
        assert_eq!(hits, vec![other]);
    }

    #[test]
    fn empty_ledger_has_no_hits() {
        let l = ledger();
        assert!(l.is_empty());
        assert!(l.find_overlapping(&Span::new(0, 1000), None).is_empty());
    }
}
