use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::OwnedRwLockWriteGuard;

use crate::model::ResourceKey;

use super::ledger::ResourceLedger;
use super::store::BookingStore;
use super::BookingError;

/// Exclusive hold on every ledger one booking operation touches.
///
/// Guards are taken in `ResourceKey` order, so two transactions over
/// overlapping key sets can never deadlock. Between `begin` and drop no other
/// transaction can read-for-write or change those ledgers, which makes the
/// overlap query and the subsequent commit one serializable step.
pub struct ScheduleTxn {
    guards: BTreeMap<ResourceKey, OwnedRwLockWriteGuard<ResourceLedger>>,
}

impl ScheduleTxn {
    /// A transaction that touches no ledger (directory and reference events).
    pub fn empty() -> Self {
        Self {
            guards: BTreeMap::new(),
        }
    }

    /// Lock `keys` (deduplicated, sorted), waiting at most `timeout` in total.
    /// Fails with `ResourceNotFound` before waiting if any key is unknown.
    pub async fn begin(
        store: &BookingStore,
        keys: impl IntoIterator<Item = ResourceKey>,
        timeout: Duration,
    ) -> Result<Self, BookingError> {
        let mut ledgers = BTreeMap::new();
        for key in keys {
            let ledger = store.ledger(&key).ok_or(BookingError::ResourceNotFound {
                kind: key.kind,
                id: key.id,
            })?;
            ledgers.insert(key, ledger);
        }

        let acquire = async move {
            let mut guards = BTreeMap::new();
            for (key, ledger) in ledgers {
                guards.insert(key, ledger.write_owned().await);
            }
            guards
        };
        let guards = tokio::time::timeout(timeout, acquire)
            .await
            .map_err(|_| BookingError::Timeout("waiting for resource locks"))?;
        Ok(Self { guards })
    }

    /// Non-waiting variant for replay, where the caller is the only owner.
    /// Unknown keys are skipped; returns `None` if any ledger is contended.
    pub fn try_begin(store: &BookingStore, keys: impl IntoIterator<Item = ResourceKey>) -> Option<Self> {
        let mut guards = BTreeMap::new();
        for key in keys {
            if guards.contains_key(&key) {
                continue;
            }
            if let Some(ledger) = store.ledger(&key) {
                guards.insert(key, ledger.try_write_owned().ok()?);
            }
        }
        Some(Self { guards })
    }

    pub fn ledger(&self, key: &ResourceKey) -> Option<&ResourceLedger> {
        self.guards.get(key).map(|g| &**g)
    }

    pub fn ledger_mut(&mut self, key: &ResourceKey) -> Option<&mut ResourceLedger> {
        self.guards.get_mut(key).map(|g| &mut **g)
    }
}
