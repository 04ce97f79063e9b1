//! In-memory store backend.
//!
//! Thread-safe implementation of the store traits. Nothing survives a
//! restart, so it is meant for tests and local runs.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use alloy::primitives::{Address, TxHash};
use async_trait::async_trait;

use super::{
    BindOutcome, CursorStore, LedgerEntry, NotificationLedger, StoreError, Subscriber,
    SubscriberId, SubscriberStore,
};

#[derive(Default)]
struct Inner {
    subscribers: HashMap<SubscriberId, Subscriber>,
    wallets: HashMap<Address, SubscriberId>,
    ledger: HashMap<(TxHash, SubscriberId), LedgerEntry>,
    cursor: Option<u64>,
}

/// Store backend holding everything in process memory
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("poisoned lock: memory store".to_string()))
    }

    /// Number of ledger entries, for diagnostics
    pub fn ledger_len(&self) -> usize {
        self.lock().map(|inner| inner.ledger.len()).unwrap_or(0)
    }
}

#[async_trait]
impl SubscriberStore for MemoryStore {
    async fn ensure_subscriber(
        &self,
        id: SubscriberId,
        display_name: &str,
    ) -> Result<Subscriber, StoreError> {
        let mut inner = self.lock()?;
        let record = inner
            .subscribers
            .entry(id)
            .or_insert_with(|| Subscriber::new(id, display_name));
        record.display_name = display_name.to_string();
        Ok(record.clone())
    }

    async fn get_subscriber(&self, id: SubscriberId) -> Result<Option<Subscriber>, StoreError> {
        Ok(self.lock()?.subscribers.get(&id).cloned())
    }

    async fn bind_address(
        &self,
        id: SubscriberId,
        address: Address,
    ) -> Result<BindOutcome, StoreError> {
        let mut inner = self.lock()?;

        if let Some(&owner) = inner.wallets.get(&address) {
            if owner != id {
                return Ok(BindOutcome::Taken { owner });
            }
        }

        let record = inner
            .subscribers
            .entry(id)
            .or_insert_with(|| Subscriber::new(id, ""));
        let previous = record.wallet_address.replace(address);

        if let Some(old) = previous.filter(|old| *old != address) {
            inner.wallets.remove(&old);
        }
        inner.wallets.insert(address, id);

        Ok(BindOutcome::Bound { previous })
    }

    async fn clear_address(&self, id: SubscriberId) -> Result<Option<Address>, StoreError> {
        let mut inner = self.lock()?;
        let cleared = inner
            .subscribers
            .get_mut(&id)
            .and_then(|record| record.wallet_address.take());
        if let Some(address) = cleared {
            inner.wallets.remove(&address);
        }
        Ok(cleared)
    }

    async fn bound_addresses(&self) -> Result<Vec<(Address, SubscriberId)>, StoreError> {
        Ok(self
            .lock()?
            .wallets
            .iter()
            .map(|(address, id)| (*address, *id))
            .collect())
    }

    async fn set_gate_flag(&self, id: SubscriberId, is_member: bool) -> Result<(), StoreError> {
        if let Some(record) = self.lock()?.subscribers.get_mut(&id) {
            record.is_gated_member = is_member;
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationLedger for MemoryStore {
    async fn is_recorded(
        &self,
        tx_hash: TxHash,
        subscriber: SubscriberId,
    ) -> Result<bool, StoreError> {
        Ok(self.lock()?.ledger.contains_key(&(tx_hash, subscriber)))
    }

    async fn record(&self, entry: &LedgerEntry) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        let key = (entry.tx_hash, entry.subscriber);
        if inner.ledger.contains_key(&key) {
            return Ok(false);
        }
        inner.ledger.insert(key, entry.clone());
        Ok(true)
    }
}

#[async_trait]
impl CursorStore for MemoryStore {
    async fn load_cursor(&self) -> Result<Option<u64>, StoreError> {
        Ok(self.lock()?.cursor)
    }

    async fn save_cursor(&self, height: u64) -> Result<(), StoreError> {
        self.lock()?.cursor = Some(height);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const ALICE: SubscriberId = 1001;
    const BOB: SubscriberId = 1002;

    fn addr(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    // ==================== subscriber tests ====================

    #[tokio::test]
    async fn test_ensure_subscriber_keeps_registration_time() {
        let store = MemoryStore::new();
        let first = store.ensure_subscriber(ALICE, "alice").await.unwrap();
        let second = store.ensure_subscriber(ALICE, "alice_renamed").await.unwrap();

        assert_eq!(first.registered_at, second.registered_at);
        assert_eq!(second.display_name, "alice_renamed");
    }

    #[tokio::test]
    async fn test_get_unknown_subscriber_returns_none() {
        let store = MemoryStore::new();
        assert!(store.get_subscriber(ALICE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_gate_flag() {
        let store = MemoryStore::new();
        store.ensure_subscriber(ALICE, "alice").await.unwrap();
        store.set_gate_flag(ALICE, true).await.unwrap();

        let record = store.get_subscriber(ALICE).await.unwrap().unwrap();
        assert!(record.is_gated_member);
    }

    // ==================== bind_address tests ====================

    #[tokio::test]
    async fn test_bind_creates_missing_record() {
        let store = MemoryStore::new();
        let outcome = store.bind_address(ALICE, addr(0xaa)).await.unwrap();

        assert_eq!(outcome, BindOutcome::Bound { previous: None });
        let record = store.get_subscriber(ALICE).await.unwrap().unwrap();
        assert_eq!(record.wallet_address, Some(addr(0xaa)));
    }

    #[tokio::test]
    async fn test_bind_taken_by_other_subscriber() {
        let store = MemoryStore::new();
        store.bind_address(ALICE, addr(0xaa)).await.unwrap();

        let outcome = store.bind_address(BOB, addr(0xaa)).await.unwrap();
        assert_eq!(outcome, BindOutcome::Taken { owner: ALICE });
        assert!(store.get_subscriber(BOB).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rebind_releases_previous_address() {
        let store = MemoryStore::new();
        store.bind_address(ALICE, addr(0xaa)).await.unwrap();

        let outcome = store.bind_address(ALICE, addr(0xbb)).await.unwrap();
        assert_eq!(outcome, BindOutcome::Bound { previous: Some(addr(0xaa)) });

        let outcome = store.bind_address(BOB, addr(0xaa)).await.unwrap();
        assert_eq!(outcome, BindOutcome::Bound { previous: None });

        let mut bound = store.bound_addresses().await.unwrap();
        bound.sort();
        assert_eq!(bound, vec![(addr(0xaa), BOB), (addr(0xbb), ALICE)]);
    }

    #[tokio::test]
    async fn test_clear_address() {
        let store = MemoryStore::new();
        store.bind_address(ALICE, addr(0xaa)).await.unwrap();

        assert_eq!(store.clear_address(ALICE).await.unwrap(), Some(addr(0xaa)));
        assert_eq!(store.clear_address(ALICE).await.unwrap(), None);
        assert!(store.bound_addresses().await.unwrap().is_empty());

        // The record itself is retained
        assert!(store.get_subscriber(ALICE).await.unwrap().is_some());
    }

    // ==================== ledger tests ====================

    #[tokio::test]
    async fn test_ledger_insert_or_ignore() {
        let store = MemoryStore::new();
        let entry = LedgerEntry {
            tx_hash: TxHash::repeat_byte(0x01),
            subscriber: ALICE,
            block_number: 101,
            recorded_at: Utc::now(),
        };

        assert!(!store.is_recorded(entry.tx_hash, ALICE).await.unwrap());
        assert!(store.record(&entry).await.unwrap());
        assert!(!store.record(&entry).await.unwrap());
        assert!(store.is_recorded(entry.tx_hash, ALICE).await.unwrap());
        assert_eq!(store.ledger_len(), 1);
    }

    #[tokio::test]
    async fn test_ledger_keyed_by_subscriber() {
        let store = MemoryStore::new();
        let hash = TxHash::repeat_byte(0x02);
        let entry = LedgerEntry {
            tx_hash: hash,
            subscriber: ALICE,
            block_number: 7,
            recorded_at: Utc::now(),
        };
        store.record(&entry).await.unwrap();

        assert!(store.is_recorded(hash, ALICE).await.unwrap());
        assert!(!store.is_recorded(hash, BOB).await.unwrap());
    }

    // ==================== cursor tests ====================

    #[tokio::test]
    async fn test_cursor_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(store.load_cursor().await.unwrap(), None);
        store.save_cursor(104).await.unwrap();
        assert_eq!(store.load_cursor().await.unwrap(), Some(104));
    }
}
