//! Address Registry
//!
//! Authoritative address -> subscriber binding. The durable store holds the
//! records; an in-memory index mirrors them for O(1) lookup on every block.
//!
//! Mutations are serialized by an async mutex and follow write-then-mirror
//! ordering: the durable store changes first, then the index is updated in a
//! single write-locked step. Readers holding the index read lock therefore
//! never observe a half-applied replace.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use alloy::primitives::Address;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::store::{BindOutcome, StoreError, SubscriberId, SubscriberStore};

/// Why a registration was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The address is bound to a different subscriber
    AddressTaken,
    /// The membership gate answered "not eligible"
    NotEligible,
    /// The input is not a valid address
    InvalidAddress,
    /// The durable store failed; nothing was changed
    StoreError(String),
}

/// Result of a registration attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// New binding; the subscriber held no address before
    Registered,
    /// The subscriber's previous binding was released and replaced
    Replaced { previous: Address },
    Rejected(RejectReason),
}

/// Result of an unregistration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnregisterOutcome {
    Removed { address: Address },
    NotFound,
}

/// Address -> subscriber registry with a mirrored in-memory index
pub struct AddressRegistry {
    store: Arc<dyn SubscriberStore>,
    index: RwLock<HashMap<Address, SubscriberId>>,
    mutations: Mutex<()>,
}

impl AddressRegistry {
    /// Create a registry with an empty index
    pub fn new(store: Arc<dyn SubscriberStore>) -> Self {
        Self {
            store,
            index: RwLock::new(HashMap::new()),
            mutations: Mutex::new(()),
        }
    }

    /// Create a registry and warm its index from the durable store
    pub async fn load(store: Arc<dyn SubscriberStore>) -> Result<Self, StoreError> {
        let bindings = store.bound_addresses().await?;
        let registry = Self::new(store);
        {
            let mut index = registry.write_index();
            index.extend(bindings);
            info!(addresses = index.len(), "address registry loaded");
        }
        Ok(registry)
    }

    fn read_index(&self) -> RwLockReadGuard<'_, HashMap<Address, SubscriberId>> {
        self.index.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_index(&self) -> RwLockWriteGuard<'_, HashMap<Address, SubscriberId>> {
        self.index.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bind `address` to `subscriber`
    ///
    /// Rejects with [`RejectReason::AddressTaken`] if another subscriber owns
    /// the address. A previous binding of the same subscriber is released in
    /// the same step, so the old address is free for anyone on the next call.
    pub async fn register(&self, subscriber: SubscriberId, address: Address) -> RegisterOutcome {
        let _guard = self.mutations.lock().await;

        let outcome = match self.store.bind_address(subscriber, address).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(subscriber, error = %e, "store failed during registration");
                return RegisterOutcome::Rejected(RejectReason::StoreError(e.to_string()));
            }
        };

        match outcome {
            BindOutcome::Taken { owner } => {
                info!(subscriber, owner, address = %address, "address already taken");
                RegisterOutcome::Rejected(RejectReason::AddressTaken)
            }
            BindOutcome::Bound { previous } => {
                {
                    let mut index = self.write_index();
                    if let Some(old) = previous.filter(|old| *old != address) {
                        index.remove(&old);
                    }
                    index.insert(address, subscriber);
                }

                match previous {
                    Some(previous) => {
                        info!(subscriber, previous = %previous, address = %address, "address replaced");
                        RegisterOutcome::Replaced { previous }
                    }
                    None => {
                        info!(subscriber, address = %address, "address registered");
                        RegisterOutcome::Registered
                    }
                }
            }
        }
    }

    /// Clear the subscriber's binding
    pub async fn unregister(
        &self,
        subscriber: SubscriberId,
    ) -> Result<UnregisterOutcome, StoreError> {
        let _guard = self.mutations.lock().await;

        match self.store.clear_address(subscriber).await? {
            Some(address) => {
                self.write_index().remove(&address);
                info!(subscriber, address = %address, "address unregistered");
                Ok(UnregisterOutcome::Removed { address })
            }
            None => Ok(UnregisterOutcome::NotFound),
        }
    }

    /// Owner of `address`, if monitored
    pub fn lookup(&self, address: &Address) -> Option<SubscriberId> {
        self.read_index().get(address).copied()
    }

    /// Every (address, subscriber) binding, sorted by address
    pub fn snapshot_all(&self) -> Vec<(Address, SubscriberId)> {
        let mut bindings: Vec<_> = self
            .read_index()
            .iter()
            .map(|(address, id)| (*address, *id))
            .collect();
        bindings.sort();
        bindings
    }

    /// Run `f` against the index under the read lock. No mutation can be
    /// applied while `f` runs.
    pub fn with_index<R>(&self, f: impl FnOnce(&HashMap<Address, SubscriberId>) -> R) -> R {
        f(&self.read_index())
    }

    pub fn len(&self) -> usize {
        self.read_index().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_index().is_empty()
    }
}
