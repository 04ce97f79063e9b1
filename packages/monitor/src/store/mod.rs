//! Persistence Store
//!
//! Durable record store for subscribers, the notification dedup ledger and
//! the chain cursor. Two backends are provided: [`MemoryStore`] for tests and
//! embedded use, and [`RedisStore`] for production.

use alloy::primitives::{Address, TxHash};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::matcher::MatchedTransaction;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Subscriber identity assigned by the chat platform.
///
/// Doubles as the chat session id notifications are delivered to.
pub type SubscriberId = i64;

/// Errors that can occur during store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// A subscriber record as held by the durable store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    /// Chat platform user id
    pub id: SubscriberId,
    /// Display name at last contact
    pub display_name: String,
    /// Bound wallet address, if any
    pub wallet_address: Option<Address>,
    /// Reserved per-subscriber bookkeeping; not read by the monitor loop
    pub last_checked_block: u64,
    /// Result of the last successful membership gate check
    pub is_gated_member: bool,
    /// First contact time
    pub registered_at: DateTime<Utc>,
}

impl Subscriber {
    /// Create a fresh record with no address bound
    pub fn new(id: SubscriberId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            wallet_address: None,
            last_checked_block: 0,
            is_gated_member: false,
            registered_at: Utc::now(),
        }
    }
}

/// Result of an atomic address bind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// The address is now bound to the subscriber. `previous` is the address
    /// the subscriber held before, which has been released.
    Bound { previous: Option<Address> },
    /// The address belongs to another subscriber; nothing was changed.
    Taken { owner: SubscriberId },
}

/// One delivered (transaction, subscriber) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub tx_hash: TxHash,
    pub subscriber: SubscriberId,
    pub block_number: u64,
    pub recorded_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Build the ledger entry for a delivered match, stamped now
    pub fn for_match(matched: &MatchedTransaction) -> Self {
        Self {
            tx_hash: matched.hash,
            subscriber: matched.subscriber,
            block_number: matched.block_number,
            recorded_at: Utc::now(),
        }
    }
}

/// Subscriber records and the address uniqueness index
#[async_trait]
pub trait SubscriberStore: Send + Sync {
    /// Create the record on first contact. An existing record keeps its
    /// registration time and address; only the display name is refreshed.
    async fn ensure_subscriber(
        &self,
        id: SubscriberId,
        display_name: &str,
    ) -> Result<Subscriber, StoreError>;

    async fn get_subscriber(&self, id: SubscriberId) -> Result<Option<Subscriber>, StoreError>;

    /// Atomically bind `address` to `id`, releasing any address `id` held
    /// before. Creates the record if it does not exist.
    async fn bind_address(
        &self,
        id: SubscriberId,
        address: Address,
    ) -> Result<BindOutcome, StoreError>;

    /// Clear the subscriber's binding, returning the released address
    async fn clear_address(&self, id: SubscriberId) -> Result<Option<Address>, StoreError>;

    /// Every current (address, subscriber) binding
    async fn bound_addresses(&self) -> Result<Vec<(Address, SubscriberId)>, StoreError>;

    async fn set_gate_flag(&self, id: SubscriberId, is_member: bool) -> Result<(), StoreError>;
}

/// Durable set of (transaction, subscriber) pairs already notified
#[async_trait]
pub trait NotificationLedger: Send + Sync {
    async fn is_recorded(
        &self,
        tx_hash: TxHash,
        subscriber: SubscriberId,
    ) -> Result<bool, StoreError>;

    /// Insert-or-ignore. Returns `true` if the pair was not recorded before.
    async fn record(&self, entry: &LedgerEntry) -> Result<bool, StoreError>;
}

/// Persisted monitor cursor
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load_cursor(&self) -> Result<Option<u64>, StoreError>;
    async fn save_cursor(&self, height: u64) -> Result<(), StoreError>;
}
