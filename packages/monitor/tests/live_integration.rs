//! Live Infrastructure Tests
//!
//! These tests require Redis at localhost:6379 and, for the chain tests, a
//! JSON-RPC node at http://127.0.0.1:8545 (e.g. `anvil`).
//! They are marked with #[ignore] by default for CI environments.
//!
//! To run these tests:
//! 1. Start Redis: `docker run -d -p 6379:6379 redis:alpine`
//! 2. Start a node: `anvil`
//! 3. Run tests: `cargo test --test live_integration -- --ignored`

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use alloy::primitives::{Address, TxHash};
use chrono::Utc;

use walletwatch_monitor::chain::{ChainReader, RpcChainReader};
use walletwatch_monitor::registry::{AddressRegistry, RegisterOutcome, RejectReason};
use walletwatch_monitor::store::{
    BindOutcome, CursorStore, LedgerEntry, NotificationLedger, RedisStore, SubscriberStore,
};

const REDIS_URL: &str = "redis://127.0.0.1:6379";
const RPC_URL: &str = "http://127.0.0.1:8545";

/// A store under a fresh prefix so runs never see each other's keys
async fn fresh_store() -> RedisStore {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    RedisStore::connect(REDIS_URL, format!("walletwatch-test-{}", nanos))
        .await
        .expect("Redis should be reachable")
}

// ==================== Redis Store Tests ====================

#[tokio::test]
#[ignore = "Requires running Redis at localhost:6379"]
async fn test_redis_subscriber_lifecycle() {
    let store = fresh_store().await;

    let created = store.ensure_subscriber(7, "alice").await.unwrap();
    let again = store.ensure_subscriber(7, "alice2").await.unwrap();
    assert_eq!(created.registered_at.timestamp(), again.registered_at.timestamp());
    assert_eq!(again.display_name, "alice2");

    store.set_gate_flag(7, true).await.unwrap();
    let record = store.get_subscriber(7).await.unwrap().unwrap();
    assert!(record.is_gated_member);
    assert_eq!(record.wallet_address, None);
}

#[tokio::test]
#[ignore = "Requires running Redis at localhost:6379"]
async fn test_redis_bind_is_unique_and_replaces() {
    let store = fresh_store().await;
    let a = Address::repeat_byte(0xaa);
    let b = Address::repeat_byte(0xbb);

    assert_eq!(
        store.bind_address(1, a).await.unwrap(),
        BindOutcome::Bound { previous: None }
    );
    assert_eq!(
        store.bind_address(2, a).await.unwrap(),
        BindOutcome::Taken { owner: 1 }
    );
    assert_eq!(
        store.bind_address(1, b).await.unwrap(),
        BindOutcome::Bound { previous: Some(a) }
    );
    assert_eq!(
        store.bind_address(2, a).await.unwrap(),
        BindOutcome::Bound { previous: None }
    );

    let mut bound = store.bound_addresses().await.unwrap();
    bound.sort();
    assert_eq!(bound, vec![(a, 2), (b, 1)]);

    assert_eq!(store.clear_address(1).await.unwrap(), Some(b));
    assert_eq!(store.clear_address(1).await.unwrap(), None);
}

#[tokio::test]
#[ignore = "Requires running Redis at localhost:6379"]
async fn test_redis_ledger_and_cursor() {
    let store = fresh_store().await;
    let entry = LedgerEntry {
        tx_hash: TxHash::repeat_byte(0x42),
        subscriber: 1,
        block_number: 101,
        recorded_at: Utc::now(),
    };

    assert!(!store.is_recorded(entry.tx_hash, 1).await.unwrap());
    assert!(store.record(&entry).await.unwrap());
    assert!(!store.record(&entry).await.unwrap());
    assert!(store.is_recorded(entry.tx_hash, 1).await.unwrap());
    assert!(!store.is_recorded(entry.tx_hash, 2).await.unwrap());

    assert_eq!(store.load_cursor().await.unwrap(), None);
    store.save_cursor(104).await.unwrap();
    assert_eq!(store.load_cursor().await.unwrap(), Some(104));
}

#[tokio::test]
#[ignore = "Requires running Redis at localhost:6379"]
async fn test_registry_reloads_from_redis() {
    let store = Arc::new(fresh_store().await);
    let registry = AddressRegistry::new(store.clone());

    registry.register(1, Address::repeat_byte(0xaa)).await;
    registry.register(2, Address::repeat_byte(0xbb)).await;
    assert_eq!(
        registry.register(3, Address::repeat_byte(0xaa)).await,
        RegisterOutcome::Rejected(RejectReason::AddressTaken)
    );

    let reloaded = AddressRegistry::load(store).await.unwrap();
    assert_eq!(reloaded.snapshot_all(), registry.snapshot_all());
}

// ==================== Chain Tests ====================

#[tokio::test]
#[ignore = "Requires a JSON-RPC node at 127.0.0.1:8545"]
async fn test_rpc_latest_height_and_block() {
    let reader = RpcChainReader::connect_http(RPC_URL).unwrap();

    let latest = reader.latest_height().await.unwrap();
    assert_eq!(reader.last_known_height(), latest);

    let transactions = reader.block_transactions(latest).await.unwrap();
    println!("block {} has {} transactions", latest, transactions.len());
}

#[tokio::test]
#[ignore = "Requires a JSON-RPC node at 127.0.0.1:8545"]
async fn test_rpc_missing_block() {
    let reader = RpcChainReader::connect_http(RPC_URL).unwrap();
    let latest = reader.latest_height().await.unwrap();

    let result = reader.block_transactions(latest + 1_000_000).await;
    assert!(result.is_err());
}
