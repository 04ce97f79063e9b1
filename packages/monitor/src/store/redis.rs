//! Redis store backend.
//!
//! Layout under a configurable key prefix `P`:
//! - `P:subscriber:{id}`: hash with the subscriber record fields
//! - `P:wallets`: hash address -> subscriber id (uniqueness index)
//! - `P:ledger`: hash `{tx_hash}:{subscriber}` -> JSON [`LedgerEntry`]
//! - `P:cursor`: last fully processed block height
//!
//! Address binds and releases run as Lua scripts so the subscriber record and
//! the uniqueness index always change together.

use std::collections::HashMap;
use std::str::FromStr;

use alloy::primitives::{Address, TxHash};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tracing::info;

use super::{
    BindOutcome, CursorStore, LedgerEntry, NotificationLedger, StoreError, Subscriber,
    SubscriberId, SubscriberStore,
};
use crate::matcher::canonical_address;

/// Default key prefix
pub const DEFAULT_PREFIX: &str = "walletwatch";

const FIELD_DISPLAY_NAME: &str = "display_name";
const FIELD_WALLET: &str = "wallet_address";
const FIELD_LAST_CHECKED: &str = "last_checked_block";
const FIELD_GATED: &str = "is_gated_member";
const FIELD_REGISTERED_AT: &str = "registered_at";

// KEYS[1] subscriber hash, KEYS[2] wallets index
// ARGV[1] subscriber id, ARGV[2] address, ARGV[3] registration time
const BIND_SCRIPT: &str = r#"
local owner = redis.call('HGET', KEYS[2], ARGV[2])
if owner and owner ~= ARGV[1] then
  return {'taken', owner}
end
local previous = redis.call('HGET', KEYS[1], 'wallet_address')
if previous and previous ~= ARGV[2] then
  redis.call('HDEL', KEYS[2], previous)
end
redis.call('HSETNX', KEYS[1], 'display_name', '')
redis.call('HSETNX', KEYS[1], 'last_checked_block', '0')
redis.call('HSETNX', KEYS[1], 'is_gated_member', '0')
redis.call('HSETNX', KEYS[1], 'registered_at', ARGV[3])
redis.call('HSET', KEYS[1], 'wallet_address', ARGV[2])
redis.call('HSET', KEYS[2], ARGV[2], ARGV[1])
if previous then
  return {'bound', previous}
end
return {'bound', ''}
"#;

// KEYS[1] subscriber hash, KEYS[2] wallets index
const CLEAR_SCRIPT: &str = r#"
local previous = redis.call('HGET', KEYS[1], 'wallet_address')
if not previous then
  return ''
end
redis.call('HDEL', KEYS[1], 'wallet_address')
redis.call('HDEL', KEYS[2], previous)
return previous
"#;

/// Store backend on a Redis server
pub struct RedisStore {
    connection: MultiplexedConnection,
    prefix: String,
    bind_script: Script,
    clear_script: Script,
}

impl RedisStore {
    /// Create a store over an established multiplexed connection
    ///
    /// # Arguments
    /// * `connection` - An established Redis multiplexed connection
    /// * `prefix` - Namespace for every key this store touches
    pub fn new(connection: MultiplexedConnection, prefix: impl Into<String>) -> Self {
        Self {
            connection,
            prefix: prefix.into(),
            bind_script: Script::new(BIND_SCRIPT),
            clear_script: Script::new(CLEAR_SCRIPT),
        }
    }

    /// Open a connection to `url` and build a store on it
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        let prefix = prefix.into();
        info!(prefix = %prefix, "connected to Redis store");
        Ok(Self::new(connection, prefix))
    }

    /// Get the key prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn subscriber_key(&self, id: SubscriberId) -> String {
        subscriber_key(&self.prefix, id)
    }

    fn wallets_key(&self) -> String {
        format!("{}:wallets", self.prefix)
    }

    fn ledger_key(&self) -> String {
        format!("{}:ledger", self.prefix)
    }

    fn cursor_key(&self) -> String {
        format!("{}:cursor", self.prefix)
    }
}

/// Key of a subscriber's record hash
pub fn subscriber_key(prefix: &str, id: SubscriberId) -> String {
    format!("{}:subscriber:{}", prefix, id)
}

/// Field name of a (transaction, subscriber) pair inside the ledger hash
pub fn ledger_field(tx_hash: TxHash, subscriber: SubscriberId) -> String {
    format!("{:#x}:{}", tx_hash, subscriber)
}

fn parse_address(raw: &str) -> Result<Address, StoreError> {
    Address::from_str(raw).map_err(|e| StoreError::Corrupt(format!("address '{}': {}", raw, e)))
}

fn parse_subscriber_id(raw: &str) -> Result<SubscriberId, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::Corrupt(format!("subscriber id '{}'", raw)))
}

/// Rebuild a [`Subscriber`] from its record hash
pub fn subscriber_from_fields(
    id: SubscriberId,
    fields: &HashMap<String, String>,
) -> Result<Subscriber, StoreError> {
    let wallet_address = match fields.get(FIELD_WALLET).map(String::as_str) {
        None | Some("") => None,
        Some(raw) => Some(parse_address(raw)?),
    };

    let last_checked_block = match fields.get(FIELD_LAST_CHECKED) {
        Some(raw) => raw
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("last_checked_block '{}'", raw)))?,
        None => 0,
    };

    let registered_at = match fields.get(FIELD_REGISTERED_AT) {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map_err(|e| StoreError::Corrupt(format!("registered_at '{}': {}", raw, e)))?
            .with_timezone(&Utc),
        None => return Err(StoreError::Corrupt(format!("subscriber {} has no registered_at", id))),
    };

    Ok(Subscriber {
        id,
        display_name: fields.get(FIELD_DISPLAY_NAME).cloned().unwrap_or_default(),
        wallet_address,
        last_checked_block,
        is_gated_member: fields.get(FIELD_GATED).is_some_and(|v| v == "1"),
        registered_at,
    })
}

/// Interpret the reply of the bind script
pub fn bind_outcome_from_reply(reply: &[String]) -> Result<BindOutcome, StoreError> {
    match reply {
        [tag, owner] if tag == "taken" => Ok(BindOutcome::Taken {
            owner: parse_subscriber_id(owner)?,
        }),
        [tag, previous] if tag == "bound" => {
            let previous = if previous.is_empty() {
                None
            } else {
                Some(parse_address(previous)?)
            };
            Ok(BindOutcome::Bound { previous })
        }
        other => Err(StoreError::Corrupt(format!("unexpected bind reply {:?}", other))),
    }
}

#[async_trait]
impl SubscriberStore for RedisStore {
    async fn ensure_subscriber(
        &self,
        id: SubscriberId,
        display_name: &str,
    ) -> Result<Subscriber, StoreError> {
        let key = self.subscriber_key(id);
        let mut conn = self.connection.clone();

        let _: () = redis::pipe()
            .atomic()
            .hset_nx(&key, FIELD_REGISTERED_AT, Utc::now().to_rfc3339())
            .ignore()
            .hset_nx(&key, FIELD_LAST_CHECKED, "0")
            .ignore()
            .hset_nx(&key, FIELD_GATED, "0")
            .ignore()
            .hset(&key, FIELD_DISPLAY_NAME, display_name)
            .ignore()
            .query_async(&mut conn)
            .await?;

        let fields: HashMap<String, String> = conn.hgetall(&key).await?;
        subscriber_from_fields(id, &fields)
    }

    async fn get_subscriber(&self, id: SubscriberId) -> Result<Option<Subscriber>, StoreError> {
        let mut conn = self.connection.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.subscriber_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        subscriber_from_fields(id, &fields).map(Some)
    }

    async fn bind_address(
        &self,
        id: SubscriberId,
        address: Address,
    ) -> Result<BindOutcome, StoreError> {
        let mut conn = self.connection.clone();
        let reply: Vec<String> = self
            .bind_script
            .key(self.subscriber_key(id))
            .key(self.wallets_key())
            .arg(id)
            .arg(canonical_address(&address))
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await?;
        bind_outcome_from_reply(&reply)
    }

    async fn clear_address(&self, id: SubscriberId) -> Result<Option<Address>, StoreError> {
        let mut conn = self.connection.clone();
        let previous: String = self
            .clear_script
            .key(self.subscriber_key(id))
            .key(self.wallets_key())
            .invoke_async(&mut conn)
            .await?;
        if previous.is_empty() {
            return Ok(None);
        }
        parse_address(&previous).map(Some)
    }

    async fn bound_addresses(&self) -> Result<Vec<(Address, SubscriberId)>, StoreError> {
        let mut conn = self.connection.clone();
        let wallets: HashMap<String, String> = conn.hgetall(self.wallets_key()).await?;
        wallets
            .iter()
            .map(|(address, id)| Ok((parse_address(address)?, parse_subscriber_id(id)?)))
            .collect()
    }

    async fn set_gate_flag(&self, id: SubscriberId, is_member: bool) -> Result<(), StoreError> {
        let key = self.subscriber_key(id);
        let mut conn = self.connection.clone();
        let exists: bool = conn.exists(&key).await?;
        if exists {
            let flag = if is_member { "1" } else { "0" };
            conn.hset::<_, _, _, ()>(&key, FIELD_GATED, flag).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationLedger for RedisStore {
    async fn is_recorded(
        &self,
        tx_hash: TxHash,
        subscriber: SubscriberId,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let recorded: bool = conn
            .hexists(self.ledger_key(), ledger_field(tx_hash, subscriber))
            .await?;
        Ok(recorded)
    }

    async fn record(&self, entry: &LedgerEntry) -> Result<bool, StoreError> {
        let json = serde_json::to_string(entry)?;
        let mut conn = self.connection.clone();
        let inserted: bool = conn
            .hset_nx(
                self.ledger_key(),
                ledger_field(entry.tx_hash, entry.subscriber),
                json,
            )
            .await?;
        Ok(inserted)
    }
}

#[async_trait]
impl CursorStore for RedisStore {
    async fn load_cursor(&self) -> Result<Option<u64>, StoreError> {
        let mut conn = self.connection.clone();
        let cursor: Option<u64> = conn.get(self.cursor_key()).await?;
        Ok(cursor)
    }

    async fn save_cursor(&self, height: u64) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        conn.set::<_, _, ()>(self.cursor_key(), height).await?;
        Ok(())
    }
}
