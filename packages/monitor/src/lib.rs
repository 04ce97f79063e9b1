//! WalletWatch Monitor Library
//!
//! This crate watches successive blocks of an EVM chain for transactions
//! touching registered wallet addresses and pushes a notification to each
//! address owner exactly once per (transaction, subscriber).

pub mod chain;
pub mod config;
pub mod dispatcher;
pub mod gate;
pub mod matcher;
pub mod monitor;
pub mod notifier;
pub mod registry;
pub mod service;
pub mod store;

// Re-export commonly used types
pub use chain::{BlockTransaction, ChainError, ChainReader, RpcChainReader};
pub use config::{AppConfig, ConfigError, MonitorConfig};
pub use dispatcher::{DispatchOutcome, NotificationDispatcher};
pub use gate::{MembershipGate, OpenGate, TelegramGroupGate};
pub use matcher::{match_transactions, parse_address, Direction, MatchedTransaction};
pub use monitor::{MonitorHandle, MonitorLoop, MonitorState, PollOutcome};
pub use notifier::{MessageFormat, Notifier, NotifyError, TelegramNotifier};
pub use registry::{AddressRegistry, RegisterOutcome, RejectReason, UnregisterOutcome};
pub use service::{SubscriberStatus, SubscriptionService};
pub use store::{MemoryStore, RedisStore, StoreError, Subscriber, SubscriberId};
