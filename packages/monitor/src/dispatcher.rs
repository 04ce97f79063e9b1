//! Notification Dispatcher
//!
//! Delivers one message per matched transaction that has not been notified
//! yet, and records the delivery in the dedup ledger keyed by
//! (transaction hash, subscriber).

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::matcher::MatchedTransaction;
use crate::notifier::Notifier;
use crate::store::{LedgerEntry, NotificationLedger, StoreError};

/// Result of dispatching one matched transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchOutcome {
    /// Sent now
    Delivered,
    /// The ledger already holds this (transaction, subscriber) pair
    AlreadyDelivered,
    /// The send failed; the pair was not recorded
    DeliveryFailed,
}

/// Per-block dispatch counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: u64,
    pub already_delivered: u64,
    pub failed: u64,
}

impl DispatchStats {
    pub fn record(&mut self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Delivered => self.delivered += 1,
            DispatchOutcome::AlreadyDelivered => self.already_delivered += 1,
            DispatchOutcome::DeliveryFailed => self.failed += 1,
        }
    }

    pub fn merge(&mut self, other: DispatchStats) {
        self.delivered += other.delivered;
        self.already_delivered += other.already_delivered;
        self.failed += other.failed;
    }

    pub fn total(&self) -> u64 {
        self.delivered + self.already_delivered + self.failed
    }
}

/// Ledger-checked delivery of matched transactions
pub struct NotificationDispatcher {
    ledger: Arc<dyn NotificationLedger>,
    notifier: Arc<dyn Notifier>,
}

impl NotificationDispatcher {
    pub fn new(ledger: Arc<dyn NotificationLedger>, notifier: Arc<dyn Notifier>) -> Self {
        Self { ledger, notifier }
    }

    /// Deliver `matched` unless already delivered
    ///
    /// # Returns
    /// * `Ok(DispatchOutcome)` - The delivery outcome. A failed send is an
    ///   outcome, not an error.
    /// * `Err(StoreError)` - The ledger could not be read, so nothing was
    ///   sent and the block must be retried.
    pub async fn dispatch(
        &self,
        matched: &MatchedTransaction,
    ) -> Result<DispatchOutcome, StoreError> {
        if self.ledger.is_recorded(matched.hash, matched.subscriber).await? {
            debug!(
                tx_hash = %matched.hash,
                subscriber = matched.subscriber,
                "already delivered"
            );
            return Ok(DispatchOutcome::AlreadyDelivered);
        }

        if let Err(e) = self.notifier.notify(matched.subscriber, matched).await {
            warn!(
                tx_hash = %matched.hash,
                subscriber = matched.subscriber,
                error = %e,
                "notification delivery failed"
            );
            return Ok(DispatchOutcome::DeliveryFailed);
        }

        // The message is out; a ledger failure here can only cause a duplicate
        if let Err(e) = self.ledger.record(&LedgerEntry::for_match(matched)).await {
            error!(
                tx_hash = %matched.hash,
                subscriber = matched.subscriber,
                error = %e,
                "delivered but failed to record in ledger"
            );
        }

        debug!(
            tx_hash = %matched.hash,
            subscriber = matched.subscriber,
            direction = %matched.direction,
            address = ?matched.monitored_address(),
            "notification delivered"
        );
        Ok(DispatchOutcome::Delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::Direction;
    use crate::notifier::{MockNotifier, NotifyError};
    use crate::store::{MemoryStore, SubscriberId};
    use alloy::primitives::{Address, TxHash, U256};
    use async_trait::async_trait;

    fn matched(seq: u8, subscriber: SubscriberId) -> MatchedTransaction {
        MatchedTransaction {
            block_number: 101,
            hash: TxHash::repeat_byte(seq),
            from: Address::repeat_byte(0xaa),
            to: Some(Address::repeat_byte(0xbb)),
            value: U256::from(1u64),
            gas: 21_000,
            direction: Direction::Outgoing,
            subscriber,
        }
    }

    /// Ledger that reads fine but never accepts writes
    struct ReadOnlyLedger;

    #[async_trait]
    impl NotificationLedger for ReadOnlyLedger {
        async fn is_recorded(&self, _: TxHash, _: SubscriberId) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn record(&self, _: &LedgerEntry) -> Result<bool, StoreError> {
            Err(StoreError::Backend("read-only".to_string()))
        }
    }

    /// Ledger that cannot be read
    struct UnreadableLedger;

    #[async_trait]
    impl NotificationLedger for UnreadableLedger {
        async fn is_recorded(&self, _: TxHash, _: SubscriberId) -> Result<bool, StoreError> {
            Err(StoreError::Backend("down".to_string()))
        }
        async fn record(&self, _: &LedgerEntry) -> Result<bool, StoreError> {
            Err(StoreError::Backend("down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_delivers_once_then_dedups() {
        let ledger = Arc::new(MemoryStore::new());
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().times(1).returning(|_, _| Ok(()));

        let dispatcher = NotificationDispatcher::new(ledger.clone(), Arc::new(notifier));
        let tx = matched(1, 7);

        assert_eq!(dispatcher.dispatch(&tx).await.unwrap(), DispatchOutcome::Delivered);
        assert_eq!(
            dispatcher.dispatch(&tx).await.unwrap(),
            DispatchOutcome::AlreadyDelivered
        );
        assert!(ledger.is_recorded(tx.hash, 7).await.unwrap());
    }

    #[tokio::test]
    async fn test_same_transaction_two_subscribers_both_delivered() {
        let ledger = Arc::new(MemoryStore::new());
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .withf(|subscriber, _| *subscriber == 7 || *subscriber == 8)
            .times(2)
            .returning(|_, _| Ok(()));

        let dispatcher = NotificationDispatcher::new(ledger.clone(), Arc::new(notifier));

        assert_eq!(dispatcher.dispatch(&matched(1, 7)).await.unwrap(), DispatchOutcome::Delivered);
        assert_eq!(dispatcher.dispatch(&matched(1, 8)).await.unwrap(), DispatchOutcome::Delivered);
        assert_eq!(ledger.ledger_len(), 2);
    }

    #[tokio::test]
    async fn test_failed_send_is_not_recorded() {
        let ledger = Arc::new(MemoryStore::new());
        let mut notifier = MockNotifier::new();
        let mut attempts = 0;
        notifier.expect_notify().times(2).returning(move |_, _| {
            attempts += 1;
            if attempts == 1 {
                Err(NotifyError::Rejected {
                    status: 502,
                    body: "bad gateway".to_string(),
                })
            } else {
                Ok(())
            }
        });

        let dispatcher = NotificationDispatcher::new(ledger.clone(), Arc::new(notifier));
        let tx = matched(1, 7);

        assert_eq!(dispatcher.dispatch(&tx).await.unwrap(), DispatchOutcome::DeliveryFailed);
        assert!(!ledger.is_recorded(tx.hash, 7).await.unwrap());

        assert_eq!(dispatcher.dispatch(&tx).await.unwrap(), DispatchOutcome::Delivered);
        assert!(ledger.is_recorded(tx.hash, 7).await.unwrap());
    }

    #[tokio::test]
    async fn test_ledger_write_failure_still_delivered() {
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().times(1).returning(|_, _| Ok(()));

        let dispatcher = NotificationDispatcher::new(Arc::new(ReadOnlyLedger), Arc::new(notifier));

        assert_eq!(
            dispatcher.dispatch(&matched(1, 7)).await.unwrap(),
            DispatchOutcome::Delivered
        );
    }

    #[tokio::test]
    async fn test_unreadable_ledger_sends_nothing() {
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().never();

        let dispatcher = NotificationDispatcher::new(Arc::new(UnreadableLedger), Arc::new(notifier));

        assert!(dispatcher.dispatch(&matched(1, 7)).await.is_err());
    }

    #[test]
    fn test_dispatch_stats() {
        let mut stats = DispatchStats::default();
        stats.record(DispatchOutcome::Delivered);
        stats.record(DispatchOutcome::AlreadyDelivered);
        stats.record(DispatchOutcome::DeliveryFailed);

        let mut total = DispatchStats::default();
        total.merge(stats);
        total.merge(stats);

        assert_eq!(total.delivered, 2);
        assert_eq!(total.total(), 6);
    }
}
