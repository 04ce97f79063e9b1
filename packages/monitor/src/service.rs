//! Subscription Service
//!
//! Command-facing interface consumed by the chat front end: first contact,
//! registration behind the membership gate, unregistration and status.

use std::sync::Arc;

use alloy::primitives::Address;
use tracing::{info, warn};

use crate::gate::MembershipGate;
use crate::matcher::parse_address;
use crate::notifier::MessageFormat;
use crate::registry::{AddressRegistry, RegisterOutcome, RejectReason, UnregisterOutcome};
use crate::store::{StoreError, Subscriber, SubscriberId, SubscriberStore};

/// Status report for one subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberStatus {
    pub subscriber: Subscriber,
    /// Bound address, if any
    pub address: Option<Address>,
    /// Whether the monitor loop is watching the address right now
    pub monitoring_active: bool,
    /// Explorer page of the bound address
    pub explorer_link: Option<String>,
}

pub struct SubscriptionService {
    registry: Arc<AddressRegistry>,
    store: Arc<dyn SubscriberStore>,
    gate: Arc<dyn MembershipGate>,
    format: MessageFormat,
}

impl SubscriptionService {
    pub fn new(
        registry: Arc<AddressRegistry>,
        store: Arc<dyn SubscriberStore>,
        gate: Arc<dyn MembershipGate>,
        format: MessageFormat,
    ) -> Self {
        Self {
            registry,
            store,
            gate,
            format,
        }
    }

    pub fn registry(&self) -> &Arc<AddressRegistry> {
        &self.registry
    }

    /// Create the subscriber record on first contact
    pub async fn ensure_subscriber(
        &self,
        subscriber: SubscriberId,
        display_name: &str,
    ) -> Result<Subscriber, StoreError> {
        self.store.ensure_subscriber(subscriber, display_name).await
    }

    /// Register `raw_address` for `subscriber` after a membership check
    ///
    /// The gate fails open: if it cannot answer, the subscriber is treated
    /// as eligible.
    pub async fn register(
        &self,
        subscriber: SubscriberId,
        display_name: &str,
        raw_address: &str,
    ) -> RegisterOutcome {
        if let Err(e) = self.store.ensure_subscriber(subscriber, display_name).await {
            return RegisterOutcome::Rejected(RejectReason::StoreError(e.to_string()));
        }

        match self.gate.is_eligible(subscriber).await {
            Ok(is_member) => {
                if let Err(e) = self.store.set_gate_flag(subscriber, is_member).await {
                    warn!(subscriber, error = %e, "failed to persist gate flag");
                }
                if !is_member {
                    info!(subscriber, "registration refused by membership gate");
                    return RegisterOutcome::Rejected(RejectReason::NotEligible);
                }
            }
            Err(e) => {
                warn!(subscriber, error = %e, "membership check failed, admitting");
            }
        }

        self.bind(subscriber, raw_address).await
    }

    /// Register without consulting the membership gate
    pub async fn force_register(
        &self,
        subscriber: SubscriberId,
        display_name: &str,
        raw_address: &str,
    ) -> RegisterOutcome {
        if let Err(e) = self.store.ensure_subscriber(subscriber, display_name).await {
            return RegisterOutcome::Rejected(RejectReason::StoreError(e.to_string()));
        }
        info!(subscriber, "force registration, skipping membership gate");
        self.bind(subscriber, raw_address).await
    }

    async fn bind(&self, subscriber: SubscriberId, raw_address: &str) -> RegisterOutcome {
        match parse_address(raw_address) {
            Some(address) => self.registry.register(subscriber, address).await,
            None => RegisterOutcome::Rejected(RejectReason::InvalidAddress),
        }
    }

    pub async fn unregister(
        &self,
        subscriber: SubscriberId,
    ) -> Result<UnregisterOutcome, StoreError> {
        self.registry.unregister(subscriber).await
    }

    /// Status of `subscriber`, `None` if never seen
    pub async fn status(
        &self,
        subscriber: SubscriberId,
    ) -> Result<Option<SubscriberStatus>, StoreError> {
        let Some(record) = self.store.get_subscriber(subscriber).await? else {
            return Ok(None);
        };

        let address = record.wallet_address;
        let monitoring_active = address
            .map(|address| self.registry.lookup(&address) == Some(subscriber))
            .unwrap_or(false);
        let explorer_link = address.map(|address| self.format.address_link(&address));

        Ok(Some(SubscriberStatus {
            subscriber: record,
            address,
            monitoring_active,
            explorer_link,
        }))
    }
}
