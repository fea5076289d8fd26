//! Consumer group ensurer
//!
//! Creates each subscription's consumer group at most once per process
//! lifetime, and again after the broker may have lost it (outage recovery or
//! a NOGROUP read).
//!
//! The ensurer talks to the broker directly. Callers outside recovery go
//! through [`HealthStateManager::run_safe`](crate::streams::health::HealthStateManager::run_safe)
//! so a degraded broker is not contacted; the recovery action runs after a
//! successful probe and calls the ensurer as is.

use crate::core::sync::lock_recovering;
use crate::streams::broker::{BrokerResult, StreamBroker};
use crate::streams::entry::StartOffset;
use crate::streams::error::{BrokerError, StreamResult};
use crate::streams::health::RecoveryAction;
use crate::streams::subscription::{Subscription, SubscriptionKey};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

pub struct GroupEnsurer {
    broker: Arc<dyn StreamBroker>,
    ensured: Mutex<HashSet<SubscriptionKey>>,
}

impl GroupEnsurer {
    pub fn new(broker: Arc<dyn StreamBroker>) -> Self {
        Self {
            broker,
            ensured: Mutex::new(HashSet::new()),
        }
    }

    /// Make sure the subscription's group exists
    ///
    /// Groups start at the beginning of the channel so entries appended
    /// before the first read are not missed. An existing group is success.
    pub async fn ensure(&self, subscription: &Subscription) -> BrokerResult<()> {
        if self.is_ensured(subscription.key()) {
            return Ok(());
        }

        match self
            .broker
            .create_group(
                subscription.channel(),
                subscription.consumer_group(),
                StartOffset::Beginning,
            )
            .await
        {
            Ok(()) => {
                log::info!("Created consumer group {}", subscription);
            }
            Err(BrokerError::GroupExists(_)) => {
                log::debug!("Consumer group {} already exists", subscription);
            }
            Err(e) => {
                log::warn!("Could not ensure consumer group {}: {}", subscription, e);
                return Err(e);
            }
        }

        lock_recovering(&self.ensured, "ensured groups").insert(subscription.key().clone());
        Ok(())
    }

    /// Forget that the group was ensured, then ensure it again
    pub async fn ensure_for_recovery(&self, subscription: &Subscription) -> BrokerResult<()> {
        lock_recovering(&self.ensured, "ensured groups").remove(subscription.key());
        self.ensure(subscription).await
    }

    /// Re-ensure every subscription, stopping at the first failure
    pub async fn ensure_all_for_recovery(&self, subscriptions: &[Subscription]) -> StreamResult<()> {
        for subscription in subscriptions {
            self.ensure_for_recovery(subscription).await?;
        }
        Ok(())
    }

    pub fn is_ensured(&self, key: &SubscriptionKey) -> bool {
        lock_recovering(&self.ensured, "ensured groups").contains(key)
    }
}

/// Recovery action re-creating every known group after an outage
pub struct GroupRecovery {
    ensurer: Arc<GroupEnsurer>,
    subscriptions: Vec<Subscription>,
}

impl GroupRecovery {
    pub fn new(ensurer: Arc<GroupEnsurer>, subscriptions: Vec<Subscription>) -> Self {
        Self {
            ensurer,
            subscriptions,
        }
    }
}

#[async_trait]
impl RecoveryAction for GroupRecovery {
    fn name(&self) -> &str {
        "re-ensure consumer groups"
    }

    async fn recover(&self) -> StreamResult<()> {
        self.ensurer
            .ensure_all_for_recovery(&self.subscriptions)
            .await
    }
}
