//! Subscription model
//!
//! A subscription names a channel, the consumer group reading it, and the
//! delivery policy every handler bound to that pair shares.

use crate::streams::error::RegistryError;
use std::fmt;

/// Identity of a subscription: `(channel, consumer group)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub channel: String,
    pub consumer_group: String,
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.channel, self.consumer_group)
    }
}

/// Immutable description of one consumer-group read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    key: SubscriptionKey,
    batch_size: usize,
    blocking: bool,
    sequential_processing: bool,
    ack_on_failure: bool,
}

impl Subscription {
    /// Start building a subscription with the default policy
    ///
    /// Defaults: batch size 10, blocking reads, concurrent dispatch, failed
    /// entries left pending.
    pub fn builder(
        channel: impl Into<String>,
        consumer_group: impl Into<String>,
    ) -> SubscriptionBuilder {
        SubscriptionBuilder {
            channel: channel.into(),
            consumer_group: consumer_group.into(),
            batch_size: 10,
            blocking: true,
            sequential_processing: false,
            ack_on_failure: false,
        }
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn channel(&self) -> &str {
        &self.key.channel
    }

    pub fn consumer_group(&self) -> &str {
        &self.key.consumer_group
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn blocking(&self) -> bool {
        self.blocking
    }

    pub fn sequential_processing(&self) -> bool {
        self.sequential_processing
    }

    pub fn ack_on_failure(&self) -> bool {
        self.ack_on_failure
    }

    /// True when both subscriptions carry the same delivery policy
    pub(crate) fn same_policy(&self, other: &Subscription) -> bool {
        self.batch_size == other.batch_size
            && self.blocking == other.blocking
            && self.sequential_processing == other.sequential_processing
            && self.ack_on_failure == other.ack_on_failure
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.key.fmt(f)
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionBuilder {
    channel: String,
    consumer_group: String,
    batch_size: usize,
    blocking: bool,
    sequential_processing: bool,
    ack_on_failure: bool,
}

impl SubscriptionBuilder {
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn sequential(mut self, sequential: bool) -> Self {
        self.sequential_processing = sequential;
        self
    }

    pub fn ack_on_failure(mut self, ack_on_failure: bool) -> Self {
        self.ack_on_failure = ack_on_failure;
        self
    }

    pub fn build(self) -> Result<Subscription, RegistryError> {
        if self.channel.trim().is_empty() {
            return Err(RegistryError::InvalidSubscription(
                "channel must not be blank".to_string(),
            ));
        }
        if self.consumer_group.trim().is_empty() {
            return Err(RegistryError::InvalidSubscription(format!(
                "consumer group for channel '{}' must not be blank",
                self.channel
            )));
        }
        if self.batch_size == 0 {
            return Err(RegistryError::InvalidSubscription(format!(
                "batch size for '{}/{}' must be positive",
                self.channel, self.consumer_group
            )));
        }

        Ok(Subscription {
            key: SubscriptionKey {
                channel: self.channel,
                consumer_group: self.consumer_group,
            },
            batch_size: self.batch_size,
            blocking: self.blocking,
            sequential_processing: self.sequential_processing,
            ack_on_failure: self.ack_on_failure,
        })
    }
}
