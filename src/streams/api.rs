//! Public API for the stream engine
//!
//! External modules should import from here rather than from the individual
//! stream modules.

// Subscriptions and handlers
pub use crate::streams::registry::{HandlerBinding, HandlerFuture, HandlerRegistry};
pub use crate::streams::subscription::{Subscription, SubscriptionBuilder, SubscriptionKey};

// Engine and its parts
pub use crate::streams::connection::{ReadLoop, ReadTimings};
pub use crate::streams::context::StreamContext;
pub use crate::streams::engine::{RunningEngine, StreamEngine};
pub use crate::streams::group::{GroupEnsurer, GroupRecovery};
pub use crate::streams::health::{
    HealthMode, HealthState, HealthStateManager, HealthTimings, ProbeOutcome, RecoveryAction,
};
pub use crate::streams::publisher::EventPublisher;
pub use crate::streams::retry::{ReclaimPolicy, RetryProcessor, SweepReport};

// Broker abstraction
pub use crate::streams::broker::{BrokerResult, StreamBroker};
pub use crate::streams::entry::{EntryId, FieldMap, PendingEntry, StartOffset, StreamEntry};
pub use crate::streams::memory::{BrokerOp, InMemoryBroker, JournalRecord};

// Error handling
pub use crate::streams::error::{
    BrokerError, HandlerError, RegistryError, StreamError, StreamResult,
};
