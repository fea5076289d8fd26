//! Broker primitives the engine is built on
//!
//! Any at-least-once log broker with consumer groups can back the engine by
//! implementing [`StreamBroker`]. Implementations report failures through
//! [`BrokerError`] so the engine can tell an outage from a missing group.

use crate::streams::entry::{EntryId, FieldMap, PendingEntry, StartOffset, StreamEntry};
use crate::streams::error::BrokerError;
use async_trait::async_trait;
use std::time::Duration;

pub type BrokerResult<T> = Result<T, BrokerError>;

#[async_trait]
pub trait StreamBroker: Send + Sync {
    /// Create `group` on `channel`, creating the channel if needed
    ///
    /// Returns [`BrokerError::GroupExists`] if the group is already there.
    async fn create_group(
        &self,
        channel: &str,
        group: &str,
        start: StartOffset,
    ) -> BrokerResult<()>;

    /// Deliver up to `count` entries the group has not yet seen to `consumer`
    ///
    /// Waits up to `block` for new entries when none are available; a zero
    /// duration returns immediately. Delivered entries become pending for
    /// `consumer` until acknowledged.
    async fn read_group(
        &self,
        channel: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> BrokerResult<Vec<StreamEntry>>;

    /// Acknowledge entries, returning how many were pending
    async fn ack(&self, channel: &str, group: &str, ids: &[EntryId]) -> BrokerResult<u64>;

    /// Oldest `count` pending entries of the group
    async fn pending(
        &self,
        channel: &str,
        group: &str,
        count: usize,
    ) -> BrokerResult<Vec<PendingEntry>>;

    /// Reassign pending entries idle for at least `min_idle` to `consumer`
    ///
    /// Entries that are no longer pending or were delivered more recently are
    /// skipped. Claimed entries have their delivery count incremented.
    async fn claim(
        &self,
        channel: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> BrokerResult<Vec<StreamEntry>>;

    /// Append an entry and return its id
    async fn append(&self, channel: &str, fields: FieldMap) -> BrokerResult<EntryId>;

    /// Cheap liveness check
    async fn ping(&self) -> BrokerResult<()>;
}
