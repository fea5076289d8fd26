//! Embedded in-process broker
//!
//! Implements the full consumer-group contract over in-memory logs: ordered
//! per-channel entries, a delivery cursor and pending-entries list per group,
//! delivery counts and idle times. Idle time follows tokio's clock so
//! paused-time tests can age pending entries deterministically.
//!
//! Fault injection (`set_unreachable`, `fail_appends_to`, `drop_group`) and
//! the operation journal exist so outage behaviour can be exercised without
//! a real network.
//!
//! Memory stays bounded for a long-running daemon: the journal keeps only the
//! most recent records (per-operation counts are kept separately), and once a
//! channel has consumer groups, entries every group has moved past and
//! acknowledged are dropped. Channels without groups keep their most recent
//! entries up to a fixed length.

use crate::core::sync::lock_recovering;
use crate::streams::broker::{BrokerResult, StreamBroker};
use crate::streams::entry::{EntryId, FieldMap, PendingEntry, StartOffset, StreamEntry};
use crate::streams::error::BrokerError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Broker operations, as recorded in the journal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerOp {
    CreateGroup,
    Read,
    Ack,
    Pending,
    Claim,
    Append,
    Ping,
}

/// One journal line: which operation ran, when, and whether it succeeded
#[derive(Debug, Clone)]
pub struct JournalRecord {
    pub op: BrokerOp,
    pub channel: Option<String>,
    pub at: Instant,
    pub ok: bool,
}

#[derive(Debug)]
struct Delivery {
    consumer: String,
    delivery_count: u64,
    last_delivered: Instant,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Last id handed out to this group; `None` means nothing delivered yet
    cursor: Option<EntryId>,
    pending: BTreeMap<EntryId, Delivery>,
}

#[derive(Debug, Default)]
struct ChannelLog {
    entries: BTreeMap<EntryId, FieldMap>,
    last_id: Option<EntryId>,
    groups: HashMap<String, GroupState>,
}

impl ChannelLog {
    /// Drop entries that every group has been handed and acknowledged
    fn trim_consumed(&mut self) {
        if self.groups.is_empty() {
            return;
        }
        let mut floor: Option<EntryId> = None;
        for state in self.groups.values() {
            let Some(cursor) = state.cursor else {
                return;
            };
            floor = Some(floor.map_or(cursor, |f| f.min(cursor)));
        }
        let Some(floor) = floor else {
            return;
        };
        let consumed: Vec<EntryId> = self
            .entries
            .range(..=floor)
            .map(|(id, _)| *id)
            .filter(|id| {
                self.groups
                    .values()
                    .all(|state| !state.pending.contains_key(id))
            })
            .collect();
        for id in consumed {
            self.entries.remove(&id);
        }
    }

    fn group_mut(&mut self, channel: &str, group: &str) -> BrokerResult<&mut GroupState> {
        self.groups
            .get_mut(group)
            .ok_or_else(|| no_group(channel, group))
    }
}

#[derive(Debug, Default)]
struct Faults {
    unreachable: bool,
    failing_appends: HashSet<String>,
}

/// Records kept by the journal unless a different limit is asked for
pub const JOURNAL_LIMIT: usize = 10_000;

/// Entries kept per channel that has no consumer group
pub const UNGROUPED_ENTRY_LIMIT: usize = 10_000;

#[derive(Debug)]
struct Journal {
    records: VecDeque<JournalRecord>,
    counts: HashMap<BrokerOp, usize>,
    limit: usize,
}

impl Journal {
    fn new(limit: usize) -> Self {
        Self {
            records: VecDeque::new(),
            counts: HashMap::new(),
            limit,
        }
    }

    fn record(&mut self, record: JournalRecord) {
        *self.counts.entry(record.op).or_default() += 1;
        if self.limit == 0 {
            return;
        }
        while self.records.len() >= self.limit {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }
}

#[derive(Debug)]
pub struct InMemoryBroker {
    channels: Mutex<HashMap<String, ChannelLog>>,
    faults: Mutex<Faults>,
    journal: Mutex<Journal>,
    ungrouped_limit: usize,
    appended: Notify,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn no_group(channel: &str, group: &str) -> BrokerError {
    BrokerError::NoGroup(format!(
        "No such key '{}' or consumer group '{}'",
        channel, group
    ))
}

fn wall_clock_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_journal_limit(JOURNAL_LIMIT)
    }

    /// Keep at most `limit` journal records; older ones are discarded first
    pub fn with_journal_limit(limit: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
            journal: Mutex::new(Journal::new(limit)),
            ungrouped_limit: UNGROUPED_ENTRY_LIMIT,
            appended: Notify::new(),
        }
    }

    /// Keep at most `limit` entries on channels nobody consumes as a group
    pub fn with_ungrouped_entry_limit(mut self, limit: usize) -> Self {
        self.ungrouped_limit = limit.max(1);
        self
    }

    /// Make every operation fail with a connection-refused error until cleared
    pub fn set_unreachable(&self, unreachable: bool) {
        lock_recovering(&self.faults, "broker faults").unreachable = unreachable;
        if unreachable {
            // wake blocked readers so they observe the outage
            self.appended.notify_waiters();
        }
    }

    /// Make appends to `channel` fail (or succeed again) without affecting other calls
    pub fn fail_appends_to(&self, channel: &str, failing: bool) {
        let mut faults = lock_recovering(&self.faults, "broker faults");
        if failing {
            faults.failing_appends.insert(channel.to_string());
        } else {
            faults.failing_appends.remove(channel);
        }
    }

    /// Forget a consumer group, as a broker restart without persistence would
    pub fn drop_group(&self, channel: &str, group: &str) -> bool {
        let mut channels = lock_recovering(&self.channels, "broker channels");
        let Some(log) = channels.get_mut(channel) else {
            return false;
        };
        let dropped = log.groups.remove(group).is_some();
        log.trim_consumed();
        dropped
    }

    /// Entries of a channel still held, in append order
    pub fn entries(&self, channel: &str) -> Vec<StreamEntry> {
        lock_recovering(&self.channels, "broker channels")
            .get(channel)
            .map(|log| {
                log.entries
                    .iter()
                    .map(|(id, fields)| StreamEntry::new(*id, fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Ids currently pending for a group, oldest first
    pub fn pending_ids(&self, channel: &str, group: &str) -> Vec<EntryId> {
        lock_recovering(&self.channels, "broker channels")
            .get(channel)
            .and_then(|log| log.groups.get(group))
            .map(|state| state.pending.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_group(&self, channel: &str, group: &str) -> bool {
        lock_recovering(&self.channels, "broker channels")
            .get(channel)
            .map(|log| log.groups.contains_key(group))
            .unwrap_or(false)
    }

    /// Most recent journal records, oldest first
    pub fn journal(&self) -> Vec<JournalRecord> {
        lock_recovering(&self.journal, "broker journal")
            .records
            .iter()
            .cloned()
            .collect()
    }

    /// Number of attempts of `op`, successful or not, since the broker was created
    pub fn op_count(&self, op: BrokerOp) -> usize {
        lock_recovering(&self.journal, "broker journal")
            .counts
            .get(&op)
            .copied()
            .unwrap_or(0)
    }

    /// Fail fast when an outage is being simulated; journal the attempt either way
    fn begin(&self, op: BrokerOp, channel: Option<&str>) -> BrokerResult<()> {
        let faults = lock_recovering(&self.faults, "broker faults");
        let failing = faults.unreachable
            || (op == BrokerOp::Append
                && channel.is_some_and(|c| faults.failing_appends.contains(c)));
        drop(faults);

        lock_recovering(&self.journal, "broker journal").record(JournalRecord {
            op,
            channel: channel.map(str::to_string),
            at: Instant::now(),
            ok: !failing,
        });

        if !failing {
            return Ok(());
        }
        if op == BrokerOp::Append && !self.is_unreachable() {
            return Err(BrokerError::Rejected(format!(
                "append to '{}' refused",
                channel.unwrap_or_default()
            )));
        }
        Err(BrokerError::Unreachable(
            "Connection refused (os error 111)".to_string(),
        ))
    }

    fn is_unreachable(&self) -> bool {
        lock_recovering(&self.faults, "broker faults").unreachable
    }

    fn deliver(
        &self,
        channel: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> BrokerResult<Vec<StreamEntry>> {
        let mut channels = lock_recovering(&self.channels, "broker channels");
        let log = channels
            .get_mut(channel)
            .ok_or_else(|| no_group(channel, group))?;
        if !log.groups.contains_key(group) {
            return Err(no_group(channel, group));
        }

        let cursor = log.groups.get(group).and_then(|state| state.cursor);
        let batch: Vec<StreamEntry> = log
            .entries
            .iter()
            .filter(|(id, _)| cursor.map_or(true, |c| **id > c))
            .take(count)
            .map(|(id, fields)| StreamEntry::new(*id, fields.clone()))
            .collect();

        let state = log.group_mut(channel, group)?;
        let now = Instant::now();
        for entry in &batch {
            state.cursor = Some(entry.id);
            state.pending.insert(
                entry.id,
                Delivery {
                    consumer: consumer.to_string(),
                    delivery_count: 1,
                    last_delivered: now,
                },
            );
        }
        Ok(batch)
    }
}

#[async_trait]
impl StreamBroker for InMemoryBroker {
    async fn create_group(
        &self,
        channel: &str,
        group: &str,
        start: StartOffset,
    ) -> BrokerResult<()> {
        self.begin(BrokerOp::CreateGroup, Some(channel))?;
        let mut channels = lock_recovering(&self.channels, "broker channels");
        let log = channels.entry(channel.to_string()).or_default();
        if log.groups.contains_key(group) {
            return Err(BrokerError::GroupExists(format!(
                "Consumer group '{}' already exists on '{}'",
                group, channel
            )));
        }
        let cursor = match start {
            StartOffset::Beginning => None,
            StartOffset::Tail => log.last_id,
        };
        log.groups.insert(
            group.to_string(),
            GroupState {
                cursor,
                pending: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn read_group(
        &self,
        channel: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> BrokerResult<Vec<StreamEntry>> {
        self.begin(BrokerOp::Read, Some(channel))?;
        let deadline = Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_unreachable() {
                return Err(BrokerError::Unreachable(
                    "Connection reset by peer".to_string(),
                ));
            }
            let batch = self.deliver(channel, group, consumer, count)?;
            if !batch.is_empty() || Instant::now() >= deadline {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, channel: &str, group: &str, ids: &[EntryId]) -> BrokerResult<u64> {
        self.begin(BrokerOp::Ack, Some(channel))?;
        let mut channels = lock_recovering(&self.channels, "broker channels");
        let log = channels
            .get_mut(channel)
            .ok_or_else(|| no_group(channel, group))?;
        let state = log.group_mut(channel, group)?;
        let acked = ids
            .iter()
            .filter(|id| state.pending.remove(id).is_some())
            .count() as u64;
        if acked > 0 {
            log.trim_consumed();
        }
        Ok(acked)
    }

    async fn pending(
        &self,
        channel: &str,
        group: &str,
        count: usize,
    ) -> BrokerResult<Vec<PendingEntry>> {
        self.begin(BrokerOp::Pending, Some(channel))?;
        let mut channels = lock_recovering(&self.channels, "broker channels");
        let state = channels
            .get_mut(channel)
            .ok_or_else(|| no_group(channel, group))?
            .group_mut(channel, group)?;
        let now = Instant::now();
        Ok(state
            .pending
            .iter()
            .take(count)
            .map(|(id, delivery)| PendingEntry {
                id: *id,
                consumer: delivery.consumer.clone(),
                delivery_count: delivery.delivery_count,
                idle: now.saturating_duration_since(delivery.last_delivered),
            })
            .collect())
    }

    async fn claim(
        &self,
        channel: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> BrokerResult<Vec<StreamEntry>> {
        self.begin(BrokerOp::Claim, Some(channel))?;
        let mut channels = lock_recovering(&self.channels, "broker channels");
        let log = channels
            .get_mut(channel)
            .ok_or_else(|| no_group(channel, group))?;
        if !log.groups.contains_key(group) {
            return Err(no_group(channel, group));
        }

        let now = Instant::now();
        let mut claimed = Vec::new();
        for id in ids {
            let Some(fields) = log.entries.get(id).cloned() else {
                continue;
            };
            let state = log.group_mut(channel, group)?;
            if let Some(delivery) = state.pending.get_mut(id) {
                if now.saturating_duration_since(delivery.last_delivered) < min_idle {
                    continue;
                }
                delivery.consumer = consumer.to_string();
                delivery.delivery_count += 1;
                delivery.last_delivered = now;
                claimed.push(StreamEntry::new(*id, fields));
            }
        }
        Ok(claimed)
    }

    async fn append(&self, channel: &str, fields: FieldMap) -> BrokerResult<EntryId> {
        self.begin(BrokerOp::Append, Some(channel))?;
        let id = {
            let mut channels = lock_recovering(&self.channels, "broker channels");
            let log = channels.entry(channel.to_string()).or_default();
            let now = wall_clock_millis();
            let id = match log.last_id {
                Some(last) => last.next_after(now),
                None => EntryId::new(now, 0),
            };
            log.entries.insert(id, fields);
            log.last_id = Some(id);
            if log.groups.is_empty() {
                while log.entries.len() > self.ungrouped_limit {
                    log.entries.pop_first();
                }
            }
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn ping(&self) -> BrokerResult<()> {
        self.begin(BrokerOp::Ping, None)
    }
}
