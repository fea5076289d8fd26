//! Retry and reclaim processor
//!
//! Periodically sweeps every subscription's pending entries. Entries left
//! idle long enough (their consumer crashed, or their handler failed without
//! acking) are claimed by a dedicated retrier consumer and redelivered to
//! their handler. Entries delivered more than `max_delivery_count` times are
//! copied to the dead-letter channel and acknowledged there instead.

use crate::core::config::EngineConfig;
use crate::core::shutdown::wait_for_shutdown;
use crate::streams::context::StreamContext;
use crate::streams::entry::{EntryId, PendingEntry, StreamEntry};
use crate::streams::error::StreamError;
use crate::streams::subscription::Subscription;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimPolicy {
    pub sweep_interval: Duration,
    pub min_idle: Duration,
    pub max_delivery_count: u64,
    pub fetch_count: usize,
    pub dead_letter_channel: String,
    pub retrier_consumer: String,
}

impl From<&EngineConfig> for ReclaimPolicy {
    fn from(config: &EngineConfig) -> Self {
        Self {
            sweep_interval: config.sweep_interval(),
            min_idle: config.min_idle(),
            max_delivery_count: config.retry.max_delivery_count,
            fetch_count: config.retry.fetch_count,
            dead_letter_channel: config.retry.dead_letter_channel.clone(),
            retrier_consumer: config.retry.retrier_consumer.clone(),
        }
    }
}

/// What one sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub claimed: usize,
    pub redelivered: usize,
    pub dead_lettered: usize,
    /// Malformed or unbound entries acknowledged without handling
    pub dropped: usize,
    /// Handler or dead-letter failures; those entries stay pending
    pub failed: usize,
    /// Another sweep was already running
    pub skipped: bool,
}

impl SweepReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.claimed == 0 && self.dropped == 0 && self.failed == 0
    }
}

impl fmt::Display for SweepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.skipped {
            return write!(f, "skipped (sweep already running)");
        }
        write!(
            f,
            "claimed={} redelivered={} dead_lettered={} dropped={} failed={}",
            self.claimed, self.redelivered, self.dead_lettered, self.dropped, self.failed
        )
    }
}

/// Clears the re-entrancy flag when a sweep ends, however it ends
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct RetryProcessor {
    context: StreamContext,
    policy: ReclaimPolicy,
    sweeping: AtomicBool,
}

impl RetryProcessor {
    pub fn new(context: StreamContext, policy: ReclaimPolicy) -> Self {
        Self {
            context,
            policy,
            sweeping: AtomicBool::new(false),
        }
    }

    pub fn policy(&self) -> &ReclaimPolicy {
        &self.policy
    }

    /// Sweep on a fixed interval until shutdown
    ///
    /// The first sweep runs one interval after start. Ticks missed while a
    /// sweep overran are skipped rather than replayed.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let period = self.policy.sweep_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Retry scheduler started (every {:?})", period);

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
        info!("Retry scheduler stopped");
    }

    /// Reclaim, redeliver or dead-letter idle pending entries of every subscription
    pub async fn sweep(&self) -> SweepReport {
        if self.sweeping.swap(true, Ordering::AcqRel) {
            debug!("Retry sweep already running; skipping");
            return SweepReport::skipped();
        }
        let _guard = SweepGuard(&self.sweeping);

        let mut report = SweepReport::default();
        for subscription in self.context.registry.subscriptions() {
            self.sweep_subscription(subscription, &mut report).await;
        }

        if report.is_empty() {
            debug!("Retry sweep finished: {}", report);
        } else {
            info!("Retry sweep finished: {}", report);
        }
        report
    }

    async fn sweep_subscription(&self, subscription: &Subscription, report: &mut SweepReport) {
        let broker = &self.context.broker;
        let channel = subscription.channel();
        let group = subscription.consumer_group();

        let pending = match self
            .context
            .health
            .run_safe(|| broker.pending(channel, group, self.policy.fetch_count))
            .await
        {
            Ok(pending) => pending,
            Err(e) => {
                self.log_skipped(subscription, "list pending entries", &e);
                return;
            }
        };

        let mut idle: Vec<PendingEntry> = pending
            .into_iter()
            .filter(|entry| entry.idle >= self.policy.min_idle)
            .collect();
        idle.sort_by_key(|entry| entry.id);
        idle.truncate(self.policy.fetch_count);
        if idle.is_empty() {
            return;
        }

        let delivery_counts: HashMap<EntryId, u64> = idle
            .iter()
            .map(|entry| (entry.id, entry.delivery_count))
            .collect();
        let ids: Vec<EntryId> = idle.iter().map(|entry| entry.id).collect();

        let claimed = match self
            .context
            .health
            .run_safe(|| {
                broker.claim(
                    channel,
                    group,
                    &self.policy.retrier_consumer,
                    self.policy.min_idle,
                    &ids,
                )
            })
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                self.log_skipped(subscription, "claim idle entries", &e);
                return;
            }
        };

        debug!(
            "Claimed {} of {} idle entries on {}",
            claimed.len(),
            ids.len(),
            subscription
        );
        report.claimed += claimed.len();

        for entry in claimed {
            let delivery_count = delivery_counts.get(&entry.id).copied().unwrap_or(1);
            self.reprocess(subscription, entry, delivery_count, report)
                .await;
        }
    }

    async fn reprocess(
        &self,
        subscription: &Subscription,
        entry: StreamEntry,
        delivery_count: u64,
        report: &mut SweepReport,
    ) {
        let Some((event_type, payload)) = entry.routable() else {
            warn!(
                "Dropping malformed pending entry {} on {}",
                entry.id, subscription
            );
            self.ack(subscription, entry.id).await;
            report.dropped += 1;
            return;
        };

        let Some(binding) = self
            .context
            .registry
            .lookup(subscription.key(), event_type)
        else {
            warn!(
                "No handler for '{}' on {}; dropping pending entry {}",
                event_type, subscription, entry.id
            );
            self.ack(subscription, entry.id).await;
            report.dropped += 1;
            return;
        };

        if delivery_count > self.policy.max_delivery_count {
            self.dead_letter(subscription, &entry, delivery_count, report)
                .await;
            return;
        }

        match binding.invoke(payload).await {
            Ok(()) => {
                debug!(
                    "Redelivered {} on {} (delivery {})",
                    entry.id, subscription, delivery_count
                );
                self.ack(subscription, entry.id).await;
                report.redelivered += 1;
            }
            Err(e) => {
                error!(
                    "Handler for '{}' failed again on entry {} of {} (delivery {}): {}",
                    event_type, entry.id, subscription, delivery_count, e
                );
                report.failed += 1;
            }
        }
    }

    async fn dead_letter(
        &self,
        subscription: &Subscription,
        entry: &StreamEntry,
        delivery_count: u64,
        report: &mut SweepReport,
    ) {
        let dead_letter_channel = &self.policy.dead_letter_channel;
        let fields = entry.dead_letter_fields(
            subscription.channel(),
            subscription.consumer_group(),
            delivery_count,
        );

        match self
            .context
            .health
            .run_safe(|| self.context.broker.append(dead_letter_channel, fields))
            .await
        {
            Ok(dead_letter_id) => {
                warn!(
                    "Dead-lettered entry {} of {} after {} deliveries as {} on '{}'",
                    entry.id, subscription, delivery_count, dead_letter_id, dead_letter_channel
                );
                self.ack(subscription, entry.id).await;
                report.dead_lettered += 1;
            }
            Err(e) => {
                error!(
                    "Could not dead-letter entry {} of {}; it stays pending: {}",
                    entry.id, subscription, e
                );
                report.failed += 1;
            }
        }
    }

    async fn ack(&self, subscription: &Subscription, id: EntryId) {
        let ids = [id];
        let result = self
            .context
            .health
            .run_safe(|| {
                self.context.broker.ack(
                    subscription.channel(),
                    subscription.consumer_group(),
                    &ids,
                )
            })
            .await;
        if let Err(e) = result {
            warn!("Failed to ack {} on {}: {}", id, subscription, e);
        }
    }

    fn log_skipped(&self, subscription: &Subscription, step: &str, error: &StreamError) {
        match error {
            StreamError::Degraded => {
                debug!("Broker degraded; skipping retry sweep of {}", subscription)
            }
            e => warn!("Could not {} on {}: {}", step, subscription, e),
        }
    }
}
