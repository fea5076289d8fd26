//! Per-subscription read loop
//!
//! Each distinct `(channel, consumer group)` gets one long-lived loop with its
//! own consumer name. The loop pulls batches while the broker is healthy,
//! dispatches entries to their bindings and acknowledges them; while the
//! broker is degraded it waits in short slices and probes when due.
//!
//! Nothing that goes wrong while reading or handling ends the loop. Only a
//! shutdown broadcast does, and in-flight concurrent dispatches are awaited
//! before the loop returns.

use crate::core::config::EngineConfig;
use crate::core::shutdown::wait_for_shutdown;
use crate::streams::broker::StreamBroker;
use crate::streams::context::StreamContext;
use crate::streams::entry::{EntryId, StreamEntry};
use crate::streams::error::{BrokerError, HandlerError};
use crate::streams::health::{HealthStateManager, ProbeOutcome};
use crate::streams::subscription::Subscription;
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadTimings {
    pub block: Duration,
    pub idle_sleep: Duration,
    pub error_retry_delay: Duration,
    pub nogroup_retry_delay: Duration,
}

impl From<&EngineConfig> for ReadTimings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            block: config.read_block(),
            idle_sleep: config.idle_sleep(),
            error_retry_delay: config.error_retry_delay(),
            nogroup_retry_delay: config.nogroup_retry_delay(),
        }
    }
}

/// `<prefix>-<random>` consumer name, unique per loop
pub fn consumer_name(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
}

/// Acknowledges entries for one subscription on behalf of the loop and its
/// dispatch tasks
#[derive(Clone)]
struct Acknowledger {
    broker: Arc<dyn StreamBroker>,
    health: Arc<HealthStateManager>,
    subscription: Subscription,
}

impl Acknowledger {
    async fn ack(&self, id: EntryId) {
        match self
            .broker
            .ack(
                self.subscription.channel(),
                self.subscription.consumer_group(),
                &[id],
            )
            .await
        {
            Ok(_) => trace!("Acked {} on {}", id, self.subscription),
            Err(e) => {
                if e.is_unreachable() {
                    self.health.enter_degraded();
                }
                warn!(
                    "Failed to ack {} on {}; it stays pending: {}",
                    id, self.subscription, e
                );
            }
        }
    }

    /// Ack after a handler ran, honouring the subscription's failure policy
    async fn settle(&self, id: EntryId, event_type: &str, outcome: Result<(), HandlerError>) {
        match outcome {
            Ok(()) => self.ack(id).await,
            Err(e) => {
                error!(
                    "Handler for '{}' failed on entry {} of {}: {}",
                    event_type, id, self.subscription, e
                );
                if self.subscription.ack_on_failure() {
                    self.ack(id).await;
                }
            }
        }
    }
}

pub struct ReadLoop {
    subscription: Subscription,
    consumer: String,
    context: StreamContext,
    timings: ReadTimings,
    acknowledger: Acknowledger,
    in_flight: JoinSet<()>,
}

impl ReadLoop {
    pub fn new(
        subscription: Subscription,
        consumer: String,
        context: StreamContext,
        timings: ReadTimings,
    ) -> Self {
        let acknowledger = Acknowledger {
            broker: context.broker.clone(),
            health: context.health.clone(),
            subscription: subscription.clone(),
        };
        Self {
            subscription,
            consumer,
            context,
            timings,
            acknowledger,
            in_flight: JoinSet::new(),
        }
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Run until shutdown is broadcast
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "Read loop started for {} as consumer '{}'",
            self.subscription, self.consumer
        );

        loop {
            self.reap_finished();

            if self.context.health.is_degraded() {
                if let Some(wait) = self.context.health.should_wait_before_probe() {
                    if self.pause(wait, &mut shutdown_rx).await {
                        break;
                    }
                    continue;
                }
                match self.context.health.attempt_recovery().await {
                    ProbeOutcome::Recovered | ProbeOutcome::AlreadyActive => {}
                    ProbeOutcome::NotDue(_) | ProbeOutcome::StillDegraded => continue,
                }
            }

            let block = if self.subscription.blocking() {
                self.timings.block
            } else {
                Duration::ZERO
            };
            let read = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
                result = self.context.broker.read_group(
                    self.subscription.channel(),
                    self.subscription.consumer_group(),
                    &self.consumer,
                    self.subscription.batch_size(),
                    block,
                ) => result,
            };

            let stop = match read {
                Ok(batch) if batch.is_empty() => {
                    self.pause(self.timings.idle_sleep, &mut shutdown_rx).await
                }
                Ok(batch) => {
                    debug!(
                        "Read {} entries from {} as '{}'",
                        batch.len(),
                        self.subscription,
                        self.consumer
                    );
                    for entry in batch {
                        self.process(entry).await;
                    }
                    false
                }
                Err(e) => self.handle_read_error(e, &mut shutdown_rx).await,
            };
            if stop {
                break;
            }
        }

        self.drain().await;
        info!("Read loop for {} stopped", self.subscription);
    }

    async fn handle_read_error(
        &self,
        error: BrokerError,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> bool {
        match error {
            BrokerError::NoGroup(_) => {
                warn!(
                    "Consumer group {} is missing; re-creating it",
                    self.subscription
                );
                let ensurer = &self.context.ensurer;
                let subscription = &self.subscription;
                if let Err(e) = self
                    .context
                    .health
                    .run_safe(|| ensurer.ensure_for_recovery(subscription))
                    .await
                {
                    debug!("Re-creating consumer group {} failed: {}", subscription, e);
                }
                self.pause(self.timings.nogroup_retry_delay, shutdown_rx)
                    .await
            }
            e if e.is_unreachable() => {
                debug!("Read on {} failed: {}", self.subscription, e);
                self.context.health.enter_degraded();
                false
            }
            e => {
                warn!("Read on {} failed: {}", self.subscription, e);
                self.pause(self.timings.error_retry_delay, shutdown_rx)
                    .await
            }
        }
    }

    async fn process(&mut self, entry: StreamEntry) {
        let Some((event_type, payload)) = entry.routable() else {
            warn!(
                "Dropping malformed entry {} on {}: missing type or payload",
                entry.id, self.subscription
            );
            self.acknowledger.ack(entry.id).await;
            return;
        };

        let Some(binding) = self
            .context
            .registry
            .lookup(self.subscription.key(), event_type)
        else {
            warn!(
                "No handler for '{}' on {}; dropping entry {}",
                event_type, self.subscription, entry.id
            );
            self.acknowledger.ack(entry.id).await;
            return;
        };

        let id = entry.id;
        let event_type = event_type.to_string();
        let handling = binding.invoke(payload);

        if self.subscription.sequential_processing() {
            let outcome = handling.await;
            self.acknowledger.settle(id, &event_type, outcome).await;
        } else {
            let acknowledger = self.acknowledger.clone();
            self.in_flight.spawn(async move {
                let outcome = handling.await;
                acknowledger.settle(id, &event_type, outcome).await;
            });
        }
    }

    fn reap_finished(&mut self) {
        while let Some(result) = self.in_flight.try_join_next() {
            self.log_dispatch_result(result);
        }
    }

    async fn drain(&mut self) {
        if !self.in_flight.is_empty() {
            debug!(
                "Waiting for {} in-flight dispatches on {}",
                self.in_flight.len(),
                self.subscription
            );
        }
        while let Some(result) = self.in_flight.join_next().await {
            self.log_dispatch_result(result);
        }
    }

    fn log_dispatch_result(&self, result: Result<(), tokio::task::JoinError>) {
        if let Err(e) = result {
            if e.is_panic() {
                error!("Handler task on {} panicked: {}", self.subscription, e);
            } else {
                warn!("Handler task on {} was cancelled: {}", self.subscription, e);
            }
        }
    }

    /// Sleep for `duration`; true when shutdown arrived first
    async fn pause(&self, duration: Duration, shutdown_rx: &mut broadcast::Receiver<()>) -> bool {
        tokio::select! {
            _ = wait_for_shutdown(shutdown_rx) => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }
}
