//! Periodic heartbeat events
//!
//! Publishes a `streamgate.heartbeat` event on a fixed interval. A publish
//! that is still in flight when the next tick arrives is not duplicated; the
//! tick is skipped instead.

use crate::core::config::HeartbeatSettings;
use crate::core::shutdown::wait_for_shutdown;
use crate::flight::SingleFlight;
use crate::streams::api::EventPublisher;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

pub const HEARTBEAT_EVENT: &str = "streamgate.heartbeat";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeartbeatPayload {
    pub sequence: u64,
    pub sent_at: String,
    pub version: String,
}

pub struct Heartbeat {
    publisher: EventPublisher,
    channel: String,
    interval: Duration,
    flight: SingleFlight<String>,
    sequence: Arc<AtomicU64>,
}

impl Heartbeat {
    pub fn new(publisher: EventPublisher, settings: &HeartbeatSettings) -> Self {
        Self {
            publisher,
            channel: settings.channel.clone(),
            interval: Duration::from_millis(settings.interval_ms),
            flight: SingleFlight::new(),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of heartbeats handed to the publisher so far
    pub fn sent(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }

    /// Start one publish unless the previous one is still running
    pub fn beat(&self) -> Option<tokio::task::JoinHandle<()>> {
        let publisher = self.publisher.clone();
        let channel = self.channel.clone();
        let sequence = self.sequence.clone();
        self.flight
            .launch_if_absent(format!("heartbeat:{}", self.channel), async move {
                let payload = HeartbeatPayload {
                    sequence: sequence.fetch_add(1, Ordering::Relaxed) + 1,
                    sent_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                };
                match publisher.publish(&channel, HEARTBEAT_EVENT, &payload).await {
                    Some(_) => Ok(()),
                    None => Err(format!("heartbeat {} was not published", payload.sequence)),
                }
            })
    }

    /// Beat every interval until shutdown
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        log::debug!(
            "Heartbeat publishing to '{}' every {:?}",
            self.channel,
            self.interval
        );

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown_rx) => {
                    log::debug!("Heartbeat stopping after {} beat(s)", self.sent());
                    break;
                }
                _ = ticker.tick() => {
                    if self.beat().is_none() {
                        log::debug!("Previous heartbeat still in flight; skipping tick");
                    }
                }
            }
        }
    }
}
