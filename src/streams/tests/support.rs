//! Shared fixtures for stream engine tests

use crate::core::config::EngineConfig;
use crate::core::sync::lock_recovering;
use crate::core::time::TokioClock;
use crate::streams::api::*;
use crate::streams::entry::{FIELD_EVENT_ID, FIELD_PAYLOAD, FIELD_TYPE};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) const CHANNEL: &str = "posts";
pub(crate) const GROUP: &str = "feed";
pub(crate) const EVENT: &str = "post.created";

/// Default breaker timings with short read timings
pub(crate) fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.read.block_ms = 200;
    config.read.idle_sleep_ms = 50;
    config.read.error_retry_delay_ms = 100;
    config.read.nogroup_retry_delay_ms = 50;
    config.retry.min_idle_ms = 1_000;
    config.startup.ensure_retry_delay_ms = 10;
    config
}

pub(crate) fn feed() -> Subscription {
    Subscription::builder(CHANNEL, GROUP)
        .build()
        .expect("valid subscription")
}

/// Records every payload a handler saw; can be told to fail or to take time
#[derive(Clone, Default)]
pub(crate) struct Recorder {
    seen: Arc<Mutex<Vec<serde_json::Value>>>,
    started: Arc<AtomicUsize>,
    failing: Arc<std::sync::atomic::AtomicBool>,
    delay: Arc<Mutex<Option<Duration>>>,
}

impl Recorder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn failing() -> Self {
        let recorder = Self::default();
        recorder.set_failing(true);
        recorder
    }

    pub(crate) fn with_delay(delay: Duration) -> Self {
        let recorder = Self::default();
        *lock_recovering(&recorder.delay, "recorder delay") = Some(delay);
        recorder
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn seen(&self) -> Vec<serde_json::Value> {
        lock_recovering(&self.seen, "recorder").clone()
    }

    pub(crate) fn count(&self) -> usize {
        lock_recovering(&self.seen, "recorder").len()
    }

    /// Handler invocations, including ones still running or failing
    pub(crate) fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub(crate) fn binding(&self, subscription: Subscription, event_type: &str) -> HandlerBinding {
        let recorder = self.clone();
        HandlerBinding::typed(subscription, event_type, move |value: serde_json::Value| {
            let recorder = recorder.clone();
            async move {
                recorder.started.fetch_add(1, Ordering::SeqCst);
                let delay = *lock_recovering(&recorder.delay, "recorder delay");
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if recorder.failing.load(Ordering::SeqCst) {
                    return Err(HandlerError::failed("recorder told to fail"));
                }
                lock_recovering(&recorder.seen, "recorder").push(value);
                Ok(())
            }
        })
    }
}

/// Engine parts wired the way `StreamEngine` wires them
pub(crate) struct Harness {
    pub broker: Arc<InMemoryBroker>,
    pub context: StreamContext,
    pub config: EngineConfig,
}

impl Harness {
    pub(crate) fn new(registry: HandlerRegistry) -> Self {
        Self::with_config(registry, test_config())
    }

    pub(crate) fn with_config(registry: HandlerRegistry, config: EngineConfig) -> Self {
        let broker = Arc::new(InMemoryBroker::new());
        let dyn_broker: Arc<dyn StreamBroker> = broker.clone();
        let registry = Arc::new(registry);
        let health = Arc::new(HealthStateManager::new(
            HealthTimings::from(&config),
            Arc::new(TokioClock::new()),
            dyn_broker.clone(),
        ));
        let ensurer = Arc::new(GroupEnsurer::new(dyn_broker.clone()));
        health.register_recovery_action(Arc::new(GroupRecovery::new(
            ensurer.clone(),
            registry.subscriptions().to_vec(),
        )));
        Self {
            broker,
            context: StreamContext {
                broker: dyn_broker,
                health,
                ensurer,
                registry,
            },
            config,
        }
    }

    pub(crate) fn health(&self) -> &Arc<HealthStateManager> {
        &self.context.health
    }

    pub(crate) async fn ensure_all(&self) {
        for subscription in self.context.registry.subscriptions() {
            self.context
                .ensurer
                .ensure(subscription)
                .await
                .expect("group created");
        }
    }

    pub(crate) fn read_loop(&self, subscription: Subscription) -> ReadLoop {
        ReadLoop::new(
            subscription,
            "test-consumer".to_string(),
            self.context.clone(),
            ReadTimings::from(&self.config),
        )
    }

    pub(crate) fn retry_processor(&self) -> RetryProcessor {
        RetryProcessor::new(self.context.clone(), ReclaimPolicy::from(&self.config))
    }

    pub(crate) async fn append_event(&self, event_type: &str, payload: &str) -> EntryId {
        self.broker
            .append(CHANNEL, event(event_type, payload))
            .await
            .expect("append")
    }
}

pub(crate) fn event(event_type: &str, payload: &str) -> FieldMap {
    [
        (FIELD_TYPE, event_type),
        (FIELD_PAYLOAD, payload),
        (FIELD_EVENT_ID, "evt-1"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Poll `condition` on the (usually paused) tokio clock until it holds
pub(crate) async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..20_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
