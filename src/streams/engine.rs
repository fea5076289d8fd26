//! StreamEngine - supervisor for read loops and the retry scheduler
//!
//! The engine wires the shared pieces together (health state manager, group
//! ensurer, retry processor, publisher), ensures every consumer group, then
//! runs one read loop per distinct subscription and one retry scheduler.
//! All of them stop on a single shutdown broadcast.

use crate::core::config::EngineConfig;
use crate::core::retry::{retry_async, RetryPolicy};
use crate::core::shutdown::{wait_for_shutdown, ShutdownCoordinator};
use crate::core::time::{Clock, TokioClock};
use crate::streams::broker::StreamBroker;
use crate::streams::connection::{consumer_name, ReadLoop, ReadTimings};
use crate::streams::context::StreamContext;
use crate::streams::error::BrokerError;
use crate::streams::group::{GroupEnsurer, GroupRecovery};
use crate::streams::health::{HealthStateManager, HealthTimings};
use crate::streams::publisher::EventPublisher;
use crate::streams::registry::HandlerRegistry;
use crate::streams::retry::{ReclaimPolicy, RetryProcessor};
use crate::streams::subscription::SubscriptionKey;
use std::sync::Arc;
use tokio::task::JoinSet;

/// Consumption engine over one broker and one registry
///
/// # Example
///
/// ```rust,no_run
/// use streamgate::core::config::EngineConfig;
/// use streamgate::streams::{
///     HandlerBinding, HandlerError, HandlerRegistry, InMemoryBroker, StreamEngine, Subscription,
/// };
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let feed = Subscription::builder("posts", "feed").build()?;
/// let registry = HandlerRegistry::build([HandlerBinding::typed(
///     feed,
///     "post.created",
///     |post: serde_json::Value| async move {
///         println!("new post: {post}");
///         Ok::<(), HandlerError>(())
///     },
/// )])?;
///
/// let engine = StreamEngine::new(EngineConfig::default(), Arc::new(InMemoryBroker::new()), registry);
/// let publisher = engine.publisher();
/// let running = engine.start().await;
///
/// publisher.publish("posts", "post.created", &serde_json::json!({"id": 1})).await;
/// running.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct StreamEngine {
    config: EngineConfig,
    context: StreamContext,
    retry: Arc<RetryProcessor>,
    publisher: EventPublisher,
}

impl StreamEngine {
    pub fn new(
        config: EngineConfig,
        broker: Arc<dyn StreamBroker>,
        registry: HandlerRegistry,
    ) -> Self {
        Self::with_clock(config, broker, registry, Arc::new(TokioClock::new()))
    }

    /// Build an engine whose health arithmetic reads `clock`
    pub fn with_clock(
        config: EngineConfig,
        broker: Arc<dyn StreamBroker>,
        registry: HandlerRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let registry = Arc::new(registry);
        let health = Arc::new(HealthStateManager::new(
            HealthTimings::from(&config),
            clock,
            broker.clone(),
        ));
        let ensurer = Arc::new(GroupEnsurer::new(broker.clone()));
        health.register_recovery_action(Arc::new(GroupRecovery::new(
            ensurer.clone(),
            registry.subscriptions().to_vec(),
        )));

        let context = StreamContext {
            broker: broker.clone(),
            health: health.clone(),
            ensurer,
            registry,
        };
        let retry = Arc::new(RetryProcessor::new(
            context.clone(),
            ReclaimPolicy::from(&config),
        ));
        let publisher = EventPublisher::new(broker, health);

        Self {
            config,
            context,
            retry,
            publisher,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn health(&self) -> &Arc<HealthStateManager> {
        &self.context.health
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.context.registry
    }

    pub fn group_ensurer(&self) -> &Arc<GroupEnsurer> {
        &self.context.ensurer
    }

    pub fn retry_processor(&self) -> &Arc<RetryProcessor> {
        &self.retry
    }

    pub fn publisher(&self) -> EventPublisher {
        self.publisher.clone()
    }

    /// Create every subscription's consumer group
    ///
    /// Each group gets a few attempts. A broker that stays unreachable puts
    /// the engine in DEGRADED mode and the remaining groups are left to the
    /// recovery action; nothing here is fatal.
    pub async fn ensure_groups(&self) {
        let policy = RetryPolicy::from(&self.config.startup);
        for subscription in self.context.registry.subscriptions() {
            if self.context.health.is_degraded() {
                log::debug!(
                    "Broker degraded; consumer group {} will be created on recovery",
                    subscription
                );
                continue;
            }

            let operation_name = format!("ensure consumer group {}", subscription);
            let ensurer = &self.context.ensurer;
            let result = self
                .context
                .health
                .run_safe(|| {
                    retry_async(
                        &operation_name,
                        &policy,
                        |e: &BrokerError| e.is_unreachable(),
                        || ensurer.ensure(subscription),
                    )
                })
                .await;

            match result {
                Ok(()) => {}
                Err(e) if e.is_unreachable() => {
                    log::warn!(
                        "Broker unreachable while creating consumer group {}: {}",
                        subscription,
                        e
                    );
                }
                Err(e) => {
                    log::warn!(
                        "Could not create consumer group {}; will retry on first read: {}",
                        subscription,
                        e
                    );
                }
            }
        }
    }

    /// Ensure groups, then spawn every read loop and the retry scheduler
    pub async fn start(self) -> RunningEngine {
        self.ensure_groups().await;

        let shutdown = ShutdownCoordinator::new();
        let timings = ReadTimings::from(&self.config);
        let mut tasks = JoinSet::new();
        let mut consumers = Vec::new();

        for subscription in self.context.registry.subscriptions() {
            let consumer = consumer_name(&self.config.read.consumer_prefix);
            consumers.push((subscription.key().clone(), consumer.clone()));
            let read_loop = ReadLoop::new(
                subscription.clone(),
                consumer,
                self.context.clone(),
                timings,
            );
            tasks.spawn(read_loop.run(shutdown.subscribe()));
        }

        let retry = self.retry.clone();
        let retry_shutdown = shutdown.subscribe();
        tasks.spawn(async move { retry.run(retry_shutdown).await });

        log::info!(
            "Stream engine started with {} read loop(s)",
            consumers.len()
        );

        RunningEngine {
            engine: self,
            shutdown,
            tasks,
            consumers,
        }
    }
}

/// A started engine; dropping it without [`RunningEngine::shutdown`] aborts its tasks
pub struct RunningEngine {
    engine: StreamEngine,
    shutdown: ShutdownCoordinator,
    tasks: JoinSet<()>,
    consumers: Vec<(SubscriptionKey, String)>,
}

impl RunningEngine {
    pub fn engine(&self) -> &StreamEngine {
        &self.engine
    }

    pub fn read_loop_count(&self) -> usize {
        self.consumers.len()
    }

    /// `(subscription, consumer name)` for every read loop
    pub fn consumers(&self) -> &[(SubscriptionKey, String)] {
        &self.consumers
    }

    /// Coordinator whose trigger stops this engine, e.g. for signal handlers
    pub fn shutdown_coordinator(&self) -> ShutdownCoordinator {
        self.shutdown.clone()
    }

    /// Broadcast shutdown and wait for every task to finish
    pub async fn shutdown(mut self) {
        log::info!("Stopping stream engine");
        self.shutdown.trigger_shutdown();
        self.join_all().await;
        log::info!("Stream engine stopped");
    }

    /// Wait until someone triggers the shutdown coordinator, then stop
    pub async fn run_until_shutdown(self) {
        let mut shutdown_rx = self.shutdown.subscribe();
        if !self.shutdown.is_shutdown_requested() {
            wait_for_shutdown(&mut shutdown_rx).await;
        }
        self.shutdown().await;
    }

    async fn join_all(&mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    log::error!("Stream engine task panicked: {}", e);
                } else {
                    log::warn!("Stream engine task was cancelled: {}", e);
                }
            }
        }
    }
}
