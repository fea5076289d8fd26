//! Broker health state machine
//!
//! A two-state circuit breaker shared by every read loop, the retry
//! processor and the publisher. While DEGRADED, broker calls are skipped
//! until the next probe is due; a successful probe runs the registered
//! recovery actions once and returns the engine to ACTIVE.
//!
//! The transitions on [`HealthState`] are pure functions of the current
//! state and a millisecond timestamp. [`HealthStateManager`] owns the shared
//! state, the clock and the probing.

use crate::core::config::EngineConfig;
use crate::core::sync::lock_recovering;
use crate::core::time::{duration_millis, Clock};
use crate::streams::broker::{BrokerResult, StreamBroker};
use crate::streams::error::{StreamError, StreamResult};
use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthMode {
    Active,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthState {
    pub mode: HealthMode,
    /// Earliest clock reading at which a recovery probe may run
    pub next_probe_at_millis: u64,
}

/// Timing knobs of the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthTimings {
    pub pause_on_failure: Duration,
    pub recovery_probe_interval: Duration,
    pub max_wait_slice: Duration,
}

impl From<&EngineConfig> for HealthTimings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            pause_on_failure: config.pause_on_failure(),
            recovery_probe_interval: config.recovery_probe_interval(),
            max_wait_slice: config.max_wait_slice(),
        }
    }
}

impl HealthState {
    pub const fn active() -> Self {
        Self {
            mode: HealthMode::Active,
            next_probe_at_millis: 0,
        }
    }

    pub fn enter_degraded(self, now_millis: u64, timings: &HealthTimings) -> Self {
        Self {
            mode: HealthMode::Degraded,
            next_probe_at_millis: now_millis.saturating_add(duration_millis(timings.pause_on_failure)),
        }
    }

    pub fn on_probe_failed(self, now_millis: u64, timings: &HealthTimings) -> Self {
        Self {
            mode: HealthMode::Degraded,
            next_probe_at_millis: now_millis
                .saturating_add(duration_millis(timings.recovery_probe_interval)),
        }
    }

    pub fn recover(self) -> Self {
        Self::active()
    }

    /// How long to wait before probing, capped at one wait slice
    ///
    /// `None` when ACTIVE or when a probe is due.
    pub fn should_wait_before_probe(
        &self,
        now_millis: u64,
        timings: &HealthTimings,
    ) -> Option<Duration> {
        if self.mode == HealthMode::Active || now_millis >= self.next_probe_at_millis {
            return None;
        }
        let remaining = Duration::from_millis(self.next_probe_at_millis - now_millis);
        Some(remaining.min(timings.max_wait_slice))
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::active()
    }
}

/// Work that must succeed before the engine leaves DEGRADED
#[async_trait]
pub trait RecoveryAction: Send + Sync {
    fn name(&self) -> &str;

    async fn recover(&self) -> StreamResult<()>;
}

/// Result of one [`HealthStateManager::attempt_recovery`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    AlreadyActive,
    NotDue(Duration),
    Recovered,
    StillDegraded,
}

pub struct HealthStateManager {
    state: Mutex<HealthState>,
    timings: HealthTimings,
    clock: Arc<dyn Clock>,
    broker: Arc<dyn StreamBroker>,
    recovery_actions: Mutex<Vec<Arc<dyn RecoveryAction>>>,
    /// Serializes probes so concurrent callers never ping in parallel
    probe_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for HealthStateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthStateManager")
            .field("state", &self.snapshot())
            .field("timings", &self.timings)
            .finish()
    }
}

impl HealthStateManager {
    pub fn new(timings: HealthTimings, clock: Arc<dyn Clock>, broker: Arc<dyn StreamBroker>) -> Self {
        Self {
            state: Mutex::new(HealthState::active()),
            timings,
            clock,
            broker,
            recovery_actions: Mutex::new(Vec::new()),
            probe_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Add an action run once on every successful recovery
    pub fn register_recovery_action(&self, action: Arc<dyn RecoveryAction>) {
        log::debug!("Registered recovery action '{}'", action.name());
        lock_recovering(&self.recovery_actions, "recovery actions").push(action);
    }

    pub fn timings(&self) -> &HealthTimings {
        &self.timings
    }

    pub fn snapshot(&self) -> HealthState {
        *lock_recovering(&self.state, "health state")
    }

    pub fn mode(&self) -> HealthMode {
        self.snapshot().mode
    }

    pub fn is_degraded(&self) -> bool {
        self.mode() == HealthMode::Degraded
    }

    /// Open the breaker after a broker-unreachable failure
    ///
    /// Only an ACTIVE engine transitions; further failures while DEGRADED do
    /// not push the probe deadline out. Returns whether a transition happened.
    pub fn enter_degraded(&self) -> bool {
        let now = self.clock.now_millis();
        let mut state = lock_recovering(&self.state, "health state");
        if state.mode == HealthMode::Degraded {
            return false;
        }
        *state = state.enter_degraded(now, &self.timings);
        drop(state);
        log::warn!(
            "Broker unreachable; pausing stream consumption for {:?}",
            self.timings.pause_on_failure
        );
        true
    }

    pub fn should_wait_before_probe(&self) -> Option<Duration> {
        self.snapshot()
            .should_wait_before_probe(self.clock.now_millis(), &self.timings)
    }

    /// Probe the broker if a probe is due, recovering on success
    pub async fn attempt_recovery(&self) -> ProbeOutcome {
        let _probe = self.probe_lock.lock().await;

        // another caller may have recovered while we waited for the lock
        let state = self.snapshot();
        if state.mode == HealthMode::Active {
            return ProbeOutcome::AlreadyActive;
        }
        if let Some(wait) = state.should_wait_before_probe(self.clock.now_millis(), &self.timings) {
            return ProbeOutcome::NotDue(wait);
        }

        if let Err(e) = self.broker.ping().await {
            self.probe_failed(&format!("probe failed: {}", e));
            return ProbeOutcome::StillDegraded;
        }

        let actions = lock_recovering(&self.recovery_actions, "recovery actions").clone();
        for action in actions {
            if let Err(e) = action.recover().await {
                self.probe_failed(&format!("recovery action '{}' failed: {}", action.name(), e));
                return ProbeOutcome::StillDegraded;
            }
        }

        {
            let mut state = lock_recovering(&self.state, "health state");
            *state = state.recover();
        }
        log::info!("Broker reachable again; resuming stream consumption");
        ProbeOutcome::Recovered
    }

    fn probe_failed(&self, reason: &str) {
        let now = self.clock.now_millis();
        let mut state = lock_recovering(&self.state, "health state");
        *state = state.on_probe_failed(now, &self.timings);
        drop(state);
        log::debug!(
            "Broker still unavailable ({}); next probe in {:?}",
            reason,
            self.timings.recovery_probe_interval
        );
    }

    /// Run a broker operation behind the breaker
    ///
    /// While DEGRADED the operation is skipped with [`StreamError::Degraded`]
    /// unless a probe is due and succeeds. An unreachable failure from the
    /// operation opens the breaker before the error is returned.
    pub async fn run_safe<T, F, Fut>(&self, operation: F) -> StreamResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BrokerResult<T>>,
    {
        if self.is_degraded() {
            match self.attempt_recovery().await {
                ProbeOutcome::Recovered | ProbeOutcome::AlreadyActive => {}
                ProbeOutcome::NotDue(_) | ProbeOutcome::StillDegraded => {
                    return Err(StreamError::Degraded);
                }
            }
        }

        match operation().await {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_unreachable() {
                    self.enter_degraded();
                }
                Err(e.into())
            }
        }
    }
}
