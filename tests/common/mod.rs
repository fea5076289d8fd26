//! Common test utilities and helpers
//!
//! Shared fixtures for the integration tests: a fast engine configuration,
//! a typed event and a handler that records what it receives.

#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use streamgate::core::config::EngineConfig;
use streamgate::streams::api::{HandlerBinding, HandlerError, Subscription};

pub const POSTS: &str = "posts";
pub const POST_CREATED: &str = "post.created";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostCreated {
    pub id: u64,
    pub title: String,
}

impl PostCreated {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            title: format!("post {id}"),
        }
    }
}

/// Engine configuration with short read and sweep timings
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.read.block_ms = 200;
    config.read.idle_sleep_ms = 50;
    config.read.error_retry_delay_ms = 100;
    config.read.nogroup_retry_delay_ms = 50;
    config.retry.sweep_interval_ms = 1_000;
    config.retry.min_idle_ms = 500;
    config.startup.ensure_retry_delay_ms = 10;
    config
}

pub fn subscription(group: &str) -> Subscription {
    Subscription::builder(POSTS, group)
        .build()
        .expect("valid subscription")
}

/// Collects every `PostCreated` its bindings receive
#[derive(Clone, Default)]
pub struct PostSink {
    received: Arc<Mutex<Vec<PostCreated>>>,
    failing: Arc<AtomicBool>,
}

impl PostSink {
    pub fn failing() -> Self {
        let sink = Self::default();
        sink.set_failing(true);
        sink
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn received(&self) -> Vec<PostCreated> {
        self.received.lock().unwrap().clone()
    }

    pub fn ids(&self) -> Vec<u64> {
        self.received().iter().map(|post| post.id).collect()
    }

    pub fn binding(&self, subscription: Subscription) -> HandlerBinding {
        let sink = self.clone();
        HandlerBinding::typed(subscription, POST_CREATED, move |post: PostCreated| {
            let sink = sink.clone();
            async move {
                if sink.failing.load(Ordering::SeqCst) {
                    return Err(HandlerError::failed(format!("refusing post {}", post.id)));
                }
                sink.received.lock().unwrap().push(post);
                Ok(())
            }
        })
    }
}

/// Poll `condition` on tokio's clock until it holds
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..20_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
