//! Tap subscriptions
//!
//! Each `[[tap]]` table in the configuration becomes one subscription whose
//! handlers log every event they receive. Taps make the daemon useful on its
//! own: point one at a channel and watch traffic flow through the engine.

use crate::core::config::TapSettings;
use crate::streams::api::{HandlerBinding, HandlerError, HandlerRegistry, RegistryError, Subscription};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counts events seen by all taps
#[derive(Debug, Clone, Default)]
pub struct TapCounter {
    seen: Arc<AtomicU64>,
}

impl TapCounter {
    pub fn get(&self) -> u64 {
        self.seen.load(Ordering::Relaxed)
    }

    fn record(&self) -> u64 {
        self.seen.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Build the handler registry for the configured taps
pub fn tap_registry(
    taps: &[TapSettings],
    counter: &TapCounter,
) -> Result<HandlerRegistry, RegistryError> {
    let mut registry = HandlerRegistry::new();
    for tap in taps {
        let subscription = Subscription::builder(&tap.channel, &tap.group)
            .batch_size(tap.batch_size)
            .blocking(tap.blocking)
            .sequential(tap.sequential)
            .ack_on_failure(tap.ack_on_failure)
            .build()?;
        for event_type in &tap.event_types {
            registry.register(tap_binding(subscription.clone(), event_type, counter.clone()))?;
        }
    }
    log::debug!(
        "Built {} tap binding(s) over {} subscription(s)",
        registry.binding_count(),
        registry.subscriptions().len()
    );
    Ok(registry)
}

fn tap_binding(subscription: Subscription, event_type: &str, counter: TapCounter) -> HandlerBinding {
    let label = format!(
        "{}/{} {}",
        subscription.channel(),
        subscription.consumer_group(),
        event_type
    );
    HandlerBinding::typed(subscription, event_type, move |payload: serde_json::Value| {
        let total = counter.record();
        let label = label.clone();
        async move {
            log::info!("[{}] #{} {}", label, total, payload);
            Ok::<(), HandlerError>(())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tap(channel: &str, group: &str, event_types: &[&str]) -> TapSettings {
        TapSettings {
            channel: channel.to_string(),
            group: group.to_string(),
            event_types: event_types.iter().map(|t| t.to_string()).collect(),
            batch_size: 5,
            blocking: true,
            sequential: true,
            ack_on_failure: false,
        }
    }

    #[test]
    fn test_one_binding_per_event_type() {
        let counter = TapCounter::default();
        let registry = tap_registry(
            &[
                tap("posts", "audit", &["post.created", "post.deleted"]),
                tap("comments", "audit", &["comment.created"]),
            ],
            &counter,
        )
        .unwrap();

        assert_eq!(registry.binding_count(), 3);
        assert_eq!(registry.subscriptions().len(), 2);
        let posts = registry.subscriptions()[0].clone();
        assert_eq!(posts.batch_size(), 5);
        assert!(posts.sequential_processing());
        assert_eq!(
            registry.event_types(posts.key()),
            vec!["post.created", "post.deleted"]
        );
    }

    #[test]
    fn test_same_subscription_twice_is_rejected() {
        let result = tap_registry(
            &[
                tap("posts", "audit", &["post.created"]),
                tap("posts", "audit", &["post.created"]),
            ],
            &TapCounter::default(),
        );
        assert!(matches!(result, Err(RegistryError::DuplicateBinding { .. })));
    }

    #[test]
    fn test_blank_group_is_rejected() {
        let result = tap_registry(&[tap("posts", " ", &["post.created"])], &TapCounter::default());
        assert!(matches!(result, Err(RegistryError::InvalidSubscription(_))));
    }

    #[tokio::test]
    async fn test_tap_handler_counts_any_json() {
        let counter = TapCounter::default();
        let registry = tap_registry(&[tap("posts", "audit", &["post.created"])], &counter).unwrap();
        let key = registry.subscriptions()[0].key().clone();
        let binding = registry.lookup(&key, "post.created").unwrap();

        binding.invoke(r#"{"id":1}"#).await.unwrap();
        binding.invoke("42").await.unwrap();
        assert!(binding.invoke("not json").await.is_err());

        assert_eq!(counter.get(), 2);
    }
}
