//! Handler registry
//!
//! Bindings are registered explicitly at startup. Each binding ties an event
//! type on one subscription to a typed async handler; the registry erases the
//! payload type so read loops and the retry processor can dispatch raw JSON.

use crate::streams::error::{HandlerError, RegistryError};
use crate::streams::subscription::{Subscription, SubscriptionKey};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

pub type HandlerFuture = BoxFuture<'static, Result<(), HandlerError>>;

type ErasedHandler = Arc<dyn Fn(&str) -> HandlerFuture + Send + Sync>;

/// One `(subscription, event type) -> handler` association
#[derive(Clone)]
pub struct HandlerBinding {
    subscription: Subscription,
    event_type: String,
    target: &'static str,
    handler: ErasedHandler,
}

impl std::fmt::Debug for HandlerBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerBinding")
            .field("subscription", &self.subscription.key())
            .field("event_type", &self.event_type)
            .field("target", &self.target)
            .finish()
    }
}

impl HandlerBinding {
    /// Bind `handler` to `event_type`, deserializing payloads into `T`
    ///
    /// A payload that does not deserialize into `T` is reported as
    /// [`HandlerError::Deserialize`] without calling the handler. A handler
    /// that panics is reported as [`HandlerError::Panicked`].
    pub fn typed<T, F, Fut>(
        subscription: Subscription,
        event_type: impl Into<String>,
        handler: F,
    ) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let event_type = event_type.into();
        let bound_type = event_type.clone();
        let handler = Arc::new(handler);
        let erased: ErasedHandler = Arc::new(move |payload: &str| -> HandlerFuture {
            match serde_json::from_str::<T>(payload) {
                Ok(value) => {
                    let handler = handler.clone();
                    let running = async move { (*handler)(value).await };
                    Box::pin(async move {
                        AssertUnwindSafe(running).catch_unwind().await.unwrap_or_else(|panic| {
                            Err(HandlerError::Panicked(panic_message(panic.as_ref())))
                        })
                    })
                }
                Err(e) => {
                    let error = HandlerError::Deserialize {
                        event_type: bound_type.clone(),
                        target: std::any::type_name::<T>(),
                        cause: e.to_string(),
                    };
                    Box::pin(async move { Err(error) })
                }
            }
        });

        Self {
            subscription,
            event_type,
            target: std::any::type_name::<T>(),
            handler: erased,
        }
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Type name the payload is deserialized into
    pub fn target(&self) -> &'static str {
        self.target
    }

    /// Deserialize `payload` and run the handler
    pub fn invoke(&self, payload: &str) -> HandlerFuture {
        (self.handler)(payload)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Immutable lookup from `(subscription, event type)` to a binding
#[derive(Default)]
pub struct HandlerRegistry {
    /// Distinct subscriptions in registration order
    subscriptions: Vec<Subscription>,
    bindings: HashMap<SubscriptionKey, HashMap<String, HandlerBinding>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut entries: Vec<String> = self
            .bindings
            .iter()
            .flat_map(|(key, by_type)| by_type.keys().map(move |t| format!("{}:{}", key, t)))
            .collect();
        entries.sort();
        f.debug_struct("HandlerRegistry")
            .field("subscriptions", &self.subscriptions.len())
            .field("bindings", &entries)
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a full set of bindings
    pub fn build(
        bindings: impl IntoIterator<Item = HandlerBinding>,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for binding in bindings {
            registry.register(binding)?;
        }
        Ok(registry)
    }

    /// Add one binding
    ///
    /// Rejects a second handler for the same `(subscription, event type)` and
    /// bindings that share a subscription identity but not its policy.
    pub fn register(&mut self, binding: HandlerBinding) -> Result<(), RegistryError> {
        let key = binding.subscription.key().clone();

        match self
            .subscriptions
            .iter()
            .find(|existing| existing.key() == &key)
        {
            Some(existing) if !existing.same_policy(&binding.subscription) => {
                return Err(RegistryError::ConflictingPolicy {
                    channel: key.channel,
                    group: key.consumer_group,
                });
            }
            Some(_) => {}
            None => self.subscriptions.push(binding.subscription.clone()),
        }

        let by_type = self.bindings.entry(key.clone()).or_default();
        if by_type.contains_key(&binding.event_type) {
            return Err(RegistryError::DuplicateBinding {
                channel: key.channel,
                group: key.consumer_group,
                event_type: binding.event_type,
            });
        }

        log::debug!(
            "Registered handler for '{}' on {} ({})",
            binding.event_type,
            key,
            binding.target
        );
        by_type.insert(binding.event_type.clone(), binding);
        Ok(())
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub fn lookup(&self, key: &SubscriptionKey, event_type: &str) -> Option<&HandlerBinding> {
        self.bindings.get(key)?.get(event_type)
    }

    /// Event types bound on a subscription, sorted
    pub fn event_types(&self, key: &SubscriptionKey) -> Vec<&str> {
        let mut types: Vec<&str> = self
            .bindings
            .get(key)
            .map(|by_type| by_type.keys().map(String::as_str).collect())
            .unwrap_or_default();
        types.sort_unstable();
        types
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
