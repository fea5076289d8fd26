//! Event publisher
//!
//! Appends typed events to a channel in the wire shape read loops expect.
//! Publishing is fire-and-forget: failures are logged and the caller gets
//! `None`, so producers never stall on a broker outage.

use crate::streams::broker::StreamBroker;
use crate::streams::entry::{
    EntryId, FieldMap, FIELD_EVENT_ID, FIELD_OCCURRED_AT, FIELD_PAYLOAD, FIELD_TYPE,
};
use crate::streams::error::{StreamError, StreamResult};
use crate::streams::health::HealthStateManager;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::sync::Arc;

#[derive(Clone)]
pub struct EventPublisher {
    broker: Arc<dyn StreamBroker>,
    health: Arc<HealthStateManager>,
}

impl EventPublisher {
    pub fn new(broker: Arc<dyn StreamBroker>, health: Arc<HealthStateManager>) -> Self {
        Self { broker, health }
    }

    /// Publish `payload` as an `event_type` event on `channel`
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        channel: &str,
        event_type: &str,
        payload: &T,
    ) -> Option<EntryId> {
        match self.try_publish(channel, event_type, payload).await {
            Ok(id) => {
                log::trace!("Published '{}' to '{}' as {}", event_type, channel, id);
                Some(id)
            }
            Err(StreamError::Degraded) => {
                log::warn!(
                    "Broker degraded; dropped '{}' event for '{}'",
                    event_type,
                    channel
                );
                None
            }
            Err(e) => {
                log::error!(
                    "Failed to publish '{}' event to '{}': {}",
                    event_type,
                    channel,
                    e
                );
                None
            }
        }
    }

    async fn try_publish<T: Serialize + ?Sized>(
        &self,
        channel: &str,
        event_type: &str,
        payload: &T,
    ) -> StreamResult<EntryId> {
        let fields = event_fields(event_type, payload)?;
        self.health
            .run_safe(|| self.broker.append(channel, fields))
            .await
    }
}

/// Wire fields for a new event: type, fresh event id, timestamp and JSON payload
pub fn event_fields<T: Serialize + ?Sized>(event_type: &str, payload: &T) -> StreamResult<FieldMap> {
    let payload =
        serde_json::to_string(payload).map_err(|e| StreamError::Serialization(e.to_string()))?;
    Ok([
        (FIELD_TYPE, event_type.to_string()),
        (FIELD_EVENT_ID, uuid::Uuid::new_v4().to_string()),
        (
            FIELD_OCCURRED_AT,
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        ),
        (FIELD_PAYLOAD, payload),
    ]
    .into_iter()
    .map(|(name, value)| (name.to_string(), value))
    .collect())
}
