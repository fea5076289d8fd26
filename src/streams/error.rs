//! Stream engine error types
//!
//! `BrokerError` mirrors the failure classes a log broker reports. Everything
//! the engine does with a failure (degrade, re-ensure, drop, retry) is decided
//! by matching on it.

use crate::core::error_handling::ContextualError;

/// Failures reported by a [`StreamBroker`](crate::streams::broker::StreamBroker)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// Connection reset/closed/refused, timeouts, failed pings
    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    /// The consumer group does not exist (e.g. wiped by a broker restart)
    #[error("NOGROUP {0}")]
    NoGroup(String),

    /// `create_group` on an existing group
    #[error("BUSYGROUP {0}")]
    GroupExists(String),

    /// Anything else the broker refused
    #[error("Broker rejected command: {0}")]
    Rejected(String),
}

const UNREACHABLE_SIGNATURES: [&str; 7] = [
    "connection reset",
    "connection closed",
    "connection refused",
    "broken pipe",
    "timed out",
    "not connected",
    "unreachable",
];

impl BrokerError {
    /// Classify a raw broker/transport error message
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if message.starts_with("NOGROUP") {
            return BrokerError::NoGroup(message);
        }
        if message.starts_with("BUSYGROUP") {
            return BrokerError::GroupExists(message);
        }
        let lowered = message.to_lowercase();
        if UNREACHABLE_SIGNATURES
            .iter()
            .any(|signature| lowered.contains(signature))
        {
            return BrokerError::Unreachable(message);
        }
        BrokerError::Rejected(message)
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, BrokerError::Unreachable(_))
    }

    pub fn is_no_group(&self) -> bool {
        matches!(self, BrokerError::NoGroup(_))
    }
}

impl From<std::io::Error> for BrokerError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match error.kind() {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionRefused
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::TimedOut
            | ErrorKind::UnexpectedEof => BrokerError::Unreachable(error.to_string()),
            _ => BrokerError::from_message(error.to_string()),
        }
    }
}

/// Failures of engine operations that touch the broker
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The circuit breaker is open; the broker call was not attempted
    #[error("Broker is degraded; call skipped")]
    Degraded,

    #[error("Failed to serialize event payload: {0}")]
    Serialization(String),
}

impl StreamError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, StreamError::Broker(e) if e.is_unreachable())
    }
}

pub type StreamResult<T> = Result<T, StreamError>;

/// Failures raised while handling one event
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("Failed to deserialize '{event_type}' payload into {target}: {cause}")]
    Deserialize {
        event_type: String,
        target: &'static str,
        cause: String,
    },

    #[error("Handler failed: {0}")]
    Failed(String),

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed(message: impl std::fmt::Display) -> Self {
        HandlerError::Failed(message.to_string())
    }
}

/// Startup-time registration problems
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Invalid subscription: {0}")]
    InvalidSubscription(String),

    #[error(
        "Handler for event type '{event_type}' on channel '{channel}' group '{group}' is registered more than once"
    )]
    DuplicateBinding {
        channel: String,
        group: String,
        event_type: String,
    },

    #[error(
        "Bindings for channel '{channel}' group '{group}' disagree on delivery policy"
    )]
    ConflictingPolicy { channel: String, group: String },
}

impl ContextualError for RegistryError {
    fn is_user_actionable(&self) -> bool {
        false
    }

    fn user_message(&self) -> Option<&str> {
        None
    }
}
