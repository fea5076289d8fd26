//! Durable event-stream consumption
//!
//! Consumes typed events from append-only channels through consumer groups,
//! with at-least-once delivery, reclaim of stalled entries, dead-lettering of
//! poison entries and a circuit breaker that pauses all broker traffic while
//! the broker is unreachable.
//!
//! # Architecture
//!
//! ```text
//!  EventPublisher ──append──▶ ┌──────────────────────────────┐
//!                             │ channel: 1-0  2-0  3-0  ...  │  (StreamBroker)
//!                             └───────┬──────────────┬───────┘
//!                          read_group │              │ pending / claim
//!                 ┌───────────────────┴──┐   ┌───────┴─────────────┐
//!                 │ ReadLoop per         │   │ RetryProcessor      │
//!                 │ (channel, group)     │   │ (interval sweep)    │──▶ dead-letter channel
//!                 └──────────┬───────────┘   └───────┬─────────────┘
//!                            │ dispatch              │ redeliver
//!                            ▼                       ▼
//!                     HandlerRegistry: (subscription, event type) -> handler
//!
//!   HealthStateManager gates every broker call: ACTIVE <-> DEGRADED
//! ```
//!
//! Handlers must be idempotent: an entry can be delivered again after a
//! crash, a failed ack or a reclaim. The `eventId` field is the dedup token.

pub mod api;
pub mod broker;
pub mod connection;
pub mod context;
pub mod engine;
pub mod entry;
pub mod error;
pub mod group;
pub mod health;
pub mod memory;
pub mod publisher;
pub mod registry;
pub mod retry;
pub mod subscription;

pub use api::*;

#[cfg(test)]
mod tests;
