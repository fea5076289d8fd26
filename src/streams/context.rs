//! Shared handles passed to read loops and the retry processor

use crate::streams::broker::StreamBroker;
use crate::streams::group::GroupEnsurer;
use crate::streams::health::HealthStateManager;
use crate::streams::registry::HandlerRegistry;
use std::sync::Arc;

#[derive(Clone)]
pub struct StreamContext {
    pub broker: Arc<dyn StreamBroker>,
    pub health: Arc<HealthStateManager>,
    pub ensurer: Arc<GroupEnsurer>,
    pub registry: Arc<HandlerRegistry>,
}
