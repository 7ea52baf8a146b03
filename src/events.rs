use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

use crate::model::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Take,
    Pause,
    Complete,
    Abandon,
}

/// Change notification emitted after every committed transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupationEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub unit_id: UnitId,
    pub actor_id: ActorId,
    pub subtask: SubtaskId,
    pub lifecycle_display: LifecycleState,
    pub version: VersionToken,
    pub timestamp: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

/// Fan-out gateway the core hands events to. Delivery beyond this call is
/// the gateway's business.
pub trait EventGateway: Send + Sync {
    fn publish(&self, channel: &str, event: &OccupationEvent) -> Result<(), PublishError>;
}

/// Best-effort publisher. A failed publish is logged and swallowed: the
/// operation that produced the event has already committed.
pub struct EventPublisher {
    gateway: Arc<dyn EventGateway>,
    channel: String,
}

impl EventPublisher {
    pub fn new(gateway: Arc<dyn EventGateway>, channel: impl Into<String>) -> Self {
        Self {
            gateway,
            channel: channel.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn publish(&self, event: &OccupationEvent) {
        if let Err(e) = self.gateway.publish(&self.channel, event) {
            metrics::counter!(crate::observability::EVENT_PUBLISH_FAILURES_TOTAL).increment(1);
            error!(
                channel = %self.channel,
                unit_id = %event.unit_id,
                kind = ?event.kind,
                "event publish failed: {e}"
            );
        }
    }
}
