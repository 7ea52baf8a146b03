mod batch;
mod error;
mod operations;

pub use batch::{BatchItem, BatchOp};
pub use error::OccupationError;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::Config;
use crate::events::{EventGateway, EventKind, EventPublisher, OccupationEvent};
use crate::limits::MAX_ID_LEN;
use crate::lock::{DistributedLockManager, LockService, LockToken};
use crate::model::*;
use crate::monitor::ConflictMonitor;
use crate::store::VersionedRecordStore;
use crate::write::{Committed, OptimisticWriteExecutor};

/// Gate consulted before a take acquires anything. Failures are final for
/// the request and are not retried.
#[async_trait]
pub trait PrerequisiteCheck: Send + Sync {
    async fn check(&self, unit_id: &str, actor_id: &str, subtask: &str) -> Result<(), String>;
}

/// Accepts every take.
pub struct AllowAll;

#[async_trait]
impl PrerequisiteCheck for AllowAll {
    async fn check(&self, _unit_id: &str, _actor_id: &str, _subtask: &str) -> Result<(), String> {
        Ok(())
    }
}

/// Entry point for take / pause / complete and their relatives. Holds no
/// per-unit state of its own: exclusion lives in the lock service and
/// durability in the record store.
pub struct OccupationCoordinator {
    locks: DistributedLockManager,
    writer: OptimisticWriteExecutor,
    monitor: Arc<ConflictMonitor>,
    publisher: EventPublisher,
    prerequisites: Arc<dyn PrerequisiteCheck>,
    lock_ttl: Duration,
}

impl OccupationCoordinator {
    pub fn new(
        lock_service: Arc<dyn LockService>,
        store: Arc<dyn VersionedRecordStore>,
        gateway: Arc<dyn EventGateway>,
        config: &Config,
    ) -> Self {
        let monitor = Arc::new(ConflictMonitor::new(config.monitor));
        Self {
            locks: DistributedLockManager::new(lock_service, config.transport),
            writer: OptimisticWriteExecutor::new(store, monitor.clone(), config.retry, config.transport),
            monitor,
            publisher: EventPublisher::new(gateway, config.event_channel.clone()),
            prerequisites: Arc::new(AllowAll),
            lock_ttl: config.lock_ttl,
        }
    }

    pub fn with_prerequisites(mut self, prerequisites: Arc<dyn PrerequisiteCheck>) -> Self {
        self.prerequisites = prerequisites;
        self
    }

    pub fn monitor(&self) -> &Arc<ConflictMonitor> {
        &self.monitor
    }

    pub fn event_channel(&self) -> &str {
        self.publisher.channel()
    }

    /// Current record and version, as the store sees it.
    pub async fn get_unit(&self, unit_id: &str) -> Result<VersionedUnit, OccupationError> {
        validate_id("unit_id", unit_id)?;
        Ok(self.writer.read(unit_id).await?)
    }

    /// Release a lock acquired earlier in a request that is now failing.
    async fn rollback(&self, unit_id: &str, token: &LockToken) {
        match self.locks.release(unit_id, token).await {
            Ok(true) => tracing::debug!(unit_id, actor_id = token.actor_id(), "lock released on rollback"),
            Ok(false) => tracing::warn!(unit_id, actor_id = token.actor_id(), "lock already gone during rollback"),
            Err(e) => tracing::error!(
                unit_id,
                actor_id = token.actor_id(),
                "rollback could not release lock, it will lapse at TTL: {e}"
            ),
        }
    }

    fn publish(&self, kind: EventKind, actor_id: &str, subtask: &str, committed: &Committed) {
        let unit = &committed.unit;
        self.publisher.publish(&OccupationEvent {
            kind,
            unit_id: unit.unit_id.clone(),
            actor_id: actor_id.to_string(),
            subtask: subtask.to_string(),
            lifecycle_display: unit.record.subtask_state(subtask),
            version: unit.version.clone(),
            timestamp: unit.record.updated_at,
        });
    }
}

fn receipt(committed: &Committed, subtask: &str, message: String) -> OperationReceipt {
    OperationReceipt {
        unit_id: committed.unit.unit_id.clone(),
        subtask: subtask.to_string(),
        version: committed.unit.version.clone(),
        lifecycle: committed.unit.record.subtask_state(subtask),
        message,
    }
}

pub(crate) fn validate_id(field: &str, value: &str) -> Result<(), OccupationError> {
    if value.trim().is_empty() {
        return Err(OccupationError::InvalidRequest(format!("{field} must not be empty")));
    }
    if value.len() > MAX_ID_LEN {
        return Err(OccupationError::InvalidRequest(format!(
            "{field} exceeds {MAX_ID_LEN} bytes"
        )));
    }
    Ok(())
}

fn validate_ids(unit_id: &str, actor_id: &str, subtask: &str) -> Result<(), OccupationError> {
    validate_id("unit_id", unit_id)?;
    validate_id("actor_id", actor_id)?;
    validate_id("subtask", subtask)
}
