use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{RetryPolicy, TransportRetry};
use crate::model::*;
use crate::monitor::{ConflictMonitor, RetryOutcome};
use crate::observability;
use crate::store::{StoreError, VersionedRecordStore};

#[derive(Debug, Error)]
pub enum WriteError<E> {
    /// The mutator refused the current record. Nothing was written.
    #[error("{0}")]
    Rejected(E),
    #[error("unit {unit_id}: version conflict persisted after {attempts} attempts")]
    ConflictExhausted {
        unit_id: UnitId,
        attempts: u32,
        last_version: VersionToken,
        last_occupant: Option<ActorId>,
    },
    #[error("unit not found: {0}")]
    NotFound(UnitId),
    #[error("record store unavailable: {0}")]
    Infrastructure(String),
}

/// A write the store accepted.
#[derive(Debug, Clone)]
pub struct Committed {
    pub unit: VersionedUnit,
    /// Conditional writes issued, including the one that succeeded.
    pub attempts: u32,
}

/// Read-modify-conditional-write loop against the record store.
///
/// Each attempt re-reads the unit and re-runs the mutator on what it finds,
/// so the mutator's guards always see the version being written over.
pub struct OptimisticWriteExecutor {
    store: Arc<dyn VersionedRecordStore>,
    monitor: Arc<ConflictMonitor>,
    policy: RetryPolicy,
    transport: TransportRetry,
}

impl OptimisticWriteExecutor {
    pub fn new(
        store: Arc<dyn VersionedRecordStore>,
        monitor: Arc<ConflictMonitor>,
        policy: RetryPolicy,
        transport: TransportRetry,
    ) -> Self {
        Self {
            store,
            monitor,
            policy,
            transport,
        }
    }

    pub async fn read(&self, unit_id: &str) -> Result<VersionedUnit, StoreError> {
        self.with_transport_retry("read_unit", || self.store.read_unit(unit_id)).await
    }

    pub async fn write_with_retry<E, F>(&self, unit_id: &str, mut mutator: F) -> Result<Committed, WriteError<E>>
    where
        F: FnMut(&VersionedUnit) -> Result<UnitRecord, E>,
    {
        let policy = self.policy;
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0;
        let mut conflicted = false;

        loop {
            attempt += 1;
            let current = match self.read(unit_id).await {
                Ok(current) => current,
                Err(e) => {
                    self.record_abandoned(unit_id, conflicted);
                    return Err(store_err(e));
                }
            };
            let next = match mutator(&current) {
                Ok(next) => next,
                Err(e) => {
                    self.record_abandoned(unit_id, conflicted);
                    return Err(WriteError::Rejected(e));
                }
            };

            let result = self
                .with_transport_retry("write_if_version", || {
                    self.store.write_if_version(unit_id, &current.version, next.clone())
                })
                .await;

            match result {
                Ok(version) => {
                    if conflicted {
                        self.monitor.record_retry_outcome(unit_id, RetryOutcome::Resolved);
                    }
                    return Ok(Committed {
                        unit: VersionedUnit {
                            unit_id: unit_id.to_string(),
                            record: next,
                            version,
                        },
                        attempts: attempt,
                    });
                }
                Err(StoreError::VersionMismatch { .. }) => {
                    conflicted = true;
                    self.monitor.record_conflict(unit_id);

                    if attempt >= max_attempts {
                        self.monitor.record_retry_outcome(unit_id, RetryOutcome::Exhausted);
                        let last = self.read(unit_id).await.unwrap_or(current);
                        warn!(unit_id, attempts = attempt, "optimistic write gave up after repeated conflicts");
                        return Err(WriteError::ConflictExhausted {
                            unit_id: unit_id.to_string(),
                            attempts: attempt,
                            last_version: last.version,
                            last_occupant: last.record.occupant,
                        });
                    }

                    let delay = policy.backoff_delay(attempt);
                    debug!(unit_id, attempt, delay_ms = delay.as_millis() as u64, "version conflict, retrying");
                    metrics::counter!(observability::WRITE_RETRIES_TOTAL).increment(1);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.record_abandoned(unit_id, conflicted);
                    return Err(store_err(e));
                }
            }
        }
    }

    fn record_abandoned(&self, unit_id: &str, conflicted: bool) {
        if conflicted {
            self.monitor.record_retry_outcome(unit_id, RetryOutcome::Abandoned);
        }
    }

    async fn with_transport_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let attempts = self.transport.attempts.max(1);
        let mut attempt = 1;
        loop {
            match call().await {
                Err(StoreError::Unavailable(e)) if attempt < attempts => {
                    debug!(op, attempt, "record store error, retrying: {e}");
                    tokio::time::sleep(self.transport.delay_for(attempt)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

fn store_err<E>(e: StoreError) -> WriteError<E> {
    match e {
        StoreError::NotFound(unit_id) => WriteError::NotFound(unit_id),
        other => WriteError::Infrastructure(other.to_string()),
    }
}
