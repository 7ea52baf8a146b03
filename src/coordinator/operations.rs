use std::time::Instant;

use tracing::{error, info, warn};

use super::*;
use crate::lifecycle::{SubtaskLifecycle, Transition};
use crate::limits::MAX_SUBTASKS_PER_UNIT;
use crate::lock::LockError;
use crate::observability;

impl OccupationCoordinator {
    /// Occupy `unit_id` for `actor_id`, starting or resuming `subtask`.
    ///
    /// Order matters: prerequisites, then the lock, then one conditional
    /// write carrying both the lifecycle transition and the occupant. A
    /// failure after the lock is held releases it before returning.
    pub async fn take(&self, unit_id: &str, actor_id: &str, subtask: &str) -> Result<OperationReceipt, OccupationError> {
        let started = Instant::now();
        let result = self.take_inner(unit_id, actor_id, subtask).await;
        record_outcome("take", started, &result);
        result
    }

    /// Stop working on `subtask` without finishing it. Only the lock holder
    /// may pause.
    pub async fn pause(&self, unit_id: &str, actor_id: &str, subtask: &str) -> Result<OperationReceipt, OccupationError> {
        let started = Instant::now();
        let result = self.end_occupation(unit_id, actor_id, subtask, Transition::Pause).await;
        record_outcome("pause", started, &result);
        result
    }

    /// Finish `subtask` and release the unit. Only the lock holder may
    /// complete.
    pub async fn complete(&self, unit_id: &str, actor_id: &str, subtask: &str) -> Result<OperationReceipt, OccupationError> {
        let started = Instant::now();
        let result = self.end_occupation(unit_id, actor_id, subtask, Transition::Finish).await;
        record_outcome("complete", started, &result);
        result
    }

    /// Reset `subtask` to pending and clear its assignee. Used to recover
    /// work whose occupant vanished without pausing.
    pub async fn abandon(&self, unit_id: &str, actor_id: &str, subtask: &str) -> Result<OperationReceipt, OccupationError> {
        let started = Instant::now();
        let result = self.abandon_inner(unit_id, actor_id, subtask).await;
        record_outcome("abandon", started, &result);
        result
    }

    /// Push the caller's lock expiry out by one TTL. Returns the new TTL.
    pub async fn heartbeat(&self, unit_id: &str, actor_id: &str) -> Result<Duration, OccupationError> {
        let started = Instant::now();
        let result = self.heartbeat_inner(unit_id, actor_id).await;
        record_outcome("heartbeat", started, &result);
        result
    }

    async fn take_inner(&self, unit_id: &str, actor_id: &str, subtask: &str) -> Result<OperationReceipt, OccupationError> {
        validate_ids(unit_id, actor_id, subtask)?;

        if let Err(reason) = self.prerequisites.check(unit_id, actor_id, subtask).await {
            info!(unit_id, actor_id, subtask, %reason, "take refused by prerequisite check");
            return Err(OccupationError::PrerequisiteFailed {
                unit_id: unit_id.to_string(),
                reason,
            });
        }

        let token = match self.locks.acquire(unit_id, actor_id, self.lock_ttl).await {
            Ok(token) => token,
            Err(LockError::Denied { owner, .. }) => {
                self.monitor.record_lock_denial(unit_id);
                info!(
                    unit_id,
                    actor_id,
                    owner = owner.as_deref().unwrap_or("unknown"),
                    "take denied, unit occupied"
                );
                return Err(OccupationError::LockDenied {
                    unit_id: unit_id.to_string(),
                    owner,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let now = now_ms();
        let mut driven = Transition::Start;
        let written = self
            .writer
            .write_with_retry(unit_id, |current: &VersionedUnit| -> Result<UnitRecord, OccupationError> {
                let record = &current.record;
                if let Some(occupant) = &record.occupant {
                    return Err(OccupationError::StaleOccupant {
                        unit_id: unit_id.to_string(),
                        occupant: occupant.clone(),
                    });
                }
                if !record.subtasks.contains_key(subtask) && record.subtasks.len() >= MAX_SUBTASKS_PER_UNIT {
                    return Err(OccupationError::LimitExceeded("too many sub-tasks on unit"));
                }

                let mut lifecycle = SubtaskLifecycle::hydrate(unit_id, subtask, record);
                let transition = lifecycle.take_transition()?;
                lifecycle.apply(transition, actor_id, now)?;
                driven = transition;

                let mut next = record.clone();
                lifecycle.store_into(&mut next);
                next.occupant = Some(actor_id.to_string());
                next.occupied_since = Some(now);
                next.active_subtask = Some(subtask.to_string());
                next.updated_at = now;
                Ok(next)
            })
            .await;

        let committed = match written {
            Ok(committed) => committed,
            Err(e) => {
                self.rollback(unit_id, &token).await;
                return Err(e.into());
            }
        };

        let verb = if driven == Transition::Resume { "resumed" } else { "started" };
        info!(
            unit_id,
            actor_id,
            subtask,
            version = %committed.unit.version,
            attempts = committed.attempts,
            "sub-task {verb}"
        );
        self.publish(EventKind::Take, actor_id, subtask, &committed);
        Ok(receipt(
            &committed,
            subtask,
            format!("{actor_id} {verb} sub-task '{subtask}' on unit {unit_id}"),
        ))
    }

    async fn end_occupation(
        &self,
        unit_id: &str,
        actor_id: &str,
        subtask: &str,
        transition: Transition,
    ) -> Result<OperationReceipt, OccupationError> {
        validate_ids(unit_id, actor_id, subtask)?;
        let token = self.authorize(unit_id, actor_id, subtask, transition).await?;

        // A transition the sub-task cannot take leaves the lock as it was.
        let current = self.writer.read(unit_id).await?;
        SubtaskLifecycle::hydrate(unit_id, subtask, &current.record).check(transition)?;

        // Keep the lock alive for the length of the write.
        if !self.locks.extend(unit_id, &token, self.lock_ttl).await? {
            return Err(OccupationError::LockExpired {
                unit_id: unit_id.to_string(),
                actor_id: actor_id.to_string(),
            });
        }

        let now = now_ms();
        let committed = self
            .writer
            .write_with_retry(unit_id, |current: &VersionedUnit| -> Result<UnitRecord, OccupationError> {
                let record = &current.record;
                let mut lifecycle = SubtaskLifecycle::hydrate(unit_id, subtask, record);
                lifecycle.check(transition)?;
                if record.occupant.as_deref() != Some(actor_id) {
                    return Err(OccupationError::NotAuthorized {
                        unit_id: unit_id.to_string(),
                        actor_id: actor_id.to_string(),
                        owner: record.occupant.clone(),
                    });
                }
                lifecycle.apply(transition, actor_id, now)?;

                // Lifecycle first, then occupancy, in the same write.
                let mut next = record.clone();
                lifecycle.store_into(&mut next);
                next.clear_occupancy();
                next.updated_at = now;
                Ok(next)
            })
            .await?;

        // The write is durable at this point; a failed release only delays
        // the next take until the TTL runs out.
        match self.locks.release(unit_id, &token).await {
            Ok(true) => {}
            Ok(false) => warn!(unit_id, actor_id, "lock lapsed before release"),
            Err(e) => error!(unit_id, actor_id, "lock release failed after commit: {e}"),
        }

        let (kind, verb) = match transition {
            Transition::Finish => (EventKind::Complete, "completed"),
            _ => (EventKind::Pause, "paused"),
        };
        info!(unit_id, actor_id, subtask, version = %committed.unit.version, "sub-task {verb}");
        self.publish(kind, actor_id, subtask, &committed);
        Ok(receipt(
            &committed,
            subtask,
            format!("{actor_id} {verb} sub-task '{subtask}' on unit {unit_id}"),
        ))
    }

    /// The caller's own lock, or the most specific reason they don't have it.
    async fn authorize(
        &self,
        unit_id: &str,
        actor_id: &str,
        subtask: &str,
        transition: Transition,
    ) -> Result<LockToken, OccupationError> {
        match self.locks.holder(unit_id).await? {
            Some(token) if token.actor_id() == actor_id => Ok(token),
            Some(token) => Err(OccupationError::NotAuthorized {
                unit_id: unit_id.to_string(),
                actor_id: actor_id.to_string(),
                owner: Some(token.actor_id().to_string()),
            }),
            None => {
                let current = self.writer.read(unit_id).await?;
                Err(explain_missing_lock(&current, actor_id, subtask, transition))
            }
        }
    }

    async fn abandon_inner(&self, unit_id: &str, actor_id: &str, subtask: &str) -> Result<OperationReceipt, OccupationError> {
        validate_ids(unit_id, actor_id, subtask)?;

        let (token, acquired) = match self.locks.holder(unit_id).await? {
            Some(token) if token.actor_id() == actor_id => (token, false),
            Some(token) => {
                return Err(OccupationError::NotAuthorized {
                    unit_id: unit_id.to_string(),
                    actor_id: actor_id.to_string(),
                    owner: Some(token.actor_id().to_string()),
                });
            }
            None => match self.locks.acquire(unit_id, actor_id, self.lock_ttl).await {
                Ok(token) => (token, true),
                Err(LockError::Denied { owner, .. }) => {
                    self.monitor.record_lock_denial(unit_id);
                    return Err(OccupationError::LockDenied {
                        unit_id: unit_id.to_string(),
                        owner,
                    });
                }
                Err(e) => return Err(e.into()),
            },
        };

        let now = now_ms();
        let mut cleared = false;
        let mut previous: Option<ActorId> = None;
        let written = self
            .writer
            .write_with_retry(unit_id, |current: &VersionedUnit| -> Result<UnitRecord, OccupationError> {
                let record = &current.record;
                let mut lifecycle = SubtaskLifecycle::hydrate(unit_id, subtask, record);
                previous = lifecycle.assignee().map(str::to_string);
                lifecycle.apply(Transition::Abandon, actor_id, now)?;

                let mut next = record.clone();
                lifecycle.store_into(&mut next);
                cleared = next.active_subtask.as_deref() == Some(subtask);
                if cleared {
                    next.clear_occupancy();
                }
                next.updated_at = now;
                Ok(next)
            })
            .await;

        let committed = match written {
            Ok(committed) => committed,
            Err(e) => {
                if acquired {
                    self.rollback(unit_id, &token).await;
                }
                return Err(e.into());
            }
        };

        // Keep the caller's lock if they still occupy a different sub-task.
        if acquired || cleared {
            if let Err(e) = self.locks.release(unit_id, &token).await {
                error!(unit_id, actor_id, "lock release failed after abandon: {e}");
            }
        }

        info!(
            unit_id,
            actor_id,
            subtask,
            previous_assignee = previous.as_deref().unwrap_or("-"),
            occupancy_cleared = cleared,
            "sub-task abandoned"
        );
        self.publish(EventKind::Abandon, actor_id, subtask, &committed);
        Ok(receipt(
            &committed,
            subtask,
            format!("{actor_id} abandoned sub-task '{subtask}' on unit {unit_id}"),
        ))
    }

    async fn heartbeat_inner(&self, unit_id: &str, actor_id: &str) -> Result<Duration, OccupationError> {
        validate_id("unit_id", unit_id)?;
        validate_id("actor_id", actor_id)?;

        let token = match self.locks.holder(unit_id).await? {
            Some(token) if token.actor_id() == actor_id => token,
            Some(token) => {
                return Err(OccupationError::NotAuthorized {
                    unit_id: unit_id.to_string(),
                    actor_id: actor_id.to_string(),
                    owner: Some(token.actor_id().to_string()),
                });
            }
            None => {
                let current = self.writer.read(unit_id).await?;
                return Err(match current.record.occupant {
                    Some(occupant) if occupant == actor_id => OccupationError::LockExpired {
                        unit_id: unit_id.to_string(),
                        actor_id: actor_id.to_string(),
                    },
                    owner => OccupationError::NotAuthorized {
                        unit_id: unit_id.to_string(),
                        actor_id: actor_id.to_string(),
                        owner,
                    },
                });
            }
        };

        if !self.locks.extend(unit_id, &token, self.lock_ttl).await? {
            return Err(OccupationError::LockExpired {
                unit_id: unit_id.to_string(),
                actor_id: actor_id.to_string(),
            });
        }
        tracing::debug!(unit_id, actor_id, ttl_secs = self.lock_ttl.as_secs(), "lock extended");
        Ok(self.lock_ttl)
    }
}

/// Nobody holds the lock. Decide between an expired lock, someone else's
/// stale occupancy, and a transition the sub-task cannot take at all.
fn explain_missing_lock(
    current: &VersionedUnit,
    actor_id: &str,
    subtask: &str,
    transition: Transition,
) -> OccupationError {
    let unit_id = current.unit_id.as_str();
    match current.record.occupant.as_deref() {
        Some(occupant) if occupant == actor_id => OccupationError::LockExpired {
            unit_id: unit_id.to_string(),
            actor_id: actor_id.to_string(),
        },
        Some(occupant) => OccupationError::NotAuthorized {
            unit_id: unit_id.to_string(),
            actor_id: actor_id.to_string(),
            owner: Some(occupant.to_string()),
        },
        None => match SubtaskLifecycle::hydrate(unit_id, subtask, &current.record).check(transition) {
            Err(e) => e.into(),
            Ok(()) => OccupationError::NotAuthorized {
                unit_id: unit_id.to_string(),
                actor_id: actor_id.to_string(),
                owner: None,
            },
        },
    }
}

fn record_outcome<T>(op: &'static str, started: Instant, result: &Result<T, OccupationError>) {
    let status = match result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    metrics::counter!(observability::OPERATIONS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(observability::OPERATION_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
}
