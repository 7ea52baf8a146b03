use futures::future::join_all;
use serde::{Deserialize, Serialize};

use super::*;
use crate::limits::MAX_BATCH_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOp {
    Take,
    Pause,
    Complete,
}

/// Per-unit outcome. One unit failing never affects another.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItem {
    pub unit_id: UnitId,
    pub outcome: Result<OperationReceipt, OccupationError>,
}

impl OccupationCoordinator {
    pub async fn take_batch(
        &self,
        unit_ids: &[UnitId],
        actor_id: &str,
        subtask: &str,
    ) -> Result<Vec<BatchItem>, OccupationError> {
        self.run_batch(BatchOp::Take, unit_ids, actor_id, subtask).await
    }

    pub async fn pause_batch(
        &self,
        unit_ids: &[UnitId],
        actor_id: &str,
        subtask: &str,
    ) -> Result<Vec<BatchItem>, OccupationError> {
        self.run_batch(BatchOp::Pause, unit_ids, actor_id, subtask).await
    }

    pub async fn complete_batch(
        &self,
        unit_ids: &[UnitId],
        actor_id: &str,
        subtask: &str,
    ) -> Result<Vec<BatchItem>, OccupationError> {
        self.run_batch(BatchOp::Complete, unit_ids, actor_id, subtask).await
    }

    /// Run `op` on every unit concurrently. Results come back in request
    /// order. Only an oversized or empty request fails as a whole.
    pub async fn run_batch(
        &self,
        op: BatchOp,
        unit_ids: &[UnitId],
        actor_id: &str,
        subtask: &str,
    ) -> Result<Vec<BatchItem>, OccupationError> {
        if unit_ids.is_empty() {
            return Err(OccupationError::InvalidRequest("batch has no units".into()));
        }
        if unit_ids.len() > MAX_BATCH_SIZE {
            return Err(OccupationError::LimitExceeded("batch exceeds 50 units"));
        }

        let items = join_all(unit_ids.iter().map(|unit_id| async move {
            let outcome = match op {
                BatchOp::Take => self.take(unit_id, actor_id, subtask).await,
                BatchOp::Pause => self.pause(unit_id, actor_id, subtask).await,
                BatchOp::Complete => self.complete(unit_id, actor_id, subtask).await,
            };
            BatchItem {
                unit_id: unit_id.clone(),
                outcome,
            }
        }))
        .await;

        let failed = items.iter().filter(|i| i.outcome.is_err()).count();
        tracing::info!(?op, actor_id, units = items.len(), failed, "batch processed");
        Ok(items)
    }
}
