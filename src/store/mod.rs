mod memory;

pub use memory::MemoryRecordStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("unit not found: {0}")]
    NotFound(UnitId),
    #[error("unit already exists: {0}")]
    AlreadyExists(UnitId),
    #[error("version mismatch on unit {unit_id}: expected {expected}")]
    VersionMismatch { unit_id: UnitId, expected: VersionToken },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    /// Transport or persistence failure. Worth retrying.
    #[error("record store unavailable: {0}")]
    Unavailable(String),
}

/// The durable source of truth for unit records. It has no locks and no
/// transactions; the only concurrency primitive is the conditional write.
#[async_trait]
pub trait VersionedRecordStore: Send + Sync {
    async fn read_unit(&self, unit_id: &str) -> Result<VersionedUnit, StoreError>;

    /// Replace the unit's record if its version is still `expected`. The
    /// store mints and returns a fresh version on success.
    async fn write_if_version(
        &self,
        unit_id: &str,
        expected: &VersionToken,
        record: UnitRecord,
    ) -> Result<VersionToken, StoreError>;
}
