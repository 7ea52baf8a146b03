use thiserror::Error;

use crate::lifecycle::LifecycleError;
use crate::lock::LockError;
use crate::model::*;
use crate::store::StoreError;
use crate::write::WriteError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OccupationError {
    #[error("unit {unit_id} occupied by {}", .owner.as_deref().unwrap_or("unknown"))]
    LockDenied { unit_id: UnitId, owner: Option<ActorId> },

    #[error(
        "unit {unit_id}: write conflict persisted after {attempts} attempts (version {last_version}, occupant {})",
        .last_occupant.as_deref().unwrap_or("none")
    )]
    VersionConflictExhausted {
        unit_id: UnitId,
        attempts: u32,
        last_version: VersionToken,
        last_occupant: Option<ActorId>,
    },

    #[error(transparent)]
    InvalidLifecycleTransition(#[from] LifecycleError),

    #[error("actor {actor_id} does not hold unit {unit_id} (held by {})", .owner.as_deref().unwrap_or("nobody"))]
    NotAuthorized {
        unit_id: UnitId,
        actor_id: ActorId,
        owner: Option<ActorId>,
    },

    #[error("lock on unit {unit_id} held by {actor_id} has expired")]
    LockExpired { unit_id: UnitId, actor_id: ActorId },

    #[error("unit {unit_id} still lists {occupant} as occupant; abandon the stale work first")]
    StaleOccupant { unit_id: UnitId, occupant: ActorId },

    #[error("unit not found: {0}")]
    UnitNotFound(UnitId),

    #[error("prerequisites not met for unit {unit_id}: {reason}")]
    PrerequisiteFailed { unit_id: UnitId, reason: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("infrastructure failure: {0}")]
    Infrastructure(String),
}

impl OccupationError {
    /// Stable machine-readable label.
    pub fn kind(&self) -> &'static str {
        match self {
            OccupationError::LockDenied { .. } => "LOCK_DENIED",
            OccupationError::VersionConflictExhausted { .. } => "VERSION_CONFLICT_EXHAUSTED",
            OccupationError::InvalidLifecycleTransition(_) => "INVALID_LIFECYCLE_TRANSITION",
            OccupationError::NotAuthorized { .. } => "NOT_AUTHORIZED",
            OccupationError::LockExpired { .. } => "LOCK_EXPIRED",
            OccupationError::StaleOccupant { .. } => "STALE_OCCUPANT",
            OccupationError::UnitNotFound(_) => "UNIT_NOT_FOUND",
            OccupationError::PrerequisiteFailed { .. } => "PREREQUISITE_FAILED",
            OccupationError::InvalidRequest(_) => "INVALID_REQUEST",
            OccupationError::LimitExceeded(_) => "LIMIT_EXCEEDED",
            OccupationError::Infrastructure(_) => "INFRASTRUCTURE",
        }
    }

    /// HTTP-equivalent status code.
    pub fn status(&self) -> u16 {
        match self {
            OccupationError::InvalidRequest(_) | OccupationError::LimitExceeded(_) => 400,
            OccupationError::NotAuthorized { .. } => 403,
            OccupationError::UnitNotFound(_) => 404,
            OccupationError::LockDenied { .. }
            | OccupationError::VersionConflictExhausted { .. }
            | OccupationError::StaleOccupant { .. } => 409,
            OccupationError::LockExpired { .. } => 410,
            OccupationError::PrerequisiteFailed { .. } => 412,
            OccupationError::InvalidLifecycleTransition(_) => 422,
            OccupationError::Infrastructure(_) => 503,
        }
    }

    /// Infrastructure failures abort the operation; everything else is a
    /// business outcome the caller can act on.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, OccupationError::Infrastructure(_))
    }
}

impl From<LockError> for OccupationError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Denied { unit_id, owner } => OccupationError::LockDenied { unit_id, owner },
            LockError::Infrastructure(e) => OccupationError::Infrastructure(e.to_string()),
        }
    }
}

impl From<StoreError> for OccupationError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(unit_id) => OccupationError::UnitNotFound(unit_id),
            StoreError::AlreadyExists(unit_id) => {
                OccupationError::InvalidRequest(format!("unit already exists: {unit_id}"))
            }
            StoreError::LimitExceeded(what) => OccupationError::LimitExceeded(what),
            other => OccupationError::Infrastructure(other.to_string()),
        }
    }
}

impl From<WriteError<OccupationError>> for OccupationError {
    fn from(e: WriteError<OccupationError>) -> Self {
        match e {
            WriteError::Rejected(inner) => inner,
            WriteError::ConflictExhausted {
                unit_id,
                attempts,
                last_version,
                last_occupant,
            } => OccupationError::VersionConflictExhausted {
                unit_id,
                attempts,
                last_version,
                last_occupant,
            },
            WriteError::NotFound(unit_id) => OccupationError::UnitNotFound(unit_id),
            WriteError::Infrastructure(msg) => OccupationError::Infrastructure(msg),
        }
    }
}
