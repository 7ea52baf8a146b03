use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub type UnitId = String;
pub type ActorId = String;
pub type SubtaskId = String;

/// Sub-task used when a caller does not name one.
pub const DEFAULT_SUBTASK: &str = "main";

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Opaque write-conflict token. Minted by the record store on every accepted
/// write; carries no ordering and is never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(String);

impl VersionToken {
    pub fn mint() -> Self {
        Self(Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for VersionToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of one sub-task track.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    Pending,
    Active,
    Paused,
    Completed,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Completed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Pending => write!(f, "pending"),
            LifecycleState::Active => write!(f, "active"),
            LifecycleState::Paused => write!(f, "paused"),
            LifecycleState::Completed => write!(f, "completed"),
        }
    }
}

/// Persisted state of one sub-task. The lifecycle field is owned by the
/// state machine and never inferred from lock presence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskRecord {
    pub state: LifecycleState,
    /// Actor that started the sub-task. Survives pause/resume cycles.
    pub assignee: Option<ActorId>,
    /// Actor that performed the most recent transition.
    pub last_actor: Option<ActorId>,
    pub started_at: Option<Ms>,
    pub paused_at: Option<Ms>,
    pub completed_at: Option<Ms>,
    pub completed_by: Option<ActorId>,
}

/// The record store's view of a unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub occupant: Option<ActorId>,
    pub occupied_since: Option<Ms>,
    pub active_subtask: Option<SubtaskId>,
    pub subtasks: BTreeMap<SubtaskId, SubtaskRecord>,
    pub updated_at: Ms,
}

impl UnitRecord {
    /// A sub-task that was never written is pending with no assignee.
    pub fn subtask(&self, id: &str) -> SubtaskRecord {
        self.subtasks.get(id).cloned().unwrap_or_default()
    }

    pub fn subtask_state(&self, id: &str) -> LifecycleState {
        self.subtasks.get(id).map(|s| s.state).unwrap_or_default()
    }

    pub fn clear_occupancy(&mut self) {
        self.occupant = None;
        self.occupied_since = None;
        self.active_subtask = None;
    }

    pub fn is_occupied(&self) -> bool {
        self.occupant.is_some()
    }
}

/// A unit record together with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedUnit {
    pub unit_id: UnitId,
    pub record: UnitRecord,
    pub version: VersionToken,
}

/// Successful outcome of a caller-facing operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationReceipt {
    pub unit_id: UnitId,
    pub subtask: SubtaskId,
    pub version: VersionToken,
    pub lifecycle: LifecycleState,
    pub message: String,
}
