//! Per-(unit, sub-task) lifecycle state machine.
//!
//! ```text
//! pending ──start──▶ active ──finish──▶ completed
//!    ▲                │  ▲
//!    │              pause resume
//!    │                ▼  │
//!    └────abandon──── paused
//! ```
//!
//! `abandon` is legal from both `active` and `paused`. Every transition checks
//! the current state first and fails with [`LifecycleError::InvalidTransition`]
//! when the source state is wrong; nothing is mutated in that case.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::model::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Start,
    Pause,
    Resume,
    Finish,
    Abandon,
}

impl Transition {
    /// Source states from which this transition is legal.
    pub fn sources(self) -> &'static [LifecycleState] {
        match self {
            Transition::Start => &[LifecycleState::Pending],
            Transition::Pause => &[LifecycleState::Active],
            Transition::Resume => &[LifecycleState::Paused],
            Transition::Finish => &[LifecycleState::Active],
            Transition::Abandon => &[LifecycleState::Active, LifecycleState::Paused],
        }
    }

    pub fn target(self) -> LifecycleState {
        match self {
            Transition::Start | Transition::Resume => LifecycleState::Active,
            Transition::Pause => LifecycleState::Paused,
            Transition::Finish => LifecycleState::Completed,
            Transition::Abandon => LifecycleState::Pending,
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::Start => write!(f, "start"),
            Transition::Pause => write!(f, "pause"),
            Transition::Resume => write!(f, "resume"),
            Transition::Finish => write!(f, "finish"),
            Transition::Abandon => write!(f, "abandon"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("cannot {transition} sub-task '{subtask}' of unit {unit_id}: it is {from}")]
    InvalidTransition {
        unit_id: UnitId,
        subtask: SubtaskId,
        from: LifecycleState,
        transition: Transition,
    },
}

/// Pick the transition a take drives: a pending sub-task is started, a paused
/// one is resumed. Every other state is an error.
pub fn transition_for_take(state: LifecycleState) -> Option<Transition> {
    match state {
        LifecycleState::Pending => Some(Transition::Start),
        LifecycleState::Paused => Some(Transition::Resume),
        LifecycleState::Active | LifecycleState::Completed => None,
    }
}

/// The state machine for one sub-task, hydrated from its persisted record.
#[derive(Debug, Clone)]
pub struct SubtaskLifecycle {
    unit_id: UnitId,
    subtask: SubtaskId,
    record: SubtaskRecord,
}

impl SubtaskLifecycle {
    pub fn hydrate(unit_id: &str, subtask: &str, unit: &UnitRecord) -> Self {
        Self {
            unit_id: unit_id.to_string(),
            subtask: subtask.to_string(),
            record: unit.subtask(subtask),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.record.state
    }

    pub fn assignee(&self) -> Option<&str> {
        self.record.assignee.as_deref()
    }

    #[cfg(test)]
    pub fn record(&self) -> &SubtaskRecord {
        &self.record
    }

    /// Validate `transition` against the current state without applying it.
    pub fn check(&self, transition: Transition) -> Result<(), LifecycleError> {
        if transition.sources().contains(&self.record.state) {
            Ok(())
        } else {
            Err(LifecycleError::InvalidTransition {
                unit_id: self.unit_id.clone(),
                subtask: self.subtask.clone(),
                from: self.record.state,
                transition,
            })
        }
    }

    /// The transition a take should drive from the current state.
    pub fn take_transition(&self) -> Result<Transition, LifecycleError> {
        transition_for_take(self.record.state).ok_or_else(|| LifecycleError::InvalidTransition {
            unit_id: self.unit_id.clone(),
            subtask: self.subtask.clone(),
            from: self.record.state,
            transition: Transition::Start,
        })
    }

    pub fn apply(&mut self, transition: Transition, actor: &str, now: Ms) -> Result<(), LifecycleError> {
        self.check(transition)?;
        let from = self.record.state;
        let rec = &mut self.record;
        match transition {
            Transition::Start => {
                rec.assignee = Some(actor.to_string());
                rec.started_at = Some(now);
                rec.paused_at = None;
            }
            Transition::Resume => {
                // Assignee records who started the work, not who holds it now.
                if rec.assignee.as_deref() != Some(actor) {
                    info!(
                        unit_id = %self.unit_id,
                        subtask = %self.subtask,
                        assignee = rec.assignee.as_deref().unwrap_or("-"),
                        resumed_by = actor,
                        "sub-task resumed by non-assignee"
                    );
                }
                rec.paused_at = None;
            }
            Transition::Pause => {
                rec.paused_at = Some(now);
            }
            Transition::Finish => {
                rec.completed_at = Some(now);
                rec.completed_by = Some(actor.to_string());
            }
            Transition::Abandon => {
                rec.assignee = None;
                rec.started_at = None;
                rec.paused_at = None;
            }
        }
        rec.state = transition.target();
        rec.last_actor = Some(actor.to_string());
        tracing::debug!(
            unit_id = %self.unit_id,
            subtask = %self.subtask,
            %from,
            to = %rec.state,
            %transition,
            actor,
            "lifecycle transition"
        );
        Ok(())
    }

    /// Write this sub-task back into its unit record.
    pub fn store_into(self, unit: &mut UnitRecord) {
        unit.subtasks.insert(self.subtask, self.record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lifecycle() -> SubtaskLifecycle {
        SubtaskLifecycle::hydrate("S1", "main", &UnitRecord::default())
    }

    #[test]
    fn happy_path_walks_all_states() {
        let mut lc = lifecycle();
        assert_eq!(lc.state(), LifecycleState::Pending);

        lc.apply(Transition::Start, "w1", 1).unwrap();
        assert_eq!(lc.state(), LifecycleState::Active);
        assert_eq!(lc.assignee(), Some("w1"));

        lc.apply(Transition::Pause, "w1", 2).unwrap();
        assert_eq!(lc.state(), LifecycleState::Paused);
        assert_eq!(lc.record().paused_at, Some(2));

        lc.apply(Transition::Resume, "w1", 3).unwrap();
        assert_eq!(lc.state(), LifecycleState::Active);

        lc.apply(Transition::Finish, "w1", 4).unwrap();
        assert_eq!(lc.state(), LifecycleState::Completed);
        assert_eq!(lc.record().completed_at, Some(4));
        assert_eq!(lc.record().completed_by.as_deref(), Some("w1"));
    }

    #[test]
    fn resume_by_other_actor_keeps_assignee() {
        let mut lc = lifecycle();
        lc.apply(Transition::Start, "w1", 1).unwrap();
        lc.apply(Transition::Pause, "w1", 2).unwrap();
        lc.apply(Transition::Resume, "w2", 3).unwrap();
        assert_eq!(lc.assignee(), Some("w1"));
        assert_eq!(lc.record().last_actor.as_deref(), Some("w2"));

        // Many cycles later the starter is still the assignee.
        for i in 0..5 {
            lc.apply(Transition::Pause, "w2", 10 + i).unwrap();
            lc.apply(Transition::Resume, &format!("w{}", i + 3), 20 + i).unwrap();
        }
        assert_eq!(lc.assignee(), Some("w1"));
    }

    #[test]
    fn abandon_clears_assignee_from_active_and_paused() {
        let mut lc = lifecycle();
        lc.apply(Transition::Start, "w1", 1).unwrap();
        lc.apply(Transition::Abandon, "w1", 2).unwrap();
        assert_eq!(lc.state(), LifecycleState::Pending);
        assert_eq!(lc.assignee(), None);

        lc.apply(Transition::Start, "w2", 3).unwrap();
        lc.apply(Transition::Pause, "w2", 4).unwrap();
        lc.apply(Transition::Abandon, "w3", 5).unwrap();
        assert_eq!(lc.state(), LifecycleState::Pending);
        assert_eq!(lc.assignee(), None);
    }

    #[test]
    fn illegal_sources_are_rejected_without_mutation() {
        let mut lc = lifecycle();
        for t in [Transition::Pause, Transition::Resume, Transition::Finish, Transition::Abandon] {
            let err = lc.apply(t, "w1", 1).unwrap_err();
            assert_eq!(
                err,
                LifecycleError::InvalidTransition {
                    unit_id: "S1".into(),
                    subtask: "main".into(),
                    from: LifecycleState::Pending,
                    transition: t,
                }
            );
        }
        assert_eq!(lc.state(), LifecycleState::Pending);
        assert_eq!(lc.record().last_actor, None);
    }

    #[test]
    fn completed_is_terminal() {
        let mut lc = lifecycle();
        lc.apply(Transition::Start, "w1", 1).unwrap();
        lc.apply(Transition::Finish, "w1", 2).unwrap();
        for t in [
            Transition::Start,
            Transition::Pause,
            Transition::Resume,
            Transition::Finish,
            Transition::Abandon,
        ] {
            assert!(lc.apply(t, "w1", 3).is_err(), "{t} from completed");
        }
        assert!(lc.take_transition().is_err());
    }

    #[test]
    fn finish_requires_active() {
        let mut lc = lifecycle();
        lc.apply(Transition::Start, "w1", 1).unwrap();
        lc.apply(Transition::Pause, "w1", 2).unwrap();
        assert!(lc.apply(Transition::Finish, "w1", 3).is_err());
        assert_eq!(lc.state(), LifecycleState::Paused);
    }

    #[test]
    fn take_picks_start_or_resume() {
        assert_eq!(transition_for_take(LifecycleState::Pending), Some(Transition::Start));
        assert_eq!(transition_for_take(LifecycleState::Paused), Some(Transition::Resume));
        assert_eq!(transition_for_take(LifecycleState::Active), None);
        assert_eq!(transition_for_take(LifecycleState::Completed), None);
    }

    #[test]
    fn store_into_round_trips_through_unit() {
        let mut unit = UnitRecord::default();
        let mut lc = SubtaskLifecycle::hydrate("S1", "phase2", &unit);
        lc.apply(Transition::Start, "w9", 7).unwrap();
        lc.store_into(&mut unit);

        let again = SubtaskLifecycle::hydrate("S1", "phase2", &unit);
        assert_eq!(again.state(), LifecycleState::Active);
        assert_eq!(again.assignee(), Some("w9"));
        assert_eq!(unit.subtask_state("main"), LifecycleState::Pending);
    }

    #[test]
    fn error_message_names_state_and_transition() {
        let lc = lifecycle();
        let err = lc.check(Transition::Pause).unwrap_err();
        assert_eq!(err.to_string(), "cannot pause sub-task 'main' of unit S1: it is pending");
    }
}
