//! Mission state machine: explicit states and legal transition guards.
//!
//! Every transition is appended to the mission's history and mirrored as
//! a `MissionStateChanged` ledger event by the kernel. The invariant the
//! tests pin down: `state` is always the fold of `history`; history is
//! append-only and replay reconstructs the exact same state.

use std::fmt;

use chrono::{DateTime, Utc};
use governance::{Constraints, MissionState, StateChange, Tier};

/// Error returned when an illegal transition is attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: MissionState,
    pub to: MissionState,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal mission transition: {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

/// Legal transitions between mission states.
///
/// ```text
/// CREATED -> QUEUED | REJECTED
/// QUEUED  -> RUNNING
/// RUNNING -> SUCCESS | FAILURE | PAUSED
/// PAUSED  -> RUNNING
/// any non-terminal -> ABORTED   (operator)
/// ```
pub fn is_legal_transition(from: MissionState, to: MissionState) -> bool {
    use MissionState::*;

    if to == Aborted && !from.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        (Created, Queued)
            | (Created, Rejected)
            | (Queued, Running)
            | (Running, Success)
            | (Running, Failure)
            | (Running, Paused)
            | (Paused, Running)
    )
}

/// Errors detected when folding a recorded history.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryError {
    Empty,
    BadStart(MissionState),
    Illegal(IllegalTransition),
}

impl fmt::Display for HistoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryError::Empty => write!(f, "mission history is empty"),
            HistoryError::BadStart(s) => write!(f, "mission history starts at {s}, not CREATED"),
            HistoryError::Illegal(t) => write!(f, "mission history contains {t}"),
        }
    }
}

impl std::error::Error for HistoryError {}

/// Fold a history through the state machine, validating every edge.
/// The result is the mission's state; there is no other source of it.
pub fn fold_history(history: &[StateChange]) -> Result<MissionState, HistoryError> {
    let first = history.first().ok_or(HistoryError::Empty)?;
    if first.state != MissionState::Created {
        return Err(HistoryError::BadStart(first.state));
    }
    let mut current = first.state;
    for change in &history[1..] {
        if !is_legal_transition(current, change.state) {
            return Err(HistoryError::Illegal(IllegalTransition {
                from: current,
                to: change.state,
            }));
        }
        current = change.state;
    }
    Ok(current)
}

/// A single operator-requested unit of work.
#[derive(Debug, Clone)]
pub struct Mission {
    pub mission_id: String,
    pub goal: String,
    pub category: String,
    pub constraints: Constraints,
    pub rank: Tier,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub task_ids: Vec<String>,
    history: Vec<StateChange>,
}

impl Mission {
    pub fn new(
        mission_id: String,
        goal: String,
        category: String,
        constraints: Constraints,
        rank: Tier,
    ) -> Self {
        let now = Utc::now();
        Self {
            mission_id,
            goal,
            category,
            constraints,
            rank,
            created_at: now,
            updated_at: now,
            task_ids: Vec::new(),
            history: vec![StateChange {
                state: MissionState::Created,
                timestamp: now,
                reason: None,
            }],
        }
    }

    /// Rebuild from replayed parts (recovery path). The history is
    /// validated so a corrupted view cannot smuggle in an illegal fold.
    pub fn from_history(
        mission_id: String,
        goal: String,
        category: String,
        constraints: Constraints,
        rank: Tier,
        created_at: DateTime<Utc>,
        task_ids: Vec<String>,
        history: Vec<StateChange>,
    ) -> Result<Self, HistoryError> {
        fold_history(&history)?;
        let updated_at = history.last().map(|c| c.timestamp).unwrap_or(created_at);
        Ok(Self {
            mission_id,
            goal,
            category,
            constraints,
            rank,
            created_at,
            updated_at,
            task_ids,
            history,
        })
    }

    /// Current state: the fold of history. The constructor and `advance`
    /// keep the history valid, so the fold cannot fail here.
    pub fn state(&self) -> MissionState {
        self.history
            .last()
            .map(|c| c.state)
            .unwrap_or(MissionState::Created)
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn history(&self) -> &[StateChange] {
        &self.history
    }

    /// Attempt to advance to `to`, appending to history on success.
    pub fn advance(
        &mut self,
        to: MissionState,
        reason: Option<&str>,
    ) -> Result<StateChange, IllegalTransition> {
        let from = self.state();
        if !is_legal_transition(from, to) {
            return Err(IllegalTransition { from, to });
        }
        let change = StateChange {
            state: to,
            timestamp: Utc::now(),
            reason: reason.map(String::from),
        };
        tracing::debug!(
            mission_id = %self.mission_id,
            %from,
            %to,
            "mission transition"
        );
        self.history.push(change.clone());
        self.updated_at = change.timestamp;
        Ok(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mission() -> Mission {
        Mission::new(
            "m-1".into(),
            "read file foo".into(),
            "fs".into(),
            Constraints::new(),
            Tier::E,
        )
    }

    #[test]
    fn test_initial_state() {
        let m = mission();
        assert_eq!(m.state(), MissionState::Created);
        assert!(!m.is_terminal());
        assert_eq!(m.history().len(), 1);
    }

    #[test]
    fn test_happy_path() {
        let mut m = mission();
        m.advance(MissionState::Queued, None).unwrap();
        m.advance(MissionState::Running, None).unwrap();
        m.advance(MissionState::Success, Some("all tasks succeeded"))
            .unwrap();
        assert!(m.is_terminal());
        assert_eq!(m.state(), MissionState::Success);
        assert_eq!(m.history().len(), 4);
    }

    #[test]
    fn test_pause_resume() {
        let mut m = mission();
        m.advance(MissionState::Queued, None).unwrap();
        m.advance(MissionState::Running, None).unwrap();
        m.advance(MissionState::Paused, Some("operator pause")).unwrap();
        m.advance(MissionState::Running, Some("operator resume"))
            .unwrap();
        m.advance(MissionState::Failure, Some("task failed")).unwrap();
        assert_eq!(m.state(), MissionState::Failure);
    }

    #[test]
    fn test_abort_from_any_non_terminal() {
        for setup in [
            vec![],
            vec![MissionState::Queued],
            vec![MissionState::Queued, MissionState::Running],
            vec![
                MissionState::Queued,
                MissionState::Running,
                MissionState::Paused,
            ],
        ] {
            let mut m = mission();
            for s in setup {
                m.advance(s, None).unwrap();
            }
            m.advance(MissionState::Aborted, Some("operator abort"))
                .unwrap();
            assert_eq!(m.state(), MissionState::Aborted);
        }
    }

    #[test]
    fn test_cannot_leave_terminal() {
        let mut m = mission();
        m.advance(MissionState::Rejected, Some("governance")).unwrap();
        let err = m.advance(MissionState::Queued, None).unwrap_err();
        assert_eq!(err.from, MissionState::Rejected);
        assert_eq!(err.to, MissionState::Queued);
        assert!(m.advance(MissionState::Aborted, None).is_err());
    }

    #[test]
    fn test_illegal_skip() {
        let mut m = mission();
        let err = m.advance(MissionState::Running, None).unwrap_err();
        assert_eq!(err.from, MissionState::Created);
        assert_eq!(err.to, MissionState::Running);
    }

    #[test]
    fn test_state_is_fold_of_history() {
        let mut m = mission();
        m.advance(MissionState::Queued, None).unwrap();
        m.advance(MissionState::Running, None).unwrap();
        m.advance(MissionState::Paused, None).unwrap();
        assert_eq!(fold_history(m.history()).unwrap(), m.state());
    }

    #[test]
    fn test_fold_rejects_corrupt_history() {
        let now = Utc::now();
        let change = |state| StateChange {
            state,
            timestamp: now,
            reason: None,
        };
        assert_eq!(fold_history(&[]), Err(HistoryError::Empty));
        assert!(matches!(
            fold_history(&[change(MissionState::Running)]),
            Err(HistoryError::BadStart(MissionState::Running))
        ));
        assert!(matches!(
            fold_history(&[change(MissionState::Created), change(MissionState::Success)]),
            Err(HistoryError::Illegal(_))
        ));
    }

    #[test]
    fn test_from_history_validates() {
        let now = Utc::now();
        let history = vec![
            StateChange {
                state: MissionState::Created,
                timestamp: now,
                reason: None,
            },
            StateChange {
                state: MissionState::Queued,
                timestamp: now,
                reason: None,
            },
        ];
        let m = Mission::from_history(
            "m-1".into(),
            "g".into(),
            "c".into(),
            Constraints::new(),
            Tier::E,
            now,
            vec![],
            history,
        )
        .unwrap();
        assert_eq!(m.state(), MissionState::Queued);
    }
}
