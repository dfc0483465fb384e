//! Commit engine: the never-stall gate between decision and dispatch.
//!
//! `ACTION_READY` tasks flow straight through. `NEEDS_CONFIRM` tasks get
//! a pending entry with a wall-clock deadline; the operator may approve
//! or reject inside the window, and expiry parks the task; it is never
//! silently executed. Approvals are single-shot per task and re-approval
//! is a no-op. Deadlines are stored as wall-clock timestamps in the
//! ledger, so countdowns survive process restart.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use governance::CommitDecision;
use tokio::sync::watch;
use tracing::{debug, info};

/// Lifecycle of one pending confirmation.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingState {
    Waiting,
    Approved { approvers: Vec<String> },
    Rejected { approver: String, reason: String },
    Expired,
}

/// Result of a successful approve call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApproveOutcome {
    /// Quorum reached; the task may dispatch.
    Granted,
    /// Counted, but more approvers are required.
    PartiallyApproved { have: u32, need: u32 },
    /// This approver (or the quorum) had already approved; no-op.
    AlreadyApproved,
}

/// Errors from approval operations.
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("task {0} has no pending confirmation")]
    NotPending(String),
}

struct Pending {
    deadline: DateTime<Utc>,
    approvals: Vec<String>,
    required: u32,
    tx: watch::Sender<PendingState>,
}

/// Registry of pending confirmations.
#[derive(Default)]
pub struct CommitEngine {
    pending: Mutex<HashMap<String, Pending>>,
}

impl CommitEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or re-open, after restart) a confirmation window. Returns a
    /// receiver the caller can await; re-registration of a live entry is
    /// idempotent and keeps the original window.
    pub fn register(
        &self,
        mission_id: &str,
        decision: &CommitDecision,
        deadline: DateTime<Utc>,
    ) -> watch::Receiver<PendingState> {
        let mut pending = self.pending.lock().expect("commit lock poisoned");
        if let Some(existing) = pending.get(&decision.task_id) {
            return existing.tx.subscribe();
        }
        let (tx, rx) = watch::channel(PendingState::Waiting);
        pending.insert(
            decision.task_id.clone(),
            Pending {
                deadline,
                approvals: Vec::new(),
                required: decision.approvers_required.max(1),
                tx,
            },
        );
        debug!(mission_id, task_id = %decision.task_id, %deadline, "confirmation window opened");
        rx
    }

    /// Count one approval. Single-shot per approver; quorum resolves the
    /// entry and wakes the waiter.
    pub fn approve(&self, task_id: &str, approver: &str) -> Result<ApproveOutcome, CommitError> {
        let mut pending = self.pending.lock().expect("commit lock poisoned");
        let entry = pending
            .get_mut(task_id)
            .ok_or_else(|| CommitError::NotPending(task_id.to_string()))?;
        match entry.tx.borrow().clone() {
            PendingState::Waiting => {}
            PendingState::Approved { .. } => return Ok(ApproveOutcome::AlreadyApproved),
            PendingState::Rejected { .. } | PendingState::Expired => {
                return Err(CommitError::NotPending(task_id.to_string()))
            }
        }
        if entry.approvals.iter().any(|a| a == approver) {
            return Ok(ApproveOutcome::AlreadyApproved);
        }
        entry.approvals.push(approver.to_string());
        let have = entry.approvals.len() as u32;
        if have >= entry.required {
            info!(task_id, approver, "approval quorum reached");
            let _ = entry.tx.send(PendingState::Approved {
                approvers: entry.approvals.clone(),
            });
            Ok(ApproveOutcome::Granted)
        } else {
            Ok(ApproveOutcome::PartiallyApproved {
                have,
                need: entry.required,
            })
        }
    }

    /// Reject a pending task. Stops the countdown immediately.
    pub fn reject(
        &self,
        task_id: &str,
        approver: &str,
        reason: &str,
    ) -> Result<(), CommitError> {
        let pending = self.pending.lock().expect("commit lock poisoned");
        let entry = pending
            .get(task_id)
            .ok_or_else(|| CommitError::NotPending(task_id.to_string()))?;
        if *entry.tx.borrow() != PendingState::Waiting {
            return Err(CommitError::NotPending(task_id.to_string()));
        }
        info!(task_id, approver, reason, "pending task rejected");
        let _ = entry.tx.send(PendingState::Rejected {
            approver: approver.to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Expire a still-waiting entry. Returns true only for the caller
    /// that performed the transition, so expiry is recorded exactly once.
    pub fn expire(&self, task_id: &str) -> bool {
        let pending = self.pending.lock().expect("commit lock poisoned");
        let Some(entry) = pending.get(task_id) else {
            return false;
        };
        if *entry.tx.borrow() != PendingState::Waiting {
            return false;
        }
        let _ = entry.tx.send(PendingState::Expired);
        true
    }

    /// Drop a resolved entry once its task reached a terminal state.
    pub fn clear(&self, task_id: &str) {
        self.pending
            .lock()
            .expect("commit lock poisoned")
            .remove(task_id);
    }

    fn deadline_of(&self, task_id: &str) -> Option<DateTime<Utc>> {
        self.pending
            .lock()
            .expect("commit lock poisoned")
            .get(task_id)
            .map(|p| p.deadline)
    }

    /// Wait for the entry to resolve, driving expiry from the stored
    /// wall-clock deadline. A countdown of zero expires on the very next
    /// tick unless an approval already landed.
    pub async fn await_outcome(
        &self,
        task_id: &str,
        mut rx: watch::Receiver<PendingState>,
    ) -> PendingState {
        loop {
            let current = rx.borrow().clone();
            if current != PendingState::Waiting {
                return current;
            }
            let Some(deadline) = self.deadline_of(task_id) else {
                return PendingState::Expired;
            };
            let remaining = (deadline - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return PendingState::Expired;
                    }
                }
                _ = tokio::time::sleep(remaining) => {
                    if self.expire(task_id) {
                        return PendingState::Expired;
                    }
                    // Lost the race to an approval/rejection; loop to read it.
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use governance::{CommitState, Tier};

    fn decision(task_id: &str, approvers_required: u32) -> CommitDecision {
        CommitDecision {
            task_id: task_id.into(),
            state: CommitState::NeedsConfirm,
            reason: "irreversible action requires approval".into(),
            risk: Tier::A,
            countdown_seconds: 10,
            approvers_required,
        }
    }

    #[test]
    fn test_approve_is_single_shot() {
        let engine = CommitEngine::new();
        let d = decision("t-1", 1);
        engine.register("m-1", &d, Utc::now() + chrono::Duration::seconds(10));

        assert_eq!(engine.approve("t-1", "op").unwrap(), ApproveOutcome::Granted);
        assert_eq!(
            engine.approve("t-1", "op").unwrap(),
            ApproveOutcome::AlreadyApproved
        );
    }

    #[test]
    fn test_two_of_n_quorum() {
        let engine = CommitEngine::new();
        let d = decision("t-1", 2);
        engine.register("m-1", &d, Utc::now() + chrono::Duration::seconds(30));

        assert_eq!(
            engine.approve("t-1", "alice").unwrap(),
            ApproveOutcome::PartiallyApproved { have: 1, need: 2 }
        );
        // The same approver cannot fill the quorum alone.
        assert_eq!(
            engine.approve("t-1", "alice").unwrap(),
            ApproveOutcome::AlreadyApproved
        );
        assert_eq!(engine.approve("t-1", "bob").unwrap(), ApproveOutcome::Granted);
    }

    #[test]
    fn test_approve_unknown_task() {
        let engine = CommitEngine::new();
        assert!(matches!(
            engine.approve("ghost", "op"),
            Err(CommitError::NotPending(_))
        ));
    }

    #[test]
    fn test_reject_stops_window() {
        let engine = CommitEngine::new();
        let d = decision("t-1", 1);
        let rx = engine.register("m-1", &d, Utc::now() + chrono::Duration::seconds(10));
        engine.reject("t-1", "op", "not today").unwrap();
        assert!(matches!(*rx.borrow(), PendingState::Rejected { .. }));
        // Approval after rejection is not pending.
        assert!(engine.approve("t-1", "op").is_err());
    }

    #[test]
    fn test_expire_is_exactly_once() {
        let engine = CommitEngine::new();
        let d = decision("t-1", 1);
        engine.register("m-1", &d, Utc::now());
        assert!(engine.expire("t-1"));
        assert!(!engine.expire("t-1"));
    }

    #[test]
    fn test_register_is_idempotent() {
        let engine = CommitEngine::new();
        let d = decision("t-1", 1);
        let deadline = Utc::now() + chrono::Duration::seconds(10);
        engine.register("m-1", &d, deadline);
        engine.approve("t-1", "op").unwrap();
        // Re-registration (e.g. a replayed decision) keeps the resolved state.
        let rx = engine.register("m-1", &d, deadline + chrono::Duration::seconds(60));
        assert!(matches!(*rx.borrow(), PendingState::Approved { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_countdown_expires_on_next_tick() {
        let engine = CommitEngine::new();
        let d = decision("t-1", 1);
        let rx = engine.register("m-1", &d, Utc::now());
        let outcome = engine.await_outcome("t-1", rx).await;
        assert_eq!(outcome, PendingState::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_resolves_on_approval() {
        use std::sync::Arc;
        let engine = Arc::new(CommitEngine::new());
        let d = decision("t-1", 1);
        let rx = engine.register("m-1", &d, Utc::now() + chrono::Duration::hours(1));

        let waiter = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.await_outcome("t-1", rx).await })
        };
        tokio::task::yield_now().await;
        engine.approve("t-1", "op").unwrap();

        let outcome = waiter.await.unwrap();
        assert!(matches!(outcome, PendingState::Approved { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_expires_without_approval() {
        let engine = CommitEngine::new();
        let d = decision("t-1", 1);
        let rx = engine.register("m-1", &d, Utc::now() + chrono::Duration::seconds(10));
        let outcome = engine.await_outcome("t-1", rx).await;
        assert_eq!(outcome, PendingState::Expired);
    }
}
