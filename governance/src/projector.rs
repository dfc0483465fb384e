//! Derived-state projector: replays the ledger into in-memory views.
//!
//! For any `(ledger prefix, config)` pair the projector output is a pure
//! function; projecting the same prefix twice yields identical state,
//! including its serialized form (all maps are ordered). The kernel
//! applies entries synchronously right after each append, so views never
//! run ahead of or behind durable history.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::events::{KernelEvent, LedgerEntry};
use crate::types::{
    ArtifactType, CommitState, Constraints, MergeStatus, MissionState, ReviewStatus, Stage,
    StateChange, TaskState, Tier, WorkerKind,
};

/// Commit-queue lifecycle of a pending confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitQueueState {
    Waiting,
    Approved,
    Rejected,
    Expired,
}

/// One pending (or recently resolved) confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitQueueEntry {
    pub task_id: String,
    pub mission_id: String,
    pub state: CommitQueueState,
    pub risk: Tier,
    pub approvers_required: u32,
    pub deadline: DateTime<Utc>,
}

/// Commit verdict attached to a task view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitView {
    pub state: CommitState,
    pub risk: Tier,
    pub reason: String,
    pub countdown_seconds: u64,
    pub approvers_required: u32,
    pub deadline: Option<DateTime<Utc>>,
}

/// Replayed task state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub task_id: String,
    pub mission_id: String,
    pub kind: WorkerKind,
    pub params: serde_json::Value,
    pub risk_tier: Tier,
    pub reversible: bool,
    pub retryable: bool,
    pub depends_on: Vec<String>,
    pub state: TaskState,
    pub attempts: u32,
    pub artifact_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<CommitView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
}

/// Replayed mission state. `state` always equals the fold of `history`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionView {
    pub mission_id: String,
    pub goal: String,
    pub category: String,
    pub constraints: Constraints,
    pub rank: Tier,
    pub state: MissionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<StateChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub task_order: Vec<String>,
    pub tasks: BTreeMap<String, TaskView>,
}

/// Replayed artifact record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactView {
    pub artifact_id: String,
    pub mission_id: String,
    pub task_id: String,
    pub artifact_type: ArtifactType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version_id: Option<String>,
    pub status: ReviewStatus,
    pub content_hash: String,
    pub content_ref: String,
    pub input_snapshot: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_by: Option<String>,
}

/// Capability status as replayed from the ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityView {
    pub stage: Stage,
    pub successful_missions: u64,
}

/// Approximate swarm load derived from dispatch/completion events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwarmLoadView {
    pub tasks_in_flight: usize,
    pub per_kind: BTreeMap<WorkerKind, usize>,
    pub capacity_waits: u64,
}

/// One row of the global event timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mission_id: Option<String>,
}

/// The full derived state.
#[derive(Debug, Default, Serialize)]
pub struct Projector {
    last_seq: Option<u64>,
    doctrine_hash: Option<String>,
    config_revision: u64,
    missions: BTreeMap<String, MissionView>,
    timeline: Vec<TimelineEntry>,
    capability: CapabilityView,
    commit_queue: BTreeMap<String, CommitQueueEntry>,
    artifacts: BTreeMap<String, ArtifactView>,
    load: SwarmLoadView,
}

impl Projector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from an entry sequence (startup replay).
    pub fn replay<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> Self {
        let mut projector = Self::new();
        for entry in entries {
            projector.apply(entry);
        }
        projector
    }

    /// Fold one ledger entry into the views. Must be called in ledger
    /// order; out-of-order sequences indicate a caller bug and are logged.
    pub fn apply(&mut self, entry: &LedgerEntry) {
        if let Some(last) = self.last_seq {
            if entry.seq != last + 1 {
                debug!(
                    expected = last + 1,
                    got = entry.seq,
                    "projector applied out-of-order entry"
                );
            }
        }
        self.last_seq = Some(entry.seq);
        self.timeline.push(TimelineEntry {
            seq: entry.seq,
            ts: entry.ts,
            kind: entry.event.kind().to_string(),
            mission_id: entry.event.mission_id().map(String::from),
        });

        match &entry.event {
            KernelEvent::DoctrineLoaded { hash, .. } => {
                self.doctrine_hash = Some(hash.clone());
            }
            KernelEvent::ConfigChanged { revision, .. } => {
                self.config_revision = *revision;
            }
            KernelEvent::MissionCreated {
                mission_id,
                goal,
                category,
                constraints,
                rank,
                idempotency_key,
            } => {
                self.missions.insert(
                    mission_id.clone(),
                    MissionView {
                        mission_id: mission_id.clone(),
                        goal: goal.clone(),
                        category: category.clone(),
                        constraints: constraints.clone(),
                        rank: *rank,
                        state: MissionState::Created,
                        created_at: entry.ts,
                        updated_at: entry.ts,
                        history: vec![StateChange {
                            state: MissionState::Created,
                            timestamp: entry.ts,
                            reason: None,
                        }],
                        planner: None,
                        idempotency_key: idempotency_key.clone(),
                        task_order: Vec::new(),
                        tasks: BTreeMap::new(),
                    },
                );
            }
            KernelEvent::MissionDecomposed {
                mission_id,
                planner,
                ..
            } => {
                if let Some(mission) = self.missions.get_mut(mission_id) {
                    mission.planner = Some(planner.clone());
                    mission.updated_at = entry.ts;
                }
            }
            KernelEvent::MissionStateChanged {
                mission_id,
                to,
                reason,
                ..
            } => {
                if let Some(mission) = self.missions.get_mut(mission_id) {
                    mission.state = *to;
                    mission.updated_at = entry.ts;
                    mission.history.push(StateChange {
                        state: *to,
                        timestamp: entry.ts,
                        reason: reason.clone(),
                    });
                }
                if *to == MissionState::Success {
                    self.capability.successful_missions += 1;
                }
            }
            KernelEvent::TaskCreated {
                mission_id,
                task_id,
                kind,
                params,
                risk_tier,
                reversible,
                retryable,
                depends_on,
            } => {
                if let Some(mission) = self.missions.get_mut(mission_id) {
                    mission.task_order.push(task_id.clone());
                    mission.tasks.insert(
                        task_id.clone(),
                        TaskView {
                            task_id: task_id.clone(),
                            mission_id: mission_id.clone(),
                            kind: *kind,
                            params: params.clone(),
                            risk_tier: *risk_tier,
                            reversible: *reversible,
                            retryable: *retryable,
                            depends_on: depends_on.clone(),
                            state: TaskState::Pending,
                            attempts: 0,
                            artifact_ids: Vec::new(),
                            commit: None,
                            blocked_reason: None,
                        },
                    );
                }
            }
            KernelEvent::TaskCommitDecided {
                mission_id,
                task_id,
                state,
                risk,
                reason,
                countdown_seconds,
                approvers_required,
                deadline,
            } => {
                if let Some(task) = self.task_mut(mission_id, task_id) {
                    task.commit = Some(CommitView {
                        state: *state,
                        risk: *risk,
                        reason: reason.clone(),
                        countdown_seconds: *countdown_seconds,
                        approvers_required: *approvers_required,
                        deadline: *deadline,
                    });
                    match state {
                        CommitState::Blocked => {
                            task.blocked_reason = Some(reason.clone());
                        }
                        CommitState::ActionReady | CommitState::NeedsConfirm => {
                            task.state = TaskState::Ready;
                            task.blocked_reason = None;
                        }
                    }
                }
            }
            KernelEvent::TaskDispatched {
                mission_id,
                task_id,
                attempt,
                ..
            } => {
                self.commit_queue.remove(task_id);
                let mut kind = None;
                if let Some(task) = self.task_mut(mission_id, task_id) {
                    task.state = TaskState::Running;
                    task.attempts = *attempt;
                    kind = Some(task.kind);
                }
                if let Some(kind) = kind {
                    self.load.tasks_in_flight += 1;
                    *self.load.per_kind.entry(kind).or_insert(0) += 1;
                }
            }
            KernelEvent::TaskCompleted {
                mission_id,
                task_id,
                attempt,
                status,
                will_retry,
                artifact_ids,
                ..
            } => {
                let mut kind = None;
                if let Some(task) = self.task_mut(mission_id, task_id) {
                    kind = Some(task.kind);
                    task.attempts = *attempt;
                    task.state = if *will_retry {
                        TaskState::Pending
                    } else {
                        match status {
                            MergeStatus::Success => TaskState::Succeeded,
                            MergeStatus::Partial | MergeStatus::Failure => TaskState::Failed,
                        }
                    };
                    for artifact_id in artifact_ids {
                        if !task.artifact_ids.contains(artifact_id) {
                            task.artifact_ids.push(artifact_id.clone());
                        }
                    }
                }
                self.note_task_finished(kind);
            }
            KernelEvent::TaskAborted {
                mission_id,
                task_id,
                reason,
            } => {
                self.commit_queue.remove(task_id);
                let mut kind = None;
                let mut was_running = false;
                if let Some(task) = self.task_mut(mission_id, task_id) {
                    kind = Some(task.kind);
                    was_running = task.state == TaskState::Running;
                    task.state = TaskState::Aborted;
                    task.blocked_reason = Some(reason.clone());
                }
                if was_running {
                    self.note_task_finished(kind);
                }
            }
            KernelEvent::ArtifactCreated {
                mission_id,
                task_id,
                artifact_id,
                artifact_type,
                name,
                version,
                previous_version_id,
                content_hash,
                content_ref,
                input_snapshot,
            } => {
                self.artifacts.insert(
                    artifact_id.clone(),
                    ArtifactView {
                        artifact_id: artifact_id.clone(),
                        mission_id: mission_id.clone(),
                        task_id: task_id.clone(),
                        artifact_type: *artifact_type,
                        name: name.clone(),
                        version: *version,
                        previous_version_id: previous_version_id.clone(),
                        status: ReviewStatus::PendingReview,
                        content_hash: content_hash.clone(),
                        content_ref: content_ref.clone(),
                        input_snapshot: input_snapshot.clone(),
                        created_at: entry.ts,
                        reviewed_at: None,
                        reviewed_by: None,
                    },
                );
                if let Some(task) = self.task_mut(mission_id, task_id) {
                    if !task.artifact_ids.contains(artifact_id) {
                        task.artifact_ids.push(artifact_id.clone());
                    }
                }
            }
            KernelEvent::ArtifactReviewed {
                artifact_id,
                status,
                reviewed_by,
                ..
            } => {
                if let Some(artifact) = self.artifacts.get_mut(artifact_id) {
                    artifact.status = *status;
                    artifact.reviewed_at = Some(entry.ts);
                    artifact.reviewed_by = Some(reviewed_by.clone());
                }
            }
            KernelEvent::ApprovalRequested {
                mission_id,
                task_id,
                risk,
                approvers_required,
                deadline,
            } => {
                self.commit_queue.insert(
                    task_id.clone(),
                    CommitQueueEntry {
                        task_id: task_id.clone(),
                        mission_id: mission_id.clone(),
                        state: CommitQueueState::Waiting,
                        risk: *risk,
                        approvers_required: *approvers_required,
                        deadline: *deadline,
                    },
                );
            }
            KernelEvent::ApprovalGranted { task_id, .. } => {
                if let Some(pending) = self.commit_queue.get_mut(task_id) {
                    pending.state = CommitQueueState::Approved;
                }
            }
            KernelEvent::ApprovalRejected { task_id, .. } => {
                if let Some(pending) = self.commit_queue.get_mut(task_id) {
                    pending.state = CommitQueueState::Rejected;
                }
            }
            KernelEvent::CommitExpired {
                mission_id,
                task_id,
                ..
            } => {
                if let Some(pending) = self.commit_queue.get_mut(task_id) {
                    pending.state = CommitQueueState::Expired;
                }
                if let Some(task) = self.task_mut(mission_id, task_id) {
                    task.state = TaskState::Pending;
                    task.blocked_reason = Some("approval_timeout".into());
                }
            }
            KernelEvent::CapabilityUnlocked { stage, .. } => {
                if *stage > self.capability.stage {
                    self.capability.stage = *stage;
                }
            }
            KernelEvent::MissionSnapshot { .. } => {}
            KernelEvent::CapacityExhausted { queued, .. } => {
                if *queued {
                    self.load.capacity_waits += 1;
                }
            }
        }
    }

    fn task_mut(&mut self, mission_id: &str, task_id: &str) -> Option<&mut TaskView> {
        self.missions
            .get_mut(mission_id)
            .and_then(|m| m.tasks.get_mut(task_id))
    }

    fn note_task_finished(&mut self, kind: Option<WorkerKind>) {
        self.load.tasks_in_flight = self.load.tasks_in_flight.saturating_sub(1);
        if let Some(kind) = kind {
            let slot = self.load.per_kind.entry(kind).or_insert(0);
            *slot = slot.saturating_sub(1);
        }
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    pub fn doctrine_hash(&self) -> Option<&str> {
        self.doctrine_hash.as_deref()
    }

    pub fn mission(&self, mission_id: &str) -> Option<&MissionView> {
        self.missions.get(mission_id)
    }

    pub fn missions(&self) -> impl Iterator<Item = &MissionView> {
        self.missions.values()
    }

    pub fn artifact(&self, artifact_id: &str) -> Option<&ArtifactView> {
        self.artifacts.get(artifact_id)
    }

    pub fn capability(&self) -> &CapabilityView {
        &self.capability
    }

    pub fn commit_queue(&self) -> impl Iterator<Item = &CommitQueueEntry> {
        self.commit_queue.values()
    }

    pub fn load(&self) -> &SwarmLoadView {
        &self.load
    }

    pub fn timeline(&self) -> &[TimelineEntry] {
        &self.timeline
    }

    /// Canonical serialized form of the full derived state, used to check
    /// replay purity (identical prefixes must serialize identically).
    pub fn snapshot_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PlannedTask;

    fn entry(seq: u64, event: KernelEvent) -> LedgerEntry {
        LedgerEntry {
            ts: chrono::DateTime::parse_from_rfc3339("2026-08-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc)
                + chrono::Duration::seconds(seq as i64),
            seq,
            event,
            digest: None,
        }
    }

    fn scout_mission_entries() -> Vec<LedgerEntry> {
        let planned = PlannedTask {
            task_id: "m-1-t0".into(),
            kind: WorkerKind::Scout,
            params: serde_json::json!({"goal": "read file foo", "action": "read"}),
            reversible: true,
            retryable: true,
            depends_on: vec![],
            produces_artifacts: true,
            verifiable: true,
            declared_tier: None,
        };
        vec![
            entry(
                0,
                KernelEvent::MissionCreated {
                    mission_id: "m-1".into(),
                    goal: "read file foo".into(),
                    category: "fs".into(),
                    constraints: Constraints::new(),
                    rank: Tier::E,
                    idempotency_key: None,
                },
            ),
            entry(
                1,
                KernelEvent::TaskCreated {
                    mission_id: "m-1".into(),
                    task_id: "m-1-t0".into(),
                    kind: WorkerKind::Scout,
                    params: planned.params.clone(),
                    risk_tier: Tier::E,
                    reversible: true,
                    retryable: true,
                    depends_on: vec![],
                },
            ),
            entry(
                2,
                KernelEvent::MissionDecomposed {
                    mission_id: "m-1".into(),
                    planner: "fallback".into(),
                    tasks: vec![planned],
                },
            ),
            entry(
                3,
                KernelEvent::MissionStateChanged {
                    mission_id: "m-1".into(),
                    from: MissionState::Created,
                    to: MissionState::Queued,
                    reason: None,
                },
            ),
            entry(
                4,
                KernelEvent::MissionStateChanged {
                    mission_id: "m-1".into(),
                    from: MissionState::Queued,
                    to: MissionState::Running,
                    reason: None,
                },
            ),
            entry(
                5,
                KernelEvent::TaskDispatched {
                    mission_id: "m-1".into(),
                    task_id: "m-1-t0".into(),
                    attempt: 1,
                    steps: vec![WorkerKind::Scout],
                },
            ),
            entry(
                6,
                KernelEvent::TaskCompleted {
                    mission_id: "m-1".into(),
                    task_id: "m-1-t0".into(),
                    attempt: 1,
                    status: MergeStatus::Success,
                    will_retry: false,
                    cost: Default::default(),
                    artifact_ids: vec![],
                    errors: vec![],
                },
            ),
            entry(
                7,
                KernelEvent::MissionStateChanged {
                    mission_id: "m-1".into(),
                    from: MissionState::Running,
                    to: MissionState::Success,
                    reason: None,
                },
            ),
        ]
    }

    #[test]
    fn test_mission_fold() {
        let entries = scout_mission_entries();
        let projector = Projector::replay(entries.iter());
        let mission = projector.mission("m-1").unwrap();
        assert_eq!(mission.state, MissionState::Success);
        assert_eq!(mission.history.len(), 4);
        assert_eq!(mission.history.last().unwrap().state, MissionState::Success);
        let task = &mission.tasks["m-1-t0"];
        assert_eq!(task.state, TaskState::Succeeded);
        assert_eq!(task.attempts, 1);
        assert_eq!(projector.capability().successful_missions, 1);
        assert_eq!(projector.load().tasks_in_flight, 0);
    }

    #[test]
    fn test_replay_is_pure() {
        let entries = scout_mission_entries();
        let a = Projector::replay(entries.iter()).snapshot_json();
        let b = Projector::replay(entries.iter()).snapshot_json();
        assert_eq!(a, b, "identical prefixes must project identically");
    }

    #[test]
    fn test_commit_queue_lifecycle() {
        let deadline = Utc::now();
        let mut projector = Projector::new();
        projector.apply(&entry(
            0,
            KernelEvent::ApprovalRequested {
                mission_id: "m-1".into(),
                task_id: "t-1".into(),
                risk: Tier::A,
                approvers_required: 1,
                deadline,
            },
        ));
        assert_eq!(
            projector.commit_queue().next().unwrap().state,
            CommitQueueState::Waiting
        );
        projector.apply(&entry(
            1,
            KernelEvent::ApprovalGranted {
                task_id: "t-1".into(),
                approver: "operator".into(),
            },
        ));
        assert_eq!(
            projector.commit_queue().next().unwrap().state,
            CommitQueueState::Approved
        );
        projector.apply(&entry(
            2,
            KernelEvent::TaskDispatched {
                mission_id: "m-1".into(),
                task_id: "t-1".into(),
                attempt: 1,
                steps: vec![WorkerKind::Builder],
            },
        ));
        assert_eq!(projector.commit_queue().count(), 0);
    }

    #[test]
    fn test_capability_unlock_is_monotonic_in_view() {
        let mut projector = Projector::new();
        projector.apply(&entry(
            0,
            KernelEvent::CapabilityUnlocked {
                stage: Stage::Forging,
                capabilities: vec![],
                successful_missions: 10,
            },
        ));
        projector.apply(&entry(
            1,
            KernelEvent::CapabilityUnlocked {
                stage: Stage::Awakening,
                capabilities: vec![],
                successful_missions: 1,
            },
        ));
        assert_eq!(projector.capability().stage, Stage::Forging);
    }

    #[test]
    fn test_artifact_review_projection() {
        let mut projector = Projector::new();
        for e in scout_mission_entries().iter().take(2) {
            projector.apply(e);
        }
        projector.apply(&entry(
            2,
            KernelEvent::ArtifactCreated {
                mission_id: "m-1".into(),
                task_id: "m-1-t0".into(),
                artifact_id: "a-1".into(),
                artifact_type: ArtifactType::Text,
                name: Some("summary".into()),
                version: 1,
                previous_version_id: None,
                content_hash: "hash".into(),
                content_ref: "artifacts/hash".into(),
                input_snapshot: serde_json::json!({"goal": "read file foo"}),
            },
        ));
        projector.apply(&entry(
            3,
            KernelEvent::ArtifactReviewed {
                artifact_id: "a-1".into(),
                status: ReviewStatus::Approved,
                reviewed_by: "auto".into(),
                note: None,
            },
        ));
        let artifact = projector.artifact("a-1").unwrap();
        assert_eq!(artifact.status, ReviewStatus::Approved);
        assert_eq!(artifact.reviewed_by.as_deref(), Some("auto"));
        let mission = projector.mission("m-1").unwrap();
        assert_eq!(mission.tasks["m-1-t0"].artifact_ids, vec!["a-1"]);
    }
}
