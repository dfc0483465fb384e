//! Shared domain types for the mission kernel.
//!
//! These are the wire-visible enums and records that cross subsystem
//! boundaries: they appear in ledger payloads, projector views and
//! control-plane responses, so they live below everything else.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Risk / rank tier, ordered from harmless to irreversible.
///
/// The same scale grades missions (`rank`) and tasks (`risk_tier`).
/// Ordering follows declaration order: `E < D < C < B < A < S`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum Tier {
    #[default]
    E,
    D,
    C,
    B,
    A,
    S,
}

impl Tier {
    /// Minimum countdown (seconds) before an action of this tier may execute.
    ///
    /// Runtime config may raise these floors but never lower them.
    pub fn countdown_floor(self) -> u64 {
        match self {
            Tier::E | Tier::D | Tier::C => 0,
            Tier::B => 3,
            Tier::A => 10,
            Tier::S => 30,
        }
    }

    /// Whether this tier always requires operator approval before dispatch.
    pub fn requires_approval(self) -> bool {
        matches!(self, Tier::A | Tier::S)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Tier::E => "E",
            Tier::D => "D",
            Tier::C => "C",
            Tier::B => "B",
            Tier::A => "A",
            Tier::S => "S",
        };
        write!(f, "{s}")
    }
}

/// Mission lifecycle states.
///
/// `SUCCESS` is the canonical success terminal; there is no separate
/// `COMPLETED` label anywhere in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissionState {
    Created,
    Queued,
    Running,
    Paused,
    Success,
    Failure,
    Aborted,
    Rejected,
}

impl MissionState {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MissionState::Success
                | MissionState::Failure
                | MissionState::Aborted
                | MissionState::Rejected
        )
    }
}

impl fmt::Display for MissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MissionState::Created => "CREATED",
            MissionState::Queued => "QUEUED",
            MissionState::Running => "RUNNING",
            MissionState::Paused => "PAUSED",
            MissionState::Success => "SUCCESS",
            MissionState::Failure => "FAILURE",
            MissionState::Aborted => "ABORTED",
            MissionState::Rejected => "REJECTED",
        };
        write!(f, "{s}")
    }
}

/// One recorded mission state transition. `Mission::state` is always the
/// fold of its history, never stored independently of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub state: MissionState,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Aborted
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Aborted => "aborted",
        };
        write!(f, "{s}")
    }
}

/// Commit verdict for a task prior to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommitState {
    ActionReady,
    NeedsConfirm,
    Blocked,
}

impl fmt::Display for CommitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommitState::ActionReady => "ACTION_READY",
            CommitState::NeedsConfirm => "NEEDS_CONFIRM",
            CommitState::Blocked => "BLOCKED",
        };
        write!(f, "{s}")
    }
}

/// Worker plugin families.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Scout,
    Builder,
    Verify,
    Custom,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerKind::Scout => "scout",
            WorkerKind::Builder => "builder",
            WorkerKind::Verify => "verify",
            WorkerKind::Custom => "custom",
        };
        write!(f, "{s}")
    }
}

/// Evolution stage: a monotonic permission level earned by successful
/// mission history. Once reached a stage is never revoked, including
/// across full replay.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    #[default]
    Dormant,
    Awakening,
    Forging,
    Sovereign,
    Apex,
}

impl Stage {
    /// Successful-mission count required to *enter* this stage.
    pub fn threshold(self) -> u64 {
        match self {
            Stage::Dormant => 0,
            Stage::Awakening => 1,
            Stage::Forging => 10,
            Stage::Sovereign => 50,
            Stage::Apex => 200,
        }
    }

    /// The stage after this one, if any.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Dormant => Some(Stage::Awakening),
            Stage::Awakening => Some(Stage::Forging),
            Stage::Forging => Some(Stage::Sovereign),
            Stage::Sovereign => Some(Stage::Apex),
            Stage::Apex => None,
        }
    }

    /// Capabilities granted by this stage alone (not cumulative).
    pub fn grants(self) -> &'static [Capability] {
        match self {
            Stage::Dormant => &[],
            Stage::Awakening => &[Capability::Recall, Capability::WorkerSpawn],
            Stage::Forging => &[
                Capability::AutonomousChain,
                Capability::ArtifactAutoApprove,
            ],
            Stage::Sovereign => &[Capability::ExternalAction, Capability::ParallelMissions],
            Stage::Apex => &[Capability::SelfTuning],
        }
    }

    /// Full permitted set at this stage (union of all grants up to here).
    pub fn permitted(self) -> Vec<Capability> {
        let mut caps = Vec::new();
        let mut stage = Stage::Dormant;
        loop {
            caps.extend_from_slice(stage.grants());
            if stage == self {
                break;
            }
            match stage.next() {
                Some(next) => stage = next,
                None => break,
            }
        }
        caps
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Dormant => "DORMANT",
            Stage::Awakening => "AWAKENING",
            Stage::Forging => "FORGING",
            Stage::Sovereign => "SOVEREIGN",
            Stage::Apex => "APEX",
        };
        write!(f, "{s}")
    }
}

/// Named capabilities gated by the evolution stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    Recall,
    WorkerSpawn,
    AutonomousChain,
    ArtifactAutoApprove,
    ExternalAction,
    ParallelMissions,
    SelfTuning,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Capability::Recall => "RECALL",
            Capability::WorkerSpawn => "WORKER_SPAWN",
            Capability::AutonomousChain => "AUTONOMOUS_CHAIN",
            Capability::ArtifactAutoApprove => "ARTIFACT_AUTO_APPROVE",
            Capability::ExternalAction => "EXTERNAL_ACTION",
            Capability::ParallelMissions => "PARALLEL_MISSIONS",
            Capability::SelfTuning => "SELF_TUNING",
        };
        write!(f, "{s}")
    }
}

/// Overall outcome of a task's merged step results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    /// All steps succeeded.
    Success,
    /// At least one step succeeded and at least one failed.
    Partial,
    /// All steps failed.
    Failure,
}

impl fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MergeStatus::Success => "success",
            MergeStatus::Partial => "partial",
            MergeStatus::Failure => "failure",
        };
        write!(f, "{s}")
    }
}

/// Outcome of a single worker step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
}

/// Resource cost of worker execution, summed component-wise on merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cost {
    pub time_ms: u64,
    pub tokens: u64,
    pub api_calls: u64,
}

impl Cost {
    pub fn add(&mut self, other: &Cost) {
        self.time_ms = self.time_ms.saturating_add(other.time_ms);
        self.tokens = self.tokens.saturating_add(other.tokens);
        self.api_calls = self.api_calls.saturating_add(other.api_calls);
    }
}

/// Durable output families a worker may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Text,
    Code,
    Data,
    Report,
    Log,
}

/// Artifact review status. Legal transitions:
/// `pending_review -> {approved, rejected} -> archived`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    PendingReview,
    Approved,
    Rejected,
    Archived,
}

impl ReviewStatus {
    pub fn can_transition(self, to: ReviewStatus) -> bool {
        matches!(
            (self, to),
            (ReviewStatus::PendingReview, ReviewStatus::Approved)
                | (ReviewStatus::PendingReview, ReviewStatus::Rejected)
                | (ReviewStatus::Approved, ReviewStatus::Archived)
                | (ReviewStatus::Rejected, ReviewStatus::Archived)
        )
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReviewStatus::PendingReview => "pending_review",
            ReviewStatus::Approved => "approved",
            ReviewStatus::Rejected => "rejected",
            ReviewStatus::Archived => "archived",
        };
        write!(f, "{s}")
    }
}

/// One task produced by mission decomposition. Carries everything the
/// gate and the dispatcher need, so replaying `MissionDecomposed` alone
/// reconstructs the full task set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedTask {
    pub task_id: String,
    pub kind: WorkerKind,
    pub params: serde_json::Value,
    pub reversible: bool,
    pub retryable: bool,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub produces_artifacts: bool,
    pub verifiable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declared_tier: Option<Tier>,
}

/// Free-form operator constraints attached to a mission.
pub type Constraints = BTreeMap<String, String>;
