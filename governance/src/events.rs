//! The closed event set of the kernel and the ledger entry envelope.
//!
//! Every state change in the system is one of these events, appended to
//! the ledger. Derived state is a replay of them and nothing else.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    ArtifactType, Capability, CommitState, Constraints, Cost, MergeStatus, MissionState,
    PlannedTask, ReviewStatus, Stage, Tier, WorkerKind,
};

/// All ledger-recorded kernel events.
///
/// Serialized adjacently tagged so each ledger line carries a `kind`
/// string and a `payload` object; the variant names are the wire-stable
/// kind strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum KernelEvent {
    /// Doctrine was loaded and hashed at process start.
    DoctrineLoaded { hash: String, defaults: bool },

    /// Operator-editable runtime config changed; written before the new
    /// config takes effect.
    ConfigChanged {
        revision: u64,
        changed_by: String,
        config: serde_json::Value,
    },

    /// A new mission was accepted from operator intent.
    MissionCreated {
        mission_id: String,
        goal: String,
        category: String,
        constraints: Constraints,
        rank: Tier,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        idempotency_key: Option<String>,
    },

    /// The mission goal was decomposed into a task DAG. The planner's
    /// output is recorded verbatim, whether deterministic or external.
    MissionDecomposed {
        mission_id: String,
        planner: String,
        tasks: Vec<PlannedTask>,
    },

    /// A mission moved through its state machine.
    MissionStateChanged {
        mission_id: String,
        from: MissionState,
        to: MissionState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// A task was created during decomposition.
    TaskCreated {
        mission_id: String,
        task_id: String,
        kind: WorkerKind,
        params: serde_json::Value,
        risk_tier: Tier,
        reversible: bool,
        retryable: bool,
        #[serde(default)]
        depends_on: Vec<String>,
    },

    /// The governance gate produced a commit verdict for a task.
    TaskCommitDecided {
        mission_id: String,
        task_id: String,
        state: CommitState,
        risk: Tier,
        reason: String,
        countdown_seconds: u64,
        approvers_required: u32,
        /// Wall-clock approval deadline; present only for NEEDS_CONFIRM,
        /// so countdowns survive process restart.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deadline: Option<DateTime<Utc>>,
    },

    /// A task was admitted to the swarm and began executing.
    TaskDispatched {
        mission_id: String,
        task_id: String,
        attempt: u32,
        steps: Vec<WorkerKind>,
    },

    /// A dispatched task produced a merged worker result.
    TaskCompleted {
        mission_id: String,
        task_id: String,
        attempt: u32,
        status: MergeStatus,
        will_retry: bool,
        cost: Cost,
        artifact_ids: Vec<String>,
        errors: Vec<String>,
    },

    /// A task was cancelled; partial results were discarded.
    TaskAborted {
        mission_id: String,
        task_id: String,
        reason: String,
    },

    /// A worker emitted a durable artifact into the vault.
    ArtifactCreated {
        mission_id: String,
        task_id: String,
        artifact_id: String,
        artifact_type: ArtifactType,
        /// Worker-given name; versions chain per (task, name).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        version: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_version_id: Option<String>,
        content_hash: String,
        content_ref: String,
        /// The task inputs the artifact was produced from.
        input_snapshot: serde_json::Value,
    },

    /// An artifact's review status advanced.
    ArtifactReviewed {
        artifact_id: String,
        status: ReviewStatus,
        reviewed_by: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },

    /// A NEEDS_CONFIRM decision opened an approval window.
    ApprovalRequested {
        mission_id: String,
        task_id: String,
        risk: Tier,
        approvers_required: u32,
        deadline: DateTime<Utc>,
    },

    /// An operator approved a pending task.
    ApprovalGranted { task_id: String, approver: String },

    /// An operator rejected a pending task.
    ApprovalRejected {
        task_id: String,
        approver: String,
        reason: String,
    },

    /// An approval window elapsed without a decision; the task is parked,
    /// never silently executed.
    CommitExpired {
        mission_id: String,
        task_id: String,
        deadline: DateTime<Utc>,
    },

    /// A new evolution stage was reached.
    CapabilityUnlocked {
        stage: Stage,
        capabilities: Vec<Capability>,
        successful_missions: u64,
    },

    /// Point-in-time mission snapshot for fast recovery. An optimization:
    /// replay of the raw log must yield the same state without it.
    MissionSnapshot {
        mission_id: String,
        snapshot: serde_json::Value,
    },

    /// The worker pool was saturated when a task asked for admission.
    CapacityExhausted {
        mission_id: String,
        task_id: String,
        kind: WorkerKind,
        queued: bool,
    },
}

impl KernelEvent {
    /// The wire `kind` string of this event.
    pub fn kind(&self) -> &'static str {
        match self {
            KernelEvent::DoctrineLoaded { .. } => "DoctrineLoaded",
            KernelEvent::ConfigChanged { .. } => "ConfigChanged",
            KernelEvent::MissionCreated { .. } => "MissionCreated",
            KernelEvent::MissionDecomposed { .. } => "MissionDecomposed",
            KernelEvent::MissionStateChanged { .. } => "MissionStateChanged",
            KernelEvent::TaskCreated { .. } => "TaskCreated",
            KernelEvent::TaskCommitDecided { .. } => "TaskCommitDecided",
            KernelEvent::TaskDispatched { .. } => "TaskDispatched",
            KernelEvent::TaskCompleted { .. } => "TaskCompleted",
            KernelEvent::TaskAborted { .. } => "TaskAborted",
            KernelEvent::ArtifactCreated { .. } => "ArtifactCreated",
            KernelEvent::ArtifactReviewed { .. } => "ArtifactReviewed",
            KernelEvent::ApprovalRequested { .. } => "ApprovalRequested",
            KernelEvent::ApprovalGranted { .. } => "ApprovalGranted",
            KernelEvent::ApprovalRejected { .. } => "ApprovalRejected",
            KernelEvent::CommitExpired { .. } => "CommitExpired",
            KernelEvent::CapabilityUnlocked { .. } => "CapabilityUnlocked",
            KernelEvent::MissionSnapshot { .. } => "MissionSnapshot",
            KernelEvent::CapacityExhausted { .. } => "CapacityExhausted",
        }
    }

    /// Mission id, if this event is mission-scoped.
    pub fn mission_id(&self) -> Option<&str> {
        match self {
            KernelEvent::MissionCreated { mission_id, .. }
            | KernelEvent::MissionDecomposed { mission_id, .. }
            | KernelEvent::MissionStateChanged { mission_id, .. }
            | KernelEvent::TaskCreated { mission_id, .. }
            | KernelEvent::TaskCommitDecided { mission_id, .. }
            | KernelEvent::TaskDispatched { mission_id, .. }
            | KernelEvent::TaskCompleted { mission_id, .. }
            | KernelEvent::TaskAborted { mission_id, .. }
            | KernelEvent::ArtifactCreated { mission_id, .. }
            | KernelEvent::ApprovalRequested { mission_id, .. }
            | KernelEvent::CommitExpired { mission_id, .. }
            | KernelEvent::MissionSnapshot { mission_id, .. }
            | KernelEvent::CapacityExhausted { mission_id, .. } => Some(mission_id),
            _ => None,
        }
    }

    /// Task id, if this event is task-scoped.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            KernelEvent::TaskCreated { task_id, .. }
            | KernelEvent::TaskCommitDecided { task_id, .. }
            | KernelEvent::TaskDispatched { task_id, .. }
            | KernelEvent::TaskCompleted { task_id, .. }
            | KernelEvent::TaskAborted { task_id, .. }
            | KernelEvent::ArtifactCreated { task_id, .. }
            | KernelEvent::ApprovalRequested { task_id, .. }
            | KernelEvent::ApprovalGranted { task_id, .. }
            | KernelEvent::ApprovalRejected { task_id, .. }
            | KernelEvent::CommitExpired { task_id, .. }
            | KernelEvent::CapacityExhausted { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}

/// One durable ledger line: `{ts, seq, kind, payload, digest}`.
///
/// `ts` is writer-assigned and monotonic per process; `seq` is monotonic
/// per writer. The digest chains over the previous entry's digest and the
/// canonical serialization of this entry without its own digest field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub ts: DateTime<Utc>,
    pub seq: u64,
    #[serde(flatten)]
    pub event: KernelEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl LedgerEntry {
    /// Compute the chained digest for this entry.
    pub fn chained_digest(&self, prev: Option<&str>) -> Result<String, serde_json::Error> {
        let unsigned = LedgerEntry {
            ts: self.ts,
            seq: self.seq,
            event: self.event.clone(),
            digest: None,
        };
        let bytes = serde_json::to_vec(&unsigned)?;
        let mut hasher = blake3::Hasher::new();
        if let Some(prev) = prev {
            hasher.update(prev.as_bytes());
        }
        hasher.update(&bytes);
        Ok(hasher.finalize().to_hex().to_string())
    }

    /// Whether the stored digest matches a recomputation over `prev`.
    /// Entries without a digest verify trivially.
    pub fn digest_ok(&self, prev: Option<&str>) -> bool {
        match &self.digest {
            None => true,
            Some(stored) => self
                .chained_digest(prev)
                .map(|d| &d == stored)
                .unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> KernelEvent {
        KernelEvent::MissionCreated {
            mission_id: "m-1".into(),
            goal: "read file foo".into(),
            category: "fs".into(),
            constraints: Constraints::new(),
            rank: Tier::E,
            idempotency_key: None,
        }
    }

    #[test]
    fn test_envelope_shape() {
        let entry = LedgerEntry {
            ts: Utc::now(),
            seq: 7,
            event: sample_event(),
            digest: None,
        };
        let json: serde_json::Value = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["seq"], 7);
        assert_eq!(json["kind"], "MissionCreated");
        assert!(json["payload"].is_object());
        assert_eq!(json["payload"]["goal"], "read file foo");
        assert!(json.get("digest").is_none());
    }

    #[test]
    fn test_event_roundtrip() {
        let entry = LedgerEntry {
            ts: Utc::now(),
            seq: 1,
            event: KernelEvent::TaskCommitDecided {
                mission_id: "m-1".into(),
                task_id: "m-1-t0".into(),
                state: CommitState::NeedsConfirm,
                risk: Tier::A,
                reason: "irreversible action requires approval".into(),
                countdown_seconds: 10,
                approvers_required: 1,
                deadline: Some(Utc::now()),
            },
            digest: None,
        };
        let line = serde_json::to_string(&entry).unwrap();
        let parsed: LedgerEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.event.kind(), "TaskCommitDecided");
        assert_eq!(parsed.event.task_id(), Some("m-1-t0"));
        assert_eq!(parsed.event.mission_id(), Some("m-1"));
    }

    #[test]
    fn test_digest_chain() {
        let first = LedgerEntry {
            ts: Utc::now(),
            seq: 0,
            event: KernelEvent::DoctrineLoaded {
                hash: "abc".into(),
                defaults: true,
            },
            digest: None,
        };
        let d0 = first.chained_digest(None).unwrap();
        let signed = LedgerEntry {
            digest: Some(d0.clone()),
            ..first.clone()
        };
        assert!(signed.digest_ok(None));

        let second = LedgerEntry {
            ts: Utc::now(),
            seq: 1,
            event: sample_event(),
            digest: None,
        };
        let d1 = second.chained_digest(Some(&d0)).unwrap();
        let signed2 = LedgerEntry {
            digest: Some(d1),
            ..second
        };
        assert!(signed2.digest_ok(Some(&d0)));
        // Chain verification fails against the wrong predecessor.
        assert!(!signed2.digest_ok(None));
    }

    #[test]
    fn test_kind_strings_are_closed_set() {
        let kinds = [
            "DoctrineLoaded",
            "ConfigChanged",
            "MissionCreated",
            "MissionDecomposed",
            "MissionStateChanged",
            "TaskCreated",
            "TaskCommitDecided",
            "TaskDispatched",
            "TaskCompleted",
            "TaskAborted",
            "ArtifactCreated",
            "ArtifactReviewed",
            "ApprovalRequested",
            "ApprovalGranted",
            "ApprovalRejected",
            "CommitExpired",
            "CapabilityUnlocked",
            "MissionSnapshot",
            "CapacityExhausted",
        ];
        assert!(kinds.contains(&sample_event().kind()));
        assert_eq!(kinds.len(), 19);
    }
}
