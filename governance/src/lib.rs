//! Governance substrate for the mission kernel.
//!
//! This crate holds the leaves of the system:
//! - the append-only JSONL **ledger** (history is truth),
//! - **doctrine** (immutable invariants) and operator **config**,
//! - the **capability** ladder (stage as a permission set),
//! - the governance **gate** (risk tiers and commit decisions),
//! - the **worker** registry and concurrency limits,
//! - the **projector** that rebuilds every view by replaying the ledger.
//!
//! The mission engine crate composes these into the execution kernel;
//! nothing here reaches upward.

pub mod capability;
pub mod config;
pub mod doctrine;
pub mod events;
pub mod gate;
pub mod ledger;
pub mod projector;
pub mod types;
pub mod workers;

// Re-export key ledger types
pub use ledger::{Ledger, LedgerError, LedgerFilter, LedgerResult, LedgerTail};

// Re-export the event set
pub use events::{KernelEvent, LedgerEntry};

// Re-export doctrine and config types
pub use config::{ConfigError, ConfigStore, RetryPolicy, RuntimeConfig, SaturationPolicy};
pub use doctrine::{Doctrine, DoctrineViolation, LoadedDoctrine};

// Re-export capability types
pub use capability::{CapabilityRegistry, StageUnlock};

// Re-export gate types
pub use gate::{CommitDecision, GateInput, GovernanceGate};

// Re-export worker registry types
pub use workers::{
    CapacityExhausted, WorkerAbility, WorkerLimits, WorkerRegistry, WorkerSpec, WorkerUtilization,
};

// Re-export projector views
pub use projector::{
    ArtifactView, CapabilityView, CommitQueueEntry, CommitQueueState, CommitView, MissionView,
    Projector, SwarmLoadView, TaskView, TimelineEntry,
};

// Re-export shared domain types
pub use types::{
    ArtifactType, Capability, CommitState, Constraints, Cost, MergeStatus, MissionState,
    PlannedTask, ReviewStatus, Stage, StateChange, StepStatus, TaskState, Tier, WorkerKind,
};
