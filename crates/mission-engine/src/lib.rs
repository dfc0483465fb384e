//! Mission engine: the execution kernel of the operator-sovereign runtime.
//!
//! Composes the governance substrate into a running system:
//! - **mission**: lifecycle state machine with legal transition guards
//! - **planner**: goal decomposition into a task DAG (pure fallback)
//! - **commit**: the never-stall decision gate with operator countdowns
//! - **dispatch**: bounded worker fan-out, merge, timeout, cancellation
//! - **worker**: the plugin contract workers implement
//! - **artifact**: content-addressed vault for durable worker outputs
//! - **kernel**: one value owning it all, plus the control plane

pub mod artifact;
pub mod commit;
pub mod dispatch;
pub mod kernel;
pub mod mission;
pub mod planner;
pub mod task;
pub mod worker;

// Re-export the kernel surface
pub use kernel::{
    BootError, ControlError, DataPaths, Kernel, MissionFilter, MissionTicket, LEDGER_NAME,
};

// Re-export mission state machine types
pub use mission::{fold_history, is_legal_transition, HistoryError, IllegalTransition, Mission};

// Re-export commit engine types
pub use commit::{ApproveOutcome, CommitEngine, CommitError, PendingState};

// Re-export dispatcher types
pub use dispatch::{
    merge_value, step_sequence, Admission, DispatchError, DispatchOutcome, StepReport,
    SwarmDispatcher,
};

// Re-export worker contract types
pub use worker::{
    ArtifactDraft, EchoWorker, FnWorker, Worker, WorkerContext, WorkerFailure, WorkerResult,
    WorkerSet,
};

// Re-export planner types
pub use planner::{FallbackPlanner, PlanError, PlanRequest, Planner};

// Re-export artifact vault types
pub use artifact::{StoredArtifact, Vault, VaultError};

// Re-export task record
pub use task::Task;
