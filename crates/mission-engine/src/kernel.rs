//! The kernel: one value owning every subsystem, no hidden globals.
//!
//! All mutation of missions and tasks flows through `record`, which
//! appends to the ledger and then folds the entry into the projector and
//! capability registry synchronously, so in-memory views never run ahead
//! of durable history. Each mission runs its own orchestration loop;
//! loops share the dispatcher, the limits and the commit engine.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use governance::{
    Capability, CapabilityRegistry, CommitDecision, CommitState, ConfigError, ConfigStore,
    Constraints, Doctrine, DoctrineViolation, GateInput, GovernanceGate, KernelEvent, Ledger,
    LedgerEntry, LedgerError, LedgerFilter, LedgerTail, LoadedDoctrine, MergeStatus, MissionState,
    MissionView, Projector, ReviewStatus, RuntimeConfig, Stage, TaskState, Tier, WorkerKind,
    WorkerLimits, WorkerRegistry,
};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::artifact::{auto_approvable, Vault, VaultError};
use crate::commit::{ApproveOutcome, CommitEngine, CommitError, PendingState};
use crate::dispatch::{step_sequence, DispatchError, DispatchOutcome, SwarmDispatcher};
use crate::mission::{IllegalTransition, Mission};
use crate::planner::{rank_of, PlanRequest, Planner};
use crate::task::Task;
use crate::worker::WorkerSet;

/// Segment name prefix for the kernel's ledger.
pub const LEDGER_NAME: &str = "core";

/// Boot-time failures, mapped to host exit codes.
#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] LedgerError),

    #[error("data directory error: {0}")]
    DataDir(std::io::Error),

    #[error("doctrine violation at boot: {0}")]
    Doctrine(#[from] DoctrineViolation),
}

impl BootError {
    pub fn exit_code(&self) -> i32 {
        match self {
            BootError::Config(_) => 2,
            BootError::Storage(_) | BootError::DataDir(_) => 3,
            BootError::Doctrine(_) => 4,
        }
    }
}

/// Control-plane failures returned to the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("mission {0} not found")]
    NotFound(String),

    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    #[error("task {0} has no pending approval")]
    NotPending(String),

    #[error("approver {0} is not authorized")]
    Unauthorized(String),

    #[error("mission rejected: {0}")]
    Rejected(String),

    #[error("artifact {artifact_id} cannot move {from} -> {to}")]
    IllegalReview {
        artifact_id: String,
        from: ReviewStatus,
        to: ReviewStatus,
    },

    #[error(transparent)]
    Storage(#[from] LedgerError),
}

impl From<CommitError> for ControlError {
    fn from(err: CommitError) -> Self {
        match err {
            CommitError::NotPending(task_id) => ControlError::NotPending(task_id),
        }
    }
}

/// On-disk layout under the data directory.
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub root: PathBuf,
    pub ledger_dir: PathBuf,
    pub snapshots_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub config_dir: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            ledger_dir: root.join("ledger"),
            snapshots_dir: root.join("snapshots"),
            artifacts_dir: root.join("artifacts"),
            config_dir: root.join("config"),
            root,
        }
    }

    fn ensure(&self) -> std::io::Result<()> {
        for dir in [
            &self.root,
            &self.ledger_dir,
            &self.snapshots_dir,
            &self.artifacts_dir,
            &self.config_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Response to `CreateMission`.
#[derive(Debug, Clone, PartialEq)]
pub struct MissionTicket {
    pub mission_id: String,
    pub state: MissionState,
}

/// Filter for `ListMissions`.
#[derive(Debug, Clone, Default)]
pub struct MissionFilter {
    pub state: Option<MissionState>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MissionSignal {
    Run,
    Pause,
    Abort,
}

struct MissionRuntime {
    mission: Mission,
    tasks: HashMap<String, Task>,
    control: watch::Sender<MissionSignal>,
    cancel: CancellationToken,
}

enum Progress {
    Finished { success: bool, reason: Option<String> },
    Parked { reason: String },
    Working,
}

struct TaskRun {
    task_id: String,
    attempt: u32,
    verdict: TaskVerdict,
}

enum TaskVerdict {
    Completed(DispatchOutcome),
    ApprovalRejected { approver: String, reason: String },
    ApprovalExpired,
    AdmissionFailed,
    NoWorker(WorkerKind),
    Cancelled,
}

struct KernelInner {
    paths: DataPaths,
    doctrine: LoadedDoctrine,
    config: ConfigStore,
    ledger: Arc<Ledger>,
    projector: Mutex<Projector>,
    capability: Mutex<CapabilityRegistry>,
    gate: GovernanceGate,
    limits: Arc<WorkerLimits>,
    registry: Arc<WorkerRegistry>,
    dispatcher: SwarmDispatcher,
    commit: CommitEngine,
    planner: Box<dyn Planner>,
    vault: Vault,
    missions: Mutex<HashMap<String, MissionRuntime>>,
}

/// Cloneable handle to the kernel; all clones share one state.
#[derive(Clone)]
pub struct Kernel {
    inner: Arc<KernelInner>,
}

impl Kernel {
    /// Open the data directory, load doctrine and config, replay the
    /// ledger, and record `DoctrineLoaded` for this process run. Call
    /// [`Kernel::recover`] afterwards to resume interrupted missions.
    pub fn open(
        root: impl AsRef<Path>,
        planner: Box<dyn Planner>,
        workers: WorkerSet,
    ) -> Result<Kernel, BootError> {
        let paths = DataPaths::new(root);
        paths.ensure().map_err(BootError::DataDir)?;

        let doctrine = Doctrine::load(&paths.config_dir.join("doctrine.json"))?;
        let config = RuntimeConfig::load(&paths.config_dir.join("runtime.json"))?;
        let ledger = Arc::new(Ledger::open(&paths.ledger_dir, LEDGER_NAME)?);

        let mut projector = Projector::new();
        let mut capability = CapabilityRegistry::new();
        for entry in ledger.read(&LedgerFilter::new())? {
            projector.apply(&entry);
            capability.observe(&entry.event);
        }

        let vault = Vault::open(&paths.artifacts_dir).map_err(|err| match err {
            VaultError::Io(io) => BootError::DataDir(io),
            VaultError::NotFound(_) => {
                BootError::DataDir(std::io::Error::other("artifact vault missing"))
            }
        })?;

        let limits = Arc::new(WorkerLimits::new());
        let registry = Arc::new(WorkerRegistry::new());
        let dispatcher =
            SwarmDispatcher::new(Arc::clone(&limits), Arc::clone(&registry), workers);

        let kernel = Kernel {
            inner: Arc::new(KernelInner {
                doctrine: doctrine.clone(),
                config: ConfigStore::new(config),
                ledger,
                projector: Mutex::new(projector),
                capability: Mutex::new(capability),
                gate: GovernanceGate::new(),
                limits,
                registry,
                dispatcher,
                commit: CommitEngine::new(),
                planner,
                vault,
                missions: Mutex::new(HashMap::new()),
                paths,
            }),
        };

        kernel.record(KernelEvent::DoctrineLoaded {
            hash: doctrine.hash.clone(),
            defaults: doctrine.defaults,
        })?;
        info!(hash = %doctrine.hash, defaults = doctrine.defaults, "kernel open");
        Ok(kernel)
    }

    pub fn paths(&self) -> &DataPaths {
        &self.inner.paths
    }

    pub fn doctrine(&self) -> &Doctrine {
        &self.inner.doctrine.doctrine
    }

    /// Append an event, then fold it (and any capability unlock it
    /// triggers) into the derived state before returning.
    ///
    /// The projector lock is held across the append so entries are
    /// applied in exactly their ledger order (single-threaded projector).
    fn record(&self, event: KernelEvent) -> Result<Arc<LedgerEntry>, LedgerError> {
        let mut projector = self.inner.projector.lock().expect("projector lock poisoned");
        let entry = self.inner.ledger.append(event)?;
        projector.apply(&entry);
        let unlock = self
            .inner
            .capability
            .lock()
            .expect("capability lock poisoned")
            .observe(&entry.event);
        if let Some(unlock) = unlock {
            let follow = self.inner.ledger.append(KernelEvent::CapabilityUnlocked {
                stage: unlock.stage,
                capabilities: unlock.capabilities,
                successful_missions: unlock.successful_missions,
            })?;
            projector.apply(&follow);
            self.inner
                .capability
                .lock()
                .expect("capability lock poisoned")
                .observe(&follow.event);
        }
        Ok(entry)
    }

    // ------------------------------------------------------------------
    // Control plane
    // ------------------------------------------------------------------

    /// Create a mission from operator intent. With an idempotency key the
    /// call returns the existing mission instead of creating a twin.
    pub fn create_mission(
        &self,
        goal: &str,
        category: &str,
        constraints: Constraints,
        idempotency_key: Option<String>,
    ) -> Result<MissionTicket, ControlError> {
        if let Some(key) = idempotency_key.as_deref() {
            let existing = {
                let projector = self.inner.projector.lock().expect("projector lock poisoned");
                let found = projector
                    .missions()
                    .find(|m| m.idempotency_key.as_deref() == Some(key))
                    .map(|m| MissionTicket {
                        mission_id: m.mission_id.clone(),
                        state: m.state,
                    });
                found
            };
            if let Some(ticket) = existing {
                debug!(key, mission_id = %ticket.mission_id, "idempotent mission create");
                return Ok(ticket);
            }
        }

        let mission_id = Uuid::new_v4().to_string();
        let request = PlanRequest {
            mission_id: &mission_id,
            goal,
            category,
            constraints: &constraints,
        };
        let planned = match self.inner.planner.plan(&request) {
            Ok(planned) => planned,
            Err(err) => {
                // Governance-relevant rejection: audit it, then surface.
                self.record(KernelEvent::MissionCreated {
                    mission_id: mission_id.clone(),
                    goal: goal.to_string(),
                    category: category.to_string(),
                    constraints: constraints.clone(),
                    rank: Tier::E,
                    idempotency_key,
                })?;
                self.record(KernelEvent::MissionStateChanged {
                    mission_id,
                    from: MissionState::Created,
                    to: MissionState::Rejected,
                    reason: Some(err.to_string()),
                })?;
                return Err(ControlError::Rejected(err.to_string()));
            }
        };

        let config = self.inner.config.get();
        let mut tasks = HashMap::new();
        let mut tiers = Vec::new();
        for plan in &planned {
            let steps = step_sequence(plan.kind, &plan.params);
            let required = self.required_caps(&steps);
            let tier = {
                let input = GateInput {
                    task_id: &plan.task_id,
                    category,
                    kind: plan.kind,
                    params: &plan.params,
                    reversible: plan.reversible,
                    declared_tier: plan.declared_tier,
                    produces_artifacts: plan.produces_artifacts,
                    verifiable: plan.verifiable,
                    fanout: steps.len(),
                    required_capabilities: &required,
                };
                self.inner.gate.classify(&input, &config)
            };
            tiers.push(tier);
            tasks.insert(
                plan.task_id.clone(),
                Task::from_planned(&mission_id, plan, tier),
            );
        }
        let rank = rank_of(tiers.iter().copied());

        let mut mission = Mission::new(
            mission_id.clone(),
            goal.to_string(),
            category.to_string(),
            constraints.clone(),
            rank,
        );
        mission.task_ids = planned.iter().map(|p| p.task_id.clone()).collect();

        self.record(KernelEvent::MissionCreated {
            mission_id: mission_id.clone(),
            goal: goal.to_string(),
            category: category.to_string(),
            constraints,
            rank,
            idempotency_key,
        })?;
        self.record(KernelEvent::MissionDecomposed {
            mission_id: mission_id.clone(),
            planner: self.inner.planner.name().to_string(),
            tasks: planned.clone(),
        })?;
        for (plan, tier) in planned.iter().zip(tiers.iter()) {
            self.record(KernelEvent::TaskCreated {
                mission_id: mission_id.clone(),
                task_id: plan.task_id.clone(),
                kind: plan.kind,
                params: plan.params.clone(),
                risk_tier: *tier,
                reversible: plan.reversible,
                retryable: plan.retryable,
                depends_on: plan.depends_on.clone(),
            })?;
        }

        {
            let (control, _) = watch::channel(MissionSignal::Run);
            let mut missions = self.inner.missions.lock().expect("missions lock poisoned");
            missions.insert(
                mission_id.clone(),
                MissionRuntime {
                    mission,
                    tasks,
                    control,
                    cancel: CancellationToken::new(),
                },
            );
        }
        let state = self.transition(&mission_id, MissionState::Queued, None)?;

        let kernel = self.clone();
        let spawn_id = mission_id.clone();
        tokio::spawn(async move { kernel.mission_loop(spawn_id).await });

        Ok(MissionTicket { mission_id, state })
    }

    pub fn pause_mission(&self, mission_id: &str) -> Result<MissionState, ControlError> {
        let state = self.transition(mission_id, MissionState::Paused, Some("operator pause"))?;
        self.signal(mission_id, MissionSignal::Pause)?;
        Ok(state)
    }

    pub fn resume_mission(&self, mission_id: &str) -> Result<MissionState, ControlError> {
        let state = self.transition(mission_id, MissionState::Running, Some("operator resume"))?;
        self.signal(mission_id, MissionSignal::Run)?;
        Ok(state)
    }

    pub fn abort_mission(&self, mission_id: &str) -> Result<MissionState, ControlError> {
        let state = self.transition(mission_id, MissionState::Aborted, Some("operator abort"))?;
        self.signal(mission_id, MissionSignal::Abort)?;
        let cancel = {
            let missions = self.inner.missions.lock().expect("missions lock poisoned");
            missions.get(mission_id).map(|rt| rt.cancel.clone())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        Ok(state)
    }

    /// Count an operator approval. Idempotent: re-approving writes no
    /// duplicate ledger entries (the waiter records the grant exactly
    /// once, right before dispatch).
    pub fn approve_task(
        &self,
        task_id: &str,
        approver: &str,
    ) -> Result<ApproveOutcome, ControlError> {
        let config = self.inner.config.get();
        if !config.approver_allowed(approver) {
            return Err(ControlError::Unauthorized(approver.to_string()));
        }
        Ok(self.inner.commit.approve(task_id, approver)?)
    }

    pub fn reject_task(
        &self,
        task_id: &str,
        approver: &str,
        reason: &str,
    ) -> Result<(), ControlError> {
        let config = self.inner.config.get();
        if !config.approver_allowed(approver) {
            return Err(ControlError::Unauthorized(approver.to_string()));
        }
        Ok(self.inner.commit.reject(task_id, approver, reason)?)
    }

    pub fn get_mission(&self, mission_id: &str) -> Result<MissionView, ControlError> {
        let projector = self.inner.projector.lock().expect("projector lock poisoned");
        projector
            .mission(mission_id)
            .cloned()
            .ok_or_else(|| ControlError::NotFound(mission_id.to_string()))
    }

    pub fn list_missions(&self, filter: &MissionFilter) -> Vec<MissionView> {
        let projector = self.inner.projector.lock().expect("projector lock poisoned");
        projector
            .missions()
            .filter(|m| filter.state.map(|s| m.state == s).unwrap_or(true))
            .filter(|m| {
                filter
                    .category
                    .as_deref()
                    .map(|c| m.category == c)
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    pub fn tail_ledger(&self, from_seq: u64) -> LedgerTail {
        self.inner.ledger.tail(from_seq)
    }

    /// Bounded scan over the ledger (audit reads).
    pub fn read_ledger(&self, filter: &LedgerFilter) -> Result<Vec<LedgerEntry>, ControlError> {
        Ok(self.inner.ledger.read(filter)?)
    }

    /// Live worker accounting against the current caps.
    pub fn worker_utilization(&self) -> governance::WorkerUtilization {
        self.inner.limits.utilization(&self.inner.config.get())
    }

    pub fn get_capability(&self) -> (Stage, Vec<Capability>) {
        let capability = self
            .inner
            .capability
            .lock()
            .expect("capability lock poisoned");
        (capability.stage(), capability.permitted_set())
    }

    /// Operator review of a pending artifact.
    pub fn review_artifact(
        &self,
        artifact_id: &str,
        reviewer: &str,
        approve: bool,
        note: Option<String>,
    ) -> Result<ReviewStatus, ControlError> {
        let target = if approve {
            ReviewStatus::Approved
        } else {
            ReviewStatus::Rejected
        };
        self.review_transition(artifact_id, reviewer, target, note)
    }

    /// Retire a reviewed artifact.
    pub fn archive_artifact(
        &self,
        artifact_id: &str,
        reviewer: &str,
    ) -> Result<ReviewStatus, ControlError> {
        self.review_transition(artifact_id, reviewer, ReviewStatus::Archived, None)
    }

    fn review_transition(
        &self,
        artifact_id: &str,
        reviewer: &str,
        target: ReviewStatus,
        note: Option<String>,
    ) -> Result<ReviewStatus, ControlError> {
        let current = {
            let projector = self.inner.projector.lock().expect("projector lock poisoned");
            projector
                .artifact(artifact_id)
                .map(|a| a.status)
                .ok_or_else(|| ControlError::NotFound(artifact_id.to_string()))?
        };
        if !current.can_transition(target) {
            return Err(ControlError::IllegalReview {
                artifact_id: artifact_id.to_string(),
                from: current,
                to: target,
            });
        }
        self.record(KernelEvent::ArtifactReviewed {
            artifact_id: artifact_id.to_string(),
            status: target,
            reviewed_by: reviewer.to_string(),
            note,
        })?;
        Ok(target)
    }

    /// Install a new runtime config; the change is ledger-recorded before
    /// it takes effect.
    pub fn update_config(
        &self,
        config: RuntimeConfig,
        changed_by: &str,
    ) -> Result<u64, ControlError> {
        config
            .validate()
            .map_err(|e| ControlError::Rejected(e.to_string()))?;
        let revision = self.inner.config.revision() + 1;
        self.record(KernelEvent::ConfigChanged {
            revision,
            changed_by: changed_by.to_string(),
            config: serde_json::to_value(&config).unwrap_or_default(),
        })?;
        let runtime_path = self.inner.paths.config_dir.join("runtime.json");
        if let Err(err) = std::fs::write(
            &runtime_path,
            serde_json::to_vec_pretty(&config).unwrap_or_default(),
        ) {
            warn!(path = %runtime_path.display(), error = %err, "runtime config write failed");
        }
        self.inner
            .config
            .apply(config)
            .map_err(|e| ControlError::Rejected(e.to_string()))?;
        Ok(revision)
    }

    pub fn config(&self) -> Arc<RuntimeConfig> {
        self.inner.config.get()
    }

    /// Serialized derived state, for the host `status` command and the
    /// replay-purity property.
    pub fn derived_state_json(&self) -> String {
        self.inner
            .projector
            .lock()
            .expect("projector lock poisoned")
            .snapshot_json()
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// Resume interrupted missions after a restart: rebuild runtimes from
    /// the replayed views, abort orphaned dispatches, re-open pending
    /// confirmation windows at their original wall-clock deadlines.
    pub fn recover(&self) -> Result<usize, ControlError> {
        let views: Vec<MissionView> = {
            let projector = self.inner.projector.lock().expect("projector lock poisoned");
            projector
                .missions()
                .filter(|m| !m.state.is_terminal())
                .cloned()
                .collect()
        };
        let config = self.inner.config.get();
        let mut resumed = 0;

        for view in views {
            let mission = match Mission::from_history(
                view.mission_id.clone(),
                view.goal.clone(),
                view.category.clone(),
                view.constraints.clone(),
                view.rank,
                view.created_at,
                view.task_order.clone(),
                view.history.clone(),
            ) {
                Ok(mission) => mission,
                Err(err) => {
                    error!(mission_id = %view.mission_id, error = %err, "unreplayable mission skipped");
                    continue;
                }
            };

            let mut tasks = HashMap::new();
            for (task_id, tv) in &view.tasks {
                let mut task = Task {
                    task_id: tv.task_id.clone(),
                    mission_id: view.mission_id.clone(),
                    kind: tv.kind,
                    params: tv.params.clone(),
                    risk_tier: tv.risk_tier,
                    reversible: tv.reversible,
                    retryable: tv.retryable,
                    depends_on: tv.depends_on.clone(),
                    state: tv.state,
                    attempts: tv.attempts,
                    artifact_ids: tv.artifact_ids.clone(),
                    produces_artifacts: true,
                    verifiable: true,
                    declared_tier: None,
                    decision: tv.commit.as_ref().map(|c| CommitDecision {
                        task_id: tv.task_id.clone(),
                        state: c.state,
                        reason: c.reason.clone(),
                        risk: c.risk,
                        countdown_seconds: c.countdown_seconds,
                        approvers_required: c.approvers_required,
                    }),
                    blocked_reason: tv.blocked_reason.clone(),
                };

                if task.state == TaskState::Running {
                    // Dispatched with no completion: abort, retry only when
                    // safe; irreversible work is never re-run blindly.
                    self.record(KernelEvent::TaskAborted {
                        mission_id: view.mission_id.clone(),
                        task_id: task_id.clone(),
                        reason: "orphaned_by_restart".into(),
                    })?;
                    let confirmable = task
                        .decision
                        .as_ref()
                        .map(|d| d.state == CommitState::NeedsConfirm)
                        .unwrap_or(false);
                    if task.retryable && !confirmable && task.attempts < config.max_attempts {
                        // Re-gate from scratch; the decision is idempotent
                        // for identical inputs.
                        task.state = TaskState::Pending;
                        task.decision = None;
                    } else {
                        task.state = TaskState::Aborted;
                        task.blocked_reason = Some("orphaned_by_restart".into());
                    }
                }
                tasks.insert(task_id.clone(), task);
            }

            // Re-open or honor confirmation windows recorded before the
            // restart.
            let queue: Vec<_> = {
                let projector = self.inner.projector.lock().expect("projector lock poisoned");
                projector
                    .commit_queue()
                    .filter(|e| e.mission_id == view.mission_id)
                    .cloned()
                    .collect()
            };
            for pending in queue {
                let Some(task) = tasks.get_mut(&pending.task_id) else {
                    continue;
                };
                match pending.state {
                    governance::CommitQueueState::Waiting => {
                        if let Some(decision) = task.decision.clone() {
                            self.inner
                                .commit
                                .register(&view.mission_id, &decision, pending.deadline);
                        }
                    }
                    governance::CommitQueueState::Approved => {
                        // Already granted before the crash; dispatch without
                        // re-asking.
                        if let Some(decision) = task.decision.as_mut() {
                            decision.state = CommitState::ActionReady;
                            decision.countdown_seconds = 0;
                        }
                    }
                    _ => {}
                }
            }

            let paused = mission.state() == MissionState::Paused;
            {
                let (control, _) = watch::channel(if paused {
                    MissionSignal::Pause
                } else {
                    MissionSignal::Run
                });
                let mut missions = self.inner.missions.lock().expect("missions lock poisoned");
                missions.insert(
                    view.mission_id.clone(),
                    MissionRuntime {
                        mission,
                        tasks,
                        control,
                        cancel: CancellationToken::new(),
                    },
                );
            }

            let kernel = self.clone();
            let mission_id = view.mission_id.clone();
            tokio::spawn(async move { kernel.mission_loop(mission_id).await });
            resumed += 1;
        }
        if resumed > 0 {
            info!(resumed, "missions resumed after restart");
        }
        Ok(resumed)
    }

    // ------------------------------------------------------------------
    // Orchestration loop
    // ------------------------------------------------------------------

    async fn mission_loop(self, mission_id: String) {
        if let Err(err) = self.run_mission(&mission_id).await {
            error!(%mission_id, error = %err, "mission loop failed");
        }
    }

    async fn run_mission(&self, mission_id: &str) -> Result<(), ControlError> {
        let (mut control, cancel) = {
            let missions = self.inner.missions.lock().expect("missions lock poisoned");
            let rt = missions
                .get(mission_id)
                .ok_or_else(|| ControlError::NotFound(mission_id.to_string()))?;
            (rt.control.subscribe(), rt.cancel.clone())
        };

        // Bring the mission to RUNNING, honoring a paused or aborted start.
        loop {
            let state = self.mission_state(mission_id)?;
            match state {
                MissionState::Created => {
                    self.transition(mission_id, MissionState::Queued, None)?;
                }
                MissionState::Queued => {
                    self.transition(mission_id, MissionState::Running, None)?;
                }
                MissionState::Paused => {
                    if control.changed().await.is_err() {
                        return Ok(());
                    }
                    if *control.borrow() == MissionSignal::Abort {
                        return Ok(());
                    }
                }
                MissionState::Running => break,
                _ => return Ok(()),
            }
        }

        let mut inflight: JoinSet<TaskRun> = JoinSet::new();
        let mut launched: HashSet<String> = HashSet::new();

        loop {
            let signal = *control.borrow();
            match signal {
                MissionSignal::Abort => {
                    self.drain_aborted(mission_id, &mut inflight, &cancel).await?;
                    return Ok(());
                }
                MissionSignal::Pause => {
                    if control.changed().await.is_err() {
                        return Ok(());
                    }
                    continue;
                }
                MissionSignal::Run => {}
            }

            self.mark_doomed_tasks(mission_id)?;
            let launched_now =
                self.decide_and_launch(mission_id, &mut inflight, &mut launched, &cancel)?;

            match self.progress(mission_id)? {
                Progress::Finished { success, reason } if inflight.is_empty() => {
                    self.finish_mission(mission_id, success, reason)?;
                    return Ok(());
                }
                Progress::Parked { reason } if inflight.is_empty() => {
                    self.finish_mission(mission_id, false, Some(reason))?;
                    return Ok(());
                }
                _ => {}
            }

            if inflight.is_empty() && launched_now == 0 {
                // Never-stall backstop: nothing running, nothing admissible,
                // not finished.
                self.finish_mission(mission_id, false, Some("stalled".into()))?;
                return Ok(());
            }

            tokio::select! {
                joined = inflight.join_next(), if !inflight.is_empty() => {
                    match joined {
                        Some(Ok(run)) => {
                            self.handle_task_run(mission_id, run, &mut inflight, &mut launched, &cancel)?;
                        }
                        Some(Err(err)) => {
                            warn!(%mission_id, error = %err, "task future panicked");
                        }
                        None => {}
                    }
                }
                changed = control.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Evaluate newly-ready tasks and launch everything admissible.
    fn decide_and_launch(
        &self,
        mission_id: &str,
        inflight: &mut JoinSet<TaskRun>,
        launched: &mut HashSet<String>,
        cancel: &CancellationToken,
    ) -> Result<usize, ControlError> {
        // Decide pending tasks whose dependencies are satisfied.
        let to_decide: Vec<Task> = {
            let missions = self.inner.missions.lock().expect("missions lock poisoned");
            let rt = missions
                .get(mission_id)
                .ok_or_else(|| ControlError::NotFound(mission_id.to_string()))?;
            rt.tasks
                .values()
                .filter(|t| {
                    t.state == TaskState::Pending
                        && t.decision.is_none()
                        && !t.is_blocked()
                        && t.deps_satisfied(&rt.tasks)
                })
                .cloned()
                .collect()
        };
        for task in to_decide {
            let (decision, deadline) = self.decide_task(mission_id, &task)?;
            self.update_task(mission_id, &task.task_id, |t| {
                t.decision = Some(decision.clone());
                match decision.state {
                    CommitState::Blocked => {
                        t.blocked_reason = Some(decision.reason.clone());
                    }
                    CommitState::ActionReady | CommitState::NeedsConfirm => {
                        t.state = TaskState::Ready;
                    }
                }
            });
            if let (CommitState::NeedsConfirm, Some(deadline)) = (decision.state, deadline) {
                self.inner.commit.register(mission_id, &decision, deadline);
            }
        }

        // Launch ready tasks that are not already in flight.
        let to_launch: Vec<Task> = {
            let missions = self.inner.missions.lock().expect("missions lock poisoned");
            let rt = missions
                .get(mission_id)
                .ok_or_else(|| ControlError::NotFound(mission_id.to_string()))?;
            rt.tasks
                .values()
                .filter(|t| t.state == TaskState::Ready && !launched.contains(&t.task_id))
                .cloned()
                .collect()
        };
        let config = self.inner.config.get();
        let mut count = 0;
        for task in to_launch {
            launched.insert(task.task_id.clone());
            let kernel = self.clone();
            let config = Arc::clone(&config);
            let cancel = cancel.clone();
            let attempt = task.attempts + 1;
            inflight.spawn(async move {
                kernel
                    .run_task(task, attempt, config, cancel, false)
                    .await
            });
            count += 1;
        }
        Ok(count)
    }

    fn decide_task(
        &self,
        mission_id: &str,
        task: &Task,
    ) -> Result<(CommitDecision, Option<DateTime<Utc>>), ControlError> {
        let config = self.inner.config.get();
        let category = {
            let missions = self.inner.missions.lock().expect("missions lock poisoned");
            missions
                .get(mission_id)
                .map(|rt| rt.mission.category.clone())
                .unwrap_or_default()
        };
        let steps = step_sequence(task.kind, &task.params);
        let required = self.required_caps(&steps);
        let decision = {
            let capability = self
                .inner
                .capability
                .lock()
                .expect("capability lock poisoned");
            let input = GateInput {
                task_id: &task.task_id,
                category: &category,
                kind: task.kind,
                params: &task.params,
                reversible: task.reversible,
                declared_tier: task.declared_tier,
                produces_artifacts: task.produces_artifacts,
                verifiable: task.verifiable,
                fanout: steps.len(),
                required_capabilities: &required,
            };
            self.inner.gate.evaluate(&input, &capability, &config)
        };

        let deadline = (decision.state == CommitState::NeedsConfirm).then(|| {
            Utc::now() + chrono::Duration::seconds(decision.countdown_seconds as i64)
        });
        self.record(KernelEvent::TaskCommitDecided {
            mission_id: mission_id.to_string(),
            task_id: decision.task_id.clone(),
            state: decision.state,
            risk: decision.risk,
            reason: decision.reason.clone(),
            countdown_seconds: decision.countdown_seconds,
            approvers_required: decision.approvers_required,
            deadline,
        })?;
        if let Some(deadline) = deadline {
            self.record(KernelEvent::ApprovalRequested {
                mission_id: mission_id.to_string(),
                task_id: decision.task_id.clone(),
                risk: decision.risk,
                approvers_required: decision.approvers_required,
                deadline,
            })?;
        }
        Ok((decision, deadline))
    }

    /// One task attempt, from commit outcome to merged worker result.
    async fn run_task(
        &self,
        task: Task,
        attempt: u32,
        config: Arc<RuntimeConfig>,
        cancel: CancellationToken,
        skip_confirm: bool,
    ) -> TaskRun {
        let task_id = task.task_id.clone();
        let Some(decision) = task.decision.clone() else {
            warn!(%task_id, "task launched without a decision snapshot");
            return TaskRun {
                task_id,
                attempt,
                verdict: TaskVerdict::AdmissionFailed,
            };
        };

        if decision.state == CommitState::NeedsConfirm && !skip_confirm {
            let deadline = Utc::now()
                + chrono::Duration::seconds(decision.countdown_seconds as i64);
            let rx = self
                .inner
                .commit
                .register(&task.mission_id, &decision, deadline);
            match self.inner.commit.await_outcome(&task_id, rx).await {
                PendingState::Approved { approvers } => {
                    // Grants land in the ledger before the dispatch they
                    // authorize.
                    for approver in approvers {
                        if self
                            .record(KernelEvent::ApprovalGranted {
                                task_id: task_id.clone(),
                                approver,
                            })
                            .is_err()
                        {
                            return TaskRun {
                                task_id,
                                attempt,
                                verdict: TaskVerdict::AdmissionFailed,
                            };
                        }
                    }
                }
                PendingState::Rejected { approver, reason } => {
                    let _ = self.record(KernelEvent::ApprovalRejected {
                        task_id: task_id.clone(),
                        approver: approver.clone(),
                        reason: reason.clone(),
                    });
                    return TaskRun {
                        task_id,
                        attempt,
                        verdict: TaskVerdict::ApprovalRejected { approver, reason },
                    };
                }
                PendingState::Expired => {
                    let _ = self.record(KernelEvent::CommitExpired {
                        mission_id: task.mission_id.clone(),
                        task_id: task_id.clone(),
                        deadline,
                    });
                    return TaskRun {
                        task_id,
                        attempt,
                        verdict: TaskVerdict::ApprovalExpired,
                    };
                }
                PendingState::Waiting => unreachable!("await_outcome never returns Waiting"),
            }
        }

        if decision.state == CommitState::ActionReady && decision.countdown_seconds > 0 {
            // Autonomous-but-risky: an abort window before execution.
            tokio::select! {
                _ = cancel.cancelled() => {
                    return TaskRun { task_id, attempt, verdict: TaskVerdict::Cancelled };
                }
                _ = tokio::time::sleep(Duration::from_secs(decision.countdown_seconds)) => {}
            }
        }

        let steps = step_sequence(task.kind, &task.params);
        let queue_recorder = |queued: bool| {
            let kernel = self.clone();
            let mission_id = task.mission_id.clone();
            let task_id = task_id.clone();
            let kind = steps[0];
            move || {
                let _ = kernel.record(KernelEvent::CapacityExhausted {
                    mission_id: mission_id.clone(),
                    task_id: task_id.clone(),
                    kind,
                    queued,
                });
            }
        };

        let first = match self
            .inner
            .dispatcher
            .admit(steps[0], &config, &cancel, queue_recorder(true))
            .await
        {
            Ok(admission) => admission,
            Err(DispatchError::Cancelled) => {
                return TaskRun {
                    task_id,
                    attempt,
                    verdict: TaskVerdict::Cancelled,
                }
            }
            Err(DispatchError::Capacity(_)) => {
                queue_recorder(false)();
                return TaskRun {
                    task_id,
                    attempt,
                    verdict: TaskVerdict::AdmissionFailed,
                };
            }
            Err(DispatchError::NoWorker(kind)) => {
                warn!(%task_id, %kind, "no worker registered for kind");
                return TaskRun {
                    task_id,
                    attempt,
                    verdict: TaskVerdict::NoWorker(kind),
                };
            }
        };

        if self
            .record(KernelEvent::TaskDispatched {
                mission_id: task.mission_id.clone(),
                task_id: task_id.clone(),
                attempt,
                steps: steps.clone(),
            })
            .is_err()
        {
            return TaskRun {
                task_id,
                attempt,
                verdict: TaskVerdict::AdmissionFailed,
            };
        }
        self.update_task(&task.mission_id, &task_id, |t| {
            t.state = TaskState::Running;
            t.attempts = attempt;
        });

        match self
            .inner
            .dispatcher
            .run(&task, &steps, first, &config, &cancel, queue_recorder(true))
            .await
        {
            Ok(outcome) => TaskRun {
                task_id,
                attempt,
                verdict: TaskVerdict::Completed(outcome),
            },
            Err(DispatchError::Cancelled) => TaskRun {
                task_id,
                attempt,
                verdict: TaskVerdict::Cancelled,
            },
            Err(DispatchError::Capacity(_)) => TaskRun {
                task_id,
                attempt,
                verdict: TaskVerdict::AdmissionFailed,
            },
            Err(DispatchError::NoWorker(kind)) => TaskRun {
                task_id,
                attempt,
                verdict: TaskVerdict::NoWorker(kind),
            },
        }
    }

    fn handle_task_run(
        &self,
        mission_id: &str,
        run: TaskRun,
        inflight: &mut JoinSet<TaskRun>,
        launched: &mut HashSet<String>,
        cancel: &CancellationToken,
    ) -> Result<(), ControlError> {
        let config = self.inner.config.get();
        match run.verdict {
            TaskVerdict::Completed(outcome) => {
                let task = self
                    .task_snapshot(mission_id, &run.task_id)
                    .ok_or_else(|| ControlError::NotFound(run.task_id.clone()))?;

                // Newest stored version per artifact name for this task, so
                // a re-emitted artifact (retry or revision) chains onto its
                // predecessor instead of restarting at version 1.
                let mut latest_by_name: HashMap<String, (String, u32)> = {
                    let projector =
                        self.inner.projector.lock().expect("projector lock poisoned");
                    let mut latest: HashMap<String, (String, u32)> = HashMap::new();
                    for id in &task.artifact_ids {
                        let Some(view) = projector.artifact(id) else {
                            continue;
                        };
                        let Some(name) = view.name.clone() else {
                            continue;
                        };
                        match latest.get(&name) {
                            Some((_, version)) if *version >= view.version => {}
                            _ => {
                                latest.insert(name, (view.artifact_id.clone(), view.version));
                            }
                        }
                    }
                    latest
                };

                let mut artifact_ids = Vec::new();
                for draft in &outcome.artifacts {
                    let previous = draft
                        .name
                        .as_deref()
                        .and_then(|name| latest_by_name.get(name))
                        .map(|(id, version)| (id.clone(), *version));
                    let stored = match self
                        .inner
                        .vault
                        .store(draft, previous.as_ref().map(|(id, v)| (id.as_str(), *v)))
                    {
                        Ok(stored) => stored,
                        Err(err) => {
                            warn!(task_id = %run.task_id, error = %err, "artifact store failed");
                            continue;
                        }
                    };
                    self.record(KernelEvent::ArtifactCreated {
                        mission_id: mission_id.to_string(),
                        task_id: run.task_id.clone(),
                        artifact_id: stored.artifact_id.clone(),
                        artifact_type: draft.artifact_type,
                        name: draft.name.clone(),
                        version: stored.version,
                        previous_version_id: stored.previous_version_id.clone(),
                        content_hash: stored.content_hash.clone(),
                        content_ref: stored.content_ref.clone(),
                        input_snapshot: task.params.clone(),
                    })?;
                    if let Some(name) = &draft.name {
                        latest_by_name
                            .insert(name.clone(), (stored.artifact_id.clone(), stored.version));
                    }
                    let auto = auto_approvable(task.risk_tier)
                        && self
                            .inner
                            .capability
                            .lock()
                            .expect("capability lock poisoned")
                            .permitted(Capability::ArtifactAutoApprove);
                    if auto {
                        self.record(KernelEvent::ArtifactReviewed {
                            artifact_id: stored.artifact_id.clone(),
                            status: ReviewStatus::Approved,
                            reviewed_by: "auto".into(),
                            note: None,
                        })?;
                    }
                    artifact_ids.push(stored.artifact_id);
                }

                let success = outcome.status == MergeStatus::Success;
                let will_retry =
                    !success && task.retryable && run.attempt < config.max_attempts;
                self.record(KernelEvent::TaskCompleted {
                    mission_id: mission_id.to_string(),
                    task_id: run.task_id.clone(),
                    attempt: run.attempt,
                    status: outcome.status,
                    will_retry,
                    cost: outcome.cost,
                    artifact_ids: artifact_ids.clone(),
                    errors: outcome.errors.clone(),
                })?;
                self.update_task(mission_id, &run.task_id, |t| {
                    t.attempts = run.attempt;
                    for id in &artifact_ids {
                        if !t.artifact_ids.contains(id) {
                            t.artifact_ids.push(id.clone());
                        }
                    }
                    t.state = if will_retry {
                        TaskState::Pending
                    } else if success {
                        TaskState::Succeeded
                    } else {
                        TaskState::Failed
                    };
                });
                self.inner.commit.clear(&run.task_id);

                if will_retry {
                    let backoff = backoff_with_jitter(&config.retry, &run.task_id, run.attempt);
                    info!(
                        task_id = %run.task_id,
                        attempt = run.attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "task retry scheduled"
                    );
                    let kernel = self.clone();
                    let cancel = cancel.clone();
                    let config = Arc::clone(&config);
                    let task_id = run.task_id.clone();
                    let mission_id = mission_id.to_string();
                    let next_attempt = run.attempt + 1;
                    inflight.spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                return TaskRun {
                                    task_id,
                                    attempt: next_attempt,
                                    verdict: TaskVerdict::Cancelled,
                                };
                            }
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        let Some(task) = kernel.task_snapshot(&mission_id, &task_id) else {
                            return TaskRun {
                                task_id,
                                attempt: next_attempt,
                                verdict: TaskVerdict::AdmissionFailed,
                            };
                        };
                        // The decision snapshot is final; an already-granted
                        // confirmation is not re-asked on retry.
                        kernel.run_task(task, next_attempt, config, cancel, true).await
                    });
                } else {
                    launched.remove(&run.task_id);
                }
            }
            TaskVerdict::ApprovalRejected { approver, reason } => {
                self.record(KernelEvent::TaskAborted {
                    mission_id: mission_id.to_string(),
                    task_id: run.task_id.clone(),
                    reason: format!("approval_rejected by {approver}: {reason}"),
                })?;
                self.update_task(mission_id, &run.task_id, |t| {
                    t.state = TaskState::Aborted;
                    t.blocked_reason = Some("approval_rejected".into());
                });
                self.inner.commit.clear(&run.task_id);
            }
            TaskVerdict::ApprovalExpired => {
                self.update_task(mission_id, &run.task_id, |t| {
                    t.state = TaskState::Pending;
                    t.blocked_reason = Some("approval_timeout".into());
                });
                self.inner.commit.clear(&run.task_id);
            }
            TaskVerdict::AdmissionFailed => {
                self.record(KernelEvent::TaskAborted {
                    mission_id: mission_id.to_string(),
                    task_id: run.task_id.clone(),
                    reason: "admission_deadline_exceeded".into(),
                })?;
                self.update_task(mission_id, &run.task_id, |t| {
                    t.state = TaskState::Aborted;
                    t.blocked_reason = Some("capacity".into());
                });
            }
            TaskVerdict::NoWorker(kind) => {
                // A missing plugin is a wiring problem; retrying or
                // queueing cannot produce a worker.
                self.record(KernelEvent::TaskAborted {
                    mission_id: mission_id.to_string(),
                    task_id: run.task_id.clone(),
                    reason: format!("no_worker:{kind}"),
                })?;
                self.update_task(mission_id, &run.task_id, |t| {
                    t.state = TaskState::Aborted;
                    t.blocked_reason = Some(format!("no_worker:{kind}"));
                });
            }
            TaskVerdict::Cancelled => {
                self.record(KernelEvent::TaskAborted {
                    mission_id: mission_id.to_string(),
                    task_id: run.task_id.clone(),
                    reason: "cancelled".into(),
                })?;
                self.update_task(mission_id, &run.task_id, |t| {
                    t.state = TaskState::Aborted;
                });
            }
        }
        Ok(())
    }

    /// Tasks whose dependencies ended without succeeding can never run;
    /// fail them now so the mission can settle.
    fn mark_doomed_tasks(&self, mission_id: &str) -> Result<(), ControlError> {
        let doomed: Vec<String> = {
            let missions = self.inner.missions.lock().expect("missions lock poisoned");
            let rt = missions
                .get(mission_id)
                .ok_or_else(|| ControlError::NotFound(mission_id.to_string()))?;
            rt.tasks
                .values()
                .filter(|t| t.state == TaskState::Pending && !t.is_blocked())
                .filter(|t| {
                    t.depends_on.iter().any(|dep| {
                        rt.tasks
                            .get(dep)
                            .map(|d| {
                                (d.state.is_terminal() && d.state != TaskState::Succeeded)
                                    || d.is_blocked()
                            })
                            .unwrap_or(true)
                    })
                })
                .map(|t| t.task_id.clone())
                .collect()
        };
        for task_id in doomed {
            self.record(KernelEvent::TaskAborted {
                mission_id: mission_id.to_string(),
                task_id: task_id.clone(),
                reason: "dependency_failed".into(),
            })?;
            self.update_task(mission_id, &task_id, |t| {
                t.state = TaskState::Aborted;
                t.blocked_reason = Some("dependency_failed".into());
            });
        }
        Ok(())
    }

    fn progress(&self, mission_id: &str) -> Result<Progress, ControlError> {
        let missions = self.inner.missions.lock().expect("missions lock poisoned");
        let rt = missions
            .get(mission_id)
            .ok_or_else(|| ControlError::NotFound(mission_id.to_string()))?;
        let tasks = &rt.tasks;

        if tasks.values().all(|t| t.state.is_terminal()) {
            let success = tasks.values().all(|t| t.state == TaskState::Succeeded);
            let reason = if success {
                None
            } else {
                tasks.values().find_map(|t| {
                    t.blocked_reason
                        .clone()
                        .or_else(|| {
                            (t.state == TaskState::Failed)
                                .then(|| format!("task {} failed", t.task_id))
                        })
                })
            };
            return Ok(Progress::Finished { success, reason });
        }

        let non_terminal_all_parked = tasks
            .values()
            .filter(|t| !t.state.is_terminal())
            .all(|t| t.is_blocked());
        if non_terminal_all_parked {
            let reason = tasks
                .values()
                .find_map(|t| t.blocked_reason.clone())
                .unwrap_or_else(|| "blocked".into());
            return Ok(Progress::Parked { reason });
        }
        Ok(Progress::Working)
    }

    fn finish_mission(
        &self,
        mission_id: &str,
        success: bool,
        reason: Option<String>,
    ) -> Result<(), ControlError> {
        let to = if success {
            MissionState::Success
        } else {
            MissionState::Failure
        };
        self.transition(mission_id, to, reason.as_deref())?;

        let snapshot = {
            let projector = self.inner.projector.lock().expect("projector lock poisoned");
            projector
                .mission(mission_id)
                .and_then(|m| serde_json::to_value(m).ok())
                .unwrap_or(serde_json::Value::Null)
        };
        self.record(KernelEvent::MissionSnapshot {
            mission_id: mission_id.to_string(),
            snapshot: snapshot.clone(),
        })?;
        let snapshot_path = self
            .inner
            .paths
            .snapshots_dir
            .join(format!("{mission_id}.json"));
        if let Err(err) = std::fs::write(
            &snapshot_path,
            serde_json::to_vec_pretty(&snapshot).unwrap_or_default(),
        ) {
            warn!(path = %snapshot_path.display(), error = %err, "snapshot file write failed");
        }
        info!(%mission_id, success, "mission finished");
        Ok(())
    }

    async fn drain_aborted(
        &self,
        mission_id: &str,
        inflight: &mut JoinSet<TaskRun>,
        cancel: &CancellationToken,
    ) -> Result<(), ControlError> {
        cancel.cancel();
        while let Some(joined) = inflight.join_next().await {
            let Ok(run) = joined else { continue };
            match run.verdict {
                TaskVerdict::Cancelled => {
                    self.record(KernelEvent::TaskAborted {
                        mission_id: mission_id.to_string(),
                        task_id: run.task_id.clone(),
                        reason: "operator_abort".into(),
                    })?;
                    self.update_task(mission_id, &run.task_id, |t| {
                        t.state = TaskState::Aborted;
                    });
                }
                other => {
                    // A result that raced the abort is still history.
                    let run = TaskRun {
                        task_id: run.task_id,
                        attempt: run.attempt,
                        verdict: other,
                    };
                    let mut no_retries = JoinSet::new();
                    let mut dropped = HashSet::new();
                    self.handle_task_run(mission_id, run, &mut no_retries, &mut dropped, cancel)?;
                    no_retries.abort_all();
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Runtime-map helpers
    // ------------------------------------------------------------------

    fn mission_state(&self, mission_id: &str) -> Result<MissionState, ControlError> {
        let missions = self.inner.missions.lock().expect("missions lock poisoned");
        missions
            .get(mission_id)
            .map(|rt| rt.mission.state())
            .ok_or_else(|| ControlError::NotFound(mission_id.to_string()))
    }

    fn transition(
        &self,
        mission_id: &str,
        to: MissionState,
        reason: Option<&str>,
    ) -> Result<MissionState, ControlError> {
        let from = {
            let mut missions = self.inner.missions.lock().expect("missions lock poisoned");
            let rt = missions
                .get_mut(mission_id)
                .ok_or_else(|| ControlError::NotFound(mission_id.to_string()))?;
            let from = rt.mission.state();
            rt.mission.advance(to, reason)?;
            from
        };
        self.record(KernelEvent::MissionStateChanged {
            mission_id: mission_id.to_string(),
            from,
            to,
            reason: reason.map(String::from),
        })?;
        Ok(to)
    }

    fn signal(&self, mission_id: &str, signal: MissionSignal) -> Result<(), ControlError> {
        let missions = self.inner.missions.lock().expect("missions lock poisoned");
        let rt = missions
            .get(mission_id)
            .ok_or_else(|| ControlError::NotFound(mission_id.to_string()))?;
        let _ = rt.control.send(signal);
        Ok(())
    }

    fn update_task(&self, mission_id: &str, task_id: &str, f: impl FnOnce(&mut Task)) {
        let mut missions = self.inner.missions.lock().expect("missions lock poisoned");
        if let Some(task) = missions
            .get_mut(mission_id)
            .and_then(|rt| rt.tasks.get_mut(task_id))
        {
            f(task);
        }
    }

    fn task_snapshot(&self, mission_id: &str, task_id: &str) -> Option<Task> {
        let missions = self.inner.missions.lock().expect("missions lock poisoned");
        missions
            .get(mission_id)
            .and_then(|rt| rt.tasks.get(task_id))
            .cloned()
    }

    /// Union of stage capabilities required by the worker kinds a task
    /// will spawn.
    fn required_caps(&self, steps: &[WorkerKind]) -> Vec<Capability> {
        let mut caps: Vec<Capability> = Vec::new();
        for step in steps {
            if let Some(spec) = self.inner.registry.spec(*step) {
                for cap in &spec.required_capabilities {
                    if !caps.contains(cap) {
                        caps.push(*cap);
                    }
                }
            }
        }
        caps
    }
}

/// Exponential backoff with a deterministic ±jitter derived from the task
/// identity, so replays and tests see stable schedules.
fn backoff_with_jitter(
    retry: &governance::RetryPolicy,
    task_id: &str,
    attempt: u32,
) -> Duration {
    let base = retry.backoff_ms(attempt) as f64;
    let hash = blake3::hash(format!("{task_id}:{attempt}").as_bytes());
    let byte = hash.as_bytes()[0] as f64;
    let fraction = (byte / 255.0) * 2.0 - 1.0;
    let jittered = base * (1.0 + retry.jitter * fraction);
    Duration::from_millis(jittered.clamp(0.0, retry.cap_ms as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_paths_layout() {
        let paths = DataPaths::new("/tmp/kernel-data");
        assert!(paths.ledger_dir.ends_with("ledger"));
        assert!(paths.snapshots_dir.ends_with("snapshots"));
        assert!(paths.artifacts_dir.ends_with("artifacts"));
        assert!(paths.config_dir.ends_with("config"));
    }

    #[test]
    fn test_backoff_jitter_is_deterministic_and_bounded() {
        let retry = governance::RetryPolicy::default();
        let a = backoff_with_jitter(&retry, "t-1", 1);
        let b = backoff_with_jitter(&retry, "t-1", 1);
        assert_eq!(a, b);

        let base = retry.backoff_ms(1) as f64;
        let ms = a.as_millis() as f64;
        assert!(ms >= base * 0.75 && ms <= base * 1.25, "jitter within ±25%");

        // Different attempts jitter independently but stay capped.
        for attempt in 1..12 {
            let d = backoff_with_jitter(&retry, "t-2", attempt);
            assert!(d.as_millis() as u64 <= retry.cap_ms);
        }
    }

    #[test]
    fn test_boot_error_exit_codes() {
        assert_eq!(
            BootError::Config(ConfigError::Invalid("x".into())).exit_code(),
            2
        );
        assert_eq!(
            BootError::Doctrine(DoctrineViolation::DisabledInvariant("append_only")).exit_code(),
            4
        );
        assert_eq!(
            BootError::Storage(LedgerError::Closed).exit_code(),
            3
        );
    }
}
