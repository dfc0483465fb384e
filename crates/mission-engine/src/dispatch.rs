//! Swarm dispatcher: bounded per-task fan-out and result merge.
//!
//! A task becomes a short step sequence (at most 3 workers). Each step
//! asks the limits for a slot first (queueing or failing per config),
//! then runs under its own timeout with a cancellation handle. The
//! dispatcher owns every worker future; results are merged and returned
//! synchronously from its perspective, and cancellation discards partial
//! results after a bounded grace period.

use std::sync::Arc;
use std::time::Duration;

use governance::{
    CapacityExhausted, Cost, MergeStatus, RuntimeConfig, SaturationPolicy, StepStatus,
    WorkerKind, WorkerLimits, WorkerRegistry,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::task::Task;
use crate::worker::{ArtifactDraft, WorkerContext, WorkerFailure, WorkerResult, WorkerSet};

/// Errors that abort a dispatch as a whole.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Capacity(#[from] CapacityExhausted),

    #[error("dispatch cancelled")]
    Cancelled,

    #[error("no worker implementation registered for kind {0}")]
    NoWorker(WorkerKind),
}

/// Per-step record in the merged outcome.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub kind: WorkerKind,
    pub status: StepStatus,
    pub elapsed_ms: u64,
    pub errors: Vec<String>,
}

/// The merged result of all executed steps.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub status: MergeStatus,
    pub data: serde_json::Value,
    pub artifacts: Vec<ArtifactDraft>,
    pub cost: Cost,
    pub errors: Vec<String>,
    pub steps: Vec<StepReport>,
}

/// A claimed worker slot. Dropping it releases the slot and wakes queued
/// admissions, so a panicking step can never leak capacity.
#[derive(Debug)]
pub struct Admission {
    limits: Arc<WorkerLimits>,
    kind: WorkerKind,
}

impl Admission {
    pub fn kind(&self) -> WorkerKind {
        self.kind
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.limits.unregister_worker(self.kind);
    }
}

/// The step sequence for a task. Kind defaults can be overridden by a
/// `params["steps"]` subset; never more than three steps.
pub fn step_sequence(kind: WorkerKind, params: &serde_json::Value) -> Vec<WorkerKind> {
    if let Some(steps) = params.get("steps").and_then(|v| v.as_array()) {
        let parsed: Vec<WorkerKind> = steps
            .iter()
            .filter_map(|s| s.as_str())
            .filter_map(parse_kind)
            .take(3)
            .collect();
        if !parsed.is_empty() {
            return parsed;
        }
    }
    match kind {
        WorkerKind::Scout => vec![WorkerKind::Scout],
        WorkerKind::Verify => vec![WorkerKind::Verify],
        // Builders always verify what they built.
        WorkerKind::Builder => vec![WorkerKind::Builder, WorkerKind::Verify],
        WorkerKind::Custom => vec![WorkerKind::Scout, WorkerKind::Builder, WorkerKind::Verify],
    }
}

fn parse_kind(s: &str) -> Option<WorkerKind> {
    match s {
        "scout" => Some(WorkerKind::Scout),
        "builder" => Some(WorkerKind::Builder),
        "verify" => Some(WorkerKind::Verify),
        "custom" => Some(WorkerKind::Custom),
        _ => None,
    }
}

/// Map-merge with last-wins scalars and concatenated arrays.
pub fn merge_value(a: serde_json::Value, b: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match (a, b) {
        (Value::Object(mut a), Value::Object(b)) => {
            for (key, vb) in b {
                let merged = match a.remove(&key) {
                    Some(va) => merge_value(va, vb),
                    None => vb,
                };
                a.insert(key, merged);
            }
            Value::Object(a)
        }
        (Value::Array(mut a), Value::Array(b)) => {
            a.extend(b);
            Value::Array(a)
        }
        (a, Value::Null) => a,
        (_, b) => b,
    }
}

/// The dispatcher proper.
pub struct SwarmDispatcher {
    limits: Arc<WorkerLimits>,
    registry: Arc<WorkerRegistry>,
    workers: WorkerSet,
}

impl SwarmDispatcher {
    pub fn new(limits: Arc<WorkerLimits>, registry: Arc<WorkerRegistry>, workers: WorkerSet) -> Self {
        Self {
            limits,
            registry,
            workers,
        }
    }

    /// Claim a slot for `kind`, queueing while the pool is saturated
    /// (unless the config says reject). `on_queued` fires once, on the
    /// transition into the queue, so the caller can record the wait.
    ///
    /// A kind with no registered implementation fails here, before any
    /// capacity is claimed; waiting or retrying cannot fix a missing
    /// plugin.
    pub async fn admit(
        &self,
        kind: WorkerKind,
        config: &RuntimeConfig,
        cancel: &CancellationToken,
        mut on_queued: impl FnMut(),
    ) -> Result<Admission, DispatchError> {
        if self.workers.get(kind).is_none() {
            return Err(DispatchError::NoWorker(kind));
        }
        let deadline = config
            .admission_deadline_secs
            .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));
        let mut queued = false;
        loop {
            // Obtain the release future before re-checking, so a release
            // between check and await cannot be missed.
            let released = self.limits.released();
            if self.limits.register_spawn(kind, config) {
                return Ok(Admission {
                    limits: Arc::clone(&self.limits),
                    kind,
                });
            }
            if config.on_saturation == SaturationPolicy::Reject {
                return Err(CapacityExhausted { kind }.into());
            }
            if !queued {
                queued = true;
                on_queued();
            }
            match deadline {
                Some(deadline) => tokio::select! {
                    _ = released => {}
                    _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                    _ = tokio::time::sleep_until(deadline) => {
                        return Err(CapacityExhausted { kind }.into());
                    }
                },
                None => tokio::select! {
                    _ = released => {}
                    _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                },
            }
        }
    }

    /// Execute the task's steps sequentially and merge their results.
    ///
    /// `first` must be an admission for `steps[0]`; later steps claim
    /// their own slots (and may queue). A failed step short-circuits the
    /// remainder unless `params["continue_on_failure"]` is set.
    pub async fn run(
        &self,
        task: &Task,
        steps: &[WorkerKind],
        first: Admission,
        config: &RuntimeConfig,
        cancel: &CancellationToken,
        mut on_queued: impl FnMut(),
    ) -> Result<DispatchOutcome, DispatchError> {
        let continue_on_failure = task
            .params
            .get("continue_on_failure")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let mut combined = serde_json::Value::Null;
        let mut artifacts = Vec::new();
        let mut cost = Cost::default();
        let mut errors = Vec::new();
        let mut reports: Vec<StepReport> = Vec::new();
        let mut admission = Some(first);

        for (index, step) in steps.iter().copied().enumerate() {
            let slot = match admission.take() {
                Some(slot) if slot.kind() == step && index == 0 => slot,
                other => {
                    drop(other);
                    self.admit(step, config, cancel, &mut on_queued).await?
                }
            };

            let started = std::time::Instant::now();
            let result = self.execute_step(task, step, &combined, config, cancel).await;
            drop(slot);
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(step_result) => {
                    let status = step_result.status;
                    combined = merge_value(combined, step_result.data);
                    artifacts.extend(step_result.artifacts);
                    cost.add(&step_result.cost);
                    errors.extend(step_result.errors.iter().cloned());
                    reports.push(StepReport {
                        kind: step,
                        status,
                        elapsed_ms,
                        errors: step_result.errors,
                    });
                    if status == StepStatus::Failed && !continue_on_failure {
                        debug!(task_id = %task.task_id, %step, "mandatory step failed, short-circuiting");
                        break;
                    }
                }
                Err(WorkerFailure::Cancelled) => return Err(DispatchError::Cancelled),
                Err(failure) => {
                    warn!(task_id = %task.task_id, %step, error = %failure, "worker step failed");
                    errors.push(failure.to_string());
                    reports.push(StepReport {
                        kind: step,
                        status: StepStatus::Failed,
                        elapsed_ms,
                        errors: vec![failure.to_string()],
                    });
                    if !continue_on_failure {
                        break;
                    }
                }
            }
        }

        let succeeded = reports
            .iter()
            .filter(|r| r.status == StepStatus::Succeeded)
            .count();
        let failed = reports.len() - succeeded;
        let status = if failed == 0 && succeeded > 0 {
            MergeStatus::Success
        } else if succeeded > 0 {
            MergeStatus::Partial
        } else {
            MergeStatus::Failure
        };

        Ok(DispatchOutcome {
            status,
            data: combined,
            artifacts,
            cost,
            errors,
            steps: reports,
        })
    }

    async fn execute_step(
        &self,
        task: &Task,
        step: WorkerKind,
        prior: &serde_json::Value,
        config: &RuntimeConfig,
        cancel: &CancellationToken,
    ) -> Result<WorkerResult, WorkerFailure> {
        let worker = self
            .workers
            .get(step)
            .ok_or_else(|| WorkerFailure::Crashed(format!("no worker for kind {step}")))?;
        let ctx = WorkerContext {
            mission_id: task.mission_id.clone(),
            task_id: task.task_id.clone(),
            step,
            params: task.params.clone(),
            prior: prior.clone(),
        };
        let step_timeout = Duration::from_secs(self.registry.timeout_secs(step, config));
        let grace = Duration::from_secs(config.cancel_grace_secs);

        let fut = worker.run(ctx);
        tokio::pin!(fut);
        tokio::select! {
            result = tokio::time::timeout(step_timeout, &mut fut) => match result {
                Ok(inner) => inner,
                Err(_) => Err(WorkerFailure::Timeout),
            },
            _ = cancel.cancelled() => {
                // Let the worker wind down for the grace period, then
                // abandon it; its partial result is discarded either way.
                let _ = tokio::time::timeout(grace, &mut fut).await;
                Err(WorkerFailure::Cancelled)
            }
        }
    }
}
