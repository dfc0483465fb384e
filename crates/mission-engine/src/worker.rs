//! The worker plugin contract.
//!
//! Workers are isolated: they receive a context, may block on their own
//! I/O, and return a `WorkerResult`. They cannot reach the ledger or the
//! mission engine; the dispatcher owns their futures and merges their
//! results. Concrete filesystem/API workers live outside the core; the
//! built-ins here are a closure adapter for tests and a trivial echo
//! worker so the runtime is operable without external plugins.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use governance::{ArtifactType, Cost, StepStatus, WorkerKind};
use serde::{Deserialize, Serialize};

/// What one worker invocation sees.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub mission_id: String,
    pub task_id: String,
    /// The step being executed, not necessarily the task's kind.
    pub step: WorkerKind,
    pub params: serde_json::Value,
    /// Combined data from earlier steps of the same task.
    pub prior: serde_json::Value,
}

/// An artifact produced by a worker, before the vault assigns identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactDraft {
    pub artifact_type: ArtifactType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub content: String,
}

/// The result a worker hands back to the dispatcher.
#[derive(Debug, Clone)]
pub struct WorkerResult {
    pub status: StepStatus,
    pub data: serde_json::Value,
    pub artifacts: Vec<ArtifactDraft>,
    pub cost: Cost,
    pub errors: Vec<String>,
}

impl WorkerResult {
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            status: StepStatus::Succeeded,
            data,
            artifacts: Vec::new(),
            cost: Cost::default(),
            errors: Vec::new(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            data: serde_json::Value::Null,
            artifacts: Vec::new(),
            cost: Cost::default(),
            errors: vec![error.into()],
        }
    }

    pub fn with_artifact(mut self, artifact: ArtifactDraft) -> Self {
        self.artifacts.push(artifact);
        self
    }

    pub fn with_cost(mut self, cost: Cost) -> Self {
        self.cost = cost;
        self
    }
}

/// Worker-side failures, distinct from a clean `Failed` result.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkerFailure {
    #[error("worker timed out")]
    Timeout,

    #[error("worker cancelled")]
    Cancelled,

    #[error("worker crashed: {0}")]
    Crashed(String),

    #[error("worker produced an unparseable result: {0}")]
    Unparseable(String),
}

/// The plugin contract.
#[async_trait]
pub trait Worker: Send + Sync {
    fn kind(&self) -> WorkerKind;

    async fn run(&self, ctx: WorkerContext) -> Result<WorkerResult, WorkerFailure>;
}

/// Implementations available to the dispatcher, keyed by kind.
#[derive(Default, Clone)]
pub struct WorkerSet {
    workers: BTreeMap<WorkerKind, Arc<dyn Worker>>,
}

impl WorkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, worker: Arc<dyn Worker>) {
        self.workers.insert(worker.kind(), worker);
    }

    pub fn with(mut self, worker: Arc<dyn Worker>) -> Self {
        self.register(worker);
        self
    }

    pub fn get(&self, kind: WorkerKind) -> Option<Arc<dyn Worker>> {
        self.workers.get(&kind).cloned()
    }

    /// Echo workers for every kind: enough to exercise the full pipeline
    /// without external plugins.
    pub fn builtin() -> Self {
        let mut set = Self::new();
        for kind in [
            WorkerKind::Scout,
            WorkerKind::Builder,
            WorkerKind::Verify,
            WorkerKind::Custom,
        ] {
            set.register(Arc::new(EchoWorker { kind }));
        }
        set
    }
}

type WorkerFuture = Pin<Box<dyn Future<Output = Result<WorkerResult, WorkerFailure>> + Send>>;

/// Closure-backed worker, used by tests to script step behavior.
pub struct FnWorker {
    kind: WorkerKind,
    func: Box<dyn Fn(WorkerContext) -> WorkerFuture + Send + Sync>,
}

impl FnWorker {
    pub fn new<F, Fut>(kind: WorkerKind, func: F) -> Self
    where
        F: Fn(WorkerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<WorkerResult, WorkerFailure>> + Send + 'static,
    {
        Self {
            kind,
            func: Box::new(move |ctx| Box::pin(func(ctx))),
        }
    }
}

#[async_trait]
impl Worker for FnWorker {
    fn kind(&self) -> WorkerKind {
        self.kind
    }

    async fn run(&self, ctx: WorkerContext) -> Result<WorkerResult, WorkerFailure> {
        (self.func)(ctx).await
    }
}

/// Trivial built-in: succeeds immediately and leaves a text artifact
/// describing what it saw.
pub struct EchoWorker {
    kind: WorkerKind,
}

#[async_trait]
impl Worker for EchoWorker {
    fn kind(&self) -> WorkerKind {
        self.kind
    }

    async fn run(&self, ctx: WorkerContext) -> Result<WorkerResult, WorkerFailure> {
        let goal = ctx
            .params
            .get("goal")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let content = format!("step={} task={} goal={goal}", ctx.step, ctx.task_id);
        Ok(WorkerResult::success(serde_json::json!({
            "step": ctx.step.to_string(),
            "observations": [content.clone()],
        }))
        .with_artifact(ArtifactDraft {
            artifact_type: ArtifactType::Log,
            name: Some(format!("{}-{}", ctx.task_id, ctx.step)),
            content,
        })
        .with_cost(Cost {
            time_ms: 1,
            tokens: 0,
            api_calls: 0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(step: WorkerKind) -> WorkerContext {
        WorkerContext {
            mission_id: "m-1".into(),
            task_id: "m-1-t0".into(),
            step,
            params: serde_json::json!({"goal": "read file foo"}),
            prior: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_echo_worker_emits_artifact() {
        let set = WorkerSet::builtin();
        let worker = set.get(WorkerKind::Scout).unwrap();
        let result = worker.run(ctx(WorkerKind::Scout)).await.unwrap();
        assert_eq!(result.status, StepStatus::Succeeded);
        assert_eq!(result.artifacts.len(), 1);
        assert!(result.artifacts[0].content.contains("read file foo"));
    }

    #[tokio::test]
    async fn test_fn_worker_scripts_behavior() {
        let worker = FnWorker::new(WorkerKind::Builder, |ctx| async move {
            if ctx.prior.is_null() {
                Ok(WorkerResult::failure("no prior data"))
            } else {
                Ok(WorkerResult::success(serde_json::json!({"built": true})))
            }
        });
        let result = worker.run(ctx(WorkerKind::Builder)).await.unwrap();
        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.errors, vec!["no prior data".to_string()]);
    }

    #[test]
    fn test_worker_set_lookup() {
        let set = WorkerSet::new().with(Arc::new(EchoWorker {
            kind: WorkerKind::Verify,
        }));
        assert!(set.get(WorkerKind::Verify).is_some());
        assert!(set.get(WorkerKind::Scout).is_none());
    }
}
