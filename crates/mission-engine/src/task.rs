//! Task records: the units gated by commit decisions and dispatched to
//! the swarm.

use std::collections::HashMap;

use governance::{CommitDecision, PlannedTask, TaskState, Tier, WorkerKind};

/// A unit of work produced by decomposition.
#[derive(Debug, Clone)]
pub struct Task {
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
    /// Planner hints carried through to the gate.
    pub produces_artifacts: bool,
    pub verifiable: bool,
    pub declared_tier: Option<Tier>,
    /// The decision snapshot taken at governance evaluation time; retries
    /// reuse it, they are never re-gated mid-flight.
    pub decision: Option<CommitDecision>,
    /// Exactly one named reason when parked by a BLOCKED verdict.
    pub blocked_reason: Option<String>,
}

impl Task {
    pub fn from_planned(mission_id: &str, planned: &PlannedTask, risk_tier: Tier) -> Self {
        Self {
            task_id: planned.task_id.clone(),
            mission_id: mission_id.to_string(),
            kind: planned.kind,
            params: planned.params.clone(),
            risk_tier,
            reversible: planned.reversible,
            retryable: planned.retryable,
            depends_on: planned.depends_on.clone(),
            state: TaskState::Pending,
            attempts: 0,
            artifact_ids: Vec::new(),
            produces_artifacts: planned.produces_artifacts,
            verifiable: planned.verifiable,
            declared_tier: planned.declared_tier,
            decision: None,
            blocked_reason: None,
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked_reason.is_some() && !self.state.is_terminal()
    }

    /// Whether every dependency has succeeded.
    pub fn deps_satisfied(&self, tasks: &HashMap<String, Task>) -> bool {
        self.depends_on.iter().all(|dep| {
            tasks
                .get(dep)
                .map(|t| t.state == TaskState::Succeeded)
                .unwrap_or(false)
        })
    }

    /// Whether any dependency ended without succeeding, making this task
    /// unreachable.
    pub fn deps_doomed(&self, tasks: &HashMap<String, Task>) -> bool {
        self.depends_on.iter().any(|dep| {
            tasks
                .get(dep)
                .map(|t| t.state.is_terminal() && t.state != TaskState::Succeeded)
                .unwrap_or(true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use governance::TaskState;

    fn planned(id: &str, deps: Vec<&str>) -> PlannedTask {
        PlannedTask {
            task_id: id.into(),
            kind: WorkerKind::Scout,
            params: serde_json::json!({}),
            reversible: true,
            retryable: true,
            depends_on: deps.into_iter().map(String::from).collect(),
            produces_artifacts: true,
            verifiable: true,
            declared_tier: None,
        }
    }

    #[test]
    fn test_dependency_readiness() {
        let mut tasks = HashMap::new();
        let mut t0 = Task::from_planned("m", &planned("t0", vec![]), Tier::E);
        let t1 = Task::from_planned("m", &planned("t1", vec!["t0"]), Tier::E);

        tasks.insert("t0".to_string(), t0.clone());
        assert!(!t1.deps_satisfied(&tasks));
        assert!(!t1.deps_doomed(&tasks));

        t0.state = TaskState::Succeeded;
        tasks.insert("t0".to_string(), t0.clone());
        assert!(t1.deps_satisfied(&tasks));

        t0.state = TaskState::Failed;
        tasks.insert("t0".to_string(), t0);
        assert!(!t1.deps_satisfied(&tasks));
        assert!(t1.deps_doomed(&tasks));
    }

    #[test]
    fn test_missing_dependency_is_doomed() {
        let tasks = HashMap::new();
        let t = Task::from_planned("m", &planned("t1", vec!["ghost"]), Tier::E);
        assert!(t.deps_doomed(&tasks));
    }
}
