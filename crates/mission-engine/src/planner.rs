//! Mission decomposition.
//!
//! The kernel treats any planner as opaque: its output is recorded
//! verbatim in `MissionDecomposed`. The built-in fallback is a pure
//! function of `(mission_id, goal, category, constraints)` so replays and
//! restarts decompose identically; an external (LLM-backed) planner may
//! be plugged in behind the same trait.

use governance::{Constraints, PlannedTask, Tier, WorkerKind};

/// Verbs that mark a goal as destructive: the plan becomes a single
/// irreversible builder task that the gate will hold for approval.
const DESTRUCTIVE_VERBS: &[&str] = &["delete", "remove", "destroy", "drop", "wipe", "purge"];

/// Verbs satisfiable by observation alone.
const SCOUT_VERBS: &[&str] = &[
    "read", "scan", "list", "inspect", "fetch", "find", "search", "audit",
];

/// Verbs satisfiable by verification alone.
const VERIFY_VERBS: &[&str] = &["verify", "check", "validate", "test"];

/// Errors from decomposition.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("mission goal is empty")]
    EmptyGoal,

    #[error("unknown pipeline step `{0}` in constraints")]
    UnknownStep(String),

    #[error("planner failed: {0}")]
    Failed(String),
}

/// What a planner sees.
#[derive(Debug, Clone)]
pub struct PlanRequest<'a> {
    pub mission_id: &'a str,
    pub goal: &'a str,
    pub category: &'a str,
    pub constraints: &'a Constraints,
}

/// Decomposes a goal into an ordered task DAG.
pub trait Planner: Send + Sync {
    fn name(&self) -> &str;

    fn plan(&self, req: &PlanRequest<'_>) -> Result<Vec<PlannedTask>, PlanError>;
}

/// The deterministic keyword-driven fallback.
#[derive(Debug, Default)]
pub struct FallbackPlanner;

impl FallbackPlanner {
    pub fn new() -> Self {
        Self
    }

    fn words(goal: &str) -> Vec<String> {
        goal.split_whitespace()
            .map(|w| {
                w.trim_matches(|c: char| !c.is_alphanumeric())
                    .to_ascii_lowercase()
            })
            .filter(|w| !w.is_empty())
            .collect()
    }

    fn matched_verb(words: &[String], verbs: &[&str]) -> Option<String> {
        words
            .iter()
            .find(|w| verbs.contains(&w.as_str()))
            .cloned()
    }

    fn task(
        mission_id: &str,
        index: usize,
        kind: WorkerKind,
        goal: &str,
        action: &str,
        reversible: bool,
        depends_on: Vec<String>,
    ) -> PlannedTask {
        PlannedTask {
            task_id: format!("{mission_id}-t{index}"),
            kind,
            params: serde_json::json!({ "goal": goal, "action": action }),
            reversible,
            retryable: true,
            depends_on,
            produces_artifacts: true,
            verifiable: true,
            declared_tier: None,
        }
    }

    fn pipeline_from_constraints(
        req: &PlanRequest<'_>,
    ) -> Result<Option<Vec<PlannedTask>>, PlanError> {
        let Some(pipeline) = req.constraints.get("pipeline") else {
            return Ok(None);
        };
        let mut tasks = Vec::new();
        for (index, step) in pipeline.split(',').map(str::trim).enumerate() {
            let kind = match step {
                "scout" => WorkerKind::Scout,
                "builder" => WorkerKind::Builder,
                "verify" => WorkerKind::Verify,
                "custom" => WorkerKind::Custom,
                other => return Err(PlanError::UnknownStep(other.to_string())),
            };
            let depends_on = if index == 0 {
                vec![]
            } else {
                vec![format!("{}-t{}", req.mission_id, index - 1)]
            };
            tasks.push(Self::task(
                req.mission_id,
                index,
                kind,
                req.goal,
                "execute",
                true,
                depends_on,
            ));
        }
        if tasks.is_empty() {
            return Err(PlanError::UnknownStep(String::new()));
        }
        Ok(Some(tasks))
    }
}

impl Planner for FallbackPlanner {
    fn name(&self) -> &str {
        "fallback"
    }

    fn plan(&self, req: &PlanRequest<'_>) -> Result<Vec<PlannedTask>, PlanError> {
        let goal = req.goal.trim();
        if goal.is_empty() {
            return Err(PlanError::EmptyGoal);
        }
        if let Some(tasks) = Self::pipeline_from_constraints(req)? {
            return Ok(tasks);
        }

        let words = Self::words(goal);

        if let Some(verb) = Self::matched_verb(&words, DESTRUCTIVE_VERBS) {
            // Destructive intent: one irreversible builder task; the gate
            // takes it from here.
            let mut task =
                Self::task(req.mission_id, 0, WorkerKind::Builder, goal, &verb, false, vec![]);
            task.retryable = false;
            return Ok(vec![task]);
        }
        if let Some(verb) = Self::matched_verb(&words, SCOUT_VERBS) {
            return Ok(vec![Self::task(
                req.mission_id,
                0,
                WorkerKind::Scout,
                goal,
                &verb,
                true,
                vec![],
            )]);
        }
        if let Some(verb) = Self::matched_verb(&words, VERIFY_VERBS) {
            return Ok(vec![Self::task(
                req.mission_id,
                0,
                WorkerKind::Verify,
                goal,
                &verb,
                true,
                vec![],
            )]);
        }

        // General goal: scout the ground, build, then verify the result.
        let t0 = Self::task(req.mission_id, 0, WorkerKind::Scout, goal, "survey", true, vec![]);
        let t1 = Self::task(
            req.mission_id,
            1,
            WorkerKind::Builder,
            goal,
            "build",
            true,
            vec![t0.task_id.clone()],
        );
        let t2 = Self::task(
            req.mission_id,
            2,
            WorkerKind::Verify,
            goal,
            "verify",
            true,
            vec![t1.task_id.clone()],
        );
        Ok(vec![t0, t1, t2])
    }
}

/// Mission rank: the maximum risk tier across its tasks.
pub fn rank_of(tiers: impl IntoIterator<Item = Tier>) -> Tier {
    tiers.into_iter().max().unwrap_or(Tier::E)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request<'a>(goal: &'a str, constraints: &'a Constraints) -> PlanRequest<'a> {
        PlanRequest {
            mission_id: "m-1",
            goal,
            category: "fs",
            constraints,
        }
    }

    #[test]
    fn test_read_goal_is_scout_only() {
        let constraints = Constraints::new();
        let tasks = FallbackPlanner::new()
            .plan(&request("read file foo", &constraints))
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].kind, WorkerKind::Scout);
        assert_eq!(tasks[0].task_id, "m-1-t0");
        assert!(tasks[0].reversible);
        assert_eq!(tasks[0].params["action"], "read");
    }

    #[test]
    fn test_delete_goal_is_single_irreversible_builder() {
        let constraints = Constraints::new();
        let tasks = FallbackPlanner::new()
            .plan(&request("delete file bar", &constraints))
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].kind, WorkerKind::Builder);
        assert!(!tasks[0].reversible);
        assert!(!tasks[0].retryable);
        assert_eq!(tasks[0].params["action"], "delete");
    }

    #[test]
    fn test_general_goal_is_three_step_chain() {
        let constraints = Constraints::new();
        let tasks = FallbackPlanner::new()
            .plan(&request("build a summary of the data directory", &constraints))
            .unwrap();
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].kind, WorkerKind::Scout);
        assert_eq!(tasks[1].kind, WorkerKind::Builder);
        assert_eq!(tasks[2].kind, WorkerKind::Verify);
        assert_eq!(tasks[1].depends_on, vec!["m-1-t0".to_string()]);
        assert_eq!(tasks[2].depends_on, vec!["m-1-t1".to_string()]);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let constraints = Constraints::new();
        let planner = FallbackPlanner::new();
        let a = planner.plan(&request("check the backups", &constraints)).unwrap();
        let b = planner.plan(&request("check the backups", &constraints)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_goal_rejected() {
        let constraints = Constraints::new();
        assert!(matches!(
            FallbackPlanner::new().plan(&request("   ", &constraints)),
            Err(PlanError::EmptyGoal)
        ));
    }

    #[test]
    fn test_pipeline_constraint_overrides() {
        let mut constraints = Constraints::new();
        constraints.insert("pipeline".into(), "scout,verify".into());
        let tasks = FallbackPlanner::new()
            .plan(&request("delete everything", &constraints))
            .unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].kind, WorkerKind::Scout);
        assert_eq!(tasks[1].kind, WorkerKind::Verify);
        assert_eq!(tasks[1].depends_on, vec!["m-1-t0".to_string()]);
    }

    #[test]
    fn test_unknown_pipeline_step_rejected() {
        let mut constraints = Constraints::new();
        constraints.insert("pipeline".into(), "scout,launcher".into());
        assert!(matches!(
            FallbackPlanner::new().plan(&request("go", &constraints)),
            Err(PlanError::UnknownStep(s)) if s == "launcher"
        ));
    }

    #[test]
    fn test_rank_is_max_tier() {
        assert_eq!(rank_of([Tier::E, Tier::A, Tier::C]), Tier::A);
        assert_eq!(rank_of([]), Tier::E);
    }
}
