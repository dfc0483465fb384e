//! Governance gate: risk classification and the pre-dispatch checks.
//!
//! Every task passes through the same four checks, in order: doctrine,
//! capability, operational caps, and the risk-tier table. The output is a
//! `CommitDecision`; rejection is an in-band `BLOCKED` verdict carrying
//! the exact missing prerequisite, never an exception. Re-evaluating the
//! same inputs yields the same decision.

use serde::{Deserialize, Serialize};

use crate::capability::CapabilityRegistry;
use crate::config::RuntimeConfig;
use crate::types::{Capability, CommitState, Tier, WorkerKind};

/// Param values that mark an action as destructive regardless of kind.
const DESTRUCTIVE_ACTIONS: &[&str] = &["delete", "remove", "destroy", "drop", "wipe", "purge"];

/// The verdict assigned to a task before dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitDecision {
    pub task_id: String,
    pub state: CommitState,
    pub reason: String,
    pub risk: Tier,
    pub countdown_seconds: u64,
    pub approvers_required: u32,
}

/// Everything the gate needs to know about one task. Built by the mission
/// engine from the task record; the gate itself holds no state.
#[derive(Debug, Clone)]
pub struct GateInput<'a> {
    pub task_id: &'a str,
    pub category: &'a str,
    pub kind: WorkerKind,
    pub params: &'a serde_json::Value,
    pub reversible: bool,
    pub declared_tier: Option<Tier>,
    pub produces_artifacts: bool,
    pub verifiable: bool,
    /// Steps this task will fan out to (≤ 3).
    pub fanout: usize,
    /// Stage capabilities required by the worker kinds this task will
    /// spawn (from the worker registry descriptors).
    pub required_capabilities: &'a [Capability],
}

impl GateInput<'_> {
    fn action(&self) -> Option<&str> {
        self.params.get("action").and_then(|v| v.as_str())
    }

    fn recipient(&self) -> Option<&str> {
        self.params.get("recipient").and_then(|v| v.as_str())
    }

    fn estimated_tokens(&self) -> Option<u64> {
        self.params.get("estimated_tokens").and_then(|v| v.as_u64())
    }

    fn is_destructive(&self) -> bool {
        self.action()
            .map(|a| DESTRUCTIVE_ACTIONS.contains(&a))
            .unwrap_or(false)
    }
}

/// The stateless decision engine. Classification and checks are pure
/// functions of `(input, capability stage, config snapshot)`.
#[derive(Debug, Default)]
pub struct GovernanceGate;

impl GovernanceGate {
    pub fn new() -> Self {
        Self
    }

    /// Risk tier for a task. Ties go to the stricter side: the result is
    /// the maximum over kind baseline, destructiveness, external reach,
    /// the planner's declared tier and category overrides.
    pub fn classify(&self, input: &GateInput<'_>, config: &RuntimeConfig) -> Tier {
        let mut tier = if input.reversible {
            match input.kind {
                WorkerKind::Scout => Tier::E,
                WorkerKind::Verify => Tier::D,
                WorkerKind::Builder | WorkerKind::Custom => Tier::C,
            }
        } else {
            Tier::A
        };
        if input.is_destructive() {
            tier = tier.max(Tier::A);
        }
        if input.recipient().is_some() {
            tier = tier.max(Tier::B);
        }
        if let Some(declared) = input.declared_tier {
            tier = tier.max(declared);
        }
        if let Some(&floor) = config.risk_overrides.get(input.category) {
            tier = tier.max(floor);
        }
        tier
    }

    /// Run all checks and produce the commit verdict.
    pub fn evaluate(
        &self,
        input: &GateInput<'_>,
        capability: &CapabilityRegistry,
        config: &RuntimeConfig,
    ) -> CommitDecision {
        let risk = self.classify(input, config);

        // 1. Doctrine gate.
        if !input.produces_artifacts {
            return self.blocked(input, risk, "doctrine:no_artifact_no_existence");
        }
        if !input.verifiable {
            return self.blocked(input, risk, "doctrine:no_verification_rejected");
        }

        // 2. Capability gate.
        for cap in input.required_capabilities {
            if !capability.permitted(*cap) {
                return self.blocked(input, risk, &format!("capability:{cap}"));
            }
        }
        if input.recipient().is_some() && !capability.permitted(Capability::ExternalAction) {
            return self.blocked(
                input,
                risk,
                &format!("capability:{}", Capability::ExternalAction),
            );
        }

        // 3. Caps gate: fan-out, whitelist, spend.
        if input.fanout > config.max_total_workers {
            return self.blocked(
                input,
                risk,
                &format!(
                    "caps:fanout {} exceeds max_total_workers {}",
                    input.fanout, config.max_total_workers
                ),
            );
        }
        if let Some(recipient) = input.recipient() {
            if !config.whitelist.iter().any(|w| w == recipient) {
                return self.blocked(input, risk, &format!("whitelist:{recipient}"));
            }
        }
        if let (Some(estimate), Some(cap)) = (input.estimated_tokens(), config.max_cost_per_task)
        {
            if estimate > cap {
                return self.blocked(
                    input,
                    risk,
                    &format!("caps:spend estimate {estimate} exceeds cap {cap}"),
                );
            }
        }

        // 4. Risk tier determines the commit state.
        match risk {
            Tier::E | Tier::D => CommitDecision {
                task_id: input.task_id.to_string(),
                state: CommitState::ActionReady,
                reason: "reversible low-risk action".into(),
                risk,
                countdown_seconds: 0,
                approvers_required: 0,
            },
            Tier::C => CommitDecision {
                task_id: input.task_id.to_string(),
                state: CommitState::ActionReady,
                reason: "autonomous, decision logged".into(),
                risk,
                countdown_seconds: 0,
                approvers_required: 0,
            },
            Tier::B => {
                if capability.permitted(Capability::AutonomousChain) {
                    CommitDecision {
                        task_id: input.task_id.to_string(),
                        state: CommitState::ActionReady,
                        reason: "conditional autonomy, abort window open".into(),
                        risk,
                        countdown_seconds: config.countdown_for(Tier::B),
                        approvers_required: 0,
                    }
                } else {
                    // Autonomy not yet earned: stricter side wins and the
                    // task waits for an operator inside an A-width window.
                    CommitDecision {
                        task_id: input.task_id.to_string(),
                        state: CommitState::NeedsConfirm,
                        reason: format!(
                            "autonomy not earned ({}), approval required",
                            Capability::AutonomousChain
                        ),
                        risk,
                        countdown_seconds: config.countdown_for(Tier::A),
                        approvers_required: 1,
                    }
                }
            }
            Tier::A => CommitDecision {
                task_id: input.task_id.to_string(),
                state: CommitState::NeedsConfirm,
                reason: "irreversible action requires approval".into(),
                risk,
                countdown_seconds: config.countdown_for(Tier::A),
                approvers_required: 1,
            },
            Tier::S => CommitDecision {
                task_id: input.task_id.to_string(),
                state: CommitState::NeedsConfirm,
                reason: "highest-risk action requires approval".into(),
                risk,
                countdown_seconds: config.countdown_for(Tier::S),
                approvers_required: config.s_tier_approvers.max(1),
            },
        }
    }

    fn blocked(&self, input: &GateInput<'_>, risk: Tier, reason: &str) -> CommitDecision {
        CommitDecision {
            task_id: input.task_id.to_string(),
            state: CommitState::Blocked,
            reason: reason.to_string(),
            risk,
            countdown_seconds: 0,
            approvers_required: 0,
        }
    }
}
