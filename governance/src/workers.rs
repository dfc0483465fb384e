//! Worker registry and concurrency limits.
//!
//! The registry describes what each worker kind is allowed to do; the
//! limits account for live workers under a single lock so the swarm can
//! never exceed the configured caps. Counters clamp at zero. Limit
//! changes are config changes and take effect on the next spawn decision.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::warn;

use crate::config::RuntimeConfig;
use crate::types::{Capability, Tier, WorkerKind};

/// Raised when the pool is saturated and the config says reject, or a
/// queued admission outlives its deadline.
#[derive(Debug, Clone, thiserror::Error)]
#[error("worker pool saturated for kind {kind}")]
pub struct CapacityExhausted {
    pub kind: WorkerKind,
}

/// What a worker implementation may do with its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerAbility {
    Preview,
    Execute,
    Rollback,
}

/// Plugin descriptor for one worker kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub kind: WorkerKind,
    pub abilities: Vec<WorkerAbility>,
    pub risk_level: Tier,
    pub requires_approval: bool,
    pub timeout_default_secs: u64,
    /// Stage capabilities a task must hold to spawn this kind. Pure
    /// observation (scout, verify) is open even at DORMANT; anything
    /// that executes needs WORKER_SPAWN.
    pub required_capabilities: Vec<Capability>,
}

/// Typed catalog of worker kinds.
#[derive(Debug, Clone)]
pub struct WorkerRegistry {
    specs: BTreeMap<WorkerKind, WorkerSpec>,
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        let mut specs = BTreeMap::new();
        specs.insert(
            WorkerKind::Scout,
            WorkerSpec {
                kind: WorkerKind::Scout,
                abilities: vec![WorkerAbility::Preview],
                risk_level: Tier::E,
                requires_approval: false,
                timeout_default_secs: 60,
                required_capabilities: vec![],
            },
        );
        specs.insert(
            WorkerKind::Builder,
            WorkerSpec {
                kind: WorkerKind::Builder,
                abilities: vec![
                    WorkerAbility::Preview,
                    WorkerAbility::Execute,
                    WorkerAbility::Rollback,
                ],
                risk_level: Tier::C,
                requires_approval: false,
                timeout_default_secs: 300,
                required_capabilities: vec![Capability::WorkerSpawn],
            },
        );
        specs.insert(
            WorkerKind::Verify,
            WorkerSpec {
                kind: WorkerKind::Verify,
                abilities: vec![WorkerAbility::Preview, WorkerAbility::Execute],
                risk_level: Tier::D,
                requires_approval: false,
                timeout_default_secs: 120,
                required_capabilities: vec![],
            },
        );
        specs.insert(
            WorkerKind::Custom,
            WorkerSpec {
                kind: WorkerKind::Custom,
                abilities: vec![WorkerAbility::Execute],
                risk_level: Tier::B,
                requires_approval: true,
                timeout_default_secs: 300,
                required_capabilities: vec![Capability::WorkerSpawn],
            },
        );
        Self { specs }
    }
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spec(&self, kind: WorkerKind) -> Option<&WorkerSpec> {
        self.specs.get(&kind)
    }

    /// Replace the descriptor for a kind (plugin registration).
    pub fn register(&mut self, spec: WorkerSpec) {
        self.specs.insert(spec.kind, spec);
    }

    pub fn timeout_secs(&self, kind: WorkerKind, config: &RuntimeConfig) -> u64 {
        self.spec(kind)
            .map(|s| s.timeout_default_secs)
            .unwrap_or(config.default_timeout_secs)
    }
}

#[derive(Debug, Default)]
struct Counts {
    total: usize,
    per_kind: BTreeMap<WorkerKind, usize>,
}

/// Live-worker accounting. `can_spawn` / `register_spawn` /
/// `unregister_worker` are mutually exclusive under one lock.
#[derive(Debug, Default)]
pub struct WorkerLimits {
    counts: Mutex<Counts>,
    released: Notify,
}

/// Point-in-time utilization, as exposed by the projector and read APIs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerUtilization {
    pub total_live: usize,
    pub max_total: usize,
    pub per_kind: BTreeMap<WorkerKind, usize>,
}

impl WorkerLimits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a worker of `kind` could be admitted right now.
    pub fn can_spawn(&self, kind: WorkerKind, config: &RuntimeConfig) -> bool {
        let counts = self.counts.lock().expect("worker limits lock poisoned");
        Self::admissible(&counts, kind, config)
    }

    /// Atomically check and claim a slot. Returns false when saturated.
    pub fn register_spawn(&self, kind: WorkerKind, config: &RuntimeConfig) -> bool {
        let mut counts = self.counts.lock().expect("worker limits lock poisoned");
        if !Self::admissible(&counts, kind, config) {
            return false;
        }
        counts.total += 1;
        *counts.per_kind.entry(kind).or_insert(0) += 1;
        true
    }

    /// Release a slot. Clamped at zero; over-release is a bug upstream and
    /// is logged, not propagated.
    pub fn unregister_worker(&self, kind: WorkerKind) {
        {
            let mut counts = self.counts.lock().expect("worker limits lock poisoned");
            if counts.total == 0 {
                warn!(%kind, "unregister_worker with zero live workers");
            }
            counts.total = counts.total.saturating_sub(1);
            let slot = counts.per_kind.entry(kind).or_insert(0);
            *slot = slot.saturating_sub(1);
        }
        self.released.notify_waiters();
    }

    /// Future resolving after the next slot release. Obtain it *before*
    /// re-checking `register_spawn` to avoid missed wakeups.
    pub fn released(&self) -> Notified<'_> {
        self.released.notified()
    }

    pub fn utilization(&self, config: &RuntimeConfig) -> WorkerUtilization {
        let counts = self.counts.lock().expect("worker limits lock poisoned");
        WorkerUtilization {
            total_live: counts.total,
            max_total: config.max_total_workers,
            per_kind: counts.per_kind.clone(),
        }
    }

    fn admissible(counts: &Counts, kind: WorkerKind, config: &RuntimeConfig) -> bool {
        if counts.total >= config.max_total_workers {
            return false;
        }
        let live_of_kind = counts.per_kind.get(&kind).copied().unwrap_or(0);
        live_of_kind < config.cap_for(kind)
    }
}
