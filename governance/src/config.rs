//! Operator-editable runtime configuration.
//!
//! Unlike doctrine, everything here may change while the kernel runs, but
//! only through the config store so every mutation is ledger-recorded
//! before it takes effect. Tasks snapshot the config at governance
//! evaluation time and are never re-gated mid-flight.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::types::{Tier, WorkerKind};

/// Errors loading or applying runtime configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file unreadable: {0}")]
    Unreadable(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// What to do when a task asks for a worker slot and the pool is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SaturationPolicy {
    /// Queue the admission until a slot frees (default).
    #[default]
    Queue,
    /// Fail the dispatch immediately with `CapacityExhausted`.
    Reject,
}

/// Task retry backoff: exponential with a deterministic jitter applied by
/// the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_ms: u64,
    pub factor: f64,
    /// Jitter fraction, e.g. 0.25 for ±25%.
    pub jitter: f64,
    pub cap_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            factor: 2.0,
            jitter: 0.25,
            cap_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry `attempt` (1-based), without jitter, capped.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        if attempt == 0 {
            return 0;
        }
        let raw = self.base_ms as f64 * self.factor.powi(attempt as i32 - 1);
        (raw as u64).min(self.cap_ms)
    }
}

/// The operator-editable table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Global cap on concurrently executing workers.
    pub max_total_workers: usize,
    /// Per-kind caps; kinds absent from the map fall back to the global cap.
    pub max_per_kind: BTreeMap<WorkerKind, usize>,
    /// Default per-step worker timeout.
    pub default_timeout_secs: u64,
    /// Hard grace period after cancellation before a worker is abandoned.
    pub cancel_grace_secs: u64,
    /// Approval windows per tier; floors from the tier table always apply.
    pub countdown_b_secs: u64,
    pub countdown_a_secs: u64,
    pub countdown_s_secs: u64,
    /// Approvers required for S-tier tasks (2-of-N when configured).
    pub s_tier_approvers: u32,
    /// Operators allowed to approve; empty means any named approver.
    pub approvers: Vec<String>,
    /// External recipients that tasks may target.
    pub whitelist: Vec<String>,
    /// Token-spend ceiling per task, when set.
    pub max_cost_per_task: Option<u64>,
    /// Behavior when the worker pool is saturated.
    pub on_saturation: SaturationPolicy,
    /// Optional per-task admission deadline while queued.
    pub admission_deadline_secs: Option<u64>,
    /// Retry policy for retryable worker failures.
    pub max_attempts: u32,
    pub retry: RetryPolicy,
    /// Minimum risk tier per mission category.
    pub risk_overrides: BTreeMap<String, Tier>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_total_workers: 8,
            max_per_kind: BTreeMap::from([
                (WorkerKind::Scout, 4),
                (WorkerKind::Builder, 3),
                (WorkerKind::Verify, 3),
                (WorkerKind::Custom, 2),
            ]),
            default_timeout_secs: 300,
            cancel_grace_secs: 5,
            countdown_b_secs: 3,
            countdown_a_secs: 10,
            countdown_s_secs: 30,
            s_tier_approvers: 1,
            approvers: Vec::new(),
            whitelist: Vec::new(),
            max_cost_per_task: None,
            on_saturation: SaturationPolicy::Queue,
            admission_deadline_secs: None,
            max_attempts: 3,
            retry: RetryPolicy::default(),
            risk_overrides: BTreeMap::new(),
        }
    }
}

impl RuntimeConfig {
    /// Load from `path`, or defaults when the file is absent.
    pub fn load(path: &Path) -> Result<RuntimeConfig, ConfigError> {
        if !path.exists() {
            return Ok(RuntimeConfig::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Unreadable(e.to_string()))?;
        let config: RuntimeConfig =
            serde_json::from_str(&raw).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_total_workers == 0 {
            return Err(ConfigError::Invalid("max_total_workers must be > 0".into()));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be > 0".into()));
        }
        Ok(())
    }

    /// Effective per-kind cap (never above the global cap).
    pub fn cap_for(&self, kind: WorkerKind) -> usize {
        self.max_per_kind
            .get(&kind)
            .copied()
            .unwrap_or(self.max_total_workers)
            .min(self.max_total_workers)
    }

    /// Approval/abort countdown for a tier: the configured window, never
    /// below the tier's floor.
    pub fn countdown_for(&self, tier: Tier) -> u64 {
        let configured = match tier {
            Tier::B => self.countdown_b_secs,
            Tier::A => self.countdown_a_secs,
            Tier::S => self.countdown_s_secs,
            _ => 0,
        };
        configured.max(tier.countdown_floor())
    }

    /// Whether `approver` may grant approvals under this config.
    pub fn approver_allowed(&self, approver: &str) -> bool {
        self.approvers.is_empty() || self.approvers.iter().any(|a| a == approver)
    }
}

/// Shared handle to the current config. `get` is cheap (Arc clone); a new
/// config becomes visible only after `apply`, which the kernel calls
/// strictly after writing the `ConfigChanged` ledger entry.
pub struct ConfigStore {
    current: RwLock<Arc<RuntimeConfig>>,
    revision: AtomicU64,
}

impl ConfigStore {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
            revision: AtomicU64::new(0),
        }
    }

    /// Snapshot of the config visible right now.
    pub fn get(&self) -> Arc<RuntimeConfig> {
        self.current.read().expect("config lock poisoned").clone()
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Install a new config; returns the new revision.
    pub fn apply(&self, config: RuntimeConfig) -> Result<u64, ConfigError> {
        config.validate()?;
        let mut slot = self.current.write().expect("config lock poisoned");
        *slot = Arc::new(config);
        Ok(self.revision.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_total_workers, 8);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.countdown_for(Tier::A), 10);
        assert_eq!(config.countdown_for(Tier::S), 30);
        assert_eq!(config.countdown_for(Tier::E), 0);
        assert!(config.approver_allowed("anyone"));
    }

    #[test]
    fn test_countdown_floor_wins() {
        let config = RuntimeConfig {
            countdown_a_secs: 2,
            ..Default::default()
        };
        // Config below the tier floor is clamped up, never down.
        assert_eq!(config.countdown_for(Tier::A), 10);
        let config = RuntimeConfig {
            countdown_a_secs: 45,
            ..Default::default()
        };
        assert_eq!(config.countdown_for(Tier::A), 45);
    }

    #[test]
    fn test_cap_for_clamps_to_global() {
        let mut config = RuntimeConfig {
            max_total_workers: 2,
            ..Default::default()
        };
        config.max_per_kind.insert(WorkerKind::Scout, 10);
        assert_eq!(config.cap_for(WorkerKind::Scout), 2);
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let config = RuntimeConfig::load(Path::new("/nonexistent/runtime.json")).unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.json");
        std::fs::write(&path, r#"{"max_total_workers": 2}"#).unwrap();
        let config = RuntimeConfig::load(&path).unwrap();
        assert_eq!(config.max_total_workers, 2);
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn test_store_apply_bumps_revision() {
        let store = ConfigStore::new(RuntimeConfig::default());
        assert_eq!(store.revision(), 0);
        let rev = store
            .apply(RuntimeConfig {
                max_total_workers: 2,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rev, 1);
        assert_eq!(store.get().max_total_workers, 2);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let store = ConfigStore::new(RuntimeConfig::default());
        let err = store
            .apply(RuntimeConfig {
                max_total_workers: 0,
                ..Default::default()
            })
            .unwrap_err();
        assert!(err.to_string().contains("max_total_workers"));
    }

    #[test]
    fn test_retry_backoff() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.backoff_ms(1), 1_000);
        assert_eq!(retry.backoff_ms(2), 2_000);
        assert_eq!(retry.backoff_ms(3), 4_000);
        assert_eq!(retry.backoff_ms(10), 30_000);
    }
}
