//! Capability registry: the evolution stage as a permission set.
//!
//! The stage is a monotonic function of successful mission history. It
//! advances exactly when the counter crosses a threshold and is never
//! downgraded; if in-memory state is lost it is recomputed by replaying
//! the ledger, and replay can only raise it.

use tracing::info;

use crate::events::KernelEvent;
use crate::types::{Capability, MissionState, Stage};

/// A stage advancement produced by recording a mission success.
#[derive(Debug, Clone, PartialEq)]
pub struct StageUnlock {
    pub stage: Stage,
    /// Capabilities newly granted by this stage (not cumulative).
    pub capabilities: Vec<Capability>,
    pub successful_missions: u64,
}

/// Tracks the current stage and the cumulative successful-mission count.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    stage: Stage,
    successes: u64,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn successful_missions(&self) -> u64 {
        self.successes
    }

    /// Pure function of the stage.
    pub fn permitted(&self, cap: Capability) -> bool {
        self.stage.permitted().contains(&cap)
    }

    pub fn permitted_set(&self) -> Vec<Capability> {
        self.stage.permitted()
    }

    /// Count one successful mission. Returns the unlock if a threshold
    /// was crossed exactly on this event's processing, not before.
    pub fn record_success(&mut self) -> Option<StageUnlock> {
        self.successes += 1;
        let mut unlocked = None;
        while let Some(next) = self.stage.next() {
            if self.successes < next.threshold() {
                break;
            }
            self.stage = next;
            info!(stage = %next, successes = self.successes, "capability stage unlocked");
            unlocked = Some(StageUnlock {
                stage: next,
                capabilities: next.grants().to_vec(),
                successful_missions: self.successes,
            });
        }
        unlocked
    }

    /// Fold one replayed ledger event into the registry.
    ///
    /// Successful missions re-increment the counter; recorded unlocks can
    /// only raise the stage (monotonic even against a corrupted counter).
    /// Returns an unlock only when the counter itself crosses a threshold,
    /// so live recording and replay take the same path.
    pub fn observe(&mut self, event: &KernelEvent) -> Option<StageUnlock> {
        match event {
            KernelEvent::MissionStateChanged { to, .. } if *to == MissionState::Success => {
                self.record_success()
            }
            KernelEvent::CapabilityUnlocked { stage, .. } => {
                if *stage > self.stage {
                    self.stage = *stage;
                }
                None
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_dormant() {
        let reg = CapabilityRegistry::new();
        assert_eq!(reg.stage(), Stage::Dormant);
        assert!(!reg.permitted(Capability::WorkerSpawn));
        assert!(reg.permitted_set().is_empty());
    }

    #[test]
    fn test_first_success_awakens() {
        let mut reg = CapabilityRegistry::new();
        let unlock = reg.record_success().expect("threshold 1 crossed");
        assert_eq!(unlock.stage, Stage::Awakening);
        assert_eq!(unlock.successful_missions, 1);
        assert!(reg.permitted(Capability::WorkerSpawn));
        assert!(reg.permitted(Capability::Recall));
        assert!(!reg.permitted(Capability::AutonomousChain));
    }

    #[test]
    fn test_thresholds_advance_exactly_on_event() {
        let mut reg = CapabilityRegistry::new();
        reg.record_success();
        for _ in 2..10 {
            assert!(reg.record_success().is_none());
        }
        assert_eq!(reg.stage(), Stage::Awakening);
        let unlock = reg.record_success().expect("10th success forges");
        assert_eq!(unlock.stage, Stage::Forging);
        assert_eq!(reg.successful_missions(), 10);
    }

    #[test]
    fn test_replay_unlock_is_monotonic() {
        let mut reg = CapabilityRegistry::new();
        reg.observe(&KernelEvent::CapabilityUnlocked {
            stage: Stage::Sovereign,
            capabilities: Stage::Sovereign.grants().to_vec(),
            successful_missions: 50,
        });
        assert_eq!(reg.stage(), Stage::Sovereign);

        // An older unlock replayed out of order never downgrades.
        reg.observe(&KernelEvent::CapabilityUnlocked {
            stage: Stage::Awakening,
            capabilities: vec![],
            successful_missions: 1,
        });
        assert_eq!(reg.stage(), Stage::Sovereign);
    }

    #[test]
    fn test_observe_counts_success_transitions_only() {
        let mut reg = CapabilityRegistry::new();
        let change = |to| KernelEvent::MissionStateChanged {
            mission_id: "m".into(),
            from: MissionState::Running,
            to,
            reason: None,
        };
        assert!(reg.observe(&change(MissionState::Failure)).is_none());
        assert_eq!(reg.successful_missions(), 0);
        let unlock = reg.observe(&change(MissionState::Success));
        assert_eq!(unlock.unwrap().stage, Stage::Awakening);
        assert_eq!(reg.successful_missions(), 1);
    }
}
