//! Doctrine: the immutable runtime invariants.
//!
//! Loaded once at startup, hashed, and recorded as the first ledger entry
//! of every process run. A doctrine file that disables any invariant is a
//! boot-time violation, not a configuration choice.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Errors in the doctrine family. These abort the operation that raised
/// them and are never masked.
#[derive(Debug, thiserror::Error)]
pub enum DoctrineViolation {
    #[error("doctrine invariant `{0}` is disabled; refusing to run")]
    DisabledInvariant(&'static str),

    #[error("doctrine file unreadable: {0}")]
    Unreadable(String),

    #[error("task {task_id} can produce no artifact (no_artifact_no_existence)")]
    NoArtifact { task_id: String },

    #[error("task {task_id} has no verifiable outcome (no_verification_rejected)")]
    Unverifiable { task_id: String },

    #[error("irreversible task {task_id} reached dispatch without approval")]
    UnapprovedIrreversible { task_id: String },
}

/// The invariant table. All flags must be true; they exist as data only so
/// the loaded doctrine can be hashed and audited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Doctrine {
    pub history_is_truth: bool,
    pub append_only: bool,
    pub no_artifact_no_existence: bool,
    pub no_verification_rejected: bool,
    pub irreversible_requires_approval: bool,
}

impl Default for Doctrine {
    fn default() -> Self {
        Self {
            history_is_truth: true,
            append_only: true,
            no_artifact_no_existence: true,
            no_verification_rejected: true,
            irreversible_requires_approval: true,
        }
    }
}

/// Doctrine plus its provenance, as recorded at boot.
#[derive(Debug, Clone)]
pub struct LoadedDoctrine {
    pub doctrine: Doctrine,
    /// blake3 over the canonical JSON form.
    pub hash: String,
    /// True when no doctrine file was present and built-ins apply.
    pub defaults: bool,
}

impl Doctrine {
    /// Load from `path`, or fall back to built-in defaults when the file
    /// is absent. A present-but-invalid file is an error, not a fallback.
    pub fn load(path: &Path) -> Result<LoadedDoctrine, DoctrineViolation> {
        let (doctrine, defaults) = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| DoctrineViolation::Unreadable(e.to_string()))?;
            let doctrine: Doctrine = serde_json::from_str(&raw)
                .map_err(|e| DoctrineViolation::Unreadable(e.to_string()))?;
            (doctrine, false)
        } else {
            (Doctrine::default(), true)
        };
        doctrine.verify()?;
        let hash = doctrine.hash();
        Ok(LoadedDoctrine {
            doctrine,
            hash,
            defaults,
        })
    }

    /// Every invariant must hold; a disabled flag is a boot violation.
    pub fn verify(&self) -> Result<(), DoctrineViolation> {
        if !self.history_is_truth {
            return Err(DoctrineViolation::DisabledInvariant("history_is_truth"));
        }
        if !self.append_only {
            return Err(DoctrineViolation::DisabledInvariant("append_only"));
        }
        if !self.no_artifact_no_existence {
            return Err(DoctrineViolation::DisabledInvariant(
                "no_artifact_no_existence",
            ));
        }
        if !self.no_verification_rejected {
            return Err(DoctrineViolation::DisabledInvariant(
                "no_verification_rejected",
            ));
        }
        if !self.irreversible_requires_approval {
            return Err(DoctrineViolation::DisabledInvariant(
                "irreversible_requires_approval",
            ));
        }
        Ok(())
    }

    /// blake3 of the canonical JSON form.
    pub fn hash(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        blake3::hash(&json).to_hex().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_verify() {
        let loaded = Doctrine::load(Path::new("/nonexistent/doctrine.json")).unwrap();
        assert!(loaded.defaults);
        assert!(!loaded.hash.is_empty());
        assert!(loaded.doctrine.verify().is_ok());
    }

    #[test]
    fn test_disabled_invariant_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doctrine.json");
        std::fs::write(
            &path,
            r#"{
                "history_is_truth": true,
                "append_only": false,
                "no_artifact_no_existence": true,
                "no_verification_rejected": true,
                "irreversible_requires_approval": true
            }"#,
        )
        .unwrap();
        let err = Doctrine::load(&path).unwrap_err();
        assert!(err.to_string().contains("append_only"));
    }

    #[test]
    fn test_hash_is_stable() {
        let a = Doctrine::default().hash();
        let b = Doctrine::default().hash();
        assert_eq!(a, b);
    }

    #[test]
    fn test_invalid_file_is_error_not_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doctrine.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(Doctrine::load(&path).is_err());
    }
}
