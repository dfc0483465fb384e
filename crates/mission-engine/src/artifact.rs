//! Content-addressed artifact vault.
//!
//! No artifact, no existence: every durable worker output lands here as a
//! blob named by its blake3 hash, and its identity/review lifecycle is
//! ledger-mediated (`ArtifactCreated` / `ArtifactReviewed`). Blobs are
//! immutable; a revised artifact is a new version chained to the old one.

use std::path::{Path, PathBuf};

use governance::Tier;
use uuid::Uuid;

use crate::worker::ArtifactDraft;

/// Errors from vault operations.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("vault I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("artifact blob {0} not found")]
    NotFound(String),
}

/// Identity assigned when a draft enters the vault.
#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub artifact_id: String,
    pub content_hash: String,
    /// Path of the blob relative to the data directory.
    pub content_ref: String,
    pub version: u32,
    pub previous_version_id: Option<String>,
}

/// Blob store rooted at `data/artifacts/`.
#[derive(Debug, Clone)]
pub struct Vault {
    root: PathBuf,
}

impl Vault {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, VaultError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Write a draft's content (idempotent per hash) and mint identity.
    /// `previous` chains a new version onto an earlier artifact.
    pub fn store(
        &self,
        draft: &ArtifactDraft,
        previous: Option<(&str, u32)>,
    ) -> Result<StoredArtifact, VaultError> {
        let content_hash = blake3::hash(draft.content.as_bytes()).to_hex().to_string();
        let blob_path = self.root.join(&content_hash);
        if !blob_path.exists() {
            std::fs::write(&blob_path, draft.content.as_bytes())?;
        }
        let (previous_version_id, version) = match previous {
            Some((prev_id, prev_version)) => (Some(prev_id.to_string()), prev_version + 1),
            None => (None, 1),
        };
        Ok(StoredArtifact {
            artifact_id: Uuid::new_v4().to_string(),
            content_hash: content_hash.clone(),
            content_ref: format!("artifacts/{content_hash}"),
            version,
            previous_version_id,
        })
    }

    /// Read a blob back by content hash.
    pub fn read(&self, content_hash: &str) -> Result<String, VaultError> {
        let blob_path = self.root.join(content_hash);
        if !blob_path.exists() {
            return Err(VaultError::NotFound(content_hash.to_string()));
        }
        Ok(std::fs::read_to_string(blob_path)?)
    }
}

/// Whether an artifact from a task of `risk` may skip operator review.
/// Auto-approval needs both a low tier and the earned capability; the
/// kernel checks the capability, this pins the tier rule.
pub fn auto_approvable(risk: Tier) -> bool {
    risk <= Tier::D
}

#[cfg(test)]
mod tests {
    use super::*;
    use governance::ArtifactType;

    fn draft(content: &str) -> ArtifactDraft {
        ArtifactDraft {
            artifact_type: ArtifactType::Text,
            name: None,
            content: content.to_string(),
        }
    }

    #[test]
    fn test_store_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::open(dir.path().join("artifacts")).unwrap();
        let stored = vault.store(&draft("hello"), None).unwrap();
        assert_eq!(stored.version, 1);
        assert!(stored.previous_version_id.is_none());
        assert_eq!(vault.read(&stored.content_hash).unwrap(), "hello");
        assert!(stored.content_ref.starts_with("artifacts/"));
    }

    #[test]
    fn test_identical_content_shares_blob() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::open(dir.path().join("artifacts")).unwrap();
        let a = vault.store(&draft("same"), None).unwrap();
        let b = vault.store(&draft("same"), None).unwrap();
        assert_eq!(a.content_hash, b.content_hash);
        assert_ne!(a.artifact_id, b.artifact_id);
    }

    #[test]
    fn test_version_chain() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::open(dir.path().join("artifacts")).unwrap();
        let v1 = vault.store(&draft("first"), None).unwrap();
        let v2 = vault
            .store(&draft("second"), Some((&v1.artifact_id, v1.version)))
            .unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(v2.previous_version_id.as_deref(), Some(v1.artifact_id.as_str()));
    }

    #[test]
    fn test_missing_blob() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::open(dir.path().join("artifacts")).unwrap();
        assert!(matches!(
            vault.read("no-such-hash"),
            Err(VaultError::NotFound(_))
        ));
    }

    #[test]
    fn test_auto_approval_tier_rule() {
        assert!(auto_approvable(Tier::E));
        assert!(auto_approvable(Tier::D));
        assert!(!auto_approvable(Tier::C));
        assert!(!auto_approvable(Tier::A));
    }
}
