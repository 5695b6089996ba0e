// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Persistence for admission policy snapshots.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, warn};

use crate::policy::PolicySnapshot;

/// Durable home of the admission policy.
pub trait PolicyStore: Send {
    fn load(&self) -> Result<PolicySnapshot>;
    /// Persist `snapshot`. It is published to readers only if this succeeds.
    fn save(&mut self, snapshot: &PolicySnapshot) -> Result<()>;
}

/// Keeps the last saved snapshot in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    snapshot: PolicySnapshot,
}

impl MemoryStore {
    pub fn new(snapshot: PolicySnapshot) -> Self {
        Self { snapshot }
    }
}

impl PolicyStore for MemoryStore {
    fn load(&self) -> Result<PolicySnapshot> {
        Ok(self.snapshot.clone())
    }

    fn save(&mut self, snapshot: &PolicySnapshot) -> Result<()> {
        self.snapshot = snapshot.clone();
        Ok(())
    }
}

/// A JSON file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        }
    }
}

impl PolicyStore for JsonFileStore {
    fn load(&self) -> Result<PolicySnapshot> {
        if !self.path.exists() {
            warn!(
                "Admission policy {} does not exist, starting empty",
                self.path.display()
            );
            return Ok(PolicySnapshot::default());
        }
        let contents = fs_err::read(&self.path)?;
        let snapshot = serde_json::from_slice(&contents)
            .with_context(|| format!("Failed to parse admission policy {}", self.path.display()))?;
        debug!("Loaded admission policy {}", self.path.display());
        Ok(snapshot)
    }

    fn save(&mut self, snapshot: &PolicySnapshot) -> Result<()> {
        let dir = self.dir();
        fs_err::create_dir_all(dir).context("Failed to create policy directory")?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .context("Failed to create temporary policy file")?;
        serde_json::to_writer_pretty(tmp.as_file_mut(), snapshot)
            .context("Failed to serialize admission policy")?;
        tmp.as_file_mut()
            .sync_all()
            .context("Failed to flush admission policy to disk")?;
        tmp.persist(&self.path).map_err(|e| {
            anyhow!(
                "Failed to persist admission policy to {}: {e}",
                self.path.display()
            )
        })?;
        debug!("Stored admission policy {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{AppAuthPolicy, InstanceId, ManifestDigest, PolicyChange};

    #[test]
    fn file_store_round_trip() {
        tracing_subscriber::fmt::try_init().ok();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy").join("app.json");
        let manifest = ManifestDigest::new(vec![0x39, 0x2b]);

        let policy = AppAuthPolicy::open(JsonFileStore::new(&path)).unwrap();
        assert_eq!(*policy.snapshot(), PolicySnapshot::default());
        policy
            .apply([
                PolicyChange::AddManifest(manifest.clone()),
                PolicyChange::AddInstance(InstanceId::from("prod5")),
            ])
            .unwrap();
        drop(policy);

        let reopened = AppAuthPolicy::open(JsonFileStore::new(&path)).unwrap();
        assert!(reopened.is_allowed(&manifest, &"prod5".into()));
        assert!(!reopened.is_allowed(&manifest, &"prod9".into()));

        let on_disk: serde_json::Value =
            serde_json::from_slice(&fs_err::read(&path).unwrap()).unwrap();
        insta::assert_snapshot!(on_disk.to_string(), @r#"{"allow_any_instance":false,"allowed_instance_ids":["prod5"],"allowed_manifest_digests":["0x392b"]}"#);
    }

    #[test]
    fn unchanged_policy_is_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.json");
        let policy = AppAuthPolicy::open(JsonFileStore::new(&path)).unwrap();
        assert!(!policy.set_allow_any_instance(false).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.json");
        fs_err::write(&path, b"{not json").unwrap();
        assert!(AppAuthPolicy::open(JsonFileStore::new(&path)).is_err());
    }

    struct FailingStore;

    impl PolicyStore for FailingStore {
        fn load(&self) -> Result<PolicySnapshot> {
            Ok(PolicySnapshot::default())
        }

        fn save(&mut self, _: &PolicySnapshot) -> Result<()> {
            Err(anyhow!("disk full"))
        }
    }

    #[test]
    fn failed_save_is_not_published() {
        let policy = AppAuthPolicy::open(FailingStore).unwrap();
        assert!(policy
            .add_allowed_manifest(ManifestDigest::new(vec![1]))
            .is_err());
        assert_eq!(*policy.snapshot(), PolicySnapshot::default());
    }
}
