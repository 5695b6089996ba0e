// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::{
    collections::BTreeSet,
    fmt,
    str::FromStr,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tracing::info;

use crate::store::{MemoryStore, PolicyStore};

/// Digest of a deployment manifest (the app compose hash).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ManifestDigest(Vec<u8>);

impl ManifestDigest {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ManifestDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

impl fmt::Debug for ManifestDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ManifestDigest({self})")
    }
}

impl FromStr for ManifestDigest {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        hex::decode(s).map(Self)
    }
}

impl Serialize for ManifestDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ManifestDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Opaque identity of an execution instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Instance id as recorded in a runtime event log.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// One immutable version of the admission policy.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    #[serde(default)]
    pub allowed_manifest_digests: BTreeSet<ManifestDigest>,
    #[serde(default)]
    pub allow_any_instance: bool,
    #[serde(default)]
    pub allowed_instance_ids: BTreeSet<InstanceId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    ManifestNotAllowed,
    InstanceNotAllowed,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ManifestNotAllowed => "manifest digest not allowed",
            Self::InstanceNotAllowed => "instance not allowed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("admission denied for manifest {manifest}, instance {instance}: {reason}")]
pub struct PolicyDenied {
    pub manifest: ManifestDigest,
    pub instance: InstanceId,
    pub reason: DenyReason,
}

/// An administrative change to the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyChange {
    AddManifest(ManifestDigest),
    RemoveManifest(ManifestDigest),
    SetAllowAnyInstance(bool),
    AddInstance(InstanceId),
    RemoveInstance(InstanceId),
}

impl PolicySnapshot {
    /// `manifest ∈ allowed AND (allow_any OR instance ∈ allowed_instances)`
    pub fn is_allowed(&self, manifest: &ManifestDigest, instance: &InstanceId) -> bool {
        self.check(manifest, instance).is_ok()
    }

    pub fn check(
        &self,
        manifest: &ManifestDigest,
        instance: &InstanceId,
    ) -> Result<(), PolicyDenied> {
        let reason = if !self.allowed_manifest_digests.contains(manifest) {
            DenyReason::ManifestNotAllowed
        } else if !self.allow_any_instance && !self.allowed_instance_ids.contains(instance) {
            DenyReason::InstanceNotAllowed
        } else {
            return Ok(());
        };
        Err(PolicyDenied {
            manifest: manifest.clone(),
            instance: instance.clone(),
            reason,
        })
    }

    /// Apply a change in place, returning whether anything changed.
    fn apply(&mut self, change: PolicyChange) -> bool {
        match change {
            PolicyChange::AddManifest(digest) => self.allowed_manifest_digests.insert(digest),
            PolicyChange::RemoveManifest(digest) => self.allowed_manifest_digests.remove(&digest),
            PolicyChange::SetAllowAnyInstance(allow) => {
                std::mem::replace(&mut self.allow_any_instance, allow) != allow
            }
            PolicyChange::AddInstance(id) => self.allowed_instance_ids.insert(id),
            PolicyChange::RemoveInstance(id) => self.allowed_instance_ids.remove(&id),
        }
    }
}

/// The admission policy of an app.
///
/// Readers take the current snapshot and never block on persistence.
/// Writers are serialized; each builds a new snapshot, persists it and only
/// then publishes it.
pub struct AppAuthPolicy<S: PolicyStore = MemoryStore> {
    current: RwLock<Arc<PolicySnapshot>>,
    store: Mutex<S>,
}

impl AppAuthPolicy<MemoryStore> {
    pub fn in_memory(snapshot: PolicySnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot.clone())),
            store: Mutex::new(MemoryStore::new(snapshot)),
        }
    }
}

impl<S: PolicyStore> AppAuthPolicy<S> {
    /// Open the policy held by `store`.
    pub fn open(store: S) -> Result<Self> {
        let snapshot = store.load().context("Failed to load admission policy")?;
        Ok(Self {
            current: RwLock::new(Arc::new(snapshot)),
            store: Mutex::new(store),
        })
    }

    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_allowed(&self, manifest: &ManifestDigest, instance: &InstanceId) -> bool {
        self.snapshot().is_allowed(manifest, instance)
    }

    pub fn check(
        &self,
        manifest: &ManifestDigest,
        instance: &InstanceId,
    ) -> Result<(), PolicyDenied> {
        self.snapshot().check(manifest, instance)
    }

    /// Apply `changes` as a single atomic update. Returns whether the policy changed.
    pub fn apply(&self, changes: impl IntoIterator<Item = PolicyChange>) -> Result<bool> {
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = PolicySnapshot::clone(&self.snapshot());
        let mut changed = false;
        for change in changes {
            changed |= next.apply(change);
        }
        if !changed {
            return Ok(false);
        }
        store
            .save(&next)
            .context("Failed to persist admission policy")?;
        info!(
            manifests = next.allowed_manifest_digests.len(),
            allow_any_instance = next.allow_any_instance,
            instances = next.allowed_instance_ids.len(),
            "admission policy updated"
        );
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        Ok(true)
    }

    pub fn add_allowed_manifest(&self, digest: ManifestDigest) -> Result<bool> {
        self.apply([PolicyChange::AddManifest(digest)])
    }

    pub fn remove_allowed_manifest(&self, digest: ManifestDigest) -> Result<bool> {
        self.apply([PolicyChange::RemoveManifest(digest)])
    }

    pub fn set_allow_any_instance(&self, allow: bool) -> Result<bool> {
        self.apply([PolicyChange::SetAllowAnyInstance(allow)])
    }

    pub fn add_allowed_instance(&self, id: InstanceId) -> Result<bool> {
        self.apply([PolicyChange::AddInstance(id)])
    }

    pub fn remove_allowed_instance(&self, id: InstanceId) -> Result<bool> {
        self.apply([PolicyChange::RemoveInstance(id)])
    }
}
