// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! App admission policy: which instances, given the manifest digest they
//! booted with, may share an app's derived identity.

pub use policy::{
    AppAuthPolicy, DenyReason, InstanceId, ManifestDigest, PolicyChange, PolicyDenied,
    PolicySnapshot,
};
pub use store::{JsonFileStore, MemoryStore, PolicyStore};

mod policy;
mod store;
