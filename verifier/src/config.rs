// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dstack_attest::ReportDataHash;
use dstack_kms::Identity;
use serde::Deserialize;

use crate::hex_bytes;

/// Trust anchors and default inputs of the verifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// PEM file with the quote root authority.
    pub root_ca: Option<PathBuf>,
    pub kms_root: Option<Identity>,
    #[serde(default, with = "hex_bytes::option")]
    pub app_id: Option<Vec<u8>>,
    /// JSON file with reference values.
    pub reference_values: Option<PathBuf>,
    /// JSON file with the admission policy.
    pub policy: Option<PathBuf>,
    #[serde(default)]
    pub report_data_hash: ReportDataHash,
}

impl Config {
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse verifier config")
    }

    /// Load a config file. Relative paths in it are resolved against its directory.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs_err::read_to_string(path)?;
        let mut config = Self::from_toml(&content)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        if let Some(dir) = path.parent() {
            for file in [
                &mut config.root_ca,
                &mut config.reference_values,
                &mut config.policy,
            ]
            .into_iter()
            .flatten()
            {
                if file.is_relative() {
                    *file = dir.join(&*file);
                }
            }
        }
        Ok(config)
    }
}
