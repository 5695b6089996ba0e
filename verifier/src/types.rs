// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use dstack_app_auth::{InstanceId, ManifestDigest};
use dstack_attest::{AppInfo, Attestation, VerifiedQuote};
use dstack_kms::{ChainReport, SignatureChain};
use serde::Serialize;

use crate::{
    binder::Bound,
    measurement::{MeasurementReport, ReferenceValues},
    statement::Statement,
};

/// Evidence for one full verification run.
#[derive(Debug, Clone)]
pub struct VerificationRequest {
    pub attestation: Attestation,
    /// Statement the quote's report data must vouch for.
    pub statement: Option<Statement>,
    pub reference_values: Option<ReferenceValues>,
    pub signature_chain: Option<SignatureChain>,
}

impl VerificationRequest {
    pub fn new(attestation: Attestation) -> Self {
        Self {
            attestation,
            statement: None,
            reference_values: None,
            signature_chain: None,
        }
    }
}

/// The instance admitted by the policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Admission {
    pub manifest: ManifestDigest,
    pub instance: InstanceId,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub quote: VerifiedQuote,
    pub app_info: Option<AppInfo>,
    pub binding: Option<Bound>,
    pub measurement: MeasurementReport,
    pub admission: Option<Admission>,
    pub chain: Option<ChainReport>,
}
