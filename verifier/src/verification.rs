// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::time::SystemTime;

use dstack_app_auth::{InstanceId, ManifestDigest, PolicySnapshot};
use dstack_attest::{Attestation, ReportDataHash, RootAuthority, VerifiedAttestation};
use dstack_kms::{verify_chain, ChainReport, Identity, Secp256k1Recovery, SignatureChain};
use tracing::{debug, info, warn};

use crate::{
    binder,
    measurement::{self, ReferenceValues},
    types::{Admission, VerificationReport, VerificationRequest},
    verdict::{Failure, Malformed, Verdict},
};

/// Verifies CVM evidence against a fixed set of trust anchors.
#[derive(Debug, Clone)]
pub struct CvmVerifier {
    root: RootAuthority,
    report_data_hash: ReportDataHash,
    kms_root: Option<Identity>,
    app_id: Option<Vec<u8>>,
}

impl CvmVerifier {
    pub fn new(root: RootAuthority) -> Self {
        Self {
            root,
            report_data_hash: ReportDataHash::default(),
            kms_root: None,
            app_id: None,
        }
    }

    pub fn with_report_data_hash(mut self, hash: ReportDataHash) -> Self {
        self.report_data_hash = hash;
        self
    }

    /// Trusted KMS root for signature chains.
    pub fn with_kms_root(mut self, kms_root: Identity) -> Self {
        self.kms_root = Some(kms_root);
        self
    }

    /// Expected app identity. Without it the attested `app-id` event is used.
    pub fn with_app_id(mut self, app_id: Vec<u8>) -> Self {
        self.app_id = Some(app_id);
        self
    }

    pub fn report_data_hash(&self) -> ReportDataHash {
        self.report_data_hash
    }

    pub fn verify_attestation(
        &self,
        attestation: &Attestation,
        now: SystemTime,
    ) -> Verdict<VerifiedAttestation> {
        match attestation.verify(&self.root, now) {
            Ok(verified) => Verdict::Pass(verified),
            Err(err) => {
                debug!("quote rejected: {err}");
                Verdict::from_quote_error(err)
            }
        }
    }

    /// Verify a signature chain on its own. `app_id` overrides the configured one.
    pub fn verify_chain(
        &self,
        chain: &SignatureChain,
        app_id: Option<&[u8]>,
    ) -> Verdict<ChainReport> {
        let Some(kms_root) = &self.kms_root else {
            return Verdict::Malformed(Malformed::input(
                "kms_root",
                "a trusted KMS root is required to verify a signature chain",
            ));
        };
        let Some(app_id) = app_id.or(self.app_id.as_deref()) else {
            return Verdict::Malformed(Malformed::input(
                "app_id",
                "an expected app id is required to verify a signature chain",
            ));
        };
        let report = verify_chain(chain, kms_root, app_id, &Secp256k1Recovery);
        let failures = report.errors.iter().cloned().map(Failure::Chain).collect();
        Verdict::from_failures(report, failures)
    }

    /// Run every check the request has evidence for.
    ///
    /// The quote is verified first; a quote that cannot be trusted ends the
    /// run. All other checks are evaluated and their failures collected.
    pub fn verify(
        &self,
        request: &VerificationRequest,
        policy: Option<&PolicySnapshot>,
        now: SystemTime,
    ) -> Verdict<VerificationReport> {
        let attestation = match self.verify_attestation(&request.attestation, now) {
            Verdict::Pass(attestation) => attestation,
            Verdict::Fail(failures) => return Verdict::Fail(failures),
            Verdict::Malformed(err) => return Verdict::Malformed(err),
        };
        let mut failures = Vec::new();

        let binding = request.statement.as_ref().and_then(|statement| {
            binder::bind_attestation(statement, &attestation.quote, self.report_data_hash)
                .map_err(|err| failures.push(err.into()))
                .ok()
        });

        let measurement = measurement::compare_attestation(
            &attestation,
            request
                .reference_values
                .as_ref()
                .unwrap_or(&ReferenceValues::default()),
        );
        failures.extend(measurement.mismatches.iter().cloned().map(Failure::from));

        let app_info = attestation.decode_app_info(false).ok();

        let admission = policy.and_then(|policy| {
            let Some(manifest) = &measurement.manifest_digest else {
                failures.push(Failure::MissingEvidence {
                    what: "manifest digest".into(),
                });
                return None;
            };
            let manifest = ManifestDigest::new(manifest.clone());
            let instance = InstanceId::from_bytes(
                app_info
                    .as_ref()
                    .map(|info| &info.instance_id[..])
                    .unwrap_or_default(),
            );
            match policy.check(&manifest, &instance) {
                Ok(()) => Some(Admission { manifest, instance }),
                Err(denied) => {
                    failures.push(denied.into());
                    None
                }
            }
        });

        let chain = match &request.signature_chain {
            Some(chain) => {
                let attested_app_id = app_info
                    .as_ref()
                    .map(|info| &info.app_id[..])
                    .filter(|id| !id.is_empty());
                match self.verify_chain(chain, self.app_id.as_deref().or(attested_app_id)) {
                    Verdict::Pass(report) => Some(report),
                    Verdict::Fail(chain_failures) => {
                        failures.extend(chain_failures);
                        None
                    }
                    Verdict::Malformed(err) => return Verdict::Malformed(err),
                }
            }
            None => None,
        };

        if failures.is_empty() {
            info!("verification passed");
        } else {
            warn!(failures = failures.len(), "verification failed");
        }
        Verdict::from_failures(
            VerificationReport {
                quote: attestation.quote,
                app_info,
                binding,
                measurement,
                admission,
                chain,
            },
            failures,
        )
    }
}

#[cfg(test)]
mod tests {
    use dstack_attest::{ccel::RuntimeEvent, testing::TestPlatform};

    use super::*;
    use crate::statement::Statement;

    fn events() -> Vec<RuntimeEvent> {
        vec![
            RuntimeEvent::new("app-id", vec![0xa1; 20]),
            RuntimeEvent::new("compose-hash", vec![0xc0; 32]),
            RuntimeEvent::new("instance-id", vec![0x05; 20]),
            RuntimeEvent::new("system-ready", vec![]),
        ]
    }

    #[test]
    fn bound_attestation_passes() {
        tracing_subscriber::fmt::try_init().ok();
        let platform = TestPlatform::new().unwrap();
        let statement = Statement::from_json(r#"{"price":97234.00}"#).unwrap();
        let report_data = binder::report_data(&statement, ReportDataHash::Sha512);
        let attestation = platform.attestation(report_data, &events()).unwrap();

        let verifier = CvmVerifier::new(platform.root_authority());
        let mut request = VerificationRequest::new(attestation);
        request.statement = Some(statement);
        let Verdict::Pass(report) = verifier.verify(&request, None, SystemTime::now()) else {
            panic!("expected a pass");
        };
        assert_eq!(report.measurement.manifest_digest, Some(vec![0xc0; 32]));
        assert!(report.binding.is_some());
        assert_eq!(
            report.app_info.map(|info| info.instance_id),
            Some(vec![0x05; 20])
        );
    }

    #[test]
    fn unbound_statement_fails_binding() {
        let platform = TestPlatform::new().unwrap();
        let attestation = platform.attestation([0; 64], &events()).unwrap();
        let mut request = VerificationRequest::new(attestation);
        request.statement = Some(Statement::from_json(r#"{"price":1}"#).unwrap());
        let verdict =
            CvmVerifier::new(platform.root_authority()).verify(&request, None, SystemTime::now());
        let Verdict::Fail(failures) = verdict else {
            panic!("expected a failure");
        };
        assert!(matches!(failures[..], [Failure::Binding(_)]));
    }

    #[test]
    fn chain_needs_a_kms_root() {
        let platform = TestPlatform::new().unwrap();
        let verifier = CvmVerifier::new(platform.root_authority());
        let chain: SignatureChain = serde_json::from_value(serde_json::json!({
            "derived_public_key": "",
            "links": [
                {"message": "", "signature": ""},
                {"message": "", "signature": ""},
                {"message": "", "signature": ""}
            ]
        }))
        .unwrap();
        assert_eq!(verifier.verify_chain(&chain, Some(b"app")).exit_code(), 2);
    }
}
