// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! End-to-end verification runs against a test TDX platform and a real
//! secp256k1 KMS root.

use std::time::SystemTime;

use dstack_app_auth::{InstanceId, ManifestDigest, PolicySnapshot};
use dstack_attest::{
    ccel::{replay_events, RuntimeEvent},
    testing::{QuoteTemplate, TestPlatform},
    Attestation, ChainCheck, ReportDataHash,
};
use dstack_kms::{crypto::issue_chain, recovery::k256_identity, ChainError, PayloadEncoding};
use dstack_verifier::{
    binder, CvmVerifier, Failure, Malformed, MismatchKind, ReferenceValues, Statement,
    VerificationRequest, Verdict,
};
use k256::ecdsa::SigningKey;
use sha2::Sha384;

const APP_ID: [u8; 20] = [0xa1; 20];
const MANIFEST: &str = "0x392b6b5a3fbeb5c7e0e1d4e6a0f1c5d2b8a7e9f3c4d5e6f7a8b9c0d1e2f3a4b5";
const INSTANCE: &[u8] = b"prod5";

fn manifest() -> ManifestDigest {
    MANIFEST.parse().unwrap()
}

fn events() -> Vec<RuntimeEvent> {
    vec![
        RuntimeEvent::new("app-id", APP_ID.to_vec()),
        RuntimeEvent::new("compose-hash", manifest().as_bytes().to_vec()),
        RuntimeEvent::new("instance-id", INSTANCE.to_vec()),
        RuntimeEvent::new("system-ready", vec![]),
    ]
}

fn statement() -> Statement {
    Statement::from_json(r#"{"price": 97234.00, "source": "api.example.com"}"#).unwrap()
}

fn kms_root() -> SigningKey {
    SigningKey::from_bytes(&[0x17u8; 32].into()).unwrap()
}

struct Fixture {
    platform: TestPlatform,
    attestation: Attestation,
}

impl Fixture {
    fn new() -> Self {
        let platform = TestPlatform::new().unwrap();
        let events = events();
        let rtmr3: [u8; 48] = replay_events::<Sha384>(&events, None).try_into().unwrap();
        let template = QuoteTemplate::default()
            .register("mrtd", [0x11; 48])
            .register("rtmr0", [0x22; 48])
            .register("rtmr3", rtmr3)
            .report_data(binder::report_data(&statement(), ReportDataHash::Sha512));
        let attestation = platform.attestation_with(&template, &events).unwrap();
        Self {
            platform,
            attestation,
        }
    }

    fn verifier(&self) -> CvmVerifier {
        CvmVerifier::new(self.platform.root_authority())
            .with_kms_root(k256_identity(kms_root().verifying_key()))
    }

    fn request(&self) -> VerificationRequest {
        let mut request = VerificationRequest::new(self.attestation.clone());
        request.statement = Some(statement());
        request.reference_values = Some(ReferenceValues {
            registers: [
                ("mrtd".to_string(), vec![0x11; 48]),
                ("rtmr0".to_string(), vec![0x22; 48]),
            ]
            .into(),
            manifest_digest: Some(manifest().as_bytes().to_vec()),
        });
        request.signature_chain = Some(
            issue_chain(
                &kms_root(),
                &APP_ID,
                "ethereum",
                &statement().canonical_bytes(),
                PayloadEncoding::Eip191,
            )
            .unwrap(),
        );
        request
    }
}

fn policy(allow_any_instance: bool) -> PolicySnapshot {
    PolicySnapshot {
        allowed_manifest_digests: [manifest()].into(),
        allow_any_instance,
        allowed_instance_ids: [InstanceId::from_bytes(INSTANCE)].into(),
    }
}

fn failures<T>(verdict: Verdict<T>) -> Vec<Failure> {
    match verdict {
        Verdict::Fail(failures) => failures,
        Verdict::Pass(_) => panic!("expected a failure, got a pass"),
        Verdict::Malformed(err) => panic!("expected a failure, got {err}"),
    }
}

#[test]
fn full_pipeline_passes() {
    let fixture = Fixture::new();
    let verdict = fixture
        .verifier()
        .verify(&fixture.request(), Some(&policy(false)), SystemTime::now());
    assert_eq!(verdict.exit_code(), 0);
    let Verdict::Pass(report) = verdict else {
        unreachable!()
    };
    assert_eq!(
        report.admission.map(|a| a.instance),
        Some(InstanceId::from_bytes(INSTANCE))
    );
    let chain = report.chain.unwrap();
    assert!(chain.is_valid());
    assert_eq!(chain.purpose.as_deref(), Some("ethereum"));
    assert_eq!(chain.app_id, Some(APP_ID.to_vec()));
}

#[test]
fn unlisted_instance_is_denied() {
    let fixture = Fixture::new();
    let mut policy = policy(false);
    policy.allowed_instance_ids.clear();
    let found = failures(fixture.verifier().verify(
        &fixture.request(),
        Some(&policy),
        SystemTime::now(),
    ));
    assert!(matches!(found[..], [Failure::Admission(_)]), "{found:?}");

    let open = fixture.verifier().verify(
        &fixture.request(),
        Some(&PolicySnapshot {
            allow_any_instance: true,
            ..policy
        }),
        SystemTime::now(),
    );
    assert!(open.is_pass());
}

#[test]
fn foreign_root_fails_quote_check() {
    let fixture = Fixture::new();
    let other = TestPlatform::new().unwrap();
    let verdict = CvmVerifier::new(other.root_authority()).verify(
        &fixture.request(),
        None,
        SystemTime::now(),
    );
    let found = failures(verdict);
    assert!(
        matches!(
            found[..],
            [Failure::Quote {
                check: ChainCheck::PckCertChain,
                ..
            }]
        ),
        "{found:?}"
    );
}

#[test]
fn truncated_quote_is_malformed() {
    let fixture = Fixture::new();
    let mut request = fixture.request();
    request.attestation.quote.truncate(100);
    let verdict = fixture.verifier().verify(&request, None, SystemTime::now());
    assert_eq!(verdict.exit_code(), 2);
    assert!(matches!(
        verdict,
        Verdict::Malformed(Malformed::MalformedQuote { .. })
    ));
}

#[test]
fn chain_from_untrusted_root_is_reported() {
    let fixture = Fixture::new();
    let mut request = fixture.request();
    let intruder = SigningKey::from_bytes(&[0x29u8; 32].into()).unwrap();
    request.signature_chain = Some(
        issue_chain(
            &intruder,
            &APP_ID,
            "ethereum",
            b"payload",
            PayloadEncoding::Eip191,
        )
        .unwrap(),
    );
    let found = failures(fixture.verifier().verify(&request, None, SystemTime::now()));
    assert!(
        matches!(
            found[..],
            [Failure::Chain(ChainError::UntrustedRoot { .. })]
        ),
        "{found:?}"
    );
}

#[test]
fn all_failures_are_collected() {
    let fixture = Fixture::new();
    let mut request = fixture.request();
    request.statement = Some(Statement::from_json(r#"{"price": 97234}"#).unwrap());
    if let Some(reference) = &mut request.reference_values {
        reference.registers.insert("rtmr1".into(), vec![0x33; 48]);
    }
    // The chain is issued for another app.
    request.signature_chain = Some(
        issue_chain(
            &kms_root(),
            &[0xb2; 20],
            "ethereum",
            b"payload",
            PayloadEncoding::Eip191,
        )
        .unwrap(),
    );
    let found = failures(fixture.verifier().verify(
        &request,
        Some(&PolicySnapshot::default()),
        SystemTime::now(),
    ));
    let stages: Vec<_> = found
        .iter()
        .map(|f| serde_json::to_value(f).unwrap()["stage"].clone())
        .collect();
    insta::assert_snapshot!(
        serde_json::to_string(&stages).unwrap(),
        @r#"["binding","measurement","admission","chain"]"#
    );
    assert!(matches!(
        &found[1],
        Failure::Measurement(m) if m.register == "rtmr1" && m.kind == MismatchKind::Register
    ));
    assert!(matches!(
        &found[3],
        Failure::Chain(ChainError::AppIdentityMismatch { .. })
    ));
}

#[test]
fn tampered_event_log_blocks_admission() {
    let fixture = Fixture::new();
    let mut request = fixture.request();
    let mut events = events();
    events[2] = RuntimeEvent::new("instance-id", b"prod9".to_vec());
    request.attestation.event_log = events.into_iter().map(Into::into).collect();
    request.signature_chain = None;

    let found = failures(fixture.verifier().verify(
        &request,
        Some(&policy(true)),
        SystemTime::now(),
    ));
    let summary: Vec<_> = found
        .iter()
        .map(|f| match f {
            Failure::Measurement(m) => format!("{}:{}", m.register, m.kind),
            other => other.to_string(),
        })
        .collect();
    assert_eq!(
        summary,
        vec![
            "rtmr3:event log".to_string(),
            "compose-hash:manifest digest".to_string(),
            "missing evidence: manifest digest".to_string(),
        ]
    );
}
