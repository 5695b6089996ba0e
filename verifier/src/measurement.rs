// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Comparison of quoted measurement registers against reference values.

use std::{collections::BTreeMap, fmt};

use cc_eventlog::{find_event_payload, replay_events, RuntimeEvent};
use dstack_attest::{Registers, VerifiedAttestation};
use serde::{Deserialize, Serialize};
use sha2::Sha384;
use thiserror::Error;
use tracing::debug;

use crate::hex_bytes;

const COMPOSE_HASH_EVENT: &str = "compose-hash";

/// Expected register values and the expected manifest digest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceValues {
    #[serde(default, with = "hex_bytes::map")]
    pub registers: BTreeMap<String, Vec<u8>>,
    #[serde(default, with = "hex_bytes::option")]
    pub manifest_digest: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchKind {
    /// The quoted register differs from the reference value.
    Register,
    /// Replaying the runtime event log does not reproduce the register.
    EventLog,
    ManifestDigest,
}

impl fmt::Display for MismatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Register => "register",
            Self::EventLog => "event log",
            Self::ManifestDigest => "manifest digest",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error(
    "{register} {kind} mismatch: expected {expected}, actual {}",
    actual.as_deref().unwrap_or("none")
)]
pub struct RegisterMismatch {
    pub register: String,
    pub kind: MismatchKind,
    pub expected: String,
    pub actual: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MeasurementReport {
    pub mismatches: Vec<RegisterMismatch>,
    /// The manifest digest recorded in a trusted event log, if any.
    #[serde(with = "hex_bytes::option")]
    pub manifest_digest: Option<Vec<u8>>,
}

impl MeasurementReport {
    pub fn is_match(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Compare every referenced register, then derive the manifest digest from
/// the runtime event log.
///
/// The event log is consulted when it has entries or a manifest digest is
/// expected. It is trusted only if its replay reproduces `rtmr3`.
pub fn compare(
    registers: &Registers,
    runtime_events: &[RuntimeEvent],
    reference: &ReferenceValues,
) -> MeasurementReport {
    let mut report = MeasurementReport::default();

    for (name, expected) in &reference.registers {
        let actual = registers.get(name);
        if actual.is_some_and(|actual| actual[..] == expected[..]) {
            continue;
        }
        report.mismatches.push(RegisterMismatch {
            register: name.clone(),
            kind: MismatchKind::Register,
            expected: hex::encode(expected),
            actual: actual.map(hex::encode),
        });
    }

    if !runtime_events.is_empty() || reference.manifest_digest.is_some() {
        let replayed = replay_events::<Sha384>(runtime_events, None);
        if replayed[..] == registers.rtmr3[..] {
            report.manifest_digest =
                find_event_payload(runtime_events, COMPOSE_HASH_EVENT).map(<[u8]>::to_vec);
        } else {
            report.mismatches.push(RegisterMismatch {
                register: "rtmr3".into(),
                kind: MismatchKind::EventLog,
                expected: hex::encode(registers.rtmr3),
                actual: Some(hex::encode(replayed)),
            });
        }
    }

    if let Some(expected) = &reference.manifest_digest {
        if report.manifest_digest.as_ref() != Some(expected) {
            report.mismatches.push(RegisterMismatch {
                register: COMPOSE_HASH_EVENT.into(),
                kind: MismatchKind::ManifestDigest,
                expected: hex::encode(expected),
                actual: report.manifest_digest.as_ref().map(hex::encode),
            });
        }
    }

    debug!(
        mismatches = report.mismatches.len(),
        "measurement comparison done"
    );
    report
}

pub fn compare_attestation(
    attestation: &VerifiedAttestation,
    reference: &ReferenceValues,
) -> MeasurementReport {
    compare(
        &attestation.quote.registers,
        &attestation.runtime_events,
        reference,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events() -> Vec<RuntimeEvent> {
        vec![
            RuntimeEvent::new("app-id", vec![0x11; 20]),
            RuntimeEvent::new("compose-hash", vec![0xc0; 32]),
            RuntimeEvent::new("instance-id", vec![0x22; 20]),
            RuntimeEvent::new("system-ready", vec![]),
        ]
    }

    fn registers(events: &[RuntimeEvent]) -> Registers {
        let rtmr3 = replay_events::<Sha384>(events, None);
        Registers {
            mrtd: [1; 48],
            rtmr0: [2; 48],
            rtmr1: [3; 48],
            rtmr2: [4; 48],
            rtmr3: rtmr3.try_into().unwrap(),
        }
    }

    #[test]
    fn matching_reference_passes() {
        let events = events();
        let regs = registers(&events);
        let reference = ReferenceValues {
            registers: [("mrtd".to_string(), vec![1; 48]), ("rtmr2".into(), vec![4; 48])].into(),
            manifest_digest: Some(vec![0xc0; 32]),
        };
        let report = compare(&regs, &events, &reference);
        assert!(report.is_match(), "{report:?}");
        assert_eq!(report.manifest_digest, Some(vec![0xc0; 32]));
    }

    #[test]
    fn every_mismatch_is_reported() {
        let events = events();
        let regs = registers(&events);
        let reference = ReferenceValues {
            registers: [
                ("mrtd".to_string(), vec![9; 48]),
                ("rtmr0".into(), vec![2; 48]),
                ("rtmr1".into(), vec![9; 48]),
                ("rtmr7".into(), vec![0; 48]),
            ]
            .into(),
            manifest_digest: Some(vec![0xc1; 32]),
        };
        let report = compare(&regs, &events, &reference);
        let found: Vec<_> = report
            .mismatches
            .iter()
            .map(|m| (m.register.as_str(), m.kind, m.actual.is_some()))
            .collect();
        assert_eq!(
            found,
            vec![
                ("mrtd", MismatchKind::Register, true),
                ("rtmr1", MismatchKind::Register, true),
                ("rtmr7", MismatchKind::Register, false),
                ("compose-hash", MismatchKind::ManifestDigest, true),
            ]
        );
    }

    #[test]
    fn tampered_event_log_hides_manifest() {
        let mut events = events();
        let regs = registers(&events);
        events[1] = RuntimeEvent::new("compose-hash", vec![0xc1; 32]);
        let reference = ReferenceValues {
            manifest_digest: Some(vec![0xc1; 32]),
            ..Default::default()
        };
        let report = compare(&regs, &events, &reference);
        assert_eq!(report.manifest_digest, None);
        let kinds: Vec<_> = report.mismatches.iter().map(|m| m.kind).collect();
        assert_eq!(
            kinds,
            vec![MismatchKind::EventLog, MismatchKind::ManifestDigest]
        );
        assert_eq!(report.mismatches[0].register, "rtmr3");
        assert_eq!(report.mismatches[1].actual, None);
    }

    #[test]
    fn compose_hash_after_system_ready_is_ignored() {
        let events = vec![
            RuntimeEvent::new("system-ready", vec![]),
            RuntimeEvent::new("compose-hash", vec![0xc0; 32]),
        ];
        let regs = registers(&events);
        let report = compare(&regs, &events, &ReferenceValues::default());
        assert!(report.is_match());
        assert_eq!(report.manifest_digest, None);
    }

    #[test]
    fn reference_values_json() {
        let reference: ReferenceValues = serde_json::from_str(
            r#"{"registers":{"mrtd":"0x0102","rtmr0":"0304"},"manifest_digest":"0xc0c0"}"#,
        )
        .unwrap();
        assert_eq!(reference.registers["mrtd"], vec![1, 2]);
        assert_eq!(reference.registers["rtmr0"], vec![3, 4]);
        assert_eq!(reference.manifest_digest, Some(vec![0xc0, 0xc0]));

        let report = MeasurementReport {
            mismatches: vec![RegisterMismatch {
                register: "mrtd".into(),
                kind: MismatchKind::Register,
                expected: "0102".into(),
                actual: None,
            }],
            manifest_digest: None,
        };
        insta::assert_snapshot!(
            serde_json::to_string(&report).unwrap(),
            @r#"{"mismatches":[{"register":"mrtd","kind":"register","expected":"0102","actual":null}],"manifest_digest":null}"#
        );
        assert_eq!(
            report.mismatches[0].to_string(),
            "mrtd register mismatch: expected 0102, actual none"
        );
    }
}
