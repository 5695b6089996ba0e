// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Attestation envelope: a TDX quote plus the event log that explains its
//! runtime register, and the application identity derived from both.

use std::{fmt, str::FromStr, time::SystemTime};

use cc_eventlog::{RuntimeEvent, TdxEvent};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384};
use thiserror::Error;
use tracing::debug;

use crate::{
    error::{EventLogMismatch, QuoteError},
    verify::{verify_quote, RootAuthority, VerifiedQuote},
};

/// Marks the end of the boot-time part of the runtime event log.
pub const BOOT_MR_DONE_EVENT: &str = "boot-mr-done";

/// The content type of a quote. A CVM should only generate quotes for these types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteContentType<'a> {
    /// The public key of KMS root CA. Lets a verifier recompute the report
    /// data of a KMS bootstrap quote.
    KmsRootCa,
    /// The public key of the RA-TLS certificate. Lets a verifier recompute
    /// the report data embedded in an RA-TLS certificate quote.
    RaTlsCert,
    /// App defined data
    AppData,
    /// The custom content type
    Custom(&'a str),
}

/// Hash algorithm used to turn tagged content into report data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ReportDataHash {
    Sha256,
    Sha384,
    #[default]
    Sha512,
    Sha3_256,
    Sha3_384,
    Sha3_512,
    Keccak256,
    Keccak384,
    Keccak512,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid hash algorithm: {0}")]
pub struct UnknownHashAlgorithm(pub String);

impl ReportDataHash {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
            Self::Sha3_256 => "sha3-256",
            Self::Sha3_384 => "sha3-384",
            Self::Sha3_512 => "sha3-512",
            Self::Keccak256 => "keccak256",
            Self::Keccak384 => "keccak384",
            Self::Keccak512 => "keccak512",
        }
    }
}

impl FromStr for ReportDataHash {
    type Err = UnknownHashAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "sha256" => Self::Sha256,
            "sha384" => Self::Sha384,
            "" | "sha512" => Self::Sha512,
            "sha3-256" => Self::Sha3_256,
            "sha3-384" => Self::Sha3_384,
            "sha3-512" => Self::Sha3_512,
            "keccak256" => Self::Keccak256,
            "keccak384" => Self::Keccak384,
            "keccak512" => Self::Keccak512,
            _ => return Err(UnknownHashAlgorithm(s.to_string())),
        })
    }
}

impl TryFrom<String> for ReportDataHash {
    type Error = UnknownHashAlgorithm;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ReportDataHash> for String {
    fn from(value: ReportDataHash) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ReportDataHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl QuoteContentType<'_> {
    /// The tag of the content type used in the report data.
    pub fn tag(&self) -> &str {
        match self {
            Self::KmsRootCa => "kms-root-ca",
            Self::RaTlsCert => "ratls-cert",
            Self::AppData => "app-data",
            Self::Custom(tag) => tag,
        }
    }

    /// Convert the content to the report data with the default hash.
    pub fn to_report_data(&self, content: &[u8]) -> [u8; 64] {
        self.to_report_data_with_hash(content, ReportDataHash::default())
    }

    /// Convert the content to the report data with a specific hash algorithm.
    ///
    /// The format is `hash(<tag>:<content>)`, zero-padded to 64 bytes.
    pub fn to_report_data_with_hash(&self, content: &[u8], hash: ReportDataHash) -> [u8; 64] {
        macro_rules! do_hash {
            ($hash: ty) => {{
                let mut hasher = <$hash>::new();
                hasher.update(self.tag().as_bytes());
                hasher.update(b":");
                hasher.update(content);
                let output = hasher.finalize();

                let mut padded = [0u8; 64];
                padded[..output.len()].copy_from_slice(&output);
                padded
            }};
        }
        match hash {
            ReportDataHash::Sha256 => do_hash!(sha2::Sha256),
            ReportDataHash::Sha384 => do_hash!(sha2::Sha384),
            ReportDataHash::Sha512 => do_hash!(sha2::Sha512),
            ReportDataHash::Sha3_256 => do_hash!(sha3::Sha3_256),
            ReportDataHash::Sha3_384 => do_hash!(sha3::Sha3_384),
            ReportDataHash::Sha3_512 => do_hash!(sha3::Sha3_512),
            ReportDataHash::Keccak256 => do_hash!(sha3::Keccak256),
            ReportDataHash::Keccak384 => do_hash!(sha3::Keccak384),
            ReportDataHash::Keccak512 => do_hash!(sha3::Keccak512),
        }
    }
}

/// A quote and the event log needed to interpret its runtime register.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    #[serde(with = "hex")]
    pub quote: Vec<u8>,
    #[serde(default)]
    pub event_log: Vec<TdxEvent>,
}

impl Attestation {
    pub fn new(quote: Vec<u8>, event_log: Vec<TdxEvent>) -> Self {
        Self { quote, event_log }
    }

    /// The runtime (RTMR3) events of the event log, in order.
    pub fn runtime_events(&self) -> Vec<RuntimeEvent> {
        cc_eventlog::tdx::runtime_events(&self.event_log)
    }

    /// Verify the quote's signer chain. The event log is carried along
    /// unchecked; see [`VerifiedAttestation::check_event_log`].
    pub fn verify(
        &self,
        root: &RootAuthority,
        now: SystemTime,
    ) -> Result<VerifiedAttestation, QuoteError> {
        let quote = verify_quote(&self.quote, root, now)?;
        Ok(VerifiedAttestation {
            quote,
            runtime_events: self.runtime_events(),
        })
    }
}

/// Application identity and aggregated measurements of a CVM.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AppInfo {
    #[serde(with = "hex")]
    pub app_id: Vec<u8>,
    #[serde(with = "hex")]
    pub instance_id: Vec<u8>,
    #[serde(with = "hex")]
    pub compose_hash: Vec<u8>,
    #[serde(with = "hex")]
    pub key_provider_info: Vec<u8>,
    #[serde(with = "hex")]
    pub mr_system: [u8; 32],
    #[serde(with = "hex")]
    pub mr_aggregated: [u8; 32],
}

/// An attestation whose quote passed signer-chain verification.
#[derive(Clone, Debug)]
pub struct VerifiedAttestation {
    pub quote: VerifiedQuote,
    pub runtime_events: Vec<RuntimeEvent>,
}

fn sha256<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

impl VerifiedAttestation {
    /// Replay event logs up to and including `to_event`, or all of them.
    pub fn replay_runtime_events(&self, to_event: Option<&str>) -> Vec<u8> {
        cc_eventlog::replay_events::<Sha384>(&self.runtime_events, to_event)
    }

    /// Ensure the runtime events reproduce the quoted RTMR3.
    pub fn check_event_log(&self) -> Result<(), EventLogMismatch> {
        let replayed = self.replay_runtime_events(None);
        let quoted = &self.quote.registers.rtmr3;
        if replayed[..] != quoted[..] {
            return Err(EventLogMismatch {
                quoted: hex::encode(quoted),
                replayed: hex::encode(replayed),
            });
        }
        debug!(events = self.runtime_events.len(), "event log matches rtmr3");
        Ok(())
    }

    /// Payload of the named event. Only meaningful after [`Self::check_event_log`].
    fn event_payload(&self, name: &str) -> Vec<u8> {
        cc_eventlog::find_event_payload(&self.runtime_events, name)
            .map(<[u8]>::to_vec)
            .unwrap_or_default()
    }

    /// Decode the app info from the event log.
    ///
    /// With `boottime_mr` the aggregated measurement only covers events up to
    /// `boot-mr-done` and the key provider is left out.
    pub fn decode_app_info(&self, boottime_mr: bool) -> Result<AppInfo, EventLogMismatch> {
        self.check_event_log()?;
        let key_provider_info = if boottime_mr {
            vec![]
        } else {
            self.event_payload("key-provider")
        };
        let mr_key_provider = if key_provider_info.is_empty() {
            [0u8; 32]
        } else {
            sha256([&key_provider_info[..]])
        };

        let regs = &self.quote.registers;
        let rtmr3 = self.replay_runtime_events(boottime_mr.then_some(BOOT_MR_DONE_EVENT));
        let mr_system = sha256([
            &regs.mrtd[..],
            &regs.rtmr0,
            &regs.rtmr1,
            &regs.rtmr2,
            &mr_key_provider,
        ]);
        let mut parts: Vec<&[u8]> = vec![
            &regs.mrtd[..],
            &regs.rtmr0[..],
            &regs.rtmr1[..],
            &regs.rtmr2[..],
            &rtmr3[..],
        ];
        // Owner fields only take part when any of them is set.
        let quote = &self.quote;
        if quote.mr_config_id != [0u8; 48]
            || quote.mr_owner != [0u8; 48]
            || quote.mr_owner_config != [0u8; 48]
        {
            parts.extend([
                &quote.mr_config_id[..],
                &quote.mr_owner[..],
                &quote.mr_owner_config[..],
            ]);
        }
        let mr_aggregated = sha256(parts);

        Ok(AppInfo {
            app_id: self.event_payload("app-id"),
            instance_id: self.event_payload("instance-id"),
            compose_hash: self.event_payload("compose-hash"),
            key_provider_info,
            mr_system,
            mr_aggregated,
        })
    }
}
