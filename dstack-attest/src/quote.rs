// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Intel DCAP ECDSA quote layout for TDX (quote versions 4 and 5).
//!
//! All integers are little-endian and all arrays are fixed-size, which is
//! exactly the SCALE encoding of the structs below. Variable-length regions
//! carry an explicit `u16`/`u32` length prefix and are decoded through [`Data`].

use std::marker::PhantomData;

use scale::{Decode, Encode, Input};
use tracing::debug;

use crate::error::QuoteError;

pub const HEADER_SIZE: usize = 48;
pub const TD_REPORT10_SIZE: usize = 584;
pub const TD_REPORT15_SIZE: usize = 648;
pub const ENCLAVE_REPORT_SIZE: usize = 384;
pub const ECDSA_SIGNATURE_SIZE: usize = 64;
pub const ECDSA_PUBKEY_SIZE: usize = 64;
/// Offset of `report_data` inside a TD 1.0 report body.
pub const TD_REPORT10_REPORT_DATA_OFFSET: usize = 520;

pub const TEE_TYPE_TDX: u32 = 0x0000_0081;
pub const ATTESTATION_KEY_TYPE_ECDSA256_P256: u16 = 2;
pub const BODY_TYPE_TD10: u16 = 2;
pub const BODY_TYPE_TD15: u16 = 3;
pub const CERT_TYPE_PCK_CERT_CHAIN: u16 = 5;
pub const CERT_TYPE_QE_REPORT_CERT_DATA: u16 = 6;

pub const SUPPORTED_VERSIONS: [u16; 2] = [4, 5];

/// Length-prefixed byte string. `L` is the width of the prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Data<L> {
    pub data: Vec<u8>,
    _len: PhantomData<L>,
}

impl<L: Decode + Into<u64>> Decode for Data<L> {
    fn decode<I: Input>(input: &mut I) -> Result<Self, scale::Error> {
        let len = L::decode(input)?.into();
        let len = usize::try_from(len).map_err(|_| "length prefix overflows usize")?;
        if let Some(remaining) = input.remaining_len()? {
            if len > remaining {
                return Err("length prefix exceeds input".into());
            }
        }
        let mut data = vec![0u8; len];
        input.read(&mut data)?;
        Ok(Self {
            data,
            _len: PhantomData,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Header {
    pub version: u16,
    pub attestation_key_type: u16,
    pub tee_type: u32,
    pub qe_svn: u16,
    pub pce_svn: u16,
    pub qe_vendor_id: [u8; 16],
    pub user_data: [u8; 20],
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct TdReport10 {
    pub tee_tcb_svn: [u8; 16],
    pub mr_seam: [u8; 48],
    pub mr_signer_seam: [u8; 48],
    pub seam_attributes: [u8; 8],
    pub td_attributes: [u8; 8],
    pub xfam: [u8; 8],
    pub mr_td: [u8; 48],
    pub mr_config_id: [u8; 48],
    pub mr_owner: [u8; 48],
    pub mr_owner_config: [u8; 48],
    pub rt_mr0: [u8; 48],
    pub rt_mr1: [u8; 48],
    pub rt_mr2: [u8; 48],
    pub rt_mr3: [u8; 48],
    pub report_data: [u8; 64],
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct TdReport15 {
    pub base: TdReport10,
    pub tee_tcb_svn2: [u8; 16],
    pub mr_service_td: [u8; 48],
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Report {
    TD10(TdReport10),
    TD15(TdReport15),
}

impl Report {
    pub fn as_td10(&self) -> &TdReport10 {
        match self {
            Report::TD10(report) => report,
            Report::TD15(report) => &report.base,
        }
    }
}

/// SGX enclave report, as used for the Quoting Enclave report.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct EnclaveReport {
    pub cpu_svn: [u8; 16],
    pub misc_select: u32,
    pub reserved1: [u8; 28],
    pub attributes: [u8; 16],
    pub mr_enclave: [u8; 32],
    pub reserved2: [u8; 32],
    pub mr_signer: [u8; 32],
    pub reserved3: [u8; 96],
    pub isv_prod_id: u16,
    pub isv_svn: u16,
    pub reserved4: [u8; 60],
    pub report_data: [u8; 64],
}

#[derive(Clone, Debug, PartialEq, Eq, Decode)]
struct CertificationData {
    cert_type: u16,
    body: Data<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Decode)]
struct RawQeReportCertificationData {
    qe_report: [u8; ENCLAVE_REPORT_SIZE],
    qe_report_signature: [u8; ECDSA_SIGNATURE_SIZE],
    qe_auth_data: Data<u16>,
    certification_data: CertificationData,
}

#[derive(Clone, Debug, PartialEq, Eq, Decode)]
struct RawAuthDataV4 {
    ecdsa_signature: [u8; ECDSA_SIGNATURE_SIZE],
    ecdsa_attestation_key: [u8; ECDSA_PUBKEY_SIZE],
    certification_data: CertificationData,
}

/// Quote signature data (ECDSA-256 with P-256, QE report certification data).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthData {
    pub ecdsa_signature: [u8; ECDSA_SIGNATURE_SIZE],
    /// Raw `x || y` coordinates of the attestation key
    pub ecdsa_attestation_key: [u8; ECDSA_PUBKEY_SIZE],
    /// QE report bytes as signed by the PCK
    pub qe_report: [u8; ENCLAVE_REPORT_SIZE],
    pub qe_report_signature: [u8; ECDSA_SIGNATURE_SIZE],
    pub qe_auth_data: Vec<u8>,
    /// PEM encoded PCK certificate chain, leaf first
    pub pck_cert_chain: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Quote {
    pub header: Header,
    pub report: Report,
    pub auth_data: AuthData,
    /// Number of leading bytes covered by the attestation key signature
    /// (header and body, including the v5 body descriptor).
    pub signed_len: usize,
}

fn decode_exact<T: Decode>(what: &str, input: &mut &[u8]) -> Result<T, QuoteError> {
    T::decode(input).map_err(|e| QuoteError::malformed(what, e))
}

fn ensure_consumed(what: &str, input: &[u8]) -> Result<(), QuoteError> {
    if !input.is_empty() {
        return Err(QuoteError::MalformedQuote(format!(
            "{} trailing bytes after {what}",
            input.len()
        )));
    }
    Ok(())
}

impl Quote {
    /// Parse a quote. The version is checked before anything else is read.
    pub fn parse(quote: &[u8]) -> Result<Self, QuoteError> {
        let version = decode_exact::<u16>("version", &mut &quote[..])?;
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(QuoteError::UnsupportedVersion(version));
        }

        let mut input = quote;
        let header: Header = decode_exact("header", &mut input)?;
        if header.tee_type != TEE_TYPE_TDX {
            return Err(QuoteError::MalformedQuote(format!(
                "not a TDX quote, tee type {:#x}",
                header.tee_type
            )));
        }
        if header.attestation_key_type != ATTESTATION_KEY_TYPE_ECDSA256_P256 {
            return Err(QuoteError::MalformedQuote(format!(
                "unsupported attestation key type {}",
                header.attestation_key_type
            )));
        }

        let report = match header.version {
            4 => Report::TD10(decode_exact("TD report", &mut input)?),
            _ => {
                let body_type: u16 = decode_exact("body type", &mut input)?;
                let body_size: u32 = decode_exact("body size", &mut input)?;
                let expected_size = match body_type {
                    BODY_TYPE_TD10 => TD_REPORT10_SIZE,
                    BODY_TYPE_TD15 => TD_REPORT15_SIZE,
                    _ => {
                        return Err(QuoteError::MalformedQuote(format!(
                            "unsupported body type {body_type}"
                        )))
                    }
                };
                if body_size as usize != expected_size {
                    return Err(QuoteError::MalformedQuote(format!(
                        "body size {body_size} does not match body type {body_type}"
                    )));
                }
                if body_type == BODY_TYPE_TD10 {
                    Report::TD10(decode_exact("TD report", &mut input)?)
                } else {
                    Report::TD15(decode_exact("TD 1.5 report", &mut input)?)
                }
            }
        };
        let signed_len = quote.len() - input.len();

        let auth_data: Data<u32> = decode_exact("auth data", &mut input)?;
        ensure_consumed("auth data", input)?;
        let auth_data = AuthData::parse(&auth_data.data)?;

        debug!(
            version = header.version,
            signed_len,
            pck_chain_len = auth_data.pck_cert_chain.len(),
            "parsed quote"
        );
        Ok(Self {
            header,
            report,
            auth_data,
            signed_len,
        })
    }

    pub fn td_report(&self) -> &TdReport10 {
        self.report.as_td10()
    }
}

impl AuthData {
    fn parse(data: &[u8]) -> Result<Self, QuoteError> {
        let mut input = data;
        let raw: RawAuthDataV4 = decode_exact("signature data", &mut input)?;
        ensure_consumed("signature data", input)?;
        if raw.certification_data.cert_type != CERT_TYPE_QE_REPORT_CERT_DATA {
            return Err(QuoteError::MalformedQuote(format!(
                "unsupported certification data type {}",
                raw.certification_data.cert_type
            )));
        }

        let mut input = &raw.certification_data.body.data[..];
        let qe: RawQeReportCertificationData =
            decode_exact("QE report certification data", &mut input)?;
        ensure_consumed("QE report certification data", input)?;
        if qe.certification_data.cert_type != CERT_TYPE_PCK_CERT_CHAIN {
            return Err(QuoteError::MalformedQuote(format!(
                "unsupported QE certification data type {}",
                qe.certification_data.cert_type
            )));
        }

        Ok(Self {
            ecdsa_signature: raw.ecdsa_signature,
            ecdsa_attestation_key: raw.ecdsa_attestation_key,
            qe_report: qe.qe_report,
            qe_report_signature: qe.qe_report_signature,
            qe_auth_data: qe.qe_auth_data.data,
            pck_cert_chain: qe.certification_data.body.data,
        })
    }

    pub fn decode_qe_report(&self) -> Result<EnclaveReport, QuoteError> {
        EnclaveReport::decode(&mut &self.qe_report[..])
            .map_err(|e| QuoteError::malformed("QE report", e))
    }
}
