// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TDX quote signature-chain verification.
//!
//! The chain is checked in the same order as Intel's QVL:
//! 1. PCK certificate chain (leaf + intermediates) terminates at the root authority
//! 2. The PCK leaf key signed the QE report
//! 3. The QE report data commits to the attestation key and QE auth data
//! 4. The attestation key signed the quote header and body
//!
//! Everything is computed from the inputs and the caller-supplied time, no
//! collateral is fetched.

use std::time::{SystemTime, UNIX_EPOCH};

use p256::ecdsa::{signature::Verifier, Signature, VerifyingKey};
use rustls_pki_types::{CertificateDer, UnixTime};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;
use webpki::EndEntityCert;
use x509_parser::prelude::*;

use crate::{
    error::{ChainCheck, QuoteError},
    quote::{Quote, Report, TdReport10},
};

/// The root certificate a quote's PCK chain must terminate at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RootAuthority {
    der: Vec<u8>,
}

impl RootAuthority {
    pub fn from_der(der: impl Into<Vec<u8>>) -> Result<Self, QuoteError> {
        let der = der.into();
        let (rest, cert) = X509Certificate::from_der(&der)
            .map_err(|e| QuoteError::InvalidRootAuthority(format!("bad certificate: {e}")))?;
        if !rest.is_empty() {
            return Err(QuoteError::InvalidRootAuthority(
                "trailing bytes after certificate".into(),
            ));
        }
        debug!("root authority: subject={}", cert.subject());
        Ok(Self { der })
    }

    pub fn from_pem(pem_str: &str) -> Result<Self, QuoteError> {
        let block = ::pem::parse(pem_str)
            .map_err(|e| QuoteError::InvalidRootAuthority(format!("bad PEM: {e}")))?;
        if block.tag() != "CERTIFICATE" {
            return Err(QuoteError::InvalidRootAuthority(format!(
                "PEM is not a certificate: {}",
                block.tag()
            )));
        }
        Self::from_der(block.into_contents())
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }
}

/// Measurement registers of a TD, in quote order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Registers {
    #[serde(with = "hex")]
    pub mrtd: [u8; 48],
    #[serde(with = "hex")]
    pub rtmr0: [u8; 48],
    #[serde(with = "hex")]
    pub rtmr1: [u8; 48],
    #[serde(with = "hex")]
    pub rtmr2: [u8; 48],
    #[serde(with = "hex")]
    pub rtmr3: [u8; 48],
}

impl Registers {
    pub const NAMES: [&'static str; 5] = ["mrtd", "rtmr0", "rtmr1", "rtmr2", "rtmr3"];

    fn from_report(report: &TdReport10) -> Self {
        Self {
            mrtd: report.mr_td,
            rtmr0: report.rt_mr0,
            rtmr1: report.rt_mr1,
            rtmr2: report.rt_mr2,
            rtmr3: report.rt_mr3,
        }
    }

    /// Look a register up by its lowercase name.
    pub fn get(&self, name: &str) -> Option<&[u8; 48]> {
        match name {
            "mrtd" => Some(&self.mrtd),
            "rtmr0" => Some(&self.rtmr0),
            "rtmr1" => Some(&self.rtmr1),
            "rtmr2" => Some(&self.rtmr2),
            "rtmr3" => Some(&self.rtmr3),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &[u8; 48])> {
        Self::NAMES
            .into_iter()
            .zip([&self.mrtd, &self.rtmr0, &self.rtmr1, &self.rtmr2, &self.rtmr3])
    }
}

/// A quote whose signer chain has been validated.
#[derive(Clone, Debug, Serialize)]
pub struct VerifiedQuote {
    pub version: u16,
    #[serde(with = "hex")]
    pub tee_tcb_svn: [u8; 16],
    pub registers: Registers,
    #[serde(with = "hex")]
    pub mr_config_id: [u8; 48],
    #[serde(with = "hex")]
    pub mr_owner: [u8; 48],
    #[serde(with = "hex")]
    pub mr_owner_config: [u8; 48],
    #[serde(with = "hex")]
    pub report_data: [u8; 64],
    pub signer_chain_valid: bool,
}

/// Verify a raw quote against `root` at time `now`.
pub fn verify_quote(
    raw_quote: &[u8],
    root: &RootAuthority,
    now: SystemTime,
) -> Result<VerifiedQuote, QuoteError> {
    let quote = Quote::parse(raw_quote)?;
    let pck_key = verify_pck_chain(&quote.auth_data.pck_cert_chain, root, now)?;
    verify_qe_report(&quote, &pck_key)?;
    verify_quote_signature(&quote, &raw_quote[..quote.signed_len])?;
    validate_tcb(&quote.report)?;

    let report = quote.td_report();
    debug!(version = quote.header.version, "quote signer chain verified");
    Ok(VerifiedQuote {
        version: quote.header.version,
        tee_tcb_svn: report.tee_tcb_svn,
        registers: Registers::from_report(report),
        mr_config_id: report.mr_config_id,
        mr_owner: report.mr_owner,
        mr_owner_config: report.mr_owner_config,
        report_data: report.report_data,
        signer_chain_valid: true,
    })
}

/// Validate the PCK chain and return the PCK leaf key.
fn verify_pck_chain(
    chain_pem: &[u8],
    root: &RootAuthority,
    now: SystemTime,
) -> Result<VerifyingKey, QuoteError> {
    let blocks = ::pem::parse_many(chain_pem)
        .map_err(|e| QuoteError::malformed("PCK certificate chain", e))?;
    let mut certs = blocks
        .into_iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .map(|block| CertificateDer::from(block.into_contents()));
    let Some(leaf_der) = certs.next() else {
        return Err(QuoteError::MalformedQuote(
            "PCK certificate chain is empty".into(),
        ));
    };
    // A root embedded in the chain is ignored, the caller's root is the anchor.
    let intermediates: Vec<CertificateDer<'static>> =
        certs.filter(|der| der.as_ref() != root.der()).collect();
    debug!(
        "PCK chain: 1 leaf + {} intermediates + 1 root",
        intermediates.len()
    );

    let leaf = EndEntityCert::try_from(&leaf_der)
        .map_err(|e| QuoteError::malformed("PCK leaf certificate", format!("{e:?}")))?;
    let root_der = CertificateDer::from(root.der());
    let anchor = webpki::anchor_from_trusted_cert(&root_der)
        .map_err(|e| QuoteError::InvalidRootAuthority(format!("{e:?}")))?;

    let since_epoch = now.duration_since(UNIX_EPOCH).map_err(|e| {
        QuoteError::untrusted(ChainCheck::PckCertChain, format!("invalid time: {e}"))
    })?;
    leaf.verify_for_usage(
        webpki::ALL_VERIFICATION_ALGS,
        &[anchor],
        &intermediates,
        UnixTime::since_unix_epoch(since_epoch),
        webpki::KeyUsage::client_auth(),
        None,
        None,
    )
    .map_err(|e| QuoteError::untrusted(ChainCheck::PckCertChain, format!("{e:?}")))?;

    let (_, cert) = X509Certificate::from_der(leaf_der.as_ref())
        .map_err(|e| QuoteError::malformed("PCK leaf certificate", e))?;
    VerifyingKey::from_sec1_bytes(cert.public_key().subject_public_key.data.as_ref()).map_err(
        |e| QuoteError::untrusted(ChainCheck::PckCertChain, format!("PCK key is not P-256: {e}")),
    )
}

fn verify_qe_report(quote: &Quote, pck_key: &VerifyingKey) -> Result<(), QuoteError> {
    let auth = &quote.auth_data;
    let signature = Signature::from_slice(&auth.qe_report_signature)
        .map_err(|e| QuoteError::untrusted(ChainCheck::QeReportSignature, e.to_string()))?;
    pck_key
        .verify(&auth.qe_report, &signature)
        .map_err(|e| QuoteError::untrusted(ChainCheck::QeReportSignature, e.to_string()))?;

    let qe_report = auth.decode_qe_report()?;
    let expected = Sha256::new()
        .chain_update(auth.ecdsa_attestation_key)
        .chain_update(&auth.qe_auth_data)
        .finalize();
    if qe_report.report_data[..32] != expected[..] || qe_report.report_data[32..] != [0u8; 32] {
        return Err(QuoteError::untrusted(
            ChainCheck::QeReportData,
            format!(
                "expected {}, found {}",
                hex::encode(expected),
                hex::encode(&qe_report.report_data[..32])
            ),
        ));
    }
    Ok(())
}

fn verify_quote_signature(quote: &Quote, signed: &[u8]) -> Result<(), QuoteError> {
    let auth = &quote.auth_data;
    let mut sec1 = [0u8; 65];
    sec1[0] = 0x04;
    sec1[1..].copy_from_slice(&auth.ecdsa_attestation_key);
    let attestation_key = VerifyingKey::from_sec1_bytes(&sec1).map_err(|e| {
        QuoteError::untrusted(
            ChainCheck::QuoteSignature,
            format!("bad attestation key: {e}"),
        )
    })?;
    let signature = Signature::from_slice(&auth.ecdsa_signature)
        .map_err(|e| QuoteError::untrusted(ChainCheck::QuoteSignature, e.to_string()))?;
    attestation_key
        .verify(signed, &signature)
        .map_err(|e| QuoteError::untrusted(ChainCheck::QuoteSignature, e.to_string()))
}

/// Validate the TCB attributes
pub fn validate_tcb(report: &Report) -> Result<(), QuoteError> {
    fn validate_td10(report: &TdReport10) -> Result<(), QuoteError> {
        let is_debug = report.td_attributes[0] & 0x01 != 0;
        if is_debug {
            return Err(QuoteError::untrusted(
                ChainCheck::TcbAttributes,
                "debug mode is not allowed",
            ));
        }
        if report.mr_signer_seam != [0u8; 48] {
            return Err(QuoteError::untrusted(
                ChainCheck::TcbAttributes,
                "invalid mr signer seam",
            ));
        }
        Ok(())
    }
    match report {
        Report::TD10(report) => validate_td10(report),
        Report::TD15(report) => {
            if report.mr_service_td != [0u8; 48] {
                return Err(QuoteError::untrusted(
                    ChainCheck::TcbAttributes,
                    "invalid mr service td",
                ));
            }
            validate_td10(&report.base)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        quote::{HEADER_SIZE, TD_REPORT10_REPORT_DATA_OFFSET},
        testing::{QuoteTemplate, TestPlatform},
    };

    fn platform() -> TestPlatform {
        TestPlatform::new().expect("failed to create test platform")
    }

    #[test]
    fn verifies_signed_quote() {
        tracing_subscriber::fmt::try_init().ok();
        let platform = platform();
        let template = QuoteTemplate::default()
            .report_data([7u8; 64])
            .register("rtmr1", [1u8; 48]);
        let raw = platform.quote(&template).unwrap();

        let verified = verify_quote(&raw, &platform.root_authority(), SystemTime::now()).unwrap();
        assert!(verified.signer_chain_valid);
        assert_eq!(verified.version, 4);
        assert_eq!(verified.report_data, [7u8; 64]);
        assert_eq!(verified.registers.rtmr1, [1u8; 48]);
        assert_eq!(verified.registers.get("rtmr1"), Some(&[1u8; 48]));
        assert_eq!(verified.registers.get("rtmr9"), None);
    }

    #[test]
    fn verifies_v5_quotes() {
        let platform = platform();
        for td15 in [false, true] {
            let template = QuoteTemplate::default().version(5).td15(td15);
            let raw = platform.quote(&template).unwrap();
            let verified =
                verify_quote(&raw, &platform.root_authority(), SystemTime::now()).unwrap();
            assert_eq!(verified.version, 5);
        }
    }

    #[test]
    fn rejects_foreign_root() {
        let platform = platform();
        let other = self::platform();
        let raw = platform.quote(&QuoteTemplate::default()).unwrap();
        let err = verify_quote(&raw, &other.root_authority(), SystemTime::now()).unwrap_err();
        assert!(
            matches!(
                err,
                QuoteError::UntrustedSignerChain {
                    check: ChainCheck::PckCertChain,
                    ..
                }
            ),
            "{err}"
        );
    }

    #[test]
    fn rejects_tampered_body() {
        let platform = platform();
        let mut raw = platform.quote(&QuoteTemplate::default()).unwrap();
        raw[HEADER_SIZE + TD_REPORT10_REPORT_DATA_OFFSET] ^= 0x01;
        let err = verify_quote(&raw, &platform.root_authority(), SystemTime::now()).unwrap_err();
        assert!(
            matches!(
                err,
                QuoteError::UntrustedSignerChain {
                    check: ChainCheck::QuoteSignature,
                    ..
                }
            ),
            "{err}"
        );
    }

    #[test]
    fn rejects_swapped_attestation_key() {
        let platform = platform();
        let mut raw = platform.quote(&QuoteTemplate::default()).unwrap();
        // First byte of the attestation key, after header, body, auth length and signature.
        let offset = HEADER_SIZE + crate::quote::TD_REPORT10_SIZE + 4 + 64;
        raw[offset] ^= 0x80;
        let err = verify_quote(&raw, &platform.root_authority(), SystemTime::now()).unwrap_err();
        assert!(
            matches!(
                err,
                QuoteError::UntrustedSignerChain {
                    check: ChainCheck::QeReportData,
                    ..
                }
            ),
            "{err}"
        );
    }

    #[test]
    fn rejects_debug_td() {
        let platform = platform();
        let raw = platform
            .quote(&QuoteTemplate::default().debug(true))
            .unwrap();
        let err = verify_quote(&raw, &platform.root_authority(), SystemTime::now()).unwrap_err();
        assert!(
            matches!(
                err,
                QuoteError::UntrustedSignerChain {
                    check: ChainCheck::TcbAttributes,
                    ..
                }
            ),
            "{err}"
        );
    }

    #[test]
    fn unsupported_version_is_distinct() {
        let platform = platform();
        let mut raw = platform.quote(&QuoteTemplate::default()).unwrap();
        raw[0] = 3;
        let err = verify_quote(&raw, &platform.root_authority(), SystemTime::now()).unwrap_err();
        assert_eq!(err, QuoteError::UnsupportedVersion(3));
        assert!(err.is_structural());
    }

    #[test]
    fn truncated_quote_is_malformed() {
        let platform = platform();
        let raw = platform.quote(&QuoteTemplate::default()).unwrap();
        for len in [1, HEADER_SIZE - 1, HEADER_SIZE + 10, raw.len() - 1] {
            let err = verify_quote(&raw[..len], &platform.root_authority(), SystemTime::now())
                .unwrap_err();
            assert!(matches!(err, QuoteError::MalformedQuote(_)), "{len}: {err}");
        }
        let mut extended = raw.clone();
        extended.push(0);
        let err =
            verify_quote(&extended, &platform.root_authority(), SystemTime::now()).unwrap_err();
        assert!(matches!(err, QuoteError::MalformedQuote(_)), "{err}");
    }

    #[test]
    fn root_authority_parsing() {
        let platform = platform();
        let root = RootAuthority::from_pem(&platform.root_pem).unwrap();
        assert_eq!(root, platform.root_authority());
        assert!(matches!(
            RootAuthority::from_pem("not a pem"),
            Err(QuoteError::InvalidRootAuthority(_))
        ));
        assert!(matches!(
            RootAuthority::from_der(vec![1, 2, 3]),
            Err(QuoteError::InvalidRootAuthority(_))
        ));
    }
}
