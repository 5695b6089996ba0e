// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Signed test quotes under a throwaway root CA.
//!
//! The platform mirrors Intel's hierarchy: root CA → platform CA → PCK leaf.
//! Quotes are produced with the exact layout [`crate::quote::Quote::parse`]
//! reads, so every verification path can be exercised without hardware.

use anyhow::{anyhow, Context, Result};
use cc_eventlog::{RuntimeEvent, TdxEvent};
use p256::{
    ecdsa::{signature::Signer, Signature, SigningKey},
    pkcs8::DecodePrivateKey,
};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
};
use scale::Encode;
use sha2::{Digest, Sha256, Sha384};

use crate::{
    attestation::Attestation,
    quote::{
        EnclaveReport, Header, TdReport10, TdReport15, ATTESTATION_KEY_TYPE_ECDSA256_P256,
        BODY_TYPE_TD10, BODY_TYPE_TD15, CERT_TYPE_PCK_CERT_CHAIN, CERT_TYPE_QE_REPORT_CERT_DATA,
        TD_REPORT10_SIZE, TD_REPORT15_SIZE, TEE_TYPE_TDX,
    },
    verify::RootAuthority,
};

/// Intel SGX QE vendor id.
const QE_VENDOR_ID: [u8; 16] = [
    0x93, 0x9a, 0x72, 0x33, 0xf7, 0x9c, 0x4c, 0xa9, 0x94, 0x0a, 0x0d, 0xb3, 0x95, 0x7f, 0x06, 0x07,
];

/// Contents of a test quote.
#[derive(Clone, Debug)]
pub struct QuoteTemplate {
    pub version: u16,
    pub td15: bool,
    pub debug: bool,
    pub mrtd: [u8; 48],
    pub rtmrs: [[u8; 48]; 4],
    pub report_data: [u8; 64],
}

impl Default for QuoteTemplate {
    fn default() -> Self {
        Self {
            version: 4,
            td15: false,
            debug: false,
            mrtd: [0u8; 48],
            rtmrs: [[0u8; 48]; 4],
            report_data: [0u8; 64],
        }
    }
}

impl QuoteTemplate {
    pub fn version(mut self, version: u16) -> Self {
        self.version = version;
        self
    }

    pub fn td15(mut self, td15: bool) -> Self {
        self.td15 = td15;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn report_data(mut self, report_data: [u8; 64]) -> Self {
        self.report_data = report_data;
        self
    }

    /// Set a register by name (`mrtd`, `rtmr0`..`rtmr3`). Unknown names are ignored.
    pub fn register(mut self, name: &str, value: [u8; 48]) -> Self {
        match name {
            "mrtd" => self.mrtd = value,
            "rtmr0" => self.rtmrs[0] = value,
            "rtmr1" => self.rtmrs[1] = value,
            "rtmr2" => self.rtmrs[2] = value,
            "rtmr3" => self.rtmrs[3] = value,
            _ => {}
        }
        self
    }

    fn td_report(&self) -> TdReport10 {
        let mut td_attributes = [0u8; 8];
        if self.debug {
            td_attributes[0] |= 0x01;
        }
        TdReport10 {
            tee_tcb_svn: [0u8; 16],
            mr_seam: [0u8; 48],
            mr_signer_seam: [0u8; 48],
            seam_attributes: [0u8; 8],
            td_attributes,
            xfam: [0u8; 8],
            mr_td: self.mrtd,
            mr_config_id: [0u8; 48],
            mr_owner: [0u8; 48],
            mr_owner_config: [0u8; 48],
            rt_mr0: self.rtmrs[0],
            rt_mr1: self.rtmrs[1],
            rt_mr2: self.rtmrs[2],
            rt_mr3: self.rtmrs[3],
            report_data: self.report_data,
        }
    }
}

/// A fake TDX platform: CA hierarchy, PCK key and attestation key.
pub struct TestPlatform {
    pub root_pem: String,
    root_der: Vec<u8>,
    pck_chain_pem: String,
    pck_key: SigningKey,
    attestation_key: SigningKey,
}

fn ca_params(common_name: &str) -> Result<CertificateParams> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    let mut name = DistinguishedName::new();
    name.push(DnType::OrganizationName, "Test Platform Vendor");
    name.push(DnType::CommonName, common_name);
    params.distinguished_name = name;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    Ok(params)
}

fn p256_key(key_pair: &KeyPair) -> Result<SigningKey> {
    SigningKey::from_pkcs8_der(&key_pair.serialize_der()).context("Failed to convert key pair")
}

impl TestPlatform {
    pub fn new() -> Result<Self> {
        let root_key = KeyPair::generate()?;
        let root_cert = ca_params("Test SGX Root CA")?.self_signed(&root_key)?;

        let platform_key = KeyPair::generate()?;
        let platform_cert =
            ca_params("Test SGX PCK Platform CA")?.signed_by(&platform_key, &root_cert, &root_key)?;

        let pck_key_pair = KeyPair::generate()?;
        let mut pck_params = CertificateParams::new(Vec::<String>::new())?;
        pck_params
            .distinguished_name
            .push(DnType::CommonName, "Test SGX PCK Certificate");
        pck_params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::ContentCommitment,
        ];
        let pck_cert = pck_params.signed_by(&pck_key_pair, &platform_cert, &platform_key)?;

        let attestation_key = p256_key(&KeyPair::generate()?)?;
        Ok(Self {
            root_pem: root_cert.pem(),
            root_der: root_cert.der().to_vec(),
            pck_chain_pem: [pck_cert.pem(), platform_cert.pem(), root_cert.pem()].concat(),
            pck_key: p256_key(&pck_key_pair)?,
            attestation_key,
        })
    }

    pub fn root_authority(&self) -> RootAuthority {
        RootAuthority::from_der(self.root_der.clone())
            .unwrap_or_else(|e| panic!("test root certificate is invalid: {e}"))
    }

    /// Produce a signed quote for `template`.
    pub fn quote(&self, template: &QuoteTemplate) -> Result<Vec<u8>> {
        let header = Header {
            version: template.version,
            attestation_key_type: ATTESTATION_KEY_TYPE_ECDSA256_P256,
            tee_type: TEE_TYPE_TDX,
            qe_svn: 0,
            pce_svn: 0,
            qe_vendor_id: QE_VENDOR_ID,
            user_data: [0u8; 20],
        };
        let report = template.td_report();

        let mut signed = header.encode();
        match (template.version, template.td15) {
            (4, _) => report.encode_to(&mut signed),
            (_, false) => {
                BODY_TYPE_TD10.encode_to(&mut signed);
                (TD_REPORT10_SIZE as u32).encode_to(&mut signed);
                report.encode_to(&mut signed);
            }
            (_, true) => {
                BODY_TYPE_TD15.encode_to(&mut signed);
                (TD_REPORT15_SIZE as u32).encode_to(&mut signed);
                TdReport15 {
                    base: report,
                    tee_tcb_svn2: [0u8; 16],
                    mr_service_td: [0u8; 48],
                }
                .encode_to(&mut signed);
            }
        }

        let quote_signature: Signature = self.attestation_key.sign(&signed);
        let attestation_point = self.attestation_key.verifying_key().to_encoded_point(false);
        let attestation_key = &attestation_point.as_bytes()[1..];

        let qe_auth_data = b"test qe authentication data".to_vec();
        let mut qe_report_data = [0u8; 64];
        qe_report_data[..32].copy_from_slice(
            &Sha256::new()
                .chain_update(attestation_key)
                .chain_update(&qe_auth_data)
                .finalize(),
        );
        let qe_report = EnclaveReport {
            cpu_svn: [0u8; 16],
            misc_select: 0,
            reserved1: [0u8; 28],
            attributes: [0u8; 16],
            mr_enclave: [0u8; 32],
            reserved2: [0u8; 32],
            mr_signer: [0u8; 32],
            reserved3: [0u8; 96],
            isv_prod_id: 1,
            isv_svn: 0,
            reserved4: [0u8; 60],
            report_data: qe_report_data,
        }
        .encode();
        let qe_report_signature: Signature = self.pck_key.sign(&qe_report);

        let pck_chain = self.pck_chain_pem.as_bytes();
        let mut qe_cert_data = qe_report;
        qe_cert_data.extend_from_slice(&qe_report_signature.to_bytes());
        (qe_auth_data.len() as u16).encode_to(&mut qe_cert_data);
        qe_cert_data.extend_from_slice(&qe_auth_data);
        CERT_TYPE_PCK_CERT_CHAIN.encode_to(&mut qe_cert_data);
        (pck_chain.len() as u32).encode_to(&mut qe_cert_data);
        qe_cert_data.extend_from_slice(pck_chain);

        let mut auth_data = quote_signature.to_bytes().to_vec();
        auth_data.extend_from_slice(attestation_key);
        CERT_TYPE_QE_REPORT_CERT_DATA.encode_to(&mut auth_data);
        (qe_cert_data.len() as u32).encode_to(&mut auth_data);
        auth_data.extend_from_slice(&qe_cert_data);

        let mut quote = signed;
        (auth_data.len() as u32).encode_to(&mut quote);
        quote.extend_from_slice(&auth_data);
        Ok(quote)
    }

    /// Produce an attestation whose RTMR3 is the replay of `events`.
    pub fn attestation(
        &self,
        report_data: [u8; 64],
        events: &[RuntimeEvent],
    ) -> Result<Attestation> {
        let rtmr3: [u8; 48] = cc_eventlog::replay_events::<Sha384>(events, None)
            .try_into()
            .map_err(|_| anyhow!("replayed rtmr3 is not 48 bytes"))?;
        self.attestation_with(
            &QuoteTemplate::default()
                .report_data(report_data)
                .register("rtmr3", rtmr3),
            events,
        )
    }

    /// Produce an attestation for `template`, carrying `events` as its event log
    /// regardless of the template's RTMR3.
    pub fn attestation_with(
        &self,
        template: &QuoteTemplate,
        events: &[RuntimeEvent],
    ) -> Result<Attestation> {
        let event_log = events.iter().cloned().map(TdxEvent::from).collect();
        Ok(Attestation::new(self.quote(template)?, event_log))
    }
}
