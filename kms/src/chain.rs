// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Verification of the three-link signature chain that ties a payload to a
//! KMS-derived key:
//!
//! 1. the app key signs `"<purpose>:" || hex(derived_public_key)`
//! 2. the KMS root signs `"dstack-kms-issued:" || app_id || app_public_key`
//! 3. the derived key signs the payload (EIP-191 framed unless `raw`)

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{
    identity::Identity,
    recovery::{PublicKey, RecoveryError, SignerRecovery},
};

/// Prefix of the message the KMS root signs for an app key.
pub const KMS_ISSUED_PREFIX: &str = "dstack-kms-issued";
/// Length of an app id embedded in a KMS-issued message.
pub const APP_ID_LEN: usize = 20;
/// Length of a compressed secp256k1 public key.
pub const COMPRESSED_KEY_LEN: usize = 33;

/// `<purpose>:<hex(derived_public_key)>`
pub fn derived_key_message(purpose: &str, derived_public_key: &[u8]) -> Vec<u8> {
    format!("{purpose}:{}", hex::encode(derived_public_key)).into_bytes()
}

/// `dstack-kms-issued:<app_id><app_public_key>`
pub fn kms_issued_message(app_id: &[u8], app_public_key: &[u8]) -> Vec<u8> {
    [KMS_ISSUED_PREFIX.as_bytes(), b":", app_id, app_public_key].concat()
}

/// Frame a payload as an EIP-191 personal message.
pub fn eip191_message(payload: &[u8]) -> Vec<u8> {
    let mut message = format!("\x19Ethereum Signed Message:\n{}", payload.len()).into_bytes();
    message.extend_from_slice(payload);
    message
}

/// How the payload of link 3 was framed before signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    #[default]
    Eip191,
    Raw,
}

impl PayloadEncoding {
    /// The bytes actually signed for `payload`.
    pub fn signed_message(&self, payload: &[u8]) -> Vec<u8> {
        match self {
            Self::Eip191 => eip191_message(payload),
            Self::Raw => payload.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLink {
    #[serde(with = "hex")]
    pub message: Vec<u8>,
    #[serde(with = "hex")]
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureChain {
    #[serde(with = "hex")]
    pub derived_public_key: Vec<u8>,
    /// Derived-key attestation, KMS issuance, payload signature.
    pub links: [ChainLink; 3],
    #[serde(default)]
    pub payload_encoding: PayloadEncoding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Link {
    DerivedKey,
    KmsIssued,
    Payload,
}

impl Link {
    pub fn index(&self) -> usize {
        match self {
            Self::DerivedKey => 1,
            Self::KmsIssued => 2,
            Self::Payload => 3,
        }
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DerivedKey => "derived key",
            Self::KmsIssued => "kms issued",
            Self::Payload => "payload",
        };
        write!(f, "link {} ({name})", self.index())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainError {
    #[error("{link}: invalid signature: {reason}")]
    InvalidSignature { link: Link, reason: String },
    #[error("{link}: malformed message: {reason}")]
    MalformedLink { link: Link, reason: String },
    #[error("invalid derived public key: {reason}")]
    InvalidDerivedKey { reason: String },
    #[error("derived key mismatch: expected {expected}, attested {attested}")]
    DerivedKeyMismatch { expected: String, attested: String },
    #[error("untrusted root: expected {expected}, recovered {actual}")]
    UntrustedRoot { expected: Identity, actual: Identity },
    #[error("app key mismatch: issued for {issued}, signed by {signer}")]
    AppKeyMismatch { issued: String, signer: String },
    #[error("app identity mismatch: expected {expected}, issued for {actual}")]
    AppIdentityMismatch { expected: String, actual: String },
    #[error("payload signer mismatch: expected {expected}, recovered {actual}")]
    PayloadSignerMismatch { expected: Identity, actual: Identity },
}

impl ChainError {
    fn invalid_signature(link: Link, err: RecoveryError) -> Self {
        Self::InvalidSignature {
            link,
            reason: err.to_string(),
        }
    }

    fn malformed(link: Link, reason: impl Into<String>) -> Self {
        Self::MalformedLink {
            link,
            reason: reason.into(),
        }
    }
}

/// Everything recovered from a chain, and every constraint it broke.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub purpose: Option<String>,
    #[serde(serialize_with = "hex_opt::serialize")]
    pub app_id: Option<Vec<u8>>,
    pub app_key: Option<PublicKey>,
    pub root: Option<Identity>,
    pub payload_signer: Option<Identity>,
    pub errors: Vec<ChainError>,
}

mod hex_opt {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }
}

impl ChainReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// The first broken constraint, in link order.
    pub fn first(&self) -> Option<&ChainError> {
        self.errors.first()
    }

    pub fn into_result(self) -> Result<Self, ChainError> {
        match self.errors.first() {
            Some(err) => Err(err.clone()),
            None => Ok(self),
        }
    }
}

/// Split a link 1 message into its purpose and the attested key bytes.
fn parse_derived_key_message(message: &[u8]) -> Result<(String, Vec<u8>), String> {
    let message =
        std::str::from_utf8(message).map_err(|e| format!("message is not UTF-8: {e}"))?;
    let (purpose, key_hex) = message
        .rsplit_once(':')
        .ok_or_else(|| "missing purpose separator".to_string())?;
    let key = hex::decode(key_hex).map_err(|e| format!("key is not hex: {e}"))?;
    Ok((purpose.to_string(), key))
}

/// Split a link 2 message into the app id and the app public key bytes.
fn parse_kms_issued_message(message: &[u8]) -> Result<(&[u8], &[u8]), String> {
    let body = message
        .strip_prefix(KMS_ISSUED_PREFIX.as_bytes())
        .and_then(|rest| rest.strip_prefix(b":"))
        .ok_or_else(|| format!("missing {KMS_ISSUED_PREFIX:?} prefix"))?;
    if body.len() != APP_ID_LEN + COMPRESSED_KEY_LEN {
        return Err(format!(
            "expected {} bytes after prefix, got {}",
            APP_ID_LEN + COMPRESSED_KEY_LEN,
            body.len()
        ));
    }
    Ok(body.split_at(APP_ID_LEN))
}

/// Verify a signature chain. Every link is evaluated; the report lists all
/// broken constraints in link order.
pub fn verify_chain(
    chain: &SignatureChain,
    trusted_root: &Identity,
    expected_app_id: &[u8],
    recovery: &impl SignerRecovery,
) -> ChainReport {
    let mut report = ChainReport::default();
    let mut errors = vec![];

    let derived_key = match recovery.parse_public_key(&chain.derived_public_key) {
        Ok(key) => Some(key),
        Err(err) => {
            errors.push(ChainError::InvalidDerivedKey {
                reason: err.to_string(),
            });
            None
        }
    };

    // Link 1: the app key attests the derived key.
    let [derived_link, issued_link, payload_link] = &chain.links;
    let app_key = recovery
        .recover_signer(&derived_link.message, &derived_link.signature)
        .map_err(|err| errors.push(ChainError::invalid_signature(Link::DerivedKey, err)))
        .ok();
    match parse_derived_key_message(&derived_link.message) {
        Ok((purpose, attested)) => {
            report.purpose = Some(purpose);
            match recovery.parse_public_key(&attested) {
                Ok(attested) => {
                    if let Some(expected) = &derived_key {
                        if &attested != expected {
                            errors.push(ChainError::DerivedKeyMismatch {
                                expected: expected.to_string(),
                                attested: attested.to_string(),
                            });
                        }
                    }
                }
                Err(err) => errors.push(ChainError::malformed(Link::DerivedKey, err.to_string())),
            }
        }
        Err(reason) => errors.push(ChainError::malformed(Link::DerivedKey, reason)),
    }

    // Link 2: the KMS root issues the app key for the app id.
    match recovery
        .recover_signer(&issued_link.message, &issued_link.signature)
        .and_then(|key| recovery.identity_of(&key))
    {
        Ok(root) => {
            if &root != trusted_root {
                errors.push(ChainError::UntrustedRoot {
                    expected: *trusted_root,
                    actual: root,
                });
            }
            report.root = Some(root);
        }
        Err(err) => errors.push(ChainError::invalid_signature(Link::KmsIssued, err)),
    }
    match parse_kms_issued_message(&issued_link.message) {
        Ok((app_id, issued_key)) => {
            match recovery.parse_public_key(issued_key) {
                Ok(issued_key) => {
                    if let Some(app_key) = &app_key {
                        if &issued_key != app_key {
                            errors.push(ChainError::AppKeyMismatch {
                                issued: issued_key.to_string(),
                                signer: app_key.to_string(),
                            });
                        }
                    }
                }
                Err(err) => errors.push(ChainError::malformed(Link::KmsIssued, err.to_string())),
            }
            if app_id != expected_app_id {
                errors.push(ChainError::AppIdentityMismatch {
                    expected: hex::encode(expected_app_id),
                    actual: hex::encode(app_id),
                });
            }
            report.app_id = Some(app_id.to_vec());
        }
        Err(reason) => errors.push(ChainError::malformed(Link::KmsIssued, reason)),
    }
    report.app_key = app_key;

    // Link 3: the derived key signs the payload.
    let signed = chain
        .payload_encoding
        .signed_message(&payload_link.message);
    match recovery
        .recover_signer(&signed, &payload_link.signature)
        .and_then(|key| recovery.identity_of(&key))
    {
        Ok(signer) => {
            if let Some(expected) = derived_key.and_then(|key| recovery.identity_of(&key).ok()) {
                if signer != expected {
                    errors.push(ChainError::PayloadSignerMismatch {
                        expected,
                        actual: signer,
                    });
                }
            }
            report.payload_signer = Some(signer);
        }
        Err(err) => errors.push(ChainError::invalid_signature(Link::Payload, err)),
    }

    debug!(
        valid = errors.is_empty(),
        failures = errors.len(),
        "signature chain evaluated"
    );
    report.errors = errors;
    report
}
