// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! Signing side of the KMS key hierarchy: how roots issue app keys, app keys
//! attest derived keys, and derived keys sign payloads.

use anyhow::{Context, Result};
use k256::ecdsa::SigningKey;
use sha3::{Digest, Keccak256};

use crate::{
    chain::{
        derived_key_message, kms_issued_message, ChainLink, PayloadEncoding, SignatureChain,
        KMS_ISSUED_PREFIX,
    },
    kdf,
};

fn compressed_public_key(key: &SigningKey) -> Vec<u8> {
    key.verifying_key()
        .to_encoded_point(true)
        .as_bytes()
        .to_vec()
}

fn derive_child_key(parent_key: &SigningKey, context_data: &[&[u8]]) -> Result<SigningKey> {
    let derived_key_bytes: [u8; 32] = kdf::derive_key(&parent_key.to_bytes(), context_data, 32)
        .map_err(|e| anyhow::anyhow!("Failed to derive key: {e}"))?
        .try_into()
        .ok()
        .context("Invalid derived key len")?;
    SigningKey::from_bytes(&derived_key_bytes.into()).context("Derived key is out of range")
}

/// Derive the app key from the KMS root key and sign it for `app_id`.
pub fn derive_k256_key(parent_key: &SigningKey, app_id: &[u8]) -> Result<(SigningKey, Vec<u8>)> {
    let derived_signing_key = derive_child_key(parent_key, &[app_id, b"app-key"])?;
    let signature = sign_message(
        parent_key,
        KMS_ISSUED_PREFIX.as_bytes(),
        app_id,
        &compressed_public_key(&derived_signing_key),
    )?;
    Ok((derived_signing_key, signature))
}

/// Derive a purpose-specific key from an app key.
pub fn derive_purpose_key(app_key: &SigningKey, purpose: &str) -> Result<SigningKey> {
    derive_child_key(app_key, &[purpose.as_bytes(), b"derived-key"])
}

fn sign_raw(key: &SigningKey, message: &[u8]) -> Result<Vec<u8>> {
    let digest = Keccak256::new_with_prefix(message);
    let (signature, recid) = key.sign_digest_recoverable(digest)?;
    let mut signature_bytes = signature.to_vec();
    signature_bytes.push(recid.to_byte());
    Ok(signature_bytes)
}

/// Sign `prefix:appid||message` with a recoverable signature.
pub fn sign_message(
    key: &SigningKey,
    prefix: &[u8],
    appid: &[u8],
    message: &[u8],
) -> Result<Vec<u8>> {
    sign_raw(key, &[prefix, b":", appid, message].concat())
}

/// App key attestation of a derived key for `purpose`.
pub fn sign_derived_key(
    app_key: &SigningKey,
    purpose: &str,
    derived_key: &SigningKey,
) -> Result<Vec<u8>> {
    sign_raw(
        app_key,
        &derived_key_message(purpose, &compressed_public_key(derived_key)),
    )
}

pub fn sign_payload(
    derived_key: &SigningKey,
    payload: &[u8],
    encoding: PayloadEncoding,
) -> Result<Vec<u8>> {
    sign_raw(derived_key, &encoding.signed_message(payload))
}

/// Issue a complete signature chain for `payload` under `root_key`.
pub fn issue_chain(
    root_key: &SigningKey,
    app_id: &[u8],
    purpose: &str,
    payload: &[u8],
    encoding: PayloadEncoding,
) -> Result<SignatureChain> {
    let (app_key, issued_signature) =
        derive_k256_key(root_key, app_id).context("Failed to derive app key")?;
    let derived_key =
        derive_purpose_key(&app_key, purpose).context("Failed to derive purpose key")?;
    let derived_public_key = compressed_public_key(&derived_key);

    let links = [
        ChainLink {
            message: derived_key_message(purpose, &derived_public_key),
            signature: sign_derived_key(&app_key, purpose, &derived_key)?,
        },
        ChainLink {
            message: kms_issued_message(app_id, &compressed_public_key(&app_key)),
            signature: issued_signature,
        },
        ChainLink {
            message: payload.to_vec(),
            signature: sign_payload(&derived_key, payload, encoding)?,
        },
    ];
    Ok(SignatureChain {
        derived_public_key,
        links,
        payload_encoding: encoding,
    })
}
