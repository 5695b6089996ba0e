// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Signer recovery from recoverable signatures.

use std::fmt;

use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use thiserror::Error;

use crate::identity::Identity;

/// An encoded public key, in the canonical form of its [`SignerRecovery`]
/// scheme (compressed SEC1 for secp256k1).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublicKey(#[serde(with = "hex")] pub Vec<u8>);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({self})")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecoveryError {
    #[error("invalid signature length: {0}")]
    SignatureLength(usize),
    #[error("invalid recovery id: {0}")]
    RecoveryId(u8),
    #[error("invalid signature: {0}")]
    Signature(String),
    #[error("invalid public key: {0}")]
    PublicKey(String),
}

/// Capability to recover the signer of a message.
///
/// Implementations hash `message` themselves; callers pass the exact bytes
/// that were signed.
pub trait SignerRecovery {
    /// Recover the public key that produced `signature` over `message`.
    fn recover_signer(&self, message: &[u8], signature: &[u8])
        -> Result<PublicKey, RecoveryError>;

    /// Parse any accepted encoding of a public key into its canonical form.
    fn parse_public_key(&self, bytes: &[u8]) -> Result<PublicKey, RecoveryError>;

    /// The identity a public key is known by.
    fn identity_of(&self, public_key: &PublicKey) -> Result<Identity, RecoveryError>;
}

/// Recoverable secp256k1 signatures (`r || s || v`) over Keccak-256 digests,
/// with Ethereum-style identities.
#[derive(Debug, Clone, Copy, Default)]
pub struct Secp256k1Recovery;

impl Secp256k1Recovery {
    fn verifying_key(bytes: &[u8]) -> Result<VerifyingKey, RecoveryError> {
        VerifyingKey::from_sec1_bytes(bytes).map_err(|e| RecoveryError::PublicKey(e.to_string()))
    }
}

/// Canonical (compressed SEC1) encoding of a secp256k1 key.
pub fn k256_public_key(key: &VerifyingKey) -> PublicKey {
    PublicKey(key.to_encoded_point(true).as_bytes().to_vec())
}

/// Ethereum address of a secp256k1 key: the last 20 bytes of the Keccak-256
/// hash of the uncompressed point without its tag byte.
pub fn k256_identity(key: &VerifyingKey) -> Identity {
    let point = key.to_encoded_point(false);
    let hash = Keccak256::digest(&point.as_bytes()[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&hash[12..]);
    Identity(address)
}

impl SignerRecovery for Secp256k1Recovery {
    fn recover_signer(
        &self,
        message: &[u8],
        signature: &[u8],
    ) -> Result<PublicKey, RecoveryError> {
        if signature.len() != 65 {
            return Err(RecoveryError::SignatureLength(signature.len()));
        }
        let (rs, v) = signature.split_at(64);
        let v = match v[0] {
            v @ (0 | 1) => v,
            v @ (27 | 28) => v - 27,
            other => return Err(RecoveryError::RecoveryId(other)),
        };
        let recid = RecoveryId::from_byte(v).ok_or(RecoveryError::RecoveryId(v))?;
        let signature =
            Signature::from_slice(rs).map_err(|e| RecoveryError::Signature(e.to_string()))?;
        let digest = Keccak256::new_with_prefix(message);
        let key = VerifyingKey::recover_from_digest(digest, &signature, recid)
            .map_err(|e| RecoveryError::Signature(e.to_string()))?;
        Ok(k256_public_key(&key))
    }

    fn parse_public_key(&self, bytes: &[u8]) -> Result<PublicKey, RecoveryError> {
        Self::verifying_key(bytes).map(|key| k256_public_key(&key))
    }

    fn identity_of(&self, public_key: &PublicKey) -> Result<Identity, RecoveryError> {
        Self::verifying_key(public_key.as_bytes()).map(|key| k256_identity(&key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::SigningKey;

    fn key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32].into()).unwrap()
    }

    fn sign(key: &SigningKey, message: &[u8]) -> Vec<u8> {
        let (signature, recid) = key
            .sign_digest_recoverable(Keccak256::new_with_prefix(message))
            .unwrap();
        let mut bytes = signature.to_vec();
        bytes.push(recid.to_byte());
        bytes
    }

    #[test]
    fn recovers_signer() {
        let key = key(1);
        let signature = sign(&key, b"hello");
        let recovery = Secp256k1Recovery;
        let recovered = recovery.recover_signer(b"hello", &signature).unwrap();
        assert_eq!(recovered, k256_public_key(key.verifying_key()));
        assert_eq!(recovered.as_bytes().len(), 33);
        assert_eq!(
            recovery.identity_of(&recovered).unwrap(),
            k256_identity(key.verifying_key())
        );

        // Ethereum-style v is accepted too.
        let mut eth = signature.clone();
        eth[64] += 27;
        assert_eq!(recovery.recover_signer(b"hello", &eth).unwrap(), recovered);

        let other = recovery.recover_signer(b"hellO", &signature);
        assert_ne!(other.ok(), Some(recovered));
    }

    #[test]
    fn well_known_address() {
        // Private key 0x...01 is the secp256k1 generator.
        let mut secret = [0u8; 32];
        secret[31] = 1;
        let key = SigningKey::from_bytes(&secret.into()).unwrap();
        insta::assert_snapshot!(
            k256_identity(key.verifying_key()).to_string(),
            @"0x7e5f4552091a69125d5dfcb7b8c2659029395bdf"
        );
    }

    #[test]
    fn rejects_bad_signatures() {
        let recovery = Secp256k1Recovery;
        assert_eq!(
            recovery.recover_signer(b"m", &[0u8; 64]),
            Err(RecoveryError::SignatureLength(64))
        );
        assert_eq!(
            recovery.recover_signer(b"m", &[]),
            Err(RecoveryError::SignatureLength(0))
        );
        let mut signature = sign(&key(2), b"m");
        signature[64] = 5;
        assert_eq!(
            recovery.recover_signer(b"m", &signature),
            Err(RecoveryError::RecoveryId(5))
        );
        assert!(matches!(
            recovery.recover_signer(b"m", &[0u8; 65]),
            Err(RecoveryError::Signature(_))
        ));
    }

    #[test]
    fn public_key_forms() {
        let recovery = Secp256k1Recovery;
        let key = key(3);
        let uncompressed = key.verifying_key().to_encoded_point(false);
        let parsed = recovery.parse_public_key(uncompressed.as_bytes()).unwrap();
        assert_eq!(parsed, k256_public_key(key.verifying_key()));
        assert!(recovery.parse_public_key(&[2u8; 10]).is_err());
    }
}
