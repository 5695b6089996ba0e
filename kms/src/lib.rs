// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! dstack KMS key hierarchy: key derivation, signing helpers, and
//! verification of the signature chain that links a payload back to a
//! trusted KMS root.

pub use chain::{
    verify_chain, ChainError, ChainLink, ChainReport, Link, PayloadEncoding, SignatureChain,
};
pub use identity::{Identity, ParseIdentityError};
pub use recovery::{PublicKey, RecoveryError, Secp256k1Recovery, SignerRecovery};

pub mod chain;
pub mod crypto;
mod identity;
pub mod kdf;
pub mod recovery;
