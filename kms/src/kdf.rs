// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! HKDF-SHA256 key derivation.

use hkdf::Hkdf;
use sha2::Sha256;

pub use hkdf::InvalidLength;

/// Derive `key_size` bytes from `input_key_material`, bound to the
/// concatenation of `context_data`.
pub fn derive_key(
    input_key_material: &[u8],
    context_data: &[&[u8]],
    key_size: usize,
) -> Result<Vec<u8>, InvalidLength> {
    let hk = Hkdf::<Sha256>::new(None, input_key_material);
    let mut okm = vec![0u8; key_size];
    hk.expand(&context_data.concat(), &mut okm)?;
    Ok(okm)
}
