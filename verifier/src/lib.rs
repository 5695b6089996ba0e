// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Verification of dstack CVM evidence: statement binding, quote and
//! measurement checks, KMS signature chains and fleet admission, combined
//! into one [`Verdict`].

pub use binder::{bind, bind_attestation, bind_with_hash, BindingMismatch, Bound};
pub use config::Config;
pub use measurement::{
    compare, compare_attestation, MeasurementReport, MismatchKind, ReferenceValues,
    RegisterMismatch,
};
pub use statement::{Decimal, Statement, StatementError, Value};
pub use types::{Admission, VerificationReport, VerificationRequest};
pub use verdict::{classify_quote_error, Failure, Malformed, Verdict};
pub use verification::CvmVerifier;

pub mod binder;
mod config;
mod hex_bytes;
pub mod measurement;
pub mod statement;
mod types;
mod verdict;
mod verification;
