// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TDX attestation for dstack: quote parsing, quote signer-chain verification
//! against a caller-supplied root, and the attestation envelope that pairs a
//! quote with its runtime event log.

pub use cc_eventlog as ccel;

pub use attestation::{
    AppInfo, Attestation, QuoteContentType, ReportDataHash, UnknownHashAlgorithm,
    VerifiedAttestation,
};
pub use error::{ChainCheck, EventLogMismatch, QuoteError};
pub use verify::{validate_tcb, verify_quote, Registers, RootAuthority, VerifiedQuote};

pub mod attestation;
mod error;
pub mod quote;
pub mod verify;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
