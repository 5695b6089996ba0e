// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use serde::Serialize;
use thiserror::Error;

/// The step of quote signer-chain validation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainCheck {
    /// PCK certificate chain up to the root authority
    PckCertChain,
    /// PCK signature over the QE report
    QeReportSignature,
    /// QE report data binding of the attestation key
    QeReportData,
    /// Attestation key signature over the quote
    QuoteSignature,
    /// TD attributes acceptable for production use
    TcbAttributes,
}

impl std::fmt::Display for ChainCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::PckCertChain => "PCK certificate chain",
            Self::QeReportSignature => "QE report signature",
            Self::QeReportData => "QE report data",
            Self::QuoteSignature => "quote signature",
            Self::TcbAttributes => "TCB attributes",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuoteError {
    /// The bytes are not a structurally valid quote.
    #[error("malformed quote: {0}")]
    MalformedQuote(String),
    /// The quote is well-formed but of a version this verifier does not understand.
    #[error("unsupported quote version: {0}")]
    UnsupportedVersion(u16),
    /// The quote's signature chain does not lead to the root authority.
    #[error("untrusted signer chain ({check}): {reason}")]
    UntrustedSignerChain { check: ChainCheck, reason: String },
    /// The caller-supplied root authority is unusable.
    #[error("invalid root authority: {0}")]
    InvalidRootAuthority(String),
}

impl QuoteError {
    pub(crate) fn malformed(what: &str, err: impl std::fmt::Display) -> Self {
        Self::MalformedQuote(format!("{what}: {err}"))
    }

    pub(crate) fn untrusted(check: ChainCheck, reason: impl Into<String>) -> Self {
        Self::UntrustedSignerChain {
            check,
            reason: reason.into(),
        }
    }

    /// Whether the error describes the input rather than a failed check.
    pub fn is_structural(&self) -> bool {
        !matches!(self, Self::UntrustedSignerChain { .. })
    }
}

/// The runtime event log cannot be reconciled with the quoted RTMR3.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("RTMR3 mismatch, quoted: {quoted}, replayed: {replayed}")]
pub struct EventLogMismatch {
    pub quoted: String,
    pub replayed: String,
}
