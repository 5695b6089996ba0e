// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Tagged outcomes of a verification run.

use dstack_app_auth::PolicyDenied;
use dstack_attest::{ChainCheck, QuoteError};
use dstack_kms::ChainError;
use serde::Serialize;
use thiserror::Error;

use crate::{binder::BindingMismatch, measurement::RegisterMismatch};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "detail", rename_all = "snake_case")]
pub enum Verdict<T> {
    Pass(T),
    /// Every check that failed.
    Fail(Vec<Failure>),
    /// The input could not be evaluated at all.
    Malformed(Malformed),
}

/// A failed check. The input was usable.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum Failure {
    #[error(transparent)]
    Binding(BindingMismatch),
    #[error("untrusted signer chain ({check}): {reason}")]
    Quote { check: ChainCheck, reason: String },
    #[error(transparent)]
    Measurement(RegisterMismatch),
    #[error(transparent)]
    Chain(ChainError),
    #[error(transparent)]
    Admission(PolicyDenied),
    #[error("missing evidence: {what}")]
    MissingEvidence { what: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum Malformed {
    #[error("malformed quote: {reason}")]
    MalformedQuote { reason: String },
    #[error("unsupported quote version: {version}")]
    UnsupportedVersion { version: u16 },
    #[error("invalid root authority: {reason}")]
    InvalidRootAuthority { reason: String },
    #[error("malformed {input}: {reason}")]
    MalformedInput { input: String, reason: String },
}

impl Malformed {
    pub fn input(input: impl Into<String>, reason: impl ToString) -> Self {
        Self::MalformedInput {
            input: input.into(),
            reason: reason.to_string(),
        }
    }
}

/// Split a quote error into a failed check or unusable input.
pub fn classify_quote_error(err: QuoteError) -> Result<Failure, Malformed> {
    match err {
        QuoteError::UntrustedSignerChain { check, reason } => Ok(Failure::Quote { check, reason }),
        QuoteError::MalformedQuote(reason) => Err(Malformed::MalformedQuote { reason }),
        QuoteError::UnsupportedVersion(version) => Err(Malformed::UnsupportedVersion { version }),
        QuoteError::InvalidRootAuthority(reason) => Err(Malformed::InvalidRootAuthority { reason }),
    }
}

impl<T> Verdict<T> {
    /// `Pass(value)` when nothing failed.
    pub fn from_failures(value: T, failures: Vec<Failure>) -> Self {
        if failures.is_empty() {
            Self::Pass(value)
        } else {
            Self::Fail(failures)
        }
    }

    pub fn from_quote_error(err: QuoteError) -> Self {
        match classify_quote_error(err) {
            Ok(failure) => Self::Fail(vec![failure]),
            Err(malformed) => Self::Malformed(malformed),
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass(_))
    }

    /// 0 when everything passed, 1 on a failed check, 2 on unusable input.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Pass(_) => 0,
            Self::Fail(_) => 1,
            Self::Malformed(_) => 2,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Verdict<U> {
        match self {
            Self::Pass(value) => Verdict::Pass(f(value)),
            Self::Fail(failures) => Verdict::Fail(failures),
            Self::Malformed(err) => Verdict::Malformed(err),
        }
    }
}

impl<T, E: Into<Failure>> From<Result<T, E>> for Verdict<T> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Self::Pass(value),
            Err(err) => Self::Fail(vec![err.into()]),
        }
    }
}

impl From<BindingMismatch> for Failure {
    fn from(err: BindingMismatch) -> Self {
        Self::Binding(err)
    }
}

impl From<RegisterMismatch> for Failure {
    fn from(err: RegisterMismatch) -> Self {
        Self::Measurement(err)
    }
}

impl From<ChainError> for Failure {
    fn from(err: ChainError) -> Self {
        Self::Chain(err)
    }
}

impl From<PolicyDenied> for Failure {
    fn from(err: PolicyDenied) -> Self {
        Self::Admission(err)
    }
}

#[cfg(test)]
mod tests {
    use dstack_app_auth::{DenyReason, InstanceId, ManifestDigest};

    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(Verdict::Pass(()).exit_code(), 0);
        assert_eq!(
            Verdict::<()>::Fail(vec![Failure::MissingEvidence {
                what: "manifest digest".into()
            }])
            .exit_code(),
            1
        );
        assert_eq!(
            Verdict::<()>::Malformed(Malformed::input("statement", "not an object")).exit_code(),
            2
        );
    }

    #[test]
    fn quote_errors_are_classified() {
        let untrusted = QuoteError::UntrustedSignerChain {
            check: ChainCheck::PckCertChain,
            reason: "UnknownIssuer".into(),
        };
        assert_eq!(Verdict::<()>::from_quote_error(untrusted).exit_code(), 1);
        assert_eq!(
            Verdict::<()>::from_quote_error(QuoteError::UnsupportedVersion(3)),
            Verdict::Malformed(Malformed::UnsupportedVersion { version: 3 })
        );
        assert_eq!(
            Verdict::<()>::from_quote_error(QuoteError::MalformedQuote("short".into())).exit_code(),
            2
        );
    }

    #[test]
    fn verdict_json() {
        let verdict: Verdict<()> = Verdict::Fail(vec![
            Failure::Quote {
                check: ChainCheck::QuoteSignature,
                reason: "signature mismatch".into(),
            },
            Failure::Admission(PolicyDenied {
                manifest: ManifestDigest::new(vec![0x39, 0x2b]),
                instance: InstanceId::from("prod9"),
                reason: DenyReason::InstanceNotAllowed,
            }),
        ]);
        insta::assert_snapshot!(
            serde_json::to_string(&verdict).unwrap(),
            @r#"{"verdict":"fail","detail":[{"stage":"quote","check":"quote_signature","reason":"signature mismatch"},{"stage":"admission","manifest":"0x392b","instance":"prod9","reason":"instance_not_allowed"}]}"#
        );

        let malformed: Verdict<()> = Verdict::Malformed(Malformed::input("chain", "expected 3 links"));
        insta::assert_snapshot!(
            serde_json::to_string(&malformed).unwrap(),
            @r#"{"verdict":"malformed","detail":{"error":"malformed_input","input":"chain","reason":"expected 3 links"}}"#
        );
    }

    #[test]
    fn result_conversion() {
        let ok: Result<u8, BindingMismatch> = Ok(1);
        assert_eq!(Verdict::from(ok), Verdict::Pass(1));
        let err: Result<u8, BindingMismatch> = Err(BindingMismatch {
            expected: "aa".into(),
            actual: "bb".into(),
        });
        assert_eq!(
            Verdict::from(err).map(|_| ()),
            Verdict::Fail(vec![Failure::Binding(BindingMismatch {
                expected: "aa".into(),
                actual: "bb".into(),
            })])
        );
    }
}
