// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Binding of a statement to the report data of a quote.

use dstack_attest::{QuoteContentType, ReportDataHash, VerifiedQuote};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::statement::Statement;

/// The report data a quote must carry to vouch for `statement`.
pub fn report_data(statement: &Statement, hash: ReportDataHash) -> [u8; 64] {
    QuoteContentType::AppData.to_report_data_with_hash(&statement.canonical_bytes(), hash)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Bound {
    #[serde(with = "hex")]
    pub report_data: [u8; 64],
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("binding mismatch: statement digest {expected}, report data {actual}")]
pub struct BindingMismatch {
    pub expected: String,
    pub actual: String,
}

pub fn bind(statement: &Statement, report_data: &[u8]) -> Result<Bound, BindingMismatch> {
    bind_with_hash(statement, report_data, ReportDataHash::default())
}

pub fn bind_with_hash(
    statement: &Statement,
    actual: &[u8],
    hash: ReportDataHash,
) -> Result<Bound, BindingMismatch> {
    let expected = self::report_data(statement, hash);
    if expected[..] != *actual {
        debug!(%hash, "statement is not bound to report data");
        return Err(BindingMismatch {
            expected: hex::encode(expected),
            actual: hex::encode(actual),
        });
    }
    Ok(Bound {
        report_data: expected,
    })
}

pub fn bind_attestation(
    statement: &Statement,
    quote: &VerifiedQuote,
    hash: ReportDataHash,
) -> Result<Bound, BindingMismatch> {
    bind_with_hash(statement, &quote.report_data, hash)
}
