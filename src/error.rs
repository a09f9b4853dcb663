// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
// SPDX-License-Identifier: MPL-2.0

//! Error types of the execution core.

use std::path::PathBuf;

use thiserror::Error;

use crate::ledger::SubmissionId;
use crate::result::ReasonCode;

/// A request that failed validation at the admission gate. It never reaches
/// the orchestrator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} is empty, too long or contains control characters")]
    InvalidIdentifier { field: &'static str },

    #[error("source code is empty")]
    EmptySource,

    #[error("source code is {size} bytes, the limit is {limit}")]
    SourceTooLarge { size: usize, limit: usize },

    #[error("language `{0}` is not supported")]
    UnsupportedLanguage(String),

    #[error("invalid test harness: {0}")]
    InvalidHarness(&'static str),

    #[error("language `{0}` does not accept a test harness")]
    HarnessNotSupported(String),
}

impl ValidationError {
    pub fn reason(&self) -> ReasonCode {
        match self {
            ValidationError::InvalidIdentifier { .. } => ReasonCode::InvalidIdentifier,
            ValidationError::EmptySource => ReasonCode::EmptySource,
            ValidationError::SourceTooLarge { .. } => ReasonCode::SourceTooLarge,
            ValidationError::UnsupportedLanguage(_) => ReasonCode::UnsupportedLanguage,
            ValidationError::InvalidHarness(_) => ReasonCode::InvalidHarness,
            ValidationError::HarnessNotSupported(_) => ReasonCode::HarnessNotSupported,
        }
    }
}

/// Errors of the submission ledger.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("submission {0} does not exist")]
    UnknownSubmission(SubmissionId),

    #[error("submission {0} was already finalized with a different result")]
    AlreadyFinalized(SubmissionId),

    #[error("submission {0} is not finalized yet")]
    NotFinalized(SubmissionId),
}

/// Errors loading or checking the policy.
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("cannot read policy file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse policy file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid policy: {0}")]
    Invalid(String),
}
