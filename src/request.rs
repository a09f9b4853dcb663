// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
// SPDX-License-Identifier: MPL-2.0

//! The request/response contract with the surrounding application.

use serde::{Deserialize, Serialize};

use crate::ledger::{Reservation, SubmissionId};
use crate::limits::ResourceLimits;
use crate::result::{ExecutionResult, ExecutionStatus, ReasonCode};

/// Extra program written next to the learner's source, run in its place
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestHarness {
    pub file_name: String,
    pub source: String,
}

/// A request as received from the surrounding application. Limits are hints,
/// clamped to the policy before use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRequest {
    pub learner_id: String,
    pub exercise_id: String,
    pub source_code: String,
    pub language_id: String,
    #[serde(default)]
    pub test_harness: Option<TestHarness>,
    #[serde(default)]
    pub time_limit_ms: Option<u64>,
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
}

impl SubmissionRequest {
    pub fn new<S: Into<String>>(learner_id: S, exercise_id: S, language_id: S, source: S) -> Self {
        SubmissionRequest {
            learner_id: learner_id.into(),
            exercise_id: exercise_id.into(),
            source_code: source.into(),
            language_id: language_id.into(),
            test_harness: None,
            time_limit_ms: None,
            memory_limit_mb: None,
        }
    }

    pub fn time_limit_ms(mut self, ms: u64) -> Self {
        self.time_limit_ms = Some(ms);
        self
    }

    pub fn memory_limit_mb(mut self, mb: u64) -> Self {
        self.memory_limit_mb = Some(mb);
        self
    }

    pub fn test_harness<S: Into<String>>(mut self, file_name: S, source: S) -> Self {
        self.test_harness = Some(TestHarness {
            file_name: file_name.into(),
            source: source.into(),
        });
        self
    }
}

/// A validated request with its resolved limits. Created by the admission
/// gate and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub learner_id: String,
    pub exercise_id: String,
    pub source_code: String,
    pub language_id: String,
    pub test_harness: Option<TestHarness>,
    pub limits: ResourceLimits,
}

/// What the caller gets back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResponse {
    /// Absent when the request was turned away before an attempt was reserved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_number: Option<u64>,

    /// The ledger entry of the attempt, to `release` once it is persisted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_id: Option<SubmissionId>,

    pub status: ExecutionStatus,

    pub retryable: bool,

    #[serde(flatten)]
    pub payload: ResponsePayload,
}

/// Program output, or the reason there is none
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsePayload {
    Reason {
        reason: ReasonCode,
    },
    Output {
        stdout: String,
        stderr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        duration_ms: u64,
    },
}

impl ExecutionResponse {
    pub fn from_result(reservation: Option<Reservation>, result: &ExecutionResult) -> Self {
        let payload = match (result.status, result.reason) {
            (ExecutionStatus::Rejected, Some(reason))
            | (ExecutionStatus::SandboxUnavailable, Some(reason)) => {
                ResponsePayload::Reason { reason }
            }
            _ => ResponsePayload::Output {
                stdout: result.stdout.clone(),
                stderr: result.stderr.clone(),
                exit_code: result.exit_code,
                duration_ms: result.duration_ms,
            },
        };
        ExecutionResponse {
            attempt_number: reservation.map(|r| r.attempt_number),
            submission_id: reservation.map(|r| r.submission_id),
            status: result.status,
            retryable: result.is_retryable(),
            payload,
        }
    }

    pub fn turned_away(status: ExecutionStatus, reason: ReasonCode) -> Self {
        ExecutionResponse::from_result(None, &ExecutionResult::without_output(status, reason))
    }

    pub fn reason(&self) -> Option<ReasonCode> {
        match self.payload {
            ResponsePayload::Reason { reason } => Some(reason),
            ResponsePayload::Output { .. } => None,
        }
    }

    pub fn stdout(&self) -> Option<&str> {
        match &self.payload {
            ResponsePayload::Output { stdout, .. } => Some(stdout),
            ResponsePayload::Reason { .. } => None,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.payload {
            ResponsePayload::Output { exit_code, .. } => exit_code,
            ResponsePayload::Reason { .. } => None,
        }
    }
}
