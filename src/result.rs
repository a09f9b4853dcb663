// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Serialize};

use crate::configuration::SandboxId;

/// Struct that contains the information about resource usage of the process
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Peak memory usage in bytes
    pub memory_usage: u64,

    /// User cpu time usage in seconds
    pub user_cpu_time: f64,

    /// System cpu time usage in seconds
    pub system_cpu_time: f64,

    /// Wall time usage in seconds
    pub wall_time_usage: f64,
}

/// Exit status of a sandbox process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitStatus {
    /// Process terminated with an exit code
    ExitCode(i32),

    /// Process was killed with a signal
    Signal(i32),

    /// Process was destroyed through the kill switch
    Killed,
}

impl ExitStatus {
    /// True if the process executed correctly (return with exit status 0)
    pub fn is_success(self) -> bool {
        self == ExitStatus::ExitCode(0)
    }

    /// Exit code as a shell reports it: `128 + signal` for a signal death.
    /// `None` when the kill switch destroyed the process.
    pub fn exit_code(self) -> Option<i32> {
        match self {
            ExitStatus::ExitCode(code) => Some(code),
            ExitStatus::Signal(signal) => Some(128 + signal),
            ExitStatus::Killed => None,
        }
    }
}

/// Raw outcome of one sandbox run, before classification and truncation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxExecutionResult {
    /// Exit status of the process
    pub status: ExitStatus,

    /// Information about the resource usage of the process
    pub resource_usage: ResourceUsage,

    /// The isolation mechanism killed the process for exceeding its memory ceiling
    pub memory_exceeded: bool,

    /// Captured stdout, at most the capture limit of the configuration
    pub stdout: Vec<u8>,

    /// Captured stderr, at most the capture limit of the configuration
    pub stderr: Vec<u8>,
}

/// Classification of an execution, as reported to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Success,
    RuntimeError,
    Timeout,
    MemoryExceeded,
    OutputTruncated,
    SandboxUnavailable,
    Rejected,
}

impl ExecutionStatus {
    /// Outcomes produced by the learner's own code. They are final and are
    /// never retried.
    pub fn is_learner_outcome(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success
                | ExecutionStatus::RuntimeError
                | ExecutionStatus::Timeout
                | ExecutionStatus::MemoryExceeded
                | ExecutionStatus::OutputTruncated
        )
    }
}

/// Machine readable reason attached to `Rejected` and `SandboxUnavailable`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    InvalidIdentifier,
    EmptySource,
    SourceTooLarge,
    UnsupportedLanguage,
    InvalidHarness,
    HarnessNotSupported,
    QueueFull,
    BreakerOpen,
    ProvisioningFailed,
    Cancelled,
    ShuttingDown,
}

impl ReasonCode {
    /// Infrastructure conditions the caller may try again later.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ReasonCode::QueueFull
                | ReasonCode::BreakerOpen
                | ReasonCode::ProvisioningFailed
                | ReasonCode::ShuttingDown
        )
    }
}

/// Classified, bounded result of one execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,

    pub stdout: String,

    pub stderr: String,

    /// `None` on timeout and when no process ran
    pub exit_code: Option<i32>,

    pub duration_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ReasonCode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<SandboxId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_memory_bytes: Option<u64>,
}

impl ExecutionResult {
    /// A result for a request that never produced learner output.
    pub fn without_output(status: ExecutionStatus, reason: ReasonCode) -> Self {
        ExecutionResult {
            status,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            duration_ms: 0,
            reason: Some(reason),
            sandbox_id: None,
            peak_memory_bytes: None,
        }
    }

    pub fn rejected(reason: ReasonCode) -> Self {
        ExecutionResult::without_output(ExecutionStatus::Rejected, reason)
    }

    pub fn unavailable(reason: ReasonCode) -> Self {
        ExecutionResult::without_output(ExecutionStatus::SandboxUnavailable, reason)
    }

    /// True if the program ran and exited with status 0
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    /// Whether the caller may submit the same request again.
    pub fn is_retryable(&self) -> bool {
        self.status == ExecutionStatus::SandboxUnavailable
            || self.reason.map_or(false, ReasonCode::is_retryable)
    }
}
