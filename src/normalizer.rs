// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
// SPDX-License-Identifier: MPL-2.0

//! Turns the raw output of a sandbox into a bounded, classified result.

use crate::limits::ResourceLimits;
use crate::result::{ExecutionResult, ExecutionStatus, SandboxExecutionResult};

/// Appended to stdout or stderr when it was cut.
pub const TRUNCATION_MARKER: &str = "\n[output truncated]\n";

/// Classify a finished run and bound its output.
///
/// `timed_out` is set by the orchestrator when its wall clock timer destroyed
/// the sandbox. Classification order: timeout, memory ceiling, non-zero exit,
/// truncated output, success.
pub fn normalize(
    raw: SandboxExecutionResult,
    timed_out: bool,
    limits: &ResourceLimits,
) -> ExecutionResult {
    let (stdout, stdout_cut) = truncate(&raw.stdout, limits.max_output_bytes);
    let (stderr, stderr_cut) = truncate(&raw.stderr, limits.max_output_bytes);

    let status = if timed_out {
        ExecutionStatus::Timeout
    } else if raw.memory_exceeded {
        ExecutionStatus::MemoryExceeded
    } else if !raw.status.is_success() {
        ExecutionStatus::RuntimeError
    } else if stdout_cut || stderr_cut {
        ExecutionStatus::OutputTruncated
    } else {
        ExecutionStatus::Success
    };

    let exit_code = if timed_out {
        None
    } else {
        raw.status.exit_code()
    };

    ExecutionResult {
        status,
        stdout,
        stderr,
        exit_code,
        duration_ms: (raw.resource_usage.wall_time_usage * 1000.0).round() as u64,
        reason: None,
        sandbox_id: None,
        peak_memory_bytes: Some(raw.resource_usage.memory_usage),
    }
}

/// Cut `bytes` at exactly `limit` bytes. The kept prefix is decoded lossily,
/// so a multi-byte character split by the cut shows as U+FFFD.
fn truncate(bytes: &[u8], limit: usize) -> (String, bool) {
    if bytes.len() <= limit {
        return (String::from_utf8_lossy(bytes).into_owned(), false);
    }
    let mut kept = String::from_utf8_lossy(&bytes[..limit]).into_owned();
    kept.push_str(TRUNCATION_MARKER);
    (kept, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::{ExitStatus, ResourceUsage};

    fn raw(status: ExitStatus, stdout: &[u8], stderr: &[u8]) -> SandboxExecutionResult {
        SandboxExecutionResult {
            status,
            resource_usage: ResourceUsage {
                wall_time_usage: 0.0421,
                memory_usage: 4096,
                ..ResourceUsage::default()
            },
            memory_exceeded: false,
            stdout: stdout.to_vec(),
            stderr: stderr.to_vec(),
        }
    }

    fn limits(max_output_bytes: usize) -> ResourceLimits {
        ResourceLimits::new(1_000, 64 << 20, 1_000, max_output_bytes)
    }

    #[test]
    fn test_success() {
        let result = normalize(raw(ExitStatus::ExitCode(0), b"hi\n", b""), false, &limits(10));
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.stdout, "hi\n");
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.duration_ms, 42);
        assert_eq!(result.peak_memory_bytes, Some(4096));
    }

    #[test]
    fn test_truncate_exactly_at_limit() {
        let out = vec![b'a'; 11];
        let result = normalize(raw(ExitStatus::ExitCode(0), &out, b"ok"), false, &limits(10));
        assert_eq!(result.status, ExecutionStatus::OutputTruncated);
        assert_eq!(result.stdout, format!("{}{}", "a".repeat(10), TRUNCATION_MARKER));
        assert_eq!(result.stderr, "ok");

        let out = vec![b'a'; 10];
        let result = normalize(raw(ExitStatus::ExitCode(0), &out, b""), false, &limits(10));
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.stdout, "a".repeat(10));
        assert!(!result.stdout.contains(TRUNCATION_MARKER));
    }

    #[test]
    fn test_streams_truncate_independently() {
        let err = vec![b'e'; 20];
        let result = normalize(raw(ExitStatus::ExitCode(0), b"fine", &err), false, &limits(10));
        assert_eq!(result.status, ExecutionStatus::OutputTruncated);
        assert_eq!(result.stdout, "fine");
        assert!(result.stderr.ends_with(TRUNCATION_MARKER));
        assert_eq!(result.stderr.len(), 10 + TRUNCATION_MARKER.len());
    }

    #[test]
    fn test_runtime_error_keeps_precedence_over_truncation() {
        let out = vec![b'a'; 50];
        let result = normalize(raw(ExitStatus::ExitCode(1), &out, b""), false, &limits(10));
        assert_eq!(result.status, ExecutionStatus::RuntimeError);
        assert_eq!(result.exit_code, Some(1));
        assert!(result.stdout.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_timeout_and_memory_precedence() {
        let mut oom = raw(ExitStatus::Signal(9), b"", b"");
        oom.memory_exceeded = true;
        let result = normalize(oom.clone(), false, &limits(10));
        assert_eq!(result.status, ExecutionStatus::MemoryExceeded);

        let result = normalize(oom, true, &limits(10));
        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert_eq!(result.exit_code, None);

        let mut clean_exit = raw(ExitStatus::ExitCode(0), b"", b"");
        clean_exit.memory_exceeded = true;
        let result = normalize(clean_exit, false, &limits(10));
        assert_eq!(result.status, ExecutionStatus::MemoryExceeded);
    }

    #[test]
    fn test_signal_is_runtime_error() {
        let result = normalize(raw(ExitStatus::Signal(11), b"", b""), false, &limits(10));
        assert_eq!(result.status, ExecutionStatus::RuntimeError);
        assert_eq!(result.exit_code, Some(139));
    }

    #[test]
    fn test_split_character() {
        let (kept, cut) = truncate("héllo".as_bytes(), 2);
        assert!(cut);
        assert_eq!(kept, format!("h\u{FFFD}{}", TRUNCATION_MARKER));
    }
}
