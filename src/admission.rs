// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
// SPDX-License-Identifier: MPL-2.0

//! Admission gate: the checks a request passes before it costs anything.
//!
//! Validation, the circuit breaker and queue backpressure all happen here.
//! The gate never touches a sandbox.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::breaker::CircuitBreaker;
use crate::error::ValidationError;
use crate::policy::{is_safe_file_name, CorePolicy};
use crate::request::{ExecutionRequest, ExecutionResponse, SubmissionRequest};
use crate::result::{ExecutionStatus, ReasonCode};

/// Longest learner or exercise identifier, in bytes
pub const MAX_IDENTIFIER_BYTES: usize = 128;

/// Why a request was turned away at the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    pub status: ExecutionStatus,
    pub reason: ReasonCode,
}

impl Rejection {
    pub fn rejected(reason: ReasonCode) -> Self {
        Rejection {
            status: ExecutionStatus::Rejected,
            reason,
        }
    }

    pub fn unavailable(reason: ReasonCode) -> Self {
        Rejection {
            status: ExecutionStatus::SandboxUnavailable,
            reason,
        }
    }

    pub fn into_response(self) -> ExecutionResponse {
        ExecutionResponse::turned_away(self.status, self.reason)
    }
}

impl From<ValidationError> for Rejection {
    fn from(err: ValidationError) -> Self {
        Rejection::rejected(err.reason())
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({:?})", self.status, self.reason)
    }
}

/// A place in the worker queue. Freed when dropped, that is when a worker
/// picks the job up or the job is abandoned.
#[derive(Debug)]
pub struct QueueSlot {
    depth: Arc<AtomicUsize>,
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Counts the jobs waiting for a worker
#[derive(Debug, Clone)]
pub struct QueueGauge {
    depth: Arc<AtomicUsize>,
    capacity: usize,
}

impl QueueGauge {
    pub fn new(capacity: usize) -> Self {
        QueueGauge {
            depth: Arc::new(AtomicUsize::new(0)),
            capacity,
        }
    }

    /// Take a slot unless `capacity` jobs are already waiting
    pub fn try_reserve(&self) -> Option<QueueSlot> {
        self.depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| {
                (depth < self.capacity).then(|| depth + 1)
            })
            .ok()
            .map(|_| QueueSlot {
                depth: self.depth.clone(),
            })
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A request allowed in, holding its queue slot
#[derive(Debug)]
pub struct Admission {
    pub request: ExecutionRequest,
    pub slot: QueueSlot,
}

pub struct AdmissionGate {
    policy: Arc<CorePolicy>,
    breaker: Arc<CircuitBreaker>,
    queue: QueueGauge,
}

impl AdmissionGate {
    pub fn new(policy: Arc<CorePolicy>, breaker: Arc<CircuitBreaker>, queue: QueueGauge) -> Self {
        AdmissionGate {
            policy,
            breaker,
            queue,
        }
    }

    /// Validate a request, check the breaker and take a queue slot.
    pub fn admit(&self, request: SubmissionRequest) -> Result<Admission, Rejection> {
        let request = self.validate(request).map_err(|e| {
            debug!("Rejected request: {}", e);
            Rejection::from(e)
        })?;

        if self.breaker.is_open() {
            debug!(
                "Turned away {}/{}: circuit breaker open",
                request.learner_id, request.exercise_id
            );
            return Err(Rejection::unavailable(ReasonCode::BreakerOpen));
        }

        let slot = self.queue.try_reserve().ok_or_else(|| {
            warn!(
                "Queue full ({} waiting), rejecting {}/{}",
                self.queue.capacity(),
                request.learner_id,
                request.exercise_id
            );
            Rejection::rejected(ReasonCode::QueueFull)
        })?;

        Ok(Admission { request, slot })
    }

    /// Check a request against the policy and resolve its limits.
    pub fn validate(&self, request: SubmissionRequest) -> Result<ExecutionRequest, ValidationError> {
        check_identifier("learner_id", &request.learner_id)?;
        check_identifier("exercise_id", &request.exercise_id)?;

        if request.source_code.is_empty() {
            return Err(ValidationError::EmptySource);
        }
        if request.source_code.len() > self.policy.max_source_bytes {
            return Err(ValidationError::SourceTooLarge {
                size: request.source_code.len(),
                limit: self.policy.max_source_bytes,
            });
        }

        let language = self
            .policy
            .language(&request.language_id)
            .ok_or_else(|| ValidationError::UnsupportedLanguage(request.language_id.clone()))?;

        if let Some(harness) = &request.test_harness {
            if !language.accepts_harness() {
                return Err(ValidationError::HarnessNotSupported(
                    request.language_id.clone(),
                ));
            }
            if !is_safe_file_name(&harness.file_name) {
                return Err(ValidationError::InvalidHarness("bad file name"));
            }
            if harness.file_name == language.source_file {
                return Err(ValidationError::InvalidHarness(
                    "file name clashes with the source file",
                ));
            }
            if harness.source.is_empty() {
                return Err(ValidationError::InvalidHarness("empty source"));
            }
            if harness.source.len() > self.policy.max_harness_bytes {
                return Err(ValidationError::InvalidHarness("source too large"));
            }
        }

        let limits = language
            .limits
            .clamp(request.time_limit_ms, request.memory_limit_mb);

        Ok(ExecutionRequest {
            learner_id: request.learner_id,
            exercise_id: request.exercise_id,
            source_code: request.source_code,
            language_id: request.language_id,
            test_harness: request.test_harness,
            limits,
        })
    }
}

fn check_identifier(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty()
        || value.len() > MAX_IDENTIFIER_BYTES
        || value.chars().any(char::is_control)
    {
        return Err(ValidationError::InvalidIdentifier { field });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn gate(capacity: usize) -> (AdmissionGate, Arc<CircuitBreaker>) {
        let breaker = Arc::new(CircuitBreaker::new(1, Duration::from_secs(60)));
        let gate = AdmissionGate::new(
            Arc::new(CorePolicy::default()),
            breaker.clone(),
            QueueGauge::new(capacity),
        );
        (gate, breaker)
    }

    fn request() -> SubmissionRequest {
        SubmissionRequest::new("alice", "ex1", "python", "print('hi')")
    }

    fn rejection(gate: &AdmissionGate, request: SubmissionRequest) -> Rejection {
        gate.admit(request).err().unwrap()
    }

    #[test]
    fn test_validation_reasons() {
        let (gate, _) = gate(4);

        let mut bad = request();
        bad.learner_id = String::new();
        assert_eq!(rejection(&gate, bad).reason, ReasonCode::InvalidIdentifier);

        let mut bad = request();
        bad.exercise_id = "ex\n1".into();
        assert_eq!(rejection(&gate, bad).reason, ReasonCode::InvalidIdentifier);

        let mut bad = request();
        bad.source_code = String::new();
        assert_eq!(rejection(&gate, bad).reason, ReasonCode::EmptySource);

        let mut bad = request();
        bad.source_code = "#".repeat(64 * 1024 + 1);
        assert_eq!(rejection(&gate, bad).reason, ReasonCode::SourceTooLarge);

        let mut bad = request();
        bad.language_id = "cobol".into();
        assert_eq!(rejection(&gate, bad).reason, ReasonCode::UnsupportedLanguage);

        let bad = request().test_harness("main.py", "import main");
        assert_eq!(rejection(&gate, bad).reason, ReasonCode::InvalidHarness);

        let bad = request().test_harness("../x.py", "import main");
        assert_eq!(rejection(&gate, bad).reason, ReasonCode::InvalidHarness);

        let bad = rejection(&gate, request().test_harness("check.py", ""));
        assert_eq!(bad.status, ExecutionStatus::Rejected);
        assert_eq!(bad.reason, ReasonCode::InvalidHarness);

        assert_eq!(gate.queue.depth(), 0);
    }

    #[test]
    fn test_limits_clamped() {
        let (gate, _) = gate(4);
        let admission = gate
            .admit(request().time_limit_ms(1_000_000).memory_limit_mb(0))
            .unwrap();
        let max = CorePolicy::default().languages["python"].limits;
        assert_eq!(admission.request.limits.wall_clock_ms, max.wall_clock_ms);
        assert_eq!(admission.request.limits.memory_bytes, crate::limits::MIB);
    }

    #[test]
    fn test_queue_backpressure() {
        let (gate, _) = gate(2);
        let first = gate.admit(request()).unwrap();
        let _second = gate.admit(request()).unwrap();

        let full = rejection(&gate, request());
        assert_eq!(full.status, ExecutionStatus::Rejected);
        assert_eq!(full.reason, ReasonCode::QueueFull);
        assert!(full.into_response().retryable);

        drop(first);
        assert_eq!(gate.queue.depth(), 1);
        assert!(gate.admit(request()).is_ok());
    }

    #[test]
    fn test_open_breaker_fails_closed() {
        let (gate, breaker) = gate(2);
        breaker.record_failure();

        let turned_away = rejection(&gate, request());
        assert_eq!(turned_away.status, ExecutionStatus::SandboxUnavailable);
        assert_eq!(turned_away.reason, ReasonCode::BreakerOpen);
        assert_eq!(gate.queue.depth(), 0);
    }
}
