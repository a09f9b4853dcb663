// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
// SPDX-License-Identifier: MPL-2.0

//! The entry point of the execution core.

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::admission::{Admission, AdmissionGate, QueueGauge};
use crate::breaker::{BreakerState, CircuitBreaker};
use crate::error::PolicyError;
use crate::ledger::{Reservation, SubmissionLedger};
use crate::orchestrator::Orchestrator;
use crate::policy::CorePolicy;
use crate::pool::{Job, WorkerPool};
use crate::request::{ExecutionResponse, SubmissionRequest};
use crate::result::{ExecutionResult, ReasonCode};
use crate::{Sandbox, SandboxImplementation};

/// Admission gate, ledger and worker pool wired together.
///
/// ```no_run
/// # async fn demo() -> Result<(), gradebox::error::PolicyError> {
/// use gradebox::{CorePolicy, ExecutionCore, SubmissionRequest};
///
/// let core = ExecutionCore::start(CorePolicy::default())?;
/// let response = core
///     .submit(SubmissionRequest::new("alice", "hello", "python", "print('hi')"))
///     .await;
/// println!("{}", serde_json::to_string(&response).unwrap());
/// # Ok(())
/// # }
/// ```
pub struct ExecutionCore {
    policy: Arc<CorePolicy>,
    gate: AdmissionGate,
    breaker: Arc<CircuitBreaker>,
    ledger: Arc<SubmissionLedger>,
    queue: QueueGauge,
    pool: WorkerPool,
}

impl ExecutionCore {
    /// Start the core with the sandbox of this platform.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn start(policy: CorePolicy) -> Result<Self, PolicyError> {
        ExecutionCore::start_with::<SandboxImplementation>(policy)
    }

    /// Start the core with a specific sandbox implementation.
    pub fn start_with<S: Sandbox>(policy: CorePolicy) -> Result<Self, PolicyError> {
        policy.validate()?;
        if !S::is_secure() {
            warn!("The sandbox of this platform is not secure, every execution will fail");
        }

        let policy = Arc::new(policy);
        let breaker = Arc::new(CircuitBreaker::new(
            policy.breaker_threshold,
            policy.breaker_cooldown(),
        ));
        let ledger = Arc::new(SubmissionLedger::new());
        let queue = QueueGauge::new(policy.max_queue_depth);
        let gate = AdmissionGate::new(policy.clone(), breaker.clone(), queue.clone());
        let orchestrator = Arc::new(Orchestrator::<S>::new(policy.clone(), breaker.clone()));
        let pool = WorkerPool::start(
            policy.pool_size,
            policy.max_queue_depth,
            orchestrator,
            ledger.clone(),
        );

        info!(
            "Execution core started: {} workers, queue depth {}, languages {:?}",
            policy.pool_size,
            policy.max_queue_depth,
            policy.languages.keys().collect::<Vec<_>>()
        );

        Ok(ExecutionCore {
            policy,
            gate,
            breaker,
            ledger,
            queue,
            pool,
        })
    }

    /// Run a submission and wait for its result.
    ///
    /// Dropping the returned future cancels the execution: the sandbox is
    /// destroyed and the attempt is recorded as cancelled.
    pub async fn submit(&self, request: SubmissionRequest) -> ExecutionResponse {
        let Admission { request, slot } = match self.gate.admit(request) {
            Ok(admission) => admission,
            Err(rejection) => return rejection.into_response(),
        };

        let reservation = self.ledger.reserve(&request);
        let (reply, result) = oneshot::channel();
        let job = Job {
            request,
            reservation,
            slot,
            reply,
        };

        if let Err(job) = self.pool.submit(job) {
            warn!(
                "Attempt {} of {}/{} arrived after shutdown",
                reservation.attempt_number, job.request.learner_id, job.request.exercise_id
            );
            let result = ExecutionResult::unavailable(ReasonCode::ShuttingDown);
            return self.conclude(reservation, result);
        }

        match result.await {
            Ok(result) => ExecutionResponse::from_result(Some(reservation), &result),
            Err(_) => {
                error!("Worker dropped attempt {}", reservation.attempt_number);
                self.conclude(
                    reservation,
                    ExecutionResult::unavailable(ReasonCode::ShuttingDown),
                )
            }
        }
    }

    /// Finalize an attempt no worker is going to finalize
    fn conclude(&self, reservation: Reservation, result: ExecutionResult) -> ExecutionResponse {
        if let Err(e) = self.ledger.finalize(reservation.submission_id, result.clone()) {
            error!("Cannot record the result of attempt {}: {}", reservation.attempt_number, e);
        }
        ExecutionResponse::from_result(Some(reservation), &result)
    }

    pub fn ledger(&self) -> &SubmissionLedger {
        &self.ledger
    }

    pub fn policy(&self) -> &CorePolicy {
        &self.policy
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Jobs waiting for a worker
    pub fn queued(&self) -> usize {
        self.queue.depth()
    }

    /// Stop accepting submissions. Queued ones are answered with
    /// `SandboxUnavailable`, running ones finish.
    pub fn shutdown(&self) {
        self.pool.close();
    }

    /// Shut down and wait for the workers to stop.
    pub async fn join(self) {
        self.pool.join().await;
    }
}
