// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
// SPDX-License-Identifier: MPL-2.0

//! Bounded pool of workers, each running at most one sandbox at a time.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::admission::QueueSlot;
use crate::ledger::{Reservation, SubmissionLedger};
use crate::orchestrator::Orchestrator;
use crate::request::ExecutionRequest;
use crate::result::{ExecutionResult, ReasonCode};
use crate::Sandbox;

/// An admitted request with its reserved attempt, waiting for a worker
#[derive(Debug)]
pub struct Job {
    pub request: ExecutionRequest,
    pub reservation: Reservation,
    pub slot: QueueSlot,
    pub reply: oneshot::Sender<ExecutionResult>,
}

pub struct WorkerPool {
    tx: async_channel::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn start<S: Sandbox>(
        size: usize,
        queue_depth: usize,
        orchestrator: Arc<Orchestrator<S>>,
        ledger: Arc<SubmissionLedger>,
    ) -> Self {
        let (tx, rx) = async_channel::bounded(queue_depth.max(1));
        let workers = (0..size)
            .map(|id| {
                tokio::spawn(worker(
                    id,
                    rx.clone(),
                    orchestrator.clone(),
                    ledger.clone(),
                ))
            })
            .collect();
        debug!("Started {} workers, queue depth {}", size, queue_depth);
        WorkerPool { tx, workers }
    }

    /// Queue a job. The job comes back when the pool is closed.
    pub fn submit(&self, job: Job) -> Result<(), Job> {
        self.tx.try_send(job).map_err(|e| e.into_inner())
    }

    /// Stop accepting jobs. Jobs still queued are finalized as unavailable,
    /// running ones finish normally.
    pub fn close(&self) {
        if self.tx.close() {
            info!("Worker pool closed, {} jobs left in the queue", self.tx.len());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Close the pool and wait for every worker to stop.
    pub async fn join(self) {
        self.close();
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!("Worker failed: {}", e);
            }
        }
    }
}

async fn worker<S: Sandbox>(
    id: usize,
    rx: async_channel::Receiver<Job>,
    orchestrator: Arc<Orchestrator<S>>,
    ledger: Arc<SubmissionLedger>,
) {
    while let Ok(job) = rx.recv().await {
        let Job {
            request,
            reservation,
            slot,
            mut reply,
        } = job;
        drop(slot);

        let result = if rx.is_closed() {
            ExecutionResult::unavailable(ReasonCode::ShuttingDown)
        } else if reply.is_closed() {
            debug!(
                "Attempt {} of {}/{} abandoned while queued",
                reservation.attempt_number, request.learner_id, request.exercise_id
            );
            ExecutionResult::rejected(ReasonCode::Cancelled)
        } else {
            trace!(
                "Worker {} running attempt {} of {}/{}",
                id,
                reservation.attempt_number,
                request.learner_id,
                request.exercise_id
            );
            orchestrator.execute(&request, reply.closed()).await
        };

        if let Err(e) = ledger.finalize(reservation.submission_id, result.clone()) {
            error!("Cannot record the result of attempt {}: {}", reservation.attempt_number, e);
        }
        let _ = reply.send(result);
    }
    debug!("Worker {} stopped", id);
}
