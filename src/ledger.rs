// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
// SPDX-License-Identifier: MPL-2.0

//! Submission ledger: attempt numbering and the in-flight record of every
//! submission until the surrounding application takes it over.
//!
//! Attempt numbers are assigned by incrementing a per-(learner, exercise)
//! counter while holding the map shard's write lock, so concurrent
//! reservations for one pair always get distinct, contiguous numbers.

use std::fmt;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::request::ExecutionRequest;
use crate::result::ExecutionResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubmissionId(Uuid);

impl SubmissionId {
    pub fn generate() -> Self {
        SubmissionId(Uuid::new_v4())
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// One attempt of a learner at an exercise
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub id: SubmissionId,
    pub learner_id: String,
    pub exercise_id: String,
    pub attempt_number: u64,
    pub source_code: String,
    pub result: Option<ExecutionResult>,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl Submission {
    pub fn is_finalized(&self) -> bool {
        self.result.is_some()
    }
}

/// Handle to a reserved, not yet finalized submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub submission_id: SubmissionId,
    pub attempt_number: u64,
}

type AttemptKey = (String, String);

#[derive(Debug, Default)]
pub struct SubmissionLedger {
    counters: DashMap<AttemptKey, u64>,
    submissions: DashMap<SubmissionId, Submission>,
}

impl SubmissionLedger {
    pub fn new() -> Self {
        SubmissionLedger::default()
    }

    /// Next attempt number for the pair. The read and the write happen under
    /// one lock of the pair's shard.
    pub fn reserve_attempt(&self, learner_id: &str, exercise_id: &str) -> u64 {
        let mut counter = self
            .counters
            .entry((learner_id.to_owned(), exercise_id.to_owned()))
            .or_insert(0);
        *counter += 1;
        *counter
    }

    /// Resume numbering from what the surrounding application already stored.
    /// The counter is only ever raised.
    pub fn seed(&self, learner_id: &str, exercise_id: &str, last_attempt: u64) {
        let mut counter = self
            .counters
            .entry((learner_id.to_owned(), exercise_id.to_owned()))
            .or_insert(0);
        *counter = (*counter).max(last_attempt);
    }

    /// Reserve an attempt number and record the pending submission.
    pub fn reserve(&self, request: &ExecutionRequest) -> Reservation {
        let attempt_number = self.reserve_attempt(&request.learner_id, &request.exercise_id);
        let submission = Submission {
            id: SubmissionId::generate(),
            learner_id: request.learner_id.clone(),
            exercise_id: request.exercise_id.clone(),
            attempt_number,
            source_code: request.source_code.clone(),
            result: None,
            created_at: Utc::now(),
            finalized_at: None,
        };
        let reservation = Reservation {
            submission_id: submission.id,
            attempt_number,
        };
        debug!(
            "Reserved attempt {} of {}/{} as {}",
            attempt_number, request.learner_id, request.exercise_id, submission.id
        );
        self.submissions.insert(submission.id, submission);
        reservation
    }

    /// Attach the result to a submission. Finalizing again with the same result
    /// does nothing; a different result is refused.
    pub fn finalize(&self, id: SubmissionId, result: ExecutionResult) -> Result<(), LedgerError> {
        let mut submission = self
            .submissions
            .get_mut(&id)
            .ok_or(LedgerError::UnknownSubmission(id))?;

        if let Some(existing) = &submission.result {
            if *existing == result {
                return Ok(());
            }
            warn!(
                "Refusing to overwrite result of {} ({:?}) with {:?}",
                id, existing.status, result.status
            );
            return Err(LedgerError::AlreadyFinalized(id));
        }

        debug!("Finalized {} as {:?}", id, result.status);
        submission.result = Some(result);
        submission.finalized_at = Some(Utc::now());
        Ok(())
    }

    pub fn submission(&self, id: SubmissionId) -> Option<Submission> {
        self.submissions.get(&id).map(|entry| entry.value().clone())
    }

    /// Submissions of a pair still held by the ledger, by attempt number.
    pub fn attempts(&self, learner_id: &str, exercise_id: &str) -> Vec<Submission> {
        let mut attempts: Vec<Submission> = self
            .submissions
            .iter()
            .filter(|entry| entry.learner_id == learner_id && entry.exercise_id == exercise_id)
            .map(|entry| entry.value().clone())
            .collect();
        attempts.sort_by_key(|submission| submission.attempt_number);
        attempts
    }

    /// Hand a finalized submission over and forget it. Pending submissions
    /// stay until they are finalized.
    pub fn release(&self, id: SubmissionId) -> Result<Submission, LedgerError> {
        match self.submissions.remove_if(&id, |_, submission| submission.is_finalized()) {
            Some((_, submission)) => Ok(submission),
            None if self.submissions.contains_key(&id) => Err(LedgerError::NotFinalized(id)),
            None => Err(LedgerError::UnknownSubmission(id)),
        }
    }

    /// Number of reserved submissions without a result.
    pub fn pending(&self) -> usize {
        self.submissions
            .iter()
            .filter(|entry| !entry.is_finalized())
            .count()
    }
}
