// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
// SPDX-License-Identifier: MPL-2.0

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::util::*;
use crate::breaker::BreakerState;
use crate::normalizer::TRUNCATION_MARKER;
use crate::policy::CorePolicy;
use crate::request::SubmissionRequest;
use crate::result::{ExecutionStatus, ReasonCode};
use crate::service::ExecutionCore;

fn core(policy: CorePolicy) -> ExecutionCore {
    ExecutionCore::start_with::<FakeSandbox>(policy).unwrap()
}

fn python(learner: &str, exercise: &str, source: &str) -> SubmissionRequest {
    SubmissionRequest::new(learner, exercise, "python", source)
}

#[tokio::test]
async fn test_print_hi() {
    let core = core(test_policy());
    let response = core
        .submit(python("alice", "hello", "print(\"hi\")").time_limit_ms(1000))
        .await;

    assert_eq!(response.status, ExecutionStatus::Success);
    assert_eq!(response.attempt_number, Some(1));
    assert_eq!(response.stdout(), Some("hi\n"));
    assert_eq!(response.exit_code(), Some(0));
    assert!(!response.retryable);

    let submissions = core.ledger().attempts("alice", "hello");
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].attempt_number, 1);
    assert!(submissions[0].is_finalized());
}

#[tokio::test]
async fn test_infinite_loop_times_out() {
    let core = core(test_policy());
    let start = Instant::now();
    let response = core
        .submit(python("alice", "loop", "#fake: loop").time_limit_ms(500))
        .await;
    let elapsed = start.elapsed();

    assert_eq!(response.status, ExecutionStatus::Timeout);
    assert_eq!(response.exit_code(), None);
    assert!(!response.retryable);
    assert!(elapsed >= Duration::from_millis(500), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1500), "{:?}", elapsed);
}

#[tokio::test]
async fn test_memory_exceeded() {
    let core = core(test_policy());
    let response = core
        .submit(python("alice", "alloc", "#fake: oom").memory_limit_mb(16))
        .await;
    assert_eq!(response.status, ExecutionStatus::MemoryExceeded);

    let submission = &core.ledger().attempts("alice", "alloc")[0];
    let result = submission.result.as_ref().unwrap();
    assert_eq!(result.peak_memory_bytes, Some(16 * crate::limits::MIB));
}

#[tokio::test]
async fn test_runtime_error() {
    let core = core(test_policy());
    let response = core
        .submit(python("alice", "crash", "print(\"before\")\n#fake: exit 1"))
        .await;
    assert_eq!(response.status, ExecutionStatus::RuntimeError);
    assert_eq!(response.exit_code(), Some(1));
    assert_eq!(response.stdout(), Some("before\n"));
}

#[tokio::test]
async fn test_output_truncated_at_limit() {
    let mut policy = test_policy();
    policy.languages.get_mut("python").unwrap().limits.max_output_bytes = 16;
    let core = core(policy);

    let response = core
        .submit(python("alice", "spam", "#fake: stdout-bytes 100"))
        .await;
    assert_eq!(response.status, ExecutionStatus::OutputTruncated);
    assert_eq!(
        response.stdout().unwrap(),
        format!("{}{}", "x".repeat(16), TRUNCATION_MARKER)
    );

    let response = core
        .submit(python("alice", "spam", "#fake: stdout-bytes 16"))
        .await;
    assert_eq!(response.status, ExecutionStatus::Success);
    assert_eq!(response.stdout().unwrap(), "x".repeat(16));
    assert_eq!(response.attempt_number, Some(2));
}

#[tokio::test]
async fn test_harness_runs_instead_of_source() {
    let core = core(test_policy());
    let response = core
        .submit(
            python("alice", "graded", "print(\"learner\")")
                .test_harness("test_main.py", "print(\"harness\")"),
        )
        .await;
    assert_eq!(response.status, ExecutionStatus::Success);
    assert_eq!(response.stdout(), Some("harness\n"));
}

#[tokio::test]
async fn test_sandbox_ids_never_reused() {
    let core = core(test_policy());
    for _ in 0..20 {
        let response = core.submit(python("bob", "ids", "print(\"x\")")).await;
        assert_eq!(response.status, ExecutionStatus::Success);
    }

    let ids: HashSet<_> = core
        .ledger()
        .attempts("bob", "ids")
        .into_iter()
        .map(|submission| submission.result.unwrap().sandbox_id.unwrap())
        .collect();
    assert_eq!(ids.len(), 20);
}

#[tokio::test]
async fn test_breaker_opens_after_consecutive_failures() {
    let core = core(CorePolicy {
        breaker_threshold: 3,
        breaker_cooldown_ms: 60_000,
        ..test_policy()
    });
    let failing = "#fake: tag breaker-open\n#fake: provision-fail";

    for attempt in 1..=3 {
        let response = core.submit(python("carol", "ex", failing)).await;
        assert_eq!(response.status, ExecutionStatus::SandboxUnavailable);
        assert_eq!(response.reason(), Some(ReasonCode::ProvisioningFailed));
        assert_eq!(response.attempt_number, Some(attempt));
        assert!(response.retryable);
    }
    assert_eq!(core.breaker_state(), BreakerState::Open);

    let response = core.submit(python("carol", "ex", failing)).await;
    assert_eq!(response.status, ExecutionStatus::SandboxUnavailable);
    assert_eq!(response.reason(), Some(ReasonCode::BreakerOpen));
    assert_eq!(response.attempt_number, None);
    assert_eq!(provision_attempts("breaker-open"), 3);
}

#[tokio::test]
async fn test_breaker_closes_after_successful_probe() {
    let core = core(CorePolicy {
        breaker_threshold: 1,
        breaker_cooldown_ms: 100,
        ..test_policy()
    });

    let response = core
        .submit(python("dave", "ex", "#fake: provision-fail"))
        .await;
    assert_eq!(response.reason(), Some(ReasonCode::ProvisioningFailed));
    assert_eq!(core.breaker_state(), BreakerState::Open);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(core.breaker_state(), BreakerState::HalfOpen);

    let response = core.submit(python("dave", "ex", "print(\"ok\")")).await;
    assert_eq!(response.status, ExecutionStatus::Success);
    assert_eq!(core.breaker_state(), BreakerState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_get_distinct_attempts() {
    let core = core(test_policy());
    let (a, b) = tokio::join!(
        core.submit(python("erin", "race", "#fake: sleep 50")),
        core.submit(python("erin", "race", "#fake: sleep 50")),
    );

    let mut attempts = vec![a.attempt_number.unwrap(), b.attempt_number.unwrap()];
    attempts.sort_unstable();
    assert_eq!(attempts, vec![1, 2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_attempt_is_finalized() {
    let core = Arc::new(core(test_policy()));
    let sources = [
        "print(\"ok\")",
        "#fake: exit 3",
        "#fake: provision-fail",
        "#fake: oom",
        "#fake: sleep 20",
    ];

    let handles: Vec<_> = (0..40)
        .map(|i| {
            let core = core.clone();
            let source = sources[i % sources.len()];
            tokio::spawn(async move { core.submit(python("frank", "mix", source)).await })
        })
        .collect();
    let mut attempts = Vec::new();
    for handle in handles {
        if let Some(attempt) = handle.await.unwrap().attempt_number {
            attempts.push(attempt);
        }
    }

    attempts.sort_unstable();
    let expected: Vec<u64> = (1..=attempts.len() as u64).collect();
    assert_eq!(attempts, expected);
    assert_eq!(core.ledger().pending(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queue_full_is_backpressure() {
    let core = Arc::new(core(CorePolicy {
        pool_size: 1,
        max_queue_depth: 1,
        ..test_policy()
    }));

    let running = {
        let core = core.clone();
        tokio::spawn(async move {
            core.submit(python("gina", "busy", "#fake: loop").time_limit_ms(1000))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let queued = {
        let core = core.clone();
        tokio::spawn(async move {
            core.submit(python("gina", "busy", "#fake: loop").time_limit_ms(1000))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(core.queued(), 1);

    let response = core.submit(python("gina", "busy", "print(\"hi\")")).await;
    assert_eq!(response.status, ExecutionStatus::Rejected);
    assert_eq!(response.reason(), Some(ReasonCode::QueueFull));
    assert_eq!(response.attempt_number, None);
    assert!(response.retryable);

    assert_eq!(running.await.unwrap().status, ExecutionStatus::Timeout);
    assert_eq!(queued.await.unwrap().status, ExecutionStatus::Timeout);
    assert_eq!(core.queued(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dropped_submission_is_cancelled() {
    let core = Arc::new(core(test_policy()));

    let handle = {
        let core = core.clone();
        tokio::spawn(async move {
            core.submit(python("hank", "gone", "#fake: loop").time_limit_ms(2000))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.abort();

    let start = Instant::now();
    loop {
        let attempts = core.ledger().attempts("hank", "gone");
        if let Some(result) = attempts.first().and_then(|s| s.result.clone()) {
            assert_eq!(result.status, ExecutionStatus::Rejected);
            assert_eq!(result.reason, Some(ReasonCode::Cancelled));
            break;
        }
        assert!(start.elapsed() < Duration::from_millis(1500), "not cancelled");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_rejected_before_reservation() {
    let core = core(test_policy());
    let response = core.submit(python("ivy", "ex", "")).await;

    assert_eq!(response.status, ExecutionStatus::Rejected);
    assert_eq!(response.reason(), Some(ReasonCode::EmptySource));
    assert_eq!(response.attempt_number, None);
    assert!(!response.retryable);
    assert!(core.ledger().attempts("ivy", "ex").is_empty());

    // The rejected request did not consume an attempt number
    let response = core.submit(python("ivy", "ex", "print(\"ok\")")).await;
    assert_eq!(response.attempt_number, Some(1));
}

#[tokio::test]
async fn test_submit_after_shutdown() {
    let core = core(test_policy());
    core.shutdown();

    let response = core.submit(python("jack", "late", "print(\"hi\")")).await;
    assert_eq!(response.status, ExecutionStatus::SandboxUnavailable);
    assert_eq!(response.reason(), Some(ReasonCode::ShuttingDown));
    assert_eq!(response.attempt_number, Some(1));
    assert!(response.retryable);
    assert_eq!(core.ledger().pending(), 0);

    core.join().await;
}

#[tokio::test]
async fn test_unsupported_language() {
    let core = core(test_policy());
    let response = core
        .submit(SubmissionRequest::new("kim", "ex", "cobol", "DISPLAY 'HI'."))
        .await;
    assert_eq!(response.status, ExecutionStatus::Rejected);
    assert_eq!(response.reason(), Some(ReasonCode::UnsupportedLanguage));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queued_jobs_finalized_on_shutdown() {
    let core = Arc::new(core(CorePolicy {
        pool_size: 1,
        ..test_policy()
    }));

    let running = {
        let core = core.clone();
        tokio::spawn(async move {
            core.submit(python("lena", "stop", "#fake: loop").time_limit_ms(500))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let queued = {
        let core = core.clone();
        tokio::spawn(async move { core.submit(python("lena", "stop", "print(\"late\")")).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(core.queued(), 1);

    core.shutdown();

    let response = queued.await.unwrap();
    assert_eq!(response.status, ExecutionStatus::SandboxUnavailable);
    assert_eq!(response.reason(), Some(ReasonCode::ShuttingDown));
    assert_eq!(response.attempt_number, Some(2));
    assert!(response.retryable);

    // The running job is not interrupted
    assert_eq!(running.await.unwrap().status, ExecutionStatus::Timeout);
    assert_eq!(core.ledger().pending(), 0);
}

#[tokio::test]
async fn test_release_after_submit_empties_ledger() {
    let core = core(test_policy());
    let response = core.submit(python("mia", "done", "print(\"hi\")")).await;
    let id = response.submission_id.unwrap();

    let submission = core.ledger().release(id).unwrap();
    assert_eq!(submission.attempt_number, 1);
    assert_eq!(submission.result.unwrap().stdout, "hi\n");
    assert!(core.ledger().attempts("mia", "done").is_empty());
    assert!(core.ledger().submission(id).is_none());

    let rejected = core.submit(python("mia", "done", "")).await;
    assert_eq!(rejected.submission_id, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dropped_while_provisioning_is_cancelled() {
    let core = Arc::new(core(test_policy()));

    let handle = {
        let core = core.clone();
        tokio::spawn(async move {
            core.submit(python("nora", "slow", "#fake: provision-sleep 1500"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.abort();

    let start = Instant::now();
    loop {
        let attempts = core.ledger().attempts("nora", "slow");
        if let Some(result) = attempts.first().and_then(|s| s.result.clone()) {
            assert_eq!(result.reason, Some(ReasonCode::Cancelled));
            break;
        }
        assert!(start.elapsed() < Duration::from_millis(1000), "not cancelled");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(core.breaker_state(), BreakerState::Closed);
}
