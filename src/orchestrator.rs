// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
// SPDX-License-Identifier: MPL-2.0

//! Runs one admitted request in one fresh sandbox.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::time::sleep;

use crate::breaker::CircuitBreaker;
use crate::configuration::{SandboxConfiguration, SandboxId};
use crate::error::ValidationError;
use crate::normalizer::normalize;
use crate::policy::CorePolicy;
use crate::request::ExecutionRequest;
use crate::result::{ExecutionResult, ExitStatus, ReasonCode, SandboxExecutionResult};
use crate::syscall_filter::SyscallFilter;
use crate::{KillSwitch, Sandbox, SandboxImplementation};

/// Where a sandbox run went wrong. These are isolation failures, never
/// outcomes of the learner's code.
enum Failure {
    Provisioning(anyhow::Error),
    Supervision(anyhow::Error),
    /// Provisioned after the orchestrator stopped waiting
    Abandoned,
}

impl Failure {
    fn into_error(self) -> anyhow::Error {
        match self {
            Failure::Provisioning(e) | Failure::Supervision(e) => e,
            Failure::Abandoned => anyhow::anyhow!("sandbox abandoned"),
        }
    }
}

pub struct Orchestrator<S: Sandbox = SandboxImplementation> {
    policy: Arc<CorePolicy>,
    breaker: Arc<CircuitBreaker>,
    _sandbox: PhantomData<fn() -> S>,
}

impl<S: Sandbox> Orchestrator<S> {
    pub fn new(policy: Arc<CorePolicy>, breaker: Arc<CircuitBreaker>) -> Self {
        Orchestrator {
            policy,
            breaker,
            _sandbox: PhantomData,
        }
    }

    /// The sandbox configuration for a request: the language's command,
    /// mounts and environment, the request's limits, and the program files.
    pub fn configure(
        &self,
        request: &ExecutionRequest,
    ) -> Result<SandboxConfiguration, ValidationError> {
        let language = self
            .policy
            .language(&request.language_id)
            .ok_or_else(|| ValidationError::UnsupportedLanguage(request.language_id.clone()))?;
        let args = language
            .command_args(request.test_harness.as_ref())
            .ok_or_else(|| ValidationError::HarnessNotSupported(request.language_id.clone()))?;

        let mut config = SandboxConfiguration::default();
        config
            .executable(&language.executable)
            .limits(&request.limits)
            .max_processes(language.max_processes)
            .file_size_limit(self.policy.scratch_file_bytes)
            .cgroup_root(&self.policy.cgroup_root)
            .file(language.source_file.as_str(), request.source_code.as_bytes());

        for arg in args {
            config.arg(arg);
        }
        for (variable, value) in &language.env {
            config.env(variable.as_str(), value.as_str());
        }
        for mount in &language.mounts {
            config.mount(mount);
        }
        if let Some(harness) = &request.test_harness {
            config.file(harness.file_name.as_str(), harness.source.as_bytes());
        }
        if language.syscall_filter {
            config.syscall_filter(SyscallFilter::learner_program());
        }
        if let Some(scratch_root) = &self.policy.scratch_root {
            config.scratch_root(scratch_root);
        }
        Ok(config.build())
    }

    /// Execute a request. Resolves to a result whatever happens: learner
    /// outcomes, isolation failures and cancellation alike. Nothing is
    /// retried.
    ///
    /// When `cancel` completes before the program does, the sandbox is
    /// destroyed and the result is `Rejected` with reason `cancelled`. A
    /// sandbox that is not ready within the policy's provisioning timeout is
    /// a provisioning failure; it is destroyed as soon as it comes up.
    pub async fn execute<C>(&self, request: &ExecutionRequest, cancel: C) -> ExecutionResult
    where
        C: Future<Output = ()>,
    {
        let config = match self.configure(request) {
            Ok(config) => config,
            Err(e) => {
                error!("Cannot configure a sandbox: {}", e);
                return ExecutionResult::rejected(e.reason());
            }
        };
        let sandbox_id = config.id.clone();

        // A request may have waited in the queue while the breaker opened
        if !self.breaker.allow_provisioning() {
            debug!("Not provisioning {}: circuit breaker open", sandbox_id);
            return ExecutionResult::unavailable(ReasonCode::BreakerOpen);
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let mut task = tokio::task::spawn_blocking(
            move || -> Result<SandboxExecutionResult, Failure> {
                let sandbox = S::run(config).map_err(Failure::Provisioning)?;
                if kill_tx.send(sandbox.kill_switch()).is_err() {
                    // Nobody waits for it anymore, dropping it destroys it
                    return Err(Failure::Abandoned);
                }
                sandbox.wait().map_err(Failure::Supervision)
            },
        );

        tokio::pin!(cancel);
        let provisioned = tokio::select! {
            provisioned = kill_rx => provisioned,
            _ = sleep(self.policy.provisioning_timeout()) => {
                error!(
                    "Sandbox {} not ready after {:?}, giving up on it",
                    sandbox_id,
                    self.policy.provisioning_timeout()
                );
                self.breaker.record_failure();
                return with_sandbox(
                    ExecutionResult::unavailable(ReasonCode::ProvisioningFailed),
                    sandbox_id,
                );
            }
            _ = &mut cancel => {
                info!("Execution in sandbox {} cancelled while provisioning", sandbox_id);
                self.breaker.abandon();
                return with_sandbox(ExecutionResult::rejected(ReasonCode::Cancelled), sandbox_id);
            }
        };

        let kill_switch = match provisioned {
            Ok(kill_switch) => kill_switch,
            Err(_) => {
                let e = match task.await {
                    Ok(Err(Failure::Provisioning(e))) => e,
                    Ok(_) => anyhow::anyhow!("sandbox exited before reporting"),
                    Err(e) => anyhow::Error::new(e),
                };
                error!("Provisioning sandbox {} failed: {:#}", sandbox_id, e);
                self.breaker.record_failure();
                return with_sandbox(
                    ExecutionResult::unavailable(ReasonCode::ProvisioningFailed),
                    sandbox_id,
                );
            }
        };
        self.breaker.record_success();
        debug!("Sandbox {} running", sandbox_id);

        let mut timer_fired = false;
        let joined = tokio::select! {
            joined = &mut task => joined,
            _ = sleep(request.limits.wall_clock()) => {
                debug!("Sandbox {} hit the wall clock limit, killing it", sandbox_id);
                kill_switch.kill();
                timer_fired = true;
                task.await
            }
            _ = &mut cancel => {
                info!("Execution in sandbox {} cancelled, killing it", sandbox_id);
                kill_switch.kill();
                let _ = task.await;
                return with_sandbox(ExecutionResult::rejected(ReasonCode::Cancelled), sandbox_id);
            }
        };

        let raw = match joined {
            Ok(Ok(raw)) => raw,
            Ok(Err(failure)) => {
                error!("Supervising sandbox {} failed: {:#}", sandbox_id, failure.into_error());
                self.breaker.record_failure();
                return with_sandbox(
                    ExecutionResult::unavailable(ReasonCode::ProvisioningFailed),
                    sandbox_id,
                );
            }
            Err(e) => {
                error!("Sandbox {} task failed: {}", sandbox_id, e);
                self.breaker.record_failure();
                return with_sandbox(
                    ExecutionResult::unavailable(ReasonCode::ProvisioningFailed),
                    sandbox_id,
                );
            }
        };

        // A program that exited on its own just before the timer is not a timeout
        let timed_out = timer_fired && raw.status == ExitStatus::Killed;
        if timer_fired && !timed_out {
            debug!("Sandbox {} finished before the kill landed", sandbox_id);
        }
        let result = normalize(raw, timed_out, &request.limits);
        info!(
            "Sandbox {} finished: {:?} in {}ms",
            sandbox_id, result.status, result.duration_ms
        );
        with_sandbox(result, sandbox_id)
    }
}

fn with_sandbox(mut result: ExecutionResult, id: SandboxId) -> ExecutionResult {
    result.sandbox_id = Some(id);
    result
}
