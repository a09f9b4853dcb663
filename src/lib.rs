// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
// SPDX-License-Identifier: MPL-2.0

//! # gradebox
//!
//! The execution core of a coding course platform
//!
//! ### What does it do
//! gradebox takes programs written by learners and:
//! - runs each of them in a disposable sandbox, with no network, a read only
//!   filesystem except one scratch directory, and memory, CPU, process and
//!   wall clock ceilings
//! - classifies the outcome (success, runtime error, timeout, memory exceeded,
//!   truncated output) and bounds the captured output
//! - numbers the attempts of every learner at every exercise without gaps or
//!   duplicates, however many submissions arrive at once
//!
//! Requests go through an admission gate (validation, circuit breaker, queue
//! backpressure) and a bounded worker pool. See [`ExecutionCore`].

#[macro_use]
extern crate log;

pub mod admission;
pub mod breaker;
pub mod configuration;
pub mod error;
pub mod ledger;
pub mod limits;
pub mod normalizer;
pub mod orchestrator;
pub mod policy;
pub mod pool;
pub mod request;
pub mod result;
pub mod service;
pub mod syscall_filter;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
mod util;

#[cfg(target_os = "linux")]
pub type SandboxImplementation = linux::LinuxSandbox;

#[cfg(not(target_os = "linux"))]
mod unsupported;

#[cfg(not(target_os = "linux"))]
pub type SandboxImplementation = unsupported::UnsupportedSandbox;

#[cfg(test)]
mod tests;

pub use configuration::{SandboxConfiguration, SandboxId};
pub use policy::{CorePolicy, LanguagePolicy};
pub use request::{ExecutionRequest, ExecutionResponse, SubmissionRequest, TestHarness};
pub use result::{ExecutionResult, ExecutionStatus, ReasonCode, SandboxExecutionResult};
pub use service::ExecutionCore;

/// Convenience result type
pub type Result<T> = anyhow::Result<T>;

/// Destroys a running sandbox. Usable from any thread while another one is
/// blocked in [`Sandbox::wait`].
pub trait KillSwitch: Send + Sync + 'static {
    /// Kill every process of the sandbox. Does nothing once it has exited.
    fn kill(&self);
}

/// A single-use isolated environment running one program
pub trait Sandbox: Send + Sized + 'static {
    type Kill: KillSwitch;

    /// Provision the sandbox and start the program. An error means the
    /// program never ran.
    fn run(config: SandboxConfiguration) -> Result<Self>;

    fn id(&self) -> &SandboxId;

    fn kill_switch(&self) -> Self::Kill;

    /// Wait the process to terminate, giving back the execution result.
    /// The sandbox is torn down before this returns.
    fn wait(self) -> Result<SandboxExecutionResult>;

    /// Return true if the sandbox implementation is secure
    fn is_secure() -> bool;
}
