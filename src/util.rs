// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
// SPDX-License-Identifier: MPL-2.0

use std::io;

use anyhow::{bail, Context};
use nix::sys::resource::{setrlimit, Resource};

use crate::configuration::SandboxConfiguration;
use crate::result::{ExitStatus, ResourceUsage};
use crate::Result;

/// Open files allowed inside the sandbox
const MAX_OPEN_FILES: u64 = 64;

/// Setup the resource limits. Memory is bounded by the cgroup, not here:
/// an address space limit would turn an oversized allocation into an
/// ordinary runtime error.
pub fn setup_resource_limits(config: &SandboxConfiguration) -> Result<()> {
    set_resource_limit(Resource::RLIMIT_CPU, config.cpu_time_limit)?;
    set_resource_limit(Resource::RLIMIT_FSIZE, config.file_size_limit)?;
    set_resource_limit(Resource::RLIMIT_NOFILE, MAX_OPEN_FILES)?;

    // No core dumps
    set_resource_limit(Resource::RLIMIT_CORE, 0)
}

/// Utility function to set a resource limit
fn set_resource_limit(resource: Resource, limit: u64) -> Result<()> {
    setrlimit(resource, limit, limit)
        .with_context(|| format!("Error calling setrlimit({:?}, {})", resource, limit))
}

/// Block until the child has exited, without reaping it. The PID stays
/// reserved as a zombie until `wait` is called.
pub fn wait_exit(pid: libc::pid_t) -> Result<()> {
    loop {
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let ret = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err).context("Error waiting for child termination");
        }
    }
}

/// Reap the child, returning its ExitStatus and ResourceUsage
pub fn wait(pid: libc::pid_t) -> Result<(ExitStatus, ResourceUsage)> {
    let mut status = 0;
    let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };

    loop {
        let ret = unsafe { libc::wait4(pid, &mut status, 0, &mut rusage) };
        if ret == pid {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err).context("Error waiting for child completion");
        }
    }

    let status = if libc::WIFEXITED(status) {
        ExitStatus::ExitCode(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        ExitStatus::Signal(libc::WTERMSIG(status))
    } else {
        bail!("Child terminated with unknown status {}", status);
    };

    let resource_usage = ResourceUsage {
        memory_usage: rusage.ru_maxrss.max(0) as u64 * 1024,
        user_cpu_time: rusage.ru_utime.tv_usec as f64 / 1_000_000.0 + rusage.ru_utime.tv_sec as f64,
        system_cpu_time: rusage.ru_stime.tv_usec as f64 / 1_000_000.0
            + rusage.ru_stime.tv_sec as f64,
        wall_time_usage: 0.0,
    };

    Ok((status, resource_usage))
}
