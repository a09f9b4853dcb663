// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
// SPDX-License-Identifier: MPL-2.0

//! cgroup v2 group of a single sandbox

use std::fmt;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::Context;

use crate::configuration::SandboxConfiguration;
use crate::limits::cpu_max_line;
use crate::Result;

/// Controllers the sandbox groups need from their parent
const CONTROLLERS: &str = "+memory +cpu +pids";

/// Attempts at removing the group while the kernel finishes tearing it down
const REMOVE_ATTEMPTS: u32 = 20;

fn write_cgroup(dir: &Path, file: &str, content: impl fmt::Display) -> io::Result<()> {
    let mut file = fs::OpenOptions::new().write(true).open(dir.join(file))?;
    write!(file, "{}", content)
}

fn read_cgroup(dir: &Path, file: &str) -> io::Result<String> {
    fs::read_to_string(dir.join(file))
}

/// Value of a key in a flat keyed file such as `memory.events`
fn keyed_value(content: &str, key: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(k), Some(v)) if k == key => v.parse().ok(),
            _ => None,
        }
    })
}

pub struct Cgroup {
    path: PathBuf,
}

impl Cgroup {
    /// Create the group of a sandbox under the delegated root and apply the
    /// limits of the configuration to it.
    pub fn create(config: &SandboxConfiguration) -> Result<Self> {
        let root = &config.cgroup_root;
        fs::create_dir_all(root)
            .with_context(|| format!("Failed to create cgroup root {}", root.display()))?;

        // Controllers may already be enabled by whoever delegated the subtree
        if let Err(e) = write_cgroup(root, "cgroup.subtree_control", CONTROLLERS) {
            debug!(
                "Cannot enable controllers in {}: {}",
                root.display(),
                e
            );
        }

        let path = root.join(config.id.as_str());
        fs::create_dir(&path)
            .with_context(|| format!("Failed to create cgroup {}", path.display()))?;
        let cgroup = Cgroup { path };

        cgroup
            .write("memory.max", config.memory_limit)
            .context("Failed to set memory limit")?;
        cgroup
            .write("memory.swap.max", 0)
            .context("Failed to disable swap")?;
        cgroup
            .write("memory.oom.group", 1)
            .context("Failed to set the OOM group policy")?;
        cgroup
            .write("cpu.max", cpu_max_line(config.cpu_shares))
            .context("Failed to set CPU quota")?;
        cgroup
            .write("pids.max", config.max_processes)
            .context("Failed to set process limit")?;

        trace!("Created cgroup {}", cgroup.path.display());
        Ok(cgroup)
    }

    fn write(&self, file: &str, content: impl fmt::Display) -> io::Result<()> {
        write_cgroup(&self.path, file, content)
    }

    /// Move a process into the group
    pub fn add_pid(&self, pid: libc::pid_t) -> Result<()> {
        self.write("cgroup.procs", pid)
            .with_context(|| format!("Failed to add {} to {}", pid, self.path.display()))
    }

    /// Number of processes the kernel killed because the group ran out of memory
    pub fn oom_kills(&self) -> u64 {
        read_cgroup(&self.path, "memory.events")
            .ok()
            .and_then(|events| keyed_value(&events, "oom_kill"))
            .unwrap_or(0)
    }

    /// Highest memory usage of the group, on kernels that track it
    pub fn peak_memory(&self) -> Option<u64> {
        read_cgroup(&self.path, "memory.peak")
            .ok()
            .and_then(|peak| peak.trim().parse().ok())
    }

    /// Kill every process of the group
    pub fn kill(&self) {
        if let Err(e) = self.write("cgroup.kill", 1) {
            warn!("Cannot kill cgroup {}: {}", self.path.display(), e);
        }
    }
}

impl Drop for Cgroup {
    fn drop(&mut self) {
        self.kill();
        for _ in 0..REMOVE_ATTEMPTS {
            match fs::remove_dir(&self.path) {
                Ok(()) => return,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return,
                // Busy until the last process of the group is gone
                Err(_) => thread::sleep(Duration::from_millis(10)),
            }
        }
        error!("Failed to remove cgroup {}", self.path.display());
    }
}
