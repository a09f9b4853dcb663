// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
// SPDX-License-Identifier: MPL-2.0

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::limits::{ResourceLimits, MIB};
use crate::syscall_filter::SyscallFilter;

/// Where the scratch directory appears inside the sandbox. It is the only
/// writable path and the working directory of the program.
pub const SCRATCH_MOUNT: &str = "/box";

/// Identifier of one sandbox. Freshly generated for every execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxId(String);

impl SandboxId {
    pub fn generate() -> Self {
        SandboxId(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A host directory visible read only inside the sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryMount {
    /// Where to mount the directory inside the sandbox.
    pub target: PathBuf,

    /// Path of the directory to mount inside the sandbox
    pub source: PathBuf,
}

/// A file written into the scratch directory before the program starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScratchFile {
    /// Plain file name, no directories
    pub name: String,

    pub contents: Vec<u8>,
}

/// struct that represents the configuration parameters
/// of a sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfiguration {
    /// Identifier of this sandbox, used for its cgroup and in logs
    pub id: SandboxId,

    /// Absolute path of the executable, inside the sandbox
    pub executable: PathBuf,

    /// Arguments to pass to the executable
    pub args: Vec<String>,

    /// Environment to pass to the sandbox
    pub env: Vec<(String, String)>,

    /// Read only paths inside the sandbox
    pub mount_paths: Vec<DirectoryMount>,

    /// Files placed in the scratch directory
    pub files: Vec<ScratchFile>,

    /// Memory ceiling of the sandbox cgroup, in bytes
    pub memory_limit: u64,

    /// CPU share in thousandths of a core
    pub cpu_shares: u32,

    /// Maximum number of processes and threads
    pub max_processes: u32,

    /// CPU seconds after which the kernel kills the process
    pub cpu_time_limit: u64,

    /// Largest file the program may write, in bytes
    pub file_size_limit: u64,

    /// Bytes of stdout and of stderr kept; the rest is read and dropped
    pub capture_limit: usize,

    /// Allow only these system calls in the sandbox
    pub syscall_filter: Option<SyscallFilter>,

    /// Delegated cgroup v2 directory the sandbox group is created in
    pub cgroup_root: PathBuf,

    /// Parent of the scratch directory, the system temp dir if unset
    pub scratch_root: Option<PathBuf>,
}

impl Default for SandboxConfiguration {
    fn default() -> Self {
        SandboxConfiguration {
            id: SandboxId::generate(),
            executable: PathBuf::from("/bin/sh"),
            args: vec![],
            env: vec![],
            mount_paths: vec![],
            files: vec![],
            memory_limit: 256 * MIB,
            cpu_shares: 1000,
            max_processes: 16,
            cpu_time_limit: 10,
            file_size_limit: 16 * MIB,
            capture_limit: 64 * 1024,
            syscall_filter: None,
            cgroup_root: PathBuf::from("/sys/fs/cgroup/gradebox"),
            scratch_root: None,
        }
    }
}

impl SandboxConfiguration {
    /// Build the sandbox configuration
    pub fn build(&self) -> SandboxConfiguration {
        self.clone()
    }

    /// Apply the memory, CPU and output limits of a request
    pub fn limits(&mut self, limits: &ResourceLimits) -> &mut Self {
        self.memory_limit = limits.memory_bytes;
        self.cpu_shares = limits.cpu_shares;
        self.cpu_time_limit = limits.cpu_seconds_backstop();
        // One byte more than kept, so truncation can be detected
        self.capture_limit = limits.max_output_bytes.saturating_add(1);
        self
    }

    /// Set the executable file path
    pub fn executable<P: Into<PathBuf>>(&mut self, executable: P) -> &mut Self {
        self.executable = executable.into();
        self
    }

    /// Add an argument to the program
    pub fn arg<S: Into<String>>(&mut self, arg: S) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    /// Add an argument to the environment
    pub fn env<S: Into<String>, T: Into<String>>(&mut self, variable: S, value: T) -> &mut Self {
        self.env.push((variable.into(), value.into()));
        self
    }

    /// Make a host directory visible, read only, at the same path
    pub fn mount<P: Into<PathBuf>>(&mut self, path: P) -> &mut Self {
        let path = path.into();
        self.mount_paths.push(DirectoryMount {
            source: path.clone(),
            target: path,
        });
        self
    }

    /// Put a file in the scratch directory
    pub fn file<S: Into<String>, C: Into<Vec<u8>>>(&mut self, name: S, contents: C) -> &mut Self {
        self.files.push(ScratchFile {
            name: name.into(),
            contents: contents.into(),
        });
        self
    }

    /// Set the process ceiling
    pub fn max_processes(&mut self, value: u32) -> &mut Self {
        self.max_processes = value;
        self
    }

    /// Set the largest writable file size
    pub fn file_size_limit(&mut self, bytes: u64) -> &mut Self {
        self.file_size_limit = bytes;
        self
    }

    /// Install the syscall filter
    pub fn syscall_filter(&mut self, filter: SyscallFilter) -> &mut Self {
        self.syscall_filter = Some(filter);
        self
    }

    /// Set where the sandbox cgroup is created
    pub fn cgroup_root<P: Into<PathBuf>>(&mut self, path: P) -> &mut Self {
        self.cgroup_root = path.into();
        self
    }

    /// Set where the scratch directory is created
    pub fn scratch_root<P: Into<PathBuf>>(&mut self, path: P) -> &mut Self {
        self.scratch_root = Some(path.into());
        self
    }
}
