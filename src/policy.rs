// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
// SPDX-License-Identifier: MPL-2.0

//! Static configuration of the execution core: pool sizing, admission
//! ceilings, the circuit breaker, and per-language runtimes and limits.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;
use crate::limits::{ResourceLimits, MIB};
use crate::request::TestHarness;

/// Placeholder replaced by the learner source file name in command lines
pub const SOURCE_PLACEHOLDER: &str = "{source}";

/// Placeholder replaced by the harness file name in command lines
pub const HARNESS_PLACEHOLDER: &str = "{harness}";

/// How to run programs of one language, and how much they may use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguagePolicy {
    /// Absolute path of the interpreter or runner, as seen inside the sandbox
    pub executable: PathBuf,

    /// Arguments when no harness is given
    pub args: Vec<String>,

    /// Arguments when a harness is given. A language without them rejects harnesses.
    #[serde(default)]
    pub harness_args: Option<Vec<String>>,

    /// File name the learner source is written to in the scratch directory
    pub source_file: String,

    /// Host directories bind-mounted read only at the same path
    #[serde(default)]
    pub mounts: Vec<PathBuf>,

    /// The only environment the program sees
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Ceiling on processes and threads inside the sandbox
    #[serde(default = "default_max_processes")]
    pub max_processes: u32,

    /// Install the learner syscall filter (needs the `seccomp` feature)
    #[serde(default)]
    pub syscall_filter: bool,

    /// Maximum limits, also used when a request does not ask for less
    #[serde(default)]
    pub limits: ResourceLimits,
}

fn default_max_processes() -> u32 {
    16
}

impl LanguagePolicy {
    /// Python 3 from the host's `/usr`.
    pub fn python3() -> Self {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_owned(), "/usr/local/bin:/usr/bin:/bin".to_owned());
        env.insert("HOME".to_owned(), crate::configuration::SCRATCH_MOUNT.to_owned());
        env.insert("TMPDIR".to_owned(), crate::configuration::SCRATCH_MOUNT.to_owned());
        env.insert("LANG".to_owned(), "C.UTF-8".to_owned());

        let mounts = ["/usr", "/lib", "/lib64", "/bin"]
            .iter()
            .map(PathBuf::from)
            .filter(|path| path.exists())
            .collect();

        LanguagePolicy {
            executable: PathBuf::from("/usr/bin/python3"),
            args: vec!["-B".into(), "-u".into(), SOURCE_PLACEHOLDER.into()],
            harness_args: Some(vec!["-B".into(), "-u".into(), HARNESS_PLACEHOLDER.into()]),
            source_file: "main.py".to_owned(),
            mounts,
            env,
            max_processes: default_max_processes(),
            syscall_filter: false,
            limits: ResourceLimits::default(),
        }
    }

    pub fn accepts_harness(&self) -> bool {
        self.harness_args.is_some()
    }

    /// Command line arguments for one run, placeholders substituted.
    /// `None` if a harness is given but the language takes none.
    pub fn command_args(&self, harness: Option<&TestHarness>) -> Option<Vec<String>> {
        let template = match harness {
            Some(_) => self.harness_args.as_ref()?,
            None => &self.args,
        };
        let harness_file = harness.map(|h| h.file_name.as_str()).unwrap_or_default();
        Some(
            template
                .iter()
                .map(|arg| {
                    arg.replace(SOURCE_PLACEHOLDER, &self.source_file)
                        .replace(HARNESS_PLACEHOLDER, harness_file)
                })
                .collect(),
        )
    }

    fn check(&self, id: &str) -> Result<(), PolicyError> {
        let invalid = |what: String| PolicyError::Invalid(format!("language `{}`: {}", id, what));

        if !self.executable.is_absolute() {
            return Err(invalid("executable must be an absolute path".into()));
        }
        if !is_safe_file_name(&self.source_file) {
            return Err(invalid(format!("bad source file name `{}`", self.source_file)));
        }
        if !self.args.iter().any(|arg| arg.contains(SOURCE_PLACEHOLDER)) {
            return Err(invalid(format!("args must mention {}", SOURCE_PLACEHOLDER)));
        }
        if let Some(harness_args) = &self.harness_args {
            if !harness_args.iter().any(|arg| arg.contains(HARNESS_PLACEHOLDER)) {
                return Err(invalid(format!(
                    "harness_args must mention {}",
                    HARNESS_PLACEHOLDER
                )));
            }
        }
        for mount in &self.mounts {
            if !mount.is_absolute() || mount == Path::new("/") {
                return Err(invalid(format!("bad mount `{}`", mount.display())));
            }
        }
        if self.max_processes == 0 {
            return Err(invalid("max_processes must be positive".into()));
        }
        let bad_limits = self.limits.invalid_fields();
        if !bad_limits.is_empty() {
            return Err(invalid(format!("invalid limits: {}", bad_limits.join(", "))));
        }
        Ok(())
    }
}

/// Names that can be written in the scratch directory: ASCII alphanumerics,
/// `.`, `_` and `-`, at most 64 bytes, not starting with a dot.
pub fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && !name.starts_with('.')
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

/// Configuration of the whole execution core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorePolicy {
    /// Number of workers, each owning at most one sandbox
    pub pool_size: usize,

    /// Requests allowed to wait for a worker before backpressure kicks in
    pub max_queue_depth: usize,

    /// Consecutive isolation failures that open the circuit breaker
    pub breaker_threshold: u32,

    /// How long the breaker stays open, in milliseconds
    pub breaker_cooldown_ms: u64,

    /// Longest a sandbox may take to start, in milliseconds. Counts as a
    /// provisioning failure when exceeded.
    pub provisioning_timeout_ms: u64,

    /// Largest accepted source code, in bytes
    pub max_source_bytes: usize,

    /// Largest accepted harness, in bytes
    pub max_harness_bytes: usize,

    /// Delegated cgroup v2 directory under which sandbox groups are created
    pub cgroup_root: PathBuf,

    /// Where scratch directories are created, the system temp dir if unset
    pub scratch_root: Option<PathBuf>,

    /// Largest file a program may write in its scratch directory, in bytes
    pub scratch_file_bytes: u64,

    /// Supported languages by id
    pub languages: BTreeMap<String, LanguagePolicy>,
}

impl Default for CorePolicy {
    fn default() -> Self {
        let mut languages = BTreeMap::new();
        languages.insert("python".to_owned(), LanguagePolicy::python3());

        CorePolicy {
            pool_size: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            max_queue_depth: 64,
            breaker_threshold: 5,
            breaker_cooldown_ms: 30_000,
            provisioning_timeout_ms: 10_000,
            max_source_bytes: 64 * 1024,
            max_harness_bytes: 256 * 1024,
            cgroup_root: PathBuf::from("/sys/fs/cgroup/gradebox"),
            scratch_root: None,
            scratch_file_bytes: 16 * MIB,
            languages,
        }
    }
}

impl CorePolicy {
    /// Load a JSON policy and check it.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, PolicyError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| PolicyError::Read {
            path: path.to_owned(),
            source,
        })?;
        let policy: CorePolicy = serde_json::from_str(&content)?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.pool_size == 0 {
            return Err(PolicyError::Invalid("pool_size must be positive".into()));
        }
        if self.max_queue_depth == 0 {
            return Err(PolicyError::Invalid("max_queue_depth must be positive".into()));
        }
        if self.breaker_threshold == 0 {
            return Err(PolicyError::Invalid("breaker_threshold must be positive".into()));
        }
        if self.provisioning_timeout_ms == 0 {
            return Err(PolicyError::Invalid("provisioning_timeout_ms must be positive".into()));
        }
        if self.max_source_bytes == 0 || self.max_harness_bytes == 0 {
            return Err(PolicyError::Invalid("source ceilings must be positive".into()));
        }
        if !self.cgroup_root.is_absolute() {
            return Err(PolicyError::Invalid("cgroup_root must be absolute".into()));
        }
        if self.languages.is_empty() {
            return Err(PolicyError::Invalid("no language configured".into()));
        }
        for (id, language) in &self.languages {
            language.check(id)?;
        }
        Ok(())
    }

    pub fn language(&self, id: &str) -> Option<&LanguagePolicy> {
        self.languages.get(id)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.breaker_cooldown_ms)
    }

    pub fn provisioning_timeout(&self) -> Duration {
        Duration::from_millis(self.provisioning_timeout_ms)
    }
}
