// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Serialize};

/// Calls that have no business in a learner program: namespace and mount
/// manipulation, tracing, kernel modules and keyrings.
const DENIED_SYSCALLS: &[&str] = &[
    "ptrace",
    "process_vm_readv",
    "process_vm_writev",
    "mount",
    "umount2",
    "pivot_root",
    "chroot",
    "unshare",
    "setns",
    "reboot",
    "kexec_load",
    "init_module",
    "finit_module",
    "delete_module",
    "bpf",
    "perf_event_open",
    "keyctl",
    "add_key",
    "request_key",
    "swapon",
    "swapoff",
    "execveat",
];

/// System call filter action
#[derive(Debug, Clone, Serialize, Deserialize, Copy, PartialEq, Eq)]
pub enum SyscallFilterAction {
    /// Allow all system calls
    Allow,

    /// Kill the process
    Kill,

    /// Return this errno
    Errno(u32),
}

/// Syscall filter configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyscallFilter {
    /// Default action to execute
    pub default_action: SyscallFilterAction,

    /// Sandbox filter rules in the form of (syscall_name, action)
    pub rules: Vec<(String, SyscallFilterAction)>,
}

impl Default for SyscallFilter {
    fn default() -> Self {
        SyscallFilter {
            default_action: SyscallFilterAction::Kill,
            rules: Vec::new(),
        }
    }
}

impl SyscallFilter {
    /// Filter for learner programs: everything is allowed except the calls
    /// that could reach outside the sandbox.
    ///
    /// Process creation is not filtered here: libc forks through `clone`,
    /// whose flags a name-based rule cannot tell apart from thread creation.
    /// The sandbox's `pids.max` bounds processes and threads together.
    pub fn learner_program() -> Self {
        let mut filter = SyscallFilter::default();
        filter.default_action(SyscallFilterAction::Allow);
        for syscall in DENIED_SYSCALLS {
            filter.add_rule(*syscall, SyscallFilterAction::Kill);
        }
        filter
    }

    /// Set the default filter action
    pub fn default_action(&mut self, action: SyscallFilterAction) -> &mut Self {
        self.default_action = action;
        self
    }

    /// Add a rule to the filter
    pub fn add_rule<S: Into<String>>(
        &mut self,
        syscall: S,
        action: SyscallFilterAction,
    ) -> &mut Self {
        self.rules.push((syscall.into(), action));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_learner_filter() {
        let filter = SyscallFilter::learner_program();
        assert_eq!(filter.default_action, SyscallFilterAction::Allow);
        for denied in ["unshare", "ptrace", "mount", "execveat"] {
            assert!(filter
                .rules
                .contains(&(denied.to_owned(), SyscallFilterAction::Kill)));
        }
        // Left to pids.max, a name rule would also stop threads
        for allowed in ["fork", "vfork", "clone", "clone3"] {
            assert!(!filter.rules.iter().any(|(name, _)| name == allowed));
        }
    }
}
