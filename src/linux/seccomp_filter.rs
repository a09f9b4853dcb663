// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
// SPDX-License-Identifier: MPL-2.0

use std::ffi::CString;

use anyhow::{anyhow, bail};
use seccomp_sys::*;

use crate::syscall_filter::{SyscallFilter, SyscallFilterAction};
use crate::Result;

fn to_seccomp_param(action: SyscallFilterAction) -> u32 {
    match action {
        SyscallFilterAction::Allow => SCMP_ACT_ALLOW,
        SyscallFilterAction::Kill => SCMP_ACT_KILL,
        SyscallFilterAction::Errno(errno) => SCMP_ACT_ERRNO(errno),
    }
}

pub struct SeccompFilter {
    ctx: *mut scmp_filter_ctx,
}

impl SeccompFilter {
    /// Create a new filter
    pub fn new(default_action: SyscallFilterAction) -> Result<SeccompFilter> {
        let ctx = unsafe { seccomp_init(to_seccomp_param(default_action)) };
        if ctx.is_null() {
            bail!("Error initializing seccomp filter");
        }
        Ok(SeccompFilter { ctx })
    }

    /// Build the filter from its configuration
    pub fn from_config(config: &SyscallFilter) -> Result<SeccompFilter> {
        let mut filter = SeccompFilter::new(config.default_action)?;
        for (syscall, action) in &config.rules {
            filter.filter(syscall, *action)?;
        }
        Ok(filter)
    }

    /// Add a rule for a syscall. Names unknown on this architecture are skipped.
    pub fn filter(&mut self, name: &str, action: SyscallFilterAction) -> Result<()> {
        let syscall_name = CString::new(name).map_err(|_| anyhow!("Invalid syscall {:?}", name))?;
        let syscall_num = unsafe { seccomp_syscall_resolve_name(syscall_name.as_ptr()) };
        if syscall_num < 0 {
            return Ok(());
        }
        let ret = unsafe { seccomp_rule_add(self.ctx, to_seccomp_param(action), syscall_num, 0) };
        if ret < 0 {
            bail!("seccomp_rule_add({}) failed: {}", name, -ret);
        }
        Ok(())
    }

    /// Load the specified filter
    pub fn load(&self) -> Result<()> {
        let ret = unsafe { seccomp_load(self.ctx) };
        if ret < 0 {
            bail!("seccomp_load() failed: {}", -ret);
        }
        Ok(())
    }
}

impl Drop for SeccompFilter {
    fn drop(&mut self) {
        unsafe {
            seccomp_release(self.ctx);
        }
    }
}
