// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
// SPDX-License-Identifier: MPL-2.0

//! Stand-in for platforms without the kernel features the sandbox needs.
//! Every run fails to provision, so nothing ever executes unisolated.

use anyhow::bail;

use crate::configuration::{SandboxConfiguration, SandboxId};
use crate::result::SandboxExecutionResult;
use crate::{KillSwitch, Result, Sandbox};

pub struct UnsupportedSandbox {
    id: SandboxId,
}

#[derive(Clone, Copy)]
pub struct NoopKillSwitch;

impl KillSwitch for NoopKillSwitch {
    fn kill(&self) {}
}

impl Sandbox for UnsupportedSandbox {
    type Kill = NoopKillSwitch;

    fn run(config: SandboxConfiguration) -> Result<Self> {
        warn!("Refusing to run sandbox {}: unsupported platform", config.id);
        bail!("Sandboxing is not supported on this platform")
    }

    fn id(&self) -> &SandboxId {
        &self.id
    }

    fn kill_switch(&self) -> NoopKillSwitch {
        NoopKillSwitch
    }

    fn wait(self) -> Result<SandboxExecutionResult> {
        bail!("Sandbox {} never started", self.id)
    }

    fn is_secure() -> bool {
        false
    }
}
