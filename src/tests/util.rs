// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
// SPDX-License-Identifier: MPL-2.0

//! An in-process sandbox driven by directives in the program text.
//!
//! Lines understood in the file named by the last argument:
//! - `print("text")`: writes `text\n` to stdout
//! - `#fake: tag <name>`: count provisioning attempts under `name`
//! - `#fake: provision-fail`: `run` fails
//! - `#fake: provision-sleep <ms>`: `run` takes `ms` milliseconds
//! - `#fake: kill-misses`: the kill switch has no effect, as if the program
//!   had already exited
//! - `#fake: wait-fail`: `wait` fails
//! - `#fake: sleep <ms>`: run for `ms` milliseconds unless killed
//! - `#fake: loop`: run until killed
//! - `#fake: oom`: killed by the memory ceiling
//! - `#fake: exit <code>`: exit with `code`
//! - `#fake: stdout-bytes <n>` / `#fake: stderr-bytes <n>`: write `n` bytes

use std::collections::BTreeMap;
use std::str::SplitWhitespace;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::bail;

use crate::configuration::{SandboxConfiguration, SandboxId};
use crate::limits::{ResourceLimits, MIB};
use crate::policy::CorePolicy;
use crate::result::{ExitStatus, ResourceUsage, SandboxExecutionResult};
use crate::{KillSwitch, Result, Sandbox};

static PROVISION_ATTEMPTS: Mutex<BTreeMap<String, usize>> = Mutex::new(BTreeMap::new());

/// How many sandboxes were requested for scripts tagged `tag`
pub fn provision_attempts(tag: &str) -> usize {
    PROVISION_ATTEMPTS
        .lock()
        .unwrap()
        .get(tag)
        .copied()
        .unwrap_or(0)
}

fn value(parts: &mut SplitWhitespace<'_>) -> u64 {
    parts.next().and_then(|v| v.parse().ok()).unwrap_or(0)
}

#[derive(Debug, Default, Clone)]
struct Script {
    tag: Option<String>,
    provision_fail: bool,
    provision_for: Option<Duration>,
    kill_misses: bool,
    wait_fail: bool,
    run_for: Option<Duration>,
    forever: bool,
    oom: bool,
    exit_code: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl Script {
    fn parse(text: &str) -> Script {
        let mut script = Script::default();
        for line in text.lines().map(str::trim) {
            if let Some(directive) = line.strip_prefix("#fake:") {
                let mut parts = directive.split_whitespace();
                match parts.next() {
                    Some("tag") => script.tag = parts.next().map(str::to_owned),
                    Some("provision-fail") => script.provision_fail = true,
                    Some("provision-sleep") => {
                        script.provision_for = Some(Duration::from_millis(value(&mut parts)))
                    }
                    Some("kill-misses") => script.kill_misses = true,
                    Some("wait-fail") => script.wait_fail = true,
                    Some("sleep") => {
                        script.run_for = Some(Duration::from_millis(value(&mut parts)))
                    }
                    Some("loop") => script.forever = true,
                    Some("oom") => script.oom = true,
                    Some("exit") => script.exit_code = value(&mut parts) as i32,
                    Some("stdout-bytes") => {
                        script.stdout.extend(vec![b'x'; value(&mut parts) as usize])
                    }
                    Some("stderr-bytes") => {
                        script.stderr.extend(vec![b'e'; value(&mut parts) as usize])
                    }
                    other => panic!("unknown fake directive {:?}", other),
                }
            } else if let Some(text) = line
                .strip_prefix("print(\"")
                .and_then(|rest| rest.strip_suffix("\")"))
            {
                script.stdout.extend_from_slice(text.as_bytes());
                script.stdout.push(b'\n');
            }
        }
        script
    }
}

#[derive(Default)]
struct KillState {
    killed: Mutex<bool>,
    signal: Condvar,
}

#[derive(Clone)]
pub struct FakeKillSwitch(Arc<KillState>);

impl KillSwitch for FakeKillSwitch {
    fn kill(&self) {
        *self.0.killed.lock().unwrap() = true;
        self.0.signal.notify_all();
    }
}

pub struct FakeSandbox {
    config: SandboxConfiguration,
    script: Script,
    state: Arc<KillState>,
}

impl Sandbox for FakeSandbox {
    type Kill = FakeKillSwitch;

    fn run(config: SandboxConfiguration) -> Result<Self> {
        let program = config.args.last().cloned().unwrap_or_default();
        let text = config
            .files
            .iter()
            .find(|file| file.name == program)
            .map(|file| String::from_utf8_lossy(&file.contents).into_owned())
            .unwrap_or_default();
        let script = Script::parse(&text);

        if let Some(tag) = &script.tag {
            *PROVISION_ATTEMPTS
                .lock()
                .unwrap()
                .entry(tag.clone())
                .or_insert(0) += 1;
        }
        if let Some(provision_for) = script.provision_for {
            std::thread::sleep(provision_for);
        }
        if script.provision_fail {
            bail!("scripted provisioning failure");
        }

        Ok(FakeSandbox {
            config,
            script,
            state: Arc::default(),
        })
    }

    fn id(&self) -> &SandboxId {
        &self.config.id
    }

    fn kill_switch(&self) -> FakeKillSwitch {
        if self.script.kill_misses {
            return FakeKillSwitch(Arc::default());
        }
        FakeKillSwitch(self.state.clone())
    }

    fn wait(self) -> Result<SandboxExecutionResult> {
        let start = Instant::now();
        let mut killed = self.state.killed.lock().unwrap();
        if self.script.forever {
            while !*killed {
                killed = self.state.signal.wait(killed).unwrap();
            }
        } else if let Some(run_for) = self.script.run_for {
            let deadline = start + run_for;
            while !*killed {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                killed = self.state.signal.wait_timeout(killed, deadline - now).unwrap().0;
            }
        }
        let was_killed = *killed;
        drop(killed);

        if self.script.wait_fail {
            bail!("scripted supervision failure");
        }

        let status = if was_killed {
            ExitStatus::Killed
        } else if self.script.oom {
            ExitStatus::Signal(libc::SIGKILL)
        } else {
            ExitStatus::ExitCode(self.script.exit_code)
        };

        let limit = self.config.capture_limit;
        let mut stdout = self.script.stdout;
        let mut stderr = self.script.stderr;
        stdout.truncate(limit);
        stderr.truncate(limit);

        Ok(SandboxExecutionResult {
            status,
            resource_usage: ResourceUsage {
                memory_usage: if self.script.oom {
                    self.config.memory_limit
                } else {
                    4 * MIB
                },
                wall_time_usage: start.elapsed().as_secs_f64(),
                ..ResourceUsage::default()
            },
            memory_exceeded: self.script.oom && !was_killed,
            stdout,
            stderr,
        })
    }

    fn is_secure() -> bool {
        true
    }
}

/// The default policy with small, fast limits for the python language
pub fn test_policy() -> CorePolicy {
    let mut policy = CorePolicy {
        pool_size: 4,
        max_queue_depth: 16,
        ..CorePolicy::default()
    };
    if let Some(python) = policy.languages.get_mut("python") {
        python.limits = ResourceLimits::new(2_000, 64 * MIB, 1_000, 1024);
    }
    policy
}
