// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
// SPDX-License-Identifier: MPL-2.0

//! Resource ceilings applied to a single sandboxed run.

use std::fmt;
use std::time::Duration;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};

/// One mebibyte, the unit of `memory_limit_mb` in requests.
pub const MIB: u64 = 1024 * 1024;

/// Period of the cgroup `cpu.max` quota, in microseconds.
pub const CPU_PERIOD_US: u64 = 100_000;

/// The cgroup v2 `cpu.max` line for a share in thousandths of a core. The
/// quota never goes below 1ms per period.
pub fn cpu_max_line(cpu_shares: u32) -> String {
    let quota = (u64::from(cpu_shares) * CPU_PERIOD_US / 1000).max(1000);
    format!("{} {}", quota, CPU_PERIOD_US)
}

/// Network posture of a sandbox. There is exactly one value: disabled.
///
/// It serializes as `false` and refuses to deserialize from `true`, so a
/// configuration file cannot turn networking on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkDisabled;

impl Serialize for NetworkDisabled {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bool(false)
    }
}

impl<'de> Deserialize<'de> for NetworkDisabled {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FalseOnly;

        impl<'de> Visitor<'de> for FalseOnly {
            type Value = NetworkDisabled;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("`false` (network access cannot be enabled)")
            }

            fn visit_bool<E: de::Error>(self, value: bool) -> Result<Self::Value, E> {
                if value {
                    Err(E::custom("network access cannot be enabled for a sandbox"))
                } else {
                    Ok(NetworkDisabled)
                }
            }
        }

        deserializer.deserialize_bool(FalseOnly)
    }
}

/// Limits for one execution. Used both as the per-language maxima in the
/// policy and as the resolved limits of a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceLimits {
    /// Wall clock time before the sandbox is destroyed, in milliseconds
    pub wall_clock_ms: u64,

    /// Memory ceiling of the whole sandbox, in bytes
    pub memory_bytes: u64,

    /// CPU share in thousandths of a core (1000 = one full core)
    pub cpu_shares: u32,

    /// Bytes of stdout and of stderr kept, each
    pub max_output_bytes: usize,

    #[serde(default)]
    network_enabled: NetworkDisabled,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        ResourceLimits::new(5_000, 256 * MIB, 1_000, 64 * 1024)
    }
}

impl ResourceLimits {
    pub fn new(
        wall_clock_ms: u64,
        memory_bytes: u64,
        cpu_shares: u32,
        max_output_bytes: usize,
    ) -> Self {
        ResourceLimits {
            wall_clock_ms,
            memory_bytes,
            cpu_shares,
            max_output_bytes,
            network_enabled: NetworkDisabled,
        }
    }

    /// Always false.
    pub fn network_enabled(&self) -> bool {
        false
    }

    pub fn wall_clock(&self) -> Duration {
        Duration::from_millis(self.wall_clock_ms)
    }

    /// Resolve the limits of a request against these maxima. Missing values
    /// take the maximum, zero is raised to the smallest unit, and anything
    /// above the maximum is cut down to it.
    pub fn clamp(&self, time_limit_ms: Option<u64>, memory_limit_mb: Option<u64>) -> Self {
        let wall_clock_ms = match time_limit_ms {
            None => self.wall_clock_ms,
            Some(ms) => ms.clamp(1, self.wall_clock_ms.max(1)),
        };
        let memory_bytes = match memory_limit_mb {
            None => self.memory_bytes,
            Some(mb) => mb.saturating_mul(MIB).clamp(MIB, self.memory_bytes.max(MIB)),
        };
        ResourceLimits {
            wall_clock_ms,
            memory_bytes,
            ..*self
        }
    }

    /// The `cpu.max` line for these limits: quota and period in microseconds.
    pub fn cpu_max(&self) -> String {
        cpu_max_line(self.cpu_shares)
    }

    /// Whole seconds of CPU time allowed before the kernel sends SIGKILL.
    /// Only a backstop: the wall clock timer fires first.
    pub fn cpu_seconds_backstop(&self) -> u64 {
        self.wall_clock_ms / 1000 + 2
    }

    /// Names of the fields that make these limits unusable, if any.
    pub fn invalid_fields(&self) -> Vec<&'static str> {
        let mut invalid = Vec::new();
        if self.wall_clock_ms == 0 {
            invalid.push("wall_clock_ms");
        }
        if self.memory_bytes < MIB {
            invalid.push("memory_bytes");
        }
        if self.cpu_shares == 0 {
            invalid.push("cpu_shares");
        }
        if self.max_output_bytes == 0 {
            invalid.push("max_output_bytes");
        }
        invalid
    }
}
