// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
// SPDX-License-Identifier: MPL-2.0

use std::fs;
use std::path::Path;

use anyhow::{bail, Context};
use nix::mount::{mount, MsFlags};
use nix::sys::stat::{mknod, Mode, SFlag};

use crate::configuration::{DirectoryMount, SandboxConfiguration, SCRATCH_MOUNT};
use crate::Result;

const DEVICES: &[&str] = &["null", "zero", "random", "urandom"];

/// Create the sandbox filesystem in `sandbox_path`: an empty read only root
/// with a few devices, the configured directories bound read only and the
/// scratch directory bound writable at `SCRATCH_MOUNT`.
pub fn create(config: &SandboxConfiguration, sandbox_path: &Path, scratch: &Path) -> Result<()> {
    // Nothing mounted from now on may leak back into the host namespace
    mount(
        None as Option<&str>,
        "/",
        None as Option<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None as Option<&str>,
    )
    .context("Failed to make the mounts private")?;

    mount(
        Some("tmpfs"),
        sandbox_path,
        Some("tmpfs"),
        MsFlags::MS_NOSUID,
        Some("size=16M,mode=0755"),
    )
    .context("Failed to mount tmpfs for the sandbox")?;

    let dev = sandbox_path.join("dev");
    fs::create_dir_all(&dev).context("Failed to create /dev for the sandbox")?;
    for device in DEVICES {
        mount_dev(&dev.join(device), device)
            .with_context(|| format!("Failed to mount /dev/{} in the sandbox", device))?;
    }

    for dir in &config.mount_paths {
        mount_dir(dir, sandbox_path).with_context(|| {
            format!(
                "Failed to mount {} -> {}",
                dir.source.display(),
                dir.target.display()
            )
        })?;
    }

    let target = sandbox_path.join(SCRATCH_MOUNT.trim_start_matches('/'));
    fs::create_dir_all(&target).context("Failed to create the scratch mount point")?;
    mount(
        Some(scratch),
        &target,
        None as Option<&str>,
        MsFlags::MS_BIND | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        None as Option<&str>,
    )
    .context("Failed to bind-mount the scratch directory")?;

    mount(
        None as Option<&str>,
        sandbox_path,
        None as Option<&str>,
        MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_NOSUID,
        None as Option<&str>,
    )
    .context("Failed to remount sandbox directory as readonly")?;
    Ok(())
}

/// Bind a host device over an empty file
fn mount_dev(path: &Path, dev: &str) -> Result<()> {
    mknod(
        path,
        SFlag::empty(),
        Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IROTH,
        0,
    )
    .with_context(|| format!("Failed to mknod {}", path.display()))?;
    mount(
        Some(&Path::new("/dev").join(dev)),
        path,
        None as Option<&str>,
        MsFlags::MS_BIND,
        None as Option<&str>,
    )
    .with_context(|| format!("Failed to bind-mount /dev/{}", dev))
}

/// Mount a host directory read only inside the sandbox
fn mount_dir(dir: &DirectoryMount, sandbox_dir: &Path) -> Result<()> {
    trace!("Mount {:?}", dir);
    let relative = dir.target.strip_prefix("/")?;
    if relative.as_os_str().is_empty() {
        bail!("Cannot mount over the sandbox root");
    }
    let target = sandbox_dir.join(relative);

    fs::create_dir_all(&target)
        .with_context(|| format!("Failed to create mount target at {}", target.display()))?;

    mount(
        Some(&dir.source),
        &target,
        None as Option<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None as Option<&str>,
    )
    .with_context(|| {
        format!(
            "Failed to bind-mount {} -> {}",
            dir.source.display(),
            target.display()
        )
    })?;

    mount(
        None as Option<&str>,
        &target,
        None as Option<&str>,
        MsFlags::MS_REMOUNT
            | MsFlags::MS_RDONLY
            | MsFlags::MS_BIND
            | MsFlags::MS_NOSUID
            | MsFlags::MS_NODEV,
        None as Option<&str>,
    )
    .with_context(|| format!("Failed to readonly remount at {}", target.display()))
}
