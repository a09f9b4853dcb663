// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
// SPDX-License-Identifier: MPL-2.0

//! This module contains the sandbox for Linux
//!
//! Every run gets fresh user, network, mount, PID, IPC and UTS namespaces,
//! its own cgroup and its own scratch directory. The program runs as an
//! unprivileged user of the new user namespace, so it holds no capabilities
//! once it has been executed.

use std::fs::{self, File};
use std::io::{self, Read};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::process::{Command, Stdio};
use std::ptr::null;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::{anyhow, bail, Context};
use nix::fcntl::OFlag;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{self, Pid};
use tempfile::TempDir;

use crate::configuration::{SandboxConfiguration, SandboxId, SCRATCH_MOUNT};
use crate::policy::is_safe_file_name;
use crate::result::{ExitStatus, ResourceUsage, SandboxExecutionResult};
use crate::util::{setup_resource_limits, wait, wait_exit};
use crate::{KillSwitch, Result, Sandbox};

mod cgroup;
mod filesystem;
#[cfg(feature = "seccomp")]
mod seccomp_filter;

use cgroup::Cgroup;

/// The program's user and group inside the sandbox
const SANDBOX_UID: u32 = 1000;
const SANDBOX_GID: u32 = 1000;

/// Exit code of a child that could not start the program
const SETUP_FAILED: libc::c_int = 127;

/// The namespace init of a running sandbox. The PID is cleared as soon as the
/// process has exited and before it is reaped, so a kill never hits a
/// recycled PID.
struct ChildHandle {
    pid: Mutex<Option<libc::pid_t>>,
    killed: AtomicBool,
}

impl ChildHandle {
    fn new(pid: libc::pid_t) -> Self {
        ChildHandle {
            pid: Mutex::new(Some(pid)),
            killed: AtomicBool::new(false),
        }
    }

    fn kill(&self) {
        let pid = self.pid.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pid) = *pid {
            // The whole PID namespace goes down with its init
            match kill(Pid::from_raw(pid), Signal::SIGKILL) {
                Ok(()) => {
                    self.killed.store(true, Ordering::SeqCst);
                    debug!("Killed sandbox process {}", pid);
                }
                Err(e) => error!("Cannot kill {}: {:?}", pid, e),
            }
        }
    }

    fn exited(&self) {
        self.pid
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct LinuxKillSwitch(Arc<ChildHandle>);

impl KillSwitch for LinuxKillSwitch {
    fn kill(&self) {
        self.0.kill()
    }
}

pub struct LinuxSandbox {
    id: SandboxId,
    child: Arc<ChildHandle>,
    watcher: Option<JoinHandle<Result<SandboxExecutionResult>>>,
}

impl Sandbox for LinuxSandbox {
    type Kill = LinuxKillSwitch;

    fn run(config: SandboxConfiguration) -> Result<Self> {
        trace!("Run LinuxSandbox with config {:?}", config);
        let id = config.id.clone();

        // The thread that clones the child must outlive it: the child's
        // parent death signal is bound to that thread.
        let (started_tx, started_rx) = mpsc::channel();
        let watcher = thread::Builder::new()
            .name(format!("sandbox-{}", id))
            .spawn(move || watcher(config, started_tx))
            .context("Failed to start the sandbox watcher")?;

        match started_rx.recv() {
            Ok(Ok(child)) => Ok(LinuxSandbox {
                id,
                child,
                watcher: Some(watcher),
            }),
            Ok(Err(e)) => {
                let _ = watcher.join();
                Err(e)
            }
            Err(_) => {
                let _ = watcher.join();
                bail!("Sandbox watcher exited during setup")
            }
        }
    }

    fn id(&self) -> &SandboxId {
        &self.id
    }

    fn kill_switch(&self) -> LinuxKillSwitch {
        LinuxKillSwitch(self.child.clone())
    }

    fn wait(mut self) -> Result<SandboxExecutionResult> {
        let watcher = self
            .watcher
            .take()
            .ok_or_else(|| anyhow!("Sandbox already waited"))?;
        watcher
            .join()
            .map_err(|_| anyhow!("Sandbox watcher panicked"))?
    }

    fn is_secure() -> bool {
        true
    }
}

impl Drop for LinuxSandbox {
    fn drop(&mut self) {
        // Nobody is going to collect the result
        if self.watcher.is_some() {
            self.child.kill();
        }
    }
}

/// Everything the child needs, prepared before the clone so the child does
/// as little as possible between clone and exec.
struct ChildContext<'a> {
    config: &'a SandboxConfiguration,
    root: &'a Path,
    scratch: &'a Path,
    uid_map: String,
    gid_map: String,
    go_read: RawFd,
    go_write: RawFd,
    error_write: RawFd,
}

/// Host resources of one run. Dropping it removes the cgroup and the
/// directories.
struct Provisioned {
    cgroup: Cgroup,
    root: TempDir,
    scratch: TempDir,
}

fn provision(config: &SandboxConfiguration) -> Result<Provisioned> {
    if config.syscall_filter.is_some() && !cfg!(feature = "seccomp") {
        bail!("A syscall filter was requested but seccomp support is not compiled in");
    }

    let mut builder = tempfile::Builder::new();
    builder.prefix("gradebox-");
    let scratch = match &config.scratch_root {
        Some(root) => builder.tempdir_in(root),
        None => builder.tempdir(),
    }
    .context("Failed to create the scratch directory")?;

    for file in &config.files {
        if !is_safe_file_name(&file.name) {
            bail!("Invalid scratch file name {:?}", file.name);
        }
        fs::write(scratch.path().join(&file.name), &file.contents)
            .with_context(|| format!("Failed to write {}", file.name))?;
    }

    let root = tempfile::Builder::new()
        .prefix("gradebox-root-")
        .tempdir()
        .context("Failed to create the sandbox root")?;

    let cgroup = Cgroup::create(config)?;

    Ok(Provisioned {
        cgroup,
        root,
        scratch,
    })
}

fn watcher(
    config: SandboxConfiguration,
    started: mpsc::Sender<Result<Arc<ChildHandle>>>,
) -> Result<SandboxExecutionResult> {
    let provisioned = match provision(&config) {
        Ok(provisioned) => provisioned,
        Err(e) => {
            let _ = started.send(Err(e));
            bail!("Sandbox {} was not provisioned", config.id);
        }
    };

    let running = match start(&config, &provisioned) {
        Ok(running) => running,
        Err(e) => {
            let _ = started.send(Err(e));
            bail!("Sandbox {} did not start", config.id);
        }
    };

    if started.send(Ok(running.child.clone())).is_err() {
        // The caller is gone, nobody will wait for this run
        running.child.kill();
    }

    finish(running, &provisioned)
}

struct Running {
    pid: libc::pid_t,
    child: Arc<ChildHandle>,
    start_time: Instant,
    stdout: JoinHandle<Vec<u8>>,
    stderr: JoinHandle<Vec<u8>>,
}

/// Clone the child into new namespaces and release it once it is in its
/// cgroup. Returns when the program has been executed.
fn start(config: &SandboxConfiguration, provisioned: &Provisioned) -> Result<Running> {
    let (stdout_read, stdout_write) = unistd::pipe2(OFlag::O_CLOEXEC)?;
    let (stderr_read, stderr_write) = unistd::pipe2(OFlag::O_CLOEXEC)?;
    let (go_read, go_write) = unistd::pipe2(OFlag::O_CLOEXEC)?;
    let (error_read, error_write) = unistd::pipe2(OFlag::O_CLOEXEC)?;

    let mut command = Command::new(&config.executable);
    command
        .env_clear()
        .envs(config.env.clone())
        .args(&config.args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout_write))
        .stderr(Stdio::from(stderr_write));

    // uid/gid from outside the sandbox
    let uid = unistd::getuid();
    let gid = unistd::getgid();

    let context = ChildContext {
        config,
        root: provisioned.root.path(),
        scratch: provisioned.scratch.path(),
        uid_map: format!("{} {} 1", SANDBOX_UID, uid.as_raw()),
        gid_map: format!("{} {} 1", SANDBOX_GID, gid.as_raw()),
        go_read: go_read.as_raw_fd(),
        go_write: go_write.as_raw_fd(),
        error_write: error_write.as_raw_fd(),
    };

    let child_pid = unsafe {
        libc::syscall(
            libc::SYS_clone,
            libc::CLONE_NEWIPC
                | libc::CLONE_NEWNET
                | libc::CLONE_NEWNS
                | libc::CLONE_NEWPID
                | libc::CLONE_NEWUSER
                | libc::CLONE_NEWUTS
                | libc::SIGCHLD,
            null::<libc::c_void>(),
        )
    } as libc::pid_t;

    if child_pid < 0 {
        return Err(io::Error::last_os_error()).context("clone() failed");
    }

    if child_pid == 0 {
        // Never return: unwinding here would run the parent's destructors
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| child(&context, &mut command)));
        let message = match outcome {
            Ok(e) => format!("{:#}", e),
            Err(_) => "Sandbox setup panicked".to_owned(),
        };
        unsafe {
            libc::write(
                context.error_write,
                message.as_ptr() as *const libc::c_void,
                message.len(),
            );
            libc::_exit(SETUP_FAILED);
        }
    }

    trace!("Sandbox {} child started, PID = {}", config.id, child_pid);
    let child = Arc::new(ChildHandle::new(child_pid));

    // Close the child's ends
    drop(command);
    drop(go_read);
    drop(error_write);

    if let Err(e) = provisioned.cgroup.add_pid(child_pid) {
        child.kill();
        child.exited();
        let _ = wait(child_pid);
        return Err(e);
    }

    let start_time = Instant::now();
    let mut go = File::from(go_write);
    let released = io::Write::write_all(&mut go, &[1]);
    drop(go);

    // EOF without a message means the program was executed
    let mut message = Vec::new();
    File::from(error_read).read_to_end(&mut message)?;
    if let Err(e) = &released {
        warn!("Cannot release sandbox {}: {}", config.id, e);
    }
    if !message.is_empty() || released.is_err() {
        child.exited();
        let _ = wait(child_pid);
        if message.is_empty() {
            bail!("Sandbox {} aborted during setup", config.id);
        }
        bail!("{}", String::from_utf8_lossy(&message));
    }

    Ok(Running {
        pid: child_pid,
        child,
        start_time,
        stdout: capture(stdout_read, config.capture_limit, "stdout")?,
        stderr: capture(stderr_read, config.capture_limit, "stderr")?,
    })
}

/// Wait for the program, then collect what it left behind
fn finish(running: Running, provisioned: &Provisioned) -> Result<SandboxExecutionResult> {
    if let Err(e) = wait_exit(running.pid) {
        warn!("{:#}, killing the sandbox", e);
        running.child.kill();
    }
    running.child.exited();
    let (status, resource_usage) = wait(running.pid)?;
    let wall_time_usage = running.start_time.elapsed().as_secs_f64();

    // Stragglers die with the namespace, this only makes it immediate
    provisioned.cgroup.kill();

    let stdout = running
        .stdout
        .join()
        .map_err(|_| anyhow!("stdout reader panicked"))?;
    let stderr = running
        .stderr
        .join()
        .map_err(|_| anyhow!("stderr reader panicked"))?;

    let peak_memory = provisioned.cgroup.peak_memory().unwrap_or(0);
    let memory_exceeded = provisioned.cgroup.oom_kills() > 0;

    Ok(SandboxExecutionResult {
        status: if running.child.was_killed() {
            ExitStatus::Killed
        } else {
            status
        },
        resource_usage: ResourceUsage {
            memory_usage: resource_usage.memory_usage.max(peak_memory),
            wall_time_usage,
            ..resource_usage
        },
        memory_exceeded,
        stdout,
        stderr,
    })
}

/// Keep the first `limit` bytes of a stream, read and drop the rest so the
/// writer never blocks on a full pipe.
fn capture(fd: OwnedFd, limit: usize, name: &str) -> Result<JoinHandle<Vec<u8>>> {
    let handle = thread::Builder::new()
        .name(format!("sandbox-{}", name))
        .spawn(move || {
            let mut stream = File::from(fd);
            let mut kept = Vec::new();
            if let Err(e) = (&mut stream).take(limit as u64).read_to_end(&mut kept) {
                warn!("Error reading sandbox output: {}", e);
            }
            let _ = io::copy(&mut stream, &mut io::sink());
            kept
        })?;
    Ok(handle)
}

/// Child process: returns only if the program could not be executed
fn child(context: &ChildContext, command: &mut Command) -> anyhow::Error {
    match enter_sandbox(context) {
        Ok(()) => anyhow::Error::new(command.exec()).context("Failed to exec"),
        Err(e) => e,
    }
}

fn enter_sandbox(context: &ChildContext) -> Result<()> {
    assert_eq!(unistd::getpid().as_raw(), 1);
    let config = context.config;

    // When the watcher dies, I want to die too
    if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) } < 0 {
        bail!("Error calling prctl()");
    }

    // Wait to be placed in the cgroup
    unsafe { libc::close(context.go_write) };
    let mut go = [0u8; 1];
    loop {
        let ret = unsafe { libc::read(context.go_read, go.as_mut_ptr() as *mut libc::c_void, 1) };
        if ret == 1 {
            break;
        }
        if ret < 0 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
            continue;
        }
        bail!("Sandbox was not released");
    }

    fs::write("/proc/self/setgroups", "deny")?;
    fs::write("/proc/self/uid_map", &context.uid_map)?;
    fs::write("/proc/self/gid_map", &context.gid_map)?;

    filesystem::create(config, context.root, context.scratch)?;
    enter_chroot(config, context.root)?;
    setup_resource_limits(config)?;
    setup_syscall_filter(config)
}

/// Enter the sandbox chroot and change directory
fn enter_chroot(config: &SandboxConfiguration, sandbox_path: &Path) -> Result<()> {
    unistd::chroot(sandbox_path).context("Failed to chroot")?;

    if !config.executable.exists() {
        bail!(
            "Executable {} doesn't exist inside the sandbox",
            config.executable.display()
        );
    }

    unistd::chdir(SCRATCH_MOUNT).context("Failed to enter the scratch directory")?;
    Ok(())
}

/// Forbid privilege gains and install the syscall filter, if any
fn setup_syscall_filter(config: &SandboxConfiguration) -> Result<()> {
    if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } < 0 {
        bail!("Error setting no_new_privs");
    }

    #[cfg(feature = "seccomp")]
    if let Some(syscall_filter) = &config.syscall_filter {
        seccomp_filter::SeccompFilter::from_config(syscall_filter)?.load()?;
    }
    #[cfg(not(feature = "seccomp"))]
    let _ = config;

    Ok(())
}
