// Copyright (c) 2026 clove project
// SPDX-License-Identifier: AGPL-3.0

//! OS-level process isolation.
//!
//! Agents run inside Linux namespaces (PID, MNT, UTS, and NET when network
//! access is disabled) with cgroups v2 resource limits. Full isolation needs
//! root or CAP_SYS_ADMIN; every downgrade is recorded in [`IsolationStatus`]
//! and surfaced to callers. Degraded mode is permitted, flagged, and never
//! reported as full isolation.
//!
//! The preferred start path clones the child with the requested namespace
//! flags and holds it on a handshake pipe until the parent has written the
//! pid into `cgroup.procs`; the fallback is a plain fork/exec with every
//! namespace flag marked inactive.

use crate::domain::agent::ResourceLimits;
use nix::sched::CloneFlags;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use serde_json::{json, Value};
use std::ffi::CString;
use std::fmt::Write as _;
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const CGROUP_ROOT: &str = "/sys/fs/cgroup/clove";
const CLONE_STACK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Unique sandbox name; becomes the cgroup directory name.
    pub name: String,
    pub limits: ResourceLimits,
    pub enable_network: bool,
    pub enable_pid_namespace: bool,
    pub enable_mount_namespace: bool,
    pub enable_uts_namespace: bool,
    pub enable_cgroups: bool,
}

impl SandboxConfig {
    pub fn isolated(name: impl Into<String>, limits: ResourceLimits, enable_network: bool) -> Self {
        Self {
            name: name.into(),
            limits,
            enable_network,
            enable_pid_namespace: true,
            enable_mount_namespace: true,
            enable_uts_namespace: true,
            enable_cgroups: true,
        }
    }

    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            limits: ResourceLimits::default(),
            enable_network: true,
            enable_pid_namespace: false,
            enable_mount_namespace: false,
            enable_uts_namespace: false,
            enable_cgroups: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Created,
    Running,
    Paused,
    Stopped,
    Failed,
}

/// Which requested isolations are actually active.
#[derive(Debug, Clone, Default)]
pub struct IsolationStatus {
    pub pid_namespace: bool,
    pub net_namespace: bool,
    pub mnt_namespace: bool,
    pub uts_namespace: bool,
    pub cgroups_available: bool,
    pub memory_limit_applied: bool,
    pub cpu_quota_applied: bool,
    pub pids_limit_applied: bool,
    pub fully_isolated: bool,
    pub degraded_reason: Option<String>,
}

impl IsolationStatus {
    pub fn is_degraded(&self) -> bool {
        !self.fully_isolated && self.degraded_reason.is_some()
    }

    fn note_degraded(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        match &mut self.degraded_reason {
            Some(existing) => {
                let _ = write!(existing, "; {reason}");
            }
            None => self.degraded_reason = Some(reason),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "namespaces": {
                "pid": self.pid_namespace,
                "net": self.net_namespace,
                "mnt": self.mnt_namespace,
                "uts": self.uts_namespace,
            },
            "cgroups": {
                "available": self.cgroups_available,
                "memory_limit": self.memory_limit_applied,
                "cpu_quota": self.cpu_quota_applied,
                "pids_limit": self.pids_limit_applied,
            },
            "fully_isolated": self.fully_isolated,
            "degraded_reason": self.degraded_reason,
        })
    }
}

/// Convert legacy cpu.shares (2..262144, default 1024) to cgroup v2
/// cpu.weight (1..10000, default 100).
pub fn shares_to_weight(shares: u64) -> u64 {
    (shares * 100 / 1024).clamp(1, 10_000)
}

#[derive(Debug)]
pub struct Sandbox {
    config: SandboxConfig,
    state: SandboxState,
    child: Option<Pid>,
    exit_code: Option<i32>,
    cgroup_path: PathBuf,
    isolation: IsolationStatus,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        let cgroup_path = Path::new(CGROUP_ROOT).join(&config.name);
        Self {
            config,
            state: SandboxState::Created,
            child: None,
            exit_code: None,
            cgroup_path,
            isolation: IsolationStatus::default(),
        }
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    pub fn pid(&self) -> Option<i32> {
        self.child.map(Pid::as_raw)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn isolation_status(&self) -> &IsolationStatus {
        &self.isolation
    }

    pub fn cgroup_path(&self) -> &Path {
        &self.cgroup_path
    }

    /// Prepare the cgroup. Every failure here is non-fatal: the reason lands
    /// in `isolation_status.degraded_reason` and the sandbox proceeds.
    pub fn create(&mut self) {
        if !self.config.enable_cgroups {
            return;
        }
        if !Path::new("/sys/fs/cgroup/cgroup.controllers").exists() {
            warn!("degraded isolation: cgroup v2 not available, limits will not be enforced");
            self.isolation.note_degraded("cgroup v2 not available");
            return;
        }
        self.isolation.cgroups_available = true;

        if let Err(e) = ensure_cgroup_root() {
            warn!("degraded isolation: cannot create cgroup root (need root): {e}");
            self.isolation
                .note_degraded("cannot create cgroup root (need root)");
            return;
        }
        if let Err(e) = std::fs::create_dir_all(&self.cgroup_path) {
            warn!(
                "degraded isolation: cannot create cgroup {}: {e}",
                self.cgroup_path.display()
            );
            self.isolation
                .note_degraded("cannot create sandbox cgroup (need root)");
            return;
        }

        let limits = self.config.limits.clone();
        self.isolation.memory_limit_applied = self
            .write_control("memory.max", &limits.memory_limit_bytes.to_string());
        self.isolation.cpu_quota_applied = self.write_control(
            "cpu.max",
            &format!("{} {}", limits.cpu_quota_us, limits.cpu_period_us),
        );
        self.isolation.pids_limit_applied =
            self.write_control("pids.max", &limits.max_pids.to_string());
        // cpu.weight is best-effort and does not gate full isolation.
        self.write_control("cpu.weight", &shares_to_weight(limits.cpu_shares).to_string());

        if !self.isolation.memory_limit_applied
            || !self.isolation.cpu_quota_applied
            || !self.isolation.pids_limit_applied
        {
            warn!(
                "sandbox {} running with partial cgroup limits: memory={} cpu={} pids={}",
                self.config.name,
                self.isolation.memory_limit_applied,
                self.isolation.cpu_quota_applied,
                self.isolation.pids_limit_applied
            );
        }
    }

    fn write_control(&mut self, file: &str, value: &str) -> bool {
        let path = self.cgroup_path.join(file);
        if !path.exists() {
            self.isolation
                .note_degraded(format!("{file} not available"));
            return false;
        }
        match std::fs::write(&path, value) {
            Ok(()) => {
                debug!("set {} = {value}", path.display());
                true
            }
            Err(e) => {
                self.isolation
                    .note_degraded(format!("failed to write {file}: {e}"));
                false
            }
        }
    }

    /// Start `command` with `args` inside the configured isolation.
    pub fn start(&mut self, command: &str, args: &[String]) -> io::Result<()> {
        if self.state == SandboxState::Running {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("sandbox {} already running", self.config.name),
            ));
        }

        let mut flags = CloneFlags::empty();
        if self.config.enable_pid_namespace {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.config.enable_mount_namespace {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.config.enable_uts_namespace {
            flags |= CloneFlags::CLONE_NEWUTS;
        }
        if !self.config.enable_network {
            flags |= CloneFlags::CLONE_NEWNET;
        }

        // argv and hostname are prepared before clone; the child must not
        // allocate between clone and exec.
        let prog = CString::new(command)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in command"))?;
        let mut argv = vec![prog.clone()];
        for arg in args {
            argv.push(
                CString::new(arg.as_str())
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in argument"))?,
            );
        }
        let hostname = CString::new(format!("clove-{}", self.config.name))
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in sandbox name"))?;

        let (handshake_rx, handshake_tx) = nix::unistd::pipe().map_err(io::Error::from)?;
        let set_uts = self.config.enable_uts_namespace;
        let remount_proc = self.config.enable_pid_namespace && self.config.enable_mount_namespace;
        let rx_fd = handshake_rx.as_raw_fd();

        let mut stack = vec![0u8; CLONE_STACK_SIZE];
        let child = {
            let argv = &argv;
            let prog = &prog;
            let hostname = &hostname;
            let cb = Box::new(move || -> isize {
                // Wait for the parent to finish cgroup assignment.
                let mut byte = [0u8; 1];
                let _ = nix::unistd::read(rx_fd, &mut byte);

                if set_uts {
                    use std::os::unix::ffi::OsStrExt;
                    let _ = nix::unistd::sethostname(std::ffi::OsStr::from_bytes(
                        hostname.to_bytes(),
                    ));
                }
                if remount_proc {
                    // May fail without root; the pid namespace still holds.
                    let _ = nix::mount::mount(
                        Some("proc"),
                        "/proc",
                        Some("proc"),
                        nix::mount::MsFlags::empty(),
                        None::<&str>,
                    );
                }
                match nix::unistd::execvp(prog, argv) {
                    Ok(_) => unreachable!(),
                    Err(_) => 127,
                }
            });
            // SAFETY: the child only reads pre-built CStrings and execs.
            unsafe { nix::sched::clone(cb, &mut stack, flags, Some(nix::libc::SIGCHLD)) }
        };

        match child {
            Ok(pid) => {
                if self.config.enable_pid_namespace {
                    self.isolation.pid_namespace = true;
                }
                if self.config.enable_mount_namespace {
                    self.isolation.mnt_namespace = true;
                }
                if self.config.enable_uts_namespace {
                    self.isolation.uts_namespace = true;
                }
                if !self.config.enable_network {
                    self.isolation.net_namespace = true;
                }
                self.child = Some(pid);
                self.assign_to_cgroup(pid);
                // Release the child toward exec.
                let _ = nix::unistd::write(&handshake_tx, b"x");
                drop(handshake_tx);
                drop(handshake_rx);
            }
            Err(e) => {
                drop(handshake_tx);
                drop(handshake_rx);
                warn!(
                    "clone() failed for sandbox {} ({e}), falling back to fork(); \
                     namespace isolation unavailable (need root/CAP_SYS_ADMIN)",
                    self.config.name
                );
                self.isolation.note_degraded(
                    "clone() failed - no namespace isolation (need root/CAP_SYS_ADMIN)",
                );
                let pid = self.fork_fallback(&prog, &argv)?;
                self.child = Some(pid);
                self.assign_to_cgroup(pid);
            }
        }

        self.update_fully_isolated();
        self.state = SandboxState::Running;
        if self.isolation.fully_isolated {
            info!(
                "sandbox {} started with full isolation (pid={})",
                self.config.name,
                self.child.unwrap()
            );
        } else {
            warn!(
                "sandbox {} started with partial isolation (pid={}): {}",
                self.config.name,
                self.child.unwrap(),
                self.isolation
                    .degraded_reason
                    .as_deref()
                    .unwrap_or("see isolation flags")
            );
        }
        Ok(())
    }

    fn fork_fallback(&mut self, prog: &CString, argv: &[CString]) -> io::Result<Pid> {
        // SAFETY: the child only calls execvp/_exit, both async-signal-safe.
        match unsafe { nix::unistd::fork() } {
            Ok(nix::unistd::ForkResult::Parent { child }) => Ok(child),
            Ok(nix::unistd::ForkResult::Child) => {
                let _ = nix::unistd::execvp(prog, argv);
                unsafe { nix::libc::_exit(127) }
            }
            Err(e) => {
                self.state = SandboxState::Failed;
                Err(io::Error::from(e))
            }
        }
    }

    fn assign_to_cgroup(&mut self, pid: Pid) {
        if !self.config.enable_cgroups || !self.isolation.cgroups_available {
            return;
        }
        let procs = self.cgroup_path.join("cgroup.procs");
        if !procs.exists() {
            return;
        }
        if let Err(e) = std::fs::write(&procs, pid.as_raw().to_string()) {
            warn!(
                "degraded isolation: pid {pid} not added to cgroup {}: {e}",
                self.cgroup_path.display()
            );
            self.isolation.memory_limit_applied = false;
            self.isolation.cpu_quota_applied = false;
            self.isolation.pids_limit_applied = false;
            self.isolation
                .note_degraded("process not assigned to cgroup");
        } else {
            debug!("added pid {pid} to cgroup {}", self.cgroup_path.display());
        }
    }

    fn update_fully_isolated(&mut self) {
        let cfg = &self.config;
        let iso = &self.isolation;
        let namespaces_ok = (!cfg.enable_pid_namespace || iso.pid_namespace)
            && (!cfg.enable_mount_namespace || iso.mnt_namespace)
            && (!cfg.enable_uts_namespace || iso.uts_namespace)
            && (cfg.enable_network || iso.net_namespace);
        let cgroups_ok = !cfg.enable_cgroups
            || (iso.memory_limit_applied && iso.cpu_quota_applied && iso.pids_limit_applied);
        self.isolation.fully_isolated = namespaces_ok && cgroups_ok;
    }

    /// SIGSTOP the child: `Running → Paused`.
    pub fn pause(&mut self) -> io::Result<()> {
        if self.state != SandboxState::Running {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("sandbox {} is not running", self.config.name),
            ));
        }
        let pid = self.require_child()?;
        match kill(pid, Signal::SIGSTOP) {
            Ok(()) => {
                self.state = SandboxState::Paused;
                info!("sandbox {} paused (pid={pid})", self.config.name);
                Ok(())
            }
            Err(nix::errno::Errno::ESRCH) => {
                self.state = SandboxState::Stopped;
                Err(io::Error::new(io::ErrorKind::NotFound, "process exited"))
            }
            Err(e) => Err(io::Error::from(e)),
        }
    }

    /// SIGCONT the child: `Paused → Running`.
    pub fn resume(&mut self) -> io::Result<()> {
        if self.state != SandboxState::Paused {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("sandbox {} is not paused", self.config.name),
            ));
        }
        let pid = self.require_child()?;
        match kill(pid, Signal::SIGCONT) {
            Ok(()) => {
                self.state = SandboxState::Running;
                info!("sandbox {} resumed (pid={pid})", self.config.name);
                Ok(())
            }
            Err(nix::errno::Errno::ESRCH) => {
                self.state = SandboxState::Stopped;
                Err(io::Error::new(io::ErrorKind::NotFound, "process exited"))
            }
            Err(e) => Err(io::Error::from(e)),
        }
    }

    /// SIGTERM, poll for exit with 100 ms granularity, SIGKILL on timeout.
    pub fn stop(&mut self, timeout_ms: u64) -> io::Result<()> {
        if !matches!(self.state, SandboxState::Running | SandboxState::Paused) {
            return Ok(());
        }
        let pid = self.require_child()?;
        info!("stopping sandbox {} (pid={pid})", self.config.name);

        // A paused child will not act on SIGTERM; continue it first.
        if self.state == SandboxState::Paused {
            let _ = kill(pid, Signal::SIGCONT);
        }
        match kill(pid, Signal::SIGTERM) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => warn!("kill(SIGTERM) failed: {e}"),
        }

        let interval = Duration::from_millis(100);
        let mut waited = 0u64;
        while waited < timeout_ms {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(status) => {
                    self.record_exit(status);
                    return Ok(());
                }
                Err(nix::errno::Errno::ECHILD) => {
                    self.state = SandboxState::Stopped;
                    return Ok(());
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from(e)),
            }
            std::thread::sleep(interval);
            waited += 100;
        }

        warn!("sandbox {} not responding, sending SIGKILL", self.config.name);
        let _ = kill(pid, Signal::SIGKILL);
        match waitpid(pid, None) {
            Ok(status) => self.record_exit(status),
            Err(_) => self.state = SandboxState::Stopped,
        }
        Ok(())
    }

    /// Block until the child exits.
    pub fn wait(&mut self) -> io::Result<i32> {
        let pid = self.require_child()?;
        let status = waitpid(pid, None).map_err(io::Error::from)?;
        self.record_exit(status);
        Ok(self.exit_code.unwrap_or(-1))
    }

    /// Nonblocking reap: collects the exit status if the child has become a
    /// zombie and transitions to `Stopped`.
    pub fn is_running(&mut self) -> bool {
        let Some(pid) = self.child else {
            return false;
        };
        if !matches!(self.state, SandboxState::Running | SandboxState::Paused) {
            return false;
        }
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => true,
            Ok(status) => {
                self.record_exit(status);
                false
            }
            Err(_) => {
                self.state = SandboxState::Stopped;
                false
            }
        }
    }

    /// Ensure stopped, then remove the cgroup directory (best effort).
    pub fn destroy(&mut self) {
        if matches!(self.state, SandboxState::Running | SandboxState::Paused) {
            let _ = self.stop(5_000);
        }
        if self.cgroup_path.exists() {
            if let Err(e) = std::fs::remove_dir(&self.cgroup_path) {
                warn!("failed to remove cgroup {}: {e}", self.cgroup_path.display());
            } else {
                debug!("removed cgroup {}", self.cgroup_path.display());
            }
        }
    }

    fn record_exit(&mut self, status: WaitStatus) {
        match status {
            WaitStatus::Exited(_, code) => self.exit_code = Some(code),
            WaitStatus::Signaled(_, sig, _) => self.exit_code = Some(128 + sig as i32),
            _ => {}
        }
        self.state = SandboxState::Stopped;
    }

    fn require_child(&self) -> io::Result<Pid> {
        self.child
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "sandbox has no child process"))
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if matches!(self.state, SandboxState::Running | SandboxState::Paused) {
            let _ = self.stop(5_000);
        }
        self.destroy();
    }
}

/// Create the clove cgroup root and enable the controllers we use.
/// Best effort; callers treat failure as degraded isolation.
fn ensure_cgroup_root() -> io::Result<()> {
    let root = Path::new(CGROUP_ROOT);
    if !root.exists() {
        std::fs::create_dir_all(root)?;
        info!("created cgroup root {CGROUP_ROOT}");
    }
    let subtree = Path::new("/sys/fs/cgroup/cgroup.subtree_control");
    if subtree.exists() {
        let _ = std::fs::write(subtree, "+cpu +memory +pids");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shares_to_weight_conversion() {
        assert_eq!(shares_to_weight(1024), 100);
        assert_eq!(shares_to_weight(2048), 200);
        assert_eq!(shares_to_weight(2), 1, "floors at 1");
        assert_eq!(shares_to_weight(1_000_000), 10_000, "caps at 10000");
    }

    #[test]
    fn plain_sandbox_runs_and_reaps() {
        let mut sandbox = Sandbox::new(SandboxConfig::plain("unit-plain"));
        sandbox.create();
        sandbox.start("/bin/true", &[]).unwrap();
        assert_eq!(sandbox.state(), SandboxState::Running);
        let code = sandbox.wait().unwrap();
        assert_eq!(code, 0);
        assert_eq!(sandbox.state(), SandboxState::Stopped);
    }

    #[test]
    fn stop_terminates_long_running_child() {
        let mut sandbox = Sandbox::new(SandboxConfig::plain("unit-stop"));
        sandbox.create();
        sandbox.start("/bin/sleep", &["30".to_string()]).unwrap();
        assert!(sandbox.is_running());
        sandbox.stop(2_000).unwrap();
        assert_eq!(sandbox.state(), SandboxState::Stopped);
        assert!(!sandbox.is_running());
    }

    #[test]
    fn pause_and_resume_transitions() {
        let mut sandbox = Sandbox::new(SandboxConfig::plain("unit-pause"));
        sandbox.create();
        sandbox.start("/bin/sleep", &["30".to_string()]).unwrap();
        sandbox.pause().unwrap();
        assert_eq!(sandbox.state(), SandboxState::Paused);
        // A stopped (SIGSTOP) child is still alive from the reaper's view.
        assert!(sandbox.is_running());
        sandbox.resume().unwrap();
        assert_eq!(sandbox.state(), SandboxState::Running);
        sandbox.stop(2_000).unwrap();
    }

    #[test]
    fn exec_failure_reports_exit_127() {
        let mut sandbox = Sandbox::new(SandboxConfig::plain("unit-noexec"));
        sandbox.create();
        sandbox
            .start("/nonexistent/program/path", &[])
            .unwrap();
        let code = sandbox.wait().unwrap();
        assert_eq!(code, 127);
    }
}
