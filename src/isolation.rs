// src/isolation.rs

//! Execution isolation: direct, fakeroot, and chroot modes
//!
//! Mode selection degrades gracefully: a missing fakeroot binary falls back
//! to direct with a warning, and chroot falls back the same way unless the
//! recipe explicitly pinned it, in which case the package fails with
//! `IsolationUnavailable`.
//!
//! The chroot virtual-FS lifecycle is a small state machine:
//!
//! ```text
//! idle -> mounting -> ready -> running -> unmounting -> idle
//!                \______________________________________/
//!                 any I/O error -> failed (absorbing; explicit cleanup
//!                 is required before the session can be reused)
//! ```
//!
//! Mount and unmount batches run under the global destructive lock; the
//! stack unwinds in strict reverse order of successful mounts with a lazy
//! detach fallback when `force` is set.

use crate::config::ModeOverride;
use crate::error::{Error, Result};
use crate::lock::LockRegistry;
use crate::recipe::BuildMode;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Environment variables preserved inside a chroot
const CHROOT_KEEP_ENV: &[&str] = &["HOME", "TERM", "PS1", "PATH"];

/// Concrete execution mode after resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedMode {
    Direct,
    Fakeroot,
    Chroot,
}

impl ResolvedMode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Fakeroot => "fakeroot",
            Self::Chroot => "chroot",
        }
    }
}

/// Selects execution modes and builds wrapped commands
pub struct IsolationManager {
    chroot_root: Option<PathBuf>,
    override_mode: ModeOverride,
    wrapper_counter: AtomicU64,
}

impl IsolationManager {
    pub fn new(chroot_root: Option<PathBuf>, override_mode: ModeOverride) -> Self {
        Self {
            chroot_root,
            override_mode,
            wrapper_counter: AtomicU64::new(0),
        }
    }

    /// Resolve a recipe's mode, applying the global override.
    pub fn resolve(&self, recipe_mode: BuildMode) -> Result<ResolvedMode> {
        let requested = match self.override_mode {
            ModeOverride::Auto => recipe_mode,
            ModeOverride::Direct => BuildMode::Direct,
            ModeOverride::Fakeroot => BuildMode::Fakeroot,
            ModeOverride::Chroot => BuildMode::Chroot,
        };

        match requested {
            BuildMode::Direct => Ok(ResolvedMode::Direct),
            BuildMode::Auto => {
                if fakeroot_available() {
                    Ok(ResolvedMode::Fakeroot)
                } else {
                    Ok(ResolvedMode::Direct)
                }
            }
            BuildMode::Fakeroot => {
                if fakeroot_available() {
                    Ok(ResolvedMode::Fakeroot)
                } else {
                    warn!("fakeroot not available, falling back to direct execution");
                    Ok(ResolvedMode::Direct)
                }
            }
            BuildMode::Chroot => {
                self.check_chroot()?;
                Ok(ResolvedMode::Chroot)
            }
        }
    }

    fn check_chroot(&self) -> Result<()> {
        let root = self
            .chroot_root
            .as_ref()
            .ok_or_else(|| Error::IsolationUnavailable("no chroot root configured".to_string()))?;
        if !root.is_dir() {
            return Err(Error::IsolationUnavailable(format!(
                "chroot root {} does not exist",
                root.display()
            )));
        }
        if !nix::unistd::geteuid().is_root() {
            return Err(Error::IsolationUnavailable(
                "chroot requires root privileges".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the command for one phase script under the resolved mode.
    pub fn command(
        &self,
        mode: ResolvedMode,
        script: &str,
        workdir: &Path,
        env: &HashMap<String, String>,
    ) -> Result<Command> {
        match mode {
            ResolvedMode::Direct => {
                let mut cmd = Command::new("bash");
                cmd.arg("-c").arg(script).current_dir(workdir).envs(env);
                Ok(cmd)
            }
            ResolvedMode::Fakeroot => {
                let mut cmd = Command::new("fakeroot");
                cmd.arg("bash")
                    .arg("-c")
                    .arg(script)
                    .current_dir(workdir)
                    .envs(env);
                Ok(cmd)
            }
            ResolvedMode::Chroot => self.chroot_command(script, workdir, env),
        }
    }

    /// Place a wrapper script inside the target root and execute it via
    /// `chroot` under a scrubbed environment. When `unshare` is available
    /// the chroot additionally gets fresh mount and PID namespaces.
    fn chroot_command(
        &self,
        script: &str,
        workdir: &Path,
        env: &HashMap<String, String>,
    ) -> Result<Command> {
        let root = self
            .chroot_root
            .as_ref()
            .ok_or_else(|| Error::IsolationUnavailable("no chroot root configured".to_string()))?;

        let tmp_dir = root.join("tmp");
        std::fs::create_dir_all(&tmp_dir)
            .map_err(|e| Error::IoError(format!("create {}: {e}", tmp_dir.display())))?;

        let serial = self.wrapper_counter.fetch_add(1, Ordering::Relaxed);
        let wrapper_name = format!("smelt-phase-{}-{serial}.sh", std::process::id());
        let wrapper_host = tmp_dir.join(&wrapper_name);

        let mut body = String::from("#!/bin/bash\n");
        for (key, value) in env {
            body.push_str(&format!("export {key}={}\n", shell_quote(value)));
        }
        body.push_str(&format!("cd {}\n", shell_quote(&workdir.display().to_string())));
        body.push_str(script);
        body.push('\n');

        std::fs::write(&wrapper_host, body)
            .map_err(|e| Error::IoError(format!("write wrapper {}: {e}", wrapper_host.display())))?;

        let wrapper_inner = format!("/tmp/{wrapper_name}");

        let mut cmd = if unshare_available() {
            let mut cmd = Command::new("unshare");
            cmd.arg("--mount")
                .arg("--pid")
                .arg("--fork")
                .arg("chroot")
                .arg(root)
                .arg("/bin/bash")
                .arg(&wrapper_inner);
            cmd
        } else {
            let mut cmd = Command::new("chroot");
            cmd.arg(root).arg("/bin/bash").arg(&wrapper_inner);
            cmd
        };

        cmd.env_clear();
        for key in CHROOT_KEEP_ENV {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }

        debug!(root = %root.display(), wrapper = %wrapper_inner, "prepared chroot command");
        Ok(cmd)
    }
}

fn binary_on_path(name: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(name).is_file())
        })
        .unwrap_or(false)
}

fn fakeroot_available() -> bool {
    binary_on_path("fakeroot")
}

fn unshare_available() -> bool {
    binary_on_path("unshare")
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// One virtual filesystem mount
#[derive(Debug, Clone)]
pub struct MountSpec {
    pub source: PathBuf,
    pub target: PathBuf,
    pub fstype: Option<&'static str>,
    pub flags: MsFlags,
    pub data: Option<&'static str>,
}

/// The virtual filesystems a chroot batch needs, in mount order.
pub fn mount_plan(root: &Path) -> Vec<MountSpec> {
    vec![
        MountSpec {
            source: PathBuf::from("/dev"),
            target: root.join("dev"),
            fstype: None,
            flags: MsFlags::MS_BIND | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            data: None,
        },
        MountSpec {
            source: PathBuf::from("/dev/pts"),
            target: root.join("dev/pts"),
            fstype: None,
            flags: MsFlags::MS_BIND | MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
            data: None,
        },
        MountSpec {
            source: PathBuf::from("proc"),
            target: root.join("proc"),
            fstype: Some("proc"),
            flags: MsFlags::empty(),
            data: None,
        },
        MountSpec {
            source: PathBuf::from("sysfs"),
            target: root.join("sys"),
            fstype: Some("sysfs"),
            flags: MsFlags::empty(),
            data: None,
        },
        MountSpec {
            source: PathBuf::from("tmpfs"),
            target: root.join("run"),
            fstype: Some("tmpfs"),
            flags: MsFlags::empty(),
            data: Some("mode=0755"),
        },
    ]
}

/// Chroot session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Mounting,
    Ready,
    Running,
    Unmounting,
    /// Absorbing error state; `cleanup` is required before reuse
    Failed,
}

/// A chroot session owning the mount stack for one batch of builds
pub struct ChrootSession {
    root: PathBuf,
    locks: LockRegistry,
    plan: Vec<MountSpec>,
    /// Successful mounts, in mount order
    stack: Vec<MountSpec>,
    state: SessionState,
}

impl ChrootSession {
    pub fn new(root: impl Into<PathBuf>, locks: LockRegistry) -> Self {
        let root = root.into();
        let plan = mount_plan(&root);
        Self {
            root,
            locks,
            plan,
            stack: Vec::new(),
            state: SessionState::Idle,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_plan(root: impl Into<PathBuf>, locks: LockRegistry, plan: Vec<MountSpec>) -> Self {
        Self {
            root: root.into(),
            locks,
            plan,
            stack: Vec::new(),
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Mount the virtual filesystems for a chroot batch. Holds the global
    /// destructive lock for the duration of the batch operation.
    pub fn mount_all(&mut self) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(Error::MountError(format!(
                "cannot mount from state {:?}",
                self.state
            )));
        }

        let _global = self.locks.acquire_global()?;
        self.state = SessionState::Mounting;

        for spec in self.plan.clone() {
            if let Err(e) = do_mount(&spec) {
                self.state = SessionState::Failed;
                return Err(e);
            }
            debug!(target = %spec.target.display(), "mounted");
            self.stack.push(spec);
        }

        self.state = SessionState::Ready;
        info!(root = %self.root.display(), mounts = self.stack.len(), "chroot session ready");
        Ok(())
    }

    /// Mark a command execution in progress. Individual executions only
    /// need the session, not the global lock.
    pub fn begin_run(&mut self) -> Result<()> {
        if self.state != SessionState::Ready {
            return Err(Error::MountError(format!(
                "cannot run from state {:?}",
                self.state
            )));
        }
        self.state = SessionState::Running;
        Ok(())
    }

    pub fn end_run(&mut self) {
        if self.state == SessionState::Running {
            self.state = SessionState::Ready;
        }
    }

    /// Unwind the mount stack in strict reverse order of successful mounts.
    /// Busy mounts fail the batch unless `force` enables lazy detach.
    pub fn unmount_all(&mut self, force: bool) -> Result<()> {
        if self.state != SessionState::Ready {
            return Err(Error::MountError(format!(
                "cannot unmount from state {:?}",
                self.state
            )));
        }

        let _global = self.locks.acquire_global()?;
        self.state = SessionState::Unmounting;

        while let Some(spec) = self.stack.pop() {
            if let Err(e) = do_umount(&spec.target, force) {
                // Put it back so cleanup sees the remaining stack.
                self.stack.push(spec);
                self.state = SessionState::Failed;
                return Err(e);
            }
            debug!(target = %spec.target.display(), "unmounted");
        }

        self.state = SessionState::Idle;
        info!(root = %self.root.display(), "chroot session unwound");
        Ok(())
    }

    /// Recover from `Failed`: force-unwind whatever is still mounted and
    /// return to `Idle`.
    pub fn cleanup(&mut self) -> Result<()> {
        if self.state != SessionState::Failed {
            return Err(Error::MountError(format!(
                "cleanup only applies to a failed session (state {:?})",
                self.state
            )));
        }

        let _global = self.locks.acquire_global()?;

        while let Some(spec) = self.stack.pop() {
            if let Err(e) = do_umount(&spec.target, true) {
                warn!(target = %spec.target.display(), error = %e, "cleanup unmount failed");
            }
        }

        self.state = SessionState::Idle;
        Ok(())
    }
}

fn do_mount(spec: &MountSpec) -> Result<()> {
    std::fs::create_dir_all(&spec.target)
        .map_err(|e| Error::MountError(format!("create {}: {e}", spec.target.display())))?;

    mount(
        Some(spec.source.as_path()),
        spec.target.as_path(),
        spec.fstype,
        spec.flags,
        spec.data,
    )
    .map_err(|e| {
        Error::MountError(format!(
            "mount {} -> {}: {e}",
            spec.source.display(),
            spec.target.display()
        ))
    })
}

fn do_umount(target: &Path, force: bool) -> Result<()> {
    match umount2(target, MntFlags::empty()) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EBUSY) if force => {
            warn!(target = %target.display(), "busy, detaching lazily");
            umount2(target, MntFlags::MNT_DETACH)
                .map_err(|e| Error::MountError(format!("lazy detach {}: {e}", target.display())))
        }
        Err(e) => Err(Error::MountError(format!(
            "unmount {}: {e}",
            target.display()
        ))),
    }
}
