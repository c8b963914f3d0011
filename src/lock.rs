// src/lock.rs

//! Advisory inter-process locks keyed by `(phase, package)`
//!
//! Locks are `flock(2)`-based: exclusive, advisory (cooperating processes
//! only), non-reentrant, and held for the lifetime of the handle. Each lock
//! file carries a `pid timestamp` line as a human-readable hint; the hint is
//! not authoritative, the flock is.
//!
//! A separate global lock excludes all other lock holders during destructive
//! fleet-wide operations (the isolation manager holds it across mount and
//! unmount batches).

use crate::error::{Error, Result};
use crate::layout::Layout;
use chrono::Utc;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// An acquired lock. Released on drop (or explicitly via `release`).
pub struct LockHandle {
    file: File,
    path: PathBuf,
}

impl LockHandle {
    fn new(file: File, path: PathBuf) -> Result<Self> {
        let handle = Self { file, path };
        handle.write_hint()?;
        Ok(handle)
    }

    /// Record `pid timestamp` in the lock file as a hint for humans
    /// inspecting the lock directory.
    fn write_hint(&self) -> Result<()> {
        let mut file = &self.file;
        file.set_len(0)?;
        writeln!(file, "{} {}", std::process::id(), Utc::now().to_rfc3339())?;
        Ok(())
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Release explicitly. Equivalent to dropping the handle.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        debug!(path = %self.path.display(), "released lock");
    }
}

/// Grants per-`(phase, package)` locks plus the global destructive lock.
#[derive(Clone)]
pub struct LockRegistry {
    layout: Arc<Layout>,
}

impl LockRegistry {
    pub fn new(layout: Arc<Layout>) -> Self {
        Self { layout }
    }

    fn open_lock_file(&self, path: &PathBuf) -> Result<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::IoError(format!("create lock dir: {e}")))?;
        }
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::IoError(format!("open lock {}: {e}", path.display())))
    }

    /// Try to acquire without blocking. `Ok(None)` means another process
    /// holds the lock; that is not an error.
    pub fn try_acquire(&self, phase: &str, pkg: &str) -> Result<Option<LockHandle>> {
        let path = self.layout.lock_file(phase, pkg);
        let file = self.open_lock_file(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(phase, pkg, "acquired lock");
                Ok(Some(LockHandle::new(file, path)?))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                debug!(phase, pkg, "lock busy");
                Ok(None)
            }
            Err(e) => Err(Error::IoError(format!(
                "try-acquire {}: {e}",
                path.display()
            ))),
        }
    }

    /// Acquire, blocking until the lock is free. Fails only on I/O errors
    /// against the lock directory.
    pub fn acquire(&self, phase: &str, pkg: &str) -> Result<LockHandle> {
        let path = self.layout.lock_file(phase, pkg);
        let file = self.open_lock_file(&path)?;

        file.lock_exclusive()
            .map_err(|e| Error::IoError(format!("acquire {}: {e}", path.display())))?;

        debug!(phase, pkg, "acquired lock (blocking)");
        LockHandle::new(file, path)
    }

    /// Acquire the fleet-wide destructive-operation lock, blocking.
    pub fn acquire_global(&self) -> Result<LockHandle> {
        let path = self.layout.global_lock_file();
        let file = self.open_lock_file(&path)?;

        file.lock_exclusive()
            .map_err(|e| Error::IoError(format!("acquire global lock: {e}")))?;

        debug!("acquired global lock");
        LockHandle::new(file, path)
    }
}
