// src/install.rs

//! Installing packaged artifacts into a target root
//!
//! Installation is backup-before-overwrite: the target root is snapshotted
//! into `.backup/<pkg>-<timestamp>/` before the artifact is unpacked, and
//! any failure during extraction or verification restores the snapshot.
//! Installers for different packages may run concurrently against the same
//! root; the per-package install lock serializes same-package installs.

use crate::error::{Error, Result};
use crate::extract;
use crate::fsutil;
use crate::layout::{Layout, StateKind};
use crate::lock::LockRegistry;
use crate::package;
use crate::pipeline::Outcome;
use crate::state::{ArtifactRecord, PackageState, StateStore, Status};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Options for one install run
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Verify the artifact against its sidecar and stop.
    pub verify_only: bool,
    /// Report what would happen without touching the target root.
    pub dry_run: bool,
}

/// Applies built artifacts to a target root with rollback
pub struct Installer {
    layout: Arc<Layout>,
    locks: LockRegistry,
    state: StateStore,
}

impl Installer {
    pub fn new(layout: Arc<Layout>, locks: LockRegistry, state: StateStore) -> Self {
        Self {
            layout,
            locks,
            state,
        }
    }

    /// Install one built package into `target_root`.
    pub fn install(
        &self,
        name: &str,
        version: &str,
        target_root: &Path,
        options: &InstallOptions,
    ) -> Outcome {
        let artifact = self.layout.artifact(name, version);

        // No parallel installer for the same package.
        let _lock = match self.locks.try_acquire("install", name) {
            Ok(Some(handle)) => handle,
            Ok(None) => {
                info!(pkg = name, "install locked by another process, skipping");
                return Outcome::Skipped {
                    reason: "locked".to_string(),
                    satisfies_dependents: false,
                };
            }
            Err(e) => {
                return Outcome::Failed {
                    phase: "install".to_string(),
                    reason: e.reason_code().to_string(),
                }
            }
        };

        match self.run(name, version, &artifact, target_root, options) {
            Ok(outcome) => outcome,
            Err(e) => {
                let state = PackageState::new(name, Status::Failed, "install")
                    .with_version(version)
                    .with_reason(e.reason_code());
                if let Err(we) = self.state.write(StateKind::Install, &state) {
                    warn!(pkg = name, error = %we, "install state write failed");
                }
                Outcome::Failed {
                    phase: "install".to_string(),
                    reason: e.reason_code().to_string(),
                }
            }
        }
    }

    fn run(
        &self,
        name: &str,
        version: &str,
        artifact: &Path,
        target_root: &Path,
        options: &InstallOptions,
    ) -> Result<Outcome> {
        if !artifact.exists() {
            return Err(Error::PackageFailed(format!(
                "artifact {} not found (build it first)",
                artifact.display()
            )));
        }

        let digest = package::verify_artifact(artifact)?;

        // A matching completed install is not repeated.
        if let Some(prior) = self.state.read(StateKind::Install, name)? {
            if prior.status == Status::Ok
                && prior
                    .package_artifact
                    .as_ref()
                    .map(|a| a.sha256 == digest)
                    .unwrap_or(false)
            {
                debug!(pkg = name, "already installed, skipping");
                return Ok(Outcome::Skipped {
                    reason: "already-installed".to_string(),
                    satisfies_dependents: true,
                });
            }
        }

        if options.verify_only {
            info!(pkg = name, %digest, "artifact verified");
            return Ok(Outcome::Ok);
        }
        if options.dry_run {
            info!(
                pkg = name,
                target = %target_root.display(),
                "dry run: would install {}",
                artifact.display()
            );
            return Ok(Outcome::Ok);
        }

        std::fs::create_dir_all(target_root)
            .map_err(|e| Error::IoError(format!("create {}: {e}", target_root.display())))?;

        let started = SystemTime::now();
        let backup = self.take_backup(name, target_root)?;

        let result = extract::extract_fresh_mtime(artifact, target_root)
            .map_err(|e| Error::PackageFailed(format!("unpack into target root: {e}")))
            .and_then(|()| verify_fresh_files(target_root, started));

        match result {
            Ok(()) => {
                let mut state =
                    PackageState::new(name, Status::Ok, "install").with_version(version);
                state.package_artifact = Some(ArtifactRecord {
                    path: artifact.display().to_string(),
                    sha256: digest,
                });
                self.state.write(StateKind::Install, &state)?;
                info!(pkg = name, target = %target_root.display(), "installed");
                Ok(Outcome::Ok)
            }
            Err(e) => {
                warn!(pkg = name, error = %e, "install failed, restoring pre-image");
                self.restore_backup(&backup, target_root)?;
                Err(e)
            }
        }
    }

    /// Full pre-image snapshot of the target root (minus prior backups).
    fn take_backup(&self, name: &str, target_root: &Path) -> Result<PathBuf> {
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let backup = target_root
            .join(".backup")
            .join(format!("{name}-{stamp}"));
        std::fs::create_dir_all(&backup)
            .map_err(|e| Error::IoError(format!("create {}: {e}", backup.display())))?;

        for entry in std::fs::read_dir(target_root)
            .map_err(|e| Error::IoError(format!("read {}: {e}", target_root.display())))?
        {
            let entry = entry.map_err(|e| Error::IoError(e.to_string()))?;
            if entry.file_name() == ".backup" {
                continue;
            }
            let from = entry.path();
            let to = backup.join(entry.file_name());
            if from.is_dir() {
                fsutil::copy_dir_recursive(&from, &to)?;
            } else {
                std::fs::copy(&from, &to)
                    .map_err(|e| Error::IoError(format!("backup {}: {e}", from.display())))?;
            }
        }

        debug!(pkg = name, backup = %backup.display(), "pre-image snapshot taken");
        Ok(backup)
    }

    /// Put the target root back to exactly the pre-image. The failed unpack
    /// may have written files with no counterpart in the snapshot, so the
    /// current contents are cleared before the snapshot is copied back; an
    /// overlay copy alone would leave those strays behind.
    fn restore_backup(&self, backup: &Path, target_root: &Path) -> Result<()> {
        for entry in std::fs::read_dir(target_root)
            .map_err(|e| Error::IoError(format!("read {}: {e}", target_root.display())))?
        {
            let entry = entry.map_err(|e| Error::IoError(e.to_string()))?;
            if entry.file_name() == ".backup" {
                continue;
            }
            let path = entry.path();
            let file_type = entry
                .file_type()
                .map_err(|e| Error::IoError(e.to_string()))?;
            if file_type.is_dir() {
                std::fs::remove_dir_all(&path)
                    .map_err(|e| Error::IoError(format!("clear {}: {e}", path.display())))?;
            } else {
                std::fs::remove_file(&path)
                    .map_err(|e| Error::IoError(format!("clear {}: {e}", path.display())))?;
            }
        }

        fsutil::copy_dir_recursive(backup, target_root)?;
        info!(backup = %backup.display(), "pre-image restored");
        Ok(())
    }
}

/// Default integrity predicate: the install left at least one regular file
/// in the target root (outside `.backup`) with a recent mtime.
fn verify_fresh_files(target_root: &Path, since: SystemTime) -> Result<()> {
    let fresh = WalkDir::new(target_root)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".backup")
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .any(|e| {
            e.metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .map(|mtime| mtime >= since)
                .unwrap_or(false)
        });

    if !fresh {
        return Err(Error::InstallVerificationFailed(
            "no new files under target root".to_string(),
        ));
    }
    Ok(())
}
