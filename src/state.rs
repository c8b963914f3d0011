// src/state.rs

//! Durable per-package state records
//!
//! One YAML file per `(state kind, package)` under `state/<kind>.d/`. These
//! records are the resumption authority: a package whose last recorded build
//! status is `ok` is skipped by `--continue`, anything else restarts from
//! scratch. Writes are atomic (temp file in the same directory, then rename)
//! and serialized by the per-package lock; reads are lock-free.

use crate::error::{Error, Result};
use crate::layout::{Layout, StateKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// Terminal and transient package statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    Failed,
    Skipped,
    InProgress,
}

impl Status {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::InProgress => "in_progress",
        }
    }
}

/// A fetched source as recorded in state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRecord {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// The packaged artifact as recorded in state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub path: String,
    pub sha256: String,
}

/// One durable per-package record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageState {
    pub package: String,
    pub status: Status,
    /// Last attempted phase
    pub phase: String,
    /// Failure or skip reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Sources with verified checksums
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceRecord>,
    /// Short commit id for git sources
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_artifact: Option<ArtifactRecord>,
}

impl PackageState {
    pub fn new(package: &str, status: Status, phase: &str) -> Self {
        Self {
            package: package.to_string(),
            status,
            phase: phase.to_string(),
            reason: None,
            timestamp: Utc::now(),
            version: None,
            sources: Vec::new(),
            commit: None,
            package_artifact: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }
}

/// Store for durable per-package state
#[derive(Clone)]
pub struct StateStore {
    layout: Arc<Layout>,
}

impl StateStore {
    pub fn new(layout: Arc<Layout>) -> Self {
        Self { layout }
    }

    /// Read one package's state. `None` means never attempted.
    pub fn read(&self, kind: StateKind, pkg: &str) -> Result<Option<PackageState>> {
        let path = self.layout.state_file(kind, pkg);
        if !path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(&path)
            .map_err(|e| Error::IoError(format!("read state {}: {e}", path.display())))?;
        let state = serde_yaml::from_str(&contents)
            .map_err(|e| Error::SchemaError(format!("corrupt state {}: {e}", path.display())))?;
        Ok(Some(state))
    }

    /// Write one package's state atomically: temp file in the state
    /// directory, fsync, rename over the final name.
    pub fn write(&self, kind: StateKind, state: &PackageState) -> Result<()> {
        let dir = self.layout.state_dir(kind);
        fs::create_dir_all(&dir)
            .map_err(|e| Error::IoError(format!("create state dir: {e}")))?;

        let final_path = self.layout.state_file(kind, &state.package);
        let body = serde_yaml::to_string(state)?;
        atomic_write(&dir, &final_path, body.as_bytes())
    }

    /// Remove one package's state record, if present.
    pub fn clear(&self, kind: StateKind, pkg: &str) -> Result<()> {
        let path = self.layout.state_file(kind, pkg);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::IoError(format!(
                "remove state {}: {e}",
                path.display()
            ))),
        }
    }

    /// Read every record of one kind, sorted by package name.
    pub fn read_all(&self, kind: StateKind) -> Result<BTreeMap<String, PackageState>> {
        let dir = self.layout.state_dir(kind);
        let mut all = BTreeMap::new();
        if !dir.exists() {
            return Ok(all);
        }

        for entry in fs::read_dir(&dir)
            .map_err(|e| Error::IoError(format!("read state dir {}: {e}", dir.display())))?
        {
            let path = entry
                .map_err(|e| Error::IoError(e.to_string()))?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("yml") {
                continue;
            }
            let contents = fs::read_to_string(&path)
                .map_err(|e| Error::IoError(format!("read {}: {e}", path.display())))?;
            let state: PackageState = serde_yaml::from_str(&contents)
                .map_err(|e| Error::SchemaError(format!("corrupt state {}: {e}", path.display())))?;
            all.insert(state.package.clone(), state);
        }

        Ok(all)
    }

    /// Regenerate the merged snapshot for one kind: every per-package record
    /// concatenated under a top-level `packages` mapping, keys sorted, so
    /// snapshotting twice yields identical bytes.
    pub fn merge_snapshot(&self, kind: StateKind) -> Result<()> {
        let all = self.read_all(kind)?;

        #[derive(Serialize)]
        struct Snapshot {
            packages: BTreeMap<String, PackageState>,
        }

        let body = serde_yaml::to_string(&Snapshot { packages: all })?;
        let dir = self.layout.state_root();
        fs::create_dir_all(&dir)
            .map_err(|e| Error::IoError(format!("create state root: {e}")))?;
        atomic_write(&dir, &self.layout.snapshot_file(kind), body.as_bytes())
    }
}

/// Temp-file-then-rename write. The temp file lives in `dir` (same
/// filesystem as the destination) so the rename is atomic.
fn atomic_write(dir: &Path, final_path: &Path, body: &[u8]) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| Error::IoError(format!("create temp state file: {e}")))?;
    tmp.write_all(body)
        .map_err(|e| Error::IoError(format!("write temp state file: {e}")))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| Error::IoError(format!("sync temp state file: {e}")))?;
    tmp.persist(final_path)
        .map_err(|e| Error::IoError(format!("persist {}: {e}", final_path.display())))?;

    // Persist the directory entry as well; not all filesystems support
    // fsync on directories, so failures are ignored.
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
    Ok(())
}
