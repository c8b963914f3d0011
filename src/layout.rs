// src/layout.rs

//! Canonical on-disk layout for the orchestrator
//!
//! Every absolute path the orchestrator touches is constructed here; no
//! other module builds paths from the root on its own. The tree:
//!
//! ```text
//! <root>/sources/<pkg>/<filename>          fetched source artifacts (cached)
//! <root>/sources/.corrupted/               quarantine for partial/bad files
//! <root>/build/<pkg>/{src,build,destdir}   ephemeral workspaces
//! <root>/packages/<name>-<version>.tar.xz  packaged artifacts (+ .sha256)
//! <root>/state/<phase>.d/<pkg>.yml         per-package state records
//! <root>/state/<phase>.yml                 merged snapshots
//! <root>/state/locks/<phase>-<pkg>.lock    advisory lock files
//! <root>/logs/<pkg>/<phase>.log            captured phase output
//! <root>/hooks/                            shared hook scripts
//! ```

use crate::error::{Error, Result};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};

/// The state record groups: each pipeline stage family persists into its
/// own `state/<kind>.d/` directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKind {
    Fetch,
    Extract,
    Build,
    Install,
}

impl StateKind {
    pub const ALL: [StateKind; 4] = [
        StateKind::Fetch,
        StateKind::Extract,
        StateKind::Build,
        StateKind::Install,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Extract => "extract",
            Self::Build => "build",
            Self::Install => "install",
        }
    }
}

/// Per-package workspace triple
#[derive(Debug, Clone)]
pub struct Workspace {
    /// Root of the workspace (`<root>/build/<pkg>`)
    pub root: PathBuf,
    /// Extracted sources
    pub src: PathBuf,
    /// Out-of-tree build directory (may equal `src` for in-tree builds)
    pub build: PathBuf,
    /// Staged install root
    pub destdir: PathBuf,
}

impl Workspace {
    /// Path of the per-package environment file sourced by phase commands.
    pub fn env_file(&self) -> PathBuf {
        self.root.join("env.sh")
    }
}

/// Owner of the canonical directory tree
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Materialize the full directory tree. Idempotent.
    pub fn ensure(&self) -> Result<()> {
        let mut dirs = vec![
            self.sources_root(),
            self.quarantine_dir(),
            self.build_root(),
            self.packages_dir(),
            self.lock_dir(),
            self.logs_root(),
            self.hooks_dir(),
        ];
        for kind in StateKind::ALL {
            dirs.push(self.state_dir(kind));
        }

        for dir in dirs {
            fs::create_dir_all(&dir)
                .map_err(|e| Error::IoError(format!("create {}: {e}", dir.display())))?;
        }
        Ok(())
    }

    pub fn sources_root(&self) -> PathBuf {
        self.root.join("sources")
    }

    /// Sources cache directory for one package.
    pub fn sources(&self, pkg: &str) -> PathBuf {
        self.sources_root().join(pkg)
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.sources_root().join(".corrupted")
    }

    pub fn build_root(&self) -> PathBuf {
        self.root.join("build")
    }

    /// The workspace triple for one package.
    pub fn workspace(&self, pkg: &str) -> Workspace {
        let root = self.build_root().join(pkg);
        Workspace {
            src: root.join("src"),
            build: root.join("build"),
            destdir: root.join("destdir"),
            root,
        }
    }

    pub fn packages_dir(&self) -> PathBuf {
        self.root.join("packages")
    }

    /// Path of the packaged artifact for `(name, version)`.
    pub fn artifact(&self, name: &str, version: &str) -> PathBuf {
        self.packages_dir().join(format!("{name}-{version}.tar.xz"))
    }

    pub fn state_root(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn state_dir(&self, kind: StateKind) -> PathBuf {
        self.state_root().join(format!("{}.d", kind.as_str()))
    }

    pub fn state_file(&self, kind: StateKind, pkg: &str) -> PathBuf {
        self.state_dir(kind).join(format!("{pkg}.yml"))
    }

    /// Merged snapshot for one state kind.
    pub fn snapshot_file(&self, kind: StateKind) -> PathBuf {
        self.state_root().join(format!("{}.yml", kind.as_str()))
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.state_root().join("locks")
    }

    pub fn lock_file(&self, phase: &str, pkg: &str) -> PathBuf {
        self.lock_dir().join(format!("{phase}-{pkg}.lock"))
    }

    /// The fleet-wide destructive-operation lock.
    pub fn global_lock_file(&self) -> PathBuf {
        self.lock_dir().join("global.lock")
    }

    pub fn logs_root(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn log_dir(&self, pkg: &str) -> PathBuf {
        self.logs_root().join(pkg)
    }

    pub fn log_file(&self, pkg: &str, phase: &str) -> PathBuf {
        self.log_dir(pkg).join(format!("{phase}.log"))
    }

    pub fn hooks_dir(&self) -> PathBuf {
        self.root.join("hooks")
    }

    /// Move a partial or corrupted artifact into quarantine under a
    /// timestamped name. Returns the quarantine path. The original path no
    /// longer exists afterwards.
    pub fn corrupted_quarantine(&self, path: &Path) -> Result<PathBuf> {
        let quarantine = self.quarantine_dir();
        fs::create_dir_all(&quarantine)
            .map_err(|e| Error::IoError(format!("create quarantine dir: {e}")))?;

        let basename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("artifact");
        let stamp = Utc::now().format("%Y%m%d%H%M%S%.3f");
        let dest = quarantine.join(format!("{basename}.{stamp}"));

        fs::rename(path, &dest).map_err(|e| {
            Error::IoError(format!(
                "quarantine {} -> {}: {e}",
                path.display(),
                dest.display()
            ))
        })?;

        tracing::warn!(
            from = %path.display(),
            to = %dest.display(),
            "quarantined corrupted artifact"
        );
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_ensure_creates_tree() {
        let tmp = TempDir::new().unwrap();
        let layout = Layout::new(tmp.path());
        layout.ensure().unwrap();

        assert!(layout.sources_root().is_dir());
        assert!(layout.quarantine_dir().is_dir());
        assert!(layout.packages_dir().is_dir());
        assert!(layout.lock_dir().is_dir());
        for kind in StateKind::ALL {
            assert!(layout.state_dir(kind).is_dir());
        }
    }

    #[test]
    fn test_workspace_paths() {
        let layout = Layout::new("/var/lib/smelt");
        let ws = layout.workspace("zlib");
        assert_eq!(ws.src, PathBuf::from("/var/lib/smelt/build/zlib/src"));
        assert_eq!(ws.destdir, PathBuf::from("/var/lib/smelt/build/zlib/destdir"));
        assert_eq!(ws.env_file(), PathBuf::from("/var/lib/smelt/build/zlib/env.sh"));
    }

    #[test]
    fn test_state_and_lock_paths() {
        let layout = Layout::new("/r");
        assert_eq!(
            layout.state_file(StateKind::Build, "gcc"),
            PathBuf::from("/r/state/build.d/gcc.yml")
        );
        assert_eq!(
            layout.snapshot_file(StateKind::Fetch),
            PathBuf::from("/r/state/fetch.yml")
        );
        assert_eq!(
            layout.lock_file("build", "gcc"),
            PathBuf::from("/r/state/locks/build-gcc.lock")
        );
        assert_eq!(
            layout.artifact("zlib", "1.3.1"),
            PathBuf::from("/r/packages/zlib-1.3.1.tar.xz")
        );
    }

    #[test]
    fn test_quarantine_moves_file() {
        let tmp = TempDir::new().unwrap();
        let layout = Layout::new(tmp.path());
        layout.ensure().unwrap();

        let victim = tmp.path().join("sources").join("bad.tar.gz");
        std::fs::write(&victim, b"garbage").unwrap();

        let dest = layout.corrupted_quarantine(&victim).unwrap();
        assert!(!victim.exists());
        assert!(dest.exists());
        assert!(dest.starts_with(layout.quarantine_dir()));
        assert!(dest
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("bad.tar.gz."));
    }

    #[test]
    fn test_quarantine_moves_directory() {
        let tmp = TempDir::new().unwrap();
        let layout = Layout::new(tmp.path());
        layout.ensure().unwrap();

        let ws = layout.workspace("broken");
        std::fs::create_dir_all(&ws.src).unwrap();
        std::fs::write(ws.src.join("file"), b"x").unwrap();

        let dest = layout.corrupted_quarantine(&ws.root).unwrap();
        assert!(!ws.root.exists());
        assert!(dest.join("src").join("file").exists());
    }
}
