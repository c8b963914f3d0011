// src/config.rs

//! Orchestrator configuration
//!
//! A flat TOML mapping consumed once at startup. Every knob has a default;
//! a missing config file is not an error.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Global execution-mode override for all recipes in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModeOverride {
    /// Honor each recipe's `build.mode`.
    #[default]
    Auto,
    Direct,
    Fakeroot,
    Chroot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the on-disk tree (sources, build, packages, state, logs).
    pub root: PathBuf,

    /// Directory holding recipe files.
    pub recipes: PathBuf,

    /// Worker slots for the scheduler. 0 means host CPU count.
    pub concurrency: usize,

    /// Wall-clock timeout per phase, seconds.
    pub timeout: u64,

    /// Retries per phase after the first failure.
    pub retries: u32,

    /// Initial retry backoff, seconds; doubles per attempt.
    pub retry_backoff: u64,

    /// Strip installed binaries unless a recipe opts out.
    pub strip_binaries: bool,

    /// Compression of packaged artifacts. Only `xz` is supported; the key
    /// exists so future formats fail loudly instead of silently.
    pub archive_compression: String,

    /// Target root for chroot-mode builds.
    pub chroot_root: Option<PathBuf>,

    /// Global execution-mode override applied on top of recipe modes.
    pub mode: ModeOverride,

    /// Quarantine the workspace when a package fails. Disable to keep the
    /// workspace in place for debugging.
    pub quarantine_on_failure: bool,

    /// Replacement silent-failure pattern set (regexes, case-insensitive).
    /// Empty means the built-in defaults.
    pub silent_patterns: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        let concurrency = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(4);

        Self {
            root: PathBuf::from("/var/lib/smelt"),
            recipes: PathBuf::from("/var/lib/smelt/recipes"),
            concurrency,
            timeout: 7200,
            retries: 2,
            retry_backoff: 5,
            strip_binaries: true,
            archive_compression: "xz".to_string(),
            chroot_root: None,
            mode: ModeOverride::Auto,
            quarantine_on_failure: true,
            silent_patterns: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("read {}: {e}", path.display())))?;

        let config: Self = toml::from_str(&contents)
            .map_err(|e| Error::ConfigError(format!("parse {}: {e}", path.display())))?;

        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<()> {
        if self.archive_compression != "xz" {
            return Err(Error::ConfigError(format!(
                "unsupported archive_compression '{}' (only xz)",
                self.archive_compression
            )));
        }
        Ok(())
    }

    /// Effective worker count (0 resolves to host CPU count).
    pub fn effective_concurrency(&self) -> usize {
        if self.concurrency == 0 {
            std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4)
        } else {
            self.concurrency
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.effective_concurrency() > 0);
        assert_eq!(config.timeout, 7200);
        assert_eq!(config.retry_backoff, 5);
        assert!(config.strip_binaries);
        assert!(config.quarantine_on_failure);
        assert_eq!(config.mode, ModeOverride::Auto);
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("smelt.toml");
        std::fs::write(
            &path,
            r#"
root = "/tmp/smelt-test"
concurrency = 3
timeout = 60
mode = "fakeroot"
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.root, PathBuf::from("/tmp/smelt-test"));
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.timeout, 60);
        assert_eq!(config.mode, ModeOverride::Fakeroot);
        // Untouched keys keep defaults
        assert_eq!(config.retries, 2);
    }

    #[test]
    fn test_unknown_compression_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("smelt.toml");
        std::fs::write(&path, "archive_compression = \"zst\"\n").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_missing_file_defaults() {
        let config = Config::load_or_default(Path::new("/nonexistent/smelt.toml")).unwrap();
        assert_eq!(config.root, PathBuf::from("/var/lib/smelt"));
    }
}
