// src/error.rs

//! Error types for the smelt build orchestrator
//!
//! A single crate-wide error enum keeps cross-module propagation simple.
//! The `reason_code()` mapping is what ends up in per-package state files
//! (`reason: silent_error`, `reason: checksum-mismatch`, ...), so its values
//! are part of the on-disk contract and must stay stable.

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    // Load-time errors: these abort the whole run.
    #[error("recipe not found: {0}")]
    RecipeNotFound(String),

    #[error("schema error: {0}")]
    SchemaError(String),

    #[error("dependency cycle detected: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    #[error("configuration error: {0}")]
    ConfigError(String),

    // Lock contention is not a failure: another process owns the package.
    #[error("locked: {phase}-{package} is held by another process")]
    Locked { phase: String, package: String },

    // Per-source errors.
    #[error("fetch failed: {0}")]
    FetchFailed(String),

    #[error("all mirrors failed for {url}")]
    AllMirrorsFailed { url: String },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("unsupported checksum: {0}")]
    UnsupportedChecksum(String),

    #[error("git fetch failed: {0}")]
    GitFetchFailed(String),

    // Workspace errors.
    #[error("extraction failed: {0}")]
    ExtractFailed(String),

    #[error("patch rejected: {0}")]
    PatchRejected(String),

    // Phase execution errors. `retries` applies before these become terminal.
    #[error("{phase} phase failed: {message}")]
    PhaseFailed { phase: String, message: String },

    #[error("{phase} phase reported success but the log matched '{pattern}'")]
    SilentError { phase: String, pattern: String },

    #[error("{phase} phase timed out after {seconds}s")]
    TimedOut { phase: String, seconds: u64 },

    // Late-phase errors.
    #[error("packaging failed: {0}")]
    PackageFailed(String),

    #[error("install verification failed: {0}")]
    InstallVerificationFailed(String),

    #[error("hook {hook} failed: {message}")]
    HookFailed { hook: String, message: String },

    #[error("isolation unavailable: {0}")]
    IsolationUnavailable(String),

    #[error("mount operation failed: {0}")]
    MountError(String),

    #[error("run interrupted")]
    Interrupted,

    #[error("I/O error: {0}")]
    IoError(String),
}

impl Error {
    /// Stable reason code recorded in per-package state files.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Error::RecipeNotFound(_) => "recipe-not-found",
            Error::SchemaError(_) => "schema-error",
            Error::CycleDetected(_) => "cycle-detected",
            Error::ConfigError(_) => "config-error",
            Error::Locked { .. } => "locked",
            Error::FetchFailed(_) | Error::AllMirrorsFailed { .. } => "fetch-failed",
            Error::ChecksumMismatch { .. } => "checksum-mismatch",
            Error::UnsupportedChecksum(_) => "unsupported-checksum",
            Error::GitFetchFailed(_) => "git-fetch-failed",
            Error::ExtractFailed(_) => "extract-failed",
            Error::PatchRejected(_) => "patch-rejected",
            Error::PhaseFailed { phase, .. } => match phase.as_str() {
                "configure" => "configure-failed",
                "make" => "make-failed",
                "install" => "install-failed",
                _ => "phase-failed",
            },
            Error::SilentError { .. } => "silent_error",
            Error::TimedOut { .. } => "timed-out",
            Error::PackageFailed(_) => "package-failed",
            Error::InstallVerificationFailed(_) => "install-verification-failed",
            Error::HookFailed { .. } => "hook-failed",
            Error::IsolationUnavailable(_) => "isolation-unavailable",
            Error::MountError(_) => "mount-error",
            Error::Interrupted => "interrupted",
            Error::IoError(_) => "io-error",
        }
    }

    /// Whether retrying the same phase might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::PhaseFailed { .. } | Error::TimedOut { .. } | Error::SilentError { .. }
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::SchemaError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes_stable() {
        let err = Error::SilentError {
            phase: "make".to_string(),
            pattern: "error:".to_string(),
        };
        assert_eq!(err.reason_code(), "silent_error");

        let err = Error::PhaseFailed {
            phase: "configure".to_string(),
            message: "exit 1".to_string(),
        };
        assert_eq!(err.reason_code(), "configure-failed");

        let err = Error::Locked {
            phase: "build".to_string(),
            package: "gcc".to_string(),
        };
        assert_eq!(err.reason_code(), "locked");
    }

    #[test]
    fn test_cycle_display_names_members() {
        let err = Error::CycleDetected(vec!["a".into(), "b".into(), "a".into()]);
        let msg = err.to_string();
        assert!(msg.contains("a -> b -> a"));
    }

    #[test]
    fn test_retryable() {
        assert!(Error::TimedOut {
            phase: "make".into(),
            seconds: 10
        }
        .is_retryable());
        assert!(!Error::PatchRejected("p.patch".into()).is_retryable());
    }
}
