// src/recipe/format.rs

//! Recipe schema definitions
//!
//! Unknown fields are ignored so fleets can carry annotations the
//! orchestrator does not consume. Unknown values in enumerated fields
//! (`build.mode`) fail loading with a schema error.

use serde::{Deserialize, Serialize};

/// A complete recipe for building one package
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    /// Package name, unique within the fleet
    pub name: String,

    /// Package version; `(name, version)` is the registration key
    pub version: String,

    /// Ordered source entries. Order defines patch application order.
    #[serde(default)]
    pub sources: Vec<SourceEntry>,

    /// Build-order dependencies by package name
    #[serde(default)]
    pub depends: Vec<String>,

    /// Phase commands
    #[serde(default)]
    pub build: BuildSection,

    /// `KEY=VALUE` pairs exported into every phase
    #[serde(default)]
    pub environment: Vec<String>,

    /// Optional lifecycle hooks
    #[serde(default)]
    pub hooks: HookSection,

    /// Strip installed binaries; `None` defers to the global config
    #[serde(default)]
    pub strip: Option<bool>,
}

impl Recipe {
    /// `name-version` identifier used for artifacts and display.
    pub fn ident(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }
}

/// One entry in a recipe's `sources` list
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceEntry {
    /// Remote artifact with optional verification and mirrors
    Url {
        url: String,
        #[serde(default)]
        sha256: Option<String>,
        #[serde(default)]
        md5: Option<String>,
        #[serde(default)]
        mirrors: Vec<String>,
    },

    /// Version-controlled repository
    Git {
        git: String,
        #[serde(rename = "ref", default)]
        reference: Option<String>,
        #[serde(default)]
        depth: Option<u32>,
        #[serde(default)]
        submodules: bool,
    },

    /// Legacy form: bare URL string, no checksum
    Plain(String),
}

impl SourceEntry {
    /// Declared checksum, if any. An explicit `sha256` wins over `md5`.
    pub fn checksum(&self) -> Option<&str> {
        match self {
            Self::Url { sha256, md5, .. } => sha256.as_deref().or(md5.as_deref()),
            _ => None,
        }
    }

    /// The URL for non-git entries.
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Url { url, .. } => Some(url),
            Self::Plain(url) => Some(url),
            Self::Git { .. } => None,
        }
    }

    /// Filename component of the URL.
    pub fn filename(&self) -> Option<&str> {
        self.url()
            .and_then(|u| u.rsplit('/').next())
            .filter(|n| !n.is_empty())
    }

    /// `.patch` / `.diff` sources are patches, not archives.
    pub fn is_patch(&self) -> bool {
        self.filename()
            .map(|n| n.ends_with(".patch") || n.ends_with(".diff"))
            .unwrap_or(false)
    }
}

/// Phase commands and execution mode
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildSection {
    /// Configure command. Optional; some packages have no configure step.
    #[serde(default)]
    pub configure: Option<String>,

    /// Build command
    #[serde(default)]
    pub make: Option<String>,

    /// Install command. Must honor `DESTDIR`.
    #[serde(default)]
    pub install: Option<String>,

    /// Execution mode for phases
    #[serde(default)]
    pub mode: BuildMode,
}

/// Per-recipe execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    /// Pick fakeroot when available, direct otherwise
    #[default]
    Auto,
    Direct,
    Fakeroot,
    Chroot,
}

impl BuildMode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Direct => "direct",
            Self::Fakeroot => "fakeroot",
            Self::Chroot => "chroot",
        }
    }
}

/// Optional lifecycle hooks
///
/// Each value is resolved in order against: a script in the shared hooks
/// directory, a script inside the workspace source tree, or an inline shell
/// command. Hooks are non-fatal; a failing hook warns and the pipeline
/// continues.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookSection {
    /// Runs before extraction with the *sources cache* directory as working
    /// directory and argument (used for download side-effect setup).
    #[serde(default)]
    pub pre_extract: Option<String>,
    #[serde(default)]
    pub post_extract: Option<String>,
    #[serde(default)]
    pub post_patch: Option<String>,
    #[serde(default)]
    pub pre_build: Option<String>,
    #[serde(default)]
    pub post_build: Option<String>,
    #[serde(default)]
    pub pre_install: Option<String>,
    #[serde(default)]
    pub post_install: Option<String>,
    #[serde(default)]
    pub post_strip: Option<String>,
}
