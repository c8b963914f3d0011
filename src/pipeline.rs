// src/pipeline.rs

//! The per-package pipeline engine
//!
//! A linear state machine drives each package:
//!
//! ```text
//! new -> locked -> sources-fetched -> extracted -> patched -> configured
//!     -> built -> installed -> stripped -> packaged -> done
//! ```
//!
//! Every transition persists the new status to the state store. Failure at
//! any edge quarantines the workspace (configurable), records the failure
//! reason, and returns. Resume consults the state store: a package last
//! recorded `ok` is skipped unconditionally; anything else restarts from
//! `new` — there is no mid-pipeline resume.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{EventRecorder, Level, LogSink, RunEvent};
use crate::extract;
use crate::fetch::{FetchOptions, Fetcher, GitFetcher};
use crate::fsutil;
use crate::hooks::{HookPoint, HookRunner};
use crate::isolation::{IsolationManager, ResolvedMode};
use crate::layout::{Layout, StateKind, Workspace};
use crate::lock::LockRegistry;
use crate::package;
use crate::recipe::{Recipe, SourceEntry};
use crate::runner::{PhaseRunner, PhaseSpec};
use crate::state::{ArtifactRecord, PackageState, SourceRecord, StateStore, Status};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How a package run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Skipped {
        reason: String,
        /// Whether dependents may proceed (true only when the package is
        /// known built, e.g. an `ok` record under `--continue`).
        satisfies_dependents: bool,
    },
    Failed {
        phase: String,
        reason: String,
    },
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok)
    }

    pub fn satisfies_dependents(&self) -> bool {
        match self {
            Outcome::Ok => true,
            Outcome::Skipped {
                satisfies_dependents,
                ..
            } => *satisfies_dependents,
            Outcome::Failed { .. } => false,
        }
    }
}

/// Per-run options layered over the config
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Skip packages whose last recorded status is `ok`.
    pub resume: bool,
    /// Per-run strip override (`--no-strip`).
    pub strip: Option<bool>,
    /// Retry-count override.
    pub retries: Option<u32>,
    pub fetch: FetchOptions,
}

/// Everything a pipeline run needs, shared across workers
pub struct BuildContext {
    pub config: Config,
    pub layout: Arc<Layout>,
    pub locks: LockRegistry,
    pub state: StateStore,
    pub fetcher: Fetcher,
    pub git: GitFetcher,
    pub runner: PhaseRunner,
    pub isolation: IsolationManager,
    pub hooks: HookRunner,
    pub sink: Arc<dyn LogSink>,
    pub recorder: Arc<dyn EventRecorder>,
    pub run_id: Uuid,
    pub shutdown: Arc<AtomicBool>,
}

impl BuildContext {
    pub fn interrupted(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// What the pipeline learned along the way, folded into the final record
#[derive(Default)]
struct BuildFacts {
    sources: Vec<SourceRecord>,
    commit: Option<String>,
    artifact: Option<ArtifactRecord>,
}

/// Drives one package through the full pipeline
pub struct PipelineEngine {
    ctx: Arc<BuildContext>,
    options: BuildOptions,
}

impl PipelineEngine {
    pub fn new(ctx: Arc<BuildContext>, options: BuildOptions) -> Self {
        Self { ctx, options }
    }

    pub fn context(&self) -> &BuildContext {
        &self.ctx
    }

    /// Run one package to completion. Never panics; all failure modes are
    /// folded into the returned outcome.
    pub fn build(&self, recipe: &Recipe) -> Outcome {
        let pkg = recipe.name.as_str();

        if self.ctx.interrupted() {
            return Outcome::Skipped {
                reason: "interrupted".to_string(),
                satisfies_dependents: false,
            };
        }

        // Resume: an `ok` record skips unconditionally, with no state
        // rewrite and no phase logs.
        if self.options.resume {
            match self.ctx.state.read(StateKind::Build, pkg) {
                Ok(Some(state)) if state.status == Status::Ok => {
                    debug!(pkg, "already built, skipping");
                    return Outcome::Skipped {
                        reason: "already-built".to_string(),
                        satisfies_dependents: true,
                    };
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(pkg, error = %e, "unreadable state record, rebuilding");
                }
            }
        }

        // new -> locked
        let _lock = match self.ctx.locks.try_acquire("build", pkg) {
            Ok(Some(handle)) => handle,
            Ok(None) => {
                info!(pkg, "locked by another process, skipping");
                return Outcome::Skipped {
                    reason: "locked".to_string(),
                    satisfies_dependents: false,
                };
            }
            Err(e) => {
                return Outcome::Failed {
                    phase: "new".to_string(),
                    reason: e.reason_code().to_string(),
                }
            }
        };

        if recipe.sources.is_empty() {
            let state = PackageState::new(pkg, Status::Skipped, "new")
                .with_version(&recipe.version)
                .with_reason("no-sources-found");
            let _ = self.ctx.state.write(StateKind::Build, &state);
            return Outcome::Skipped {
                reason: "no-sources-found".to_string(),
                satisfies_dependents: false,
            };
        }

        self.event(pkg, Level::Info, format!("building {}", recipe.ident()));

        let mut facts = BuildFacts::default();
        match self.run_pipeline(recipe, &mut facts) {
            Ok(()) => {
                let mut state = PackageState::new(pkg, Status::Ok, "done")
                    .with_version(&recipe.version);
                state.sources = facts.sources;
                state.commit = facts.commit;
                state.package_artifact = facts.artifact;
                if let Err(e) = self.ctx.state.write(StateKind::Build, &state) {
                    warn!(pkg, error = %e, "final state write failed");
                }
                self.event(pkg, Level::Info, format!("{} ok", recipe.ident()));
                Outcome::Ok
            }
            Err(Error::Interrupted) => {
                let state = PackageState::new(pkg, Status::Skipped, "interrupted")
                    .with_version(&recipe.version)
                    .with_reason("interrupted");
                let _ = self.ctx.state.write(StateKind::Build, &state);
                Outcome::Skipped {
                    reason: "interrupted".to_string(),
                    satisfies_dependents: false,
                }
            }
            Err(e) => {
                let phase = failing_phase(&e);
                let reason = e.reason_code().to_string();
                self.event(pkg, Level::Error, format!("{pkg} failed in {phase}: {e}"));

                if self.ctx.config.quarantine_on_failure {
                    let workspace = self.ctx.layout.workspace(pkg);
                    if workspace.root.exists() {
                        if let Err(qe) = self.ctx.layout.corrupted_quarantine(&workspace.root) {
                            warn!(pkg, error = %qe, "workspace quarantine failed");
                        }
                    }
                }

                let mut state = PackageState::new(pkg, Status::Failed, &phase)
                    .with_version(&recipe.version)
                    .with_reason(&reason);
                state.sources = std::mem::take(&mut facts.sources);
                state.commit = facts.commit.take();
                if let Err(we) = self.ctx.state.write(StateKind::Build, &state) {
                    warn!(pkg, error = %we, "failure state write failed");
                }

                Outcome::Failed { phase, reason }
            }
        }
    }

    fn run_pipeline(&self, recipe: &Recipe, facts: &mut BuildFacts) -> Result<()> {
        let pkg = recipe.name.as_str();
        let layout = &self.ctx.layout;
        let workspace = layout.workspace(pkg);

        self.checkpoint(recipe, "new")?;

        // locked -> sources-fetched
        let fetched = self.fetch_sources(recipe, facts)?;
        self.checkpoint(recipe, "sources-fetched")?;

        // Fresh workspace on every attempt; extraction is not incremental.
        fsutil::remove_dir_if_exists(&workspace.root)?;
        for dir in [&workspace.src, &workspace.build, &workspace.destdir] {
            std::fs::create_dir_all(dir)
                .map_err(|e| Error::IoError(format!("create {}: {e}", dir.display())))?;
        }

        let env = self.phase_environment(recipe, &workspace);
        self.write_env_file(&workspace, &env)?;

        // The pre_extract hook deliberately receives the sources cache
        // directory, not the workspace: it exists for download side-effect
        // setup, and some fleets depend on that.
        let sources_dir = layout.sources(pkg);
        self.ctx.hooks.run_soft(
            HookPoint::PreExtract,
            recipe,
            &workspace.src,
            &sources_dir,
            &env,
        );

        // sources-fetched -> extracted
        for archive in &fetched.archives {
            extract::extract(archive, &workspace.src)?;
        }
        for repo in &fetched.git_checkouts {
            let name = repo
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("checkout");
            fsutil::copy_dir_recursive(repo, &workspace.src.join(name))?;
        }
        self.ctx.hooks.run_soft(
            HookPoint::PostExtract,
            recipe,
            &workspace.src,
            &workspace.src,
            &env,
        );
        self.checkpoint(recipe, "extracted")?;

        let source_root = source_root(&workspace.src);

        // extracted -> patched
        extract::apply_patches(&source_root, &fetched.patches)?;
        self.ctx.hooks.run_soft(
            HookPoint::PostPatch,
            recipe,
            &workspace.src,
            &source_root,
            &env,
        );
        self.checkpoint(recipe, "patched")?;

        // In-tree builds are the norm for the LFS fleet; the build dir is
        // the unpacked source root.
        let build_cwd = source_root.clone();
        let mode = self.ctx.isolation.resolve(recipe.build.mode)?;
        debug!(pkg, mode = mode.as_str(), "isolation resolved");

        // patched -> configured
        self.ctx.hooks.run_soft(
            HookPoint::PreBuild,
            recipe,
            &workspace.src,
            &build_cwd,
            &env,
        );
        if let Some(configure) = &recipe.build.configure {
            self.run_phase(recipe, "configure", configure, mode, &build_cwd, &workspace, &env)?;
        }
        self.checkpoint(recipe, "configured")?;

        // configured -> built
        if let Some(make) = &recipe.build.make {
            self.run_phase(recipe, "make", make, mode, &build_cwd, &workspace, &env)?;
        }
        self.ctx.hooks.run_soft(
            HookPoint::PostBuild,
            recipe,
            &workspace.src,
            &build_cwd,
            &env,
        );
        self.checkpoint(recipe, "built")?;

        // built -> installed
        self.ctx.hooks.run_soft(
            HookPoint::PreInstall,
            recipe,
            &workspace.src,
            &build_cwd,
            &env,
        );
        if let Some(install) = &recipe.build.install {
            self.run_phase(recipe, "install", install, mode, &build_cwd, &workspace, &env)?;
        }
        self.checkpoint(recipe, "installed")?;

        // installed -> stripped (non-fatal)
        if self.strip_enabled(recipe) {
            match package::strip_destdir(&workspace.destdir) {
                Ok(count) => debug!(pkg, count, "stripped binaries"),
                Err(e) => warn!(pkg, error = %e, "strip pass failed (continuing)"),
            }
            self.ctx.hooks.run_soft(
                HookPoint::PostStrip,
                recipe,
                &workspace.src,
                &workspace.destdir,
                &env,
            );
        }
        self.checkpoint(recipe, "stripped")?;

        // stripped -> packaged. A package is only ever `ok` when its destdir
        // held non-trivial content at packaging time; a recipe without an
        // install command reaches this edge with the runner's install-phase
        // check never having run.
        if !package::has_payload(&workspace.destdir) {
            return Err(Error::SilentError {
                phase: "package".to_string(),
                pattern: "empty destdir".to_string(),
            });
        }
        let artifact_path = layout.artifact(&recipe.name, &recipe.version);
        let digest = package::create_artifact(&workspace.destdir, &artifact_path)?;
        facts.artifact = Some(ArtifactRecord {
            path: artifact_path.display().to_string(),
            sha256: digest,
        });
        self.checkpoint(recipe, "packaged")?;

        self.ctx.hooks.run_soft(
            HookPoint::PostInstall,
            recipe,
            &workspace.src,
            &workspace.destdir,
            &env,
        );

        Ok(())
    }

    /// Persist an in-progress transition and honor cooperative shutdown
    /// between phases (never mid-phase, so state is never torn).
    fn checkpoint(&self, recipe: &Recipe, phase: &str) -> Result<()> {
        if self.ctx.interrupted() {
            return Err(Error::Interrupted);
        }
        let state = PackageState::new(&recipe.name, Status::InProgress, phase)
            .with_version(&recipe.version);
        self.ctx.state.write(StateKind::Build, &state)
    }

    fn fetch_sources(&self, recipe: &Recipe, facts: &mut BuildFacts) -> Result<FetchedSources> {
        let pkg = recipe.name.as_str();
        let mut out = FetchedSources::default();

        for entry in &recipe.sources {
            match entry {
                SourceEntry::Url { url, mirrors, .. } => {
                    let fetched = self.ctx.fetcher.fetch_url(
                        pkg,
                        url,
                        entry.checksum(),
                        mirrors,
                        &self.options.fetch,
                    )?;
                    facts.sources.push(SourceRecord {
                        url: url.clone(),
                        sha256: fetched.sha256.clone(),
                    });
                    if entry.is_patch() {
                        out.patches.push(fetched.path);
                    } else {
                        out.archives.push(fetched.path);
                    }
                }
                SourceEntry::Plain(url) => {
                    let fetched =
                        self.ctx
                            .fetcher
                            .fetch_url(pkg, url, None, &[], &self.options.fetch)?;
                    facts.sources.push(SourceRecord {
                        url: url.clone(),
                        sha256: fetched.sha256.clone(),
                    });
                    if entry.is_patch() {
                        out.patches.push(fetched.path);
                    } else {
                        out.archives.push(fetched.path);
                    }
                }
                SourceEntry::Git {
                    git,
                    reference,
                    depth,
                    submodules,
                } => {
                    let (path, commit) = self.ctx.git.fetch(
                        pkg,
                        git,
                        reference.as_deref(),
                        *depth,
                        *submodules,
                        self.options.fetch.git_update,
                    )?;
                    facts.sources.push(SourceRecord {
                        url: git.clone(),
                        sha256: None,
                    });
                    facts.commit = Some(commit);
                    out.git_checkouts.push(path);
                }
            }
        }

        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_phase(
        &self,
        recipe: &Recipe,
        phase: &str,
        command: &str,
        mode: ResolvedMode,
        cwd: &Path,
        workspace: &Workspace,
        env: &HashMap<String, String>,
    ) -> Result<()> {
        let script = PhaseRunner::shell_script(command, Some(&workspace.env_file()));
        let spec = PhaseSpec {
            package: &recipe.name,
            phase,
            timeout: Duration::from_secs(self.ctx.config.timeout),
            retries: self.options.retries.unwrap_or(self.ctx.config.retries),
            backoff: Duration::from_secs(self.ctx.config.retry_backoff),
            destdir: Some(&workspace.destdir),
        };

        self.ctx
            .runner
            .run_phase(&spec, &|| self.ctx.isolation.command(mode, &script, cwd, env))
    }

    fn phase_environment(&self, recipe: &Recipe, workspace: &Workspace) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("SMELT_PKG".to_string(), recipe.name.clone());
        env.insert("SMELT_VERSION".to_string(), recipe.version.clone());
        env.insert(
            "DESTDIR".to_string(),
            workspace.destdir.display().to_string(),
        );
        env.insert(
            "MAKEFLAGS".to_string(),
            format!("-j{}", self.ctx.config.effective_concurrency()),
        );

        for pair in &recipe.environment {
            if let Some((key, value)) = pair.split_once('=') {
                env.insert(key.to_string(), value.to_string());
            }
        }

        env
    }

    fn write_env_file(&self, workspace: &Workspace, env: &HashMap<String, String>) -> Result<()> {
        let path = workspace.env_file();
        let mut file = std::fs::File::create(&path)
            .map_err(|e| Error::IoError(format!("create {}: {e}", path.display())))?;

        let mut keys: Vec<&String> = env.keys().collect();
        keys.sort();
        for key in keys {
            let value = &env[key];
            writeln!(file, "export {key}='{}'", value.replace('\'', r"'\''"))
                .map_err(|e| Error::IoError(format!("write {}: {e}", path.display())))?;
        }
        Ok(())
    }

    fn strip_enabled(&self, recipe: &Recipe) -> bool {
        self.options
            .strip
            .or(recipe.strip)
            .unwrap_or(self.ctx.config.strip_binaries)
    }

    fn event(&self, pkg: &str, level: Level, message: String) {
        self.ctx
            .recorder
            .event(&RunEvent::for_job(self.ctx.run_id, pkg, level, message));
    }
}

#[derive(Default)]
struct FetchedSources {
    archives: Vec<PathBuf>,
    patches: Vec<PathBuf>,
    git_checkouts: Vec<PathBuf>,
}

/// Archives usually unpack into a single top-level directory; when they do,
/// that directory is the source root. Otherwise the workspace src dir is.
fn source_root(src: &Path) -> PathBuf {
    let entries: Vec<_> = std::fs::read_dir(src)
        .into_iter()
        .flatten()
        .filter_map(|e| e.ok())
        .collect();

    if entries.len() == 1 && entries[0].file_type().map(|t| t.is_dir()).unwrap_or(false) {
        entries[0].path()
    } else {
        src.to_path_buf()
    }
}

/// Attribute an error to the pipeline phase it belongs to.
fn failing_phase(error: &Error) -> String {
    match error {
        Error::FetchFailed(_)
        | Error::AllMirrorsFailed { .. }
        | Error::ChecksumMismatch { .. }
        | Error::UnsupportedChecksum(_)
        | Error::GitFetchFailed(_) => "fetch".to_string(),
        Error::ExtractFailed(_) => "extract".to_string(),
        Error::PatchRejected(_) => "patch".to_string(),
        Error::PhaseFailed { phase, .. }
        | Error::SilentError { phase, .. }
        | Error::TimedOut { phase, .. } => phase.clone(),
        Error::PackageFailed(_) => "package".to_string(),
        Error::IsolationUnavailable(_) | Error::MountError(_) => "isolation".to_string(),
        _ => "pipeline".to_string(),
    }
}
