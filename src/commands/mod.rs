// src/commands/mod.rs

//! CLI command implementations

pub mod build;
pub mod extract;
pub mod fetch;
pub mod install;
pub mod status;

pub use build::cmd_build;
pub use extract::cmd_extract;
pub use fetch::cmd_fetch;
pub use install::cmd_install;
pub use status::cmd_status;

use anyhow::{Context, Result};
use smelt::events::{FileLogSink, TracingRecorder};
use smelt::fetch::{Fetcher, GitFetcher};
use smelt::hooks::HookRunner;
use smelt::isolation::IsolationManager;
use smelt::runner::{PhaseRunner, SilentPatterns};
use smelt::{BuildContext, Config, Layout, LockRegistry, RecipeStore, StateStore};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Shared wiring for every command
pub struct App {
    pub config: Config,
    pub layout: Arc<Layout>,
    pub locks: LockRegistry,
    pub state: StateStore,
    pub store: RecipeStore,
}

impl App {
    pub fn new(config: Config) -> Result<Self> {
        let layout = Arc::new(Layout::new(&config.root));
        layout.ensure().context("materialize directory tree")?;

        let store = RecipeStore::load_dir(&config.recipes)
            .with_context(|| format!("load recipes from {}", config.recipes.display()))?;

        let locks = LockRegistry::new(layout.clone());
        let state = StateStore::new(layout.clone());

        Ok(Self {
            config,
            layout,
            locks,
            state,
            store,
        })
    }

    /// Assemble the full pipeline context.
    pub fn build_context(&self, shutdown: Arc<AtomicBool>) -> Result<Arc<BuildContext>> {
        self.build_context_with(&self.config, shutdown)
    }

    /// Assemble a pipeline context with a per-run config (CLI overrides).
    pub fn build_context_with(
        &self,
        config: &Config,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Arc<BuildContext>> {
        let sink = Arc::new(FileLogSink::new(self.layout.clone()));
        let patterns = SilentPatterns::new(&config.silent_patterns)?;

        Ok(Arc::new(BuildContext {
            config: config.clone(),
            layout: self.layout.clone(),
            locks: self.locks.clone(),
            state: self.state.clone(),
            fetcher: Fetcher::new(
                self.layout.clone(),
                Duration::from_secs(config.retry_backoff),
            )?,
            git: GitFetcher::new(self.layout.clone()),
            runner: PhaseRunner::new(sink.clone(), patterns),
            isolation: IsolationManager::new(config.chroot_root.clone(), config.mode),
            hooks: HookRunner::new(self.layout.hooks_dir(), sink.clone()),
            sink,
            recorder: Arc::new(TracingRecorder),
            run_id: Uuid::new_v4(),
            shutdown,
        }))
    }

    /// Resolve the package selection for a command: explicit names, or the
    /// whole fleet.
    pub fn select(&self, pkgs: &[String], all: bool) -> Result<Vec<String>> {
        if all || pkgs.is_empty() {
            Ok(self
                .store
                .all()
                .iter()
                .map(|r| r.name.clone())
                .collect())
        } else {
            for name in pkgs {
                self.store.find(name)?;
            }
            Ok(pkgs.to_vec())
        }
    }
}

/// Run `f` over `items` on up to `jobs` worker threads, collecting whether
/// every item succeeded.
pub fn run_parallel<T, F>(items: Vec<T>, jobs: usize, f: F) -> bool
where
    T: Send,
    F: Fn(&T) -> bool + Send + Sync,
{
    let jobs = jobs.max(1);
    let ok = AtomicBool::new(true);
    let queue = std::sync::Mutex::new(items.into_iter());

    std::thread::scope(|scope| {
        for _ in 0..jobs {
            scope.spawn(|| loop {
                let item = queue.lock().map(|mut q| q.next()).unwrap_or(None);
                let Some(item) = item else { break };
                if !f(&item) {
                    ok.store(false, std::sync::atomic::Ordering::SeqCst);
                }
            });
        }
    });

    ok.into_inner()
}
