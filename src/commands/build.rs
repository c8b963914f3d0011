// src/commands/build.rs

//! Build command: run the full pipeline over the dependency DAG

use super::App;
use anyhow::{Context, Result};
use smelt::fetch::FetchOptions;
use smelt::isolation::ChrootSession;
use smelt::recipe::BuildMode;
use smelt::{BuildOptions, ModeOverride, PipelineEngine, RunResult, Scheduler};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{info, warn};

pub struct BuildArgs {
    pub packages: Vec<String>,
    pub resume: bool,
    pub no_strip: bool,
    pub retry: Option<u32>,
    pub jobs: Option<usize>,
    pub mode: Option<ModeOverride>,
}

pub fn cmd_build(app: &App, args: &BuildArgs, shutdown: Arc<AtomicBool>) -> Result<bool> {
    let mut config = app.config.clone();
    if let Some(mode) = args.mode {
        config.mode = mode;
    }

    let ctx = app.build_context_with(&config, shutdown)?;
    let options = BuildOptions {
        resume: args.resume,
        strip: if args.no_strip { Some(false) } else { None },
        retries: args.retry,
        fetch: FetchOptions::default(),
    };

    // A chroot batch needs the virtual filesystems mounted up front and
    // unwound once the last worker finishes, even when scheduling errors.
    let needs_chroot = matches!(config.mode, ModeOverride::Chroot)
        || app
            .store
            .topological(&args.packages)?
            .iter()
            .any(|r| r.build.mode == BuildMode::Chroot);

    let mut session = if needs_chroot {
        let root = config
            .chroot_root
            .clone()
            .context("chroot builds require chroot_root in the config")?;
        let mut session = ChrootSession::new(root, app.locks.clone());
        if let Err(e) = session.mount_all() {
            let _ = session.cleanup();
            return Err(e.into());
        }
        Some(session)
    } else {
        None
    };

    let engine = Arc::new(PipelineEngine::new(ctx, options));
    let scheduler = Scheduler::new(engine);

    let concurrency = args.jobs.unwrap_or_else(|| config.effective_concurrency());
    let outcome = scheduler.schedule(&app.store, &args.packages, concurrency);

    if let Some(session) = session.as_mut() {
        if let Err(e) = session.unmount_all(true) {
            warn!(error = %e, "mount stack did not unwind cleanly");
            let _ = session.cleanup();
        }
    }

    let report = outcome?;

    for (name, result) in &report.results {
        match result {
            RunResult::Built => info!(pkg = %name, "built"),
            RunResult::Skipped { reason } => info!(pkg = %name, %reason, "skipped"),
            RunResult::Failed { phase, reason } => {
                info!(pkg = %name, %phase, %reason, "failed")
            }
            RunResult::Blocked { by } => info!(pkg = %name, %by, "blocked"),
        }
    }

    let failed = report.failed();
    if !failed.is_empty() {
        eprintln!("{} package(s) did not build:", failed.len());
        for (name, result) in failed {
            match result {
                RunResult::Failed { phase, reason } => {
                    eprintln!("  {name}: failed in {phase} ({reason})")
                }
                RunResult::Blocked { by } => eprintln!("  {name}: blocked by {by}"),
                _ => {}
            }
        }
    }

    Ok(report.success())
}
