// src/commands/install.rs

//! Install command: apply built artifacts to a target root

use super::{run_parallel, App};
use anyhow::Result;
use smelt::{InstallOptions, Installer, Outcome, StateKind};
use std::path::PathBuf;
use tracing::{error, info};

pub struct InstallArgs {
    pub packages: Vec<String>,
    pub resume: bool,
    pub verify_only: bool,
    pub dry_run: bool,
    pub target_root: PathBuf,
    pub jobs: usize,
}

pub fn cmd_install(app: &App, args: &InstallArgs) -> Result<bool> {
    let selection = app.select(&args.packages, false)?;
    let installer = Installer::new(app.layout.clone(), app.locks.clone(), app.state.clone());
    let options = InstallOptions {
        verify_only: args.verify_only,
        dry_run: args.dry_run,
    };

    info!(
        packages = selection.len(),
        target = %args.target_root.display(),
        "installing"
    );

    // Different packages may install into the same root concurrently; the
    // per-package install lock serializes same-package attempts.
    let ok = run_parallel(selection, args.jobs, |name| {
        let recipe = match app.store.find(name) {
            Ok(r) => r,
            Err(e) => {
                error!(pkg = %name, error = %e, "unknown package");
                return false;
            }
        };

        // --continue: anything recorded ok is skipped outright, without
        // re-verifying the artifact.
        if args.resume {
            if let Ok(Some(state)) = app.state.read(StateKind::Install, name) {
                if state.status == smelt::Status::Ok {
                    info!(pkg = %name, "already installed, skipping");
                    return true;
                }
            }
        }

        let outcome = installer.install(name, &recipe.version, &args.target_root, &options);
        match outcome {
            Outcome::Ok => true,
            Outcome::Skipped { reason, .. } => {
                info!(pkg = %name, %reason, "install skipped");
                true
            }
            Outcome::Failed { reason, .. } => {
                error!(pkg = %name, %reason, "install failed");
                false
            }
        }
    });

    app.state.merge_snapshot(StateKind::Install)?;
    Ok(ok)
}
