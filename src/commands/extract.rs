// src/commands/extract.rs

//! Extract command: materialize workspaces from cached sources

use super::{run_parallel, App};
use anyhow::Result;
use smelt::state::{PackageState, Status};
use smelt::recipe::SourceEntry;
use smelt::StateKind;
use tracing::{error, info};

pub struct ExtractArgs {
    pub packages: Vec<String>,
    pub jobs: usize,
}

pub fn cmd_extract(app: &App, args: &ExtractArgs) -> Result<bool> {
    let selection = app.select(&args.packages, false)?;

    info!(packages = selection.len(), jobs = args.jobs, "extracting workspaces");

    let ok = run_parallel(selection, args.jobs, |name| match extract_one(app, name) {
        Ok(()) => true,
        Err(e) => {
            error!(pkg = %name, error = %e, "extract failed");
            false
        }
    });

    app.state.merge_snapshot(StateKind::Extract)?;
    Ok(ok)
}

fn extract_one(app: &App, name: &str) -> smelt::Result<()> {
    let recipe = app.store.find(name)?;

    let Some(_lock) = app.locks.try_acquire("extract", name)? else {
        info!(pkg = name, "extract locked by another process, skipping");
        return Ok(());
    };

    let result = materialize(app, name, recipe);

    let state = match &result {
        Ok(()) => PackageState::new(name, Status::Ok, "extract").with_version(&recipe.version),
        Err(e) => PackageState::new(name, Status::Failed, "extract")
            .with_version(&recipe.version)
            .with_reason(e.reason_code()),
    };
    app.state.write(StateKind::Extract, &state)?;

    result
}

fn materialize(app: &App, name: &str, recipe: &smelt::Recipe) -> smelt::Result<()> {
    let workspace = app.layout.workspace(name);
    let cache = app.layout.sources(name);

    // Workspaces are discarded on each extraction; never incremental.
    if workspace.root.exists() {
        std::fs::remove_dir_all(&workspace.root)
            .map_err(|e| smelt::Error::IoError(format!("scrub workspace: {e}")))?;
    }
    for dir in [&workspace.src, &workspace.build, &workspace.destdir] {
        std::fs::create_dir_all(dir)
            .map_err(|e| smelt::Error::IoError(format!("create {}: {e}", dir.display())))?;
    }

    let mut extracted = 0usize;
    for entry in &recipe.sources {
        if entry.is_patch() {
            continue;
        }
        let Some(filename) = entry.filename() else {
            continue;
        };
        let archive = cache.join(filename);
        if !archive.exists() {
            return Err(smelt::Error::ExtractFailed(format!(
                "{} is not in the sources cache (run fetch first)",
                archive.display()
            )));
        }

        let result = smelt::extract::extract(&archive, &workspace.src);
        if result.is_err() && app.config.quarantine_on_failure {
            let _ = app.layout.corrupted_quarantine(&workspace.root);
        }
        result?;
        extracted += 1;
    }

    if extracted == 0 && !recipe.sources.iter().any(|s| matches!(s, SourceEntry::Git { .. })) {
        return Err(smelt::Error::ExtractFailed(
            "recipe has no extractable archives".to_string(),
        ));
    }

    info!(pkg = name, archives = extracted, "workspace materialized");
    Ok(())
}
