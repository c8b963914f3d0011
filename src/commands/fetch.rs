// src/commands/fetch.rs

//! Fetch command: acquire sources for selected packages

use super::{run_parallel, App};
use anyhow::Result;
use smelt::fetch::{FetchOptions, Fetcher, GitFetcher};
use smelt::state::{PackageState, SourceRecord, Status};
use smelt::recipe::SourceEntry;
use smelt::StateKind;
use std::time::Duration;
use tracing::{error, info};

pub struct FetchArgs {
    pub packages: Vec<String>,
    pub all: bool,
    pub update: bool,
    pub git_update: bool,
    pub remove_cache: bool,
    pub jobs: usize,
}

pub fn cmd_fetch(app: &App, args: &FetchArgs) -> Result<bool> {
    let selection = app.select(&args.packages, args.all)?;
    let fetcher = Fetcher::new(
        app.layout.clone(),
        Duration::from_secs(app.config.retry_backoff),
    )?;
    let git = GitFetcher::new(app.layout.clone());
    let options = FetchOptions {
        update: args.update,
        git_update: args.git_update,
    };

    info!(packages = selection.len(), jobs = args.jobs, "fetching sources");

    let ok = run_parallel(selection, args.jobs, |name| {
        match fetch_one(app, &fetcher, &git, name, &options, args) {
            Ok(()) => true,
            Err(e) => {
                error!(pkg = %name, error = %e, "fetch failed");
                false
            }
        }
    });

    app.state.merge_snapshot(StateKind::Fetch)?;
    Ok(ok)
}

fn fetch_one(
    app: &App,
    fetcher: &Fetcher,
    git: &GitFetcher,
    name: &str,
    options: &FetchOptions,
    args: &FetchArgs,
) -> smelt::Result<()> {
    let recipe = app.store.find(name)?;

    let Some(_lock) = app.locks.try_acquire("fetch", name)? else {
        info!(pkg = name, "fetch locked by another process, skipping");
        return Ok(());
    };

    if recipe.sources.is_empty() {
        let state = PackageState::new(name, Status::Skipped, "fetch")
            .with_version(&recipe.version)
            .with_reason("no-sources-found");
        return app.state.write(StateKind::Fetch, &state);
    }

    if args.remove_cache {
        let cache = app.layout.sources(name);
        if cache.exists() {
            std::fs::remove_dir_all(&cache)
                .map_err(|e| smelt::Error::IoError(format!("scrub cache: {e}")))?;
        }
    }

    let result = fetch_sources(fetcher, git, name, recipe, options);

    let state = match &result {
        Ok((sources, commit)) => {
            let mut state =
                PackageState::new(name, Status::Ok, "fetch").with_version(&recipe.version);
            state.sources = sources.clone();
            state.commit = commit.clone();
            state
        }
        Err(e) => PackageState::new(name, Status::Failed, "fetch")
            .with_version(&recipe.version)
            .with_reason(e.reason_code()),
    };
    app.state.write(StateKind::Fetch, &state)?;

    result.map(|_| ())
}

type Fetched = (Vec<SourceRecord>, Option<String>);

fn fetch_sources(
    fetcher: &Fetcher,
    git: &GitFetcher,
    pkg: &str,
    recipe: &smelt::Recipe,
    options: &FetchOptions,
) -> smelt::Result<Fetched> {
    let mut sources = Vec::new();
    let mut commit = None;

    for entry in &recipe.sources {
        match entry {
            SourceEntry::Url { url, mirrors, .. } => {
                let fetched = fetcher.fetch_url(pkg, url, entry.checksum(), mirrors, options)?;
                sources.push(SourceRecord {
                    url: url.clone(),
                    sha256: fetched.sha256,
                });
            }
            SourceEntry::Plain(url) => {
                let fetched = fetcher.fetch_url(pkg, url, None, &[], options)?;
                sources.push(SourceRecord {
                    url: url.clone(),
                    sha256: fetched.sha256,
                });
            }
            SourceEntry::Git {
                git: repo,
                reference,
                depth,
                submodules,
            } => {
                let (_, short) = git.fetch(
                    pkg,
                    repo,
                    reference.as_deref(),
                    *depth,
                    *submodules,
                    options.git_update,
                )?;
                sources.push(SourceRecord {
                    url: repo.clone(),
                    sha256: None,
                });
                commit = Some(short);
            }
        }
    }

    Ok((sources, commit))
}
