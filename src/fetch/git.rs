// src/fetch/git.rs

//! Git source acquisition
//!
//! Shells out to the `git` binary. An existing clone is updated in place
//! (prune, checkout, fast-forward); a fresh clone is shallow when the recipe
//! asks for a depth. The resulting short commit id is returned for the state
//! record.

use crate::error::{Error, Result};
use crate::layout::Layout;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, info};

pub struct GitFetcher {
    layout: Arc<Layout>,
}

impl GitFetcher {
    pub fn new(layout: Arc<Layout>) -> Self {
        Self { layout }
    }

    /// Clone or update `repo` into the package's sources cache and return
    /// `(checkout path, short commit id)`.
    ///
    /// An existing clone is reused as-is unless `update` is set; a cached
    /// clone that does not know the requested ref is refreshed regardless,
    /// since the checkout cannot succeed otherwise.
    pub fn fetch(
        &self,
        pkg: &str,
        repo: &str,
        reference: Option<&str>,
        depth: Option<u32>,
        submodules: bool,
        update: bool,
    ) -> Result<(PathBuf, String)> {
        let cache_dir = self.layout.sources(pkg);
        std::fs::create_dir_all(&cache_dir)
            .map_err(|e| Error::IoError(format!("create sources cache: {e}")))?;

        let name = repo
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .map(|n| n.trim_end_matches(".git"))
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::GitFetchFailed(format!("cannot derive name from {repo}")))?;
        let dest = cache_dir.join(name);

        if dest.join(".git").exists() {
            if update {
                self.update(&dest, reference, submodules)?;
            } else if let Err(e) = self.checkout_cached(&dest, reference, submodules) {
                debug!(dest = %dest.display(), error = %e, "cached clone lacks ref, refreshing");
                self.update(&dest, reference, submodules)?;
            }
        } else {
            self.clone(repo, &dest, reference, depth, submodules)?;
        }

        let commit = self.short_commit(&dest)?;
        info!(pkg, repo, %commit, "git source ready");
        Ok((dest, commit))
    }

    /// Use an existing clone without touching the network.
    fn checkout_cached(
        &self,
        dest: &Path,
        reference: Option<&str>,
        submodules: bool,
    ) -> Result<()> {
        if let Some(r) = reference {
            run_git(Some(dest), &["checkout".into(), r.to_string()])?;
        }
        if submodules {
            run_git(
                Some(dest),
                &[
                    "submodule".into(),
                    "update".into(),
                    "--init".into(),
                    "--recursive".into(),
                ],
            )?;
        }
        Ok(())
    }

    fn clone(
        &self,
        repo: &str,
        dest: &Path,
        reference: Option<&str>,
        depth: Option<u32>,
        submodules: bool,
    ) -> Result<()> {
        debug!(repo, dest = %dest.display(), "cloning");

        let mut args: Vec<String> = vec!["clone".into()];
        if let Some(depth) = depth.filter(|d| *d > 0) {
            args.push("--depth".into());
            args.push(depth.to_string());
            // A shallow clone must name the ref up front; deepening later
            // cannot reach commits outside the advertised tips.
            if let Some(r) = reference {
                args.push("--branch".into());
                args.push(r.to_string());
            }
        }
        args.push(repo.into());
        args.push(dest.to_string_lossy().into_owned());

        run_git(None, &args)?;

        if depth.filter(|d| *d > 0).is_none() {
            if let Some(r) = reference {
                run_git(Some(dest), &["checkout".into(), r.to_string()])?;
            }
        }

        if submodules {
            run_git(
                Some(dest),
                &[
                    "submodule".into(),
                    "update".into(),
                    "--init".into(),
                    "--recursive".into(),
                ],
            )?;
        }

        Ok(())
    }

    fn update(&self, dest: &Path, reference: Option<&str>, submodules: bool) -> Result<()> {
        debug!(dest = %dest.display(), "updating existing clone");

        run_git(Some(dest), &["fetch".into(), "--prune".into()])?;

        if let Some(r) = reference {
            // The ref may be new since the original clone; a plain checkout
            // after fetch handles both branches and tags.
            run_git(Some(dest), &["checkout".into(), r.to_string()])?;
        }

        // Fast-forward when the checked-out ref is a branch; a detached tag
        // checkout has no upstream and the merge is skipped.
        let on_branch = git_output(dest, &["symbolic-ref".into(), "-q".into(), "HEAD".into()])
            .map(|s| !s.is_empty())
            .unwrap_or(false);
        if on_branch {
            run_git(Some(dest), &["merge".into(), "--ff-only".into()])?;
        }

        if submodules {
            run_git(
                Some(dest),
                &[
                    "submodule".into(),
                    "update".into(),
                    "--init".into(),
                    "--recursive".into(),
                ],
            )?;
        }

        Ok(())
    }

    fn short_commit(&self, dest: &Path) -> Result<String> {
        git_output(dest, &["rev-parse".into(), "--short".into(), "HEAD".into()])
    }
}

fn run_git(cwd: Option<&Path>, args: &[String]) -> Result<()> {
    let mut cmd = Command::new("git");
    cmd.args(args);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let output = cmd
        .output()
        .map_err(|e| Error::GitFetchFailed(format!("spawn git: {e}")))?;

    if !output.status.success() {
        return Err(Error::GitFetchFailed(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(())
}

fn git_output(cwd: &Path, args: &[String]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .map_err(|e| Error::GitFetchFailed(format!("spawn git: {e}")))?;

    if !output.status.success() {
        return Err(Error::GitFetchFailed(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
