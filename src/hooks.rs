// src/hooks.rs

//! Recipe lifecycle hooks
//!
//! A hook value resolves, in order, to: a script in the shared hooks
//! directory, a script inside the workspace source tree, or an inline shell
//! command. Hooks other than the primary phases are non-fatal: a failing
//! hook is reported and the pipeline continues.

use crate::error::{Error, Result};
use crate::events::{Level, LogRecord, LogSink};
use crate::recipe::{HookSection, Recipe};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing::debug;

/// The hook points in pipeline order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    PreExtract,
    PostExtract,
    PostPatch,
    PreBuild,
    PostBuild,
    PreInstall,
    PostInstall,
    PostStrip,
}

impl HookPoint {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PreExtract => "pre_extract",
            Self::PostExtract => "post_extract",
            Self::PostPatch => "post_patch",
            Self::PreBuild => "pre_build",
            Self::PostBuild => "post_build",
            Self::PreInstall => "pre_install",
            Self::PostInstall => "post_install",
            Self::PostStrip => "post_strip",
        }
    }

    fn select<'a>(&self, hooks: &'a HookSection) -> Option<&'a str> {
        match self {
            Self::PreExtract => hooks.pre_extract.as_deref(),
            Self::PostExtract => hooks.post_extract.as_deref(),
            Self::PostPatch => hooks.post_patch.as_deref(),
            Self::PreBuild => hooks.pre_build.as_deref(),
            Self::PostBuild => hooks.post_build.as_deref(),
            Self::PreInstall => hooks.pre_install.as_deref(),
            Self::PostInstall => hooks.post_install.as_deref(),
            Self::PostStrip => hooks.post_strip.as_deref(),
        }
    }
}

/// How a hook value resolved
#[derive(Debug, PartialEq, Eq)]
enum HookAction {
    Script(PathBuf),
    Inline(String),
}

/// Resolves and invokes recipe hooks
pub struct HookRunner {
    hooks_dir: PathBuf,
    sink: Arc<dyn LogSink>,
}

impl HookRunner {
    pub fn new(hooks_dir: PathBuf, sink: Arc<dyn LogSink>) -> Self {
        Self { hooks_dir, sink }
    }

    fn resolve(&self, value: &str, workspace_src: &Path) -> HookAction {
        let shared = self.hooks_dir.join(value);
        if shared.is_file() {
            return HookAction::Script(shared);
        }
        let local = workspace_src.join(value);
        if local.is_file() {
            return HookAction::Script(local);
        }
        HookAction::Inline(value.to_string())
    }

    /// Run one hook point if the recipe defines it. Failures are reported
    /// through the sink and returned as `HookFailed`; the caller decides
    /// whether that is fatal (for lifecycle hooks it is not).
    pub fn run(
        &self,
        point: HookPoint,
        recipe: &Recipe,
        workspace_src: &Path,
        cwd: &Path,
        env: &HashMap<String, String>,
    ) -> Result<bool> {
        let Some(value) = point.select(&recipe.hooks) else {
            return Ok(false);
        };

        let action = self.resolve(value, workspace_src);
        debug!(pkg = %recipe.name, hook = point.as_str(), ?action, "running hook");

        let mut cmd = match &action {
            HookAction::Script(path) => {
                let mut cmd = Command::new("bash");
                cmd.arg(path).arg(cwd);
                cmd
            }
            HookAction::Inline(script) => {
                let mut cmd = Command::new("bash");
                cmd.arg("-c").arg(script);
                cmd
            }
        };
        cmd.current_dir(cwd).envs(env);

        let output = cmd.output().map_err(|e| Error::HookFailed {
            hook: point.as_str().to_string(),
            message: format!("spawn: {e}"),
        })?;

        if !output.status.success() {
            let message = format!(
                "exit {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
            self.sink.record(&LogRecord::for_phase(
                Level::Warn,
                &recipe.name,
                point.as_str(),
                format!("hook failed ({message})"),
            ));
            return Err(Error::HookFailed {
                hook: point.as_str().to_string(),
                message,
            });
        }

        Ok(true)
    }

    /// Run a hook, downgrading any failure to a warning. Lifecycle hooks
    /// are non-fatal by default; recipes escalate through their own exit
    /// conventions inside the phase commands instead.
    pub fn run_soft(
        &self,
        point: HookPoint,
        recipe: &Recipe,
        workspace_src: &Path,
        cwd: &Path,
        env: &HashMap<String, String>,
    ) {
        if let Err(e) = self.run(point, recipe, workspace_src, cwd, env) {
            tracing::warn!(pkg = %recipe.name, hook = point.as_str(), error = %e, "hook failed (continuing)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn recipe_with_hook(point: &str, value: &str) -> Recipe {
        serde_yaml::from_str(&format!(
            "name: t\nversion: '1'\nhooks:\n  {point}: \"{value}\"\n"
        ))
        .unwrap()
    }

    fn runner(tmp: &TempDir) -> HookRunner {
        HookRunner::new(tmp.path().join("hooks"), Arc::new(NullSink))
    }

    #[test]
    fn test_absent_hook_is_noop() {
        let tmp = TempDir::new().unwrap();
        let r = runner(&tmp);
        let recipe: Recipe = serde_yaml::from_str("name: t\nversion: '1'\n").unwrap();

        let ran = r
            .run(
                HookPoint::PreBuild,
                &recipe,
                tmp.path(),
                tmp.path(),
                &HashMap::new(),
            )
            .unwrap();
        assert!(!ran);
    }

    #[test]
    fn test_inline_hook_runs_in_cwd() {
        let tmp = TempDir::new().unwrap();
        let r = runner(&tmp);
        let recipe = recipe_with_hook("post_build", "touch hook-ran");

        let ran = r
            .run(
                HookPoint::PostBuild,
                &recipe,
                tmp.path(),
                tmp.path(),
                &HashMap::new(),
            )
            .unwrap();
        assert!(ran);
        assert!(tmp.path().join("hook-ran").exists());
    }

    #[test]
    fn test_hooks_dir_script_resolution() {
        let tmp = TempDir::new().unwrap();
        let hooks_dir = tmp.path().join("hooks");
        std::fs::create_dir_all(&hooks_dir).unwrap();
        let script = hooks_dir.join("fixup.sh");
        std::fs::write(&script, "#!/bin/bash\ntouch \"$1/from-script\"\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let r = runner(&tmp);
        let recipe = recipe_with_hook("post_install", "fixup.sh");

        let cwd = tmp.path().join("cwd");
        std::fs::create_dir_all(&cwd).unwrap();
        r.run(
            HookPoint::PostInstall,
            &recipe,
            tmp.path(),
            &cwd,
            &HashMap::new(),
        )
        .unwrap();
        assert!(cwd.join("from-script").exists());
    }

    #[test]
    fn test_workspace_script_resolution() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(src.join("scripts")).unwrap();
        std::fs::write(
            src.join("scripts/prep.sh"),
            "#!/bin/bash\ntouch prep-done\n",
        )
        .unwrap();

        let r = runner(&tmp);
        let recipe = recipe_with_hook("pre_build", "scripts/prep.sh");

        r.run(HookPoint::PreBuild, &recipe, &src, &src, &HashMap::new())
            .unwrap();
        assert!(src.join("prep-done").exists());
    }

    #[test]
    fn test_failing_hook_reports_error() {
        let tmp = TempDir::new().unwrap();
        let r = runner(&tmp);
        let recipe = recipe_with_hook("post_patch", "exit 7");

        let err = r
            .run(
                HookPoint::PostPatch,
                &recipe,
                tmp.path(),
                tmp.path(),
                &HashMap::new(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::HookFailed { .. }));
    }

    #[test]
    fn test_run_soft_swallows_failure() {
        let tmp = TempDir::new().unwrap();
        let r = runner(&tmp);
        let recipe = recipe_with_hook("post_patch", "exit 7");

        // Must not panic or propagate
        r.run_soft(
            HookPoint::PostPatch,
            &recipe,
            tmp.path(),
            tmp.path(),
            &HashMap::new(),
        );
    }

    #[test]
    fn test_hook_env_passed() {
        let tmp = TempDir::new().unwrap();
        let r = runner(&tmp);
        let recipe = recipe_with_hook("pre_install", "echo $SMELT_PKG > pkg-name");

        let mut env = HashMap::new();
        env.insert("SMELT_PKG".to_string(), "zlib".to_string());
        r.run(HookPoint::PreInstall, &recipe, tmp.path(), tmp.path(), &env)
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("pkg-name"))
                .unwrap()
                .trim(),
            "zlib"
        );
    }
}
