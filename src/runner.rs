// src/runner.rs

//! Phase execution: shell commands under timeout with output capture
//!
//! A phase command runs in a strict-mode shell (`set -euo pipefail`) in its
//! own process group. Both output streams are tee'd into the phase log while
//! being captured for the silent-failure scan; per-stream ordering is
//! preserved, interleaving between streams is not guaranteed. A wall-clock
//! timeout kills the whole process group; if the command exits in the same
//! instant the timeout fires, the exit result wins.

use crate::error::{Error, Result};
use crate::events::{Level, LogRecord, LogSink};
use regex::RegexSet;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// Default silent-failure patterns. The list is policy, not contract;
/// deployments can replace it through the config.
pub const DEFAULT_SILENT_PATTERNS: &[&str] = &[
    "error:",
    "undefined reference",
    "cannot find",
    "No rule to make target",
    "segmentation fault",
    "traceback",
    "permission denied",
    "failed to",
    "ld: cannot",
    "collect2: error",
    "internal compiler error",
    "cannot find -l",
];

/// Compiled, case-insensitive silent-failure pattern set
#[derive(Clone)]
pub struct SilentPatterns {
    patterns: Vec<String>,
    set: Arc<RegexSet>,
}

impl SilentPatterns {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let source: Vec<String> = if patterns.is_empty() {
            DEFAULT_SILENT_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect()
        } else {
            patterns.to_vec()
        };

        let set = RegexSet::new(source.iter().map(|p| format!("(?i){p}")))
            .map_err(|e| Error::ConfigError(format!("bad silent-failure pattern: {e}")))?;

        Ok(Self {
            patterns: source,
            set: Arc::new(set),
        })
    }

    pub fn defaults() -> Self {
        Self::new(&[]).expect("default patterns compile")
    }

    /// First matching pattern in the captured log, if any.
    pub fn scan(&self, log: &str) -> Option<&str> {
        self.set
            .matches(log)
            .iter()
            .next()
            .map(|i| self.patterns[i].as_str())
    }
}

/// One phase to execute
pub struct PhaseSpec<'a> {
    pub package: &'a str,
    pub phase: &'a str,
    pub timeout: Duration,
    pub retries: u32,
    /// Initial retry backoff; doubles per attempt
    pub backoff: Duration,
    /// For the install phase: destdir checked for non-trivial content
    pub destdir: Option<&'a Path>,
}

/// Executes phase commands under timeout with silent-failure detection
pub struct PhaseRunner {
    sink: Arc<dyn LogSink>,
    patterns: SilentPatterns,
}

impl PhaseRunner {
    pub fn new(sink: Arc<dyn LogSink>, patterns: SilentPatterns) -> Self {
        Self { sink, patterns }
    }

    /// Wrap a shell fragment in strict mode, sourcing the package
    /// environment file when present.
    pub fn shell_script(command: &str, env_file: Option<&Path>) -> String {
        let mut script = String::from("set -euo pipefail\n");
        if let Some(env) = env_file {
            script.push_str(&format!(". '{}'\n", env.display()));
        }
        script.push_str(command);
        script
    }

    /// Run one phase. `build_command` produces a fresh prepared `Command`
    /// per attempt (commands are not reusable across spawns).
    pub fn run_phase(
        &self,
        spec: &PhaseSpec<'_>,
        build_command: &dyn Fn() -> Result<Command>,
    ) -> Result<()> {
        let mut delay = spec.backoff;
        let mut last_error = None;

        for attempt in 0..=spec.retries {
            if attempt > 0 {
                self.sink.record(&LogRecord::for_phase(
                    Level::Warn,
                    spec.package,
                    spec.phase,
                    format!("retrying after failure (attempt {})", attempt + 1),
                ));
                std::thread::sleep(delay);
                delay *= 2;
            }

            match self.run_once(spec, build_command) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < spec.retries => {
                    warn!(pkg = spec.package, phase = spec.phase, error = %e, "phase failed, will retry");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| Error::PhaseFailed {
            phase: spec.phase.to_string(),
            message: "exhausted retries".to_string(),
        }))
    }

    fn run_once(
        &self,
        spec: &PhaseSpec<'_>,
        build_command: &dyn Fn() -> Result<Command>,
    ) -> Result<()> {
        let mut command = build_command()?;
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Own process group, so a timeout can kill the whole tree.
            .process_group(0);

        let mut child = command.spawn().map_err(|e| Error::PhaseFailed {
            phase: spec.phase.to_string(),
            message: format!("spawn shell: {e}"),
        })?;

        let log_writer: Arc<Mutex<Box<dyn Write + Send>>> = Arc::new(Mutex::new(
            self.sink.phase_writer(spec.package, spec.phase)?,
        ));
        let captured = Arc::new(Mutex::new(String::new()));

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        let out_thread = tee_stream(stdout, log_writer.clone(), captured.clone());
        let err_thread = tee_stream(stderr, log_writer.clone(), captured.clone());

        let status = self.wait_with_timeout(&mut child, spec)?;

        // Drain the tee threads before scanning so the capture is complete.
        let _ = out_thread.join();
        let _ = err_thread.join();
        if let Ok(mut w) = log_writer.lock() {
            let _ = w.flush();
        }

        if !status.success() {
            let message = match (status.code(), status.signal()) {
                (Some(code), _) => format!("exit code {code}"),
                (None, Some(sig)) => format!("killed by signal {sig}"),
                (None, None) => "abnormal termination".to_string(),
            };
            return Err(Error::PhaseFailed {
                phase: spec.phase.to_string(),
                message,
            });
        }

        // The command claims success; the log may disagree.
        let log = captured.lock().map(|s| s.clone()).unwrap_or_default();
        if let Some(pattern) = self.patterns.scan(&log) {
            self.sink.record(&LogRecord::for_phase(
                Level::Error,
                spec.package,
                spec.phase,
                format!("silent failure: log matched '{pattern}'"),
            ));
            return Err(Error::SilentError {
                phase: spec.phase.to_string(),
                pattern: pattern.to_string(),
            });
        }

        if spec.phase == "install" {
            if let Some(destdir) = spec.destdir {
                verify_destdir(destdir, spec.phase)?;
            }
        }

        Ok(())
    }

    fn wait_with_timeout(&self, child: &mut Child, spec: &PhaseSpec<'_>) -> Result<ExitStatus> {
        match child
            .wait_timeout(spec.timeout)
            .map_err(|e| Error::IoError(format!("wait for child: {e}")))?
        {
            Some(status) => Ok(status),
            None => {
                debug!(
                    pkg = spec.package,
                    phase = spec.phase,
                    "timeout fired, killing process group"
                );
                let pgid = child.id() as i32;
                unsafe {
                    libc::killpg(pgid, libc::SIGKILL);
                }
                let status = child
                    .wait()
                    .map_err(|e| Error::IoError(format!("reap child: {e}")))?;

                // The child may have exited on its own in the instant before
                // the kill; a successful exit status wins over the timeout.
                if status.success() {
                    return Ok(status);
                }

                Err(Error::TimedOut {
                    phase: spec.phase.to_string(),
                    seconds: spec.timeout.as_secs(),
                })
            }
        }
    }
}

/// Tee one output stream line-by-line into the shared log writer and the
/// capture buffer. Per-stream line ordering is preserved by construction.
fn tee_stream(
    stream: impl std::io::Read + Send + 'static,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    captured: Arc<Mutex<String>>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            if let Ok(mut w) = writer.lock() {
                let _ = writeln!(w, "{line}");
            }
            if let Ok(mut c) = captured.lock() {
                c.push_str(&line);
                c.push('\n');
            }
        }
    })
}

/// The install phase must leave at least one regular file in the destdir
/// other than libtool droppings (`*.la`) and pkg-config files (`*.pc`).
fn verify_destdir(destdir: &Path, phase: &str) -> Result<()> {
    if !crate::package::has_payload(destdir) {
        return Err(Error::SilentError {
            phase: phase.to_string(),
            pattern: "empty destdir".to_string(),
        });
    }
    Ok(())
}
