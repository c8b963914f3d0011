// src/lib.rs

//! smelt: a Linux-From-Scratch build orchestrator
//!
//! Given a fleet of declarative recipes, smelt drives each package through
//! a fixed pipeline — fetch, extract, patch, configure, make, install,
//! strip, package — with bounded concurrency over the dependency DAG,
//! crash-resumable per-package state, advisory locking for multi-process
//! runs, and optional fakeroot/chroot isolation.
//!
//! # Architecture
//!
//! - Filesystem-first: sources cache, workspaces, artifacts, state records,
//!   and locks all live under one root with fixed conventions ([`Layout`])
//! - Per-package state machine with durable transitions ([`pipeline`])
//! - Ready-set parallelism over the dependency graph ([`scheduler`])
//! - Backup-before-overwrite installs with rollback ([`install`])

pub mod config;
mod error;
pub mod events;
pub mod extract;
pub mod fetch;
mod fsutil;
pub mod hash;
pub mod hooks;
pub mod install;
pub mod isolation;
pub mod layout;
pub mod lock;
pub mod package;
pub mod pipeline;
pub mod recipe;
pub mod runner;
pub mod scheduler;
pub mod state;

pub use config::{Config, ModeOverride};
pub use error::{Error, Result};
pub use events::{EventRecorder, FileLogSink, LogRecord, LogSink, NullSink, TracingRecorder};
pub use install::{InstallOptions, Installer};
pub use layout::{Layout, StateKind, Workspace};
pub use lock::{LockHandle, LockRegistry};
pub use pipeline::{BuildContext, BuildOptions, Outcome, PipelineEngine};
pub use recipe::{Recipe, RecipeStore};
pub use scheduler::{RunResult, ScheduleReport, Scheduler};
pub use state::{PackageState, StateStore, Status};
