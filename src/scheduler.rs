// src/scheduler.rs

//! Bounded-concurrency scheduling over the dependency DAG
//!
//! The scheduler dispatches ready packages (all dependencies satisfied) to a
//! pool of worker threads, at most `concurrency` in flight at any instant.
//! A failed package blocks its transitive dependents but never cancels
//! siblings; independent branches drain to completion. Cooperative shutdown
//! stops dispatching and lets in-flight workers finish their current phase.

use crate::error::Result;
use crate::layout::StateKind;
use crate::pipeline::{Outcome, PipelineEngine};
use crate::recipe::{Recipe, RecipeStore};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::mpsc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Final disposition of one package in a scheduled run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunResult {
    Built,
    Skipped { reason: String },
    Failed { phase: String, reason: String },
    /// Never dispatched: an ancestor did not complete
    Blocked { by: String },
}

impl RunResult {
    fn from_outcome(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Ok => Self::Built,
            Outcome::Skipped { reason, .. } => Self::Skipped {
                reason: reason.clone(),
            },
            Outcome::Failed { phase, reason } => Self::Failed {
                phase: phase.clone(),
                reason: reason.clone(),
            },
        }
    }
}

/// Outcome of a whole scheduled run
#[derive(Debug, Default)]
pub struct ScheduleReport {
    pub results: BTreeMap<String, RunResult>,
}

impl ScheduleReport {
    /// A run fails if any package ended failed or blocked. Skips (resume
    /// hits, lock contention) are not failures; another process or an
    /// earlier run is responsible for those packages.
    pub fn success(&self) -> bool {
        !self.results.values().any(|r| {
            matches!(r, RunResult::Failed { .. } | RunResult::Blocked { .. })
        })
    }

    pub fn failed(&self) -> Vec<(&str, &RunResult)> {
        self.results
            .iter()
            .filter(|(_, r)| matches!(r, RunResult::Failed { .. } | RunResult::Blocked { .. }))
            .map(|(n, r)| (n.as_str(), r))
            .collect()
    }
}

/// Dispatches packages through the pipeline respecting the DAG
pub struct Scheduler {
    engine: Arc<PipelineEngine>,
}

impl Scheduler {
    pub fn new(engine: Arc<PipelineEngine>) -> Self {
        Self { engine }
    }

    /// Build `targets` (plus transitive dependencies) with at most
    /// `concurrency` packages in flight. An empty target list means the
    /// whole fleet.
    pub fn schedule(
        &self,
        store: &RecipeStore,
        targets: &[String],
        concurrency: usize,
    ) -> Result<ScheduleReport> {
        let ordered = store.topological(targets)?;
        let concurrency = concurrency.max(1);

        let topo_index: HashMap<String, usize> = ordered
            .iter()
            .enumerate()
            .map(|(i, r)| (r.name.clone(), i))
            .collect();
        let selected: HashSet<&str> = ordered.iter().map(|r| r.name.as_str()).collect();

        // Dependency bookkeeping restricted to the selected set.
        let mut in_degree: HashMap<String, usize> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for recipe in &ordered {
            let deps: Vec<&String> = recipe
                .depends
                .iter()
                .filter(|d| selected.contains(d.as_str()))
                .collect();
            in_degree.insert(recipe.name.clone(), deps.len());
            for dep in deps {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(recipe.name.clone());
            }
        }

        let recipes: HashMap<String, Recipe> = ordered
            .iter()
            .map(|r| (r.name.clone(), (*r).clone()))
            .collect();

        let mut ready: VecDeque<String> = ordered
            .iter()
            .filter(|r| in_degree[&r.name] == 0)
            .map(|r| r.name.clone())
            .collect();

        info!(
            packages = ordered.len(),
            concurrency, "scheduling build run"
        );

        let (tx, rx) = mpsc::channel::<(String, Outcome)>();
        let mut report = ScheduleReport::default();
        let mut in_flight = 0usize;

        loop {
            // Dispatch up to the concurrency bound. Shutdown stops new
            // dispatches; in-flight packages finish their current phase.
            while in_flight < concurrency && !self.engine.context().interrupted() {
                let Some(name) = ready.pop_front() else { break };
                if report.results.contains_key(&name) {
                    continue;
                }

                let recipe = recipes[&name].clone();
                let engine = Arc::clone(&self.engine);
                let tx = tx.clone();
                debug!(pkg = %name, "dispatching");
                std::thread::spawn(move || {
                    let outcome = engine.build(&recipe);
                    // The receiver only disappears when the scheduler is
                    // torn down; nothing to report to in that case.
                    let _ = tx.send((recipe.name.clone(), outcome));
                });
                in_flight += 1;
            }

            if in_flight == 0 {
                break;
            }

            let (name, outcome) = rx
                .recv()
                .expect("worker channel closed with builds in flight");
            in_flight -= 1;

            let satisfies = outcome.satisfies_dependents();
            report
                .results
                .insert(name.clone(), RunResult::from_outcome(&outcome));

            if satisfies {
                let mut newly_ready: Vec<String> = Vec::new();
                for dependent in dependents.get(&name).cloned().unwrap_or_default() {
                    if let Some(deg) = in_degree.get_mut(&dependent) {
                        *deg = deg.saturating_sub(1);
                        if *deg == 0 && !report.results.contains_key(&dependent) {
                            newly_ready.push(dependent);
                        }
                    }
                }
                newly_ready.sort_by_key(|n| topo_index[n]);
                ready.extend(newly_ready);
            } else {
                self.block_dependents(&name, &dependents, &mut report);
            }
        }

        // Anything never reached (cooperative shutdown) is recorded so the
        // report covers every selected package.
        for recipe in &ordered {
            report
                .results
                .entry(recipe.name.clone())
                .or_insert_with(|| RunResult::Skipped {
                    reason: "interrupted".to_string(),
                });
        }

        // The merged snapshot is regenerated at end-of-run.
        if let Err(e) = self
            .engine
            .context()
            .state
            .merge_snapshot(StateKind::Build)
        {
            warn!(error = %e, "snapshot regeneration failed");
        }

        Ok(report)
    }

    /// Mark every transitive dependent of `name` as blocked. They are never
    /// dispatched; siblings keep draining.
    fn block_dependents(
        &self,
        name: &str,
        dependents: &HashMap<String, Vec<String>>,
        report: &mut ScheduleReport,
    ) {
        let mut queue: VecDeque<(String, String)> = dependents
            .get(name)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|d| (d, name.to_string()))
            .collect();

        while let Some((pkg, by)) = queue.pop_front() {
            if report.results.contains_key(&pkg) {
                continue;
            }
            warn!(pkg = %pkg, blocked_by = %by, "blocking dependent");
            report
                .results
                .insert(pkg.clone(), RunResult::Blocked { by });
            for next in dependents.get(&pkg).cloned().unwrap_or_default() {
                queue.push_back((next, pkg.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_success_rules() {
        let mut report = ScheduleReport::default();
        report.results.insert("a".into(), RunResult::Built);
        report.results.insert(
            "b".into(),
            RunResult::Skipped {
                reason: "already-built".into(),
            },
        );
        assert!(report.success());

        report.results.insert(
            "c".into(),
            RunResult::Blocked { by: "a".into() },
        );
        assert!(!report.success());
        assert_eq!(report.failed().len(), 1);
    }

    #[test]
    fn test_locked_skip_is_not_failure() {
        let mut report = ScheduleReport::default();
        report.results.insert(
            "a".into(),
            RunResult::Skipped {
                reason: "locked".into(),
            },
        );
        assert!(report.success());
    }
}
