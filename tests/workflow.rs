// tests/workflow.rs

//! End-to-end pipeline scenarios over synthetic two-package fleets.

mod common;

use common::{recipe, store_of, two_package_fleet, Harness};
use smelt::{BuildOptions, Outcome, RunResult, StateKind, Status};

#[test]
fn happy_path_builds_both_packages() {
    let harness = Harness::new();
    let store = two_package_fleet(&harness);
    let scheduler = harness.scheduler(BuildOptions::default());

    let report = scheduler.schedule(&store, &[], 2).unwrap();
    assert!(report.success(), "{:?}", report.results);
    assert_eq!(report.results["a"], RunResult::Built);
    assert_eq!(report.results["b"], RunResult::Built);

    // Both artifacts exist, with sidecars.
    let artifact_a = harness.layout.artifact("a", "1");
    let artifact_b = harness.layout.artifact("b", "1");
    assert!(artifact_a.exists());
    assert!(artifact_b.exists());
    assert!(smelt::package::verify_artifact(&artifact_a).is_ok());

    // Dependency ordering is visible in the state timestamps.
    let state = smelt::StateStore::new(harness.layout.clone());
    let a = state.read(StateKind::Build, "a").unwrap().unwrap();
    let b = state.read(StateKind::Build, "b").unwrap().unwrap();
    assert_eq!(a.status, Status::Ok);
    assert_eq!(b.status, Status::Ok);
    assert!(a.timestamp <= b.timestamp);

    // Merged snapshot regenerated at end of run.
    assert!(harness.layout.snapshot_file(StateKind::Build).exists());

    // Checksums recorded in state match the fixtures.
    assert_eq!(a.sources.len(), 1);
    assert!(a.sources[0].sha256.is_some());
}

#[test]
fn checksum_mismatch_recovers_via_mirror() {
    let harness = Harness::new();
    let (good_url, good_sum) = harness.make_archive("a.tar.gz", &[("a-1/README", "a")]);
    let (bad_url, _) = harness.make_file("wrong.tar.gz", b"not the archive at all");

    let store = store_of(vec![recipe(&format!(
        r#"
name: a
version: "1"
sources:
  - url: {bad_url}
    sha256: {good_sum}
    mirrors: [{good_url}]
build:
  make: "true"
  install: mkdir -p $DESTDIR/usr/bin && echo x > $DESTDIR/usr/bin/x
"#
    ))]);

    let scheduler = harness.scheduler(BuildOptions::default());
    let report = scheduler.schedule(&store, &[], 1).unwrap();
    assert_eq!(report.results["a"], RunResult::Built);

    // Exactly one quarantined download from the mismatching primary.
    let quarantined: Vec<_> = std::fs::read_dir(harness.layout.quarantine_dir())
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(quarantined.len(), 1);
}

#[test]
fn silent_make_failure_blocks_dependent() {
    let harness = Harness::new();
    let (url_a, sum_a) = harness.make_archive("a.tar.gz", &[("a-1/README", "a")]);
    let (url_b, sum_b) = harness.make_archive("b.tar.gz", &[("b-1/README", "b")]);

    let store = store_of(vec![
        recipe(&format!(
            r#"
name: a
version: "1"
sources:
  - url: {url_a}
    sha256: {sum_a}
build:
  make: "echo 'ld: cannot find -lfoo'; exit 0"
"#
        )),
        recipe(&format!(
            r#"
name: b
version: "1"
depends: [a]
sources:
  - url: {url_b}
    sha256: {sum_b}
build:
  make: "true"
"#
        )),
    ]);

    let scheduler = harness.scheduler(BuildOptions::default());
    let report = scheduler.schedule(&store, &[], 2).unwrap();

    assert!(!report.success());
    assert_eq!(
        report.results["a"],
        RunResult::Failed {
            phase: "make".to_string(),
            reason: "silent_error".to_string(),
        }
    );
    assert_eq!(
        report.results["b"],
        RunResult::Blocked {
            by: "a".to_string()
        }
    );

    // The failure is durable, with the spec'd reason code.
    let state = smelt::StateStore::new(harness.layout.clone());
    let a = state.read(StateKind::Build, "a").unwrap().unwrap();
    assert_eq!(a.status, Status::Failed);
    assert_eq!(a.phase, "make");
    assert_eq!(a.reason.as_deref(), Some("silent_error"));

    // B was never dispatched: no state record, no logs.
    assert!(state.read(StateKind::Build, "b").unwrap().is_none());
    assert!(!harness.layout.log_dir("b").exists());
}

#[test]
fn dependency_cycle_fails_before_any_phase() {
    let harness = Harness::new();
    let store = store_of(vec![
        recipe("name: a\nversion: '1'\ndepends: [b]\nsources: [x.tar.gz]\n"),
        recipe("name: b\nversion: '1'\ndepends: [a]\nsources: [y.tar.gz]\n"),
    ]);

    let scheduler = harness.scheduler(BuildOptions::default());
    let err = scheduler.schedule(&store, &[], 2).unwrap_err();

    let message = err.to_string();
    assert!(message.contains('a') && message.contains('b'), "{message}");

    // Nothing was started: no state, no workspaces.
    let state = smelt::StateStore::new(harness.layout.clone());
    assert!(state.read(StateKind::Build, "a").unwrap().is_none());
    assert!(state.read(StateKind::Build, "b").unwrap().is_none());
}

#[test]
fn resume_skips_ok_and_restarts_failed() {
    let harness = Harness::new();
    let (url_a, sum_a) = harness.make_archive("a.tar.gz", &[("a-1/README", "a")]);
    let (url_b, sum_b) = harness.make_archive("b.tar.gz", &[("b-1/README", "b")]);

    let a_yaml = format!(
        r#"
name: a
version: "1"
sources:
  - url: {url_a}
    sha256: {sum_a}
build:
  make: "true"
  install: mkdir -p $DESTDIR/usr/bin && echo x > $DESTDIR/usr/bin/x
"#
    );

    // Run 1: B fails in configure.
    let store = store_of(vec![
        recipe(&a_yaml),
        recipe(&format!(
            r#"
name: b
version: "1"
depends: [a]
sources:
  - url: {url_b}
    sha256: {sum_b}
build:
  configure: "false"
"#
        )),
    ]);
    let report = harness
        .scheduler(BuildOptions::default())
        .schedule(&store, &[], 2)
        .unwrap();
    assert_eq!(report.results["a"], RunResult::Built);
    assert!(matches!(
        report.results["b"],
        RunResult::Failed { ref phase, .. } if phase == "configure"
    ));

    let state = smelt::StateStore::new(harness.layout.clone());
    let a_before = state.read(StateKind::Build, "a").unwrap().unwrap();

    // Run 2 with --continue and B's configure fixed.
    std::fs::remove_dir_all(harness.layout.log_dir("a")).unwrap();
    let store = store_of(vec![
        recipe(&a_yaml),
        recipe(&format!(
            r#"
name: b
version: "1"
depends: [a]
sources:
  - url: {url_b}
    sha256: {sum_b}
build:
  configure: "true"
  make: "true"
  install: mkdir -p $DESTDIR/usr/bin && echo x > $DESTDIR/usr/bin/x
"#
        )),
    ]);
    let report = harness
        .scheduler(BuildOptions {
            resume: true,
            ..Default::default()
        })
        .schedule(&store, &[], 2)
        .unwrap();

    assert_eq!(
        report.results["a"],
        RunResult::Skipped {
            reason: "already-built".to_string()
        }
    );
    assert_eq!(report.results["b"], RunResult::Built);

    // A was a pure no-op: no state rewrite, no phase logs.
    let a_after = state.read(StateKind::Build, "a").unwrap().unwrap();
    assert_eq!(a_before.timestamp, a_after.timestamp);
    assert!(!harness.layout.log_dir("a").exists());

    // B restarted from scratch and its configure log proves it reran.
    assert!(harness.layout.log_file("b", "configure").exists());
}

#[test]
fn zero_sources_is_skipped_not_failed() {
    let harness = Harness::new();
    let store = store_of(vec![recipe(
        "name: empty\nversion: '1'\nbuild:\n  make: 'true'\n",
    )]);

    let scheduler = harness.scheduler(BuildOptions::default());
    let report = scheduler.schedule(&store, &[], 1).unwrap();

    assert_eq!(
        report.results["empty"],
        RunResult::Skipped {
            reason: "no-sources-found".to_string()
        }
    );

    let state = smelt::StateStore::new(harness.layout.clone());
    let record = state.read(StateKind::Build, "empty").unwrap().unwrap();
    assert_eq!(record.status, Status::Skipped);
    assert_eq!(record.reason.as_deref(), Some("no-sources-found"));
}

#[test]
fn concurrent_lock_yields_skip_without_corruption() {
    let harness = Harness::new();
    let store = two_package_fleet(&harness);
    let engine = harness.engine(BuildOptions::default());

    // Another "process" holds A's build lock (flock conflicts apply across
    // file descriptors, so a second handle observes Busy).
    let locks = smelt::LockRegistry::new(harness.layout.clone());
    let held = locks.try_acquire("build", "a").unwrap().unwrap();

    let outcome = engine.build(store.find("a").unwrap());
    assert_eq!(
        outcome,
        Outcome::Skipped {
            reason: "locked".to_string(),
            satisfies_dependents: false,
        }
    );

    // The loser wrote nothing: the winner owns the state file.
    let state = smelt::StateStore::new(harness.layout.clone());
    assert!(state.read(StateKind::Build, "a").unwrap().is_none());

    // After release the build goes through and state is well-formed.
    drop(held);
    let outcome = engine.build(store.find("a").unwrap());
    assert!(outcome.is_ok(), "{outcome:?}");
    let record = state.read(StateKind::Build, "a").unwrap().unwrap();
    assert_eq!(record.status, Status::Ok);
}

#[test]
fn patch_applied_in_source_order() {
    let harness = Harness::new();
    let (url, sum) = harness.make_archive("p-1.tar.gz", &[("p-1/value.txt", "one\n")]);

    // Two patches; the second only applies after the first.
    let (patch1_url, _) = harness.make_file(
        "first.patch",
        b"--- a/value.txt\n+++ b/value.txt\n@@ -1 +1 @@\n-one\n+two\n",
    );
    let (patch2_url, _) = harness.make_file(
        "second.patch",
        b"--- a/value.txt\n+++ b/value.txt\n@@ -1 +1 @@\n-two\n+three\n",
    );

    let store = store_of(vec![recipe(&format!(
        r#"
name: p
version: "1"
sources:
  - url: {url}
    sha256: {sum}
  - {patch1_url}
  - {patch2_url}
build:
  make: "grep -q three value.txt"
  install: mkdir -p $DESTDIR/etc && cp value.txt $DESTDIR/etc/value.txt
"#
    ))]);

    let report = harness
        .scheduler(BuildOptions::default())
        .schedule(&store, &[], 1)
        .unwrap();
    assert_eq!(report.results["p"], RunResult::Built, "{:?}", report.results);
}

#[test]
fn empty_destdir_never_packages_ok() {
    let harness = Harness::new();
    let (url, sum) = harness.make_archive("e-1.tar.gz", &[("e-1/README", "e")]);

    // No install command: the phases all succeed, but there is nothing in
    // the destdir to package.
    let store = store_of(vec![recipe(&format!(
        r#"
name: e
version: "1"
sources:
  - url: {url}
    sha256: {sum}
build:
  make: "true"
"#
    ))]);

    let report = harness
        .scheduler(BuildOptions::default())
        .schedule(&store, &[], 1)
        .unwrap();

    assert_eq!(
        report.results["e"],
        RunResult::Failed {
            phase: "package".to_string(),
            reason: "silent_error".to_string(),
        }
    );

    // No artifact was produced for the empty destdir.
    assert!(!harness.layout.artifact("e", "1").exists());

    let state = smelt::StateStore::new(harness.layout.clone());
    let record = state.read(StateKind::Build, "e").unwrap().unwrap();
    assert_eq!(record.status, Status::Failed);
    assert_eq!(record.reason.as_deref(), Some("silent_error"));
}

#[test]
fn failed_workspace_is_quarantined() {
    let harness = Harness::new();
    let (url, sum) = harness.make_archive("q-1.tar.gz", &[("q-1/README", "q")]);

    let store = store_of(vec![recipe(&format!(
        r#"
name: q
version: "1"
sources:
  - url: {url}
    sha256: {sum}
build:
  make: "exit 1"
"#
    ))]);

    let report = harness
        .scheduler(BuildOptions::default())
        .schedule(&store, &[], 1)
        .unwrap();
    assert!(matches!(report.results["q"], RunResult::Failed { .. }));

    // Workspace no longer at its original path; quarantine holds it.
    assert!(!harness.layout.workspace("q").root.exists());
    let quarantined: Vec<String> = std::fs::read_dir(harness.layout.quarantine_dir())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert!(quarantined.iter().any(|n| n.starts_with("q.")));
}

#[test]
fn independent_branch_drains_when_sibling_fails() {
    let harness = Harness::new();
    let (url_a, sum_a) = harness.make_archive("a.tar.gz", &[("a-1/README", "a")]);
    let (url_c, sum_c) = harness.make_archive("c.tar.gz", &[("c-1/README", "c")]);

    let store = store_of(vec![
        recipe(&format!(
            r#"
name: a
version: "1"
sources:
  - url: {url_a}
    sha256: {sum_a}
build:
  make: "exit 1"
"#
        )),
        recipe(&format!(
            r#"
name: c
version: "1"
sources:
  - url: {url_c}
    sha256: {sum_c}
build:
  make: "true"
  install: mkdir -p $DESTDIR/usr && echo x > $DESTDIR/usr/x
"#
        )),
    ]);

    let report = harness
        .scheduler(BuildOptions::default())
        .schedule(&store, &[], 2)
        .unwrap();

    // The failure does not cancel the independent sibling.
    assert!(matches!(report.results["a"], RunResult::Failed { .. }));
    assert_eq!(report.results["c"], RunResult::Built);
}
