// tests/common/mod.rs

//! Shared fixtures for integration tests: synthetic fleets built around
//! `file://` source archives in a temporary orchestrator root.

use flate2::write::GzEncoder;
use flate2::Compression;
use smelt::events::FileLogSink;
use smelt::fetch::{Fetcher, GitFetcher};
use smelt::hooks::HookRunner;
use smelt::isolation::IsolationManager;
use smelt::runner::{PhaseRunner, SilentPatterns};
use smelt::{
    BuildContext, BuildOptions, Config, Layout, LockRegistry, ModeOverride, PipelineEngine,
    Recipe, RecipeStore, Scheduler, StateStore, TracingRecorder,
};
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

pub struct Harness {
    pub tmp: TempDir,
    pub layout: Arc<Layout>,
    pub config: Config,
}

impl Harness {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        let layout = Arc::new(Layout::new(&root));
        layout.ensure().unwrap();

        let config = Config {
            root,
            recipes: tmp.path().join("recipes"),
            concurrency: 2,
            timeout: 60,
            retries: 0,
            retry_backoff: 0,
            strip_binaries: false,
            mode: ModeOverride::Direct,
            ..Config::default()
        };

        Self {
            tmp,
            layout,
            config,
        }
    }

    /// Write a gzip'd tar fixture and return its `file://` URL and SHA-256.
    pub fn make_archive(&self, name: &str, files: &[(&str, &str)]) -> (String, String) {
        let path = self.tmp.path().join(name);
        let file = File::create(&path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (file_name, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, file_name, contents.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();

        let sum = smelt::hash::sha256_file(&path).unwrap();
        (format!("file://{}", path.display()), sum)
    }

    /// A plain fixture file (wrong-content mirror, patch, ...).
    pub fn make_file(&self, name: &str, contents: &[u8]) -> (String, PathBuf) {
        let path = self.tmp.path().join(name);
        std::fs::write(&path, contents).unwrap();
        (format!("file://{}", path.display()), path)
    }

    pub fn context(&self) -> Arc<BuildContext> {
        let sink = Arc::new(FileLogSink::new(self.layout.clone()));
        Arc::new(BuildContext {
            config: self.config.clone(),
            layout: self.layout.clone(),
            locks: LockRegistry::new(self.layout.clone()),
            state: StateStore::new(self.layout.clone()),
            fetcher: Fetcher::new(self.layout.clone(), Duration::from_millis(0)).unwrap(),
            git: GitFetcher::new(self.layout.clone()),
            runner: PhaseRunner::new(sink.clone(), SilentPatterns::defaults()),
            isolation: IsolationManager::new(None, self.config.mode),
            hooks: HookRunner::new(self.layout.hooks_dir(), sink.clone()),
            sink,
            recorder: Arc::new(TracingRecorder),
            run_id: Uuid::new_v4(),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn engine(&self, options: BuildOptions) -> Arc<PipelineEngine> {
        Arc::new(PipelineEngine::new(self.context(), options))
    }

    pub fn scheduler(&self, options: BuildOptions) -> Scheduler {
        Scheduler::new(self.engine(options))
    }
}

pub fn recipe(yaml: &str) -> Recipe {
    serde_yaml::from_str(yaml).unwrap()
}

pub fn store_of(recipes: Vec<Recipe>) -> RecipeStore {
    let mut store = RecipeStore::new();
    for r in recipes {
        store.register(r).unwrap();
    }
    store
}

/// The canonical two-package fleet: `B` depends on `A`. Each package builds
/// from its own archive fixture with trivial make/install commands.
pub fn two_package_fleet(harness: &Harness) -> RecipeStore {
    let (url_a, sum_a) = harness.make_archive("a.tar.gz", &[("a-1/README", "a")]);
    let (url_b, sum_b) = harness.make_archive("b.tar.gz", &[("b-1/README", "b")]);

    store_of(vec![
        recipe(&format!(
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
  install: mkdir -p $DESTDIR/usr/bin && echo x > $DESTDIR/usr/bin/x
"#
        )),
    ])
}
