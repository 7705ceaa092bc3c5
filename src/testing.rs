//! Shared fixtures for unit tests

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::coordinator::{FakeClock, LocalSlotCoordinator, MaintenanceRegistry, ResumeBarrier};
use crate::env::{ScContext, ScEnv, ScSettings};
use crate::error::ScError;
use crate::genid::{GenidGenerator, GenidLayout};
use crate::memory::{LocalMigration, MemoryCatalog, MemoryMetaStore, MemoryStorage, StaticCluster};
use crate::orchestrator::SchemaChangeManager;
use crate::request::SchemaChangeRequest;
use crate::schema::{TableFormat, TextSchemaCompiler};
use crate::seed::Seed;
use crate::shadow::LinkRegistry;
use crate::traits::{Catalog, MigrationBody, TableInfo, WorkerSpawner};

/// Migration body that records what it was asked to do
#[derive(Default)]
pub struct ScriptedBody {
    fail_run: Mutex<Option<String>>,
    fail_finalize: Mutex<Option<String>>,
    runs: AtomicUsize,
    aborted: AtomicUsize,
    finalizes: AtomicUsize,
    last_request: Mutex<Option<SchemaChangeRequest>>,
    checkpoint_seen: Mutex<Option<Vec<u8>>>,
}

impl ScriptedBody {
    pub fn fail_run(&self, message: &str) {
        *self.fail_run.lock().unwrap() = Some(message.to_string());
    }

    pub fn fail_finalize(&self, message: &str) {
        *self.fail_finalize.lock().unwrap() = Some(message.to_string());
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn aborted_runs(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn finalizes(&self) -> usize {
        self.finalizes.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<SchemaChangeRequest> {
        self.last_request.lock().unwrap().clone()
    }

    pub fn last_seed(&self) -> Option<Seed> {
        self.last_request().and_then(|r| r.seed)
    }

    pub fn last_origin_node(&self) -> Option<String> {
        self.last_request().and_then(|r| r.origin_node)
    }

    /// Checkpoint stored for the table while the last run was in progress
    pub fn checkpoint_seen(&self) -> Option<Vec<u8>> {
        self.checkpoint_seen.lock().unwrap().clone()
    }
}

impl MigrationBody for ScriptedBody {
    fn run(&self, ctx: &ScContext<'_>) -> Result<(), ScError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(ctx.request.clone());
        *self.checkpoint_seen.lock().unwrap() =
            ctx.env.meta.in_schema_change(&ctx.request.table)?;

        if ctx.is_cancelled() {
            self.aborted.fetch_add(1, Ordering::SeqCst);
            return Err(ScError::Aborted);
        }
        match self.fail_run.lock().unwrap().clone() {
            Some(message) => Err(ScError::Error(message)),
            None => Ok(()),
        }
    }

    fn finalize(&self, _ctx: &ScContext<'_>) -> Result<(), ScError> {
        self.finalizes.fetch_add(1, Ordering::SeqCst);
        match self.fail_finalize.lock().unwrap().clone() {
            Some(message) => Err(ScError::Error(message)),
            None => Ok(()),
        }
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Queues jobs until the test runs them
#[derive(Default)]
pub struct ManualSpawner {
    jobs: Mutex<Vec<Job>>,
    names: Mutex<Vec<String>>,
}

impl ManualSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn names(&self) -> Vec<String> {
        self.names.lock().unwrap().clone()
    }

    pub fn run_all(&self) {
        let jobs: Vec<Job> = std::mem::take(&mut *self.jobs.lock().unwrap());
        for job in jobs {
            job();
        }
    }
}

impl WorkerSpawner for ManualSpawner {
    fn spawn(&self, name: String, job: Job) -> io::Result<()> {
        self.names.lock().unwrap().push(name);
        self.jobs.lock().unwrap().push(job);
        Ok(())
    }
}

/// Refuses to start anything
pub struct FailingSpawner;

impl WorkerSpawner for FailingSpawner {
    fn spawn(&self, _name: String, _job: Job) -> io::Result<()> {
        Err(io::Error::other("no threads left"))
    }
}

/// One master node wired with in-memory collaborators
pub struct TestNode {
    pub cluster: Arc<StaticCluster>,
    pub meta: Arc<MemoryMetaStore>,
    pub catalog: Arc<MemoryCatalog>,
    pub compiler: Arc<TextSchemaCompiler>,
    pub storage: Arc<MemoryStorage>,
    pub body: Arc<ScriptedBody>,
    pub clock: Arc<FakeClock>,
    pub env: Arc<ScEnv>,
    pub marker_dir: tempfile::TempDir,
}

impl TestNode {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Node whose migrations actually update the catalog
    pub fn local() -> Self {
        Self::build(Some(Arc::new(LocalMigration)))
    }

    fn build(body: Option<Arc<dyn MigrationBody>>) -> Self {
        let cluster = Arc::new(StaticCluster::single("node-a"));
        let meta = Arc::new(MemoryMetaStore::new());
        let catalog = Arc::new(MemoryCatalog::new());
        let compiler = Arc::new(TextSchemaCompiler::new());
        let storage = Arc::new(MemoryStorage::new());
        let scripted = Arc::new(ScriptedBody::default());
        let clock = Arc::new(FakeClock::default());
        let marker_dir = tempfile::tempdir().unwrap();
        let layout = GenidLayout::new(4);

        let settings = ScSettings {
            envname: "testenv".into(),
            data_stripes: 4,
            marker_dir: marker_dir.path().to_path_buf(),
            ..Default::default()
        };
        let body = body.unwrap_or_else(|| scripted.clone() as Arc<dyn MigrationBody>);

        let env = Arc::new(ScEnv {
            settings,
            cluster: cluster.clone(),
            ids: Arc::new(GenidGenerator::new(layout)),
            locator: Arc::new(layout),
            meta: meta.clone(),
            catalog: catalog.clone(),
            compiler: compiler.clone(),
            storage: storage.clone(),
            body,
            slot: Arc::new(LocalSlotCoordinator::new()),
            clock: clock.clone(),
            maintenance: Arc::new(MaintenanceRegistry::new()),
            resume_barrier: ResumeBarrier::new(),
            links: LinkRegistry::new(),
            schema_lock: RwLock::new(()),
        });

        TestNode {
            cluster,
            meta,
            catalog,
            compiler,
            storage,
            body: scripted,
            clock,
            env,
            marker_dir,
        }
    }

    /// Manager that runs async requests on a `ManualSpawner` nobody drives
    pub fn manager(&self) -> SchemaChangeManager {
        self.manager_with(Arc::new(ManualSpawner::new()))
    }

    pub fn manager_with(&self, spawner: Arc<dyn WorkerSpawner>) -> SchemaChangeManager {
        SchemaChangeManager::new(Arc::clone(&self.env), spawner)
    }

    pub fn add_table(&self, name: &str, schema_text: &str, format: TableFormat) {
        self.catalog
            .put_table(TableInfo {
                name: name.to_string(),
                dbnum: 1,
                schema_text: schema_text.to_string(),
                schema_version: 1,
                format,
            })
            .unwrap();
    }
}
