use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::Config;
use crate::coordinator::{
    CancelToken, Clock, LocalSlotCoordinator, MaintenanceRegistry, ResumeBarrier,
    SlotCoordinator, SystemClock,
};
use crate::genid::{GenidGenerator, GenidLayout};
use crate::memory::{LocalMigration, MemoryStorage, StaticCluster};
use crate::meta_store::SqliteMetaStore;
use crate::request::SchemaChangeRequest;
use crate::schema::TextSchemaCompiler;
use crate::shadow::LinkRegistry;
use crate::traits::{
    Catalog, Cluster, IdGenerator, MetaStore, MigrationBody, SchemaCompiler, Storage,
    StripeLocator,
};

/// Tunables for the coordinator, taken from the `[schema_change]` and
/// `[cluster]` config sections
#[derive(Debug, Clone)]
pub struct ScSettings {
    pub envname: String,
    pub data_stripes: usize,
    pub cancel_wait_tries: u32,
    pub cancel_poll: Duration,
    pub resume_warn: Duration,
    pub resume_poll: Duration,
    pub marker_dir: PathBuf,
}

impl Default for ScSettings {
    fn default() -> Self {
        ScSettings {
            envname: "livesc".into(),
            data_stripes: 8,
            cancel_wait_tries: 10,
            cancel_poll: Duration::from_secs(1),
            resume_warn: Duration::from_millis(300),
            resume_poll: Duration::from_millis(10),
            marker_dir: std::env::temp_dir(),
        }
    }
}

impl ScSettings {
    pub fn from_config(config: &Config) -> Self {
        let sc = &config.schema_change;
        ScSettings {
            envname: config.cluster.envname.clone(),
            data_stripes: sc.data_stripes,
            cancel_wait_tries: sc.cancel_wait_secs.div_ceil(sc.cancel_poll_secs.max(1)) as u32,
            cancel_poll: Duration::from_secs(sc.cancel_poll_secs),
            resume_warn: Duration::from_millis(sc.resume_warn_ms),
            resume_poll: Duration::from_millis(sc.resume_poll_ms),
            marker_dir: PathBuf::from(&sc.marker_dir),
        }
    }

    /// Presence of this file makes resume discard the in-flight schema change
    pub fn abort_marker(&self) -> PathBuf {
        self.marker_dir.join(format!("{}.scabort", self.envname))
    }
}

/// Everything a schema change needs from the node it runs on
pub struct ScEnv {
    pub settings: ScSettings,
    pub cluster: Arc<dyn Cluster>,
    pub ids: Arc<dyn IdGenerator>,
    pub locator: Arc<dyn StripeLocator>,
    pub meta: Arc<dyn MetaStore>,
    pub catalog: Arc<dyn Catalog>,
    pub compiler: Arc<dyn SchemaCompiler>,
    pub storage: Arc<dyn Storage>,
    pub body: Arc<dyn MigrationBody>,
    pub slot: Arc<dyn SlotCoordinator>,
    pub clock: Arc<dyn Clock>,
    pub maintenance: Arc<MaintenanceRegistry>,
    pub resume_barrier: ResumeBarrier,
    pub links: LinkRegistry,
    /// Held for writing while partition commands run
    pub schema_lock: RwLock<()>,
}

impl ScEnv {
    /// A node that is its own master, with metadata and catalog in `store`
    pub fn single_node(config: &Config, store: Arc<SqliteMetaStore>) -> Arc<ScEnv> {
        let settings = ScSettings::from_config(config);
        let layout = GenidLayout::new(settings.data_stripes);
        Arc::new(ScEnv {
            settings,
            cluster: Arc::new(StaticCluster::single(&config.cluster.node)),
            ids: Arc::new(GenidGenerator::new(layout)),
            locator: Arc::new(layout),
            meta: store.clone(),
            catalog: store,
            compiler: Arc::new(TextSchemaCompiler::new()),
            storage: Arc::new(MemoryStorage::new()),
            body: Arc::new(LocalMigration),
            slot: Arc::new(LocalSlotCoordinator::new()),
            clock: Arc::new(SystemClock),
            maintenance: Arc::new(MaintenanceRegistry::new()),
            resume_barrier: ResumeBarrier::new(),
            links: LinkRegistry::new(),
            schema_lock: RwLock::new(()),
        })
    }
}

/// What a migration body gets to see while it runs
pub struct ScContext<'a> {
    pub request: &'a SchemaChangeRequest,
    pub env: &'a ScEnv,
    pub cancel: CancelToken,
}

impl ScContext<'_> {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
