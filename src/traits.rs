use std::io;

use crate::env::ScContext;
use crate::error::ScError;
use crate::genid::Genid;
use crate::partition::PartitionError;
use crate::schema::{CompiledSchema, TableFormat};
use crate::seed::Seed;
use crate::shadow::{KeyMask, Record, ShadowTable};

/// Cluster membership as seen from this node
pub trait Cluster: Send + Sync {
    /// Name of the current master, if one is known
    fn master(&self) -> Option<String>;

    fn my_node(&self) -> String;

    fn is_master(&self) -> bool {
        self.master().as_deref() == Some(self.my_node().as_str())
    }
}

/// Monotonic 64-bit id source, scoped to the environment
pub trait IdGenerator: Send + Sync {
    fn next_genid(&self) -> Genid;
}

/// Maps a genid to its data stripe
pub trait StripeLocator: Send + Sync {
    fn stripe_of(&self, genid: Genid) -> usize;
}

/// Low-level metadata readable by every node
pub trait MetaStore: Send + Sync {
    /// Packed request snapshot of the table's in-flight schema change
    fn in_schema_change(&self, table: &str) -> Result<Option<Vec<u8>>, ScError>;

    /// Store (`Some`) or clear (`None`) the table's in-flight snapshot
    fn set_in_schema_change(&self, table: &str, snapshot: Option<&[u8]>) -> Result<(), ScError>;

    /// Tables that currently carry an in-flight snapshot, in name order
    fn pending_tables(&self) -> Result<Vec<String>, ScError>;

    fn set_disable_plan_seed(&self, seed: Seed) -> Result<(), ScError>;

    fn disable_plan_seed(&self) -> Result<Option<Seed>, ScError>;
}

/// Catalog entry for an existing table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub name: String,
    pub dbnum: i32,
    pub schema_text: String,
    pub schema_version: u32,
    pub format: TableFormat,
}

pub trait Catalog: Send + Sync {
    fn table(&self, name: &str) -> Option<TableInfo>;

    fn put_table(&self, info: TableInfo) -> Result<(), ScError>;

    fn remove_table(&self, name: &str) -> Result<(), ScError>;

    /// Check a candidate schema's constraints against the rest of the catalog
    fn verify_constraints(&self, candidate: &CompiledSchema) -> Result<(), String>;
}

/// Schema-definition compiler. A loaded schema stays registered until backed out.
pub trait SchemaCompiler: Send + Sync {
    /// Compile without registering anything
    fn compile(&self, table: &str, text: &str) -> Result<CompiledSchema, String>;

    fn load(&self, table: &str, text: &str) -> Result<CompiledSchema, String>;

    fn backout(&self, table: &str);
}

pub trait Storage: Send + Sync {
    /// Prepare record access for a candidate table definition
    fn prepare_access(&self, shadow: &ShadowTable) -> Result<(), String>;

    /// Allocate a fresh file namespace
    fn new_prefix(&self) -> Result<String, String>;

    /// Open (or reopen on resume) shadow storage under the prefix
    fn open_shadow(&self, shadow: &ShadowTable, prefix: &str) -> Result<(), String>;

    /// Create storage for a brand new table
    fn add_table(&self, table: &ShadowTable) -> Result<(), String>;
}

/// The migration itself: bulk copy, index builds and the storage swap
pub trait MigrationBody: Send + Sync {
    fn run(&self, ctx: &ScContext<'_>) -> Result<(), ScError>;

    /// Promote the shadow table to canonical
    fn finalize(&self, ctx: &ScContext<'_>) -> Result<(), ScError>;
}

/// Write target for mirrored DML, always inside the caller's transaction
pub trait ShadowWriter {
    type Txn;

    fn add(&self, txn: &mut Self::Txn, genid: Genid, record: &Record, keys: KeyMask)
        -> Result<(), ScError>;

    fn delete(
        &self,
        txn: &mut Self::Txn,
        genid: Genid,
        old: &Record,
        keys: KeyMask,
    ) -> Result<(), ScError>;

    fn update(
        &self,
        txn: &mut Self::Txn,
        old_genid: Genid,
        old: &Record,
        new_genid: Genid,
        new: &Record,
        keys: UpdateKeys<'_>,
    ) -> Result<(), ScError>;

    fn add_deferred_keys(
        &self,
        txn: &mut Self::Txn,
        genid: Genid,
        record: &Record,
        keys: KeyMask,
    ) -> Result<(), ScError>;
}

/// Index bookkeeping that travels with a mirrored update
#[derive(Debug, Clone, Copy)]
pub struct UpdateKeys<'a> {
    pub insert: KeyMask,
    pub delete: KeyMask,
    pub changed_columns: &'a [usize],
    pub deferred_add: bool,
}

/// Partition/view manager invoked by the admin exchange
pub trait PartitionOps: Send + Sync {
    fn do_partition(&self, name: &str, command: &str) -> Result<(), PartitionError>;
}

/// Starts detached workers. The job is dropped if the worker cannot start.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, name: String, job: Box<dyn FnOnce() + Send + 'static>) -> io::Result<()>;
}

/// Spawns plain detached OS threads
pub struct ThreadSpawner;

impl WorkerSpawner for ThreadSpawner {
    fn spawn(&self, name: String, job: Box<dyn FnOnce() + Send + 'static>) -> io::Result<()> {
        std::thread::Builder::new().name(name).spawn(job).map(|_| ())
    }
}
