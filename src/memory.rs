//! In-process collaborators. A single node runs with these (plus the SQLite
//! metadata store), and the tests drive the coordinator through them.

use log::{debug, info};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::env::ScContext;
use crate::error::ScError;
use crate::genid::Genid;
use crate::live_sync::LiveSync;
use crate::request::RequestBody;
use crate::schema::{CompiledSchema, TransientSchema};
use crate::seed::Seed;
use crate::shadow::{KeyMask, Record, ShadowTable};
use crate::traits::{
    Catalog, Cluster, MetaStore, MigrationBody, ShadowWriter, Storage, TableInfo, UpdateKeys,
};

/// Fixed cluster view; the master can be moved by hand
pub struct StaticCluster {
    me: String,
    master: RwLock<Option<String>>,
}

impl StaticCluster {
    pub fn new(me: &str, master: Option<&str>) -> Self {
        StaticCluster {
            me: me.to_string(),
            master: RwLock::new(master.map(str::to_string)),
        }
    }

    /// A cluster of one
    pub fn single(me: &str) -> Self {
        Self::new(me, Some(me))
    }

    pub fn set_master(&self, master: Option<&str>) {
        *self.master.write().unwrap() = master.map(str::to_string);
    }
}

impl Cluster for StaticCluster {
    fn master(&self) -> Option<String> {
        self.master.read().unwrap().clone()
    }

    fn my_node(&self) -> String {
        self.me.clone()
    }
}

#[derive(Default)]
pub struct MemoryMetaStore {
    snapshots: Mutex<BTreeMap<String, Vec<u8>>>,
    plan_seed: Mutex<Option<Seed>>,
    fail_writes: AtomicBool,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail until switched back
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), ScError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ScError::Storage("metadata store is read-only".into()));
        }
        Ok(())
    }
}

impl MetaStore for MemoryMetaStore {
    fn in_schema_change(&self, table: &str) -> Result<Option<Vec<u8>>, ScError> {
        Ok(self.snapshots.lock().unwrap().get(table).cloned())
    }

    fn set_in_schema_change(&self, table: &str, snapshot: Option<&[u8]>) -> Result<(), ScError> {
        self.check_writable()?;
        let mut snapshots = self.snapshots.lock().unwrap();
        match snapshot {
            Some(bytes) => {
                snapshots.insert(table.to_string(), bytes.to_vec());
            }
            None => {
                snapshots.remove(table);
            }
        }
        Ok(())
    }

    fn pending_tables(&self) -> Result<Vec<String>, ScError> {
        Ok(self.snapshots.lock().unwrap().keys().cloned().collect())
    }

    fn set_disable_plan_seed(&self, seed: Seed) -> Result<(), ScError> {
        self.check_writable()?;
        *self.plan_seed.lock().unwrap() = Some(seed);
        Ok(())
    }

    fn disable_plan_seed(&self) -> Result<Option<Seed>, ScError> {
        Ok(*self.plan_seed.lock().unwrap())
    }
}

#[derive(Default)]
pub struct MemoryCatalog {
    tables: RwLock<BTreeMap<String, TableInfo>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Catalog for MemoryCatalog {
    fn table(&self, name: &str) -> Option<TableInfo> {
        self.tables.read().unwrap().get(name).cloned()
    }

    fn put_table(&self, info: TableInfo) -> Result<(), ScError> {
        self.tables.write().unwrap().insert(info.name.clone(), info);
        Ok(())
    }

    fn remove_table(&self, name: &str) -> Result<(), ScError> {
        match self.tables.write().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(ScError::TableNotFound(name.to_string())),
        }
    }

    fn verify_constraints(&self, candidate: &CompiledSchema) -> Result<(), String> {
        let tables = self.tables.read().unwrap();
        candidate.check_references(|name| tables.get(name).map(|t| t.schema_text.clone()))
    }
}

/// Storage steps that can be told to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageStep {
    Prepare,
    Prefix,
    Open,
    Add,
}

#[derive(Default)]
pub struct MemoryStorage {
    failing: Mutex<HashSet<StorageStep>>,
    next_prefix: AtomicU64,
    opened: Mutex<Vec<(String, String)>>,
    added: Mutex<Vec<String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, step: StorageStep) {
        self.failing.lock().unwrap().insert(step);
    }

    /// (table, prefix) pairs opened so far
    pub fn opened(&self) -> Vec<(String, String)> {
        self.opened.lock().unwrap().clone()
    }

    pub fn added(&self) -> Vec<String> {
        self.added.lock().unwrap().clone()
    }

    fn check(&self, step: StorageStep) -> Result<(), String> {
        if self.failing.lock().unwrap().contains(&step) {
            return Err(format!("{:?} failed", step));
        }
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn prepare_access(&self, _shadow: &ShadowTable) -> Result<(), String> {
        self.check(StorageStep::Prepare)
    }

    fn new_prefix(&self) -> Result<String, String> {
        self.check(StorageStep::Prefix)?;
        let n = self.next_prefix.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("{:08x}", n))
    }

    fn open_shadow(&self, shadow: &ShadowTable, prefix: &str) -> Result<(), String> {
        self.check(StorageStep::Open)?;
        self.opened
            .lock()
            .unwrap()
            .push((shadow.name.clone(), prefix.to_string()));
        Ok(())
    }

    fn add_table(&self, table: &ShadowTable) -> Result<(), String> {
        self.check(StorageStep::Add)?;
        self.added.lock().unwrap().push(table.name.clone());
        Ok(())
    }
}

/// A write applied to a `MemoryShadow`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShadowOp {
    Add(Genid),
    Delete(Genid),
    Update(Genid, Genid),
    DeferredKeys(Genid),
}

/// Writes staged inside one caller transaction
#[derive(Debug, Default)]
pub struct ShadowTxn {
    staged: Vec<(ShadowOp, Option<Record>)>,
}

/// Shadow table rows kept in a map. Counts writes that would duplicate or
/// lose a record.
#[derive(Default)]
pub struct MemoryShadow {
    rows: Mutex<BTreeMap<Genid, Record>>,
    applied: Mutex<Vec<ShadowOp>>,
    conflicts: AtomicU64,
}

impl MemoryShadow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> ShadowTxn {
        ShadowTxn::default()
    }

    pub fn commit(&self, txn: ShadowTxn) {
        let mut rows = self.rows.lock().unwrap();
        let mut applied = self.applied.lock().unwrap();
        for (op, record) in txn.staged {
            match (&op, record) {
                (ShadowOp::Add(genid), Some(record)) => {
                    if rows.insert(*genid, record).is_some() {
                        self.conflicts.fetch_add(1, Ordering::SeqCst);
                    }
                }
                (ShadowOp::Delete(genid), _) => {
                    if rows.remove(genid).is_none() {
                        self.conflicts.fetch_add(1, Ordering::SeqCst);
                    }
                }
                (ShadowOp::Update(old, new), Some(record)) => {
                    if rows.remove(old).is_none() {
                        self.conflicts.fetch_add(1, Ordering::SeqCst);
                    }
                    if rows.insert(*new, record).is_some() {
                        self.conflicts.fetch_add(1, Ordering::SeqCst);
                    }
                }
                _ => {}
            }
            applied.push(op);
        }
    }

    /// Bulk copier write, outside any DML transaction
    pub fn put(&self, genid: Genid, record: Record) {
        if self.rows.lock().unwrap().insert(genid, record).is_some() {
            self.conflicts.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn rows(&self) -> BTreeMap<Genid, Record> {
        self.rows.lock().unwrap().clone()
    }

    /// Mirrored writes committed so far, in order
    pub fn applied(&self) -> Vec<ShadowOp> {
        self.applied.lock().unwrap().clone()
    }

    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::SeqCst)
    }
}

impl ShadowWriter for MemoryShadow {
    type Txn = ShadowTxn;

    fn add(
        &self,
        txn: &mut ShadowTxn,
        genid: Genid,
        record: &Record,
        _keys: KeyMask,
    ) -> Result<(), ScError> {
        txn.staged.push((ShadowOp::Add(genid), Some(record.clone())));
        Ok(())
    }

    fn delete(
        &self,
        txn: &mut ShadowTxn,
        genid: Genid,
        _old: &Record,
        _keys: KeyMask,
    ) -> Result<(), ScError> {
        txn.staged.push((ShadowOp::Delete(genid), None));
        Ok(())
    }

    fn update(
        &self,
        txn: &mut ShadowTxn,
        old_genid: Genid,
        _old: &Record,
        new_genid: Genid,
        new: &Record,
        _keys: UpdateKeys<'_>,
    ) -> Result<(), ScError> {
        txn.staged
            .push((ShadowOp::Update(old_genid, new_genid), Some(new.clone())));
        Ok(())
    }

    fn add_deferred_keys(
        &self,
        txn: &mut ShadowTxn,
        genid: Genid,
        _record: &Record,
        _keys: KeyMask,
    ) -> Result<(), ScError> {
        txn.staged.push((ShadowOp::DeferredKeys(genid), None));
        Ok(())
    }
}

/// Migration body of a single node that holds no record data of its own.
///
/// Table changes build and link the shadow and then mark every stripe as
/// copied; finalize writes the new definition into the catalog. Other kinds
/// only honor cancellation.
pub struct LocalMigration;

impl LocalMigration {
    fn build_shadow(ctx: &ScContext<'_>, schema: &CompiledSchema) -> Result<ShadowTable, ScError> {
        let env = ctx.env;
        let request = ctx.request;
        let change = request
            .table_change()
            .ok_or_else(|| ScError::Error("not a table change".into()))?;
        let origin = env.catalog.table(&request.table);
        let current = origin.as_ref().map(|t| t.format).unwrap_or_default();
        let dbnum = change
            .dbnum
            .or_else(|| origin.as_ref().map(|t| t.dbnum))
            .unwrap_or(0);

        let mut shadow = ShadowTable::new(
            &request.table,
            dbnum,
            schema.clone(),
            change.options.resolve(&current),
            env.settings.data_stripes,
        );
        shadow.version = origin.map(|t| t.schema_version + 1).unwrap_or(1);
        Ok(shadow)
    }

    fn mark_copied(shadow: &ShadowTable) {
        for stripe in 0..shadow.cursors.stripes() {
            shadow.cursors.advance(stripe, Genid::new(u64::MAX));
        }
    }
}

impl MigrationBody for LocalMigration {
    fn run(&self, ctx: &ScContext<'_>) -> Result<(), ScError> {
        let env = ctx.env;
        let request = ctx.request;
        if ctx.is_cancelled() {
            return Err(ScError::Aborted);
        }

        let change = match &request.body {
            RequestBody::Table(change) => change,
            other => {
                info!("Nothing to copy for {} on this node: {:?}", request.kind(), other);
                return Ok(());
            }
        };
        if change.drop_table || change.fast_reinit {
            debug!("'{}': no shadow needed for drop/truncate", request.table);
            return Ok(());
        }

        if request.flags.resume {
            if let Some(link) = env.links.get(&request.table) {
                info!("'{}': continuing copy into the reopened shadow", request.table);
                Self::mark_copied(link.shadow());
                return Ok(());
            }
            if change.add_only && env.catalog.table(&request.table).is_none() {
                info!("'{}': storage was recreated at startup", request.table);
                return Ok(());
            }
        }

        let transient = TransientSchema::load(env.compiler.as_ref(), &request.table, &change.schema_text)
            .map_err(ScError::Compile)?;
        env.catalog
            .verify_constraints(transient.schema())
            .map_err(ScError::Constraint)?;
        let shadow = Self::build_shadow(ctx, transient.schema())?;

        if env.catalog.table(&request.table).is_none() {
            env.storage.add_table(&shadow).map_err(ScError::Storage)?;
            return Ok(());
        }

        let prefix = env.storage.new_prefix().map_err(ScError::Storage)?;
        shadow.set_prefix(&prefix);
        env.storage
            .open_shadow(&shadow, &prefix)
            .map_err(ScError::Storage)?;

        let shadow = Arc::new(shadow);
        env.links.attach(LiveSync::new(
            &request.table,
            Arc::clone(&shadow),
            request.flags.live,
            Arc::clone(&env.locator),
        ));
        Self::mark_copied(&shadow);
        Ok(())
    }

    fn finalize(&self, ctx: &ScContext<'_>) -> Result<(), ScError> {
        let env = ctx.env;
        let request = ctx.request;
        let change = match &request.body {
            RequestBody::Table(change) => change,
            _ => return Ok(()),
        };

        if change.drop_table {
            return env.catalog.remove_table(&request.table);
        }
        if change.fast_reinit {
            info!("Table '{}' truncated", request.table);
            return Ok(());
        }

        let format = match env.links.get(&request.table) {
            Some(link) => link.shadow().format,
            None => {
                let current = env
                    .catalog
                    .table(&request.table)
                    .map(|t| t.format)
                    .unwrap_or_default();
                change.options.resolve(&current)
            }
        };
        let previous = env.catalog.table(&request.table);
        let info = TableInfo {
            name: request.table.clone(),
            dbnum: change
                .dbnum
                .or_else(|| previous.as_ref().map(|t| t.dbnum))
                .unwrap_or(0),
            schema_text: change.schema_text.clone(),
            schema_version: previous.map(|t| t.schema_version + 1).unwrap_or(1),
            format,
        };
        info!(
            "Table '{}' now at schema version {}",
            info.name, info.schema_version
        );
        env.catalog.put_table(info)
    }
}
