use log::{error, info};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::path::Path;

use crate::error::ScError;
use crate::schema::{CompiledSchema, TableFormat};
use crate::seed::Seed;
use crate::traits::{Catalog, MetaStore, TableInfo};

const SCHEMA_VERSION: &str = "1";
const PLAN_SEED_KEY: &str = "disable_plan_seed";

const CREATE_SCHEMA_SQL: &str = r#"
BEGIN TRANSACTION;

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

INSERT OR IGNORE INTO meta (key, value) VALUES ('schema_version', '1');

-- Packed request of each table's in-flight schema change
CREATE TABLE IF NOT EXISTS in_schema_change (
    table_name TEXT PRIMARY KEY,
    snapshot BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS tables (
    name TEXT PRIMARY KEY,
    dbnum INTEGER NOT NULL,
    schema_text TEXT NOT NULL,
    schema_version INTEGER NOT NULL,
    format TEXT NOT NULL
);

COMMIT;
"#;

type Conn = PooledConnection<SqliteConnectionManager>;

/// Metadata and catalog kept in a SQLite file
pub struct SqliteMetaStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteMetaStore {
    pub fn open(path: &Path) -> Result<Self, ScError> {
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder().max_size(4).build(manager)?;
        let store = SqliteMetaStore { pool };
        store.ensure_schema()?;
        info!("Metadata store opened at: {}", path.display());
        Ok(store)
    }

    /// Every in-memory connection is its own database, so the pool holds one
    pub fn open_in_memory() -> Result<Self, ScError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;
        let store = SqliteMetaStore { pool };
        store.ensure_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<Conn, ScError> {
        Ok(self.pool.get()?)
    }

    fn ensure_schema(&self) -> Result<(), ScError> {
        let conn = self.conn()?;
        conn.execute_batch(CREATE_SCHEMA_SQL)?;

        let stored_version: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match stored_version.as_deref() {
            Some(SCHEMA_VERSION) => Ok(()),
            Some(other) => Err(ScError::Error(format!(
                "Metadata schema version mismatch: found {}, expected {}",
                other, SCHEMA_VERSION
            ))),
            None => Err(ScError::Error("Metadata schema version missing".to_string())),
        }
    }

    fn load_table(&self, name: &str) -> Result<Option<TableInfo>, ScError> {
        let conn = self.conn()?;
        let row: Option<(i32, String, u32, String)> = conn
            .query_row(
                "SELECT dbnum, schema_text, schema_version, format FROM tables WHERE name = ?",
                [name],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        row.map(|(dbnum, schema_text, schema_version, format)| {
            let format: TableFormat = serde_json::from_str(&format)
                .map_err(|e| ScError::Error(format!("bad format for table '{}': {}", name, e)))?;
            Ok(TableInfo {
                name: name.to_string(),
                dbnum,
                schema_text,
                schema_version,
                format,
            })
        })
        .transpose()
    }
}

impl MetaStore for SqliteMetaStore {
    fn in_schema_change(&self, table: &str) -> Result<Option<Vec<u8>>, ScError> {
        let conn = self.conn()?;
        let snapshot = conn
            .query_row(
                "SELECT snapshot FROM in_schema_change WHERE table_name = ?",
                [table],
                |row| row.get(0),
            )
            .optional()?;
        Ok(snapshot)
    }

    fn set_in_schema_change(&self, table: &str, snapshot: Option<&[u8]>) -> Result<(), ScError> {
        let conn = self.conn()?;
        match snapshot {
            Some(bytes) => conn.execute(
                "INSERT OR REPLACE INTO in_schema_change (table_name, snapshot) VALUES (?, ?)",
                params![table, bytes],
            )?,
            None => conn.execute(
                "DELETE FROM in_schema_change WHERE table_name = ?",
                [table],
            )?,
        };
        Ok(())
    }

    fn pending_tables(&self) -> Result<Vec<String>, ScError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT table_name FROM in_schema_change ORDER BY table_name")?;
        let tables = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(tables)
    }

    fn set_disable_plan_seed(&self, seed: Seed) -> Result<(), ScError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)",
            params![PLAN_SEED_KEY, seed.to_string()],
        )?;
        Ok(())
    }

    fn disable_plan_seed(&self) -> Result<Option<Seed>, ScError> {
        let conn = self.conn()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?",
                [PLAN_SEED_KEY],
                |row| row.get(0),
            )
            .optional()?;

        value
            .map(|hex| {
                u64::from_str_radix(&hex, 16)
                    .map(Seed::from_raw)
                    .map_err(|e| ScError::Error(format!("bad plan seed '{}': {}", hex, e)))
            })
            .transpose()
    }
}

impl Catalog for SqliteMetaStore {
    fn table(&self, name: &str) -> Option<TableInfo> {
        match self.load_table(name) {
            Ok(info) => info,
            Err(e) => {
                error!("Reading catalog entry for '{}': {}", name, e);
                None
            }
        }
    }

    fn put_table(&self, info: TableInfo) -> Result<(), ScError> {
        let format = serde_json::to_string(&info.format)
            .map_err(|e| ScError::Error(format!("encoding format: {}", e)))?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO tables (name, dbnum, schema_text, schema_version, format)
                VALUES (?, ?, ?, ?, ?)",
            params![info.name, info.dbnum, info.schema_text, info.schema_version, format],
        )?;
        Ok(())
    }

    fn remove_table(&self, name: &str) -> Result<(), ScError> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM tables WHERE name = ?", [name])?;
        if removed == 0 {
            return Err(ScError::TableNotFound(name.to_string()));
        }
        Ok(())
    }

    fn verify_constraints(&self, candidate: &CompiledSchema) -> Result<(), String> {
        candidate.check_references(|name| self.table(name).map(|t| t.schema_text))
    }
}
