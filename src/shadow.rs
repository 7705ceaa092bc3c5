use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::genid::Genid;
use crate::live_sync::LiveSync;
use crate::schema::{CompiledSchema, TableFormat};

/// A record image as seen by the DML path
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub data: Vec<u8>,
    pub blobs: Vec<Option<Vec<u8>>>,
}

impl Record {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Record {
            data: data.into(),
            blobs: Vec::new(),
        }
    }
}

/// Bitmask of the indexes touched by a DML operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMask(pub u64);

impl KeyMask {
    pub const ALL: KeyMask = KeyMask(u64::MAX);
}

/// Per-stripe migration watermarks.
///
/// Only the bulk copier advances a cursor, and only forward. DML paths read
/// without locking: a stale read can only cause a redundant mirror, which the
/// shadow writer absorbs.
#[derive(Debug)]
pub struct ProgressCursors {
    cursors: Vec<AtomicU64>,
}

impl ProgressCursors {
    pub fn new(stripes: usize) -> Self {
        ProgressCursors {
            cursors: (0..stripes).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn stripes(&self) -> usize {
        self.cursors.len()
    }

    /// Cursor for the stripe; `None` when the stripe is out of range
    pub fn get(&self, stripe: usize) -> Option<Genid> {
        self.cursors
            .get(stripe)
            .map(|c| Genid::new(c.load(Ordering::Acquire)))
    }

    /// Move the stripe's cursor forward. Returns false if it was already at or past `genid`.
    pub fn advance(&self, stripe: usize, genid: Genid) -> bool {
        match self.cursors.get(stripe) {
            Some(cursor) => cursor.fetch_max(genid.as_u64(), Ordering::AcqRel) < genid.as_u64(),
            None => false,
        }
    }
}

/// Rebuild work forced on the shadow regardless of the column diff
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildFlags {
    pub header_change: bool,
    pub force_data: bool,
    pub force_blobs: bool,
}

/// The "to" table of a migration
#[derive(Debug)]
pub struct ShadowTable {
    pub name: String,
    pub dbnum: i32,
    pub schema: CompiledSchema,
    pub format: TableFormat,
    pub version: u32,
    pub rebuild: RebuildFlags,
    pub cursors: ProgressCursors,
    prefix: RwLock<Option<String>>,
}

impl ShadowTable {
    pub fn new(
        name: &str,
        dbnum: i32,
        schema: CompiledSchema,
        format: TableFormat,
        stripes: usize,
    ) -> Self {
        ShadowTable {
            name: name.to_string(),
            dbnum,
            schema,
            format,
            version: 0,
            rebuild: RebuildFlags::default(),
            cursors: ProgressCursors::new(stripes),
            prefix: RwLock::new(None),
        }
    }

    pub fn prefix(&self) -> Option<String> {
        self.prefix.read().unwrap().clone()
    }

    pub fn set_prefix(&self, prefix: &str) {
        *self.prefix.write().unwrap() = Some(prefix.to_string());
    }
}

/// Origin table name → live link to its shadow
#[derive(Default)]
pub struct LinkRegistry {
    links: RwLock<HashMap<String, Arc<LiveSync>>>,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, link: LiveSync) -> Arc<LiveSync> {
        let link = Arc::new(link);
        info!(
            "Linking origin table '{}' to shadow (live={})",
            link.origin(),
            link.is_live()
        );
        self.links
            .write()
            .unwrap()
            .insert(link.origin().to_string(), Arc::clone(&link));
        link
    }

    pub fn get(&self, origin: &str) -> Option<Arc<LiveSync>> {
        self.links.read().unwrap().get(origin).cloned()
    }

    pub fn detach(&self, origin: &str) -> Option<Arc<LiveSync>> {
        let removed = self.links.write().unwrap().remove(origin);
        if removed.is_some() {
            info!("Unlinked origin table '{}' from its shadow", origin);
        }
        removed
    }
}
