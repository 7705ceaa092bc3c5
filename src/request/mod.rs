mod kind;
mod report;
pub mod snapshot;

pub use kind::ScKind;
pub use report::ReportSink;

use serde::{Deserialize, Serialize};

use crate::error::ScError;
use crate::genid::Genid;
use crate::schema::{Compression, TableFormat};
use crate::seed::Seed;

/// Requested storage format. `None` keeps the table's current setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageOptions {
    #[serde(default)]
    pub headers: Option<bool>,
    #[serde(default)]
    pub compress: Option<Compression>,
    #[serde(default)]
    pub compress_blobs: Option<Compression>,
    #[serde(default)]
    pub inplace_updates: Option<bool>,
    #[serde(default)]
    pub instant_schema_change: Option<bool>,
}

impl StorageOptions {
    /// Apply the options over a table's current format.
    ///
    /// In-place updates and instant schema change only survive on tables
    /// with on-disk headers.
    pub fn resolve(&self, current: &TableFormat) -> TableFormat {
        let odh = self.headers.unwrap_or(current.odh);
        TableFormat {
            odh,
            compress: self.compress.unwrap_or(current.compress),
            compress_blobs: self.compress_blobs.unwrap_or(current.compress_blobs),
            inplace_updates: odh && self.inplace_updates.unwrap_or(current.inplace_updates),
            instant_schema_change: odh
                && self
                    .instant_schema_change
                    .unwrap_or(current.instant_schema_change),
        }
    }

    /// Options that reproduce `format` exactly
    pub fn from_format(format: &TableFormat) -> Self {
        StorageOptions {
            headers: Some(format.odh),
            compress: Some(format.compress),
            compress_blobs: Some(format.compress_blobs),
            inplace_updates: Some(format.inplace_updates),
            instant_schema_change: Some(format.instant_schema_change),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeFlags {
    /// Keep the table writable and mirror DML into the shadow
    pub live: bool,
    pub use_plan: bool,
    pub resume: bool,
    /// Run on the caller's thread instead of a detached worker
    pub synchronous: bool,
    /// Promote the shadow as soon as the migration body completes
    pub finalize: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableChange {
    pub schema_text: String,
    #[serde(default)]
    pub options: StorageOptions,
    #[serde(default)]
    pub add_only: bool,
    #[serde(default)]
    pub alter_only: bool,
    #[serde(default)]
    pub drop_table: bool,
    #[serde(default)]
    pub fast_reinit: bool,
    #[serde(default)]
    pub same_schema: bool,
    #[serde(default)]
    pub dbnum: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestripeChange {
    pub data_stripes: u32,
    pub blob_stripe: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCreate {
    pub avg_item_size: u32,
    pub page_size: u32,
    pub queue_db: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpgradeMode {
    Full,
    Partial { start_genid: Genid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordUpgrade {
    pub mode: UpgradeMode,
    pub options: StorageOptions,
}

/// Kind-specific payload of a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RequestBody {
    Table(TableChange),
    Restripe(RestripeChange),
    Queue(QueueCreate),
    Upgrade(RecordUpgrade),
}

/// One schema change, from submission to its terminal outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaChangeRequest {
    pub table: String,
    #[serde(default)]
    pub seed: Option<Seed>,
    #[serde(default)]
    pub flags: ChangeFlags,
    #[serde(default)]
    pub origin_node: Option<String>,
    pub body: RequestBody,
    #[serde(skip)]
    pub report: Option<ReportSink>,
}

impl SchemaChangeRequest {
    pub fn new(table: &str, body: RequestBody, flags: ChangeFlags) -> Self {
        SchemaChangeRequest {
            table: table.to_string(),
            seed: None,
            flags,
            origin_node: None,
            body,
            report: None,
        }
    }

    /// Alter a table's schema and storage format
    pub fn format_change(
        table: &str,
        schema_text: &str,
        odh: bool,
        compress: Compression,
        compress_blobs: Compression,
    ) -> Self {
        let change = TableChange {
            schema_text: schema_text.to_string(),
            options: StorageOptions {
                headers: Some(odh),
                compress: Some(compress),
                compress_blobs: Some(compress_blobs),
                ..Default::default()
            },
            ..Default::default()
        };
        let flags = ChangeFlags {
            finalize: true,
            ..Default::default()
        };
        Self::new(table, RequestBody::Table(change), flags)
    }

    pub fn restripe(data_stripes: u32, blob_stripe: bool) -> Self {
        let flags = ChangeFlags {
            finalize: true,
            ..Default::default()
        };
        Self::new(
            "",
            RequestBody::Restripe(RestripeChange {
                data_stripes,
                blob_stripe,
            }),
            flags,
        )
    }

    pub fn queue_create(name: &str, avg_item_size: u32, page_size: u32, queue_db: bool) -> Self {
        let flags = ChangeFlags {
            finalize: true,
            ..Default::default()
        };
        Self::new(
            name,
            RequestBody::Queue(QueueCreate {
                avg_item_size,
                page_size,
                queue_db,
            }),
            flags,
        )
    }

    /// Truncate a table, keeping its schema and every storage setting
    pub fn fast_reinit(table: &str, schema_text: &str) -> Self {
        let change = TableChange {
            schema_text: schema_text.to_string(),
            fast_reinit: true,
            same_schema: true,
            ..Default::default()
        };
        let flags = ChangeFlags {
            synchronous: true,
            finalize: true,
            ..Default::default()
        };
        Self::new(table, RequestBody::Table(change), flags)
    }

    /// Rewrite records into the current format. Exactly one of `full` and
    /// `partial` must be set; a partial upgrade starts at `start_genid`.
    pub fn record_upgrade(
        table: &str,
        start_genid: Genid,
        full: bool,
        partial: bool,
        synchronous: bool,
    ) -> Result<Self, ScError> {
        let mode = match (full, partial) {
            (true, false) => UpgradeMode::Full,
            (false, true) => UpgradeMode::Partial { start_genid },
            _ => {
                return Err(ScError::InvalidArgument(
                    "exactly one of full and partial upgrade must be requested".into(),
                ))
            }
        };
        let upgrade = RecordUpgrade {
            mode,
            options: StorageOptions {
                inplace_updates: Some(true),
                instant_schema_change: Some(true),
                ..Default::default()
            },
        };
        let flags = ChangeFlags {
            live: true,
            finalize: true,
            synchronous,
            ..Default::default()
        };
        Ok(Self::new(table, RequestBody::Upgrade(upgrade), flags))
    }

    pub fn with_report(mut self, sink: ReportSink) -> Self {
        self.report = Some(sink);
        self
    }

    pub fn kind(&self) -> ScKind {
        match self.body {
            RequestBody::Table(_) => ScKind::Table,
            RequestBody::Restripe(_) => ScKind::Restripe,
            RequestBody::Queue(_) => ScKind::Queue,
            RequestBody::Upgrade(_) => ScKind::Upgrade,
        }
    }

    pub fn table_change(&self) -> Option<&TableChange> {
        match &self.body {
            RequestBody::Table(change) => Some(change),
            _ => None,
        }
    }

    pub fn is_upgrade(&self) -> bool {
        matches!(self.body, RequestBody::Upgrade(_))
    }

    /// Send one line of operator-facing output, if anyone is listening
    pub fn report_line(&self, line: impl Into<String>) {
        if let Some(sink) = &self.report {
            sink.line(line);
        }
    }
}
