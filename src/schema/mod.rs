mod compiler;
pub mod plan;

pub use compiler::TextSchemaCompiler;
pub use plan::ChangePlan;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::traits::SchemaCompiler;

/// Compression algorithm for record or blob data
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Compression {
    #[default]
    None,
    Rle,
    Crle,
    Zlib,
    Lz4,
}

/// Storage format flags of a table as it exists on disk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableFormat {
    /// On-disk record headers. In-place updates and instant schema change require them.
    pub odh: bool,
    pub compress: Compression,
    pub compress_blobs: Compression,
    pub inplace_updates: bool,
    pub instant_schema_change: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub ty: String,
    pub nullable: bool,
    pub default: Option<String>,
}

impl Column {
    pub fn is_blob(&self) -> bool {
        matches!(self.ty.as_str(), "blob" | "vutf8")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub unique: bool,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub index: String,
    pub ref_table: String,
    pub ref_index: String,
}

/// Output of the schema compiler for one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledSchema {
    pub table: String,
    pub columns: Vec<Column>,
    pub indexes: Vec<IndexDef>,
    pub constraints: Vec<ForeignKey>,
}

impl CompiledSchema {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn index(&self, name: &str) -> Option<&IndexDef> {
        self.indexes.iter().find(|i| i.name == name)
    }

    /// Check foreign keys against other tables. `lookup` returns the schema
    /// text of a table in the catalog.
    pub fn check_references<F>(&self, lookup: F) -> Result<(), String>
    where
        F: Fn(&str) -> Option<String>,
    {
        for fk in &self.constraints {
            let parsed;
            let target = if fk.ref_table == self.table {
                self
            } else {
                let text = lookup(&fk.ref_table).ok_or_else(|| {
                    format!(
                        "constraint on '{}' refers to missing table '{}'",
                        fk.index, fk.ref_table
                    )
                })?;
                parsed = TextSchemaCompiler::parse(&fk.ref_table, &text)?;
                &parsed
            };
            if target.index(&fk.ref_index).is_none() {
                return Err(format!(
                    "constraint on '{}' refers to missing index '{}:{}'",
                    fk.index, fk.ref_table, fk.ref_index
                ));
            }
        }
        Ok(())
    }
}

/// A schema loaded into the compiler for the lifetime of the guard
pub struct TransientSchema<'a> {
    compiler: &'a dyn SchemaCompiler,
    schema: CompiledSchema,
}

impl<'a> TransientSchema<'a> {
    pub fn load(
        compiler: &'a dyn SchemaCompiler,
        table: &str,
        text: &str,
    ) -> Result<Self, String> {
        let schema = compiler.load(table, text)?;
        Ok(TransientSchema { compiler, schema })
    }

    pub fn schema(&self) -> &CompiledSchema {
        &self.schema
    }
}

impl Drop for TransientSchema<'_> {
    fn drop(&mut self) {
        self.compiler.backout(&self.schema.table);
    }
}
