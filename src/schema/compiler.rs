use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::traits::SchemaCompiler;

use super::{Column, CompiledSchema, ForeignKey, IndexDef};

const COLUMN_TYPES: [&str; 12] = [
    "short", "int", "longlong", "u_short", "u_int", "float", "double", "cstring", "byte",
    "datetime", "blob", "vutf8",
];

/// Line-oriented schema compiler used by the local node and in tests.
///
/// ```text
/// # comment
/// column id int
/// column name cstring null default 'none'
/// index pk unique id
/// index by_name name,id
/// constraint by_name -> other:pk
/// ```
///
/// Loaded schemas are registered as transient objects until `backout` removes them.
#[derive(Default)]
pub struct TextSchemaCompiler {
    loaded: Mutex<HashMap<String, CompiledSchema>>,
}

impl TextSchemaCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of loaded schemas that have not been backed out
    pub fn live_transients(&self) -> usize {
        self.loaded.lock().unwrap().len()
    }

    pub fn is_loaded(&self, table: &str) -> bool {
        self.loaded.lock().unwrap().contains_key(table)
    }

    pub fn parse(table: &str, text: &str) -> Result<CompiledSchema, String> {
        let mut schema = CompiledSchema {
            table: table.to_string(),
            columns: Vec::new(),
            indexes: Vec::new(),
            constraints: Vec::new(),
        };
        let mut errors = Vec::new();

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let result = match line.split_whitespace().next() {
                Some("column") => parse_column(line).map(|c| schema.columns.push(c)),
                Some("index") => parse_index(line).map(|i| schema.indexes.push(i)),
                Some("constraint") => parse_constraint(line).map(|c| schema.constraints.push(c)),
                Some(other) => Err(format!("unknown directive '{}'", other)),
                None => Ok(()),
            };
            if let Err(e) = result {
                errors.push(format!("line {}: {}", lineno + 1, e));
            }
        }

        errors.extend(check_references(&schema));

        if errors.is_empty() {
            Ok(schema)
        } else {
            Err(errors.join("\n"))
        }
    }
}

fn parse_column(line: &str) -> Result<Column, String> {
    let mut parts = line.split_whitespace().skip(1);
    let name = parts.next().ok_or("column needs a name")?;
    let ty = parts.next().ok_or("column needs a type")?;
    if !COLUMN_TYPES.contains(&ty) {
        return Err(format!("unknown column type '{}'", ty));
    }

    let mut column = Column {
        name: name.to_string(),
        ty: ty.to_string(),
        nullable: false,
        default: None,
    };
    while let Some(word) = parts.next() {
        match word {
            "null" => column.nullable = true,
            "default" => {
                let value = parts.next().ok_or("default needs a value")?;
                column.default = Some(value.to_string());
            }
            other => return Err(format!("unexpected '{}' in column {}", other, name)),
        }
    }
    Ok(column)
}

fn parse_index(line: &str) -> Result<IndexDef, String> {
    let mut parts = line.split_whitespace().skip(1);
    let name = parts.next().ok_or("index needs a name")?;
    let mut next = parts.next().ok_or("index needs columns")?;
    let unique = next == "unique";
    if unique {
        next = parts.next().ok_or("index needs columns")?;
    }
    if let Some(extra) = parts.next() {
        return Err(format!("unexpected '{}' in index {}", extra, name));
    }
    Ok(IndexDef {
        name: name.to_string(),
        unique,
        columns: next.split(',').map(|c| c.trim().to_string()).collect(),
    })
}

fn parse_constraint(line: &str) -> Result<ForeignKey, String> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() != 4 || parts[2] != "->" {
        return Err("constraint must be 'constraint <index> -> <table>:<index>'".into());
    }
    let (ref_table, ref_index) = parts[3]
        .split_once(':')
        .ok_or("constraint target must be <table>:<index>")?;
    Ok(ForeignKey {
        index: parts[1].to_string(),
        ref_table: ref_table.to_string(),
        ref_index: ref_index.to_string(),
    })
}

fn check_references(schema: &CompiledSchema) -> Vec<String> {
    let mut errors = Vec::new();
    if schema.columns.is_empty() {
        errors.push("schema has no columns".to_string());
    }

    let mut seen = HashSet::new();
    for column in &schema.columns {
        if !seen.insert(column.name.as_str()) {
            errors.push(format!("duplicate column '{}'", column.name));
        }
    }

    let mut seen = HashSet::new();
    for index in &schema.indexes {
        if !seen.insert(index.name.as_str()) {
            errors.push(format!("duplicate index '{}'", index.name));
        }
        for col in &index.columns {
            if schema.column(col).is_none() {
                errors.push(format!("index '{}' uses unknown column '{}'", index.name, col));
            }
        }
    }

    for fk in &schema.constraints {
        if schema.index(&fk.index).is_none() {
            errors.push(format!("constraint uses unknown index '{}'", fk.index));
        }
    }
    errors
}

impl SchemaCompiler for TextSchemaCompiler {
    fn compile(&self, table: &str, text: &str) -> Result<CompiledSchema, String> {
        Self::parse(table, text)
    }

    fn load(&self, table: &str, text: &str) -> Result<CompiledSchema, String> {
        let schema = Self::parse(table, text)?;
        self.loaded
            .lock()
            .unwrap()
            .insert(table.to_string(), schema.clone());
        Ok(schema)
    }

    fn backout(&self, table: &str) {
        self.loaded.lock().unwrap().remove(table);
    }
}
