use serde::{Deserialize, Serialize};

use super::{CompiledSchema, TableFormat};

/// What a schema change will have to rebuild, derived from the old and new definitions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangePlan {
    pub header_change: bool,
    pub rebuild_data: bool,
    pub rebuild_blobs: bool,
    pub instant: bool,
    pub added_indexes: Vec<String>,
    pub dropped_indexes: Vec<String>,
    pub rebuilt_indexes: Vec<String>,
}

impl ChangePlan {
    pub fn between(
        old: &CompiledSchema,
        old_format: &TableFormat,
        new: &CompiledSchema,
        new_format: &TableFormat,
    ) -> ChangePlan {
        let mut plan = ChangePlan::default();

        if old_format.odh != new_format.odh {
            plan.header_change = true;
            plan.rebuild_data = true;
            plan.rebuild_blobs = true;
        }
        if old_format.compress != new_format.compress {
            plan.rebuild_data = true;
        }
        if old_format.compress_blobs != new_format.compress_blobs {
            plan.rebuild_blobs = true;
        }

        // Columns present in both must keep their position and type
        let common = old.columns.len().min(new.columns.len());
        let prefix_unchanged = old.columns[..common]
            .iter()
            .zip(&new.columns[..common])
            .all(|(a, b)| a.name == b.name && a.ty == b.ty);
        let appended = &new.columns[common..];
        let dropped_columns = old.columns.len() > new.columns.len();

        if !prefix_unchanged || dropped_columns {
            plan.rebuild_data = true;
        } else if !appended.is_empty() {
            let appendable = appended.iter().all(|c| c.nullable || c.default.is_some());
            if appendable && new_format.instant_schema_change && !plan.rebuild_data {
                plan.instant = true;
            } else {
                plan.rebuild_data = true;
            }
        }

        let old_blobs: Vec<_> = old.columns.iter().filter(|c| c.is_blob()).collect();
        let new_blobs: Vec<_> = new.columns.iter().filter(|c| c.is_blob()).collect();
        if old_blobs.len() != new_blobs.len()
            || old_blobs.iter().zip(&new_blobs).any(|(a, b)| a.name != b.name || a.ty != b.ty)
        {
            if !plan.instant {
                plan.rebuild_blobs = true;
            }
        }

        for index in &new.indexes {
            match old.index(&index.name) {
                None => plan.added_indexes.push(index.name.clone()),
                Some(prev) => {
                    let retyped = index.columns.iter().any(|col| {
                        match (old.column(col), new.column(col)) {
                            (Some(a), Some(b)) => a.ty != b.ty,
                            _ => true,
                        }
                    });
                    if prev != index || retyped || plan.rebuild_data {
                        plan.rebuilt_indexes.push(index.name.clone());
                    }
                }
            }
        }
        for index in &old.indexes {
            if new.index(&index.name).is_none() {
                plan.dropped_indexes.push(index.name.clone());
            }
        }

        plan
    }

    pub fn is_noop(&self) -> bool {
        *self == ChangePlan::default()
    }

    /// Operator-facing description, one line per effect
    pub fn report_lines(&self, table: &str) -> Vec<String> {
        if self.is_noop() {
            return vec![format!(">Table {} has no changes", table)];
        }

        let mut lines = Vec::new();
        if self.header_change {
            lines.push(format!(">Table {} record headers will change", table));
        }
        if self.instant {
            lines.push(format!(">Table {} will be changed instantly", table));
        }
        if self.rebuild_data {
            lines.push(format!(">Table {} data will be rebuilt", table));
        }
        if self.rebuild_blobs {
            lines.push(format!(">Table {} blobs will be rebuilt", table));
        }
        for name in &self.added_indexes {
            lines.push(format!(">Index {} will be added", name));
        }
        for name in &self.dropped_indexes {
            lines.push(format!(">Index {} will be dropped", name));
        }
        for name in &self.rebuilt_indexes {
            lines.push(format!(">Index {} will be rebuilt", name));
        }
        lines
    }
}
