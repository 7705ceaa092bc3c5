use log::{info, Level};
use logging_timer::timer;

use crate::env::ScEnv;
use crate::request::SchemaChangeRequest;
use crate::schema::{ChangePlan, TransientSchema};
use crate::shadow::ShadowTable;

/// Predicted outcome of a schema change. The last line is `SUCCESS` or `FAILED`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DryRunReport {
    pub lines: Vec<String>,
    pub success: bool,
}

impl DryRunReport {
    pub fn text(&self) -> String {
        let mut text = self.lines.join("\n");
        text.push('\n');
        text
    }
}

/// Check what a table change would do without changing anything.
///
/// Every line is also sent to the request's report sink.
pub fn dry_run(env: &ScEnv, request: &SchemaChangeRequest) -> DryRunReport {
    let _tmr = timer!(Level::Trace; "dry_run", "{}", request.table);
    let _schema = env.schema_lock.read().unwrap();

    let mut lines = Vec::new();
    let success = simulate(env, request, &mut lines);
    lines.push(if success { "SUCCESS" } else { "FAILED" }.to_string());

    info!(
        "Dry run of {} change on '{}': {}",
        request.kind(),
        request.table,
        if success { "ok" } else { "would fail" }
    );
    for line in &lines {
        request.report_line(line.clone());
    }
    DryRunReport { lines, success }
}

fn simulate(env: &ScEnv, request: &SchemaChangeRequest, lines: &mut Vec<String>) -> bool {
    let table = &request.table;
    let change = match request.table_change() {
        Some(change) => change,
        None => {
            lines.push(format!("!Dry run is not supported for {} changes", request.kind()));
            return false;
        }
    };

    let origin = env.catalog.table(table);
    match &origin {
        None if change.alter_only || change.fast_reinit || change.drop_table => {
            lines.push(format!(">Table {} does not exist", table));
            return false;
        }
        Some(_) if change.add_only => {
            lines.push(format!(">Table {} already exists", table));
            return false;
        }
        Some(_) if change.drop_table => {
            lines.push(format!(">Table {} will be dropped", table));
            return true;
        }
        Some(_) if change.fast_reinit => {
            lines.push(format!(">Table {} will be truncated", table));
            return true;
        }
        _ => {}
    }

    let candidate = match TransientSchema::load(env.compiler.as_ref(), table, &change.schema_text) {
        Ok(candidate) => candidate,
        Err(errors) => {
            lines.extend(errors.lines().map(|e| format!("!{}", e)));
            return false;
        }
    };

    let origin = match origin {
        Some(origin) => origin,
        None => {
            lines.push(format!(">Table {} will be added.", table));
            return true;
        }
    };

    let format = change.options.resolve(&origin.format);
    let shadow = ShadowTable::new(
        table,
        origin.dbnum,
        candidate.schema().clone(),
        format,
        env.settings.data_stripes,
    );
    if let Err(e) = env.storage.prepare_access(&shadow) {
        lines.push(format!("!Failed to set up record access: {}", e));
        return false;
    }
    if let Err(e) = env.catalog.verify_constraints(candidate.schema()) {
        lines.push(format!("!{}", e));
        return false;
    }

    let current = match env.compiler.compile(table, &origin.schema_text) {
        Ok(current) => current,
        Err(e) => {
            lines.push(format!("!Current schema of {} doesn't compile: {}", table, e));
            return false;
        }
    };
    let plan = ChangePlan::between(&current, &origin.format, candidate.schema(), &format);
    lines.extend(plan.report_lines(table));
    true
}
