use log::{error, info, warn, Level};
use logging_timer::timer;
use std::sync::Arc;

use crate::env::ScEnv;
use crate::error::ScError;
use crate::live_sync::LiveSync;
use crate::request::{snapshot, SchemaChangeRequest};
use crate::schema::TransientSchema;
use crate::shadow::{RebuildFlags, ShadowTable};

/// What startup did about an interrupted schema change
#[derive(Debug)]
pub enum ResumeOutcome {
    /// No table carries an in-flight schema change
    Idle,
    /// A schema change is already running; nothing was touched
    Deferred,
    /// The operator abort marker was present and the checkpoint was cleared
    Aborted { table: String },
    /// The stored request cannot be resumed here and was left alone
    Dropped { table: String },
    /// Storage for a table that was being added was recreated
    AddedTable(Box<SchemaChangeRequest>),
    /// The shadow table was rebuilt and linked to its origin
    Resumed(Box<SchemaChangeRequest>),
}

impl ResumeOutcome {
    /// The request to restart, flagged as a resume
    pub fn into_request(self) -> Option<SchemaChangeRequest> {
        match self {
            ResumeOutcome::AddedTable(request) | ResumeOutcome::Resumed(request) => {
                let mut request = *request;
                request.flags.resume = true;
                request.flags.synchronous = false;
                Some(request)
            }
            _ => None,
        }
    }
}

/// Rebuild the in-memory state of an interrupted schema change so logical
/// recovery and the resumed migration have a shadow to work with.
///
/// Only the first table with a readable checkpoint is considered. Any
/// inconsistency in the checkpoint comes back as `ScError::Recovery`.
pub fn add_schema_change_tables(env: &ScEnv) -> Result<ResumeOutcome, ScError> {
    let _tmr = timer!(Level::Trace; "add_schema_change_tables");

    let slot = env.slot.current();
    if slot.running {
        info!(
            "Schema change in progress (seed {:?} on {:?}), not resuming",
            slot.seed, slot.node
        );
        return Ok(ResumeOutcome::Deferred);
    }

    for table in env.meta.pending_tables()? {
        let bytes = match env.meta.in_schema_change(&table) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => continue,
            Err(e) => {
                error!("Can't read schema change checkpoint of '{}': {}", table, e);
                continue;
            }
        };
        warn!("Table '{}' is in the middle of a schema change", table);

        let request = match snapshot::unpack(&bytes) {
            Ok(request) => request,
            Err(e) => {
                error!("Skipping unreadable checkpoint of '{}': {}", table, e);
                continue;
            }
        };

        let marker = env.settings.abort_marker();
        if marker.exists() {
            warn!(
                "Abort marker {} present, cancelling schema change on '{}'",
                marker.display(),
                table
            );
            match env.meta.set_in_schema_change(&table, None) {
                Ok(()) => return Ok(ResumeOutcome::Aborted { table }),
                Err(e) => error!("Failed to cancel resuming schema change: {}", e),
            }
        }

        let resumable = request
            .table_change()
            .map(|change| !change.fast_reinit)
            .unwrap_or(false);
        if !resumable {
            info!(
                "{} change on '{}' is not resumed at startup",
                request.kind(),
                table
            );
            return Ok(ResumeOutcome::Dropped { table });
        }

        return add_table_for_recovery(env, request);
    }

    Ok(ResumeOutcome::Idle)
}

/// Like `add_schema_change_tables`, but a recovery inconsistency aborts the
/// process. Other errors are returned.
pub fn resume_or_abort(env: &ScEnv) -> Result<ResumeOutcome, ScError> {
    match add_schema_change_tables(env) {
        Err(ScError::Recovery(msg)) => {
            error!("Cannot resume schema change safely: {}", msg);
            log::logger().flush();
            std::process::abort();
        }
        other => other,
    }
}

fn add_table_for_recovery(
    env: &ScEnv,
    request: SchemaChangeRequest,
) -> Result<ResumeOutcome, ScError> {
    let table = request.table.clone();
    let change = request
        .table_change()
        .ok_or_else(|| ScError::Error(format!("'{}' is not a table change", table)))?;

    let origin = match env.catalog.table(&table) {
        Some(origin) => origin,
        None if change.add_only => {
            let _schema = env.schema_lock.write().unwrap();
            let candidate =
                TransientSchema::load(env.compiler.as_ref(), &table, &change.schema_text)
                    .map_err(ScError::Compile)?;
            let added = ShadowTable::new(
                &table,
                change.dbnum.unwrap_or(0),
                candidate.schema().clone(),
                change.options.resolve(&Default::default()),
                env.settings.data_stripes,
            );
            env.storage.add_table(&added).map_err(ScError::Storage)?;
            info!("Recreated storage for table '{}' being added", table);
            return Ok(ResumeOutcome::AddedTable(Box::new(request)));
        }
        None => {
            return Err(ScError::Recovery(format!(
                "couldn't find table <{}>",
                table
            )))
        }
    };

    if change.add_only {
        return Err(ScError::Recovery(format!("table '{}' already exists", table)));
    }

    let format = change.options.resolve(&origin.format);
    let rebuild = if format.odh != origin.format.odh {
        RebuildFlags {
            header_change: true,
            force_data: true,
            force_blobs: true,
        }
    } else {
        RebuildFlags::default()
    };

    let candidate = TransientSchema::load(env.compiler.as_ref(), &table, &change.schema_text)
        .map_err(|e| ScError::Recovery(format!("stored schema for '{}' doesn't compile: {}", table, e)))?;

    let mut shadow = ShadowTable::new(
        &table,
        change.dbnum.unwrap_or(origin.dbnum),
        candidate.schema().clone(),
        format,
        env.settings.data_stripes,
    );
    shadow.version = origin.schema_version + 1;
    shadow.rebuild = rebuild;

    env.storage
        .prepare_access(&shadow)
        .map_err(|e| ScError::Recovery(format!("record access for '{}': {}", table, e)))?;
    env.catalog
        .verify_constraints(candidate.schema())
        .map_err(|e| ScError::Recovery(format!("constraints of '{}': {}", table, e)))?;

    let prefix = env
        .storage
        .new_prefix()
        .map_err(|e| ScError::Recovery(format!("no new prefix for '{}': {}", table, e)))?;
    shadow.set_prefix(&prefix);
    env.storage
        .open_shadow(&shadow, &prefix)
        .map_err(|e| ScError::Recovery(format!("opening shadow of '{}': {}", table, e)))?;

    env.links.attach(LiveSync::new(
        &table,
        Arc::new(shadow),
        request.flags.live,
        Arc::clone(&env.locator),
    ));
    info!(
        "Shadow of '{}' reopened under prefix {} (seed {:?})",
        table, prefix, request.seed
    );
    Ok(ResumeOutcome::Resumed(Box::new(request)))
}
