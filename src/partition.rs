//! Partition (time-partitioned view) hooks into the schema change machinery,
//! and the line exchange the admin server speaks for them.
//!
//! The exchange is a target line, then free-form command lines, then a line
//! holding only `.`. The command runs under the global schema write lock and
//! the reply is `SUCCESS` or `FAILED rc=<n> err="<text>"`.

use log::{error, info, warn};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::env::ScEnv;
use crate::orchestrator::{Rejection, ScOutcome, SchemaChangeManager};
use crate::request::{ChangeFlags, RequestBody, SchemaChangeRequest, StorageOptions, TableChange};
use crate::traits::PartitionOps;

/// Error class reported back to the view manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewErrorCode {
    Generic,
    /// The operation can't run right now (not master, another change running)
    Exist,
    /// The caller asked for something that doesn't exist
    Bug,
    /// The schema change itself failed
    SchemaChange,
}

impl ViewErrorCode {
    pub fn rc(&self) -> i32 {
        match self {
            ViewErrorCode::Generic => 1,
            ViewErrorCode::Exist => 2,
            ViewErrorCode::Bug => 3,
            ViewErrorCode::SchemaChange => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionError {
    pub code: ViewErrorCode,
    pub message: String,
}

impl PartitionError {
    pub fn new(code: ViewErrorCode, message: impl Into<String>) -> Self {
        PartitionError {
            code,
            message: message.into(),
        }
    }

    pub fn rc(&self) -> i32 {
        self.code.rc()
    }
}

impl fmt::Display for PartitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (rc {})", self.message, self.rc())
    }
}

impl std::error::Error for PartitionError {}

/// One partition exchange as read off the wire
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionCommand {
    pub target: String,
    pub command: String,
    done: bool,
}

impl PartitionCommand {
    pub fn new(target: &str) -> Self {
        PartitionCommand {
            target: target.trim_end_matches(['\r', '\n']).to_string(),
            ..Default::default()
        }
    }

    /// Feed one command line. Returns true once the terminating `.` was seen.
    pub fn push_line(&mut self, line: &str) -> bool {
        let line = line.trim_end_matches(['\r', '\n']);
        if line == "." {
            self.done = true;
        } else if !self.done {
            if !self.command.is_empty() {
                self.command.push('\n');
            }
            self.command.push_str(line);
        }
        self.done
    }

    pub fn is_complete(&self) -> bool {
        self.done
    }

    /// Read one exchange. `None` when the stream ends before a target line.
    ///
    /// A stream that ends before the `.` line yields what was read.
    pub async fn read_from<R>(reader: &mut R) -> io::Result<Option<Self>>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let mut cmd = PartitionCommand::new(&line);
        while !cmd.is_complete() {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                warn!("Partition command for '{}' not terminated", cmd.target);
                break;
            }
            cmd.push_line(&line);
        }
        Ok(Some(cmd))
    }
}

/// Keep an error message on one line inside the quoted `err=` field
fn quote_reply(message: &str) -> String {
    let mut quoted = String::with_capacity(message.len());
    for c in message.chars() {
        match c {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            c => quoted.push(c),
        }
    }
    quoted
}

/// Run a partition command under the schema write lock and format the reply
pub fn apply_partition(env: &ScEnv, ops: &dyn PartitionOps, cmd: &PartitionCommand) -> String {
    let result = {
        let _schema = env.schema_lock.write().unwrap();
        ops.do_partition(&cmd.target, &cmd.command)
    };
    match result {
        Ok(()) => "SUCCESS\n".to_string(),
        Err(e) => {
            error!("Partition command on '{}' failed: {}", cmd.target, e);
            format!("FAILED rc={} err=\"{}\"\n", e.rc(), quote_reply(&e.message))
        }
    }
}

fn rejection_error(rejection: Rejection) -> PartitionError {
    match rejection {
        Rejection::NotMaster { master } => PartitionError::new(
            ViewErrorCode::Exist,
            format!(
                "I am not master; master is {}",
                master.as_deref().unwrap_or("unknown")
            ),
        ),
        Rejection::CannotClaim => PartitionError::new(ViewErrorCode::Exist, "schema change running"),
        other => PartitionError::new(ViewErrorCode::Generic, format!("{:?}", other)),
    }
}

fn partition_flags() -> ChangeFlags {
    ChangeFlags {
        live: true,
        use_plan: true,
        synchronous: true,
        finalize: true,
        ..Default::default()
    }
}

/// Create `new_table` as a shard shaped exactly like `existing`
pub fn add_partition_table(
    manager: &SchemaChangeManager,
    existing: &str,
    new_table: &str,
) -> Result<(), PartitionError> {
    let env = manager.env();
    let source = env.catalog.table(existing).ok_or_else(|| {
        PartitionError::new(ViewErrorCode::Bug, format!("table '{}' not found", existing))
    })?;

    let change = TableChange {
        schema_text: source.schema_text,
        options: StorageOptions::from_format(&source.format),
        add_only: true,
        ..Default::default()
    };
    let request = SchemaChangeRequest::new(new_table, RequestBody::Table(change), partition_flags());

    match manager.request_schema_change(request) {
        ScOutcome::Accepted(Ok(())) => {
            info!("Partition shard '{}' added, shaped like '{}'", new_table, existing);
            Ok(())
        }
        ScOutcome::Accepted(Err(e)) => Err(PartitionError::new(
            ViewErrorCode::SchemaChange,
            format!("failed to add table: {}", e),
        )),
        ScOutcome::Rejected(rejection) => Err(rejection_error(rejection)),
        ScOutcome::AcceptedAsync => Ok(()),
    }
}

/// Drop a shard: truncate with its current schema, then remove it
pub fn drop_partition_table(manager: &SchemaChangeManager, table: &str) -> Result<(), PartitionError> {
    let env = manager.env();
    let current = env.catalog.table(table).ok_or_else(|| {
        PartitionError::new(ViewErrorCode::Bug, format!("table '{}' not found", table))
    })?;

    let change = TableChange {
        schema_text: current.schema_text,
        drop_table: true,
        fast_reinit: true,
        same_schema: true,
        ..Default::default()
    };
    let request = SchemaChangeRequest::new(table, RequestBody::Table(change), partition_flags());

    match manager.request_schema_change(request) {
        ScOutcome::Accepted(Ok(())) | ScOutcome::AcceptedAsync => {
            info!("Partition shard '{}' dropped", table);
            Ok(())
        }
        ScOutcome::Accepted(Err(e)) => {
            error!("Dropping shard '{}': {}", table, e);
            Err(PartitionError::new(ViewErrorCode::SchemaChange, "failed to drop table"))
        }
        ScOutcome::Rejected(rejection) => Err(rejection_error(rejection)),
    }
}

/// Minimal view manager: shards are added and dropped through schema changes
/// and membership is kept in memory.
///
/// Commands, one per line:
/// `add <table> like <existing>` and `drop <table>`.
pub struct ViewPartitionOps {
    manager: SchemaChangeManager,
    views: Mutex<BTreeMap<String, Vec<String>>>,
}

impl ViewPartitionOps {
    pub fn new(manager: SchemaChangeManager) -> Self {
        ViewPartitionOps {
            manager,
            views: Mutex::new(BTreeMap::new()),
        }
    }

    /// Shards of a view in the order they were added
    pub fn shards(&self, view: &str) -> Vec<String> {
        self.views
            .lock()
            .unwrap()
            .get(view)
            .cloned()
            .unwrap_or_default()
    }

    fn run_line(&self, view: &str, line: &str) -> Result<(), PartitionError> {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["add", table, "like", existing] => {
                add_partition_table(&self.manager, existing, table)?;
                self.views
                    .lock()
                    .unwrap()
                    .entry(view.to_string())
                    .or_default()
                    .push(table.to_string());
                Ok(())
            }
            ["drop", table] => {
                drop_partition_table(&self.manager, table)?;
                if let Some(shards) = self.views.lock().unwrap().get_mut(view) {
                    shards.retain(|s| s != table);
                }
                Ok(())
            }
            _ => Err(PartitionError::new(
                ViewErrorCode::Generic,
                format!("unknown partition command '{}'", line),
            )),
        }
    }
}

impl PartitionOps for ViewPartitionOps {
    fn do_partition(&self, name: &str, command: &str) -> Result<(), PartitionError> {
        if name.is_empty() {
            return Err(PartitionError::new(ViewErrorCode::Generic, "missing view name"));
        }
        for line in command.lines().map(str::trim).filter(|l| !l.is_empty()) {
            self.run_line(name, line)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Compression, TableFormat};
    use crate::testing::TestNode;
    use crate::traits::{Catalog, MetaStore};

    const BASE: &str = "column id int\nindex pk unique id";

    fn shaped() -> TableFormat {
        TableFormat {
            odh: true,
            compress: Compression::Lz4,
            compress_blobs: Compression::Zlib,
            inplace_updates: true,
            instant_schema_change: true,
        }
    }

    #[tokio::test]
    async fn test_read_exchange() {
        let mut input: &[u8] = b"sales\nadd s2 like s1\ndrop s0\n.\ntrailing\n";
        let cmd = PartitionCommand::read_from(&mut input).await.unwrap().unwrap();
        assert_eq!(cmd.target, "sales");
        assert_eq!(cmd.command, "add s2 like s1\ndrop s0");
        assert!(cmd.is_complete());
        assert_eq!(input, b"trailing\n");
    }

    #[tokio::test]
    async fn test_read_unterminated_and_empty() {
        let mut input: &[u8] = b"sales\r\nadd s2 like s1\r\n";
        let cmd = PartitionCommand::read_from(&mut input).await.unwrap().unwrap();
        assert_eq!(cmd.target, "sales");
        assert_eq!(cmd.command, "add s2 like s1");
        assert!(!cmd.is_complete());

        let mut empty: &[u8] = b"";
        assert!(PartitionCommand::read_from(&mut empty).await.unwrap().is_none());
    }

    #[test]
    fn test_lines_after_terminator_ignored() {
        let mut cmd = PartitionCommand::new("v");
        assert!(!cmd.push_line("drop a\n"));
        assert!(cmd.push_line(".\n"));
        assert!(cmd.push_line("drop b\n"));
        assert_eq!(cmd.command, "drop a");
    }

    #[test]
    fn test_add_copies_shape_of_existing() {
        let node = TestNode::local();
        node.add_table("s1", BASE, shaped());
        let manager = node.manager();

        add_partition_table(&manager, "s1", "s2").unwrap();

        let added = node.catalog.table("s2").unwrap();
        assert_eq!(added.schema_text, BASE);
        assert_eq!(added.format, shaped());
        assert_eq!(node.storage.added(), vec!["s2".to_string()]);
        assert!(node.meta.in_schema_change("s2").unwrap().is_none());
    }

    #[test]
    fn test_add_from_missing_table() {
        let node = TestNode::local();
        let err = add_partition_table(&node.manager(), "nope", "s2").unwrap_err();
        assert_eq!(err.code, ViewErrorCode::Bug);
        assert_eq!(err.message, "table 'nope' not found");
    }

    #[test]
    fn test_add_on_replica() {
        let node = TestNode::local();
        node.add_table("s1", BASE, shaped());
        node.cluster.set_master(Some("node-b"));
        let err = add_partition_table(&node.manager(), "s1", "s2").unwrap_err();
        assert_eq!(err.code, ViewErrorCode::Exist);
        assert_eq!(err.message, "I am not master; master is node-b");
    }

    #[test]
    fn test_add_while_change_running() {
        use crate::coordinator::RunningSlot;
        use crate::seed::Seed;

        let node = TestNode::local();
        node.add_table("s1", BASE, shaped());
        node.env
            .slot
            .compare_and_set(
                &RunningSlot::idle(),
                RunningSlot::claimed(Seed::from_raw(7), "node-a", 1),
            )
            .unwrap();
        let err = add_partition_table(&node.manager(), "s1", "s2").unwrap_err();
        assert_eq!(err.code, ViewErrorCode::Exist);
        assert_eq!(err.message, "schema change running");
    }

    #[test]
    fn test_drop_removes_table() {
        let node = TestNode::local();
        node.add_table("s1", BASE, shaped());
        drop_partition_table(&node.manager(), "s1").unwrap();
        assert!(node.catalog.table("s1").is_none());
        assert!(node.meta.pending_tables().unwrap().is_empty());
    }

    #[test]
    fn test_drop_failure() {
        let node = TestNode::new();
        node.add_table("s1", BASE, shaped());
        node.body.fail_finalize("disk full");
        let err = drop_partition_table(&node.manager(), "s1").unwrap_err();
        assert_eq!(err.code, ViewErrorCode::SchemaChange);
        assert_eq!(err.message, "failed to drop table");
    }

    #[tokio::test]
    async fn test_exchange_through_view_ops() {
        let node = TestNode::local();
        node.add_table("s1", BASE, shaped());
        let ops = ViewPartitionOps::new(node.manager());

        let mut input: &[u8] = b"sales\nadd s2 like s1\nadd s3 like s1\ndrop s1\n.\n";
        let cmd = PartitionCommand::read_from(&mut input).await.unwrap().unwrap();
        assert_eq!(apply_partition(&node.env, &ops, &cmd), "SUCCESS\n");

        assert_eq!(ops.shards("sales"), vec!["s2".to_string(), "s3".to_string()]);
        assert!(node.catalog.table("s1").is_none());
        assert!(node.catalog.table("s3").is_some());
    }

    #[test]
    fn test_exchange_failure_reply() {
        let node = TestNode::local();
        let ops = ViewPartitionOps::new(node.manager());

        let cmd = PartitionCommand {
            target: "sales".into(),
            command: "drop ghost".into(),
            done: true,
        };
        assert_eq!(
            apply_partition(&node.env, &ops, &cmd),
            "FAILED rc=3 err=\"table 'ghost' not found\"\n"
        );

        let cmd = PartitionCommand {
            target: "sales".into(),
            command: "rename a b".into(),
            done: true,
        };
        assert_eq!(
            apply_partition(&node.env, &ops, &cmd),
            "FAILED rc=1 err=\"unknown partition command 'rename a b'\"\n"
        );
    }

    struct FixedError(&'static str);

    impl PartitionOps for FixedError {
        fn do_partition(&self, _name: &str, _command: &str) -> Result<(), PartitionError> {
            Err(PartitionError::new(ViewErrorCode::SchemaChange, self.0))
        }
    }

    #[test]
    fn test_failure_reply_stays_on_one_line() {
        let node = TestNode::local();
        let ops = FixedError("failed to add table: column \"v\" unknown\nindex 'pk' bad\\");
        let cmd = PartitionCommand::new("sales");

        let reply = apply_partition(&node.env, &ops, &cmd);

        assert_eq!(
            reply,
            "FAILED rc=4 err=\"failed to add table: column \\\"v\\\" unknown\\nindex 'pk' bad\\\\\"\n"
        );
        assert_eq!(reply.matches('\n').count(), 1);
    }

    #[test]
    fn test_schema_lock_released_after_exchange() {
        let node = TestNode::local();
        let ops = ViewPartitionOps::new(node.manager());
        let cmd = PartitionCommand::new("");
        assert!(apply_partition(&node.env, &ops, &cmd).starts_with("FAILED rc=1"));
        assert!(node.env.schema_lock.try_write().is_ok());
    }
}
