use rusqlite::Error as RusqliteError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error), // Converts io::Error into ScError automatically

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError), // Converts rusqlite::Error automatically

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("Logger error: {0}")]
    LoggerError(#[from] flexi_logger::FlexiLoggerError),

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Schema compile error: {0}")]
    Compile(String),

    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Constraint check failed: {0}")]
    Constraint(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Schema change aborted")]
    Aborted,

    /// An in-flight migration could not be reconstructed. Never continued automatically.
    #[error("Recovery inconsistency: {0}")]
    Recovery(String),
}
