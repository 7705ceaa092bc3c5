//! Persisted form of a request, written when a schema change starts and read
//! back by resume.
//!
//! The snapshot is a JSON envelope:
//!
//! ```text
//! { "format": "livesc.request", "version": 1, "request": { ... } }
//! ```
//!
//! Unknown fields inside `request` are ignored so newer writers stay readable.
//! An unknown format or version is refused.

use serde::{Deserialize, Serialize};

use crate::error::ScError;

use super::SchemaChangeRequest;

pub const SNAPSHOT_FORMAT: &str = "livesc.request";
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize)]
struct EnvelopeOut<'a> {
    format: &'a str,
    version: u32,
    request: &'a SchemaChangeRequest,
}

#[derive(Deserialize)]
struct EnvelopeHeader {
    format: String,
    version: u32,
}

#[derive(Deserialize)]
struct EnvelopeIn {
    request: SchemaChangeRequest,
}

pub fn pack(request: &SchemaChangeRequest) -> Result<Vec<u8>, ScError> {
    let envelope = EnvelopeOut {
        format: SNAPSHOT_FORMAT,
        version: SNAPSHOT_VERSION,
        request,
    };
    serde_json::to_vec(&envelope)
        .map_err(|e| ScError::Snapshot(format!("Failed to pack request: {}", e)))
}

pub fn unpack(bytes: &[u8]) -> Result<SchemaChangeRequest, ScError> {
    let header: EnvelopeHeader = serde_json::from_slice(bytes)
        .map_err(|e| ScError::Snapshot(format!("Unreadable snapshot header: {}", e)))?;
    if header.format != SNAPSHOT_FORMAT {
        return Err(ScError::Snapshot(format!(
            "Unexpected snapshot format '{}'",
            header.format
        )));
    }
    if header.version != SNAPSHOT_VERSION {
        return Err(ScError::Snapshot(format!(
            "Unsupported snapshot version {} (expected {})",
            header.version, SNAPSHOT_VERSION
        )));
    }
    let envelope: EnvelopeIn = serde_json::from_slice(bytes)
        .map_err(|e| ScError::Snapshot(format!("Failed to unpack request: {}", e)))?;
    Ok(envelope.request)
}
