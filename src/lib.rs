//! Online schema change coordination for a replicated table store.
//!
//! A schema change claims the cluster-wide running slot, persists its request
//! so it can be resumed, copies rows into a shadow table while live writes are
//! mirrored into it, and finally promotes the shadow.

pub mod admin;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod dryrun;
pub mod env;
pub mod error;
pub mod genid;
pub mod live_sync;
pub mod logging;
pub mod memory;
pub mod meta_store;
pub mod orchestrator;
pub mod partition;
pub mod request;
pub mod resume;
pub mod schema;
pub mod seed;
pub mod shadow;
pub mod traits;

#[cfg(test)]
mod testing;
