use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;

use crate::coordinator::{CancelToken, MaintenanceGuard, SlotClaim};
use crate::env::{ScContext, ScEnv};
use crate::error::ScError;
use crate::genid::Genid;
use crate::request::{snapshot, SchemaChangeRequest};
use crate::schema::Compression;
use crate::seed::Seed;
use crate::traits::WorkerSpawner;

/// Why a request never started
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    NotMaster { master: Option<String> },
    CannotClaim,
    AsyncStartFailed,
    SeedUnavailable,
    Checkpoint(String),
}

/// Terminal answer to a schema change or finalize request
#[derive(Debug)]
pub enum ScOutcome {
    /// Ran on the caller's thread to completion
    Accepted(Result<(), ScError>),
    /// Handed to a detached worker
    AcceptedAsync,
    Rejected(Rejection),
}

impl ScOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ScOutcome::Accepted(Ok(())) | ScOutcome::AcceptedAsync)
    }
}

/// Entry point for starting and finalizing schema changes on this node.
///
/// At most one schema change runs per cluster, enforced through the running
/// slot. A claimed slot is released when the change fails, when it is
/// finalized, or when its worker cannot be started. A change that succeeds
/// without `finalize` keeps the slot until `request_finalize`.
#[derive(Clone)]
pub struct SchemaChangeManager {
    env: Arc<ScEnv>,
    spawner: Arc<dyn WorkerSpawner>,
}

/// Slot, maintenance registration and checkpoint state carried by a running change
struct Running {
    claim: SlotClaim,
    maintenance: Option<MaintenanceGuard>,
    cancel: CancelToken,
    checkpointed: bool,
}

impl SchemaChangeManager {
    pub fn new(env: Arc<ScEnv>, spawner: Arc<dyn WorkerSpawner>) -> Self {
        SchemaChangeManager { env, spawner }
    }

    pub fn env(&self) -> &Arc<ScEnv> {
        &self.env
    }

    pub fn request_schema_change(&self, mut request: SchemaChangeRequest) -> ScOutcome {
        let env = &self.env;

        if !env.cluster.is_master() {
            let master = env.cluster.master();
            request.report_line(format!(
                "I am not master; master is {}",
                master.as_deref().unwrap_or("unknown")
            ));
            return ScOutcome::Rejected(Rejection::NotMaster { master });
        }

        let me = env.cluster.my_node();
        request.origin_node = Some(me.clone());

        let seed = if request.flags.resume {
            match self.persisted_seed(&request.table) {
                Some(seed) => {
                    info!(
                        "Resuming schema change on '{}' with stored seed {}",
                        request.table, seed
                    );
                    seed
                }
                None => {
                    request.report_line(format!(
                        "No stored schema change to resume for table {}",
                        request.table
                    ));
                    return ScOutcome::Rejected(Rejection::SeedUnavailable);
                }
            }
        } else {
            let seed = Seed::synthesize(env.ids.next_genid(), &me);
            info!(
                "Starting schema change on '{}' ({}) with new seed {}",
                request.table,
                request.kind(),
                seed
            );
            seed
        };
        request.seed = Some(seed);

        let claim = match self.claim_slot(&request, seed, &me) {
            Some(claim) => claim,
            None => {
                request.report_line("Can't start schema change: another one is already running");
                return ScOutcome::Rejected(Rejection::CannotClaim);
            }
        };

        if !request.flags.resume && env.cluster.is_master() {
            if let Err(e) = env.meta.set_disable_plan_seed(seed) {
                error!("Failed to record plan-disable seed {}: {}", seed, e);
            }
        }

        let checkpointed = if request.flags.resume {
            true
        } else if request.table_change().is_some() {
            match self.write_checkpoint(&request) {
                Ok(()) => true,
                Err(e) => {
                    error!("Failed to checkpoint schema change on '{}': {}", request.table, e);
                    request.report_line(format!("Failed to persist schema change: {}", e));
                    claim.release();
                    return ScOutcome::Rejected(Rejection::Checkpoint(e.to_string()));
                }
            }
        } else {
            false
        };

        let (maintenance, cancel) = if request.is_upgrade() {
            (
                Some(env.maintenance.enter()),
                env.maintenance.abort_token(),
            )
        } else {
            (None, CancelToken::new())
        };

        if request.flags.resume {
            env.resume_barrier.begin(env.clock.now_millis());
        }

        let running = Running {
            claim,
            maintenance,
            cancel,
            checkpointed,
        };

        if request.flags.synchronous {
            debug!("Running schema change on '{}' synchronously", request.table);
            return ScOutcome::Accepted(run_to_completion(env, request, running));
        }

        let table = request.table.clone();
        let resume = request.flags.resume;
        let worker_env = Arc::clone(env);
        let job = Box::new(move || {
            let _ = run_to_completion(&worker_env, request, running);
        });
        match self.spawner.spawn(format!("sc-{}", seed), job) {
            Ok(()) => {
                debug!("Schema change on '{}' handed to worker", table);
                ScOutcome::AcceptedAsync
            }
            Err(e) => {
                // the job, and with it the slot claim, is gone
                error!("Couldn't start schema change worker for '{}': {}", table, e);
                if resume {
                    env.resume_barrier.end();
                } else if checkpointed {
                    self.clear_checkpoint(&table);
                }
                ScOutcome::Rejected(Rejection::AsyncStartFailed)
            }
        }
    }

    /// Promote a completed but unfinalized schema change
    pub fn request_finalize(&self, request: SchemaChangeRequest) -> ScOutcome {
        let env = &self.env;
        let seed = match request.seed {
            Some(seed) => seed,
            None => {
                request.report_line("Finalize needs the seed of the schema change");
                return ScOutcome::Rejected(Rejection::SeedUnavailable);
            }
        };

        let claim = match SlotClaim::adopt(&env.slot, seed) {
            Some(claim) => claim,
            None => {
                let current = env.slot.current();
                warn!(
                    "Finalize of '{}' with seed {}: slot not held by it ({:?})",
                    request.table, seed, current
                );
                request.report_line(format!(
                    "No schema change with seed {} is waiting to finalize",
                    seed
                ));
                return ScOutcome::Rejected(Rejection::CannotClaim);
            }
        };
        info!("Finalizing schema change on '{}' (seed {})", request.table, seed);

        if request.flags.synchronous {
            return ScOutcome::Accepted(finalize_to_completion(env, request, claim));
        }

        let table = request.table.clone();
        let worker_env = Arc::clone(env);
        let job = Box::new(move || {
            let _ = finalize_to_completion(&worker_env, request, claim);
        });
        match self.spawner.spawn(format!("sc-final-{}", seed), job) {
            Ok(()) => ScOutcome::AcceptedAsync,
            Err(e) => {
                error!("Couldn't start finalize worker for '{}': {}", table, e);
                env.links.detach(&table);
                self.clear_checkpoint(&table);
                ScOutcome::Rejected(Rejection::AsyncStartFailed)
            }
        }
    }

    /// Block while a resumed schema change is being set up
    pub fn delay_if_resuming(&self) -> Duration {
        let env = &self.env;
        env.resume_barrier.delay_if_resuming(
            env.clock.as_ref(),
            env.settings.resume_warn,
            env.settings.resume_poll,
        )
    }

    pub fn change_schema(
        &self,
        table: &str,
        schema_text: &str,
        odh: bool,
        compress: Compression,
        compress_blobs: Compression,
    ) -> ScOutcome {
        self.request_schema_change(SchemaChangeRequest::format_change(
            table,
            schema_text,
            odh,
            compress,
            compress_blobs,
        ))
    }

    pub fn morestripe(&self, data_stripes: u32, blob_stripe: bool) -> ScOutcome {
        self.request_schema_change(SchemaChangeRequest::restripe(data_stripes, blob_stripe))
    }

    pub fn create_queue(
        &self,
        name: &str,
        avg_item_size: u32,
        page_size: u32,
        queue_db: bool,
    ) -> ScOutcome {
        self.request_schema_change(SchemaChangeRequest::queue_create(
            name,
            avg_item_size,
            page_size,
            queue_db,
        ))
    }

    /// Truncate an existing table in place
    pub fn fastinit_table(&self, table: &str) -> Result<ScOutcome, ScError> {
        let info = self
            .env
            .catalog
            .table(table)
            .ok_or_else(|| ScError::TableNotFound(table.to_string()))?;
        Ok(self.request_schema_change(SchemaChangeRequest::fast_reinit(
            &info.name,
            &info.schema_text,
        )))
    }

    pub fn start_table_upgrade(
        &self,
        table: &str,
        start_genid: Genid,
        full: bool,
        partial: bool,
        synchronous: bool,
    ) -> Result<ScOutcome, ScError> {
        let request =
            SchemaChangeRequest::record_upgrade(table, start_genid, full, partial, synchronous)?;
        Ok(self.request_schema_change(request))
    }

    fn persisted_seed(&self, table: &str) -> Option<Seed> {
        let bytes = match self.env.meta.in_schema_change(table) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                error!("Failed to read stored schema change for '{}': {}", table, e);
                return None;
            }
        };
        match snapshot::unpack(&bytes) {
            Ok(stored) => stored.seed,
            Err(e) => {
                error!("Stored schema change for '{}' is unreadable: {}", table, e);
                None
            }
        }
    }

    /// Claim the slot, preempting a running record upgrade if that is what holds it
    fn claim_slot(&self, request: &SchemaChangeRequest, seed: Seed, me: &str) -> Option<SlotClaim> {
        let env = &self.env;
        let holder = match SlotClaim::claim(&env.slot, seed, me, env.clock.now_secs()) {
            Ok(claim) => return Some(claim),
            Err(holder) => holder,
        };

        if request.is_upgrade() || !env.maintenance.is_active() {
            warn!(
                "Schema change already running (seed {:?} on {:?})",
                holder.seed, holder.node
            );
            return None;
        }

        warn!(
            "Stopping record upgrade (seed {:?}) for schema change on '{}'",
            holder.seed, request.table
        );
        env.maintenance.request_abort();
        let stopped = env.maintenance.wait_until_idle(
            env.clock.as_ref(),
            env.settings.cancel_wait_tries,
            env.settings.cancel_poll,
        );
        if !stopped {
            error!(
                "Record upgrade did not stop after {} tries",
                env.settings.cancel_wait_tries
            );
            return None;
        }

        match SlotClaim::claim(&env.slot, seed, me, env.clock.now_secs()) {
            Ok(claim) => Some(claim),
            Err(holder) => {
                warn!(
                    "Slot taken by seed {:?} before it could be claimed",
                    holder.seed
                );
                None
            }
        }
    }

    fn write_checkpoint(&self, request: &SchemaChangeRequest) -> Result<(), ScError> {
        let bytes = snapshot::pack(request)?;
        self.env.meta.set_in_schema_change(&request.table, Some(&bytes))
    }

    fn clear_checkpoint(&self, table: &str) {
        clear_checkpoint(&self.env, table);
    }
}

fn clear_checkpoint(env: &ScEnv, table: &str) {
    if let Err(e) = env.meta.set_in_schema_change(table, None) {
        error!("Failed to clear schema change checkpoint for '{}': {}", table, e);
    }
}

fn run_to_completion(env: &ScEnv, request: SchemaChangeRequest, running: Running) -> Result<(), ScError> {
    let Running {
        claim,
        maintenance,
        cancel,
        checkpointed,
    } = running;

    let ctx = ScContext {
        request: &request,
        env,
        cancel,
    };
    let result = env.body.run(&ctx).and_then(|()| {
        if request.flags.finalize {
            env.body.finalize(&ctx)?;
            env.links.detach(&request.table);
        }
        Ok(())
    });

    if request.flags.resume {
        env.resume_barrier.end();
    }

    match &result {
        Ok(()) if request.flags.finalize => {
            info!("Schema change on '{}' complete", request.table);
            if checkpointed {
                clear_checkpoint(env, &request.table);
            }
            request.report_line("SUCCESS");
            claim.release();
        }
        Ok(()) => {
            info!(
                "Schema change on '{}' ready, waiting for finalize",
                request.table
            );
            request.report_line("SUCCESS");
            claim.keep();
        }
        Err(e) => {
            error!("Schema change on '{}' failed: {}", request.table, e);
            env.links.detach(&request.table);
            if checkpointed {
                clear_checkpoint(env, &request.table);
            }
            request.report_line(format!("!{}", e));
            request.report_line("FAILED");
            claim.release();
        }
    }

    // the slot goes before the upgrade registration so a waiting preemptor can claim it
    drop(maintenance);
    result
}

fn finalize_to_completion(
    env: &ScEnv,
    request: SchemaChangeRequest,
    claim: SlotClaim,
) -> Result<(), ScError> {
    let ctx = ScContext {
        request: &request,
        env,
        cancel: CancelToken::new(),
    };
    let result = env.body.finalize(&ctx);

    env.links.detach(&request.table);
    clear_checkpoint(env, &request.table);
    match &result {
        Ok(()) => {
            info!("Schema change on '{}' finalized", request.table);
            request.report_line("SUCCESS");
        }
        Err(e) => {
            error!("Finalize of '{}' failed: {}", request.table, e);
            request.report_line(format!("!{}", e));
            request.report_line("FAILED");
        }
    }
    claim.release();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::RunningSlot;
    use crate::request::{ReportSink, StorageOptions};
    use crate::testing::{FailingSpawner, ManualSpawner, TestNode};
    use crate::traits::{MetaStore, ThreadSpawner};
    use std::sync::Barrier;

    const SCHEMA: &str = "column id int\nindex pk unique id";

    fn alter(table: &str) -> SchemaChangeRequest {
        let mut req = SchemaChangeRequest::format_change(
            table,
            SCHEMA,
            true,
            Compression::None,
            Compression::None,
        );
        req.flags.synchronous = true;
        req
    }

    #[test]
    fn test_non_master_is_rejected_without_touching_slot() {
        let node = TestNode::new();
        node.cluster.set_master(Some("other-node"));
        let (sink, lines) = ReportSink::channel();

        let outcome = node.manager().request_schema_change(alter("t1").with_report(sink));

        assert!(matches!(
            outcome,
            ScOutcome::Rejected(Rejection::NotMaster { master: Some(ref m) }) if m == "other-node"
        ));
        assert_eq!(lines.try_recv().unwrap(), "I am not master; master is other-node");
        assert_eq!(node.env.slot.current(), RunningSlot::idle());
        assert_eq!(node.body.runs(), 0);
        assert!(node.meta.pending_tables().unwrap().is_empty());
    }

    #[test]
    fn test_sync_success_releases_slot_and_clears_checkpoint() {
        let node = TestNode::new();
        let (sink, lines) = ReportSink::channel();

        let outcome = node.manager().request_schema_change(alter("t1").with_report(sink));

        assert!(matches!(outcome, ScOutcome::Accepted(Ok(()))));
        assert_eq!(node.body.runs(), 1);
        assert_eq!(node.body.finalizes(), 1);
        assert_eq!(node.env.slot.current(), RunningSlot::idle());
        assert!(node.meta.pending_tables().unwrap().is_empty());
        assert_eq!(lines.try_iter().last().as_deref(), Some("SUCCESS"));
    }

    #[test]
    fn test_fresh_seed_is_tagged_and_recorded() {
        let node = TestNode::new();
        let outcome = node.manager().request_schema_change(alter("t1"));
        assert!(outcome.is_success());

        let seed = node.body.last_seed().unwrap();
        assert!(seed.originated_on("node-a"));
        assert_eq!(node.meta.disable_plan_seed().unwrap(), Some(seed));
        assert_eq!(node.body.last_origin_node().as_deref(), Some("node-a"));
    }

    #[test]
    fn test_checkpoint_holds_request_while_body_runs() {
        let node = TestNode::new();
        node.manager().request_schema_change(alter("t1"));
        let stored = node.body.checkpoint_seen().unwrap();
        let stored = snapshot::unpack(&stored).unwrap();
        assert_eq!(stored.seed, node.body.last_seed());
        assert_eq!(stored.table, "t1");
    }

    #[test]
    fn test_body_failure_releases_slot_and_reports() {
        let node = TestNode::new();
        node.body.fail_run("copy failed");
        let (sink, lines) = ReportSink::channel();

        let outcome = node.manager().request_schema_change(alter("t1").with_report(sink));

        assert!(matches!(outcome, ScOutcome::Accepted(Err(ScError::Error(_)))));
        assert_eq!(node.env.slot.current(), RunningSlot::idle());
        assert!(node.meta.pending_tables().unwrap().is_empty());
        let lines: Vec<String> = lines.try_iter().collect();
        assert_eq!(lines.last().map(String::as_str), Some("FAILED"));
        assert_eq!(node.body.finalizes(), 0);
    }

    #[test]
    fn test_unfinalized_success_keeps_slot_for_finalize() {
        let node = TestNode::new();
        let manager = node.manager();
        let mut req = alter("t1");
        req.flags.finalize = false;

        assert!(matches!(
            manager.request_schema_change(req),
            ScOutcome::Accepted(Ok(()))
        ));
        let seed = node.body.last_seed().unwrap();
        assert_eq!(node.env.slot.current().seed, Some(seed));
        assert_eq!(node.meta.pending_tables().unwrap(), vec!["t1".to_string()]);

        // a second change cannot start meanwhile
        assert!(matches!(
            manager.request_schema_change(alter("t2")),
            ScOutcome::Rejected(Rejection::CannotClaim)
        ));

        let mut fin = alter("t1");
        fin.seed = Some(seed);
        assert!(matches!(
            manager.request_finalize(fin),
            ScOutcome::Accepted(Ok(()))
        ));
        assert_eq!(node.body.finalizes(), 1);
        assert_eq!(node.env.slot.current(), RunningSlot::idle());
        assert!(node.meta.pending_tables().unwrap().is_empty());
    }

    #[test]
    fn test_finalize_requires_matching_seed() {
        let node = TestNode::new();
        let manager = node.manager();

        let no_seed = alter("t1");
        assert!(matches!(
            manager.request_finalize(no_seed),
            ScOutcome::Rejected(Rejection::SeedUnavailable)
        ));

        let mut wrong = alter("t1");
        wrong.seed = Some(Seed::from_raw(99));
        assert!(matches!(
            manager.request_finalize(wrong),
            ScOutcome::Rejected(Rejection::CannotClaim)
        ));
        assert_eq!(node.body.finalizes(), 0);
    }

    #[test]
    fn test_finalize_failure_still_releases_everything() {
        let node = TestNode::new();
        let manager = node.manager();
        let mut req = alter("t1");
        req.flags.finalize = false;
        manager.request_schema_change(req);
        let seed = node.body.last_seed().unwrap();

        node.body.fail_finalize("swap failed");
        let mut fin = alter("t1");
        fin.seed = Some(seed);
        assert!(matches!(
            manager.request_finalize(fin),
            ScOutcome::Accepted(Err(_))
        ));
        assert_eq!(node.env.slot.current(), RunningSlot::idle());
        assert!(node.meta.pending_tables().unwrap().is_empty());
    }

    #[test]
    fn test_async_runs_on_worker() {
        let node = TestNode::new();
        let spawner = Arc::new(ManualSpawner::new());
        let manager = node.manager_with(spawner.clone());
        let mut req = alter("t1");
        req.flags.synchronous = false;

        assert!(matches!(
            manager.request_schema_change(req),
            ScOutcome::AcceptedAsync
        ));
        assert!(node.env.slot.current().running);
        assert_eq!(node.body.runs(), 0);
        assert!(spawner.names()[0].starts_with("sc-"));

        spawner.run_all();
        assert_eq!(node.body.runs(), 1);
        assert_eq!(node.env.slot.current(), RunningSlot::idle());
    }

    #[test]
    fn test_finalize_waits_for_queued_body() {
        let node = TestNode::new();
        let spawner = Arc::new(ManualSpawner::new());
        let manager = node.manager_with(spawner.clone());
        let mut req = alter("t1");
        req.flags.synchronous = false;
        req.flags.finalize = false;

        assert!(matches!(
            manager.request_schema_change(req),
            ScOutcome::AcceptedAsync
        ));
        let seed = node.env.slot.current().seed.unwrap();

        let mut fin = alter("t1");
        fin.seed = Some(seed);
        assert!(matches!(
            manager.request_finalize(fin.clone()),
            ScOutcome::Rejected(Rejection::CannotClaim)
        ));
        assert_eq!(node.body.finalizes(), 0);
        assert!(node.env.slot.current().running);
        assert!(matches!(
            manager.request_schema_change(alter("t2")),
            ScOutcome::Rejected(Rejection::CannotClaim)
        ));

        spawner.run_all();
        assert_eq!(node.body.runs(), 1);
        assert!(node.env.slot.current().awaiting_finalize);

        assert!(matches!(
            manager.request_finalize(fin),
            ScOutcome::Accepted(Ok(()))
        ));
        assert_eq!(node.body.finalizes(), 1);
        assert_eq!(node.env.slot.current(), RunningSlot::idle());
    }

    #[test]
    fn test_async_on_real_thread() {
        let node = TestNode::new();
        let manager = node.manager_with(Arc::new(ThreadSpawner));
        let (sink, lines) = ReportSink::channel();
        let mut req = alter("t1").with_report(sink);
        req.flags.synchronous = false;

        assert!(matches!(
            manager.request_schema_change(req),
            ScOutcome::AcceptedAsync
        ));
        let last = lines
            .iter()
            .find(|l| l == "SUCCESS" || l == "FAILED")
            .unwrap();
        assert_eq!(last, "SUCCESS");
    }

    #[test]
    fn test_spawn_failure_releases_slot() {
        let node = TestNode::new();
        let manager = node.manager_with(Arc::new(FailingSpawner));
        let mut req = alter("t1");
        req.flags.synchronous = false;

        assert!(matches!(
            manager.request_schema_change(req),
            ScOutcome::Rejected(Rejection::AsyncStartFailed)
        ));
        assert_eq!(node.env.slot.current(), RunningSlot::idle());
        assert!(node.meta.pending_tables().unwrap().is_empty());
        assert_eq!(node.body.runs(), 0);
    }

    #[test]
    fn test_checkpoint_failure_rejects_and_releases() {
        let node = TestNode::new();
        node.meta.set_fail_writes(true);

        let outcome = node.manager().request_schema_change(alter("t1"));

        assert!(matches!(
            outcome,
            ScOutcome::Rejected(Rejection::Checkpoint(_))
        ));
        assert_eq!(node.env.slot.current(), RunningSlot::idle());
        assert_eq!(node.body.runs(), 0);
    }

    #[test]
    fn test_resume_uses_stored_seed() {
        let node = TestNode::new();
        let mut stored = alter("t1");
        stored.seed = Some(Seed::from_raw(0xabcd_0000_0000_1234));
        node.meta
            .set_in_schema_change("t1", Some(&snapshot::pack(&stored).unwrap()))
            .unwrap();

        let mut req = alter("t1");
        req.flags.resume = true;
        let outcome = node.manager().request_schema_change(req);

        assert!(outcome.is_success());
        assert_eq!(node.body.last_seed(), Some(Seed::from_raw(0xabcd_0000_0000_1234)));
        assert_eq!(node.env.resume_barrier.resuming_since(), None);
        // resumed changes don't overwrite the plan-disable marker
        assert_eq!(node.meta.disable_plan_seed().unwrap(), None);
    }

    #[test]
    fn test_resume_without_snapshot_is_rejected() {
        let node = TestNode::new();
        let mut req = alter("t1");
        req.flags.resume = true;
        assert!(matches!(
            node.manager().request_schema_change(req),
            ScOutcome::Rejected(Rejection::SeedUnavailable)
        ));
        assert_eq!(node.env.slot.current(), RunningSlot::idle());
    }

    #[test]
    fn test_resume_barrier_held_until_worker_finishes() {
        let node = TestNode::new();
        let mut stored = alter("t1");
        stored.seed = Some(Seed::from_raw(5));
        node.meta
            .set_in_schema_change("t1", Some(&snapshot::pack(&stored).unwrap()))
            .unwrap();
        let spawner = Arc::new(ManualSpawner::new());
        let manager = node.manager_with(spawner.clone());

        let mut req = alter("t1");
        req.flags.resume = true;
        req.flags.synchronous = false;
        manager.request_schema_change(req);
        assert!(node.env.resume_barrier.resuming_since().is_some());

        let runner = Arc::clone(&spawner);
        node.clock.on_sleep(move |n| {
            if n == 40 {
                runner.run_all();
            }
        });
        let waited = manager.delay_if_resuming();
        assert_eq!(waited, Duration::from_millis(400));
        assert_eq!(node.env.resume_barrier.resuming_since(), None);
    }

    #[test]
    fn test_upgrade_is_preempted_by_schema_change() {
        let node = TestNode::new();
        let spawner = Arc::new(ManualSpawner::new());
        let manager = node.manager_with(spawner.clone());

        let upgrade = manager
            .start_table_upgrade("t1", Genid::ZERO, true, false, false)
            .unwrap();
        assert!(matches!(upgrade, ScOutcome::AcceptedAsync));
        assert!(node.env.maintenance.is_active());

        // the upgrade worker only gets to run (and see its abort) during the wait
        let runner = Arc::clone(&spawner);
        node.clock.on_sleep(move |n| {
            if n == 2 {
                runner.run_all();
            }
        });

        let outcome = manager.request_schema_change(alter("t2"));
        assert!(matches!(outcome, ScOutcome::Accepted(Ok(()))));
        assert_eq!(node.clock.sleeps(), 2);
        assert_eq!(node.body.aborted_runs(), 1);
        assert!(!node.env.maintenance.is_active());
        assert!(!node.env.maintenance.abort_token().is_cancelled());
    }

    #[test]
    fn test_upgrade_that_will_not_stop_gives_cannot_claim() {
        let node = TestNode::new();
        let spawner = Arc::new(ManualSpawner::new());
        let manager = node.manager_with(spawner.clone());
        manager
            .start_table_upgrade("t1", Genid::ZERO, true, false, false)
            .unwrap();
        let upgrade_seed = node.env.slot.current().seed;

        let outcome = manager.request_schema_change(alter("t2"));

        assert!(matches!(outcome, ScOutcome::Rejected(Rejection::CannotClaim)));
        assert_eq!(node.clock.sleeps(), 10);
        assert_eq!(node.env.slot.current().seed, upgrade_seed);
    }

    #[test]
    fn test_upgrade_does_not_preempt_upgrade() {
        let node = TestNode::new();
        let spawner = Arc::new(ManualSpawner::new());
        let manager = node.manager_with(spawner.clone());
        manager
            .start_table_upgrade("t1", Genid::ZERO, true, false, false)
            .unwrap();

        let second = manager
            .start_table_upgrade("t2", Genid::new(10), false, true, true)
            .unwrap();
        assert!(matches!(second, ScOutcome::Rejected(Rejection::CannotClaim)));
        assert_eq!(node.clock.sleeps(), 0);
        assert!(!node.env.maintenance.abort_token().is_cancelled());
    }

    #[test]
    fn test_non_upgrade_holder_is_never_preempted() {
        let node = TestNode::new();
        let manager = node.manager();
        let mut first = alter("t1");
        first.flags.finalize = false;
        manager.request_schema_change(first);

        assert!(matches!(
            manager.request_schema_change(alter("t2")),
            ScOutcome::Rejected(Rejection::CannotClaim)
        ));
        assert_eq!(node.clock.sleeps(), 0);
    }

    #[test]
    fn test_invalid_upgrade_arguments() {
        let node = TestNode::new();
        let err = node
            .manager()
            .start_table_upgrade("t1", Genid::ZERO, false, false, true)
            .unwrap_err();
        assert!(matches!(err, ScError::InvalidArgument(_)));
        assert_eq!(node.env.slot.current(), RunningSlot::idle());
    }

    #[test]
    fn test_fastinit_requires_existing_table() {
        let node = TestNode::new();
        let manager = node.manager();
        assert!(matches!(
            manager.fastinit_table("missing"),
            Err(ScError::TableNotFound(_))
        ));

        node.add_table("t1", SCHEMA, Default::default());
        let outcome = manager.fastinit_table("t1").unwrap();
        assert!(matches!(outcome, ScOutcome::Accepted(Ok(()))));
        let seen = node.body.last_request().unwrap();
        let change = seen.table_change().unwrap();
        assert!(change.fast_reinit && change.same_schema);
        assert_eq!(change.options, StorageOptions::default());
    }

    #[test]
    fn test_restripe_and_queue_builders_do_not_checkpoint() {
        let node = TestNode::new();
        let spawner = Arc::new(ManualSpawner::new());
        let manager = node.manager_with(spawner.clone());

        assert!(matches!(manager.morestripe(16, true), ScOutcome::AcceptedAsync));
        assert!(node.meta.pending_tables().unwrap().is_empty());
        spawner.run_all();

        assert!(matches!(
            manager.create_queue("q1", 64, 4096, true),
            ScOutcome::AcceptedAsync
        ));
        assert!(node.meta.pending_tables().unwrap().is_empty());
        spawner.run_all();
        assert_eq!(node.body.runs(), 2);
    }

    #[test]
    fn test_concurrent_requests_exactly_one_claims() {
        let node = TestNode::new();
        let manager = node.manager();
        let threads = 12;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let manager = manager.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let mut req = alter(&format!("t{}", i));
                    req.flags.finalize = false;
                    barrier.wait();
                    manager.request_schema_change(req)
                })
            })
            .collect();

        let outcomes: Vec<ScOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let accepted = outcomes
            .iter()
            .filter(|o| matches!(o, ScOutcome::Accepted(Ok(()))))
            .count();
        let rejected = outcomes
            .iter()
            .filter(|o| matches!(o, ScOutcome::Rejected(Rejection::CannotClaim)))
            .count();
        assert_eq!(accepted, 1);
        assert_eq!(rejected, threads - 1);
    }
}
