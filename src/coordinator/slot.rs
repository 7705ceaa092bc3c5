use log::{error, info};
use std::sync::{Arc, Mutex};

use crate::seed::Seed;

/// The cluster-wide "a schema change is running" record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningSlot {
    pub running: bool,
    pub seed: Option<Seed>,
    pub node: Option<String>,
    pub started_at: i64,
    /// The body finished and the slot waits for a finalize request
    pub awaiting_finalize: bool,
}

impl RunningSlot {
    pub fn idle() -> Self {
        RunningSlot {
            running: false,
            seed: None,
            node: None,
            started_at: 0,
            awaiting_finalize: false,
        }
    }

    pub fn claimed(seed: Seed, node: &str, started_at: i64) -> Self {
        RunningSlot {
            running: true,
            seed: Some(seed),
            node: Some(node.to_string()),
            started_at,
            awaiting_finalize: false,
        }
    }

    fn parked(&self) -> Self {
        RunningSlot {
            awaiting_finalize: true,
            ..self.clone()
        }
    }
}

/// Single point of mutual exclusion for schema changes
pub trait SlotCoordinator: Send + Sync {
    fn current(&self) -> RunningSlot;

    /// Replace the slot with `new` if it still equals `expected`.
    /// On conflict returns the slot as it actually is.
    fn compare_and_set(&self, expected: &RunningSlot, new: RunningSlot) -> Result<(), RunningSlot>;
}

/// Slot kept in process memory; enough for a single master node
#[derive(Debug)]
pub struct LocalSlotCoordinator {
    slot: Mutex<RunningSlot>,
}

impl LocalSlotCoordinator {
    pub fn new() -> Self {
        LocalSlotCoordinator {
            slot: Mutex::new(RunningSlot::idle()),
        }
    }
}

impl Default for LocalSlotCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotCoordinator for LocalSlotCoordinator {
    fn current(&self) -> RunningSlot {
        self.slot.lock().unwrap().clone()
    }

    fn compare_and_set(&self, expected: &RunningSlot, new: RunningSlot) -> Result<(), RunningSlot> {
        let mut slot = self.slot.lock().unwrap();
        if *slot != *expected {
            return Err(slot.clone());
        }
        *slot = new;
        Ok(())
    }
}

/// Ownership of the running slot.
///
/// The slot is released exactly once: by `release`, or when the claim is
/// dropped. `keep` parks the slot for a later finalize request, which picks
/// it up again with `adopt`. Only a parked slot can be adopted.
pub struct SlotClaim {
    coordinator: Arc<dyn SlotCoordinator>,
    held: RunningSlot,
    done: bool,
}

impl SlotClaim {
    pub fn claim(
        coordinator: &Arc<dyn SlotCoordinator>,
        seed: Seed,
        node: &str,
        now_secs: i64,
    ) -> Result<SlotClaim, RunningSlot> {
        let held = RunningSlot::claimed(seed, node, now_secs);
        coordinator.compare_and_set(&RunningSlot::idle(), held.clone())?;
        info!("Schema change slot claimed by {} (seed {})", node, seed);
        Ok(SlotClaim {
            coordinator: Arc::clone(coordinator),
            held,
            done: false,
        })
    }

    /// Take over a slot parked by `keep` under `seed`
    pub fn adopt(coordinator: &Arc<dyn SlotCoordinator>, seed: Seed) -> Option<SlotClaim> {
        let current = coordinator.current();
        if !current.running || !current.awaiting_finalize || current.seed != Some(seed) {
            return None;
        }
        let held = RunningSlot {
            awaiting_finalize: false,
            ..current.clone()
        };
        if let Err(actual) = coordinator.compare_and_set(&current, held.clone()) {
            info!("Slot changed before finalize could adopt it: {:?}", actual);
            return None;
        }
        Some(SlotClaim {
            coordinator: Arc::clone(coordinator),
            held,
            done: false,
        })
    }

    pub fn seed(&self) -> Option<Seed> {
        self.held.seed
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    /// Leave the slot held for a finalize request after this claim goes away
    pub fn keep(mut self) {
        self.done = true;
        match self
            .coordinator
            .compare_and_set(&self.held, self.held.parked())
        {
            Ok(()) => info!(
                "Schema change slot stays held for finalize (seed {:?})",
                self.held.seed
            ),
            Err(actual) => error!(
                "Failed to park schema change slot: expected {:?}, found {:?}",
                self.held, actual
            ),
        }
    }

    fn release_inner(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        match self
            .coordinator
            .compare_and_set(&self.held, RunningSlot::idle())
        {
            Ok(()) => info!("Schema change slot released (seed {:?})", self.held.seed),
            Err(actual) => error!(
                "Failed to release schema change slot: expected {:?}, found {:?}",
                self.held, actual
            ),
        }
    }
}

impl Drop for SlotClaim {
    fn drop(&mut self) {
        self.release_inner();
    }
}
