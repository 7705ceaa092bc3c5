use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::Clock;

/// Cooperative cancellation flag shared between a requester and a worker
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Tracks background record-format upgrades, the only work another schema
/// change may preempt.
#[derive(Debug, Default)]
pub struct MaintenanceRegistry {
    active: AtomicUsize,
    abort: CancelToken,
}

impl MaintenanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an upgrade as running until the guard drops
    pub fn enter(self: &Arc<Self>) -> MaintenanceGuard {
        self.active.fetch_add(1, Ordering::AcqRel);
        MaintenanceGuard {
            registry: Arc::clone(self),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) > 0
    }

    /// Token the running upgrade polls
    pub fn abort_token(&self) -> CancelToken {
        self.abort.clone()
    }

    pub fn request_abort(&self) {
        self.abort.cancel();
    }

    /// Sleep-poll until no upgrade is active. Returns false if `tries` ran out first.
    pub fn wait_until_idle(&self, clock: &dyn Clock, tries: u32, poll: Duration) -> bool {
        for _ in 0..tries {
            if !self.is_active() {
                return true;
            }
            clock.sleep(poll);
        }
        !self.is_active()
    }
}

pub struct MaintenanceGuard {
    registry: Arc<MaintenanceRegistry>,
}

impl Drop for MaintenanceGuard {
    fn drop(&mut self) {
        if self.registry.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.registry.abort.reset();
        }
    }
}
