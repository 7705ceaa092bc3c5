use log::warn;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use super::Clock;

/// Soft barrier raised while a resumed schema change is starting up.
/// Holds the time (ms) resuming began, or 0.
#[derive(Debug, Default)]
pub struct ResumeBarrier {
    since: AtomicI64,
}

impl ResumeBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, now_millis: i64) {
        self.since.store(now_millis.max(1), Ordering::Release);
    }

    pub fn end(&self) {
        self.since.store(0, Ordering::Release);
    }

    pub fn resuming_since(&self) -> Option<i64> {
        match self.since.load(Ordering::Acquire) {
            0 => None,
            since => Some(since),
        }
    }

    /// Block until no resume is in progress. Warns once if the wait goes past
    /// `warn_after`. Returns how long the caller waited.
    pub fn delay_if_resuming(
        &self,
        clock: &dyn Clock,
        warn_after: Duration,
        poll: Duration,
    ) -> Duration {
        let start = clock.now_millis();
        let mut warned = false;
        while let Some(since) = self.resuming_since() {
            let waited = clock.now_millis() - start;
            if !warned && waited > warn_after.as_millis() as i64 {
                warn!(
                    "Waiting on schema change resume (resuming since {} ms, waited {} ms)",
                    since, waited
                );
                warned = true;
            }
            clock.sleep(poll);
        }
        Duration::from_millis((clock.now_millis() - start).max(0) as u64)
    }
}
