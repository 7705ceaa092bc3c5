use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Time source for every bounded wait in the coordinator
pub trait Clock: Send + Sync {
    fn now_secs(&self) -> i64 {
        self.now_millis() / 1000
    }

    fn now_millis(&self) -> i64;

    fn sleep(&self, duration: Duration);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

type SleepHook = Box<dyn FnMut(u32) + Send>;

/// Manual clock. `sleep` advances time instantly and runs the sleep hook,
/// which receives the number of sleeps taken so far.
pub struct FakeClock {
    millis: AtomicI64,
    sleeps: AtomicU32,
    on_sleep: Mutex<Option<SleepHook>>,
}

impl FakeClock {
    pub fn new(start_millis: i64) -> Self {
        FakeClock {
            millis: AtomicI64::new(start_millis),
            sleeps: AtomicU32::new(0),
            on_sleep: Mutex::new(None),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.millis
            .fetch_add(duration.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn sleeps(&self) -> u32 {
        self.sleeps.load(Ordering::SeqCst)
    }

    pub fn on_sleep(&self, hook: impl FnMut(u32) + Send + 'static) {
        *self.on_sleep.lock().unwrap() = Some(Box::new(hook));
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        FakeClock::new(1_700_000_000_000)
    }
}

impl Clock for FakeClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
        let count = self.sleeps.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(hook) = self.on_sleep.lock().unwrap().as_mut() {
            hook(count);
        }
    }
}
