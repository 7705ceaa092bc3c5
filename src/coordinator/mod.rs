mod barrier;
mod cancel;
mod clock;
mod slot;

pub use barrier::ResumeBarrier;
pub use cancel::{CancelToken, MaintenanceGuard, MaintenanceRegistry};
pub use clock::{Clock, FakeClock, SystemClock};
pub use slot::{LocalSlotCoordinator, RunningSlot, SlotClaim, SlotCoordinator};
