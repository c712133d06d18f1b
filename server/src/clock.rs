use std::time::{SystemTime, UNIX_EPOCH};

// Port for retrieving the current time. Liveness windows, session validity,
// and sweep deadlines all read through this so tests can drive them.
pub trait Clock: Send + Sync {
    fn now_epoch_seconds(&self) -> u64;
}

// System clock adapter used by the running services.
#[derive(Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_seconds(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}
