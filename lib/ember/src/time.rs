use parking_lot::Mutex;
use std::time::{Instant, SystemTime};

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01).
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("system clock before the unix epoch")
        .as_secs()
}

/// Returns the current unix timestamp in milliseconds.
#[inline]
pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("system clock before the unix epoch")
        .as_millis() as u64
}

/// A resettable monotonic timer. Thread-safe; `reset` and `elapsed_ms` may be
/// called from any thread.
pub struct ElapsedTimer {
    origin: Mutex<Instant>,
}

impl ElapsedTimer {
    #[inline]
    pub fn new() -> ElapsedTimer {
        ElapsedTimer {
            origin: Mutex::new(Instant::now()),
        }
    }

    /// Restarts the timer.
    #[inline]
    pub fn reset(&self) {
        *self.origin.lock() = Instant::now();
    }

    /// Milliseconds elapsed since construction or the last `reset`.
    #[inline]
    pub fn elapsed_ms(&self) -> u64 {
        self.origin.lock().elapsed().as_millis() as u64
    }
}
