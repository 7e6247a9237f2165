//! Sequence numbers for locally published properties.

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Hands out strictly increasing sequence numbers that track wall-clock
/// milliseconds while the clock moves forward.
///
/// # Algorithm
///
/// `next = max(now_ms, last + 1)`. A clock that jumps backwards only slows
/// the sequence down to one step per call; it never repeats a number.
#[derive(Debug, Default)]
pub struct SequentialTimeKeeper {
    last: Mutex<u64>,
}

impl SequentialTimeKeeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.next_after(0)
    }

    /// Like [`next`](Self::next), but also greater than `floor`.
    pub fn next_after(&self, floor: u64) -> u64 {
        let mut last = self.last.lock();
        let value = now_millis()
            .max(last.saturating_add(1))
            .max(floor.saturating_add(1));
        *last = value;
        value
    }

    /// The most recently issued number, 0 before the first call.
    pub fn last(&self) -> u64 {
        *self.last.lock()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
