//! Process-wide logical clock

use std::sync::atomic::{AtomicU64, Ordering};

/// Logical time of a modification. Later modifications compare greater.
pub type TimeStamp = u64;

static CLOCK: AtomicU64 = AtomicU64::new(1);

/// Next value of the logical clock
pub fn next_timestamp() -> TimeStamp {
    CLOCK.fetch_add(1, Ordering::Relaxed)
}
