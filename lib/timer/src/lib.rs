#![cfg_attr(not(test), no_std)]

use core::sync::atomic::{AtomicU64, Ordering};

pub type Tick = u64;

/// Process-wide monotonic tick. The timer interrupt owner advances it;
/// everyone else only reads it. Readers tolerate staleness, so plain
/// relaxed atomics are enough.
static TICKS: AtomicU64 = AtomicU64::new(0);

pub fn tick_now() -> Tick {
    TICKS.load(Ordering::Relaxed)
}

pub fn tick_advance() -> Tick {
    TICKS.fetch_add(1, Ordering::Relaxed) + 1
}
