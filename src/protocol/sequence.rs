//! Rolling sequence numbers for Hydro Platinum reports.

use std::sync::atomic::{AtomicU8, Ordering};

/// Largest sequence number that fits the 5-bit field.
pub const SEQUENCE_MAX: u8 = 31;

/// Counter yielding `1..=31` in a cycle. Zero is the device's "no sequence"
/// value and is never produced.
///
/// Two requests racing for a number may receive the same one; the device
/// tolerates that.
#[derive(Debug, Default)]
pub struct SequenceCounter {
    last: AtomicU8,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance and return the next sequence number.
    pub fn next(&self) -> u8 {
        let previous = self.last.load(Ordering::Relaxed);
        let next = if previous >= SEQUENCE_MAX { 1 } else { previous + 1 };
        self.last.store(next, Ordering::Relaxed);
        next
    }
}
