//! Write-coalescing channel value store.
//!
//! Drivers record the value last requested for each channel with
//! [`ChannelStore::set`] and only touch the hardware when
//! [`ChannelStore::apply_changes`] reports that an applied value actually
//! changed. `set` is safe to call from a control thread while the poll tick
//! drains the queue.

use std::collections::{BTreeMap, HashMap};

use parking_lot::{Mutex, RwLock};

use crate::error::{LinkError, Result};

/// Logical channel identifier. May be negative (fixed pump channels).
pub type ChannelId = i32;

/// Queued, thread-safe channel tracking store.
#[derive(Debug, Default)]
pub struct ChannelStore {
    /// Latest value requested per channel since the last drain.
    pending: Mutex<HashMap<ChannelId, u8>>,
    /// Values visible to readers.
    applied: RwLock<BTreeMap<ChannelId, u8>>,
}

impl ChannelStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a value for `channel`. Never blocks on I/O and never fails.
    pub fn set(&self, channel: ChannelId, value: u8) {
        self.pending.lock().insert(channel, value);
    }

    /// Last applied value for `channel`.
    ///
    /// # Errors
    /// Returns `KeyNotFound` if the channel was never applied.
    pub fn get(&self, channel: ChannelId) -> Result<u8> {
        self.applied
            .read()
            .get(&channel)
            .copied()
            .ok_or(LinkError::KeyNotFound(channel))
    }

    /// Drain pending writes and apply the latest value per channel.
    ///
    /// Returns `true` if at least one applied value changed.
    pub fn apply_changes(&self) -> bool {
        // Held until applied is updated so a concurrent clear() cannot be
        // overwritten by values drained before it.
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            return false;
        }

        let mut applied = self.applied.write();
        let mut changed = false;
        for (channel, value) in pending.drain() {
            if applied.insert(channel, value) != Some(value) {
                changed = true;
            }
        }
        changed
    }

    /// Whether draining now would change any applied value.
    pub fn is_dirty(&self) -> bool {
        let pending = self.pending.lock();
        let applied = self.applied.read();
        pending
            .iter()
            .any(|(channel, value)| applied.get(channel) != Some(value))
    }

    /// Forget every pending and applied value.
    pub fn clear(&self) {
        // Lock order matches apply_changes: pending before applied.
        let mut pending = self.pending.lock();
        let mut applied = self.applied.write();
        pending.clear();
        applied.clear();
    }

    /// All applied channel IDs, ascending.
    pub fn channels(&self) -> Vec<ChannelId> {
        self.applied.read().keys().copied().collect()
    }

    /// Snapshot of all applied `(channel, value)` pairs, ascending by channel.
    pub fn snapshot(&self) -> Vec<(ChannelId, u8)> {
        self.applied
            .read()
            .iter()
            .map(|(&channel, &value)| (channel, value))
            .collect()
    }
}
