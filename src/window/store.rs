//! Keyed store of per-machine buffers
//!
//! The outer map is only write-locked to create or reap a buffer. Everything
//! else takes a read lock on the map plus the entity's own mutex, so work on
//! different machines never contends and work on one machine is serialized.

use chrono::Duration;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

use super::buffer::WindowedBuffer;
use super::{ReadingField, Reducer};
use crate::messages::{Reading, Timestamp};

type SharedBuffer = Arc<Mutex<WindowedBuffer>>;

pub struct WindowStore {
    capacity: usize,
    buffers: RwLock<HashMap<String, SharedBuffer>>,
}

impl WindowStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buffers: RwLock::new(HashMap::new()),
        }
    }

    fn buffer(&self, entity_id: &str) -> Option<SharedBuffer> {
        self.buffers.read().get(entity_id).cloned()
    }

    fn buffer_or_create(&self, entity_id: &str) -> SharedBuffer {
        if let Some(buffer) = self.buffer(entity_id) {
            return buffer;
        }

        let mut buffers = self.buffers.write();
        buffers
            .entry(entity_id.to_string())
            .or_insert_with(|| {
                log::debug!("Creating window buffer for {}", entity_id);
                Arc::new(Mutex::new(WindowedBuffer::new(self.capacity)))
            })
            .clone()
    }

    /// Append a reading, creating the entity's buffer on first sight
    pub fn append(&self, entity_id: &str, reading: Reading) {
        self.update(entity_id, reading, |_| ());
    }

    /// Append and then run `f` over the buffer under the same lock.
    ///
    /// No other append or query for `entity_id` can interleave between the
    /// push and `f`.
    pub fn update<R>(
        &self,
        entity_id: &str,
        reading: Reading,
        f: impl FnOnce(&WindowedBuffer) -> R,
    ) -> R {
        let buffer = self.buffer_or_create(entity_id);
        let mut guard = buffer.lock();
        if let Some(evicted) = guard.push(reading) {
            log::trace!("Evicted reading at {} for {}", evicted.timestamp, entity_id);
        }
        f(&*guard)
    }

    /// Readings with `timestamp > now - duration`, in insertion order
    pub fn window(&self, entity_id: &str, duration: Duration, now: Timestamp) -> Vec<Reading> {
        match self.buffer(entity_id) {
            Some(buffer) => buffer.lock().window(now - duration).cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Reduce `field` over the window; `0.0` when the window is empty
    pub fn aggregate(
        &self,
        entity_id: &str,
        duration: Duration,
        field: ReadingField,
        reducer: Reducer,
        now: Timestamp,
    ) -> f64 {
        match self.buffer(entity_id) {
            Some(buffer) => buffer.lock().aggregate(now - duration, field, reducer),
            None => 0.0,
        }
    }

    pub fn len(&self, entity_id: &str) -> usize {
        self.buffer(entity_id).map_or(0, |b| b.lock().len())
    }

    pub fn entity_count(&self) -> usize {
        self.buffers.read().len()
    }

    pub fn entities(&self) -> Vec<String> {
        self.buffers.read().keys().cloned().collect()
    }

    /// Drop buffers whose newest reading is older than `now - idle_for`
    pub fn reap_idle(&self, idle_for: Duration, now: Timestamp) -> usize {
        let cutoff = now - idle_for;
        let mut buffers = self.buffers.write();
        let before = buffers.len();
        buffers.retain(|_, buffer| {
            buffer
                .lock()
                .latest()
                .is_some_and(|latest| latest.timestamp >= cutoff)
        });
        before - buffers.len()
    }
}
