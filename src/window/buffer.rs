//! Capacity-bounded, insertion-ordered reading buffer for one machine

use crate::messages::{Reading, Timestamp};
use std::collections::VecDeque;

use super::{ReadingField, Reducer};

#[derive(Debug, Clone)]
pub struct WindowedBuffer {
    readings: VecDeque<Reading>,
    capacity: usize,
}

impl WindowedBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            readings: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a reading, returning the oldest entry if capacity forced it out
    ///
    /// Readings are kept in arrival order. A late reading is appended as
    /// received; nothing is reordered.
    pub fn push(&mut self, reading: Reading) -> Option<Reading> {
        let evicted = if self.readings.len() >= self.capacity {
            self.readings.pop_front()
        } else {
            None
        };
        self.readings.push_back(reading);
        evicted
    }

    /// Readings with `timestamp > since`, in insertion order
    pub fn window(&self, since: Timestamp) -> impl Iterator<Item = &Reading> {
        self.readings.iter().filter(move |r| r.timestamp > since)
    }

    pub fn aggregate(&self, since: Timestamp, field: ReadingField, reducer: Reducer) -> f64 {
        reducer.reduce(self.window(since).map(|r| field.value(r)))
    }

    pub fn latest(&self) -> Option<&Reading> {
        self.readings.back()
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
