//! Double-buffered aggregation window.
//!
//! Two pre-allocated maps alternate between "active" (merged into by the
//! owning worker's consumer) and "held" (being drained by the persistence
//! timer). The active index is an atomic; the only synchronization between
//! consumer and timer is the short critical section in
//! [`Window::swap_and_hold`]. No lock is held while drained records are
//! turned into storage requests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::model::{merge_into, AttributeSchema, MergeError, Record};

/// Errors returned by [`Window::swap_and_hold`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowError {
    #[error("buffer {index} is still held by a previous flush")]
    StillHeld { index: usize },
}

#[derive(Default)]
struct Buffer {
    records: HashMap<String, Record>,
    held: bool,
}

impl Buffer {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            records: HashMap::with_capacity(capacity),
            held: false,
        }
    }

    fn merge(&mut self, schema: &AttributeSchema, record: Record) -> Result<(), MergeError> {
        match self.records.get_mut(record.id()) {
            Some(stored) => merge_into(schema, stored, &record),
            None => {
                self.records.insert(record.id().to_string(), record);
                Ok(())
            }
        }
    }
}

/// Handle to a buffer handed off by [`Window::swap_and_hold`].
#[derive(Debug)]
#[must_use = "a held buffer must be passed back to Window::release"]
pub struct HeldBuffer {
    index: usize,
    len: usize,
}

impl HeldBuffer {
    /// Which of the two buffers is held.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of records in the buffer at swap time.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

pub struct Window {
    schema: Arc<AttributeSchema>,
    buffers: [Mutex<Buffer>; 2],
    active: AtomicUsize,
    swap_lock: Mutex<()>,
}

impl Window {
    pub fn new(schema: Arc<AttributeSchema>) -> Self {
        Self::with_capacity(schema, 0)
    }

    /// Creates a window whose two maps are pre-sized for `capacity` ids.
    pub fn with_capacity(schema: Arc<AttributeSchema>, capacity: usize) -> Self {
        Self {
            schema,
            buffers: [
                Mutex::new(Buffer::with_capacity(capacity)),
                Mutex::new(Buffer::with_capacity(capacity)),
            ],
            active: AtomicUsize::new(0),
            swap_lock: Mutex::new(()),
        }
    }

    pub fn schema(&self) -> &Arc<AttributeSchema> {
        &self.schema
    }

    /// Merges `record` into the active buffer.
    ///
    /// Must only be called from the owning worker's consumer.
    pub fn put(&self, record: Record) -> Result<(), MergeError> {
        loop {
            let index = self.active.load(Ordering::Acquire);
            let mut buffer = self.buffers[index].lock();
            // Lost a race with a swap (and possibly a full drain and
            // release) between loading the index and taking the lock.
            if buffer.held || self.active.load(Ordering::Acquire) != index {
                continue;
            }
            return buffer.merge(&self.schema, record);
        }
    }

    /// Makes the other buffer active and marks the previously active one
    /// as held.
    ///
    /// Fails without changing any state when the other buffer has not been
    /// released yet; the active buffer keeps aggregating.
    pub fn swap_and_hold(&self) -> Result<HeldBuffer, WindowError> {
        let _guard = self.swap_lock.lock();

        let current = self.active.load(Ordering::Acquire);
        let next = current ^ 1;

        if self.buffers[next].lock().held {
            return Err(WindowError::StillHeld { index: next });
        }

        self.active.store(next, Ordering::Release);

        let mut buffer = self.buffers[current].lock();
        buffer.held = true;

        Ok(HeldBuffer {
            index: current,
            len: buffer.records.len(),
        })
    }

    /// Moves the held records out, keeping the map's allocation.
    pub fn drain(&self, held: &HeldBuffer) -> Vec<Record> {
        let mut buffer = self.buffers[held.index].lock();
        buffer.records.drain().map(|(_, record)| record).collect()
    }

    /// Clears the held buffer and makes it eligible for the next swap.
    pub fn release(&self, held: HeldBuffer) {
        let mut buffer = self.buffers[held.index].lock();
        buffer.records.clear();
        buffer.held = false;
    }

    /// Number of distinct ids in the active buffer.
    pub fn active_len(&self) -> usize {
        let index = self.active.load(Ordering::Acquire);
        self.buffers[index].lock().records.len()
    }

    /// True while a flush holds one of the buffers.
    pub fn is_holding(&self) -> bool {
        self.buffers.iter().any(|b| b.lock().held)
    }
}
