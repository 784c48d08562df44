//! Stream Handle Table
//!
//! Streams are handed to the plugin as opaque 64-bit handles
//! (`slot << 32 | generation`) instead of pointers. A handle resolves only
//! while the slot still holds the same generation and the stream is alive,
//! so a late callback from plugin code can never reach a freed stream.

use std::sync::{RwLock, Weak};

struct Slot<T> {
    generation: u32,
    entry: Option<Weak<T>>,
}

struct Slots<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
}

/// Generation-checked table of weak stream references
pub struct StreamTable<T> {
    inner: RwLock<Slots<T>>,
}

impl<T> Default for StreamTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn encode(index: usize, generation: u32) -> u64 {
    ((index as u64 + 1) << 32) | generation as u64
}

fn decode(handle: u64) -> Option<(usize, u32)> {
    let slot = handle >> 32;
    if slot == 0 {
        return None;
    }
    Some(((slot - 1) as usize, handle as u32))
}

impl<T> StreamTable<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Slots {
                slots: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Register a stream; returns its handle (never 0), or 0 if the table is unusable
    pub fn insert(&self, entry: Weak<T>) -> u64 {
        let mut inner = match self.inner.write() {
            Ok(i) => i,
            Err(_) => return 0,
        };
        match inner.free.pop() {
            Some(index) => {
                let slot = &mut inner.slots[index];
                slot.entry = Some(entry);
                encode(index, slot.generation)
            }
            None => {
                inner.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                encode(inner.slots.len() - 1, 0)
            }
        }
    }

    /// Resolve a handle to its live stream
    pub fn get(&self, handle: u64) -> Option<std::sync::Arc<T>> {
        let (index, generation) = decode(handle)?;
        let inner = self.inner.read().ok()?;
        let slot = inner.slots.get(index)?;
        if slot.generation != generation {
            return None;
        }
        slot.entry.as_ref()?.upgrade()
    }

    /// Release a handle; later lookups of it fail even if the slot is reused
    pub fn remove(&self, handle: u64) -> bool {
        let (index, generation) = match decode(handle) {
            Some(d) => d,
            None => return false,
        };
        let mut inner = match self.inner.write() {
            Ok(i) => i,
            Err(_) => return false,
        };
        let slot = match inner.slots.get_mut(index) {
            Some(s) if s.generation == generation && s.entry.is_some() => s,
            _ => return false,
        };
        slot.entry = None;
        slot.generation = slot.generation.wrapping_add(1);
        inner.free.push(index);
        true
    }

    /// Number of registered streams
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .map(|i| i.slots.len() - i.free.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
