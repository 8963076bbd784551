//! Thread-safe handle table for open files and directories.
//!
//! The multiplexer stores an opaque `u64` per open file and hands it back
//! on every subsequent callback for that file. This table maps those IDs to
//! their session state. IDs are auto-incrementing and start at 1; 0 is
//! reserved as the invalid handle.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;

/// Concurrent map from handle IDs to session state.
#[derive(Debug)]
pub struct HandleTable<V> {
    handles: DashMap<u64, V>,
    next_id: AtomicU64,
}

impl<V> HandleTable<V> {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Inserts a value and returns its freshly allocated ID.
    pub fn insert(&self, value: V) -> u64 {
        let mut value = Some(value);
        loop {
            let id = self
                .next_id
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                    Some(current.checked_add(1).unwrap_or(1))
                })
                .expect("fetch_update closure never returns None");
            if id == 0 {
                continue;
            }
            // Guard against wrap-around landing on a still-open handle.
            if let Entry::Vacant(entry) = self.handles.entry(id) {
                entry.insert(value.take().expect("value inserted exactly once"));
                return id;
            }
        }
    }

    /// Exclusive access to a handle, if it exists.
    pub fn get_mut(&self, id: u64) -> Option<RefMut<'_, u64, V>> {
        self.handles.get_mut(&id)
    }

    /// Removes a handle and returns its value.
    pub fn remove(&self, id: u64) -> Option<V> {
        self.handles.remove(&id).map(|(_, v)| v)
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether no handles are live.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl<V> Default for HandleTable<V> {
    fn default() -> Self {
        Self::new()
    }
}
