//! Identity-preserving object cache.
//!
//! One live instance per OID within a session. Entries hold weak handles;
//! a cell whose last strong reference drops reports its OID to the shared
//! purge queue, and `cleanup()` drains that queue lazily at the head of
//! every cache operation. The cache is unbounded by design: identity must
//! stay valid for as long as any reference to the object exists, so entries
//! leave only through refcount death or explicit eviction, never a capacity
//! policy.

use crate::persist::{ObjCell, ObjRef};
use bytes::Bytes;
use opal_common::Oid;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::trace;

/// Queue of OIDs whose cells have been dropped.
///
/// Pushed from `ObjCell::drop`, which may run on any thread; drained by the
/// owning cache's `cleanup()`.
#[derive(Debug, Default)]
pub struct PurgeQueue {
    cleared: Mutex<Vec<Oid>>,
}

impl PurgeQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a dropped cell's OID.
    pub fn push(&self, oid: Oid) {
        self.cleared.lock().push(oid);
    }

    /// Removes and returns all recorded OIDs.
    pub fn drain(&self) -> Vec<Oid> {
        std::mem::take(&mut *self.cleared.lock())
    }

    /// Returns the number of pending OIDs.
    pub fn len(&self) -> usize {
        self.cleared.lock().len()
    }

    /// Returns true if no OIDs are pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct CacheEntry {
    target: Weak<ObjCell>,
    /// Pre-modification byte snapshot, kept for transaction rollback.
    saved_image: Option<Bytes>,
}

/// OID → live instance map with weak handles and rollback snapshots.
pub struct ObjectCache {
    entries: HashMap<Oid, CacheEntry>,
    purge: Arc<PurgeQueue>,
    /// Hollow objects recently added; candidates for bulk prefetch.
    prefetch: Vec<Oid>,
}

impl ObjectCache {
    /// Creates an empty cache with its own purge queue.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            purge: Arc::new(PurgeQueue::new()),
            prefetch: Vec::new(),
        }
    }

    /// Drains the purge queue, removing entries whose cells have died.
    ///
    /// Safe to call repeatedly; invoked at the head of every operation that
    /// depends on size or contents being accurate.
    pub fn cleanup(&mut self) {
        let dead = self.purge.drain();
        if dead.is_empty() {
            return;
        }
        let mut removed = 0usize;
        for oid in dead {
            if let Some(entry) = self.entries.get(&oid) {
                // A new cell may have been cached under this OID since the
                // old one died; only remove if the handle is really gone.
                if entry.target.upgrade().is_none() {
                    self.entries.remove(&oid);
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            trace!(removed, remaining = self.entries.len(), "cache purge");
        }
    }

    /// Registers a live instance under its OID.
    ///
    /// No-op if the OID is already mapped to a live instance: an existing
    /// mapping is never silently replaced. A hollow, non-new instance is
    /// additionally recorded as a prefetch candidate.
    pub fn add(&mut self, obj: &ObjRef) {
        self.cleanup();
        let oid = obj.oid();
        if oid.is_null() {
            return;
        }
        if let Some(entry) = self.entries.get(&oid) {
            if entry.target.upgrade().is_some() {
                return;
            }
        }
        obj.attach_purge(self.purge.clone());
        self.entries.insert(
            oid,
            CacheEntry {
                target: Arc::downgrade(obj),
                saved_image: None,
            },
        );
        let state = *obj.read().state();
        if state.is_hollow() {
            self.prefetch.push(oid);
        }
    }

    /// Returns the live instance for an OID, dropping a stale entry as a
    /// side effect.
    pub fn get(&mut self, oid: Oid) -> Option<ObjRef> {
        self.cleanup();
        match self.entries.get(&oid) {
            Some(entry) => match entry.target.upgrade() {
                Some(obj) => Some(obj),
                None => {
                    self.entries.remove(&oid);
                    None
                }
            },
            None => None,
        }
    }

    /// Returns true if the OID maps to a live instance.
    pub fn contains(&mut self, oid: Oid) -> bool {
        self.get(oid).is_some()
    }

    /// Explicitly removes one entry.
    pub fn evict(&mut self, oid: Oid) {
        self.cleanup();
        self.entries.remove(&oid);
    }

    /// Removes every entry and prefetch candidate.
    pub fn evict_all(&mut self) {
        self.purge.drain();
        self.entries.clear();
        self.prefetch.clear();
    }

    /// Number of entries backed by live instances.
    pub fn len(&mut self) -> usize {
        self.cleanup();
        self.entries
            .values()
            .filter(|e| e.target.upgrade().is_some())
            .count()
    }

    /// Returns true if the cache holds no live entries.
    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    /// Associates a pre-modification snapshot with a cached OID.
    ///
    /// The first snapshot wins: a later call for the same OID within the
    /// same transaction keeps the original image.
    pub fn set_saved_image(&mut self, oid: Oid, image: Bytes) {
        self.cleanup();
        if let Some(entry) = self.entries.get_mut(&oid) {
            entry.saved_image.get_or_insert(image);
        }
    }

    /// Returns true if a snapshot exists for the OID.
    pub fn has_saved_image(&mut self, oid: Oid) -> bool {
        self.cleanup();
        self.entries
            .get(&oid)
            .is_some_and(|e| e.saved_image.is_some())
    }

    /// Atomically removes and returns the snapshot for an OID.
    pub fn take_saved_image(&mut self, oid: Oid) -> Option<Bytes> {
        self.cleanup();
        self.entries.get_mut(&oid).and_then(|e| e.saved_image.take())
    }

    /// Drops all snapshots; called at commit.
    pub fn clear_saved_images(&mut self) {
        for entry in self.entries.values_mut() {
            entry.saved_image = None;
        }
    }

    /// Forces every live cached object hollow (field state dropped,
    /// identity kept). Used at transaction/database boundaries.
    pub fn hollow_objects(&mut self) {
        self.cleanup();
        for entry in self.entries.values() {
            if let Some(obj) = entry.target.upgrade() {
                obj.write().unload();
            }
        }
    }

    /// Clears the transactional association of every live cached object.
    pub fn make_objects_nontransactional(&mut self) {
        self.cleanup();
        for entry in self.entries.values() {
            if let Some(obj) = entry.target.upgrade() {
                obj.write().state_mut().attached = false;
            }
        }
    }

    /// Returns and clears the prefetch candidates that are still cached and
    /// still hollow, enabling one bulk load instead of N round trips.
    pub fn get_and_clear_prefetches(&mut self) -> Vec<Oid> {
        self.cleanup();
        let candidates = std::mem::take(&mut self.prefetch);
        candidates
            .into_iter()
            .filter(|oid| {
                self.entries
                    .get(oid)
                    .and_then(|e| e.target.upgrade())
                    .is_some_and(|obj| obj.read().state().is_hollow())
            })
            .collect()
    }
}

impl Default for ObjectCache {
    fn default() -> Self {
        Self::new()
    }
}
