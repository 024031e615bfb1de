//! In-memory persister for index tests.
//!
//! Keeps every enrolled object live in a strong map, so nodes never go
//! hollow and loads are no-ops. Index structure and rebalancing are
//! exercised without a session layer; cross-layer behavior is covered by
//! the session crate's integration tests.

use crate::bootstrap::register_bootstrap;
use opal_common::{Oid, OpalError, Result};
use opal_core::{ClassRegistry, ObjRef, Persistable, Persister};
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct MemStore {
    registry: ClassRegistry,
    objects: Mutex<HashMap<Oid, ObjRef>>,
    next_index: AtomicU64,
}

impl MemStore {
    pub fn new() -> Self {
        let mut registry = ClassRegistry::new();
        register_bootstrap(&mut registry).unwrap();
        Self {
            registry,
            objects: Mutex::new(HashMap::new()),
            next_index: AtomicU64::new(1),
        }
    }
}

impl Persister for MemStore {
    fn registry(&self) -> &ClassRegistry {
        &self.registry
    }

    fn load_object(&self, _obj: &ObjRef) -> Result<()> {
        Ok(())
    }

    fn object_for_oid(&self, oid: Oid) -> Result<Option<ObjRef>> {
        Ok(self.objects.lock().get(&oid).cloned())
    }

    fn objects_for_oids(&self, oids: &[Oid]) -> Result<Vec<ObjRef>> {
        let objects = self.objects.lock();
        Ok(oids.iter().filter_map(|oid| objects.get(oid).cloned()).collect())
    }

    fn oid_for(&self, obj: &ObjRef) -> Result<Oid> {
        let oid = obj.oid();
        if !oid.is_null() {
            return Ok(oid);
        }
        let class = obj.read().class_id();
        let oid = Oid::compose(class, self.next_index.fetch_add(1, Ordering::Relaxed));
        obj.set_oid(oid);
        self.objects.lock().insert(oid, obj.clone());
        Ok(oid)
    }

    fn add_to_modified(&self, _obj: &ObjRef) -> Result<()> {
        Ok(())
    }

    fn modified_len(&self) -> usize {
        0
    }

    fn clear_modified_list(&self) {}

    fn allow_nontransactional_reads(&self) -> bool {
        true
    }
}

/// Delegates to a `MemStore`, but once armed fails identity allocation
/// after the given number of further allocations.
pub struct FlakyStore {
    inner: MemStore,
    allocs_left: Cell<Option<u32>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: MemStore::new(),
            allocs_left: Cell::new(None),
        }
    }

    pub fn arm(&self, budget: u32) {
        self.allocs_left.set(Some(budget));
    }

    pub fn disarm(&self) {
        self.allocs_left.set(None);
    }
}

impl Persister for FlakyStore {
    fn registry(&self) -> &ClassRegistry {
        self.inner.registry()
    }

    fn load_object(&self, obj: &ObjRef) -> Result<()> {
        self.inner.load_object(obj)
    }

    fn object_for_oid(&self, oid: Oid) -> Result<Option<ObjRef>> {
        self.inner.object_for_oid(oid)
    }

    fn objects_for_oids(&self, oids: &[Oid]) -> Result<Vec<ObjRef>> {
        self.inner.objects_for_oids(oids)
    }

    fn oid_for(&self, obj: &ObjRef) -> Result<Oid> {
        if let Some(left) = self.allocs_left.get() {
            if left == 0 {
                return Err(OpalError::Internal("allocator exhausted".to_string()));
            }
            self.allocs_left.set(Some(left - 1));
        }
        self.inner.oid_for(obj)
    }

    fn add_to_modified(&self, obj: &ObjRef) -> Result<()> {
        self.inner.add_to_modified(obj)
    }

    fn modified_len(&self) -> usize {
        self.inner.modified_len()
    }

    fn clear_modified_list(&self) {
        self.inner.clear_modified_list()
    }

    fn allow_nontransactional_reads(&self) -> bool {
        self.inner.allow_nontransactional_reads()
    }
}
