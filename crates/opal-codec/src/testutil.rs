//! Minimal in-memory persister for codec tests.

use opal_common::{ClassId, Oid, Result};
use opal_core::{ClassRegistry, DynObject, ObjCell, ObjRef, Persistable, Persister, Value};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

pub const WIDGET_CLASS: ClassId = ClassId::new(20);

fn widget_factory(oid: Oid) -> Box<dyn Persistable> {
    let mut obj = DynObject::hollow("Widget", WIDGET_CLASS);
    obj.state_mut().oid = oid;
    Box::new(obj)
}

/// Identity-only persister: assigns OIDs and hands out hollow widgets, but
/// never loads fields.
pub struct TestPersister {
    registry: ClassRegistry,
    objects: Mutex<HashMap<Oid, ObjRef>>,
    next_index: AtomicU64,
}

impl TestPersister {
    pub fn new() -> Self {
        let mut registry = ClassRegistry::new();
        registry
            .register(WIDGET_CLASS, "Widget", widget_factory)
            .unwrap();
        Self {
            registry,
            objects: Mutex::new(HashMap::new()),
            next_index: AtomicU64::new(1),
        }
    }

    /// Creates a loaded widget known to this persister, without an OID.
    pub fn new_widget(&self, fields: Vec<Value>) -> ObjRef {
        ObjCell::new(Box::new(DynObject::new_object(
            "Widget",
            WIDGET_CLASS,
            fields,
        )))
    }
}

impl Persister for TestPersister {
    fn registry(&self) -> &ClassRegistry {
        &self.registry
    }

    fn load_object(&self, _obj: &ObjRef) -> Result<()> {
        Ok(())
    }

    fn object_for_oid(&self, oid: Oid) -> Result<Option<ObjRef>> {
        if oid.is_null() {
            return Ok(None);
        }
        let mut objects = self.objects.lock();
        if let Some(obj) = objects.get(&oid) {
            return Ok(Some(obj.clone()));
        }
        let obj = ObjCell::new(self.registry.create_hollow(oid)?);
        objects.insert(oid, obj.clone());
        Ok(Some(obj))
    }

    fn objects_for_oids(&self, oids: &[Oid]) -> Result<Vec<ObjRef>> {
        let mut result = Vec::with_capacity(oids.len());
        for &oid in oids {
            if let Some(obj) = self.object_for_oid(oid)? {
                result.push(obj);
            }
        }
        Ok(result)
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
