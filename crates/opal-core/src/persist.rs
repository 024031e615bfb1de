//! Persistable objects.
//!
//! Every object with persistent identity carries a [`PersistState`]: its
//! OID (NULL until the object first becomes reachable from a persistent
//! root), a loaded flag (false = hollow), a modified flag, a new flag, and
//! an attached flag marking association with a persistence context.
//!
//! Live instances are held in an [`ObjCell`] behind an `Arc`. The cache
//! keeps only weak handles; when the last strong reference drops, the
//! cell's `Drop` pushes its OID onto the owning purge queue so the cache
//! can reclaim the slot on its next `cleanup()`.

use crate::cache::PurgeQueue;
use crate::value::Value;
use opal_common::{ClassId, Oid, Result};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Lifecycle state shared by all persistable objects.
#[derive(Debug, Clone, Copy)]
pub struct PersistState {
    /// Surrogate identity; NULL until first reachability.
    pub oid: Oid,
    /// False while the object is hollow (fields not materialized).
    pub loaded: bool,
    /// True if the object has uncommitted field changes.
    pub modified: bool,
    /// True until the object's first flush.
    pub new_object: bool,
    /// True while the object is associated with a persistence context.
    pub attached: bool,
}

impl PersistState {
    /// State of a freshly created in-memory object: new, unloaded, no OID.
    pub fn new_object() -> Self {
        Self {
            oid: Oid::NULL,
            loaded: false,
            modified: false,
            new_object: true,
            attached: false,
        }
    }

    /// State of a hollow instance materialized for a known OID.
    pub fn hollow(oid: Oid) -> Self {
        Self {
            oid,
            loaded: false,
            modified: false,
            new_object: false,
            attached: true,
        }
    }

    /// Returns true if this object still needs its fields loaded.
    pub fn is_hollow(&self) -> bool {
        !self.loaded && !self.new_object
    }
}

/// An object with persistent identity.
///
/// Implementations expose their persistent fields as a positional value
/// vector; the codec encodes that vector depth-first and the graph walker
/// traverses it.
pub trait Persistable: Any + Send + Sync {
    /// Lifecycle state.
    fn state(&self) -> &PersistState;

    /// Mutable lifecycle state.
    fn state_mut(&mut self) -> &mut PersistState;

    /// Persistent class name.
    fn class_name(&self) -> &str;

    /// Persistent class identifier.
    fn class_id(&self) -> ClassId;

    /// Snapshot of the object's persistent fields in declaration order.
    fn field_values(&self) -> Vec<Value>;

    /// Installs decoded field values; the implementation validates arity
    /// and kinds and surfaces violations as `CorruptImage`.
    fn set_field_values(&mut self, fields: Vec<Value>) -> Result<()>;

    /// Drops in-memory field state, keeping identity. Sets loaded = false.
    fn unload(&mut self);

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Shared cell holding a live persistable instance.
///
/// The OID is mirrored into an atomic so `Drop` can report it to the purge
/// queue without touching the body lock.
pub struct ObjCell {
    oid: AtomicU64,
    purge: Mutex<Option<Arc<PurgeQueue>>>,
    body: RwLock<Box<dyn Persistable>>,
}

/// Strong reference to a live persistable instance.
pub type ObjRef = Arc<ObjCell>;

impl ObjCell {
    /// Wraps a persistable body into a shared cell.
    pub fn new(body: Box<dyn Persistable>) -> ObjRef {
        let oid = body.state().oid;
        Arc::new(Self {
            oid: AtomicU64::new(oid.raw()),
            purge: Mutex::new(None),
            body: RwLock::new(body),
        })
    }

    /// Returns the object's OID (NULL if unassigned).
    pub fn oid(&self) -> Oid {
        Oid::new(self.oid.load(Ordering::Acquire))
    }

    /// Assigns the object's OID, mirroring it into the body state.
    pub fn set_oid(&self, oid: Oid) {
        self.oid.store(oid.raw(), Ordering::Release);
        self.body.write().state_mut().oid = oid;
    }

    /// Associates this cell with a purge queue; called when the cell is
    /// added to an object cache.
    pub fn attach_purge(&self, queue: Arc<PurgeQueue>) {
        *self.purge.lock() = Some(queue);
    }

    /// Read access to the body.
    pub fn read(&self) -> RwLockReadGuard<'_, Box<dyn Persistable>> {
        self.body.read()
    }

    /// Write access to the body.
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<dyn Persistable>> {
        self.body.write()
    }
}

impl Drop for ObjCell {
    fn drop(&mut self) {
        let oid = self.oid();
        if oid.is_null() {
            return;
        }
        if let Some(queue) = self.purge.get_mut().take() {
            queue.push(oid);
        }
    }
}

impl std::fmt::Debug for ObjCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjCell")
            .field("oid", &self.oid())
            .field("class", &self.read().class_name())
            .finish()
    }
}

/// General-purpose persistable: a class name plus positional fields.
///
/// The session layer and tests use this for application objects; index
/// nodes and other system classes implement [`Persistable`] directly.
#[derive(Debug)]
pub struct DynObject {
    state: PersistState,
    class: String,
    class_id: ClassId,
    fields: Vec<Value>,
}

impl DynObject {
    /// Creates a new transient object with the given fields.
    pub fn new_object(class: &str, class_id: ClassId, fields: Vec<Value>) -> Self {
        Self {
            state: PersistState::new_object(),
            class: class.to_string(),
            class_id,
            fields,
        }
    }

    /// Creates a hollow instance awaiting a load.
    pub fn hollow(class: &str, class_id: ClassId) -> Self {
        Self {
            state: PersistState::hollow(Oid::NULL),
            class: class.to_string(),
            class_id,
            fields: Vec::new(),
        }
    }

    /// Returns the field at `index`, or NULL if the slot does not exist.
    pub fn field(&self, index: usize) -> Value {
        self.fields.get(index).cloned().unwrap_or(Value::Null)
    }

    /// Replaces the field at `index`, extending with NULLs as needed, and
    /// marks the object modified.
    pub fn set_field(&mut self, index: usize, value: Value) {
        if self.fields.len() <= index {
            self.fields.resize(index + 1, Value::Null);
        }
        self.fields[index] = value;
        self.state.modified = true;
    }

    /// Number of fields currently materialized.
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }
}

impl Persistable for DynObject {
    fn state(&self) -> &PersistState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut PersistState {
        &mut self.state
    }

    fn class_name(&self) -> &str {
        &self.class
    }

    fn class_id(&self) -> ClassId {
        self.class_id
    }

    fn field_values(&self) -> Vec<Value> {
        self.fields.clone()
    }

    fn set_field_values(&mut self, fields: Vec<Value>) -> Result<()> {
        self.fields = fields;
        self.state.loaded = true;
        Ok(())
    }

    fn unload(&mut self) {
        self.fields.clear();
        self.state.loaded = false;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
