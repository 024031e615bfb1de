//! In-memory persistence session.
//!
//! Stores committed object images in a map keyed by OID. Live instances
//! are tracked by the identity cache; modified objects are flushed through
//! the codec when the transaction commits. The locks below keep the
//! session internally consistent, but a session serves one thread at a
//! time; no multi-writer coordination is attempted.

use bytes::Bytes;
use opal_codec::{encode_object, ObjectReader, ScratchPool};
use opal_common::{ClassId, Oid, OpalError, Result, SessionConfig};
use opal_core::{ClassRegistry, ModifiedLedger, ObjCell, ObjRef, ObjectCache, Persistable, Persister};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// One committed object image.
struct StoredImage {
    class: ClassId,
    bytes: Bytes,
}

/// In-memory session backend.
pub struct MemSession {
    config: SessionConfig,
    registry: ClassRegistry,
    cache: Mutex<ObjectCache>,
    ledger: Mutex<ModifiedLedger>,
    images: Mutex<HashMap<Oid, StoredImage>>,
    /// Next object index per class; OIDs compose the class bits with this.
    allocators: Mutex<HashMap<ClassId, u64>>,
    pool: Arc<ScratchPool>,
    txn_open: AtomicBool,
}

impl MemSession {
    /// Creates a session over an empty store. The registry must already
    /// hold every class the session will materialize, bootstrap classes
    /// included.
    pub fn new(config: SessionConfig, registry: ClassRegistry) -> Self {
        let pool = ScratchPool::new(config.decode_pool_size);
        Self {
            config,
            registry,
            cache: Mutex::new(ObjectCache::new()),
            ledger: Mutex::new(ModifiedLedger::new()),
            images: Mutex::new(HashMap::new()),
            allocators: Mutex::new(HashMap::new()),
            pool,
            txn_open: AtomicBool::new(false),
        }
    }

    /// Opens a transaction.
    pub fn begin(&self) {
        self.txn_open.store(true, Ordering::Relaxed);
    }

    /// Returns true while a transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.txn_open.load(Ordering::Relaxed)
    }

    /// Wraps a body into a live cell and makes it persistent: identity is
    /// assigned and the object is enrolled for the next flush.
    pub fn create(&self, body: Box<dyn Persistable>) -> Result<ObjRef> {
        let obj = ObjCell::new(body);
        self.oid_for(&obj)?;
        Ok(obj)
    }

    /// Flushes every enrolled object and ends the transaction.
    ///
    /// The flush iterates the ledger with a cursor: encoding an object can
    /// make further new objects reachable, which enroll behind the cursor
    /// and are flushed in the same pass.
    pub fn commit(&self) -> Result<usize> {
        let mut cursor = self.ledger.lock().cursor();
        let mut flushed = 0usize;
        loop {
            let next = self.ledger.lock().advance(&mut cursor)?;
            let Some(obj) = next else { break };
            if obj.read().state().is_hollow() {
                // Enrolled but never materialized; its stored image is
                // already current.
                continue;
            }
            let image = encode_object(&**obj.read(), self)?;
            let oid = obj.oid();
            let class = obj.read().class_id();
            self.images.lock().insert(oid, StoredImage { class, bytes: image });
            let mut guard = obj.write();
            let state = guard.state_mut();
            state.new_object = false;
            state.modified = false;
            state.loaded = true;
            state.attached = true;
            flushed += 1;
        }
        self.ledger.lock().clear();
        self.cache.lock().clear_saved_images();
        self.txn_open.store(false, Ordering::Relaxed);
        debug!(flushed, stored = self.images.lock().len(), "committed");
        Ok(flushed)
    }

    /// Undoes the transaction: modified objects are restored from their
    /// pre-modification images, new objects are discarded.
    pub fn rollback(&self) -> Result<()> {
        let enrolled: Vec<ObjRef> = {
            let ledger = self.ledger.lock();
            let mut cursor = ledger.cursor();
            let mut objs = Vec::with_capacity(ledger.len());
            while let Some(obj) = ledger.advance(&mut cursor)? {
                objs.push(obj);
            }
            objs
        };
        for obj in enrolled {
            let oid = obj.oid();
            if obj.read().state().new_object {
                obj.write().state_mut().attached = false;
                self.cache.lock().evict(oid);
                continue;
            }
            match self.cache.lock().take_saved_image(oid) {
                Some(image) => {
                    let mut scratch = self.pool.acquire();
                    let mut reader = ObjectReader::new(image, self, scratch.buf());
                    let mut guard = obj.write();
                    reader.read_object_into(&mut **guard)?;
                    guard.state_mut().modified = false;
                    trace!(oid = oid.raw(), "restored pre-modification image");
                }
                None => {
                    // Never snapshotted; drop field state and let the next
                    // access reload from the store.
                    obj.write().unload();
                }
            }
        }
        self.ledger.lock().clear();
        self.cache.lock().clear_saved_images();
        self.txn_open.store(false, Ordering::Relaxed);
        debug!("rolled back");
        Ok(())
    }

    /// Bulk-loads the hollow prefetch candidates accumulated by the
    /// cache, returning how many objects were materialized.
    pub fn prefetch(&self) -> Result<usize> {
        let candidates = self.cache.lock().get_and_clear_prefetches();
        if candidates.is_empty() {
            return Ok(0);
        }
        let objs = self.objects_for_oids(&candidates)?;
        let mut loaded = 0usize;
        for obj in &objs {
            if obj.read().state().is_hollow() {
                self.load_object(obj)?;
                loaded += 1;
            }
        }
        debug!(candidates = candidates.len(), loaded, "prefetched");
        Ok(loaded)
    }

    /// Drains the purge queue, reclaiming slots of dead instances.
    pub fn cleanup(&self) {
        self.cache.lock().cleanup();
    }

    /// Number of live cached instances.
    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Number of committed object images.
    pub fn stored_len(&self) -> usize {
        self.images.lock().len()
    }

    /// Returns true if a committed image exists for the OID.
    pub fn is_stored(&self, oid: Oid) -> bool {
        self.images.lock().contains_key(&oid)
    }

    /// Forces every live cached object hollow. Used at transaction and
    /// database boundaries.
    pub fn hollow_all(&self) {
        self.cache.lock().hollow_objects();
    }

    /// Severs the transactional association of every live cached object.
    pub fn detach_all(&self) {
        self.cache.lock().make_objects_nontransactional();
    }

    /// Empties the cache. Identity restarts from the stored images.
    pub fn evict_all(&self) {
        self.cache.lock().evict_all();
    }
}

impl Persister for MemSession {
    fn registry(&self) -> &ClassRegistry {
        &self.registry
    }

    fn load_object(&self, obj: &ObjRef) -> Result<()> {
        let (oid, hollow) = {
            let guard = obj.read();
            (guard.state().oid, guard.state().is_hollow())
        };
        if !hollow {
            return Ok(());
        }
        if !self.config.allow_nontransactional_reads && !self.in_transaction() {
            return Err(OpalError::NontransactionalRead(oid));
        }
        let image = self
            .images
            .lock()
            .get(&oid)
            .map(|stored| stored.bytes.clone())
            .ok_or(OpalError::ObjectNotFound(oid))?;
        let mut scratch = self.pool.acquire();
        let mut reader = ObjectReader::new(image, self, scratch.buf());
        let mut guard = obj.write();
        reader.read_object_into(&mut **guard)?;
        guard.state_mut().attached = true;
        trace!(oid = oid.raw(), "loaded object");
        Ok(())
    }

    fn object_for_oid(&self, oid: Oid) -> Result<Option<ObjRef>> {
        if oid.is_null() {
            return Ok(None);
        }
        if let Some(obj) = self.cache.lock().get(oid) {
            return Ok(Some(obj));
        }
        let class = match self.images.lock().get(&oid) {
            Some(stored) => stored.class,
            None => return Ok(None),
        };
        let body = self.registry.class_for_id(class)?.create_hollow(oid);
        let obj = ObjCell::new(body);
        self.cache.lock().add(&obj);
        Ok(Some(obj))
    }

    fn objects_for_oids(&self, oids: &[Oid]) -> Result<Vec<ObjRef>> {
        let mut objs = Vec::with_capacity(oids.len());
        for &oid in oids {
            if let Some(obj) = self.object_for_oid(oid)? {
                objs.push(obj);
            }
        }
        Ok(objs)
    }

    fn oid_for(&self, obj: &ObjRef) -> Result<Oid> {
        let existing = obj.oid();
        if !existing.is_null() {
            return Ok(existing);
        }
        let class = obj.read().class_id();
        let index = {
            let mut allocators = self.allocators.lock();
            let counter = allocators.entry(class).or_insert(0);
            *counter += 1;
            *counter
        };
        let oid = Oid::compose(class, index);
        obj.set_oid(oid);
        obj.write().state_mut().attached = true;
        self.cache.lock().add(obj);
        self.ledger.lock().push(obj)?;
        trace!(oid = oid.raw(), class = class.0, "assigned identity");
        Ok(oid)
    }

    fn add_to_modified(&self, obj: &ObjRef) -> Result<()> {
        let oid = obj.oid();
        if oid.is_null() {
            // First reachability: assigning identity also enrolls.
            self.oid_for(obj)?;
            return Ok(());
        }
        if !obj.read().state().new_object {
            if let Some(stored) = self.images.lock().get(&oid) {
                self.cache.lock().set_saved_image(oid, stored.bytes.clone());
            }
        }
        self.ledger.lock().push(obj)?;
        Ok(())
    }

    fn modified_len(&self) -> usize {
        self.ledger.lock().len()
    }

    fn clear_modified_list(&self) {
        self.ledger.lock().clear();
    }

    fn allow_nontransactional_reads(&self) -> bool {
        self.config.allow_nontransactional_reads
    }
}
