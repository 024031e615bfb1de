//! The persister contract.
//!
//! The session layer drives the codec, cache, and index engine through this
//! trait. Core operations take an explicit `&dyn Persister` parameter;
//! there is no ambient thread-local context.

use crate::persist::ObjRef;
use crate::registry::ClassRegistry;
use opal_common::{Oid, Result};

/// Identity and lifecycle services provided by a persistence session.
///
/// A session is usable by one thread at a time; implementations serialize
/// access internally but make no multi-writer guarantees.
pub trait Persister {
    /// The class registry used to materialize hollow instances.
    fn registry(&self) -> &ClassRegistry;

    /// Ensures the object's fields are materialized, loading its stored
    /// image if it is hollow.
    fn load_object(&self, obj: &ObjRef) -> Result<()>;

    /// Returns the live or hollow instance for an OID, or None if the OID
    /// is unknown to the store. The returned object is not necessarily
    /// loaded.
    fn object_for_oid(&self, oid: Oid) -> Result<Option<ObjRef>>;

    /// Bulk form of [`Persister::object_for_oid`]; unknown OIDs are
    /// skipped.
    fn objects_for_oids(&self, oids: &[Oid]) -> Result<Vec<ObjRef>>;

    /// Returns the object's OID, lazily assigning one (and enrolling the
    /// object in the cache and modified ledger) the first time a new object
    /// becomes reachable from a persistent root.
    fn oid_for(&self, obj: &ObjRef) -> Result<Oid>;

    /// Enrolls an object in the modified ledger.
    fn add_to_modified(&self, obj: &ObjRef) -> Result<()>;

    /// Number of objects pending flush.
    fn modified_len(&self) -> usize;

    /// Empties the modified ledger.
    fn clear_modified_list(&self);

    /// Whether hollow objects may be loaded outside a transaction.
    fn allow_nontransactional_reads(&self) -> bool;
}
