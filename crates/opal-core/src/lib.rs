//! OpalDB object model.
//!
//! This crate defines the value model shared by the codec and the index
//! engine, the persistable-object abstraction, the identity-preserving
//! object cache, and the modified-object ledger that tracks objects
//! pending flush within a transaction.

pub mod cache;
pub mod container;
pub mod ledger;
pub mod persist;
pub mod persister;
pub mod registry;
pub mod value;

pub use cache::{ObjectCache, PurgeQueue};
pub use container::{AssociativeOps, Backing, PersistentContainer, Sequence, SetOps};
pub use ledger::{LedgerCursor, ModifiedLedger};
pub use persist::{DynObject, ObjCell, ObjRef, Persistable, PersistState};
pub use persister::Persister;
pub use registry::{ClassRegistry, RegisteredClass};
pub use value::{SharedValue, Value};
