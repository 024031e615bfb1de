//! OpalDB index engine.
//!
//! Sorted and hashed key→OID indexes stored as persistent object graphs.
//! Index nodes are themselves persistable objects addressed by OID and
//! loaded on demand through the same codec and cache as application
//! objects, so an index larger than memory is fully demand-paged.

pub mod bootstrap;
pub mod btree;
pub mod hash;

#[cfg(test)]
mod testutil;

pub use bootstrap::register_bootstrap;
pub use btree::{BTreeIndex, BTreeNode, RangeIter};
pub use hash::{EntryIter, HashBlock, LinearHashIndex, ValuesIter};
