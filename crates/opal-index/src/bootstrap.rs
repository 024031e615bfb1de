//! Bootstrap class registration.
//!
//! Index nodes and containers live in the reserved low class-ID range so
//! they can be materialized before any application schema is known. Every
//! session registers these before touching the store.

use crate::btree::{BTreeIndex, BTreeNode};
use crate::hash::{HashBlock, LinearHashIndex};
use opal_common::{Oid, Result};
use opal_core::{ClassRegistry, Persistable, PersistentContainer};

fn btree_node(oid: Oid) -> Box<dyn Persistable> {
    Box::new(BTreeNode::hollow(oid))
}

fn hash_block(oid: Oid) -> Box<dyn Persistable> {
    Box::new(HashBlock::hollow(oid))
}

fn btree_index(oid: Oid) -> Box<dyn Persistable> {
    Box::new(BTreeIndex::hollow(oid))
}

fn linear_hash(oid: Oid) -> Box<dyn Persistable> {
    Box::new(LinearHashIndex::hollow(oid))
}

fn container(oid: Oid) -> Box<dyn Persistable> {
    Box::new(PersistentContainer::hollow(oid))
}

/// Registers the bootstrap system classes.
pub fn register_bootstrap(registry: &mut ClassRegistry) -> Result<()> {
    registry.register(BTreeNode::CLASS_ID, BTreeNode::CLASS_NAME, btree_node)?;
    registry.register(HashBlock::CLASS_ID, HashBlock::CLASS_NAME, hash_block)?;
    registry.register(BTreeIndex::CLASS_ID, BTreeIndex::CLASS_NAME, btree_index)?;
    registry.register(LinearHashIndex::CLASS_ID, LinearHashIndex::CLASS_NAME, linear_hash)?;
    registry.register(
        PersistentContainer::CLASS_ID,
        PersistentContainer::CLASS_NAME,
        container,
    )?;
    Ok(())
}
