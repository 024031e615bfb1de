//! Persistent B+Tree.
//!
//! Sorted key→OID index. Nodes are persistable objects addressed by OID
//! and loaded on demand through the persister, so a tree larger than
//! memory is demand-paged like any other object graph.
//!
//! Node layout:
//! - leaf: `keys[i]` maps to value `ptrs[i]`; `next` chains to the next
//!   leaf in key order.
//! - interior: `ptrs` holds one more child than `keys`. `ptrs[0]` covers
//!   keys below `keys[0]`; `ptrs[i]` covers `keys[i-1] <= k < keys[i]`;
//!   the last child covers keys at or above the last separator.
//!
//! A full leaf splits at the median; the separator is the right sibling's
//! first key and stays in the leaf. A full interior node splits around the
//! median, which moves up and is removed from both halves. A non-root leaf
//! taking an insert at the tree's extreme edge splits unevenly so the new
//! edge sibling keeps only two keys, which packs ascending or descending
//! bulk loads densely.

use opal_common::{BTreeConfig, ClassId, Oid, OpalError, Result};
use opal_core::value::natural_cmp;
use opal_core::{ObjCell, ObjRef, Persistable, PersistState, Persister, Value};
use std::any::Any;
use std::cmp::Ordering;
use std::mem;
use tracing::{debug, trace};

/// One B+Tree node, leaf or interior.
#[derive(Debug)]
pub struct BTreeNode {
    state: PersistState,
    leaf: bool,
    keys: Vec<Value>,
    /// Value OIDs (leaf, parallel to `keys`) or child OIDs (interior, one
    /// more than `keys`).
    ptrs: Vec<Oid>,
    /// Next leaf in key order; NULL for interiors and the last leaf.
    next: Oid,
}

impl BTreeNode {
    pub const CLASS_ID: ClassId = ClassId::new(1);
    pub const CLASS_NAME: &'static str = "opal.BTreeNode";

    fn new_leaf(keys: Vec<Value>, ptrs: Vec<Oid>, next: Oid) -> Self {
        Self {
            state: PersistState::new_object(),
            leaf: true,
            keys,
            ptrs,
            next,
        }
    }

    fn new_interior(keys: Vec<Value>, children: Vec<Oid>) -> Self {
        Self {
            state: PersistState::new_object(),
            leaf: false,
            keys,
            ptrs: children,
            next: Oid::NULL,
        }
    }

    /// Hollow instance awaiting a load; used by the class registry.
    pub fn hollow(oid: Oid) -> Self {
        Self {
            state: PersistState::hollow(oid),
            leaf: true,
            keys: Vec::new(),
            ptrs: Vec::new(),
            next: Oid::NULL,
        }
    }
}

impl Persistable for BTreeNode {
    fn state(&self) -> &PersistState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut PersistState {
        &mut self.state
    }

    fn class_name(&self) -> &str {
        Self::CLASS_NAME
    }

    fn class_id(&self) -> ClassId {
        Self::CLASS_ID
    }

    fn field_values(&self) -> Vec<Value> {
        vec![
            Value::Bool(self.leaf),
            Value::List(self.keys.clone()),
            Value::I64Array(self.ptrs.iter().map(|o| o.raw() as i64).collect()),
            Value::I64(self.next.raw() as i64),
        ]
    }

    fn set_field_values(&mut self, fields: Vec<Value>) -> Result<()> {
        let mut it = fields.into_iter();
        let (leaf, keys, ptrs, next) = match (it.next(), it.next(), it.next(), it.next()) {
            (
                Some(Value::Bool(leaf)),
                Some(Value::List(keys)),
                Some(Value::I64Array(ptrs)),
                Some(Value::I64(next)),
            ) => (leaf, keys, ptrs, next),
            _ => {
                return Err(OpalError::CorruptImage(
                    "malformed tree node image".to_string(),
                ))
            }
        };
        let expected = if leaf { keys.len() } else { keys.len() + 1 };
        if ptrs.len() != expected {
            return Err(OpalError::CorruptImage(format!(
                "tree node has {} keys but {} pointers",
                keys.len(),
                ptrs.len()
            )));
        }
        self.leaf = leaf;
        self.keys = keys;
        self.ptrs = ptrs.into_iter().map(|p| Oid::new(p as u64)).collect();
        self.next = Oid::new(next as u64);
        self.state.loaded = true;
        Ok(())
    }

    fn unload(&mut self) {
        self.keys.clear();
        self.ptrs.clear();
        self.next = Oid::NULL;
        self.state.loaded = false;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Persistent B+Tree index header.
///
/// The header is itself a persistable object; its stored image carries the
/// root OID, the entry count, and the construction-time configuration.
#[derive(Debug)]
pub struct BTreeIndex {
    state: PersistState,
    config: BTreeConfig,
    root: Oid,
    count: u64,
}

struct Promotion {
    key: Value,
    right: Oid,
}

enum FindStep {
    Leaf(bool, usize),
    Down(Oid),
}

enum LeafStep {
    Entry(Value, Oid),
    Advance(Oid),
}

impl BTreeIndex {
    pub const CLASS_ID: ClassId = ClassId::new(3);
    pub const CLASS_NAME: &'static str = "opal.BTreeIndex";

    /// Creates an empty tree. Node capacity is clamped to at least two
    /// keys so a split always leaves both halves non-empty.
    pub fn new(mut config: BTreeConfig) -> Self {
        config.max_keys = config.max_keys.max(2);
        Self {
            state: PersistState::new_object(),
            config,
            root: Oid::NULL,
            count: 0,
        }
    }

    /// Hollow instance awaiting a load; used by the class registry.
    pub fn hollow(oid: Oid) -> Self {
        Self {
            state: PersistState::hollow(oid),
            config: BTreeConfig::default(),
            root: Oid::NULL,
            count: 0,
        }
    }

    /// Number of entries in the tree.
    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn config(&self) -> &BTreeConfig {
        &self.config
    }

    /// Looks up the OID stored under `key`.
    pub fn get(&self, persister: &dyn Persister, key: &Value) -> Result<Option<Oid>> {
        if self.root.is_null() {
            return Ok(None);
        }
        // With duplicates, repeated splits can scatter a run of equal keys
        // across several leaves, each behind its own retained separator.
        // Walking the leaf chain from the lower bound reaches the first
        // copy wherever the run landed.
        if self.config.allow_duplicates {
            let mut entries = self.range(persister, Some(key), None)?;
            return match entries.next() {
                Some(entry) => {
                    let (k, v) = entry?;
                    if natural_cmp(&k, key)? == Ordering::Equal {
                        Ok(Some(v))
                    } else {
                        Ok(None)
                    }
                }
                None => Ok(None),
            };
        }
        let (leaf, found, pos) = self.find_leaf(persister, key, true)?;
        if found {
            return Ok(Some(read_node(&leaf, |n| n.ptrs[pos])?));
        }
        Ok(None)
    }

    pub fn contains_key(&self, persister: &dyn Persister, key: &Value) -> Result<bool> {
        Ok(self.get(persister, key)?.is_some())
    }

    /// Inserts an entry. Rejects duplicate keys unless the tree was
    /// configured to allow them.
    pub fn insert(&mut self, persister: &dyn Persister, key: Value, value: Oid) -> Result<()> {
        if !key.is_comparable() {
            return Err(OpalError::UnsupportedKeyType(key.type_name()));
        }
        if self.root.is_null() {
            let root = BTreeNode::new_leaf(vec![key], vec![value], Oid::NULL);
            let obj = ObjCell::new(Box::new(root));
            self.root = persister.oid_for(&obj)?;
            self.count = 1;
            self.state.modified = true;
            return Ok(());
        }
        if let Some(promo) = self.insert_rec(persister, self.root, key, value, true, true, true)? {
            let root = BTreeNode::new_interior(vec![promo.key], vec![self.root, promo.right]);
            let obj = ObjCell::new(Box::new(root));
            self.root = persister.oid_for(&obj)?;
            debug!(entries = self.count + 1, "tree height increased");
        }
        self.count += 1;
        self.state.modified = true;
        Ok(())
    }

    /// Replaces the value under an existing key, or inserts if absent.
    /// Returns the previous OID on replacement. Non-structural when the
    /// key exists.
    pub fn put(&mut self, persister: &dyn Persister, key: Value, value: Oid) -> Result<Option<Oid>> {
        if !self.root.is_null() {
            let (leaf, found, pos) = self.find_leaf(persister, &key, true)?;
            if found {
                let old = write_node(persister, &leaf, |n| mem::replace(&mut n.ptrs[pos], value))?;
                return Ok(Some(old));
            }
        }
        self.insert(persister, key, value)?;
        Ok(None)
    }

    /// Removes one entry under `key`, returning its OID. Underfull nodes
    /// borrow from a sibling or merge; an empty root collapses, the only
    /// way tree height shrinks.
    pub fn delete(&mut self, persister: &dyn Persister, key: &Value) -> Result<Oid> {
        if self.root.is_null() {
            return Err(OpalError::KeyNotFound);
        }
        let (removed, _) = self.delete_rec(persister, self.root, key)?;
        self.count -= 1;

        let root_obj = load_node(persister, self.root)?;
        let collapse = read_node(&root_obj, |n| {
            if n.keys.is_empty() {
                Some(if n.leaf { Oid::NULL } else { n.ptrs[0] })
            } else {
                None
            }
        })?;
        if let Some(new_root) = collapse {
            debug!(entries = self.count, "tree height decreased");
            self.root = new_root;
        }
        self.state.modified = true;
        Ok(removed)
    }

    /// Smallest key in the tree.
    pub fn first_key(&self, persister: &dyn Persister) -> Result<Option<Value>> {
        if self.root.is_null() {
            return Ok(None);
        }
        let mut oid = self.root;
        loop {
            let obj = load_node(persister, oid)?;
            let step = read_node(&obj, |n| {
                if n.leaf {
                    FindStep::Leaf(true, 0)
                } else {
                    FindStep::Down(n.ptrs[0])
                }
            })?;
            match step {
                FindStep::Leaf(..) => return read_node(&obj, |n| n.keys.first().cloned()),
                FindStep::Down(child) => oid = child,
            }
        }
    }

    /// Largest key in the tree.
    pub fn last_key(&self, persister: &dyn Persister) -> Result<Option<Value>> {
        if self.root.is_null() {
            return Ok(None);
        }
        let mut oid = self.root;
        loop {
            let obj = load_node(persister, oid)?;
            let step = read_node(&obj, |n| {
                if n.leaf {
                    FindStep::Leaf(true, 0)
                } else {
                    FindStep::Down(n.ptrs[n.ptrs.len() - 1])
                }
            })?;
            match step {
                FindStep::Leaf(..) => return read_node(&obj, |n| n.keys.last().cloned()),
                FindStep::Down(child) => oid = child,
            }
        }
    }

    /// Iterates entries with `lo <= key < hi` in ascending key order by
    /// walking the leaf chain. `None` bounds are open.
    pub fn range<'p>(
        &self,
        persister: &'p dyn Persister,
        lo: Option<&Value>,
        hi: Option<&Value>,
    ) -> Result<RangeIter<'p>> {
        if self.root.is_null() {
            return Ok(RangeIter {
                persister,
                leaf: Oid::NULL,
                pos: 0,
                hi: None,
                done: false,
            });
        }
        let (leaf, pos) = match lo {
            None => (self.leftmost_leaf(persister)?, 0),
            Some(lo) => {
                let (leaf, _, pos) = self.find_leaf(persister, lo, false)?;
                (leaf.oid(), pos)
            }
        };
        Ok(RangeIter {
            persister,
            leaf,
            pos,
            hi: hi.cloned(),
            done: false,
        })
    }

    /// Iterates all entries in ascending key order.
    pub fn iter<'p>(&self, persister: &'p dyn Persister) -> Result<RangeIter<'p>> {
        self.range(persister, None, None)
    }

    fn min_keys(&self) -> usize {
        self.config.max_keys / 2
    }

    fn leftmost_leaf(&self, persister: &dyn Persister) -> Result<Oid> {
        let mut oid = self.root;
        loop {
            let obj = load_node(persister, oid)?;
            let step = read_node(&obj, |n| {
                if n.leaf {
                    FindStep::Leaf(true, 0)
                } else {
                    FindStep::Down(n.ptrs[0])
                }
            })?;
            match step {
                FindStep::Leaf(..) => return Ok(oid),
                FindStep::Down(child) => oid = child,
            }
        }
    }

    /// Descends to the leaf covering `key`. With `use_upper`, equal
    /// separators branch right (where a retained separator's entry lives);
    /// otherwise they branch left (lower bound, for range starts).
    fn find_leaf(
        &self,
        persister: &dyn Persister,
        key: &Value,
        use_upper: bool,
    ) -> Result<(ObjRef, bool, usize)> {
        let mut oid = self.root;
        loop {
            let obj = load_node(persister, oid)?;
            let step = read_node(&obj, |n| -> Result<FindStep> {
                if n.leaf {
                    let (found, pos) = search_keys(&n.keys, key)?;
                    Ok(FindStep::Leaf(found, pos))
                } else {
                    let branch = if use_upper {
                        branch_upper(&n.keys, key)?
                    } else {
                        branch_lower(&n.keys, key)?
                    };
                    Ok(FindStep::Down(n.ptrs[branch]))
                }
            })??;
            match step {
                FindStep::Leaf(found, pos) => return Ok((obj, found, pos)),
                FindStep::Down(child) => oid = child,
            }
        }
    }

    fn insert_rec(
        &self,
        persister: &dyn Persister,
        node_oid: Oid,
        key: Value,
        value: Oid,
        left_edge: bool,
        right_edge: bool,
        is_root: bool,
    ) -> Result<Option<Promotion>> {
        let obj = load_node(persister, node_oid)?;
        if read_node(&obj, |n| n.leaf)? {
            return self.insert_leaf(persister, &obj, key, value, left_edge, right_edge, is_root);
        }

        let branch = read_node(&obj, |n| branch_upper(&n.keys, &key))??;
        let (child, children) = read_node(&obj, |n| (n.ptrs[branch], n.ptrs.len()))?;
        let promo = self.insert_rec(
            persister,
            child,
            key,
            value,
            left_edge && branch == 0,
            right_edge && branch == children - 1,
            false,
        )?;
        let Some(promo) = promo else { return Ok(None) };

        let overflow = write_node(persister, &obj, |n| {
            n.keys.insert(branch, promo.key);
            n.ptrs.insert(branch + 1, promo.right);
            n.keys.len() > self.config.max_keys
        })?;
        if !overflow {
            return Ok(None);
        }
        self.split_interior(persister, &obj)
    }

    fn insert_leaf(
        &self,
        persister: &dyn Persister,
        obj: &ObjRef,
        key: Value,
        value: Oid,
        left_edge: bool,
        right_edge: bool,
        is_root: bool,
    ) -> Result<Option<Promotion>> {
        let (found, lower) = read_node(obj, |n| search_keys(&n.keys, &key))??;
        if found && !self.config.allow_duplicates {
            return Err(OpalError::DuplicateKey);
        }
        // Duplicates append after the existing run.
        let pos = if found {
            read_node(obj, |n| branch_upper(&n.keys, &key))??
        } else {
            lower
        };

        if read_node(obj, |n| n.keys.len())? < self.config.max_keys {
            write_node(persister, obj, |n| {
                n.keys.insert(pos, key);
                n.ptrs.insert(pos, value);
            })?;
            return Ok(None);
        }

        // Both halves are built from a copy; the live leaf is rewritten
        // only once the sibling has an identity and every fallible step is
        // behind us, so a failed split leaves the leaf as it was.
        let (mut keys, mut ptrs, next) =
            read_node(obj, |n| (n.keys.clone(), n.ptrs.clone(), n.next))?;
        keys.insert(pos, key);
        ptrs.insert(pos, value);

        let mid = if !is_root && right_edge && pos == keys.len() - 1 {
            keys.len() - 2
        } else if !is_root && left_edge && pos == 0 {
            2
        } else {
            keys.len() / 2
        };
        let right_keys = keys.split_off(mid);
        let right_ptrs = ptrs.split_off(mid);
        let sep = right_keys[0].clone();

        let sibling = BTreeNode::new_leaf(right_keys, right_ptrs, next);
        let sibling_obj = ObjCell::new(Box::new(sibling));
        let right_oid = persister.oid_for(&sibling_obj)?;
        write_node(persister, obj, |n| {
            n.keys = keys;
            n.ptrs = ptrs;
            n.next = right_oid;
        })?;
        trace!(separator = ?sep, "leaf split");
        Ok(Some(Promotion {
            key: sep,
            right: right_oid,
        }))
    }

    fn split_interior(&self, persister: &dyn Persister, obj: &ObjRef) -> Result<Option<Promotion>> {
        // Copy-first, as in `insert_leaf`: the node keeps its overfull but
        // complete contents until the sibling allocation has succeeded.
        let (mut keys, mut ptrs) = read_node(obj, |n| (n.keys.clone(), n.ptrs.clone()))?;
        let mid = keys.len() / 2;
        let right_keys = keys.split_off(mid + 1);
        let sep = keys.remove(mid);
        let right_ptrs = ptrs.split_off(mid + 1);

        let sibling = BTreeNode::new_interior(right_keys, right_ptrs);
        let right_oid = persister.oid_for(&ObjCell::new(Box::new(sibling)))?;
        write_node(persister, obj, |n| {
            n.keys = keys;
            n.ptrs = ptrs;
        })?;
        trace!(separator = ?sep, "interior split");
        Ok(Some(Promotion {
            key: sep,
            right: right_oid,
        }))
    }

    /// Removes `key` below `node_oid`, returning the removed OID and
    /// whether the node underflowed.
    fn delete_rec(
        &self,
        persister: &dyn Persister,
        node_oid: Oid,
        key: &Value,
    ) -> Result<(Oid, bool)> {
        let obj = load_node(persister, node_oid)?;
        if read_node(&obj, |n| n.leaf)? {
            let (found, pos) = read_node(&obj, |n| search_keys(&n.keys, key))??;
            if !found {
                return Err(OpalError::KeyNotFound);
            }
            let min = self.min_keys();
            return write_node(persister, &obj, |n| {
                n.keys.remove(pos);
                let removed = n.ptrs.remove(pos);
                (removed, n.keys.len() < min)
            });
        }

        // Equal separators widen the candidate range: a duplicate run can
        // leave copies in any child between the lower and upper bound
        // branches. Descend upper-first (a retained separator's own entry
        // lives right of it) and fall back across the range on a miss.
        let (lower, upper) = read_node(&obj, |n| -> Result<(usize, usize)> {
            Ok((branch_lower(&n.keys, key)?, branch_upper(&n.keys, key)?))
        })??;
        for branch in (lower..=upper).rev() {
            let child = read_node(&obj, |n| n.ptrs[branch])?;
            let (removed, child_under) = match self.delete_rec(persister, child, key) {
                Err(OpalError::KeyNotFound) if branch > lower => continue,
                other => other?,
            };
            let under = if child_under {
                self.rebalance(persister, &obj, branch)?
            } else {
                false
            };
            return Ok((removed, under));
        }
        Err(OpalError::KeyNotFound)
    }

    /// Fixes an underfull child at `branch`: borrow from a richer
    /// sibling, else merge. Returns whether the parent underflowed.
    fn rebalance(&self, persister: &dyn Persister, parent: &ObjRef, branch: usize) -> Result<bool> {
        let (child_oid, parent_keys) = read_node(parent, |n| (n.ptrs[branch], n.keys.len()))?;
        let child = load_node(persister, child_oid)?;
        let child_leaf = read_node(&child, |n| n.leaf)?;
        let min = self.min_keys();

        if branch > 0 {
            let left_oid = read_node(parent, |n| n.ptrs[branch - 1])?;
            let left = load_node(persister, left_oid)?;
            if read_node(&left, |n| n.keys.len())? > min {
                if child_leaf {
                    let (k, v) = write_node(persister, &left, |n| {
                        let last = n.keys.len() - 1;
                        (n.keys.remove(last), n.ptrs.remove(last))
                    })?;
                    write_node(persister, &child, |n| {
                        n.keys.insert(0, k.clone());
                        n.ptrs.insert(0, v);
                    })?;
                    write_node(persister, parent, |n| n.keys[branch - 1] = k)?;
                } else {
                    let (k, p) = write_node(persister, &left, |n| {
                        let last_key = n.keys.len() - 1;
                        let last_ptr = n.ptrs.len() - 1;
                        (n.keys.remove(last_key), n.ptrs.remove(last_ptr))
                    })?;
                    let sep =
                        write_node(persister, parent, |n| mem::replace(&mut n.keys[branch - 1], k))?;
                    write_node(persister, &child, |n| {
                        n.keys.insert(0, sep);
                        n.ptrs.insert(0, p);
                    })?;
                }
                return Ok(false);
            }
        }

        if branch < parent_keys {
            let right_oid = read_node(parent, |n| n.ptrs[branch + 1])?;
            let right = load_node(persister, right_oid)?;
            if read_node(&right, |n| n.keys.len())? > min {
                if child_leaf {
                    let (k, v) =
                        write_node(persister, &right, |n| (n.keys.remove(0), n.ptrs.remove(0)))?;
                    let new_sep = read_node(&right, |n| n.keys[0].clone())?;
                    write_node(persister, &child, |n| {
                        n.keys.push(k);
                        n.ptrs.push(v);
                    })?;
                    write_node(persister, parent, |n| n.keys[branch] = new_sep)?;
                } else {
                    let (k, p) =
                        write_node(persister, &right, |n| (n.keys.remove(0), n.ptrs.remove(0)))?;
                    let sep =
                        write_node(persister, parent, |n| mem::replace(&mut n.keys[branch], k))?;
                    write_node(persister, &child, |n| {
                        n.keys.push(sep);
                        n.ptrs.push(p);
                    })?;
                }
                return Ok(false);
            }
        }

        let left_idx = branch.saturating_sub(1);
        self.merge_children(persister, parent, left_idx)
    }

    /// Merges `children[left_idx + 1]` into `children[left_idx]` and
    /// unlinks the right sibling.
    fn merge_children(
        &self,
        persister: &dyn Persister,
        parent: &ObjRef,
        left_idx: usize,
    ) -> Result<bool> {
        let (left_oid, right_oid, sep) = read_node(parent, |n| {
            (n.ptrs[left_idx], n.ptrs[left_idx + 1], n.keys[left_idx].clone())
        })?;
        let left = load_node(persister, left_oid)?;
        let right = load_node(persister, right_oid)?;

        let leaf = read_node(&left, |n| n.leaf)?;
        // The right sibling is read, never rewritten; nothing references
        // it once the parent drops its pointer.
        let (right_keys, right_ptrs, right_next) =
            read_node(&right, |n| (n.keys.clone(), n.ptrs.clone(), n.next))?;
        write_node(persister, &left, |n| {
            if leaf {
                n.keys.extend(right_keys);
                n.ptrs.extend(right_ptrs);
                n.next = right_next;
            } else {
                n.keys.push(sep);
                n.keys.extend(right_keys);
                n.ptrs.extend(right_ptrs);
            }
        })?;
        let min = self.min_keys();
        write_node(persister, parent, |n| {
            n.keys.remove(left_idx);
            n.ptrs.remove(left_idx + 1);
            n.keys.len() < min
        })
    }
}

impl Persistable for BTreeIndex {
    fn state(&self) -> &PersistState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut PersistState {
        &mut self.state
    }

    fn class_name(&self) -> &str {
        Self::CLASS_NAME
    }

    fn class_id(&self) -> ClassId {
        Self::CLASS_ID
    }

    fn field_values(&self) -> Vec<Value> {
        vec![
            Value::I64(self.root.raw() as i64),
            Value::I64(self.count as i64),
            Value::I64(self.config.max_keys as i64),
            Value::Bool(self.config.allow_duplicates),
            Value::Bool(self.config.dynamic_sizing),
        ]
    }

    fn set_field_values(&mut self, fields: Vec<Value>) -> Result<()> {
        let mut it = fields.into_iter();
        match (it.next(), it.next(), it.next(), it.next(), it.next()) {
            (
                Some(Value::I64(root)),
                Some(Value::I64(count)),
                Some(Value::I64(max_keys)),
                Some(Value::Bool(allow_duplicates)),
                Some(Value::Bool(dynamic_sizing)),
            ) => {
                self.root = Oid::new(root as u64);
                self.count = count as u64;
                self.config = BTreeConfig {
                    max_keys: max_keys as usize,
                    allow_duplicates,
                    dynamic_sizing,
                };
                self.state.loaded = true;
                Ok(())
            }
            _ => Err(OpalError::CorruptImage(
                "malformed tree header image".to_string(),
            )),
        }
    }

    fn unload(&mut self) {
        self.root = Oid::NULL;
        self.count = 0;
        self.state.loaded = false;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Ascending iterator over a key range, walking the leaf chain.
pub struct RangeIter<'p> {
    persister: &'p dyn Persister,
    leaf: Oid,
    pos: usize,
    /// Exclusive upper bound; `None` runs to the last leaf.
    hi: Option<Value>,
    done: bool,
}

impl Iterator for RangeIter<'_> {
    type Item = Result<(Value, Oid)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if self.leaf.is_null() {
                self.done = true;
                return None;
            }
            let obj = match load_node(self.persister, self.leaf) {
                Ok(obj) => obj,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            let pos = self.pos;
            let step = match read_node(&obj, |n| {
                if pos < n.keys.len() {
                    LeafStep::Entry(n.keys[pos].clone(), n.ptrs[pos])
                } else {
                    LeafStep::Advance(n.next)
                }
            }) {
                Ok(step) => step,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            match step {
                LeafStep::Advance(next) => {
                    self.leaf = next;
                    self.pos = 0;
                }
                LeafStep::Entry(key, value) => {
                    if let Some(hi) = &self.hi {
                        match natural_cmp(&key, hi) {
                            Ok(Ordering::Less) => {}
                            Ok(_) => {
                                self.done = true;
                                return None;
                            }
                            Err(e) => {
                                self.done = true;
                                return Some(Err(e));
                            }
                        }
                    }
                    self.pos += 1;
                    return Some(Ok((key, value)));
                }
            }
        }
    }
}

fn load_node(persister: &dyn Persister, oid: Oid) -> Result<ObjRef> {
    let obj = persister
        .object_for_oid(oid)?
        .ok_or_else(|| OpalError::IndexCorrupted(format!("dangling node reference {:?}", oid)))?;
    persister.load_object(&obj)?;
    Ok(obj)
}

fn read_node<R>(obj: &ObjRef, f: impl FnOnce(&BTreeNode) -> R) -> Result<R> {
    let guard = obj.read();
    let node = guard
        .as_any()
        .downcast_ref::<BTreeNode>()
        .ok_or_else(|| OpalError::IndexCorrupted("object is not a tree node".to_string()))?;
    Ok(f(node))
}

/// Mutates a node under its write lock. Enrollment happens first: if it
/// fails, the node has not been touched yet.
fn write_node<R>(
    persister: &dyn Persister,
    obj: &ObjRef,
    f: impl FnOnce(&mut BTreeNode) -> R,
) -> Result<R> {
    persister.add_to_modified(obj)?;
    let mut guard = obj.write();
    let node = guard
        .as_any_mut()
        .downcast_mut::<BTreeNode>()
        .ok_or_else(|| OpalError::IndexCorrupted("object is not a tree node".to_string()))?;
    node.state.modified = true;
    Ok(f(node))
}

/// Binary search for `key`: match flag plus the lower-bound position.
fn search_keys(keys: &[Value], key: &Value) -> Result<(bool, usize)> {
    let mut lo = 0;
    let mut hi = keys.len();
    let mut found = false;
    while lo < hi {
        let mid = (lo + hi) / 2;
        match natural_cmp(&keys[mid], key)? {
            Ordering::Less => lo = mid + 1,
            Ordering::Equal => {
                found = true;
                hi = mid;
            }
            Ordering::Greater => hi = mid,
        }
    }
    Ok((found, lo))
}

/// Child index for descent with equal keys branching right.
fn branch_upper(keys: &[Value], key: &Value) -> Result<usize> {
    let mut lo = 0;
    let mut hi = keys.len();
    while lo < hi {
        let mid = (lo + hi) / 2;
        if natural_cmp(&keys[mid], key)? == Ordering::Greater {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    Ok(lo)
}

/// Child index for descent with equal keys branching left.
fn branch_lower(keys: &[Value], key: &Value) -> Result<usize> {
    let mut lo = 0;
    let mut hi = keys.len();
    while lo < hi {
        let mid = (lo + hi) / 2;
        if natural_cmp(&keys[mid], key)? == Ordering::Less {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FlakyStore, MemStore};
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    fn small_tree(allow_duplicates: bool) -> BTreeIndex {
        BTreeIndex::new(BTreeConfig {
            max_keys: 4,
            allow_duplicates,
            dynamic_sizing: false,
        })
    }

    fn key_i(v: &Value) -> i64 {
        match v {
            Value::I64(x) => *x,
            other => panic!("expected integer key, got {:?}", other),
        }
    }

    /// Reads a node's parts: (leaf, keys as i64, ptrs, next).
    fn node_parts(store: &MemStore, oid: Oid) -> (bool, Vec<i64>, Vec<Oid>, Oid) {
        let obj = load_node(store, oid).unwrap();
        read_node(&obj, |n| {
            (
                n.leaf,
                n.keys.iter().map(key_i).collect(),
                n.ptrs.clone(),
                n.next,
            )
        })
        .unwrap()
    }

    fn collect_keys(tree: &BTreeIndex, store: &dyn Persister) -> Vec<i64> {
        tree.iter(store)
            .unwrap()
            .map(|r| key_i(&r.unwrap().0))
            .collect()
    }

    #[test]
    fn test_first_split_promotes_median() {
        let store = MemStore::new();
        let mut tree = small_tree(false);
        for k in 1..=4 {
            tree.insert(&store, Value::I64(k), Oid::new(k as u64)).unwrap();
        }
        // Still a single leaf root.
        let (leaf, keys, _, _) = node_parts(&store, tree.root);
        assert!(leaf);
        assert_eq!(keys, vec![1, 2, 3, 4]);

        tree.insert(&store, Value::I64(5), Oid::new(5)).unwrap();
        let (leaf, keys, children, _) = node_parts(&store, tree.root);
        assert!(!leaf);
        assert_eq!(keys, vec![3]);
        let (_, left_keys, _, left_next) = node_parts(&store, children[0]);
        let (_, right_keys, _, _) = node_parts(&store, children[1]);
        assert_eq!(left_keys, vec![1, 2]);
        assert_eq!(right_keys, vec![3, 4, 5]);
        assert_eq!(left_next, children[1]);
    }

    #[test]
    fn test_ascending_bulk_load_shape() {
        let store = MemStore::new();
        let mut tree = small_tree(false);
        for k in 1..=9i64 {
            tree.insert(&store, Value::I64(k), Oid::new(k as u64)).unwrap();
        }
        let (_, root_keys, children, _) = node_parts(&store, tree.root);
        assert_eq!(root_keys, vec![3, 6]);
        assert_eq!(node_parts(&store, children[0]).1, vec![1, 2]);
        assert_eq!(node_parts(&store, children[1]).1, vec![3, 4, 5]);
        assert_eq!(node_parts(&store, children[2]).1, vec![6, 7, 8, 9]);

        // Exact lookup lands in the rightmost leaf.
        assert_eq!(tree.get(&store, &Value::I64(7)).unwrap(), Some(Oid::new(7)));
        assert_eq!(tree.len(), 9);
    }

    #[test]
    fn test_descending_bulk_load_stays_sorted() {
        let store = MemStore::new();
        let mut tree = small_tree(false);
        for k in (1..=50i64).rev() {
            tree.insert(&store, Value::I64(k), Oid::new(k as u64)).unwrap();
        }
        assert_eq!(collect_keys(&tree, &store), (1..=50).collect::<Vec<_>>());
        for k in 1..=50i64 {
            assert_eq!(
                tree.get(&store, &Value::I64(k)).unwrap(),
                Some(Oid::new(k as u64))
            );
        }
    }

    #[test]
    fn test_random_inserts_keep_ordering_invariant() {
        let store = MemStore::new();
        let mut tree = small_tree(false);
        let mut keys: Vec<i64> = (0..200).collect();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        keys.shuffle(&mut rng);
        for &k in &keys {
            tree.insert(&store, Value::I64(k), Oid::new(k as u64 + 1)).unwrap();
        }
        assert_eq!(collect_keys(&tree, &store), (0..200).collect::<Vec<_>>());
        for &k in &keys {
            assert_eq!(
                tree.get(&store, &Value::I64(k)).unwrap(),
                Some(Oid::new(k as u64 + 1))
            );
        }
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let store = MemStore::new();
        let mut tree = small_tree(false);
        tree.insert(&store, Value::I64(1), Oid::new(10)).unwrap();
        let err = tree.insert(&store, Value::I64(1), Oid::new(11)).unwrap_err();
        assert!(matches!(err, OpalError::DuplicateKey));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_duplicates_all_retrievable_when_allowed() {
        let store = MemStore::new();
        let mut tree = small_tree(true);
        for k in 1..=6i64 {
            tree.insert(&store, Value::I64(k), Oid::new(k as u64)).unwrap();
        }
        tree.insert(&store, Value::I64(3), Oid::new(31)).unwrap();
        tree.insert(&store, Value::I64(3), Oid::new(32)).unwrap();

        let hits: Vec<Oid> = tree
            .range(&store, Some(&Value::I64(3)), Some(&Value::I64(4)))
            .unwrap()
            .map(|r| r.unwrap().1)
            .collect();
        assert_eq!(hits.len(), 3);
        assert!(hits.contains(&Oid::new(3)));
        assert!(hits.contains(&Oid::new(31)));
        assert!(hits.contains(&Oid::new(32)));
        assert_eq!(tree.len(), 8);
    }

    #[test]
    fn test_long_duplicate_run_drains_from_any_child() {
        let store = MemStore::new();
        let mut tree = small_tree(true);
        for k in 1..=15i64 {
            tree.insert(&store, Value::I64(k), Oid::new(k as u64)).unwrap();
        }
        // A run long enough that equal separators stack up inside single
        // interior nodes, leaving copies behind middle children too.
        for i in 0..40u64 {
            tree.insert(&store, Value::I64(5), Oid::new(100 + i)).unwrap();
        }
        assert_eq!(tree.len(), 55);

        for remaining in (0..41u64).rev() {
            assert!(tree.get(&store, &Value::I64(5)).unwrap().is_some());
            tree.delete(&store, &Value::I64(5)).unwrap();
            assert_eq!(tree.len(), 14 + remaining);
        }
        assert_eq!(tree.get(&store, &Value::I64(5)).unwrap(), None);
        assert!(matches!(
            tree.delete(&store, &Value::I64(5)),
            Err(OpalError::KeyNotFound)
        ));
        let expect: Vec<i64> = (1..=15).filter(|&k| k != 5).collect();
        assert_eq!(collect_keys(&tree, &store), expect);
    }

    #[test]
    fn test_duplicate_churn_keeps_multiset() {
        let store = MemStore::new();
        let mut tree = small_tree(true);
        let mut rng = rand::rngs::StdRng::seed_from_u64(23);
        let mut live: Vec<i64> = Vec::new();
        let mut next_oid = 1u64;
        // Heavy insert/delete rounds over a handful of keys, so runs keep
        // splitting and shrinking across node boundaries.
        for _ in 0..30 {
            for _ in 0..20 {
                let k = rng.gen_range(0..8);
                tree.insert(&store, Value::I64(k), Oid::new(next_oid)).unwrap();
                next_oid += 1;
                live.push(k);
            }
            for _ in 0..15 {
                let i = rng.gen_range(0..live.len());
                let k = live.swap_remove(i);
                tree.delete(&store, &Value::I64(k)).unwrap();
            }
            assert_eq!(tree.len() as usize, live.len());
            let mut expect = live.clone();
            expect.sort_unstable();
            assert_eq!(collect_keys(&tree, &store), expect);
            for &k in &live {
                assert!(tree.get(&store, &Value::I64(k)).unwrap().is_some());
            }
        }
    }

    #[test]
    fn test_put_replaces_without_structure_change() {
        let store = MemStore::new();
        let mut tree = small_tree(false);
        for k in 1..=5i64 {
            tree.insert(&store, Value::I64(k), Oid::new(k as u64)).unwrap();
        }
        let old = tree.put(&store, Value::I64(3), Oid::new(99)).unwrap();
        assert_eq!(old, Some(Oid::new(3)));
        assert_eq!(tree.get(&store, &Value::I64(3)).unwrap(), Some(Oid::new(99)));
        assert_eq!(tree.len(), 5);

        assert_eq!(tree.put(&store, Value::I64(6), Oid::new(6)).unwrap(), None);
        assert_eq!(tree.len(), 6);
    }

    #[test]
    fn test_delete_returns_value_and_shrinks() {
        let store = MemStore::new();
        let mut tree = small_tree(false);
        for k in 1..=9i64 {
            tree.insert(&store, Value::I64(k), Oid::new(k as u64)).unwrap();
        }
        assert_eq!(tree.delete(&store, &Value::I64(4)).unwrap(), Oid::new(4));
        assert_eq!(tree.len(), 8);
        assert_eq!(tree.get(&store, &Value::I64(4)).unwrap(), None);
        assert_eq!(collect_keys(&tree, &store), vec![1, 2, 3, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_delete_missing_key() {
        let store = MemStore::new();
        let mut tree = small_tree(false);
        tree.insert(&store, Value::I64(1), Oid::new(1)).unwrap();
        assert!(matches!(
            tree.delete(&store, &Value::I64(2)),
            Err(OpalError::KeyNotFound)
        ));
        assert!(matches!(
            small_tree(false).delete(&store, &Value::I64(1)),
            Err(OpalError::KeyNotFound)
        ));
    }

    #[test]
    fn test_delete_everything_collapses_root() {
        let store = MemStore::new();
        let mut tree = small_tree(false);
        let mut keys: Vec<i64> = (0..100).collect();
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        keys.shuffle(&mut rng);
        for &k in &keys {
            tree.insert(&store, Value::I64(k), Oid::new(k as u64 + 1)).unwrap();
        }
        keys.shuffle(&mut rng);
        for (i, &k) in keys.iter().enumerate() {
            tree.delete(&store, &Value::I64(k)).unwrap();
            // Ordering invariant holds after every removal.
            let remaining = collect_keys(&tree, &store);
            assert_eq!(remaining.len(), keys.len() - i - 1);
            assert!(remaining.windows(2).all(|w| w[0] < w[1]));
        }
        assert!(tree.is_empty());
        assert!(tree.root.is_null());
        assert!(tree.first_key(&store).unwrap().is_none());
    }

    #[test]
    fn test_failed_leaf_split_allocation_leaves_leaf_intact() {
        let store = FlakyStore::new();
        let mut tree = small_tree(false);
        for k in 1..=4i64 {
            tree.insert(&store, Value::I64(k), Oid::new(k as u64)).unwrap();
        }
        store.arm(0);
        let err = tree.insert(&store, Value::I64(5), Oid::new(5)).unwrap_err();
        assert!(matches!(err, OpalError::Internal(_)));
        store.disarm();

        assert_eq!(tree.len(), 4);
        assert_eq!(collect_keys(&tree, &store), vec![1, 2, 3, 4]);

        // The same insert lands once allocation recovers.
        tree.insert(&store, Value::I64(5), Oid::new(5)).unwrap();
        assert_eq!(collect_keys(&tree, &store), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_failed_cascading_split_keeps_entries_reachable() {
        // Exhaust the allocator at every point of a multi-level split in
        // turn: the leaf sibling, the interior sibling, the new root.
        for budget in 0..4u32 {
            let store = FlakyStore::new();
            let mut tree = small_tree(false);
            let mut next = 1i64;
            for _ in 0..60 {
                tree.insert(&store, Value::I64(next), Oid::new(next as u64)).unwrap();
                next += 1;
            }
            store.arm(budget);
            loop {
                match tree.insert(&store, Value::I64(next), Oid::new(next as u64)) {
                    Ok(()) => next += 1,
                    Err(OpalError::Internal(_)) => break,
                    Err(other) => panic!("unexpected error {:?}", other),
                }
            }
            store.disarm();

            // Every key inserted so far is still reachable, in order.
            let keys = collect_keys(&tree, &store);
            assert!(keys.windows(2).all(|w| w[0] < w[1]));
            for k in 1..next {
                assert!(tree.get(&store, &Value::I64(k)).unwrap().is_some());
            }

            tree.insert(&store, Value::I64(next + 1), Oid::new(next as u64 + 1))
                .unwrap();
            assert!(tree.get(&store, &Value::I64(next + 1)).unwrap().is_some());
        }
    }

    #[test]
    fn test_range_respects_bounds() {
        let store = MemStore::new();
        let mut tree = small_tree(false);
        for k in (0..40i64).map(|k| k * 2) {
            tree.insert(&store, Value::I64(k), Oid::new(k as u64 + 1)).unwrap();
        }
        // lo inclusive, hi exclusive; lo may fall between keys.
        let got: Vec<i64> = tree
            .range(&store, Some(&Value::I64(9)), Some(&Value::I64(20)))
            .unwrap()
            .map(|r| key_i(&r.unwrap().0))
            .collect();
        assert_eq!(got, vec![10, 12, 14, 16, 18]);

        let tail: Vec<i64> = tree
            .range(&store, Some(&Value::I64(70)), None)
            .unwrap()
            .map(|r| key_i(&r.unwrap().0))
            .collect();
        assert_eq!(tail, vec![70, 72, 74, 76, 78]);
    }

    #[test]
    fn test_first_and_last_key() {
        let store = MemStore::new();
        let mut tree = small_tree(false);
        assert!(tree.first_key(&store).unwrap().is_none());
        for k in [5i64, 1, 9, 3, 7, 2, 8] {
            tree.insert(&store, Value::I64(k), Oid::new(k as u64)).unwrap();
        }
        assert_eq!(tree.first_key(&store).unwrap().map(|v| key_i(&v)), Some(1));
        assert_eq!(tree.last_key(&store).unwrap().map(|v| key_i(&v)), Some(9));
    }

    #[test]
    fn test_string_keys() {
        let store = MemStore::new();
        let mut tree = small_tree(false);
        for (i, name) in ["pear", "apple", "fig", "plum", "date", "kiwi"].iter().enumerate() {
            tree.insert(&store, Value::String(name.to_string()), Oid::new(i as u64 + 1))
                .unwrap();
        }
        assert_eq!(
            tree.get(&store, &Value::String("fig".into())).unwrap(),
            Some(Oid::new(3))
        );
        let names: Vec<String> = tree
            .iter(&store)
            .unwrap()
            .map(|r| match r.unwrap().0 {
                Value::String(s) => s,
                other => panic!("unexpected key {:?}", other),
            })
            .collect();
        assert_eq!(names, vec!["apple", "date", "fig", "kiwi", "pear", "plum"]);
    }

    #[test]
    fn test_uncomparable_key_rejected() {
        let store = MemStore::new();
        let mut tree = small_tree(false);
        let err = tree
            .insert(&store, Value::List(vec![]), Oid::new(1))
            .unwrap_err();
        assert!(matches!(err, OpalError::UnsupportedKeyType(_)));
    }

    #[test]
    fn test_mixed_key_kinds_rejected() {
        let store = MemStore::new();
        let mut tree = small_tree(false);
        tree.insert(&store, Value::I64(1), Oid::new(1)).unwrap();
        let err = tree
            .insert(&store, Value::String("x".into()), Oid::new(2))
            .unwrap_err();
        assert!(matches!(err, OpalError::TypeMismatch { .. }));
    }

    #[test]
    fn test_node_image_roundtrip() {
        let node = BTreeNode::new_leaf(
            vec![Value::I64(1), Value::I64(2)],
            vec![Oid::new(10), Oid::new(20)],
            Oid::new(30),
        );
        let fields = node.field_values();
        let mut hollow = BTreeNode::hollow(Oid::new(5));
        hollow.set_field_values(fields).unwrap();
        assert!(hollow.leaf);
        assert_eq!(hollow.keys.len(), 2);
        assert_eq!(hollow.ptrs, vec![Oid::new(10), Oid::new(20)]);
        assert_eq!(hollow.next, Oid::new(30));
        assert!(hollow.state().loaded);
    }

    #[test]
    fn test_node_image_arity_mismatch() {
        let mut hollow = BTreeNode::hollow(Oid::new(5));
        let err = hollow
            .set_field_values(vec![
                Value::Bool(false),
                Value::List(vec![Value::I64(1)]),
                Value::I64Array(vec![7]), // interior needs keys + 1 children
                Value::I64(0),
            ])
            .unwrap_err();
        assert!(matches!(err, OpalError::CorruptImage(_)));
    }
}
