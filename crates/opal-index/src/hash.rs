//! Persistent linear hash map.
//!
//! Key→OID map over a power-of-two bucket directory. Each bucket chains
//! fixed-capacity blocks holding parallel key/OID arrays; blocks are
//! persistable objects addressed by OID, like tree nodes. A key's home
//! bucket is `hash(key) & ((1 << num_bits) - 1)`; when the load factor
//! crosses the configured threshold the directory doubles and every chain
//! splits by the newly significant hash bit.

use opal_common::{ClassId, HashConfig, Oid, OpalError, Result};
use opal_core::{ObjCell, ObjRef, Persistable, PersistState, Persister, Value};
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

/// One fixed-capacity block in a bucket chain.
#[derive(Debug)]
pub struct HashBlock {
    state: PersistState,
    keys: Vec<Value>,
    oids: Vec<Oid>,
    /// Next block in the chain; NULL terminates.
    next: Oid,
}

impl HashBlock {
    pub const CLASS_ID: ClassId = ClassId::new(2);
    pub const CLASS_NAME: &'static str = "opal.HashBlock";

    fn from_entries(entries: Vec<(Value, Oid)>) -> Self {
        let mut keys = Vec::with_capacity(entries.len());
        let mut oids = Vec::with_capacity(entries.len());
        for (k, v) in entries {
            keys.push(k);
            oids.push(v);
        }
        Self {
            state: PersistState::new_object(),
            keys,
            oids,
            next: Oid::NULL,
        }
    }

    /// Hollow instance awaiting a load; used by the class registry.
    pub fn hollow(oid: Oid) -> Self {
        Self {
            state: PersistState::hollow(oid),
            keys: Vec::new(),
            oids: Vec::new(),
            next: Oid::NULL,
        }
    }
}

impl Persistable for HashBlock {
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
            Value::List(self.keys.clone()),
            Value::I64Array(self.oids.iter().map(|o| o.raw() as i64).collect()),
            Value::I64(self.next.raw() as i64),
        ]
    }

    fn set_field_values(&mut self, fields: Vec<Value>) -> Result<()> {
        let mut it = fields.into_iter();
        match (it.next(), it.next(), it.next()) {
            (Some(Value::List(keys)), Some(Value::I64Array(oids)), Some(Value::I64(next)))
                if keys.len() == oids.len() =>
            {
                self.keys = keys;
                self.oids = oids.into_iter().map(|o| Oid::new(o as u64)).collect();
                self.next = Oid::new(next as u64);
                self.state.loaded = true;
                Ok(())
            }
            _ => Err(OpalError::CorruptImage(
                "malformed hash block image".to_string(),
            )),
        }
    }

    fn unload(&mut self) {
        self.keys.clear();
        self.oids.clear();
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

/// Persistent linear hash map header.
#[derive(Debug)]
pub struct LinearHashIndex {
    state: PersistState,
    config: HashConfig,
    num_bits: u32,
    /// Bucket-head block OIDs, `2^num_bits` long; NULL marks an empty
    /// bucket.
    directory: Vec<Oid>,
    /// Values stored under the null key, outside the hashed directory.
    null_values: Vec<Oid>,
    count: u64,
    /// Structural generation, bumped on insert/remove/growth. Iterators
    /// capture it and fail fast on mismatch.
    generation: Arc<AtomicU64>,
}

enum Slot {
    Head,
    Room(ObjRef),
    Tail(ObjRef),
}

impl LinearHashIndex {
    pub const CLASS_ID: ClassId = ClassId::new(4);
    pub const CLASS_NAME: &'static str = "opal.LinearHash";

    pub fn new(mut config: HashConfig) -> Self {
        config.block_capacity = config.block_capacity.max(1);
        let num_bits = config.initial_bits;
        Self {
            state: PersistState::new_object(),
            config,
            num_bits,
            directory: vec![Oid::NULL; 1usize << num_bits],
            null_values: Vec::new(),
            count: 0,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Hollow instance awaiting a load; used by the class registry.
    pub fn hollow(oid: Oid) -> Self {
        Self {
            state: PersistState::hollow(oid),
            config: HashConfig::default(),
            num_bits: 0,
            directory: Vec::new(),
            null_values: Vec::new(),
            count: 0,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn num_bits(&self) -> u32 {
        self.num_bits
    }

    pub fn config(&self) -> &HashConfig {
        &self.config
    }

    fn mask(&self) -> u64 {
        (1u64 << self.num_bits) - 1
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::Relaxed);
    }

    /// Looks up the first value stored under `key`.
    pub fn get(&self, persister: &dyn Persister, key: &Value) -> Result<Option<Oid>> {
        if key.is_null() {
            return Ok(self.null_values.first().copied());
        }
        let bucket = (value_hash(key)? & self.mask()) as usize;
        match find_entry(persister, self.directory[bucket], key)? {
            Some((block, pos)) => Ok(Some(read_block(&block, |b| b.oids[pos])?)),
            None => Ok(None),
        }
    }

    pub fn contains_key(&self, persister: &dyn Persister, key: &Value) -> Result<bool> {
        Ok(self.get(persister, key)?.is_some())
    }

    /// Stores `value` under `key`. Without duplicates the existing entry's
    /// value is replaced and returned; with duplicates a new entry is
    /// always appended.
    pub fn put(&mut self, persister: &dyn Persister, key: Value, value: Oid) -> Result<Option<Oid>> {
        if key.is_null() {
            if !self.config.allow_duplicates {
                if let Some(slot) = self.null_values.first_mut() {
                    let old = std::mem::replace(slot, value);
                    self.state.modified = true;
                    return Ok(Some(old));
                }
            }
            self.null_values.push(value);
            self.count += 1;
            self.state.modified = true;
            self.bump();
            return Ok(None);
        }

        let hash = value_hash(&key)?;
        let bucket = (hash & self.mask()) as usize;
        if !self.config.allow_duplicates {
            if let Some((block, pos)) = find_entry(persister, self.directory[bucket], &key)? {
                let old = write_block(persister, &block, |b| std::mem::replace(&mut b.oids[pos], value))?;
                return Ok(Some(old));
            }
        }
        self.append_to_chain(persister, bucket, key, value)?;
        self.count += 1;
        self.state.modified = true;
        self.bump();
        self.maybe_grow(persister)?;
        Ok(None)
    }

    /// Removes the first entry under `key`, returning its value. The
    /// block's arrays compact by shifting; emptied blocks stay in the
    /// chain for reuse.
    pub fn remove(&mut self, persister: &dyn Persister, key: &Value) -> Result<Option<Oid>> {
        if key.is_null() {
            if self.null_values.is_empty() {
                return Ok(None);
            }
            let old = self.null_values.remove(0);
            self.count -= 1;
            self.state.modified = true;
            self.bump();
            return Ok(Some(old));
        }
        let bucket = (value_hash(key)? & self.mask()) as usize;
        let Some((block, pos)) = find_entry(persister, self.directory[bucket], key)? else {
            return Ok(None);
        };
        let old = write_block(persister, &block, |b| {
            b.keys.remove(pos);
            b.oids.remove(pos)
        })?;
        self.count -= 1;
        self.state.modified = true;
        self.bump();
        Ok(Some(old))
    }

    /// Lazy, forward-only view of every value stored under `key`, walking
    /// the bucket chain in entry order. Fails fast if the map changes
    /// structurally while the view is open.
    pub fn get_values<'p>(&self, persister: &'p dyn Persister, key: &Value) -> Result<ValuesIter<'p>> {
        let (block, null_values) = if key.is_null() {
            (Oid::NULL, self.null_values.clone())
        } else {
            let bucket = (value_hash(key)? & self.mask()) as usize;
            (self.directory[bucket], Vec::new())
        };
        Ok(ValuesIter {
            persister,
            generation: self.generation.clone(),
            expected: self.generation.load(Ordering::Relaxed),
            key: key.clone(),
            null_values,
            null_pos: 0,
            block,
            pos: 0,
            done: false,
        })
    }

    /// Iterates every entry, null-key values first, then bucket order.
    /// Fails fast on structural modification.
    pub fn iter<'p>(&self, persister: &'p dyn Persister) -> EntryIter<'p> {
        EntryIter {
            persister,
            generation: self.generation.clone(),
            expected: self.generation.load(Ordering::Relaxed),
            buckets: self.directory.clone(),
            bucket: 0,
            block: Oid::NULL,
            pos: 0,
            null_values: self.null_values.clone(),
            null_pos: 0,
            done: false,
        }
    }

    fn append_to_chain(
        &mut self,
        persister: &dyn Persister,
        bucket: usize,
        key: Value,
        value: Oid,
    ) -> Result<()> {
        let capacity = self.config.block_capacity;
        let slot = {
            let mut oid = self.directory[bucket];
            if oid.is_null() {
                Slot::Head
            } else {
                loop {
                    let obj = load_block(persister, oid)?;
                    let (len, next) = read_block(&obj, |b| (b.keys.len(), b.next))?;
                    if len < capacity {
                        break Slot::Room(obj);
                    }
                    if next.is_null() {
                        break Slot::Tail(obj);
                    }
                    oid = next;
                }
            }
        };
        match slot {
            Slot::Head => {
                let block = HashBlock::from_entries(vec![(key, value)]);
                self.directory[bucket] = persister.oid_for(&ObjCell::new(Box::new(block)))?;
            }
            Slot::Room(obj) => {
                write_block(persister, &obj, |b| {
                    b.keys.push(key);
                    b.oids.push(value);
                })?;
            }
            Slot::Tail(obj) => {
                let block = HashBlock::from_entries(vec![(key, value)]);
                let new_oid = persister.oid_for(&ObjCell::new(Box::new(block)))?;
                write_block(persister, &obj, |b| b.next = new_oid)?;
            }
        }
        Ok(())
    }

    fn maybe_grow(&mut self, persister: &dyn Persister) -> Result<()> {
        let slots = (self.directory.len() * self.config.block_capacity) as f64;
        if (self.count as f64) / slots <= self.config.max_load_factor {
            return Ok(());
        }
        let old_len = self.directory.len();
        let split_bit = 1u64 << self.num_bits;
        let capacity = self.config.block_capacity;

        // All fallible work runs against staged state first: entries are
        // partitioned, split-off chains built, and every retained block
        // loaded and enrolled. Only then do the chains and the directory
        // change, so a failed growth leaves the map as it was.
        let mut staged = Vec::with_capacity(old_len);
        for bucket in 0..old_len {
            let head = self.directory[bucket];
            if head.is_null() {
                staged.push(None);
                continue;
            }
            let entries = chain_entries(persister, head)?;
            let mut keep = Vec::new();
            let mut moved = Vec::new();
            for (key, value) in entries {
                if value_hash(&key)? & split_bit == 0 {
                    keep.push((key, value));
                } else {
                    moved.push((key, value));
                }
            }
            let split_head = if moved.is_empty() {
                Oid::NULL
            } else {
                build_chain(persister, moved, capacity)?
            };
            let blocks = enroll_chain(persister, head)?;
            staged.push(Some((blocks, keep, split_head)));
        }

        self.num_bits += 1;
        self.directory.resize(old_len * 2, Oid::NULL);
        for (bucket, slot) in staged.into_iter().enumerate() {
            let Some((blocks, keep, split_head)) = slot else {
                continue;
            };
            fill_chain(&blocks, &keep, capacity);
            self.directory[bucket + old_len] = split_head;
        }
        self.bump();
        debug!(
            bits = self.num_bits,
            buckets = self.directory.len(),
            entries = self.count,
            "hash directory doubled"
        );
        Ok(())
    }
}

impl Persistable for LinearHashIndex {
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
            Value::I64(i64::from(self.num_bits)),
            Value::I64Array(self.directory.iter().map(|o| o.raw() as i64).collect()),
            Value::I64(self.count as i64),
            Value::I64Array(self.null_values.iter().map(|o| o.raw() as i64).collect()),
            Value::I64(self.config.block_capacity as i64),
            Value::Bool(self.config.allow_duplicates),
            Value::F64(self.config.max_load_factor),
        ]
    }

    fn set_field_values(&mut self, fields: Vec<Value>) -> Result<()> {
        let mut it = fields.into_iter();
        match (
            it.next(),
            it.next(),
            it.next(),
            it.next(),
            it.next(),
            it.next(),
            it.next(),
        ) {
            (
                Some(Value::I64(num_bits)),
                Some(Value::I64Array(directory)),
                Some(Value::I64(count)),
                Some(Value::I64Array(null_values)),
                Some(Value::I64(block_capacity)),
                Some(Value::Bool(allow_duplicates)),
                Some(Value::F64(max_load_factor)),
            ) => {
                let num_bits = num_bits as u32;
                if directory.len() != 1usize << num_bits {
                    return Err(OpalError::CorruptImage(format!(
                        "hash directory has {} buckets for {} bits",
                        directory.len(),
                        num_bits
                    )));
                }
                self.num_bits = num_bits;
                self.directory = directory.into_iter().map(|o| Oid::new(o as u64)).collect();
                self.count = count as u64;
                self.null_values = null_values.into_iter().map(|o| Oid::new(o as u64)).collect();
                self.config = HashConfig {
                    initial_bits: num_bits,
                    block_capacity: block_capacity as usize,
                    allow_duplicates,
                    max_load_factor,
                };
                self.state.loaded = true;
                Ok(())
            }
            _ => Err(OpalError::CorruptImage(
                "malformed hash header image".to_string(),
            )),
        }
    }

    fn unload(&mut self) {
        self.directory.clear();
        self.null_values.clear();
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

/// Lazy view over the values stored under one key.
pub struct ValuesIter<'p> {
    persister: &'p dyn Persister,
    generation: Arc<AtomicU64>,
    expected: u64,
    key: Value,
    null_values: Vec<Oid>,
    null_pos: usize,
    block: Oid,
    pos: usize,
    done: bool,
}

impl Iterator for ValuesIter<'_> {
    type Item = Result<Oid>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.generation.load(Ordering::Relaxed) != self.expected {
            self.done = true;
            return Some(Err(OpalError::ConcurrentModification));
        }
        if self.key.is_null() {
            if self.null_pos < self.null_values.len() {
                let value = self.null_values[self.null_pos];
                self.null_pos += 1;
                return Some(Ok(value));
            }
            self.done = true;
            return None;
        }
        loop {
            if self.block.is_null() {
                self.done = true;
                return None;
            }
            let obj = match load_block(self.persister, self.block) {
                Ok(obj) => obj,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            let pos = self.pos;
            let key = &self.key;
            let step = match read_block(&obj, |b| {
                if pos < b.keys.len() {
                    Some((b.keys[pos].graph_eq(key), b.oids[pos]))
                } else {
                    None
                }
            }) {
                Ok(step) => step,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            match step {
                None => {
                    self.block = match read_block(&obj, |b| b.next) {
                        Ok(next) => next,
                        Err(e) => {
                            self.done = true;
                            return Some(Err(e));
                        }
                    };
                    self.pos = 0;
                }
                Some((matched, value)) => {
                    self.pos += 1;
                    if matched {
                        return Some(Ok(value));
                    }
                }
            }
        }
    }
}

/// Iterator over every entry in the map.
pub struct EntryIter<'p> {
    persister: &'p dyn Persister,
    generation: Arc<AtomicU64>,
    expected: u64,
    buckets: Vec<Oid>,
    bucket: usize,
    block: Oid,
    pos: usize,
    null_values: Vec<Oid>,
    null_pos: usize,
    done: bool,
}

impl Iterator for EntryIter<'_> {
    type Item = Result<(Value, Oid)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.generation.load(Ordering::Relaxed) != self.expected {
            self.done = true;
            return Some(Err(OpalError::ConcurrentModification));
        }
        if self.null_pos < self.null_values.len() {
            let value = self.null_values[self.null_pos];
            self.null_pos += 1;
            return Some(Ok((Value::Null, value)));
        }
        loop {
            if self.block.is_null() {
                if self.bucket >= self.buckets.len() {
                    self.done = true;
                    return None;
                }
                self.block = self.buckets[self.bucket];
                self.bucket += 1;
                self.pos = 0;
                continue;
            }
            let obj = match load_block(self.persister, self.block) {
                Ok(obj) => obj,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            let pos = self.pos;
            let step = match read_block(&obj, |b| {
                if pos < b.keys.len() {
                    Some((b.keys[pos].clone(), b.oids[pos]))
                } else {
                    None
                }
            }) {
                Ok(step) => step,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            match step {
                None => {
                    self.block = match read_block(&obj, |b| b.next) {
                        Ok(next) => next,
                        Err(e) => {
                            self.done = true;
                            return Some(Err(e));
                        }
                    };
                    self.pos = 0;
                }
                Some(entry) => {
                    self.pos += 1;
                    return Some(Ok(entry));
                }
            }
        }
    }
}

/// Hashes a key over its canonical byte form (type tag plus little-endian
/// payload). Containers and object references are not hashable keys.
pub fn value_hash(key: &Value) -> Result<u64> {
    let mut buf = Vec::with_capacity(24);
    buf.push(key.type_tag() as u8);
    match key {
        Value::Bool(v) => buf.push(u8::from(*v)),
        Value::I8(v) => buf.push(*v as u8),
        Value::I16(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::I32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::I64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::I128(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::F32(v) => buf.extend_from_slice(&v.to_bits().to_le_bytes()),
        Value::F64(v) => buf.extend_from_slice(&v.to_bits().to_le_bytes()),
        Value::Char(v) => buf.extend_from_slice(&(*v as u32).to_le_bytes()),
        Value::String(v) => buf.extend_from_slice(v.as_bytes()),
        Value::Decimal { unscaled, scale } => {
            buf.extend_from_slice(&unscaled.to_le_bytes());
            buf.extend_from_slice(&scale.to_le_bytes());
        }
        Value::Date(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::Time(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::Timestamp(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::Bytes(v) => buf.extend_from_slice(v),
        other => return Err(OpalError::UnsupportedKeyType(other.type_name())),
    }
    Ok(xxh3_64(&buf))
}

fn find_entry(persister: &dyn Persister, head: Oid, key: &Value) -> Result<Option<(ObjRef, usize)>> {
    let mut oid = head;
    while !oid.is_null() {
        let obj = load_block(persister, oid)?;
        let (hit, next) = read_block(&obj, |b| {
            (b.keys.iter().position(|k| k.graph_eq(key)), b.next)
        })?;
        if let Some(pos) = hit {
            return Ok(Some((obj, pos)));
        }
        oid = next;
    }
    Ok(None)
}

fn chain_entries(persister: &dyn Persister, head: Oid) -> Result<Vec<(Value, Oid)>> {
    let mut entries = Vec::new();
    let mut oid = head;
    while !oid.is_null() {
        let obj = load_block(persister, oid)?;
        oid = read_block(&obj, |b| {
            for (k, v) in b.keys.iter().zip(&b.oids) {
                entries.push((k.clone(), *v));
            }
            b.next
        })?;
    }
    Ok(entries)
}

/// Loads every block of a chain and enrolls it for flush.
fn enroll_chain(persister: &dyn Persister, head: Oid) -> Result<Vec<ObjRef>> {
    let mut blocks = Vec::new();
    let mut oid = head;
    while !oid.is_null() {
        let obj = load_block(persister, oid)?;
        oid = read_block(&obj, |b| b.next)?;
        blocks.push(obj);
    }
    for obj in &blocks {
        persister.add_to_modified(obj)?;
    }
    Ok(blocks)
}

/// Refills an enrolled chain with `entries`, clearing any surplus blocks.
/// Emptied blocks remain linked for reuse.
fn fill_chain(blocks: &[ObjRef], entries: &[(Value, Oid)], capacity: usize) {
    for (i, obj) in blocks.iter().enumerate() {
        let start = (i * capacity).min(entries.len());
        let end = ((i + 1) * capacity).min(entries.len());
        let chunk = &entries[start..end];
        let mut guard = obj.write();
        // Verified as a hash block when the chain was enrolled.
        if let Some(block) = guard.as_any_mut().downcast_mut::<HashBlock>() {
            block.state.modified = true;
            block.keys.clear();
            block.oids.clear();
            for (k, v) in chunk {
                block.keys.push(k.clone());
                block.oids.push(*v);
            }
        }
    }
}

fn build_chain(
    persister: &dyn Persister,
    entries: Vec<(Value, Oid)>,
    capacity: usize,
) -> Result<Oid> {
    let mut head = Oid::NULL;
    let mut tail: Option<ObjRef> = None;
    for chunk in entries.chunks(capacity) {
        let block = HashBlock::from_entries(chunk.to_vec());
        let obj = ObjCell::new(Box::new(block));
        let oid = persister.oid_for(&obj)?;
        match &tail {
            None => head = oid,
            Some(prev) => write_block(persister, prev, |b| b.next = oid)?,
        }
        tail = Some(obj);
    }
    Ok(head)
}

fn load_block(persister: &dyn Persister, oid: Oid) -> Result<ObjRef> {
    let obj = persister
        .object_for_oid(oid)?
        .ok_or_else(|| OpalError::IndexCorrupted(format!("dangling block reference {:?}", oid)))?;
    persister.load_object(&obj)?;
    Ok(obj)
}

fn read_block<R>(obj: &ObjRef, f: impl FnOnce(&HashBlock) -> R) -> Result<R> {
    let guard = obj.read();
    let block = guard
        .as_any()
        .downcast_ref::<HashBlock>()
        .ok_or_else(|| OpalError::IndexCorrupted("object is not a hash block".to_string()))?;
    Ok(f(block))
}

/// Mutates a block under its write lock. Enrollment happens first: if it
/// fails, the block has not been touched yet.
fn write_block<R>(
    persister: &dyn Persister,
    obj: &ObjRef,
    f: impl FnOnce(&mut HashBlock) -> R,
) -> Result<R> {
    persister.add_to_modified(obj)?;
    let mut guard = obj.write();
    let block = guard
        .as_any_mut()
        .downcast_mut::<HashBlock>()
        .ok_or_else(|| OpalError::IndexCorrupted("object is not a hash block".to_string()))?;
    block.state.modified = true;
    Ok(f(block))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FlakyStore, MemStore};

    fn map(config: HashConfig) -> LinearHashIndex {
        LinearHashIndex::new(config)
    }

    fn no_growth() -> HashConfig {
        HashConfig {
            initial_bits: 2,
            block_capacity: 2,
            allow_duplicates: false,
            max_load_factor: f64::MAX,
        }
    }

    #[test]
    fn test_put_get_roundtrip() {
        let store = MemStore::new();
        let mut index = map(HashConfig::default());
        for k in 0..32i64 {
            assert!(index.put(&store, Value::I64(k), Oid::new(k as u64 + 1)).unwrap().is_none());
        }
        for k in 0..32i64 {
            assert_eq!(
                index.get(&store, &Value::I64(k)).unwrap(),
                Some(Oid::new(k as u64 + 1))
            );
        }
        assert_eq!(index.len(), 32);
        assert_eq!(index.get(&store, &Value::I64(99)).unwrap(), None);
    }

    #[test]
    fn test_string_keys() {
        let store = MemStore::new();
        let mut index = map(HashConfig::default());
        index.put(&store, Value::String("alpha".into()), Oid::new(1)).unwrap();
        index.put(&store, Value::String("beta".into()), Oid::new(2)).unwrap();
        assert_eq!(
            index.get(&store, &Value::String("beta".into())).unwrap(),
            Some(Oid::new(2))
        );
        assert_eq!(index.get(&store, &Value::String("gamma".into())).unwrap(), None);
    }

    #[test]
    fn test_null_key_sentinel() {
        let store = MemStore::new();
        let mut index = map(HashConfig::default());
        assert_eq!(index.get(&store, &Value::Null).unwrap(), None);
        index.put(&store, Value::Null, Oid::new(7)).unwrap();
        assert_eq!(index.get(&store, &Value::Null).unwrap(), Some(Oid::new(7)));

        // Replacement, not append, without duplicates.
        let old = index.put(&store, Value::Null, Oid::new(8)).unwrap();
        assert_eq!(old, Some(Oid::new(7)));
        assert_eq!(index.len(), 1);

        assert_eq!(index.remove(&store, &Value::Null).unwrap(), Some(Oid::new(8)));
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn test_put_replaces_existing_value() {
        let store = MemStore::new();
        let mut index = map(no_growth());
        index.put(&store, Value::I64(1), Oid::new(10)).unwrap();
        let old = index.put(&store, Value::I64(1), Oid::new(11)).unwrap();
        assert_eq!(old, Some(Oid::new(10)));
        assert_eq!(index.get(&store, &Value::I64(1)).unwrap(), Some(Oid::new(11)));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_duplicates_append_and_enumerate() {
        let store = MemStore::new();
        let mut index = map(HashConfig {
            allow_duplicates: true,
            ..no_growth()
        });
        index.put(&store, Value::I64(5), Oid::new(50)).unwrap();
        index.put(&store, Value::I64(5), Oid::new(51)).unwrap();
        index.put(&store, Value::I64(5), Oid::new(52)).unwrap();
        index.put(&store, Value::I64(6), Oid::new(60)).unwrap();
        assert_eq!(index.len(), 4);

        let values: Vec<Oid> = index
            .get_values(&store, &Value::I64(5))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(values, vec![Oid::new(50), Oid::new(51), Oid::new(52)]);
    }

    #[test]
    fn test_remove_compacts_and_reuses_blocks() {
        let store = MemStore::new();
        // One bucket, one entry per block: every insert chains.
        let mut index = map(HashConfig {
            initial_bits: 0,
            block_capacity: 1,
            allow_duplicates: false,
            max_load_factor: f64::MAX,
        });
        for k in 0..4i64 {
            index.put(&store, Value::I64(k), Oid::new(k as u64 + 1)).unwrap();
        }
        assert_eq!(index.remove(&store, &Value::I64(1)).unwrap(), Some(Oid::new(2)));
        assert_eq!(index.remove(&store, &Value::I64(9)).unwrap(), None);
        assert_eq!(index.len(), 3);
        assert_eq!(index.get(&store, &Value::I64(1)).unwrap(), None);

        // The emptied block stays in the chain and takes the next insert.
        index.put(&store, Value::I64(10), Oid::new(11)).unwrap();
        assert_eq!(index.get(&store, &Value::I64(10)).unwrap(), Some(Oid::new(11)));
        for k in [0i64, 2, 3] {
            assert_eq!(
                index.get(&store, &Value::I64(k)).unwrap(),
                Some(Oid::new(k as u64 + 1))
            );
        }
    }

    #[test]
    fn test_directory_growth_preserves_entries() {
        let store = MemStore::new();
        let mut index = map(HashConfig {
            initial_bits: 2,
            block_capacity: 2,
            allow_duplicates: false,
            max_load_factor: 0.75,
        });
        assert_eq!(index.num_bits(), 2);
        for k in 0..100i64 {
            index.put(&store, Value::I64(k), Oid::new(k as u64 + 1)).unwrap();
        }
        assert!(index.num_bits() > 2);
        for k in 0..100i64 {
            assert_eq!(
                index.get(&store, &Value::I64(k)).unwrap(),
                Some(Oid::new(k as u64 + 1)),
                "key {k} lost across growth"
            );
        }
        let mut seen: Vec<i64> = index
            .iter(&store)
            .map(|r| match r.unwrap().0 {
                Value::I64(k) => k,
                other => panic!("unexpected key {:?}", other),
            })
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_failed_growth_allocation_keeps_entries_reachable() {
        // Exhaust the allocator at each point of a directory split in
        // turn; staged growth must leave every stored entry visible.
        for budget in 0..6u32 {
            let store = FlakyStore::new();
            let mut index = map(HashConfig {
                initial_bits: 2,
                block_capacity: 2,
                allow_duplicates: false,
                max_load_factor: 0.75,
            });
            let mut next = 0i64;
            for _ in 0..6 {
                index.put(&store, Value::I64(next), Oid::new(next as u64 + 1)).unwrap();
                next += 1;
            }
            store.arm(budget);
            loop {
                match index.put(&store, Value::I64(next), Oid::new(next as u64 + 1)) {
                    Ok(_) => next += 1,
                    Err(OpalError::Internal(_)) => break,
                    Err(other) => panic!("unexpected error {:?}", other),
                }
            }
            store.disarm();

            for k in 0..next {
                assert_eq!(
                    index.get(&store, &Value::I64(k)).unwrap(),
                    Some(Oid::new(k as u64 + 1)),
                    "key {k} lost after failed growth"
                );
            }
            // The map keeps absorbing entries once allocation recovers.
            let retry = next + 1;
            index.put(&store, Value::I64(retry), Oid::new(retry as u64 + 1)).unwrap();
            assert_eq!(
                index.get(&store, &Value::I64(retry)).unwrap(),
                Some(Oid::new(retry as u64 + 1))
            );
        }
    }

    #[test]
    fn test_values_iter_fails_fast_on_modification() {
        let store = MemStore::new();
        let mut index = map(HashConfig {
            allow_duplicates: true,
            ..no_growth()
        });
        index.put(&store, Value::I64(1), Oid::new(10)).unwrap();
        index.put(&store, Value::I64(1), Oid::new(11)).unwrap();

        let mut view = index.get_values(&store, &Value::I64(1)).unwrap();
        assert_eq!(view.next().unwrap().unwrap(), Oid::new(10));
        index.put(&store, Value::I64(2), Oid::new(20)).unwrap();
        assert!(matches!(
            view.next(),
            Some(Err(OpalError::ConcurrentModification))
        ));
        assert!(view.next().is_none());
    }

    #[test]
    fn test_entry_iter_fails_fast_on_remove() {
        let store = MemStore::new();
        let mut index = map(no_growth());
        index.put(&store, Value::I64(1), Oid::new(10)).unwrap();
        index.put(&store, Value::I64(2), Oid::new(20)).unwrap();

        let mut it = index.iter(&store);
        assert!(it.next().unwrap().is_ok());
        index.remove(&store, &Value::I64(1)).unwrap();
        assert!(matches!(
            it.next(),
            Some(Err(OpalError::ConcurrentModification))
        ));
    }

    #[test]
    fn test_value_replacement_does_not_invalidate_iterators() {
        let store = MemStore::new();
        let mut index = map(no_growth());
        index.put(&store, Value::I64(1), Oid::new(10)).unwrap();
        index.put(&store, Value::I64(2), Oid::new(20)).unwrap();

        let mut it = index.iter(&store);
        assert!(it.next().unwrap().is_ok());
        // Same key, new value: non-structural.
        index.put(&store, Value::I64(1), Oid::new(11)).unwrap();
        assert!(it.next().unwrap().is_ok());
    }

    #[test]
    fn test_unhashable_key_rejected() {
        let store = MemStore::new();
        let mut index = map(HashConfig::default());
        let err = index
            .put(&store, Value::List(vec![]), Oid::new(1))
            .unwrap_err();
        assert!(matches!(err, OpalError::UnsupportedKeyType(_)));
    }

    #[test]
    fn test_block_image_roundtrip() {
        let block = HashBlock::from_entries(vec![
            (Value::I64(1), Oid::new(10)),
            (Value::String("x".into()), Oid::new(20)),
        ]);
        let fields = block.field_values();
        let mut hollow = HashBlock::hollow(Oid::new(5));
        hollow.set_field_values(fields).unwrap();
        assert_eq!(hollow.oids, vec![Oid::new(10), Oid::new(20)]);
        assert!(hollow.state().loaded);
    }

    #[test]
    fn test_header_image_roundtrip() {
        let store = MemStore::new();
        let mut index = map(HashConfig {
            initial_bits: 3,
            block_capacity: 4,
            allow_duplicates: true,
            max_load_factor: 0.5,
        });
        index.put(&store, Value::I64(1), Oid::new(10)).unwrap();
        index.put(&store, Value::Null, Oid::new(30)).unwrap();

        let fields = index.field_values();
        let mut hollow = LinearHashIndex::hollow(Oid::new(6));
        hollow.set_field_values(fields).unwrap();
        assert_eq!(hollow.num_bits(), 3);
        assert_eq!(hollow.len(), 2);
        assert!(hollow.config().allow_duplicates);
        assert_eq!(
            hollow.get(&store, &Value::Null).unwrap(),
            Some(Oid::new(30))
        );
    }

    #[test]
    fn test_directory_arity_validated() {
        let mut hollow = LinearHashIndex::hollow(Oid::new(6));
        let err = hollow
            .set_field_values(vec![
                Value::I64(3),
                Value::I64Array(vec![0, 0]), // 3 bits needs 8 buckets
                Value::I64(0),
                Value::I64Array(vec![]),
                Value::I64(4),
                Value::Bool(false),
                Value::F64(0.75),
            ])
            .unwrap_err();
        assert!(matches!(err, OpalError::CorruptImage(_)));
    }
}
