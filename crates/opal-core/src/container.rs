//! Generic persistent container.
//!
//! One container abstraction parameterized over a backing strategy
//! (sequence, set, map) replaces a class hierarchy of collection wrappers.
//! Capability traits expose the operations each backing supports; a
//! read-only view rejects every mutation.

use crate::persist::{Persistable, PersistState};
use crate::value::Value;
use opal_common::{ClassId, OpalError, Result};
use std::any::Any;

/// Backing strategy for a [`PersistentContainer`].
#[derive(Debug, Clone)]
pub enum Backing {
    /// Ordered, duplicate-tolerant sequence.
    Seq(Vec<Value>),
    /// Unordered collection of distinct values.
    Set(Vec<Value>),
    /// Key → value association with distinct keys.
    Map(Vec<(Value, Value)>),
}

impl Backing {
    fn kind(&self) -> i8 {
        match self {
            Backing::Seq(_) => 0,
            Backing::Set(_) => 1,
            Backing::Map(_) => 2,
        }
    }
}

/// Ordered-sequence capability.
pub trait Sequence {
    fn push(&mut self, value: Value) -> Result<()>;
    fn get(&self, index: usize) -> Option<Value>;
    fn remove_at(&mut self, index: usize) -> Result<Value>;
}

/// Distinct-membership capability.
pub trait SetOps {
    /// Inserts the value; returns false if an equal value was present.
    fn insert(&mut self, value: Value) -> Result<bool>;
    fn contains(&self, value: &Value) -> bool;
    /// Removes one equal value; returns false if none matched.
    fn remove(&mut self, value: &Value) -> Result<bool>;
}

/// Key-to-value association capability.
pub trait AssociativeOps {
    /// Associates `key` with `value`, returning any displaced value.
    fn put(&mut self, key: Value, value: Value) -> Result<Option<Value>>;
    fn get_value(&self, key: &Value) -> Option<Value>;
    fn remove_key(&mut self, key: &Value) -> Result<Option<Value>>;
}

/// A persistent collection with a pluggable backing strategy.
#[derive(Debug)]
pub struct PersistentContainer {
    state: PersistState,
    backing: Backing,
    read_only: bool,
}

impl PersistentContainer {
    /// Bootstrap class identifier for containers.
    pub const CLASS_ID: ClassId = ClassId::new(5);

    /// Persistent class name.
    pub const CLASS_NAME: &'static str = "opal.Container";

    /// Creates a new, empty transient container.
    pub fn new(backing: Backing) -> Self {
        Self {
            state: PersistState::new_object(),
            backing,
            read_only: false,
        }
    }

    /// Creates a hollow container awaiting a load.
    pub fn hollow(oid: opal_common::Oid) -> Self {
        Self {
            state: PersistState::hollow(oid),
            backing: Backing::Seq(Vec::new()),
            read_only: false,
        }
    }

    /// Marks this container read-only; all further mutations fail.
    pub fn freeze(&mut self) {
        self.read_only = true;
    }

    /// Returns true if mutations are rejected.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Number of elements (or entries).
    pub fn len(&self) -> usize {
        match &self.backing {
            Backing::Seq(items) | Backing::Set(items) => items.len(),
            Backing::Map(entries) => entries.len(),
        }
    }

    /// Returns true if the container is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The backing strategy.
    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(OpalError::ReadOnly);
        }
        Ok(())
    }

    fn mark_modified(&mut self) {
        self.state.modified = true;
    }
}

impl Sequence for PersistentContainer {
    fn push(&mut self, value: Value) -> Result<()> {
        self.check_writable()?;
        match &mut self.backing {
            Backing::Seq(items) => {
                items.push(value);
                self.mark_modified();
                Ok(())
            }
            other => Err(OpalError::TypeMismatch {
                expected: "SEQ".to_string(),
                actual: format!("backing kind {}", other.kind()),
            }),
        }
    }

    fn get(&self, index: usize) -> Option<Value> {
        match &self.backing {
            Backing::Seq(items) => items.get(index).cloned(),
            _ => None,
        }
    }

    fn remove_at(&mut self, index: usize) -> Result<Value> {
        self.check_writable()?;
        match &mut self.backing {
            Backing::Seq(items) => {
                if index >= items.len() {
                    return Err(OpalError::KeyNotFound);
                }
                self.state.modified = true;
                Ok(items.remove(index))
            }
            other => Err(OpalError::TypeMismatch {
                expected: "SEQ".to_string(),
                actual: format!("backing kind {}", other.kind()),
            }),
        }
    }
}

impl SetOps for PersistentContainer {
    fn insert(&mut self, value: Value) -> Result<bool> {
        self.check_writable()?;
        match &mut self.backing {
            Backing::Set(items) => {
                if items.iter().any(|v| v.graph_eq(&value)) {
                    return Ok(false);
                }
                items.push(value);
                self.mark_modified();
                Ok(true)
            }
            other => Err(OpalError::TypeMismatch {
                expected: "SET".to_string(),
                actual: format!("backing kind {}", other.kind()),
            }),
        }
    }

    fn contains(&self, value: &Value) -> bool {
        match &self.backing {
            Backing::Set(items) => items.iter().any(|v| v.graph_eq(value)),
            _ => false,
        }
    }

    fn remove(&mut self, value: &Value) -> Result<bool> {
        self.check_writable()?;
        match &mut self.backing {
            Backing::Set(items) => {
                if let Some(pos) = items.iter().position(|v| v.graph_eq(value)) {
                    items.remove(pos);
                    self.state.modified = true;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            other => Err(OpalError::TypeMismatch {
                expected: "SET".to_string(),
                actual: format!("backing kind {}", other.kind()),
            }),
        }
    }
}

impl AssociativeOps for PersistentContainer {
    fn put(&mut self, key: Value, value: Value) -> Result<Option<Value>> {
        self.check_writable()?;
        match &mut self.backing {
            Backing::Map(entries) => {
                self.state.modified = true;
                if let Some(entry) = entries.iter_mut().find(|(k, _)| k.graph_eq(&key)) {
                    let old = std::mem::replace(&mut entry.1, value);
                    Ok(Some(old))
                } else {
                    entries.push((key, value));
                    Ok(None)
                }
            }
            other => Err(OpalError::TypeMismatch {
                expected: "MAP".to_string(),
                actual: format!("backing kind {}", other.kind()),
            }),
        }
    }

    fn get_value(&self, key: &Value) -> Option<Value> {
        match &self.backing {
            Backing::Map(entries) => entries
                .iter()
                .find(|(k, _)| k.graph_eq(key))
                .map(|(_, v)| v.clone()),
            _ => None,
        }
    }

    fn remove_key(&mut self, key: &Value) -> Result<Option<Value>> {
        self.check_writable()?;
        match &mut self.backing {
            Backing::Map(entries) => {
                if let Some(pos) = entries.iter().position(|(k, _)| k.graph_eq(key)) {
                    self.state.modified = true;
                    Ok(Some(entries.remove(pos).1))
                } else {
                    Ok(None)
                }
            }
            other => Err(OpalError::TypeMismatch {
                expected: "MAP".to_string(),
                actual: format!("backing kind {}", other.kind()),
            }),
        }
    }
}

impl Persistable for PersistentContainer {
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
        let payload = match &self.backing {
            Backing::Seq(items) => Value::List(items.clone()),
            Backing::Set(items) => Value::Set(items.clone()),
            Backing::Map(entries) => Value::Map(entries.clone()),
        };
        vec![
            Value::I8(self.backing.kind()),
            Value::Bool(self.read_only),
            payload,
        ]
    }

    fn set_field_values(&mut self, fields: Vec<Value>) -> Result<()> {
        let mut fields = fields.into_iter();
        let kind = match fields.next() {
            Some(Value::I8(k)) => k,
            other => {
                return Err(OpalError::CorruptImage(format!(
                    "container kind field: {:?}",
                    other.map(|v| v.type_name())
                )))
            }
        };
        let read_only = match fields.next() {
            Some(Value::Bool(b)) => b,
            other => {
                return Err(OpalError::CorruptImage(format!(
                    "container read-only field: {:?}",
                    other.map(|v| v.type_name())
                )))
            }
        };
        let backing = match (kind, fields.next()) {
            (0, Some(Value::List(items))) => Backing::Seq(items),
            (1, Some(Value::Set(items))) => Backing::Set(items),
            (2, Some(Value::Map(entries))) => Backing::Map(entries),
            (k, other) => {
                return Err(OpalError::CorruptImage(format!(
                    "container payload kind {} with {:?}",
                    k,
                    other.map(|v| v.type_name())
                )))
            }
        };
        self.backing = backing;
        self.read_only = read_only;
        self.state.loaded = true;
        Ok(())
    }

    fn unload(&mut self) {
        self.backing = match self.backing {
            Backing::Seq(_) => Backing::Seq(Vec::new()),
            Backing::Set(_) => Backing::Set(Vec::new()),
            Backing::Map(_) => Backing::Map(Vec::new()),
        };
        self.state.loaded = false;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
