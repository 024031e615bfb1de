//! Class registry.
//!
//! Maps class identifiers and names to factory functions producing hollow
//! instances. Explicit registration at startup replaces runtime reflection:
//! the session consults the registry when it must materialize an object for
//! an OID whose image has not been read yet.

use crate::persist::Persistable;
use opal_common::{ClassId, OpalError, Oid, Result};
use std::collections::HashMap;

/// Factory producing a hollow instance for a known OID.
pub type Factory = fn(Oid) -> Box<dyn Persistable>;

/// A registered persistent class.
#[derive(Clone)]
pub struct RegisteredClass {
    pub id: ClassId,
    pub name: String,
    factory: Factory,
}

impl RegisteredClass {
    /// Creates a hollow instance of this class for the given OID.
    pub fn create_hollow(&self, oid: Oid) -> Box<dyn Persistable> {
        (self.factory)(oid)
    }
}

impl std::fmt::Debug for RegisteredClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredClass")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Class ID / name → factory map.
#[derive(Debug, Default)]
pub struct ClassRegistry {
    by_id: HashMap<ClassId, RegisteredClass>,
    by_name: HashMap<String, ClassId>,
}

impl ClassRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a class. Re-registering an existing ID or name is a
    /// startup bug and fails.
    pub fn register(&mut self, id: ClassId, name: &str, factory: Factory) -> Result<()> {
        if self.by_id.contains_key(&id) || self.by_name.contains_key(name) {
            return Err(OpalError::Internal(format!(
                "class {} ({}) already registered",
                name, id
            )));
        }
        self.by_id.insert(
            id,
            RegisteredClass {
                id,
                name: name.to_string(),
                factory,
            },
        );
        self.by_name.insert(name.to_string(), id);
        Ok(())
    }

    /// Looks up a class by identifier.
    pub fn class_for_id(&self, id: ClassId) -> Result<&RegisteredClass> {
        self.by_id
            .get(&id)
            .ok_or_else(|| OpalError::ClassNotRegistered(id.to_string()))
    }

    /// Looks up a class by name.
    pub fn class_for_name(&self, name: &str) -> Result<&RegisteredClass> {
        let id = self
            .by_name
            .get(name)
            .ok_or_else(|| OpalError::ClassNotRegistered(name.to_string()))?;
        self.class_for_id(*id)
    }

    /// Creates a hollow instance for an OID, dispatching on the class index
    /// packed into its high bits.
    pub fn create_hollow(&self, oid: Oid) -> Result<Box<dyn Persistable>> {
        let class = self.class_for_id(oid.class_id())?;
        Ok(class.create_hollow(oid))
    }

    /// Number of registered classes.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
