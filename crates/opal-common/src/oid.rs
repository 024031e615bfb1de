//! Object identifiers.
//!
//! Every persistent object is addressed by a 64-bit surrogate key. OID zero
//! is reserved as NULL. The key optionally packs a class index into the high
//! 20 bits and an object index into the low 44 bits so the owning class can
//! be recovered without a catalog lookup.

use serde::{Deserialize, Serialize};

/// Number of low bits holding the object index.
pub const OBJECT_INDEX_BITS: u32 = 44;

/// Mask selecting the object-index bits of an OID.
pub const OBJECT_INDEX_MASK: u64 = (1u64 << OBJECT_INDEX_BITS) - 1;

/// Class identifiers below this value are reserved for bootstrap system
/// classes (index nodes, hash blocks) that must be materializable before
/// any schema is loaded.
pub const FIRST_USER_CLASS: u32 = 16;

/// 64-bit surrogate identifier for a persistent object.
///
/// Zero is the reserved NULL identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Oid(pub u64);

impl Oid {
    /// The reserved NULL identifier.
    pub const NULL: Oid = Oid(0);

    /// Creates an OID from a raw 64-bit value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Composes an OID from a class index and an object index.
    pub const fn compose(class: ClassId, index: u64) -> Self {
        Self(((class.0 as u64) << OBJECT_INDEX_BITS) | (index & OBJECT_INDEX_MASK))
    }

    /// Returns the raw 64-bit value.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Returns true if this is the NULL identifier.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns the class index packed into the high bits.
    pub const fn class_id(self) -> ClassId {
        ClassId((self.0 >> OBJECT_INDEX_BITS) as u32)
    }

    /// Returns the object index packed into the low bits.
    pub const fn object_index(self) -> u64 {
        self.0 & OBJECT_INDEX_MASK
    }
}

impl std::fmt::Display for Oid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Numeric identifier for a persistent class.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ClassId(pub u32);

impl ClassId {
    /// Creates a class identifier.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns true if this class belongs to the reserved bootstrap range.
    pub const fn is_bootstrap(self) -> bool {
        self.0 < FIRST_USER_CLASS
    }
}

impl std::fmt::Display for ClassId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
