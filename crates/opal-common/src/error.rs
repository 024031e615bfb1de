//! Error types for OpalDB.

use crate::oid::Oid;
use thiserror::Error;

/// Result type alias using OpalError.
pub type Result<T> = std::result::Result<T, OpalError>;

/// Errors that can occur in OpalDB operations.
#[derive(Debug, Error)]
pub enum OpalError {
    // Codec errors
    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    #[error("Unknown type tag: {0}")]
    UnknownTypeTag(u8),

    #[error("Shared back-reference {index} out of range (only {registered} decoded)")]
    InvalidSharedRef { index: u32, registered: u32 },

    #[error("Corrupt object image: {0}")]
    CorruptImage(String),

    // Object model errors
    #[error("Object not found: {0}")]
    ObjectNotFound(Oid),

    #[error("Class not registered: {0}")]
    ClassNotRegistered(String),

    #[error("Object has no persistent identity")]
    NoIdentity,

    #[error("Nontransactional read of {0} not allowed")]
    NontransactionalRead(Oid),

    // Index errors
    #[error("Duplicate key")]
    DuplicateKey,

    #[error("Key not found")]
    KeyNotFound,

    #[error("Unsupported key type: {0}")]
    UnsupportedKeyType(String),

    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("Index corrupted: {0}")]
    IndexCorrupted(String),

    // Iteration / mutation errors
    #[error("Concurrent modification detected")]
    ConcurrentModification,

    #[error("Collection is read-only")]
    ReadOnly,

    #[error("Modified ledger mutated during iteration")]
    LedgerIterationActive,

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}
