//! OpalDB common types, errors, and utilities.
//!
//! This crate provides shared definitions used across all OpalDB components.

pub mod config;
pub mod error;
pub mod oid;
pub mod types;

pub use config::{BTreeConfig, HashConfig, SessionConfig};
pub use error::{OpalError, Result};
pub use oid::{ClassId, Oid, FIRST_USER_CLASS};
pub use types::TypeTag;
