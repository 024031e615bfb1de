//! OpalDB binary object codec.
//!
//! Bidirectional mapping between in-memory values and a byte stream, used
//! both for full-object persistence and for inter-process transfer.
//!
//! Wire format, per value: `[type-tag: 1 byte][payload]`. Container
//! payloads begin with a 4-byte element count; FCO payloads are an 8-byte
//! OID; strings and class names are 4-byte-length-prefixed UTF-8. All
//! integers are little-endian. One object image is one depth-first
//! encoding of the object's field vector, prefixed with a 4-byte field
//! count. Tag values are a stable persisted contract (see
//! `opal_common::TypeTag`).

pub mod pool;
pub mod reader;
pub mod resolve;
pub mod writer;

#[cfg(test)]
mod testutil;

pub use pool::{ScratchGuard, ScratchPool};
pub use reader::ObjectReader;
pub use resolve::resolve;
pub use writer::{encode_object, ObjectWriter};
