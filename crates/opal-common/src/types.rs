//! Wire type tags for the binary object codec.
//!
//! Every encoded value is prefixed with a one-byte tag identifying its kind.
//! Tag values are persisted in long-lived binary images: once assigned, a
//! value must never be reassigned or reused.

use crate::error::{OpalError, Result};
use serde::{Deserialize, Serialize};

/// One-byte kind tag prefixing every encoded value.
///
/// Tags are grouped by decade: references, scalars, single values with
/// structured payloads, primitive arrays, containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TypeTag {
    // References
    Null = 0,
    /// First-class object reference: payload is an 8-byte OID.
    Fco = 1,
    /// First occurrence of an aliasable shared value: payload is the value.
    SharedNew = 2,
    /// Back-reference to a previously decoded shared value: payload is a
    /// 4-byte decode-order index.
    SharedRef = 3,

    // Scalars
    Bool = 10,
    I8 = 11,
    I16 = 12,
    I32 = 13,
    I64 = 14,
    I128 = 15,
    F32 = 16,
    F64 = 17,
    Char = 18,

    // Structured single values
    String = 30,
    Decimal = 31,
    Date = 32,
    Time = 33,
    Timestamp = 34,

    // Primitive arrays
    Bytes = 50,
    BoolArray = 51,
    I16Array = 52,
    I32Array = 53,
    I64Array = 54,
    F32Array = 55,
    F64Array = 56,
    StringArray = 57,
    /// Object-typed array: payload carries the component class name.
    ObjArray = 58,

    // Containers
    List = 70,
    Set = 71,
    Map = 72,
}

impl TypeTag {
    /// Decodes a tag byte read from an object image.
    ///
    /// An unrecognized byte indicates stream corruption or a codec version
    /// mismatch and is not recoverable.
    pub fn from_u8(byte: u8) -> Result<Self> {
        Ok(match byte {
            0 => TypeTag::Null,
            1 => TypeTag::Fco,
            2 => TypeTag::SharedNew,
            3 => TypeTag::SharedRef,
            10 => TypeTag::Bool,
            11 => TypeTag::I8,
            12 => TypeTag::I16,
            13 => TypeTag::I32,
            14 => TypeTag::I64,
            15 => TypeTag::I128,
            16 => TypeTag::F32,
            17 => TypeTag::F64,
            18 => TypeTag::Char,
            30 => TypeTag::String,
            31 => TypeTag::Decimal,
            32 => TypeTag::Date,
            33 => TypeTag::Time,
            34 => TypeTag::Timestamp,
            50 => TypeTag::Bytes,
            51 => TypeTag::BoolArray,
            52 => TypeTag::I16Array,
            53 => TypeTag::I32Array,
            54 => TypeTag::I64Array,
            55 => TypeTag::F32Array,
            56 => TypeTag::F64Array,
            57 => TypeTag::StringArray,
            58 => TypeTag::ObjArray,
            70 => TypeTag::List,
            71 => TypeTag::Set,
            72 => TypeTag::Map,
            other => return Err(OpalError::UnknownTypeTag(other)),
        })
    }

    /// Returns true if this tag denotes a reference rather than an inline
    /// second-class value.
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            TypeTag::Null | TypeTag::Fco | TypeTag::SharedNew | TypeTag::SharedRef
        )
    }

    /// Returns true if this tag denotes a container with a 4-byte count
    /// prefix.
    pub fn is_container(&self) -> bool {
        matches!(self, TypeTag::List | TypeTag::Set | TypeTag::Map)
    }
}

impl std::fmt::Display for TypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TypeTag::Null => "NULL",
            TypeTag::Fco => "FCO",
            TypeTag::SharedNew => "SHARED_NEW",
            TypeTag::SharedRef => "SHARED_REF",
            TypeTag::Bool => "BOOL",
            TypeTag::I8 => "I8",
            TypeTag::I16 => "I16",
            TypeTag::I32 => "I32",
            TypeTag::I64 => "I64",
            TypeTag::I128 => "I128",
            TypeTag::F32 => "F32",
            TypeTag::F64 => "F64",
            TypeTag::Char => "CHAR",
            TypeTag::String => "STRING",
            TypeTag::Decimal => "DECIMAL",
            TypeTag::Date => "DATE",
            TypeTag::Time => "TIME",
            TypeTag::Timestamp => "TIMESTAMP",
            TypeTag::Bytes => "BYTES",
            TypeTag::BoolArray => "BOOL_ARRAY",
            TypeTag::I16Array => "I16_ARRAY",
            TypeTag::I32Array => "I32_ARRAY",
            TypeTag::I64Array => "I64_ARRAY",
            TypeTag::F32Array => "F32_ARRAY",
            TypeTag::F64Array => "F64_ARRAY",
            TypeTag::StringArray => "STRING_ARRAY",
            TypeTag::ObjArray => "OBJ_ARRAY",
            TypeTag::List => "LIST",
            TypeTag::Set => "SET",
            TypeTag::Map => "MAP",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_TAGS: [TypeTag; 30] = [
        TypeTag::Null,
        TypeTag::Fco,
        TypeTag::SharedNew,
        TypeTag::SharedRef,
        TypeTag::Bool,
        TypeTag::I8,
        TypeTag::I16,
        TypeTag::I32,
        TypeTag::I64,
        TypeTag::I128,
        TypeTag::F32,
        TypeTag::F64,
        TypeTag::Char,
        TypeTag::String,
        TypeTag::Decimal,
        TypeTag::Date,
        TypeTag::Time,
        TypeTag::Timestamp,
        TypeTag::Bytes,
        TypeTag::BoolArray,
        TypeTag::I16Array,
        TypeTag::I32Array,
        TypeTag::I64Array,
        TypeTag::F32Array,
        TypeTag::F64Array,
        TypeTag::StringArray,
        TypeTag::ObjArray,
        TypeTag::List,
        TypeTag::Set,
        TypeTag::Map,
    ];

    #[test]
    fn test_from_u8_roundtrip() {
        for tag in ALL_TAGS {
            assert_eq!(TypeTag::from_u8(tag as u8).unwrap(), tag);
        }
    }

    #[test]
    fn test_from_u8_unknown() {
        for byte in [4u8, 9, 42, 99, 255] {
            assert!(matches!(
                TypeTag::from_u8(byte),
                Err(OpalError::UnknownTypeTag(b)) if b == byte
            ));
        }
    }

    #[test]
    fn test_stable_tag_values() {
        // Persisted contract: these values must never change.
        assert_eq!(TypeTag::Null as u8, 0);
        assert_eq!(TypeTag::Fco as u8, 1);
        assert_eq!(TypeTag::SharedNew as u8, 2);
        assert_eq!(TypeTag::SharedRef as u8, 3);
        assert_eq!(TypeTag::Bool as u8, 10);
        assert_eq!(TypeTag::Char as u8, 18);
        assert_eq!(TypeTag::String as u8, 30);
        assert_eq!(TypeTag::Timestamp as u8, 34);
        assert_eq!(TypeTag::Bytes as u8, 50);
        assert_eq!(TypeTag::ObjArray as u8, 58);
        assert_eq!(TypeTag::List as u8, 70);
        assert_eq!(TypeTag::Map as u8, 72);
    }

    #[test]
    fn test_is_reference() {
        assert!(TypeTag::Null.is_reference());
        assert!(TypeTag::Fco.is_reference());
        assert!(TypeTag::SharedRef.is_reference());
        assert!(!TypeTag::I64.is_reference());
        assert!(!TypeTag::List.is_reference());
    }

    #[test]
    fn test_is_container() {
        assert!(TypeTag::List.is_container());
        assert!(TypeTag::Set.is_container());
        assert!(TypeTag::Map.is_container());
        assert!(!TypeTag::Bytes.is_container());
        assert!(!TypeTag::Fco.is_container());
    }

    #[test]
    fn test_display_nonempty() {
        for tag in ALL_TAGS {
            assert!(!tag.to_string().is_empty());
        }
    }
}
