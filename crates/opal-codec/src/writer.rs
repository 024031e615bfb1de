//! Binary object writer.

use bytes::{BufMut, Bytes, BytesMut};
use opal_common::{OpalError, Result, TypeTag};
use opal_core::{Persistable, Persister, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Encodes values and object images into the tagged wire format.
///
/// One writer encodes one object image: the shared-value identity table is
/// scoped to a single serialization pass, so aliased cells are written once
/// per image and back-referenced on repeats.
pub struct ObjectWriter<'a> {
    buf: BytesMut,
    persister: &'a dyn Persister,
    /// Cell pointer → assigned back-reference id.
    shared: HashMap<usize, u32>,
    /// Cells currently being encoded; a repeat here is a cycle through
    /// shared values, which the format cannot express.
    in_progress: Vec<usize>,
    next_shared_id: u32,
}

impl<'a> ObjectWriter<'a> {
    /// Creates a writer bound to the persister that resolves identities.
    pub fn new(persister: &'a dyn Persister) -> Self {
        Self {
            buf: BytesMut::new(),
            persister,
            shared: HashMap::new(),
            in_progress: Vec::new(),
            next_shared_id: 0,
        }
    }

    /// Encodes one object image: 4-byte field count, then each field value
    /// depth-first.
    pub fn write_object(&mut self, obj: &dyn Persistable) -> Result<()> {
        let fields = obj.field_values();
        self.buf.put_u32_le(fields.len() as u32);
        for value in &fields {
            self.write_value(value)?;
        }
        Ok(())
    }

    /// Encodes a single tagged value.
    pub fn write_value(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Null => self.buf.put_u8(TypeTag::Null as u8),
            Value::Object(obj) => {
                // Lazily assigns an OID the first time a new object becomes
                // reachable from a persistent root.
                let oid = self.persister.oid_for(obj)?;
                self.buf.put_u8(TypeTag::Fco as u8);
                self.buf.put_u64_le(oid.raw());
            }
            Value::Shared(cell) => {
                let ptr = Arc::as_ptr(cell) as usize;
                if let Some(&id) = self.shared.get(&ptr) {
                    self.buf.put_u8(TypeTag::SharedRef as u8);
                    self.buf.put_u32_le(id);
                    return Ok(());
                }
                if self.in_progress.contains(&ptr) {
                    return Err(OpalError::SchemaViolation(
                        "cycle through shared values; route the cycle through a first-class \
                         object instead"
                            .to_string(),
                    ));
                }
                self.in_progress.push(ptr);
                self.buf.put_u8(TypeTag::SharedNew as u8);
                let inner = cell.read().clone();
                let result = self.write_value(&inner);
                self.in_progress.pop();
                result?;
                // Registered after the payload completes; nested cells get
                // lower ids, matching decode order on the read side.
                self.shared.insert(ptr, self.next_shared_id);
                self.next_shared_id += 1;
            }
            Value::Bool(v) => {
                self.buf.put_u8(TypeTag::Bool as u8);
                self.buf.put_u8(u8::from(*v));
            }
            Value::I8(v) => {
                self.buf.put_u8(TypeTag::I8 as u8);
                self.buf.put_i8(*v);
            }
            Value::I16(v) => {
                self.buf.put_u8(TypeTag::I16 as u8);
                self.buf.put_i16_le(*v);
            }
            Value::I32(v) => {
                self.buf.put_u8(TypeTag::I32 as u8);
                self.buf.put_i32_le(*v);
            }
            Value::I64(v) => {
                self.buf.put_u8(TypeTag::I64 as u8);
                self.buf.put_i64_le(*v);
            }
            Value::I128(v) => {
                self.buf.put_u8(TypeTag::I128 as u8);
                self.buf.put_i128_le(*v);
            }
            Value::F32(v) => {
                self.buf.put_u8(TypeTag::F32 as u8);
                self.buf.put_f32_le(*v);
            }
            Value::F64(v) => {
                self.buf.put_u8(TypeTag::F64 as u8);
                self.buf.put_f64_le(*v);
            }
            Value::Char(v) => {
                self.buf.put_u8(TypeTag::Char as u8);
                self.buf.put_u32_le(*v as u32);
            }
            Value::String(v) => {
                self.buf.put_u8(TypeTag::String as u8);
                self.put_str(v);
            }
            Value::Decimal { unscaled, scale } => {
                self.buf.put_u8(TypeTag::Decimal as u8);
                self.buf.put_i128_le(*unscaled);
                self.buf.put_u32_le(*scale);
            }
            Value::Date(v) => {
                self.buf.put_u8(TypeTag::Date as u8);
                self.buf.put_i32_le(*v);
            }
            Value::Time(v) => {
                self.buf.put_u8(TypeTag::Time as u8);
                self.buf.put_i64_le(*v);
            }
            Value::Timestamp(v) => {
                self.buf.put_u8(TypeTag::Timestamp as u8);
                self.buf.put_i64_le(*v);
            }
            Value::Bytes(v) => {
                self.buf.put_u8(TypeTag::Bytes as u8);
                self.buf.put_u32_le(v.len() as u32);
                self.buf.put_slice(v);
            }
            Value::BoolArray(v) => {
                self.buf.put_u8(TypeTag::BoolArray as u8);
                self.buf.put_u32_le(v.len() as u32);
                for b in v {
                    self.buf.put_u8(u8::from(*b));
                }
            }
            Value::I16Array(v) => {
                self.buf.put_u8(TypeTag::I16Array as u8);
                self.buf.put_u32_le(v.len() as u32);
                for x in v {
                    self.buf.put_i16_le(*x);
                }
            }
            Value::I32Array(v) => {
                self.buf.put_u8(TypeTag::I32Array as u8);
                self.buf.put_u32_le(v.len() as u32);
                for x in v {
                    self.buf.put_i32_le(*x);
                }
            }
            Value::I64Array(v) => {
                self.buf.put_u8(TypeTag::I64Array as u8);
                self.buf.put_u32_le(v.len() as u32);
                for x in v {
                    self.buf.put_i64_le(*x);
                }
            }
            Value::F32Array(v) => {
                self.buf.put_u8(TypeTag::F32Array as u8);
                self.buf.put_u32_le(v.len() as u32);
                for x in v {
                    self.buf.put_f32_le(*x);
                }
            }
            Value::F64Array(v) => {
                self.buf.put_u8(TypeTag::F64Array as u8);
                self.buf.put_u32_le(v.len() as u32);
                for x in v {
                    self.buf.put_f64_le(*x);
                }
            }
            Value::StringArray(v) => {
                self.buf.put_u8(TypeTag::StringArray as u8);
                self.buf.put_u32_le(v.len() as u32);
                for s in v {
                    self.put_str(s);
                }
            }
            Value::ObjArray { class_name, elems } => {
                self.buf.put_u8(TypeTag::ObjArray as u8);
                self.put_str(class_name);
                self.buf.put_u32_le(elems.len() as u32);
                for e in elems {
                    self.write_value(e)?;
                }
            }
            Value::List(items) => {
                self.buf.put_u8(TypeTag::List as u8);
                self.buf.put_u32_le(items.len() as u32);
                for item in items {
                    self.write_value(item)?;
                }
            }
            Value::Set(items) => {
                self.buf.put_u8(TypeTag::Set as u8);
                self.buf.put_u32_le(items.len() as u32);
                for item in items {
                    self.write_value(item)?;
                }
            }
            Value::Map(entries) => {
                self.buf.put_u8(TypeTag::Map as u8);
                self.buf.put_u32_le(entries.len() as u32);
                for (key, val) in entries {
                    self.write_value(key)?;
                    self.write_value(val)?;
                }
            }
        }
        Ok(())
    }

    fn put_str(&mut self, s: &str) {
        self.buf.put_u32_le(s.len() as u32);
        self.buf.put_slice(s.as_bytes());
    }

    /// Number of bytes encoded so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if nothing has been encoded.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finishes the image and returns the encoded bytes.
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Encodes one object image with a fresh writer.
pub fn encode_object(obj: &dyn Persistable, persister: &dyn Persister) -> Result<Bytes> {
    let mut writer = ObjectWriter::new(persister);
    writer.write_object(obj)?;
    Ok(writer.finish())
}
