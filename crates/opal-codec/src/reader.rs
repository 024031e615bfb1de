//! Binary object reader.

use bytes::{Buf, Bytes};
use opal_common::{OpalError, Oid, Result, TypeTag};
use opal_core::value::{shared, SharedValue};
use opal_core::{Persistable, Persister, Value};

/// Decodes one object image or value stream.
///
/// Shared values decode in the order their payloads complete; the
/// decode-order list backs shared back-references. The list is borrowed
/// from the caller so a pooled scratch buffer can be reused across loads
/// (decoding one object's fields can recursively trigger decoding of a
/// referenced object's fields).
pub struct ObjectReader<'a> {
    buf: Bytes,
    persister: &'a dyn Persister,
    shared: &'a mut Vec<SharedValue>,
}

impl<'a> ObjectReader<'a> {
    /// Creates a reader over an encoded image.
    pub fn new(buf: Bytes, persister: &'a dyn Persister, scratch: &'a mut Vec<SharedValue>) -> Self {
        scratch.clear();
        Self {
            buf,
            persister,
            shared: scratch,
        }
    }

    /// Decodes an object image into `target`, installing the field vector
    /// and marking it loaded.
    pub fn read_object_into(&mut self, target: &mut dyn Persistable) -> Result<()> {
        let count = self.read_u32()? as usize;
        let mut fields = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            fields.push(self.read_value()?);
        }
        target.set_field_values(fields)
    }

    /// Decodes a single tagged value.
    pub fn read_value(&mut self) -> Result<Value> {
        let tag = TypeTag::from_u8(self.read_u8()?)?;
        Ok(match tag {
            TypeTag::Null => Value::Null,
            TypeTag::Fco => {
                let oid = Oid::new(self.read_u64()?);
                if oid.is_null() {
                    // A transient graph was referenced before its first
                    // save; nothing to resolve.
                    Value::Null
                } else {
                    match self.persister.object_for_oid(oid)? {
                        Some(obj) => Value::Object(obj),
                        None => return Err(OpalError::ObjectNotFound(oid)),
                    }
                }
            }
            TypeTag::SharedNew => {
                let inner = self.read_value()?;
                let cell = shared(inner);
                self.shared.push(cell.clone());
                Value::Shared(cell)
            }
            TypeTag::SharedRef => {
                let index = self.read_u32()?;
                match self.shared.get(index as usize) {
                    Some(cell) => Value::Shared(cell.clone()),
                    None => {
                        return Err(OpalError::InvalidSharedRef {
                            index,
                            registered: self.shared.len() as u32,
                        })
                    }
                }
            }
            TypeTag::Bool => Value::Bool(self.read_u8()? != 0),
            TypeTag::I8 => Value::I8(self.read_u8()? as i8),
            TypeTag::I16 => {
                self.need(2)?;
                Value::I16(self.buf.get_i16_le())
            }
            TypeTag::I32 => {
                self.need(4)?;
                Value::I32(self.buf.get_i32_le())
            }
            TypeTag::I64 => {
                self.need(8)?;
                Value::I64(self.buf.get_i64_le())
            }
            TypeTag::I128 => {
                self.need(16)?;
                Value::I128(self.buf.get_i128_le())
            }
            TypeTag::F32 => {
                self.need(4)?;
                Value::F32(self.buf.get_f32_le())
            }
            TypeTag::F64 => {
                self.need(8)?;
                Value::F64(self.buf.get_f64_le())
            }
            TypeTag::Char => {
                let code = self.read_u32()?;
                let ch = char::from_u32(code).ok_or_else(|| {
                    OpalError::CorruptImage(format!("invalid char code point {code:#x}"))
                })?;
                Value::Char(ch)
            }
            TypeTag::String => Value::String(self.read_str()?),
            TypeTag::Decimal => {
                self.need(16)?;
                let unscaled = self.buf.get_i128_le();
                let scale = self.read_u32()?;
                Value::Decimal { unscaled, scale }
            }
            TypeTag::Date => {
                self.need(4)?;
                Value::Date(self.buf.get_i32_le())
            }
            TypeTag::Time => {
                self.need(8)?;
                Value::Time(self.buf.get_i64_le())
            }
            TypeTag::Timestamp => {
                self.need(8)?;
                Value::Timestamp(self.buf.get_i64_le())
            }
            TypeTag::Bytes => {
                let len = self.read_u32()? as usize;
                self.need(len)?;
                Value::Bytes(self.buf.copy_to_bytes(len).to_vec())
            }
            TypeTag::BoolArray => {
                let len = self.read_u32()? as usize;
                self.need(len)?;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.buf.get_u8() != 0);
                }
                Value::BoolArray(items)
            }
            TypeTag::I16Array => {
                let len = self.read_u32()? as usize;
                self.need(len * 2)?;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.buf.get_i16_le());
                }
                Value::I16Array(items)
            }
            TypeTag::I32Array => {
                let len = self.read_u32()? as usize;
                self.need(len * 4)?;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.buf.get_i32_le());
                }
                Value::I32Array(items)
            }
            TypeTag::I64Array => {
                let len = self.read_u32()? as usize;
                self.need(len * 8)?;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.buf.get_i64_le());
                }
                Value::I64Array(items)
            }
            TypeTag::F32Array => {
                let len = self.read_u32()? as usize;
                self.need(len * 4)?;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.buf.get_f32_le());
                }
                Value::F32Array(items)
            }
            TypeTag::F64Array => {
                let len = self.read_u32()? as usize;
                self.need(len * 8)?;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.buf.get_f64_le());
                }
                Value::F64Array(items)
            }
            TypeTag::StringArray => {
                let len = self.read_u32()? as usize;
                let mut items = Vec::with_capacity(len.min(4096));
                for _ in 0..len {
                    items.push(self.read_str()?);
                }
                Value::StringArray(items)
            }
            TypeTag::ObjArray => {
                let class_name = self.read_str()?;
                let len = self.read_u32()? as usize;
                let mut elems = Vec::with_capacity(len.min(4096));
                for _ in 0..len {
                    elems.push(self.read_value()?);
                }
                Value::ObjArray { class_name, elems }
            }
            TypeTag::List => {
                let len = self.read_u32()? as usize;
                let mut items = Vec::with_capacity(len.min(4096));
                for _ in 0..len {
                    items.push(self.read_value()?);
                }
                Value::List(items)
            }
            TypeTag::Set => {
                let len = self.read_u32()? as usize;
                let mut items = Vec::with_capacity(len.min(4096));
                for _ in 0..len {
                    items.push(self.read_value()?);
                }
                Value::Set(items)
            }
            TypeTag::Map => {
                let len = self.read_u32()? as usize;
                let mut entries = Vec::with_capacity(len.min(4096));
                for _ in 0..len {
                    let key = self.read_value()?;
                    let val = self.read_value()?;
                    entries.push((key, val));
                }
                Value::Map(entries)
            }
        })
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(OpalError::CorruptImage(format!(
                "image truncated: need {} bytes, have {}",
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn read_u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn read_u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn read_str(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        self.need(len)?;
        let raw = self.buf.copy_to_bytes(len);
        String::from_utf8(raw.to_vec())
            .map_err(|_| OpalError::CorruptImage("invalid UTF-8 in string payload".to_string()))
    }
}
