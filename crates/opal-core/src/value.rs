//! The value model.
//!
//! A persistable object's fields are `Value`s. Second-class values (SCOs)
//! are inlined into the owner's serialized image; first-class references
//! (`Value::Object`) are encoded as OIDs and resolved through the owning
//! persister. A `Value::Shared` cell is the explicit form of an aliasable
//! SCO: two fields holding clones of the same cell decode back to one cell.

use crate::persist::ObjRef;
use opal_common::{OpalError, Result, TypeTag};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::sync::Arc;

/// An aliasable second-class value. Identity is `Arc` pointer identity;
/// the codec writes the payload once per image and back-references repeats.
pub type SharedValue = Arc<RwLock<Value>>;

/// Creates a new shared value cell.
pub fn shared(value: Value) -> SharedValue {
    Arc::new(RwLock::new(value))
}

/// A typed value stored in a persistable object's field.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    /// Reference to a first-class object, encoded as its OID.
    Object(ObjRef),
    /// Aliasable second-class value, de-duplicated per image.
    Shared(SharedValue),

    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    I128(i128),
    F32(f32),
    F64(f64),
    Char(char),

    String(String),
    /// Fixed-precision decimal: `unscaled * 10^-scale`.
    Decimal { unscaled: i128, scale: u32 },
    /// Days since the Unix epoch.
    Date(i32),
    /// Microseconds since midnight.
    Time(i64),
    /// Microseconds since the Unix epoch.
    Timestamp(i64),

    Bytes(Vec<u8>),
    BoolArray(Vec<bool>),
    I16Array(Vec<i16>),
    I32Array(Vec<i32>),
    I64Array(Vec<i64>),
    F32Array(Vec<f32>),
    F64Array(Vec<f64>),
    StringArray(Vec<String>),
    /// Object-typed array; the component class name is persisted so the
    /// array can be reconstructed with the right element type.
    ObjArray { class_name: String, elems: Vec<Value> },

    List(Vec<Value>),
    Set(Vec<Value>),
    Map(Vec<(Value, Value)>),
}

impl Value {
    /// Returns the wire tag this value encodes under.
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Value::Null => TypeTag::Null,
            Value::Object(_) => TypeTag::Fco,
            Value::Shared(_) => TypeTag::SharedNew,
            Value::Bool(_) => TypeTag::Bool,
            Value::I8(_) => TypeTag::I8,
            Value::I16(_) => TypeTag::I16,
            Value::I32(_) => TypeTag::I32,
            Value::I64(_) => TypeTag::I64,
            Value::I128(_) => TypeTag::I128,
            Value::F32(_) => TypeTag::F32,
            Value::F64(_) => TypeTag::F64,
            Value::Char(_) => TypeTag::Char,
            Value::String(_) => TypeTag::String,
            Value::Decimal { .. } => TypeTag::Decimal,
            Value::Date(_) => TypeTag::Date,
            Value::Time(_) => TypeTag::Time,
            Value::Timestamp(_) => TypeTag::Timestamp,
            Value::Bytes(_) => TypeTag::Bytes,
            Value::BoolArray(_) => TypeTag::BoolArray,
            Value::I16Array(_) => TypeTag::I16Array,
            Value::I32Array(_) => TypeTag::I32Array,
            Value::I64Array(_) => TypeTag::I64Array,
            Value::F32Array(_) => TypeTag::F32Array,
            Value::F64Array(_) => TypeTag::F64Array,
            Value::StringArray(_) => TypeTag::StringArray,
            Value::ObjArray { .. } => TypeTag::ObjArray,
            Value::List(_) => TypeTag::List,
            Value::Set(_) => TypeTag::Set,
            Value::Map(_) => TypeTag::Map,
        }
    }

    /// Returns the display name of this value's kind.
    pub fn type_name(&self) -> String {
        self.type_tag().to_string()
    }

    /// Returns true if this value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns true if this value is a first-class object reference.
    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    /// Returns true if this value is an aliasable shared cell.
    pub fn is_shared(&self) -> bool {
        matches!(self, Value::Shared(_))
    }

    /// Returns true if this value is a container (list, set, map, or array
    /// of objects).
    pub fn is_container(&self) -> bool {
        matches!(
            self,
            Value::List(_) | Value::Set(_) | Value::Map(_) | Value::ObjArray { .. }
        )
    }

    /// Returns true if values of this kind admit a natural ordering.
    pub fn is_comparable(&self) -> bool {
        matches!(
            self,
            Value::Bool(_)
                | Value::I8(_)
                | Value::I16(_)
                | Value::I32(_)
                | Value::I64(_)
                | Value::I128(_)
                | Value::F32(_)
                | Value::F64(_)
                | Value::Char(_)
                | Value::String(_)
                | Value::Decimal { .. }
                | Value::Date(_)
                | Value::Time(_)
                | Value::Timestamp(_)
                | Value::Bytes(_)
        )
    }

    /// Deep structural equality.
    ///
    /// Object references compare by identity (OID or cell pointer), never
    /// by content. Shared cells compare by pointer first, then by payload;
    /// a revisited cell pair is taken as equal, which makes the comparison
    /// terminate on cyclic graphs.
    pub fn graph_eq(&self, other: &Value) -> bool {
        let mut visited = Vec::new();
        graph_eq_inner(self, other, &mut visited)
    }
}

fn graph_eq_inner(a: &Value, b: &Value, visited: &mut Vec<(usize, usize)>) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Object(x), Value::Object(y)) => {
            if Arc::ptr_eq(x, y) {
                return true;
            }
            let (xo, yo) = (x.oid(), y.oid());
            !xo.is_null() && xo == yo
        }
        (Value::Shared(x), Value::Shared(y)) => {
            if Arc::ptr_eq(x, y) {
                return true;
            }
            let pair = (Arc::as_ptr(x) as usize, Arc::as_ptr(y) as usize);
            if visited.contains(&pair) {
                return true;
            }
            visited.push(pair);
            let (xv, yv) = (x.read(), y.read());
            graph_eq_inner(&xv, &yv, visited)
        }
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::I8(x), Value::I8(y)) => x == y,
        (Value::I16(x), Value::I16(y)) => x == y,
        (Value::I32(x), Value::I32(y)) => x == y,
        (Value::I64(x), Value::I64(y)) => x == y,
        (Value::I128(x), Value::I128(y)) => x == y,
        (Value::F32(x), Value::F32(y)) => x.to_bits() == y.to_bits(),
        (Value::F64(x), Value::F64(y)) => x.to_bits() == y.to_bits(),
        (Value::Char(x), Value::Char(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        (
            Value::Decimal {
                unscaled: xu,
                scale: xs,
            },
            Value::Decimal {
                unscaled: yu,
                scale: ys,
            },
        ) => xu == yu && xs == ys,
        (Value::Date(x), Value::Date(y)) => x == y,
        (Value::Time(x), Value::Time(y)) => x == y,
        (Value::Timestamp(x), Value::Timestamp(y)) => x == y,
        (Value::Bytes(x), Value::Bytes(y)) => x == y,
        (Value::BoolArray(x), Value::BoolArray(y)) => x == y,
        (Value::I16Array(x), Value::I16Array(y)) => x == y,
        (Value::I32Array(x), Value::I32Array(y)) => x == y,
        (Value::I64Array(x), Value::I64Array(y)) => x == y,
        (Value::F32Array(x), Value::F32Array(y)) => {
            x.len() == y.len()
                && x.iter()
                    .zip(y.iter())
                    .all(|(a, b)| a.to_bits() == b.to_bits())
        }
        (Value::F64Array(x), Value::F64Array(y)) => {
            x.len() == y.len()
                && x.iter()
                    .zip(y.iter())
                    .all(|(a, b)| a.to_bits() == b.to_bits())
        }
        (Value::StringArray(x), Value::StringArray(y)) => x == y,
        (
            Value::ObjArray {
                class_name: xc,
                elems: xe,
            },
            Value::ObjArray {
                class_name: yc,
                elems: ye,
            },
        ) => xc == yc && seq_eq(xe, ye, visited),
        (Value::List(x), Value::List(y)) => seq_eq(x, y, visited),
        (Value::Set(x), Value::Set(y)) => {
            // Sets are unordered; match every element on the left against
            // some element on the right.
            x.len() == y.len()
                && x.iter()
                    .all(|xv| y.iter().any(|yv| graph_eq_inner(xv, yv, visited)))
        }
        (Value::Map(x), Value::Map(y)) => {
            x.len() == y.len()
                && x.iter().all(|(xk, xv)| {
                    y.iter().any(|(yk, yv)| {
                        graph_eq_inner(xk, yk, visited) && graph_eq_inner(xv, yv, visited)
                    })
                })
        }
        _ => false,
    }
}

fn seq_eq(a: &[Value], b: &[Value], visited: &mut Vec<(usize, usize)>) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(x, y)| graph_eq_inner(x, y, visited))
}

/// Natural ordering over comparable value kinds.
///
/// Both operands must be comparable and of the same kind; anything else is
/// a caller error surfaced as `UnsupportedKeyType` or `TypeMismatch`.
pub fn natural_cmp(a: &Value, b: &Value) -> Result<Ordering> {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => Ok(x.cmp(y)),
        (Value::I8(x), Value::I8(y)) => Ok(x.cmp(y)),
        (Value::I16(x), Value::I16(y)) => Ok(x.cmp(y)),
        (Value::I32(x), Value::I32(y)) => Ok(x.cmp(y)),
        (Value::I64(x), Value::I64(y)) => Ok(x.cmp(y)),
        (Value::I128(x), Value::I128(y)) => Ok(x.cmp(y)),
        (Value::F32(x), Value::F32(y)) => Ok(x.total_cmp(y)),
        (Value::F64(x), Value::F64(y)) => Ok(x.total_cmp(y)),
        (Value::Char(x), Value::Char(y)) => Ok(x.cmp(y)),
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        (
            Value::Decimal {
                unscaled: xu,
                scale: xs,
            },
            Value::Decimal {
                unscaled: yu,
                scale: ys,
            },
        ) => Ok(decimal_cmp(*xu, *xs, *yu, *ys)),
        (Value::Date(x), Value::Date(y)) => Ok(x.cmp(y)),
        (Value::Time(x), Value::Time(y)) => Ok(x.cmp(y)),
        (Value::Timestamp(x), Value::Timestamp(y)) => Ok(x.cmp(y)),
        (Value::Bytes(x), Value::Bytes(y)) => Ok(x.cmp(y)),
        _ => {
            if !a.is_comparable() {
                Err(OpalError::UnsupportedKeyType(a.type_name()))
            } else if !b.is_comparable() {
                Err(OpalError::UnsupportedKeyType(b.type_name()))
            } else {
                Err(OpalError::TypeMismatch {
                    expected: a.type_name(),
                    actual: b.type_name(),
                })
            }
        }
    }
}

/// Compares two decimals after aligning scales. Falls back to an
/// approximate f64 comparison if scale alignment overflows i128.
fn decimal_cmp(xu: i128, xs: u32, yu: i128, ys: u32) -> Ordering {
    if xs == ys {
        return xu.cmp(&yu);
    }
    let (lo_u, hi_u, diff, flipped) = if xs < ys {
        (xu, yu, ys - xs, false)
    } else {
        (yu, xu, xs - ys, true)
    };
    let scaled = 10i128
        .checked_pow(diff)
        .and_then(|p| lo_u.checked_mul(p));
    let ord = match scaled {
        Some(lo_scaled) => lo_scaled.cmp(&hi_u),
        None => {
            let lo = lo_u as f64;
            let hi = (hi_u as f64) / 10f64.powi(diff as i32);
            lo.partial_cmp(&hi).unwrap_or(Ordering::Equal)
        }
    };
    if flipped { ord.reverse() } else { ord }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::{DynObject, ObjCell};
    use opal_common::{ClassId, Oid};

    #[test]
    fn test_type_tags() {
        assert_eq!(Value::Null.type_tag(), TypeTag::Null);
        assert_eq!(Value::I64(1).type_tag(), TypeTag::I64);
        assert_eq!(Value::String("x".into()).type_tag(), TypeTag::String);
        assert_eq!(Value::List(vec![]).type_tag(), TypeTag::List);
        assert_eq!(
            Value::Shared(shared(Value::I32(1))).type_tag(),
            TypeTag::SharedNew
        );
    }

    #[test]
    fn test_predicates() {
        assert!(Value::Null.is_null());
        assert!(Value::List(vec![]).is_container());
        assert!(Value::I64(0).is_comparable());
        assert!(!Value::Map(vec![]).is_comparable());
        assert!(Value::Shared(shared(Value::Null)).is_shared());
    }

    #[test]
    fn test_graph_eq_scalars() {
        assert!(Value::I64(5).graph_eq(&Value::I64(5)));
        assert!(!Value::I64(5).graph_eq(&Value::I64(6)));
        assert!(!Value::I64(5).graph_eq(&Value::I32(5)));
        assert!(Value::F64(f64::NAN).graph_eq(&Value::F64(f64::NAN)));
    }

    #[test]
    fn test_graph_eq_containers() {
        let a = Value::List(vec![Value::I32(1), Value::String("a".into())]);
        let b = Value::List(vec![Value::I32(1), Value::String("a".into())]);
        assert!(a.graph_eq(&b));

        let s1 = Value::Set(vec![Value::I32(1), Value::I32(2)]);
        let s2 = Value::Set(vec![Value::I32(2), Value::I32(1)]);
        assert!(s1.graph_eq(&s2));

        let m1 = Value::Map(vec![(Value::I32(1), Value::Bool(true))]);
        let m2 = Value::Map(vec![(Value::I32(1), Value::Bool(true))]);
        assert!(m1.graph_eq(&m2));
        let m3 = Value::Map(vec![(Value::I32(1), Value::Bool(false))]);
        assert!(!m1.graph_eq(&m3));
    }

    #[test]
    fn test_graph_eq_shared_identity_and_payload() {
        let cell = shared(Value::I32(7));
        let a = Value::Shared(cell.clone());
        let b = Value::Shared(cell);
        assert!(a.graph_eq(&b));

        let c = Value::Shared(shared(Value::I32(7)));
        assert!(a.graph_eq(&c)); // distinct cells, equal payloads

        let d = Value::Shared(shared(Value::I32(8)));
        assert!(!a.graph_eq(&d));
    }

    #[test]
    fn test_graph_eq_cyclic_shared() {
        let cell = shared(Value::Null);
        *cell.write() = Value::List(vec![Value::Shared(cell.clone())]);
        let a = Value::Shared(cell.clone());
        let b = Value::Shared(cell);
        assert!(a.graph_eq(&b));
    }

    #[test]
    fn test_graph_eq_object_identity() {
        let obj = ObjCell::new(Box::new(DynObject::new_object(
            "Widget",
            ClassId::new(20),
            vec![],
        )));
        let a = Value::Object(obj.clone());
        let b = Value::Object(obj.clone());
        assert!(a.graph_eq(&b));

        // Same OID, different cells: still identical.
        let x = ObjCell::new(Box::new(DynObject::hollow("Widget", ClassId::new(20))));
        let y = ObjCell::new(Box::new(DynObject::hollow("Widget", ClassId::new(20))));
        x.set_oid(Oid::new(99));
        y.set_oid(Oid::new(99));
        assert!(Value::Object(x.clone()).graph_eq(&Value::Object(y)));

        // Unassigned OIDs never compare equal across cells.
        let p = ObjCell::new(Box::new(DynObject::hollow("Widget", ClassId::new(20))));
        let q = ObjCell::new(Box::new(DynObject::hollow("Widget", ClassId::new(20))));
        assert!(!Value::Object(p).graph_eq(&Value::Object(q)));
    }

    #[test]
    fn test_natural_cmp_same_kind() {
        assert_eq!(
            natural_cmp(&Value::I64(1), &Value::I64(2)).unwrap(),
            Ordering::Less
        );
        assert_eq!(
            natural_cmp(&Value::String("b".into()), &Value::String("a".into())).unwrap(),
            Ordering::Greater
        );
        assert_eq!(
            natural_cmp(&Value::Bytes(vec![1, 2]), &Value::Bytes(vec![1, 2])).unwrap(),
            Ordering::Equal
        );
    }

    #[test]
    fn test_natural_cmp_mismatch() {
        let err = natural_cmp(&Value::I64(1), &Value::String("a".into())).unwrap_err();
        assert!(matches!(err, OpalError::TypeMismatch { .. }));
    }

    #[test]
    fn test_natural_cmp_uncomparable() {
        let err = natural_cmp(&Value::List(vec![]), &Value::List(vec![])).unwrap_err();
        assert!(matches!(err, OpalError::UnsupportedKeyType(_)));
    }

    #[test]
    fn test_decimal_cmp_aligned_scales() {
        // 1.50 vs 1.5
        let a = Value::Decimal {
            unscaled: 150,
            scale: 2,
        };
        let b = Value::Decimal {
            unscaled: 15,
            scale: 1,
        };
        assert_eq!(natural_cmp(&a, &b).unwrap(), Ordering::Equal);

        // 1.51 vs 1.5
        let c = Value::Decimal {
            unscaled: 151,
            scale: 2,
        };
        assert_eq!(natural_cmp(&c, &b).unwrap(), Ordering::Greater);
        assert_eq!(natural_cmp(&b, &c).unwrap(), Ordering::Less);
    }

    #[test]
    fn test_type_name() {
        assert_eq!(Value::I64(0).type_name(), "I64");
        assert_eq!(Value::Map(vec![]).type_name(), "MAP");
    }
}
