//! Validation and coercion of host values into storable shapes
//!
//! [`cast`] runs before any shared memory is touched, so a failed cast never
//! leaves a half-written block behind.

use super::raw::{time_to_secs, HostProc, RawValue};
use super::{Type, TypeRef, Value};
use crate::{BridgeError, BridgeResult};

/// A host value checked against a type, ready to be written
pub(crate) enum Cast {
    /// Primitive payload, native-endian, first `memsize` bytes significant
    Scalar([u8; 8]),
    /// String contents
    Bytes(Vec<u8>),
    /// Array elements, or Tuple/NamedTuple children in storage order
    List(Vec<Cast>),
    /// Hash pairs
    Pairs(Vec<(Cast, Cast)>),
    /// Union member index and payload
    Variant(u8, Box<Cast>),
    /// Host closure
    Proc(HostProc),
    /// Existing block of exactly the target type, shared on write
    Shared(Value),
}

fn scalar<const N: usize>(bytes: [u8; N]) -> Cast {
    let mut out = [0u8; 8];
    out[..N].copy_from_slice(&bytes);
    Cast::Scalar(out)
}

fn invalid(ty: &Type, raw: &RawValue) -> BridgeError {
    let mut value = format!("{:?}", raw);
    if value.len() > 64 {
        value = value.chars().take(61).collect::<String>() + "...";
    }
    BridgeError::InvalidCast {
        ty: ty.to_string(),
        value,
    }
}

/// Whole-number view used by every integer type
fn integral(raw: &RawValue) -> Option<i128> {
    match raw {
        RawValue::Int(i) => Some(*i as i128),
        RawValue::UInt(u) => Some(*u as i128),
        RawValue::Float(f) if f.is_finite() && f.fract() == 0.0 => Some(*f as i128),
        _ => None,
    }
}

fn number(raw: &RawValue) -> Option<f64> {
    match raw {
        RawValue::Int(i) => Some(*i as f64),
        RawValue::UInt(u) => Some(*u as f64),
        RawValue::Float(f) => Some(*f),
        _ => None,
    }
}

macro_rules! cast_int {
    ($t:ty, $raw:expr) => {
        integral($raw)
            .and_then(|n| <$t>::try_from(n).ok())
            .map(|n| scalar(n.to_ne_bytes()))
    };
}

/// Cheap structural pre-check, used when probing union members
pub(crate) fn valid_cast(ty: &TypeRef, raw: &RawValue) -> bool {
    use RawValue as R;

    if let R::Ref(value) = raw {
        if ty.is_ref_counted() && value.ty() == ty {
            return true;
        }
        return valid_cast(ty, &value.get());
    }

    match &**ty {
        Type::Nil => matches!(raw, R::Nil),
        Type::Bool => matches!(raw, R::Bool(_) | R::Int(_) | R::UInt(_)),
        Type::Int8
        | Type::Int16
        | Type::Int32
        | Type::Int64
        | Type::UInt8
        | Type::UInt16
        | Type::UInt32
        | Type::UInt64 => integral(raw).is_some(),
        Type::Float32 | Type::Float64 => number(raw).is_some(),
        Type::Time => matches!(raw, R::Time(_)) || number(raw).is_some(),
        Type::Symbol(_) => matches!(raw, R::Symbol(_) | R::Str(_) | R::Int(_) | R::UInt(_)),
        Type::String => matches!(raw, R::Str(_) | R::Symbol(_)),
        Type::Array(_) => matches!(raw, R::Array(_)),
        Type::Hash(_, _) => matches!(raw, R::Hash(_)),
        Type::Tuple(children) => matches!(raw, R::Array(items) if items.len() == children.len()),
        Type::NamedTuple(fields) => matches!(raw, R::Hash(pairs) if pairs.len() == fields.len()),
        Type::TaggedUnion(members) => members.iter().any(|m| valid_cast(m, raw)),
        Type::Proc(_, _) => matches!(raw, R::Proc(_)),
    }
}

/// Validate and coerce `raw` into the shape stored for `ty`
pub(crate) fn cast(ty: &TypeRef, raw: &RawValue) -> BridgeResult<Cast> {
    use RawValue as R;

    if let R::Ref(value) = raw {
        if ty.is_ref_counted() && value.ty() == ty {
            return Ok(Cast::Shared(value.clone()));
        }
        return cast(ty, &value.get());
    }

    let cast = match &**ty {
        Type::Nil => match raw {
            R::Nil => Some(scalar([])),
            _ => None,
        },
        Type::Bool => match raw {
            R::Bool(b) => Some(scalar([*b as u8])),
            R::Int(i) => Some(scalar([(*i != 0) as u8])),
            R::UInt(u) => Some(scalar([(*u != 0) as u8])),
            _ => None,
        },
        Type::Int8 => cast_int!(i8, raw),
        Type::Int16 => cast_int!(i16, raw),
        Type::Int32 => cast_int!(i32, raw),
        Type::Int64 => cast_int!(i64, raw),
        Type::UInt8 => cast_int!(u8, raw),
        Type::UInt16 => cast_int!(u16, raw),
        Type::UInt32 => cast_int!(u32, raw),
        Type::UInt64 => cast_int!(u64, raw),
        Type::Float32 => number(raw).map(|f| scalar((f as f32).to_ne_bytes())),
        Type::Float64 => number(raw).map(|f| scalar(f.to_ne_bytes())),
        Type::Time => match raw {
            R::Time(t) => Some(scalar(time_to_secs(*t).to_ne_bytes())),
            other => number(other).map(|f| scalar(f.to_ne_bytes())),
        },
        Type::Symbol(names) => match raw {
            R::Symbol(name) | R::Str(name) => ty.symbol_index(name).map(|i| scalar(i.to_ne_bytes())),
            other => integral(other)
                .filter(|i| *i >= 0 && (*i as usize) < names.len())
                .map(|i| scalar((i as u32).to_ne_bytes())),
        },
        Type::String => raw.as_str().map(|s| Cast::Bytes(s.as_bytes().to_vec())),
        Type::Array(inner) => match raw {
            R::Array(items) => Some(Cast::List(
                items
                    .iter()
                    .map(|item| cast(inner, item))
                    .collect::<BridgeResult<_>>()?,
            )),
            _ => None,
        },
        Type::Hash(key_ty, value_ty) => match raw {
            R::Hash(pairs) => {
                // Later pairs override earlier ones with an equal key
                let mut unique: Vec<&(RawValue, RawValue)> = Vec::with_capacity(pairs.len());
                for pair in pairs {
                    match unique.iter().position(|seen| seen.0 == pair.0) {
                        Some(i) => unique[i] = pair,
                        None => unique.push(pair),
                    }
                }
                let mut out = Vec::with_capacity(unique.len());
                for (k, v) in unique {
                    out.push((cast(key_ty, k)?, cast(value_ty, v)?));
                }
                Some(Cast::Pairs(out))
            }
            _ => None,
        },
        Type::Tuple(children) => match raw {
            R::Array(items) if items.len() == children.len() => Some(Cast::List(
                children
                    .iter()
                    .zip(items)
                    .map(|(child, item)| cast(child, item))
                    .collect::<BridgeResult<_>>()?,
            )),
            _ => None,
        },
        Type::NamedTuple(fields) => match raw {
            R::Hash(pairs) if pairs.len() == fields.len() => {
                let mut out = Vec::with_capacity(fields.len());
                for (name, field_ty) in fields {
                    let found = pairs.iter().find(|(k, _)| k.as_str() == Some(name.as_str()));
                    match found {
                        Some((_, v)) => out.push(cast(field_ty, v)?),
                        None => return Err(invalid(ty, raw)),
                    }
                }
                Some(Cast::List(out))
            }
            _ => None,
        },
        Type::TaggedUnion(members) => members.iter().enumerate().find_map(|(i, member)| {
            // the discriminant is one byte
            let i = u8::try_from(i).ok()?;
            if !valid_cast(member, raw) {
                return None;
            }
            cast(member, raw)
                .ok()
                .map(|inner| Cast::Variant(i, Box::new(inner)))
        }),
        Type::Proc(_, _) => match raw {
            R::Proc(p) => Some(Cast::Proc(p.clone())),
            _ => None,
        },
    };

    cast.ok_or_else(|| invalid(ty, raw))
}
