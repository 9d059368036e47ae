//! Host-side values
//!
//! [`RawValue`] is what host code hands to the bridge and what decoding hands
//! back. It owns no shared memory except through [`RawValue::Ref`].

use super::Value;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Host closure wrapped by a Proc value
#[derive(Clone)]
pub struct HostProc(Arc<dyn Fn(&[RawValue]) -> RawValue + Send + Sync>);

impl HostProc {
    /// Wrap a closure
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[RawValue]) -> RawValue + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Invoke the closure directly
    pub fn call(&self, args: &[RawValue]) -> RawValue {
        (self.0)(args)
    }

    /// Whether both handles wrap the same closure
    pub fn ptr_eq(&self, other: &HostProc) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for HostProc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostProc({:p})", Arc::as_ptr(&self.0) as *const ())
    }
}

/// A value as the host sees it
#[derive(Clone)]
pub enum RawValue {
    /// Nil
    Nil,
    /// Boolean
    Bool(bool),
    /// Signed integer (also every integer type of 32 bits or less)
    Int(i64),
    /// Unsigned 64-bit integer
    UInt(u64),
    /// Floating point
    Float(f64),
    /// UTF-8 string
    Str(String),
    /// Symbol name
    Symbol(String),
    /// Point in time
    Time(SystemTime),
    /// Array or Tuple contents
    Array(Vec<RawValue>),
    /// Hash or NamedTuple contents, in insertion order
    Hash(Vec<(RawValue, RawValue)>),
    /// Host closure
    Proc(HostProc),
    /// Existing shared value
    Ref(Value),
}

impl RawValue {
    /// Symbol from a name
    pub fn symbol(name: impl Into<String>) -> Self {
        RawValue::Symbol(name.into())
    }

    /// Short description of the variant, for error messages
    pub fn kind(&self) -> &'static str {
        match self {
            RawValue::Nil => "nil",
            RawValue::Bool(_) => "bool",
            RawValue::Int(_) => "int",
            RawValue::UInt(_) => "uint",
            RawValue::Float(_) => "float",
            RawValue::Str(_) => "string",
            RawValue::Symbol(_) => "symbol",
            RawValue::Time(_) => "time",
            RawValue::Array(_) => "array",
            RawValue::Hash(_) => "hash",
            RawValue::Proc(_) => "proc",
            RawValue::Ref(_) => "ref",
        }
    }

    /// Integer view (`Int`, or `UInt` that fits)
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RawValue::Int(i) => Some(*i),
            RawValue::UInt(u) => i64::try_from(*u).ok(),
            RawValue::Ref(v) => v.get().as_i64(),
            _ => None,
        }
    }

    /// Float view
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RawValue::Float(f) => Some(*f),
            RawValue::Int(i) => Some(*i as f64),
            RawValue::UInt(u) => Some(*u as f64),
            RawValue::Ref(v) => v.get().as_f64(),
            _ => None,
        }
    }

    /// Boolean view
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RawValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// String or Symbol view
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RawValue::Str(s) | RawValue::Symbol(s) => Some(s),
            _ => None,
        }
    }

    /// Shared value view
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            RawValue::Ref(v) => Some(v),
            _ => None,
        }
    }

    /// Replace every `Ref` with its decoded contents, recursively
    pub fn resolve(&self) -> RawValue {
        match self {
            RawValue::Ref(v) => v.get().resolve(),
            RawValue::Array(items) => RawValue::Array(items.iter().map(RawValue::resolve).collect()),
            RawValue::Hash(pairs) => RawValue::Hash(
                pairs
                    .iter()
                    .map(|(k, v)| (k.resolve(), v.resolve()))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

/// Seconds since the Unix epoch (negative before it)
pub fn time_to_secs(time: SystemTime) -> f64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}

/// Inverse of [`time_to_secs`]
pub fn secs_to_time(secs: f64) -> SystemTime {
    if !secs.is_finite() {
        return UNIX_EPOCH;
    }
    if secs >= 0.0 {
        UNIX_EPOCH + Duration::from_secs_f64(secs)
    } else {
        UNIX_EPOCH - Duration::from_secs_f64(-secs)
    }
}

fn pairs_eq(a: &[(RawValue, RawValue)], b: &[(RawValue, RawValue)]) -> bool {
    a.len() == b.len()
        && a.iter().all(|(ka, va)| b.iter().any(|(kb, vb)| ka == kb && va == vb))
}

impl PartialEq for RawValue {
    fn eq(&self, other: &RawValue) -> bool {
        use RawValue::*;
        match (self, other) {
            (Ref(a), Ref(b)) => {
                (a.address().is_some() && a.address() == b.address()) || a.get() == b.get()
            }
            (Ref(a), b) => a.get() == *b,
            (a, Ref(b)) => *a == b.get(),
            (Nil, Nil) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (UInt(a), UInt(b)) => a == b,
            (Int(a), UInt(b)) | (UInt(b), Int(a)) => *a >= 0 && *a as u64 == *b,
            (Float(a), Float(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (Symbol(a), Symbol(b)) => a == b,
            (Time(a), Time(b)) => time_to_secs(*a) == time_to_secs(*b),
            (Array(a), Array(b)) => a == b,
            (Hash(a), Hash(b)) => pairs_eq(a, b),
            (Proc(a), Proc(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Debug for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawValue::Nil => write!(f, "nil"),
            RawValue::Bool(b) => write!(f, "{}", b),
            RawValue::Int(i) => write!(f, "{}", i),
            RawValue::UInt(u) => write!(f, "{}u", u),
            RawValue::Float(x) => write!(f, "{:?}", x),
            RawValue::Str(s) => write!(f, "{:?}", s),
            RawValue::Symbol(s) => write!(f, ":{}", s),
            RawValue::Time(t) => write!(f, "Time({})", time_to_secs(*t)),
            RawValue::Array(items) => f.debug_list().entries(items).finish(),
            RawValue::Hash(pairs) => f
                .debug_map()
                .entries(pairs.iter().map(|(k, v)| (k, v)))
                .finish(),
            RawValue::Proc(p) => write!(f, "{:?}", p),
            RawValue::Ref(v) => write!(f, "{:?}", v),
        }
    }
}

impl From<()> for RawValue {
    fn from(_: ()) -> Self {
        RawValue::Nil
    }
}

impl From<bool> for RawValue {
    fn from(b: bool) -> Self {
        RawValue::Bool(b)
    }
}

macro_rules! from_signed {
    ($($t:ty),*) => {
        $(impl From<$t> for RawValue {
            fn from(v: $t) -> Self {
                RawValue::Int(v as i64)
            }
        })*
    };
}

from_signed!(i8, i16, i32, i64, u8, u16, u32);

impl From<u64> for RawValue {
    fn from(v: u64) -> Self {
        RawValue::UInt(v)
    }
}

impl From<f32> for RawValue {
    fn from(v: f32) -> Self {
        RawValue::Float(v as f64)
    }
}

impl From<f64> for RawValue {
    fn from(v: f64) -> Self {
        RawValue::Float(v)
    }
}

impl From<&str> for RawValue {
    fn from(s: &str) -> Self {
        RawValue::Str(s.to_string())
    }
}

impl From<String> for RawValue {
    fn from(s: String) -> Self {
        RawValue::Str(s)
    }
}

impl From<SystemTime> for RawValue {
    fn from(t: SystemTime) -> Self {
        RawValue::Time(t)
    }
}

impl From<HostProc> for RawValue {
    fn from(p: HostProc) -> Self {
        RawValue::Proc(p)
    }
}

impl From<Value> for RawValue {
    fn from(v: Value) -> Self {
        RawValue::Ref(v)
    }
}

impl<T: Into<RawValue>> From<Vec<T>> for RawValue {
    fn from(items: Vec<T>) -> Self {
        RawValue::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<RawValue>> From<Option<T>> for RawValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(RawValue::Nil)
    }
}
