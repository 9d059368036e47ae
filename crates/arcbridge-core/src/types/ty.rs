//! Type descriptors
//!
//! A [`Type`] describes the shape of a shared value: its own payload size, how
//! many bytes it occupies inside a container, and the descriptors of its
//! children. Composite descriptors are built from inner [`TypeRef`]s, so one
//! enum covers every instantiation (`Array(Int32)`, `Hash(String, Bool)`, ...).

use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

/// Shared handle to a type descriptor
pub type TypeRef = Arc<Type>;

/// Storage class of a type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Stored by value, no allocation
    Primitive,
    /// One block: refcount followed by an inline payload
    FixedWidth,
    /// Header block plus a separately sized data block
    VariableWidth,
}

/// Shape descriptor of a shared value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    /// The unit value
    Nil,
    /// `u8` of 0 or 1
    Bool,
    /// Signed 8-bit integer
    Int8,
    /// Signed 16-bit integer
    Int16,
    /// Signed 32-bit integer
    Int32,
    /// Signed 64-bit integer
    Int64,
    /// Unsigned 8-bit integer
    UInt8,
    /// Unsigned 16-bit integer
    UInt16,
    /// Unsigned 32-bit integer
    UInt32,
    /// Unsigned 64-bit integer
    UInt64,
    /// 32-bit float
    Float32,
    /// 64-bit float
    Float64,
    /// `f64` seconds since the Unix epoch
    Time,
    /// `u32` index into the declared names
    Symbol(Vec<String>),
    /// UTF-8 bytes
    String,
    /// Homogeneous list
    Array(TypeRef),
    /// Ordered key/value pairs
    Hash(TypeRef, TypeRef),
    /// Fixed-arity heterogeneous list
    Tuple(Vec<TypeRef>),
    /// Tuple with field names
    NamedTuple(Vec<(String, TypeRef)>),
    /// One of several member types, chosen by first match
    TaggedUnion(Vec<TypeRef>),
    /// Callable taking the argument types and returning the last type
    Proc(Vec<TypeRef>, TypeRef),
}

impl Type {
    /// Wrap into a shared handle
    pub fn into_ref(self) -> TypeRef {
        Arc::new(self)
    }

    /// `Array(inner)`
    pub fn array(inner: TypeRef) -> TypeRef {
        Type::Array(inner).into_ref()
    }

    /// `Hash(key, value)`
    pub fn hash(key: TypeRef, value: TypeRef) -> TypeRef {
        Type::Hash(key, value).into_ref()
    }

    /// `Tuple(children...)`
    pub fn tuple(children: Vec<TypeRef>) -> TypeRef {
        Type::Tuple(children).into_ref()
    }

    /// `NamedTuple(name: child, ...)`
    pub fn named_tuple<S: Into<String>>(fields: Vec<(S, TypeRef)>) -> TypeRef {
        Type::NamedTuple(fields.into_iter().map(|(n, t)| (n.into(), t)).collect()).into_ref()
    }

    /// Union of `members`, flattening nested unions
    ///
    /// The discriminant is one byte; members past the 256th never match.
    pub fn union(members: Vec<TypeRef>) -> TypeRef {
        let mut flat: Vec<TypeRef> = Vec::with_capacity(members.len());
        for member in members {
            let parts = match &*member {
                Type::TaggedUnion(inner) => inner.clone(),
                _ => vec![member.clone()],
            };
            for part in parts {
                if !flat.contains(&part) {
                    flat.push(part);
                }
            }
        }
        Type::TaggedUnion(flat).into_ref()
    }

    /// `Proc(args..., ret)`
    pub fn proc(args: Vec<TypeRef>, ret: TypeRef) -> TypeRef {
        Type::Proc(args, ret).into_ref()
    }

    /// `Symbol(names...)`
    pub fn symbol<S: Into<String>>(names: impl IntoIterator<Item = S>) -> TypeRef {
        Type::Symbol(names.into_iter().map(Into::into).collect()).into_ref()
    }

    /// Storage class
    pub fn layout(&self) -> Layout {
        match self {
            Type::String | Type::Array(_) | Type::Hash(_, _) => Layout::VariableWidth,
            Type::Tuple(_) | Type::NamedTuple(_) | Type::TaggedUnion(_) | Type::Proc(_, _) => {
                Layout::FixedWidth
            }
            _ => Layout::Primitive,
        }
    }

    /// Whether values live in a ref-counted block
    #[inline]
    pub fn is_ref_counted(&self) -> bool {
        self.layout() != Layout::Primitive
    }

    /// Bytes of the type's own payload
    pub fn memsize(&self) -> usize {
        match self {
            Type::Nil => 0,
            Type::Bool | Type::Int8 | Type::UInt8 => 1,
            Type::Int16 | Type::UInt16 => 2,
            Type::Int32 | Type::UInt32 | Type::Float32 | Type::Symbol(_) => 4,
            Type::Int64 | Type::UInt64 | Type::Float64 | Type::Time => 8,
            Type::String | Type::Array(_) | Type::Hash(_, _) => 8,
            Type::Tuple(children) => children.iter().map(|c| c.refsize()).sum(),
            Type::NamedTuple(fields) => fields.iter().map(|(_, c)| c.refsize()).sum(),
            Type::TaggedUnion(members) => {
                1 + members.iter().map(|m| m.refsize()).max().unwrap_or(0)
            }
            Type::Proc(_, _) => 16,
        }
    }

    /// Bytes occupied when referenced from a container
    #[inline]
    pub fn refsize(&self) -> usize {
        if self.is_ref_counted() {
            8
        } else {
            self.memsize()
        }
    }

    /// Size of the block a value of this type lives in
    pub fn block_size(&self) -> Option<usize> {
        match self.layout() {
            Layout::Primitive => None,
            Layout::VariableWidth => Some(crate::memory::VAR_HEADER_SIZE),
            Layout::FixedWidth => Some(crate::memory::PAYLOAD_OFFSET + self.memsize()),
        }
    }

    /// Child descriptors of a composite, in storage order
    pub fn inner_types(&self) -> Vec<TypeRef> {
        match self {
            Type::Array(inner) => vec![inner.clone()],
            Type::Hash(key, value) => vec![key.clone(), value.clone()],
            Type::Tuple(children) => children.clone(),
            Type::NamedTuple(fields) => fields.iter().map(|(_, t)| t.clone()).collect(),
            Type::TaggedUnion(members) => members.clone(),
            Type::Proc(args, ret) => {
                let mut all = args.clone();
                all.push(ret.clone());
                all
            }
            _ => Vec::new(),
        }
    }

    /// Field names of a NamedTuple
    pub fn inner_keys(&self) -> Vec<&str> {
        match self {
            Type::NamedTuple(fields) => fields.iter().map(|(n, _)| n.as_str()).collect(),
            _ => Vec::new(),
        }
    }

    /// Offsets of inline children (Tuple, NamedTuple, Proc arguments)
    pub fn field_offsets(children: &[TypeRef]) -> Vec<usize> {
        let mut offset = 0;
        children
            .iter()
            .map(|child| {
                let at = offset;
                offset += child.refsize();
                at
            })
            .collect()
    }

    /// Index of `name` in a Symbol's declared list
    pub fn symbol_index(&self, name: &str) -> Option<u32> {
        match self {
            Type::Symbol(names) => names.iter().position(|n| n == name).map(|i| i as u32),
            _ => None,
        }
    }

    /// Short name used in error messages
    pub fn name(&self) -> String {
        self.to_string()
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[TypeRef]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Nil => write!(f, "Nil"),
            Type::Bool => write!(f, "Bool"),
            Type::Int8 => write!(f, "Int8"),
            Type::Int16 => write!(f, "Int16"),
            Type::Int32 => write!(f, "Int32"),
            Type::Int64 => write!(f, "Int64"),
            Type::UInt8 => write!(f, "UInt8"),
            Type::UInt16 => write!(f, "UInt16"),
            Type::UInt32 => write!(f, "UInt32"),
            Type::UInt64 => write!(f, "UInt64"),
            Type::Float32 => write!(f, "Float32"),
            Type::Float64 => write!(f, "Float64"),
            Type::Time => write!(f, "Time"),
            Type::Symbol(names) => write!(f, "Symbol({})", names.join(" | ")),
            Type::String => write!(f, "String"),
            Type::Array(inner) => write!(f, "Array({})", inner),
            Type::Hash(key, value) => write!(f, "Hash({}, {})", key, value),
            Type::Tuple(children) => {
                write!(f, "Tuple(")?;
                write_list(f, children)?;
                write!(f, ")")
            }
            Type::NamedTuple(fields) => {
                write!(f, "NamedTuple(")?;
                for (i, (name, ty)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", name, ty)?;
                }
                write!(f, ")")
            }
            Type::TaggedUnion(members) => {
                for (i, member) in members.iter().enumerate() {
                    if i > 0 {
                        write!(f, " | ")?;
                    }
                    write!(f, "{}", member)?;
                }
                Ok(())
            }
            Type::Proc(args, ret) => {
                write!(f, "Proc(")?;
                for arg in args {
                    write!(f, "{}, ", arg)?;
                }
                write!(f, "{})", ret)
            }
        }
    }
}

impl BitOr for Type {
    type Output = Type;

    fn bitor(self, rhs: Type) -> Type {
        Arc::try_unwrap(Type::union(vec![self.into_ref(), rhs.into_ref()]))
            .unwrap_or_else(|shared| (*shared).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_sizes() {
        assert_eq!(Type::Nil.memsize(), 0);
        assert_eq!(Type::Bool.memsize(), 1);
        assert_eq!(Type::UInt16.memsize(), 2);
        assert_eq!(Type::Float32.memsize(), 4);
        assert_eq!(Type::Time.memsize(), 8);
        assert_eq!(Type::Int64.refsize(), 8);
        assert_eq!(Type::Int32.block_size(), None);
    }

    #[test]
    fn test_composite_sizes() {
        let tuple = Type::tuple(vec![Type::Int32.into_ref(), Type::Bool.into_ref(), Type::String.into_ref()]);
        assert_eq!(tuple.memsize(), 4 + 1 + 8);
        assert_eq!(tuple.refsize(), 8);
        assert_eq!(tuple.block_size(), Some(17));

        let union = Type::union(vec![Type::Bool.into_ref(), Type::Int64.into_ref()]);
        assert_eq!(union.memsize(), 9);

        let array = Type::array(Type::Int8.into_ref());
        assert_eq!(array.memsize(), 8);
        assert_eq!(array.block_size(), Some(16));

        let proc = Type::proc(vec![Type::Int32.into_ref()], Type::Int32.into_ref());
        assert_eq!(proc.block_size(), Some(20));
    }

    #[test]
    fn test_field_offsets() {
        let children = vec![Type::Int8.into_ref(), Type::String.into_ref(), Type::Int32.into_ref()];
        assert_eq!(Type::field_offsets(&children), vec![0, 1, 9]);
    }

    #[test]
    fn test_union_flattens() {
        let inner = Type::Int32 | Type::Bool;
        let outer = inner | Type::Int32 | Type::String;
        assert_eq!(
            outer,
            Type::TaggedUnion(vec![Type::Int32.into_ref(), Type::Bool.into_ref(), Type::String.into_ref()])
        );
        assert_eq!(outer.to_string(), "Int32 | Bool | String");
    }

    #[test]
    fn test_display() {
        let ty = Type::hash(Type::String.into_ref(), Type::array(Type::Float64.into_ref()));
        assert_eq!(ty.to_string(), "Hash(String, Array(Float64))");

        let named = Type::named_tuple(vec![("id", Type::Int32.into_ref()), ("name", Type::String.into_ref())]);
        assert_eq!(named.to_string(), "NamedTuple(id: Int32, name: String)");
        assert_eq!(named.inner_keys(), vec!["id", "name"]);
    }

    #[test]
    fn test_symbol_index() {
        let sym = Type::symbol(["red", "green"]);
        assert_eq!(sym.symbol_index("green"), Some(1));
        assert_eq!(sym.symbol_index("blue"), None);
    }
}
