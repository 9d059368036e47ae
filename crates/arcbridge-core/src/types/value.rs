//! Owning handles to shared values
//!
//! A [`Value`] holds one reference: primitives are stored inline, every other
//! type points at a block in shared memory. `Clone` takes another reference to
//! the same block and `Drop` gives it back, freeing the block (and releasing
//! its children) when the last reference from either runtime goes away.

use super::cast::{cast, Cast};
use super::codec::{self, Depth};
use super::raw::RawValue;
use super::{Layout, Type, TypeRef};
use crate::memory::{read_ptr, write_ptr, BlockPtr, Heap};
use crate::{BridgeError, BridgeResult};
use std::fmt;
use std::ptr::{self, NonNull};

#[derive(Clone, Copy)]
enum Repr {
    Inline([u8; 8]),
    Block(BlockPtr),
}

/// Handle to a shared value
pub struct Value {
    ty: TypeRef,
    repr: Repr,
}

// SAFETY: every count update goes through the process-wide arc mutex, and
// blocks are plain C allocations not tied to any thread.
unsafe impl Send for Value {}
unsafe impl Sync for Value {}

fn resolve_index(index: isize, len: usize) -> BridgeResult<usize> {
    let resolved = if index < 0 { len as isize + index } else { index };
    if resolved < 0 || resolved as usize >= len {
        return Err(BridgeError::IndexOutOfBounds { index, len });
    }
    Ok(resolved as usize)
}

impl Value {
    /// Cast `raw` to `ty` and store it
    ///
    /// Reference-counted types get a fresh block with a count of 1; an
    /// existing handle of exactly `ty` is shared instead.
    pub fn new(ty: TypeRef, raw: impl Into<RawValue>) -> BridgeResult<Value> {
        let prepared = cast(&ty, &raw.into())?;
        Ok(Self::from_cast(ty, prepared))
    }

    pub(crate) fn from_cast(ty: TypeRef, prepared: Cast) -> Value {
        match prepared {
            Cast::Scalar(bytes) => Value {
                ty,
                repr: Repr::Inline(bytes),
            },
            Cast::Shared(value) => value,
            other => {
                let block = unsafe { codec::alloc_block(&ty, other) };
                Value {
                    ty,
                    repr: Repr::Block(block),
                }
            }
        }
    }

    /// The nil value
    pub fn nil() -> Value {
        Value {
            ty: Type::Nil.into_ref(),
            repr: Repr::Inline([0; 8]),
        }
    }

    pub(crate) unsafe fn from_block_shared(ty: TypeRef, block: BlockPtr) -> Value {
        block.retain();
        Value {
            ty,
            repr: Repr::Block(block),
        }
    }

    pub(crate) unsafe fn from_block_owned(ty: TypeRef, block: BlockPtr) -> Value {
        Value {
            ty,
            repr: Repr::Block(block),
        }
    }

    fn check_pointer(ty: &TypeRef, ptr: *mut u8) -> BridgeResult<BlockPtr> {
        if !ty.is_ref_counted() {
            return Err(BridgeError::TypeMismatch {
                expected: "reference-counted type".to_string(),
                found: ty.to_string(),
            });
        }
        BlockPtr::from_raw(ptr).ok_or_else(|| BridgeError::TypeMismatch {
            expected: ty.to_string(),
            found: "null pointer".to_string(),
        })
    }

    /// Wrap a block received from the foreign side, taking a new reference
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block of type `ty`.
    pub unsafe fn from_ptr(ty: TypeRef, ptr: *mut u8) -> BridgeResult<Value> {
        let block = Self::check_pointer(&ty, ptr)?;
        Ok(Self::from_block_shared(ty, block))
    }

    /// Wrap a block whose reference the foreign side transferred to us
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block of type `ty` carrying a reference the caller
    /// owns.
    pub unsafe fn from_owned_ptr(ty: TypeRef, ptr: *mut u8) -> BridgeResult<Value> {
        let block = Self::check_pointer(&ty, ptr)?;
        Ok(Self::from_block_owned(ty, block))
    }

    /// Give up this handle's reference, returning the block address
    ///
    /// Returns `None` for primitives.
    pub fn into_raw_ptr(self) -> Option<*mut u8> {
        let block = self.block()?;
        unsafe { block.retain() };
        Some(block.as_ptr())
    }

    /// Write this value into a fresh slot, taking a reference for the slot
    ///
    /// # Safety
    ///
    /// `slot` must be valid for `ty().refsize()` bytes and must not hold a
    /// reference (it is overwritten, not released).
    pub unsafe fn encode_into(&self, slot: *mut u8) {
        match self.repr {
            Repr::Inline(bytes) => ptr::copy_nonoverlapping(bytes.as_ptr(), slot, self.ty.memsize()),
            Repr::Block(block) => {
                block.retain();
                write_ptr(slot, block.as_ptr());
            }
        }
    }

    unsafe fn decode_slot(ty: TypeRef, slot: *const u8, owned: bool) -> Value {
        if !ty.is_ref_counted() {
            let mut bytes = [0u8; 8];
            ptr::copy_nonoverlapping(slot, bytes.as_mut_ptr(), ty.memsize());
            return Value {
                ty,
                repr: Repr::Inline(bytes),
            };
        }
        match BlockPtr::from_raw(read_ptr(slot)) {
            Some(block) if owned => Self::from_block_owned(ty, block),
            Some(block) => Self::from_block_shared(ty, block),
            None => Value::nil(),
        }
    }

    /// Take ownership of the element in `slot` (a call's return slot)
    ///
    /// A null block pointer decodes to nil.
    ///
    /// # Safety
    ///
    /// `slot` must be valid for `ty.refsize()` bytes and any reference in it
    /// must be transferred to the caller.
    pub unsafe fn decode_owned(ty: TypeRef, slot: *const u8) -> Value {
        Self::decode_slot(ty, slot, true)
    }

    /// Wrap the element in `slot`, taking a new reference
    ///
    /// # Safety
    ///
    /// `slot` must be valid for `ty.refsize()` bytes.
    pub unsafe fn decode_shared(ty: TypeRef, slot: *const u8) -> Value {
        Self::decode_slot(ty, slot, false)
    }

    /// The value's type
    pub fn ty(&self) -> &TypeRef {
        &self.ty
    }

    /// Whether this is the nil value
    pub fn is_nil(&self) -> bool {
        *self.ty == Type::Nil
    }

    pub(crate) fn block(&self) -> Option<BlockPtr> {
        match self.repr {
            Repr::Block(block) => Some(block),
            Repr::Inline(_) => None,
        }
    }

    /// Current reference count (`None` for primitives)
    pub fn ref_count(&self) -> Option<u32> {
        self.block().map(|block| unsafe { block.ref_count() })
    }

    /// Block address (`None` for primitives)
    pub fn address(&self) -> Option<usize> {
        self.block().map(|block| block.address())
    }

    /// Address of the contents: the data block of a variable-width value or
    /// the inline payload of a fixed-width one
    pub fn data_address(&self) -> Option<usize> {
        let block = self.block()?;
        match self.ty.layout() {
            Layout::VariableWidth => Some(unsafe { block.data() } as usize),
            _ => Some(block.payload() as usize),
        }
    }

    /// Decode the contents, sharing reference-counted children
    pub fn get(&self) -> RawValue {
        match self.repr {
            Repr::Inline(bytes) => codec::decode_scalar(&self.ty, &bytes),
            Repr::Block(block) => unsafe { codec::decode_block(&self.ty, block, Depth::Shallow) },
        }
    }

    /// Decode the contents recursively into plain host values
    pub fn to_native(&self) -> RawValue {
        match self.repr {
            Repr::Inline(bytes) => codec::decode_scalar(&self.ty, &bytes),
            Repr::Block(block) => unsafe { codec::decode_block(&self.ty, block, Depth::Deep) },
        }
    }

    /// Replace the contents in place
    ///
    /// The block keeps its address, so every holder of a reference sees the
    /// new contents.
    pub fn set(&mut self, raw: impl Into<RawValue>) -> BridgeResult<()> {
        let prepared = cast(&self.ty, &raw.into())?;
        let block = match self.repr {
            Repr::Inline(_) => {
                return match prepared {
                    Cast::Scalar(bytes) => {
                        self.repr = Repr::Inline(bytes);
                        Ok(())
                    }
                    _ => Err(self.mismatch("primitive value")),
                };
            }
            Repr::Block(block) => block,
        };
        match prepared {
            Cast::Shared(other) => {
                if other.address() == Some(block.address()) {
                    return Ok(());
                }
                let copied = cast(&self.ty, &other.get())?;
                unsafe { codec::overwrite(&self.ty, block, copied) };
            }
            prepared => unsafe { codec::overwrite(&self.ty, block, prepared) },
        }
        Ok(())
    }

    /// Another handle to the same block
    pub fn dup(&self) -> Value {
        self.clone()
    }

    /// Recursive copy sharing no memory with `self`
    ///
    /// Procs created on the foreign side are shared, not copied.
    pub fn deep_dup(&self) -> BridgeResult<Value> {
        match self.repr {
            Repr::Inline(_) => Ok(self.clone()),
            Repr::Block(block) => {
                let copy = unsafe { codec::deep_copy(&self.ty, block) };
                Ok(unsafe { Value::from_block_owned(self.ty.clone(), copy) })
            }
        }
    }

    fn mismatch(&self, expected: &str) -> BridgeError {
        BridgeError::TypeMismatch {
            expected: expected.to_string(),
            found: self.ty.to_string(),
        }
    }

    /// Element count of String (bytes), Array and Hash; arity of tuples
    pub fn len(&self) -> BridgeResult<usize> {
        match (&*self.ty, self.block()) {
            (Type::String | Type::Array(_) | Type::Hash(_, _), Some(block)) => {
                Ok(unsafe { block.size() } as usize)
            }
            (Type::Tuple(children), _) => Ok(children.len()),
            (Type::NamedTuple(fields), _) => Ok(fields.len()),
            _ => Err(self.mismatch("String, Array, Hash, Tuple or NamedTuple")),
        }
    }

    /// Whether [`Value::len`] is zero
    pub fn is_empty(&self) -> BridgeResult<bool> {
        Ok(self.len()? == 0)
    }

    fn element_slot(&self, index: isize) -> BridgeResult<(TypeRef, *mut u8)> {
        match (&*self.ty, self.block()) {
            (Type::Array(inner), Some(block)) => unsafe {
                let i = resolve_index(index, block.size() as usize)?;
                Ok((inner.clone(), block.data().add(i * inner.refsize())))
            },
            (Type::Tuple(children), Some(block)) => {
                let i = resolve_index(index, children.len())?;
                let offset = Type::field_offsets(children)[i];
                Ok((children[i].clone(), unsafe { block.payload().add(offset) }))
            }
            _ => Err(self.mismatch("Array or Tuple")),
        }
    }

    /// Element at `index` (negative counts from the end)
    pub fn at(&self, index: isize) -> BridgeResult<RawValue> {
        let (ty, slot) = self.element_slot(index)?;
        Ok(unsafe { codec::fetch_single(&ty, slot, Depth::Shallow) })
    }

    /// Overwrite the element at `index`, releasing the one it replaces
    pub fn set_at(&self, index: isize, raw: impl Into<RawValue>) -> BridgeResult<()> {
        let (ty, slot) = self.element_slot(index)?;
        let prepared = cast(&ty, &raw.into())?;
        unsafe { codec::write_single(&ty, slot, prepared) };
        Ok(())
    }

    /// Append to an Array
    pub fn push(&self, raw: impl Into<RawValue>) -> BridgeResult<()> {
        let (inner, block) = match (&*self.ty, self.block()) {
            (Type::Array(inner), Some(block)) => (inner.clone(), block),
            _ => return Err(self.mismatch("Array")),
        };
        let prepared = cast(&inner, &raw.into())?;
        let heap = Heap::global();
        unsafe {
            let count = block.size() as usize;
            let rs = inner.refsize();
            let old = block.data();
            let data = heap.malloc((count + 1) * rs);
            if !old.is_null() {
                ptr::copy_nonoverlapping(old, data.as_ptr(), count * rs);
            }
            codec::write_single(&inner, data.as_ptr().add(count * rs), prepared);
            block.set_data(data.as_ptr());
            block.set_size((count + 1) as u32);
            if let Some(old) = NonNull::new(old) {
                heap.free(old);
            }
        }
        Ok(())
    }

    /// Every element of an Array or Tuple
    pub fn elements(&self) -> BridgeResult<Vec<RawValue>> {
        match (&*self.ty, self.get()) {
            (Type::Array(_) | Type::Tuple(_), RawValue::Array(items)) => Ok(items),
            _ => Err(self.mismatch("Array or Tuple")),
        }
    }

    fn hash_parts(&self) -> BridgeResult<(TypeRef, TypeRef, BlockPtr)> {
        match (&*self.ty, self.block()) {
            (Type::Hash(key_ty, value_ty), Some(block)) => {
                Ok((key_ty.clone(), value_ty.clone(), block))
            }
            _ => Err(self.mismatch("Hash")),
        }
    }

    /// Linear search for `key` in a Hash
    unsafe fn find_key(key_ty: &TypeRef, block: BlockPtr, key: &RawValue) -> BridgeResult<Option<usize>> {
        let prepared = cast(key_ty, key)?;
        let data = block.data();
        if data.is_null() {
            return Ok(None);
        }
        let krs = key_ty.refsize();
        for i in 0..block.size() as usize {
            let slot = data.add(i * krs);
            let hit = match &prepared {
                Cast::Scalar(bytes) => std::slice::from_raw_parts(slot, krs) == &bytes[..krs],
                Cast::Shared(value) if value.address() == Some(read_ptr(slot) as usize) => true,
                _ => codec::fetch_single(key_ty, slot, Depth::Shallow) == *key,
            };
            if hit {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    /// Value stored under `key` in a Hash
    pub fn lookup(&self, key: impl Into<RawValue>) -> BridgeResult<Option<RawValue>> {
        let (key_ty, value_ty, block) = self.hash_parts()?;
        let key = key.into();
        unsafe {
            let found = Self::find_key(&key_ty, block, &key)?;
            Ok(found.map(|i| {
                let count = block.size() as usize;
                let values = block.data().add(count * key_ty.refsize());
                codec::fetch_single(&value_ty, values.add(i * value_ty.refsize()), Depth::Shallow)
            }))
        }
    }

    /// Insert or overwrite a Hash entry
    pub fn insert(&self, key: impl Into<RawValue>, value: impl Into<RawValue>) -> BridgeResult<()> {
        let (key_ty, value_ty, block) = self.hash_parts()?;
        let key = key.into();
        let value_cast = cast(&value_ty, &value.into())?;
        let (krs, vrs) = (key_ty.refsize(), value_ty.refsize());
        let heap = Heap::global();

        unsafe {
            let count = block.size() as usize;
            let old = block.data();
            if let Some(i) = Self::find_key(&key_ty, block, &key)? {
                codec::write_single(&value_ty, old.add(count * krs + i * vrs), value_cast);
                return Ok(());
            }

            let key_cast = cast(&key_ty, &key)?;
            let data = heap.malloc((count + 1) * (krs + vrs)).as_ptr();
            if !old.is_null() {
                ptr::copy_nonoverlapping(old, data, count * krs);
                ptr::copy_nonoverlapping(old.add(count * krs), data.add((count + 1) * krs), count * vrs);
            }
            codec::write_single(&key_ty, data.add(count * krs), key_cast);
            codec::write_single(&value_ty, data.add((count + 1) * krs + count * vrs), value_cast);
            block.set_data(data);
            block.set_size((count + 1) as u32);
            if let Some(old) = NonNull::new(old) {
                heap.free(old);
            }
        }
        Ok(())
    }

    /// Keys of a Hash, in storage order
    pub fn keys(&self) -> BridgeResult<Vec<RawValue>> {
        let (key_ty, _, block) = self.hash_parts()?;
        Ok(unsafe { codec::fetch_multi(&key_ty, block.data(), block.size() as usize, Depth::Shallow) })
    }

    /// Values of a Hash, in storage order
    pub fn values(&self) -> BridgeResult<Vec<RawValue>> {
        let (key_ty, value_ty, block) = self.hash_parts()?;
        unsafe {
            let count = block.size() as usize;
            let data = block.data();
            if data.is_null() {
                return Ok(Vec::new());
            }
            Ok(codec::fetch_multi(&value_ty, data.add(count * key_ty.refsize()), count, Depth::Shallow))
        }
    }

    fn field_slot(&self, name: &str) -> BridgeResult<(TypeRef, *mut u8)> {
        let (fields, block) = match (&*self.ty, self.block()) {
            (Type::NamedTuple(fields), Some(block)) => (fields, block),
            _ => return Err(self.mismatch("NamedTuple")),
        };
        let index = fields
            .iter()
            .position(|(field, _)| field == name)
            .ok_or_else(|| BridgeError::NoSuchField(name.to_string()))?;
        let children: Vec<TypeRef> = fields.iter().map(|(_, t)| t.clone()).collect();
        let offset = Type::field_offsets(&children)[index];
        Ok((children[index].clone(), unsafe { block.payload().add(offset) }))
    }

    /// Field of a NamedTuple
    pub fn field(&self, name: &str) -> BridgeResult<RawValue> {
        let (ty, slot) = self.field_slot(name)?;
        Ok(unsafe { codec::fetch_single(&ty, slot, Depth::Shallow) })
    }

    /// Overwrite a field of a NamedTuple
    pub fn set_field(&self, name: &str, raw: impl Into<RawValue>) -> BridgeResult<()> {
        let (ty, slot) = self.field_slot(name)?;
        let prepared = cast(&ty, &raw.into())?;
        unsafe { codec::write_single(&ty, slot, prepared) };
        Ok(())
    }

    /// Index of the member a TaggedUnion currently holds
    pub fn variant_index(&self) -> BridgeResult<usize> {
        match (&*self.ty, self.block()) {
            (Type::TaggedUnion(_), Some(block)) => Ok(unsafe { *block.payload() } as usize),
            _ => Err(self.mismatch("TaggedUnion")),
        }
    }

    /// Member type a TaggedUnion currently holds
    pub fn variant_type(&self) -> BridgeResult<TypeRef> {
        let index = self.variant_index()?;
        match &*self.ty {
            Type::TaggedUnion(members) => members
                .get(index)
                .cloned()
                .ok_or(BridgeError::IndexOutOfBounds {
                    index: index as isize,
                    len: members.len(),
                }),
            _ => Err(self.mismatch("TaggedUnion")),
        }
    }
}

impl Clone for Value {
    fn clone(&self) -> Self {
        if let Repr::Block(block) = self.repr {
            unsafe { block.retain() };
        }
        Value {
            ty: self.ty.clone(),
            repr: self.repr,
        }
    }
}

impl Drop for Value {
    fn drop(&mut self) {
        if let Repr::Block(block) = self.repr {
            unsafe { codec::release(&self.ty, block) };
        }
    }
}

impl PartialEq<RawValue> for Value {
    fn eq(&self, other: &RawValue) -> bool {
        self.get() == *other
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.repr {
            Repr::Inline(bytes) => write!(
                f,
                "Value({}: {:?})",
                self.ty,
                codec::decode_scalar(&self.ty, &bytes)
            ),
            Repr::Block(block) => write!(
                f,
                "Value({} @ {:#x}, rc={})",
                self.ty,
                block.address(),
                unsafe { block.ref_count() }
            ),
        }
    }
}
