//! Reading and writing values in shared memory
//!
//! A *slot* is the `refsize` bytes a container reserves for one element:
//! the scalar itself for primitives, a block pointer otherwise. Writing a slot
//! takes a reference for the slot; releasing a block drops every reference
//! its slots hold.

use super::cast::Cast;
use super::proc::{proc_trampoline, ProcFn};
use super::raw::{secs_to_time, RawValue};
use super::{Layout, Type, TypeRef, Value};
use crate::memory::{read_ptr, write_ptr, BlockPtr, Heap};
use std::ptr::{self, NonNull};

/// How far decoding follows block pointers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Depth {
    /// Children become shared [`RawValue::Ref`] handles
    Shallow,
    /// Children are decoded recursively into plain values
    Deep,
}

fn array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

/// Address of the function every host closure block points at
pub(crate) fn trampoline_address() -> usize {
    proc_trampoline as ProcFn as usize
}

/// Decode a primitive from its native bytes
pub(crate) fn decode_scalar(ty: &Type, bytes: &[u8]) -> RawValue {
    match ty {
        Type::Nil => RawValue::Nil,
        Type::Bool => RawValue::Bool(bytes[0] != 0),
        Type::Int8 => RawValue::Int(i8::from_ne_bytes(array(bytes)) as i64),
        Type::Int16 => RawValue::Int(i16::from_ne_bytes(array(bytes)) as i64),
        Type::Int32 => RawValue::Int(i32::from_ne_bytes(array(bytes)) as i64),
        Type::Int64 => RawValue::Int(i64::from_ne_bytes(array(bytes))),
        Type::UInt8 => RawValue::Int(bytes[0] as i64),
        Type::UInt16 => RawValue::Int(u16::from_ne_bytes(array(bytes)) as i64),
        Type::UInt32 => RawValue::Int(u32::from_ne_bytes(array(bytes)) as i64),
        Type::UInt64 => RawValue::UInt(u64::from_ne_bytes(array(bytes))),
        Type::Float32 => RawValue::Float(f32::from_ne_bytes(array(bytes)) as f64),
        Type::Float64 => RawValue::Float(f64::from_ne_bytes(array(bytes))),
        Type::Time => RawValue::Time(secs_to_time(f64::from_ne_bytes(array(bytes)))),
        Type::Symbol(names) => {
            let index = u32::from_ne_bytes(array(bytes));
            match names.get(index as usize) {
                Some(name) => RawValue::Symbol(name.clone()),
                None => {
                    log::warn!("symbol index {} out of range for {}", index, ty);
                    RawValue::Int(index as i64)
                }
            }
        }
        _ => RawValue::Nil,
    }
}

/// Allocate and fill a fresh block (count 1)
///
/// # Safety
///
/// `cast` must have been produced by casting to `ty`.
pub(crate) unsafe fn alloc_block(ty: &TypeRef, cast: Cast) -> BlockPtr {
    let size = match ty.layout() {
        Layout::VariableWidth => crate::memory::VAR_HEADER_SIZE,
        _ => crate::memory::PAYLOAD_OFFSET + ty.memsize(),
    };
    let block = BlockPtr::allocate(size);
    copy_to(ty, block, cast);
    block
}

/// Write one element into `slot`, releasing whatever the slot held
///
/// # Safety
///
/// `slot` must be valid for `ty.refsize()` bytes and hold either zeroes or a
/// live reference of type `ty`.
pub(crate) unsafe fn write_single(ty: &TypeRef, slot: *mut u8, cast: Cast) {
    if !ty.is_ref_counted() {
        match cast {
            Cast::Scalar(bytes) => ptr::copy_nonoverlapping(bytes.as_ptr(), slot, ty.memsize()),
            _ => log::error!("non-scalar value written to a {} slot", ty),
        }
        return;
    }

    let block = match cast {
        Cast::Shared(value) => match value.block() {
            Some(block) => {
                block.retain();
                block
            }
            None => {
                log::error!("shared value of type {} has no block", value.ty());
                return;
            }
        },
        other => alloc_block(ty, other),
    };

    let old = read_ptr(slot);
    write_ptr(slot, block.as_ptr());
    if let Some(old) = BlockPtr::from_raw(old) {
        release(ty, old);
    }
}

/// Write inline children starting at `base`
unsafe fn write_inline(children: &[TypeRef], base: *mut u8, items: Vec<Cast>) {
    let offsets = Type::field_offsets(children);
    for ((child, offset), item) in children.iter().zip(offsets).zip(items) {
        write_single(child, base.add(offset), item);
    }
}

/// Copy a cast value into a block's (zeroed) payload
unsafe fn copy_to(ty: &TypeRef, block: BlockPtr, cast: Cast) {
    let heap = Heap::global();
    match (&**ty, cast) {
        (Type::String, Cast::Bytes(bytes)) => {
            let data = heap.malloc(bytes.len());
            ptr::copy_nonoverlapping(bytes.as_ptr(), data.as_ptr(), bytes.len());
            block.set_size(bytes.len() as u32);
            block.set_data(data.as_ptr());
        }
        (Type::Array(inner), Cast::List(items)) => {
            let rs = inner.refsize();
            let count = items.len();
            let data = heap.malloc(count * rs);
            for (i, item) in items.into_iter().enumerate() {
                write_single(inner, data.as_ptr().add(i * rs), item);
            }
            block.set_size(count as u32);
            block.set_data(data.as_ptr());
        }
        (Type::Hash(key_ty, value_ty), Cast::Pairs(pairs)) => {
            let (krs, vrs) = (key_ty.refsize(), value_ty.refsize());
            let count = pairs.len();
            let data = heap.malloc(count * (krs + vrs));
            let values = data.as_ptr().add(count * krs);
            for (i, (key, value)) in pairs.into_iter().enumerate() {
                write_single(key_ty, data.as_ptr().add(i * krs), key);
                write_single(value_ty, values.add(i * vrs), value);
            }
            block.set_size(count as u32);
            block.set_data(data.as_ptr());
        }
        (Type::Tuple(children), Cast::List(items)) => {
            write_inline(children, block.payload(), items);
        }
        (Type::NamedTuple(fields), Cast::List(items)) => {
            let children: Vec<TypeRef> = fields.iter().map(|(_, t)| t.clone()).collect();
            write_inline(&children, block.payload(), items);
        }
        (Type::TaggedUnion(members), Cast::Variant(index, inner)) => {
            *block.payload() = index;
            match members.get(index as usize) {
                Some(member) => write_single(member, block.payload().add(1), *inner),
                None => log::error!("union member {} out of range for {}", index, ty),
            }
        }
        (Type::Proc(args, ret), Cast::Proc(callable)) => {
            let ctx = heap.procs().register(callable, args.clone(), ret.clone());
            write_ptr(block.payload(), trampoline_address() as *const u8);
            write_ptr(block.payload().add(8), ctx as *const u8);
        }
        _ => log::error!("cast shape does not match {}", ty),
    }
}

/// Replace a block's contents in place, keeping its identity
///
/// # Safety
///
/// `block` must be a live block of type `ty`.
pub(crate) unsafe fn overwrite(ty: &TypeRef, block: BlockPtr, cast: Cast) {
    release_children(ty, block);
    if ty.layout() == Layout::FixedWidth {
        ptr::write_bytes(block.payload(), 0, ty.memsize());
    }
    copy_to(ty, block, cast);
}

/// Visit the slot address of every child a block holds
///
/// # Safety
///
/// `block` must be a live block of type `ty`.
pub(crate) unsafe fn each_child_address(
    ty: &TypeRef,
    block: BlockPtr,
    f: &mut dyn FnMut(&TypeRef, *mut u8),
) {
    match &**ty {
        Type::Array(inner) => {
            let data = block.data();
            if data.is_null() {
                return;
            }
            let rs = inner.refsize();
            for i in 0..block.size() as usize {
                f(inner, data.add(i * rs));
            }
        }
        Type::Hash(key_ty, value_ty) => {
            let data = block.data();
            if data.is_null() {
                return;
            }
            let count = block.size() as usize;
            let (krs, vrs) = (key_ty.refsize(), value_ty.refsize());
            for i in 0..count {
                f(key_ty, data.add(i * krs));
            }
            let values = data.add(count * krs);
            for i in 0..count {
                f(value_ty, values.add(i * vrs));
            }
        }
        Type::Tuple(children) => {
            for (child, offset) in children.iter().zip(Type::field_offsets(children)) {
                f(child, block.payload().add(offset));
            }
        }
        Type::NamedTuple(fields) => {
            let children: Vec<TypeRef> = fields.iter().map(|(_, t)| t.clone()).collect();
            for (child, offset) in children.iter().zip(Type::field_offsets(&children)) {
                f(child, block.payload().add(offset));
            }
        }
        Type::TaggedUnion(members) => {
            let index = *block.payload() as usize;
            if let Some(member) = members.get(index) {
                f(member, block.payload().add(1));
            }
        }
        _ => {}
    }
}

/// Drop every reference a block holds without freeing the block
///
/// # Safety
///
/// `block` must be a live block of type `ty`.
pub(crate) unsafe fn release_children(ty: &TypeRef, block: BlockPtr) {
    each_child_address(ty, block, &mut |child_ty, slot| {
        if child_ty.is_ref_counted() {
            if let Some(child) = BlockPtr::from_raw(read_ptr(slot)) {
                write_ptr(slot, ptr::null());
                release(child_ty, child);
            }
        }
    });

    match &**ty {
        Type::String | Type::Array(_) | Type::Hash(_, _) => {
            if let Some(data) = NonNull::new(block.data()) {
                Heap::global().free(data);
            }
            block.set_data(ptr::null());
            block.set_size(0);
        }
        Type::Proc(_, _) => {
            if read_ptr(block.payload()) as usize == trampoline_address() {
                let ctx = read_ptr(block.payload().add(8)) as usize;
                Heap::global().procs().unregister(ctx);
            }
        }
        _ => {}
    }
}

/// Drop one reference, freeing the block and its children at zero
///
/// # Safety
///
/// The caller must own the reference being dropped.
pub(crate) unsafe fn release(ty: &TypeRef, block: BlockPtr) {
    if block.decrement() == Some(0) {
        release_children(ty, block);
        block.free();
    }
}

/// Copy a block and everything it references, keeping union discriminants
///
/// Foreign procs are shared (retained), host closures get a fresh registry
/// entry.
///
/// # Safety
///
/// `block` must be a live block of type `ty`.
pub(crate) unsafe fn deep_copy(ty: &TypeRef, block: BlockPtr) -> BlockPtr {
    let heap = Heap::global();
    let copy = match &**ty {
        Type::String | Type::Array(_) | Type::Hash(_, _) => {
            let copy = BlockPtr::allocate(crate::memory::VAR_HEADER_SIZE);
            let count = block.size() as usize;
            let width = match &**ty {
                Type::Array(inner) => inner.refsize(),
                Type::Hash(key_ty, value_ty) => key_ty.refsize() + value_ty.refsize(),
                _ => 1,
            };
            let src = block.data();
            if !src.is_null() && count * width > 0 {
                let data = heap.malloc(count * width);
                ptr::copy_nonoverlapping(src, data.as_ptr(), count * width);
                copy.set_data(data.as_ptr());
            }
            copy.set_size(count as u32);
            copy
        }
        Type::Proc(args, ret) => {
            if read_ptr(block.payload()) as usize != trampoline_address() {
                block.retain();
                return block;
            }
            let copy = BlockPtr::allocate(crate::memory::PAYLOAD_OFFSET + ty.memsize());
            let ctx = read_ptr(block.payload().add(8)) as usize;
            if let Some(entry) = heap.procs().get(ctx) {
                let fresh = heap.procs().register(entry.callable.clone(), args.clone(), ret.clone());
                write_ptr(copy.payload(), trampoline_address() as *const u8);
                write_ptr(copy.payload().add(8), fresh as *const u8);
            } else {
                log::warn!("host closure context {:#x} is not registered", ctx);
            }
            return copy;
        }
        _ => {
            let copy = BlockPtr::allocate(crate::memory::PAYLOAD_OFFSET + ty.memsize());
            ptr::copy_nonoverlapping(block.payload(), copy.payload(), ty.memsize());
            copy
        }
    };

    // the raw copy still points at the source's children
    each_child_address(ty, copy, &mut |child_ty, slot| {
        if child_ty.is_ref_counted() {
            if let Some(child) = BlockPtr::from_raw(read_ptr(slot)) {
                write_ptr(slot, deep_copy(child_ty, child).as_ptr());
            }
        }
    });
    copy
}

/// Decode the element stored in `slot`
///
/// # Safety
///
/// `slot` must be valid for `ty.refsize()` bytes.
pub(crate) unsafe fn fetch_single(ty: &TypeRef, slot: *const u8, depth: Depth) -> RawValue {
    if !ty.is_ref_counted() {
        let bytes = std::slice::from_raw_parts(slot, ty.memsize());
        return decode_scalar(ty, bytes);
    }
    match BlockPtr::from_raw(read_ptr(slot)) {
        None => RawValue::Nil,
        Some(block) => match depth {
            Depth::Shallow => RawValue::Ref(Value::from_block_shared(ty.clone(), block)),
            Depth::Deep => decode_block(ty, block, Depth::Deep),
        },
    }
}

/// Decode `count` consecutive elements, bulk-reading primitives
///
/// # Safety
///
/// `data` must be valid for `count * ty.refsize()` bytes (or null when
/// `count` is zero).
pub(crate) unsafe fn fetch_multi(
    ty: &TypeRef,
    data: *const u8,
    count: usize,
    depth: Depth,
) -> Vec<RawValue> {
    if count == 0 || data.is_null() {
        return Vec::new();
    }
    if !ty.is_ref_counted() {
        let width = ty.memsize();
        if width == 0 {
            return vec![RawValue::Nil; count];
        }
        let bytes = std::slice::from_raw_parts(data, count * width);
        return bytes
            .chunks_exact(width)
            .map(|chunk| decode_scalar(ty, chunk))
            .collect();
    }
    (0..count)
        .map(|i| fetch_single(ty, data.add(i * 8), depth))
        .collect()
}

/// Decode a whole block
///
/// # Safety
///
/// `block` must be a live block of type `ty`.
pub(crate) unsafe fn decode_block(ty: &TypeRef, block: BlockPtr, depth: Depth) -> RawValue {
    match &**ty {
        Type::String => {
            let data = block.data();
            let len = block.size() as usize;
            if data.is_null() || len == 0 {
                return RawValue::Str(String::new());
            }
            let bytes = std::slice::from_raw_parts(data, len);
            RawValue::Str(String::from_utf8_lossy(bytes).into_owned())
        }
        Type::Array(inner) => {
            RawValue::Array(fetch_multi(inner, block.data(), block.size() as usize, depth))
        }
        Type::Hash(key_ty, value_ty) => {
            let count = block.size() as usize;
            let data = block.data();
            if data.is_null() {
                return RawValue::Hash(Vec::new());
            }
            let keys = fetch_multi(key_ty, data, count, depth);
            let values = fetch_multi(value_ty, data.add(count * key_ty.refsize()), count, depth);
            RawValue::Hash(keys.into_iter().zip(values).collect())
        }
        Type::Tuple(children) => RawValue::Array(
            children
                .iter()
                .zip(Type::field_offsets(children))
                .map(|(child, offset)| fetch_single(child, block.payload().add(offset), depth))
                .collect(),
        ),
        Type::NamedTuple(fields) => {
            let children: Vec<TypeRef> = fields.iter().map(|(_, t)| t.clone()).collect();
            RawValue::Hash(
                fields
                    .iter()
                    .zip(Type::field_offsets(&children))
                    .map(|((name, child), offset)| {
                        (
                            RawValue::Symbol(name.clone()),
                            fetch_single(child, block.payload().add(offset), depth),
                        )
                    })
                    .collect(),
            )
        }
        Type::TaggedUnion(members) => {
            let index = *block.payload() as usize;
            let member = match members.get(index) {
                Some(member) => member,
                None => {
                    log::warn!("union discriminant {} out of range for {}", index, ty);
                    return RawValue::Nil;
                }
            };
            fetch_single(member, block.payload().add(1), depth)
        }
        Type::Proc(_, _) => {
            if read_ptr(block.payload()) as usize == trampoline_address() {
                let ctx = read_ptr(block.payload().add(8)) as usize;
                if let Some(entry) = Heap::global().procs().get(ctx) {
                    return RawValue::Proc(entry.callable.clone());
                }
            }
            RawValue::Ref(Value::from_block_shared(ty.clone(), block))
        }
        _ => RawValue::Nil,
    }
}
