//! Raw pointers to ref-counted blocks
//!
//! # Memory Layout
//!
//! Fixed-width block (Tuple, NamedTuple, TaggedUnion, Proc):
//!
//! ```text
//! ┌──────────────────┬──────────────────────────────┐
//! │ refcount: u32    │ inline payload (memsize)     │
//! └──────────────────┴──────────────────────────────┘
//! ```
//!
//! Variable-width block (String, Array, Hash):
//!
//! ```text
//! ┌──────────────────┬──────────────┬───────────────┐
//! │ refcount: u32    │ size: u32    │ data: *mut u8 │ ──► separate data block
//! └──────────────────┴──────────────┴───────────────┘
//! ```
//!
//! Every field is native-endian and may be unaligned.

use super::Heap;
use std::fmt;
use std::ptr::NonNull;

/// Offset of the reference count
pub const REFCOUNT_OFFSET: usize = 0;

/// Offset of the inline payload of a fixed-width block
pub const PAYLOAD_OFFSET: usize = 4;

/// Offset of the element count of a variable-width block
pub const SIZE_OFFSET: usize = 4;

/// Offset of the data pointer of a variable-width block
pub const DATA_OFFSET: usize = 8;

/// Size of a variable-width header block
pub const VAR_HEADER_SIZE: usize = 16;

/// Read a native-endian `u32` at an unaligned address
///
/// # Safety
///
/// `ptr` must be valid for 4 bytes of reads.
#[inline]
pub unsafe fn read_u32(ptr: *const u8) -> u32 {
    (ptr as *const u32).read_unaligned()
}

/// Write a native-endian `u32` at an unaligned address
///
/// # Safety
///
/// `ptr` must be valid for 4 bytes of writes.
#[inline]
pub unsafe fn write_u32(ptr: *mut u8, value: u32) {
    (ptr as *mut u32).write_unaligned(value)
}

/// Read a pointer stored at an unaligned address
///
/// # Safety
///
/// `ptr` must be valid for 8 bytes of reads.
#[inline]
pub unsafe fn read_ptr(ptr: *const u8) -> *mut u8 {
    (ptr as *const u64).read_unaligned() as usize as *mut u8
}

/// Store a pointer at an unaligned address
///
/// # Safety
///
/// `ptr` must be valid for 8 bytes of writes.
#[inline]
pub unsafe fn write_ptr(ptr: *mut u8, value: *const u8) {
    (ptr as *mut u64).write_unaligned(value as usize as u64)
}

/// Pointer to the start of a ref-counted block
///
/// `BlockPtr` does not own a count; [`crate::Value`] is the owning handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockPtr {
    ptr: NonNull<u8>,
}

impl BlockPtr {
    /// Wrap a block address
    #[inline]
    pub fn new(ptr: NonNull<u8>) -> Self {
        Self { ptr }
    }

    /// Wrap a possibly-null block address
    #[inline]
    pub fn from_raw(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(Self::new)
    }

    /// Allocate a zeroed block of `size` bytes with a count of 1
    pub fn allocate(size: usize) -> Self {
        let block = Self::new(Heap::global().malloc(size.max(PAYLOAD_OFFSET)));
        unsafe { block.set_ref_count(1) };
        block
    }

    /// Raw block address
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Block address as an integer
    #[inline]
    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Current count, read without taking the mutex
    ///
    /// # Safety
    ///
    /// The block must still be live.
    #[inline]
    pub unsafe fn ref_count(&self) -> u32 {
        read_u32(self.as_ptr().add(REFCOUNT_OFFSET))
    }

    /// # Safety
    ///
    /// The block must still be live and the caller must hold the arc mutex
    /// (or own the only reference).
    #[inline]
    pub unsafe fn set_ref_count(&self, count: u32) {
        write_u32(self.as_ptr().add(REFCOUNT_OFFSET), count)
    }

    /// Increment the count under the arc mutex
    ///
    /// # Safety
    ///
    /// The block must still be live.
    pub unsafe fn retain(&self) {
        let _guard = Heap::global().arc_mutex().lock();
        self.set_ref_count(self.ref_count().wrapping_add(1));
    }

    /// Decrement the count under the arc mutex, returning the new count
    ///
    /// Returns `None` (and leaves the block alone) when the count is already
    /// zero.
    ///
    /// # Safety
    ///
    /// The block must still be live.
    pub unsafe fn decrement(&self) -> Option<u32> {
        let _guard = Heap::global().arc_mutex().lock();
        let count = self.ref_count();
        if count == 0 {
            log::error!("refcount underflow on block {:#x}", self.address());
            return None;
        }
        self.set_ref_count(count - 1);
        Some(count - 1)
    }

    /// Start of the inline payload of a fixed-width block
    #[inline]
    pub fn payload(&self) -> *mut u8 {
        unsafe { self.as_ptr().add(PAYLOAD_OFFSET) }
    }

    /// Element count of a variable-width block
    ///
    /// # Safety
    ///
    /// The block must be a live variable-width block.
    #[inline]
    pub unsafe fn size(&self) -> u32 {
        read_u32(self.as_ptr().add(SIZE_OFFSET))
    }

    /// # Safety
    ///
    /// The block must be a live variable-width block.
    #[inline]
    pub unsafe fn set_size(&self, size: u32) {
        write_u32(self.as_ptr().add(SIZE_OFFSET), size)
    }

    /// Data block of a variable-width block (may be null when empty)
    ///
    /// # Safety
    ///
    /// The block must be a live variable-width block.
    #[inline]
    pub unsafe fn data(&self) -> *mut u8 {
        read_ptr(self.as_ptr().add(DATA_OFFSET))
    }

    /// # Safety
    ///
    /// The block must be a live variable-width block.
    #[inline]
    pub unsafe fn set_data(&self, data: *const u8) {
        write_ptr(self.as_ptr().add(DATA_OFFSET), data)
    }

    /// Free the block itself (children are the caller's responsibility)
    ///
    /// # Safety
    ///
    /// No other handle may refer to the block afterwards.
    pub unsafe fn free(self) {
        Heap::global().free(self.ptr)
    }
}

impl fmt::Debug for BlockPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockPtr({:#x})", self.address())
    }
}

impl fmt::Pointer for BlockPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.ptr, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_starts_at_one() {
        let block = BlockPtr::allocate(VAR_HEADER_SIZE);
        unsafe {
            assert_eq!(block.ref_count(), 1);
            assert_eq!(block.size(), 0);
            assert!(block.data().is_null());
            block.free();
        }
    }

    #[test]
    fn test_retain_and_decrement() {
        let block = BlockPtr::allocate(8);
        unsafe {
            block.retain();
            assert_eq!(block.ref_count(), 2);
            assert_eq!(block.decrement(), Some(1));
            assert_eq!(block.decrement(), Some(0));
            assert_eq!(block.decrement(), None);
            block.free();
        }
    }

    #[test]
    fn test_unaligned_fields() {
        let block = BlockPtr::allocate(VAR_HEADER_SIZE);
        let data = Heap::global().malloc(4);
        unsafe {
            block.set_size(7);
            block.set_data(data.as_ptr());
            assert_eq!(block.size(), 7);
            assert_eq!(block.data(), data.as_ptr());

            // Payload starts at offset 4, so 8-byte fields there are unaligned
            write_ptr(block.payload(), 0xdead_beef as *const u8);
            assert_eq!(read_ptr(block.payload()) as usize, 0xdead_beef);

            Heap::global().free(data);
            block.free();
        }
    }

    #[test]
    fn test_from_raw_null() {
        assert!(BlockPtr::from_raw(std::ptr::null_mut()).is_none());
    }
}
