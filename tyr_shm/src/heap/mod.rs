//! The shared heap: bump-allocated, cache-aligned variable-length entries.
//!
//! Every entry starts with a 64-bit header:
//!
//! ```text
//!  6                                3 3  3                                0 0
//!  3                                3 2  1                                1 0
//! +----------------------------------+-+-----------------------------------+-+
//! |            stored size           |k|         uncompressed size         |1|
//! +----------------------------------+-+-----------------------------------+-+
//! ```
//!
//! - bit 0: tag, always 1. Entries are 8-byte aligned, so a pointer written
//!   over the header has bit 0 clear; the compactor relies on that to tell
//!   live entries (first word is a back-pointer) from dead ones (first word
//!   is still a header).
//! - bits 1-31: size to decompress to; 0 when the payload is stored raw.
//! - bit 32: payload kind (serialized object vs raw byte string).
//! - bits 33-63: stored payload size in bytes.

pub mod collector;

use std::sync::atomic::Ordering;

use crate::codec::{self, OwnedValue, Payload};
use crate::error::{Result, ShmError};
use crate::region::SharedMem;

/// Heap entries are aligned (and their sizes rounded up) to this.
pub const HEAP_ALIGN: usize = 64;

/// Size of the entry header preceding the payload.
pub const HEADER_SIZE: usize = 8;

/// Payloads must fit in the 31-bit size fields.
const MAX_PAYLOAD: usize = 1 << 31;

/// Round a size up to the heap alignment.
#[inline]
pub(crate) const fn aligned_size(size: usize) -> usize {
    (size + HEAP_ALIGN - 1) & !(HEAP_ALIGN - 1)
}

/// What a heap entry's payload is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryKind {
    /// Output of the caller's serializer.
    Serialized = 0,
    /// A raw byte string.
    Bytes = 1,
}

/// The 64-bit header at the start of every heap entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader(u64);

impl EntryHeader {
    /// Build a header. Sizes must fit in 31 bits.
    pub fn new(stored_size: usize, kind: EntryKind, uncompressed_size: usize) -> Self {
        assert!(stored_size < MAX_PAYLOAD);
        assert!(uncompressed_size < MAX_PAYLOAD);
        EntryHeader(
            (stored_size as u64) << 33
                | (kind as u64) << 32
                | (uncompressed_size as u64) << 1
                | 1,
        )
    }

    /// Reinterpret a raw word as a header. The tag bit must be set.
    pub fn from_raw(raw: u64) -> Self {
        debug_assert!(raw & 1 == 1, "heap word is not a header");
        EntryHeader(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    /// Stored (possibly compressed) payload size in bytes.
    pub fn stored_size(self) -> usize {
        (self.0 >> 33) as usize
    }

    pub fn kind(self) -> EntryKind {
        if (self.0 >> 32) & 1 == 1 {
            EntryKind::Bytes
        } else {
            EntryKind::Serialized
        }
    }

    /// Size to decompress to; 0 when the payload was stored raw.
    pub fn uncompressed_size(self) -> usize {
        ((self.0 >> 1) & 0x7FFF_FFFF) as usize
    }

    /// Header plus payload, before alignment rounding.
    pub fn total_size(self) -> usize {
        HEADER_SIZE + self.stored_size()
    }
}

/// Whether a heap word is a header (vs a compaction back-pointer).
#[inline]
pub(crate) fn is_header_word(word: u64) -> bool {
    word & 1 == 1
}

/// Bump-allocate an entry and write its header. Returns the entry address.
pub(crate) fn alloc(shm: &SharedMem, header: EntryHeader) -> Result<usize> {
    // This size must stay in sync with the wasted-size accounting in remove.
    let slot_size = aligned_size(header.total_size());
    let chunk = shm.heap_top().fetch_add(slot_size as u64, Ordering::SeqCst) as usize;
    if chunk + slot_size > shm.heap_max_addr() {
        return Err(ShmError::HeapFull);
    }
    shm.commit(chunk, slot_size)?;
    unsafe { *(chunk as *mut u64) = header.raw() };
    Ok(chunk)
}

/// Compress, allocate, and copy a payload into the heap.
///
/// Returns `(entry address, bytes allocated, original payload bytes)`.
pub(crate) fn store(shm: &SharedMem, payload: Payload<'_>) -> Result<(usize, usize, usize)> {
    let (bytes, kind) = payload.parts();
    assert!(bytes.len() < MAX_PAYLOAD, "payloads are limited to under 2 GiB");
    let orig_size = bytes.len();

    let packed = codec::pack(bytes);
    let stored = packed.stored();
    let header = EntryHeader::new(stored.len(), kind, packed.uncompressed_size());

    let addr = alloc(shm, header)?;
    unsafe {
        std::ptr::copy_nonoverlapping(
            stored.as_ptr(),
            (addr + HEADER_SIZE) as *mut u8,
            stored.len(),
        );
    }
    Ok((addr, stored.len(), orig_size))
}

/// Read the entry at `addr` back out, decompressing if needed.
pub(crate) fn load(addr: usize) -> OwnedValue {
    let header = EntryHeader::from_raw(unsafe { *(addr as *const u64) });
    let stored =
        unsafe { std::slice::from_raw_parts((addr + HEADER_SIZE) as *const u8, header.stored_size()) };
    let bytes = codec::unpack(stored, header.uncompressed_size());
    match header.kind() {
        EntryKind::Bytes => OwnedValue::Bytes(bytes),
        EntryKind::Serialized => OwnedValue::Serialized(bytes),
    }
}

/// The header of the entry at `addr`.
pub(crate) fn header_at(addr: usize) -> EntryHeader {
    EntryHeader::from_raw(unsafe { *(addr as *const u64) })
}
