//! Payload encoding for heap entries.
//!
//! Byte-string payloads are copied into the heap as-is; anything else goes
//! through a caller-supplied [`ValueCodec`] first. Either way the payload is
//! LZ4-compressed when that is strictly smaller than the original - tiny
//! inputs can grow under LZ4, and those are stored raw.

use crate::heap::EntryKind;

/// The serializer/deserializer pair a caller provides for non-byte values.
///
/// The pair must round-trip: `decode(encode(v))` is `v` for every value the
/// caller stores.
pub trait ValueCodec {
    /// The value type this codec handles.
    type Value;

    /// Encode a value into a fresh byte buffer.
    fn encode(&self, value: &Self::Value) -> Vec<u8>;

    /// Decode a value from the bytes `encode` produced.
    fn decode(&self, bytes: &[u8]) -> Self::Value;
}

/// A payload handed to the content table for insertion.
#[derive(Debug, Clone, Copy)]
pub enum Payload<'a> {
    /// A plain byte string, stored without a serialization step.
    Bytes(&'a [u8]),
    /// The output of a caller's [`ValueCodec::encode`].
    Serialized(&'a [u8]),
}

impl<'a> Payload<'a> {
    pub(crate) fn parts(self) -> (&'a [u8], EntryKind) {
        match self {
            Payload::Bytes(b) => (b, EntryKind::Bytes),
            Payload::Serialized(b) => (b, EntryKind::Serialized),
        }
    }
}

/// A payload read back out of the content table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnedValue {
    /// Stored as a plain byte string.
    Bytes(Vec<u8>),
    /// Stored through the caller's codec; decode with the matching
    /// [`ValueCodec`].
    Serialized(Vec<u8>),
}

impl OwnedValue {
    /// The stored kind.
    pub fn kind(&self) -> EntryKind {
        match self {
            OwnedValue::Bytes(_) => EntryKind::Bytes,
            OwnedValue::Serialized(_) => EntryKind::Serialized,
        }
    }

    /// The payload bytes, whatever their kind.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            OwnedValue::Bytes(b) | OwnedValue::Serialized(b) => b,
        }
    }
}

/// A payload after the compression decision.
pub(crate) enum Packed<'a> {
    Raw(&'a [u8]),
    /// Compressed bytes plus the original size to decompress back to.
    Compressed(Vec<u8>, usize),
}

impl Packed<'_> {
    pub(crate) fn stored(&self) -> &[u8] {
        match self {
            Packed::Raw(b) => b,
            Packed::Compressed(b, _) => b,
        }
    }

    /// Size to decompress to, or 0 when stored raw.
    pub(crate) fn uncompressed_size(&self) -> usize {
        match self {
            Packed::Raw(_) => 0,
            Packed::Compressed(_, size) => *size,
        }
    }
}

/// Compress a payload, keeping the raw bytes when compression does not
/// strictly shrink them.
pub(crate) fn pack(bytes: &[u8]) -> Packed<'_> {
    let compressed = lz4_flex::block::compress(bytes);
    if compressed.len() < bytes.len() {
        Packed::Compressed(compressed, bytes.len())
    } else {
        Packed::Raw(bytes)
    }
}

/// Undo [`pack`]. `uncompressed_size == 0` means the bytes were stored raw.
///
/// A heap entry that fails to decompress to its recorded size means the
/// region is corrupt; that is fatal.
pub(crate) fn unpack(stored: &[u8], uncompressed_size: usize) -> Vec<u8> {
    if uncompressed_size == 0 {
        return stored.to_vec();
    }
    let out = lz4_flex::block::decompress(stored, uncompressed_size)
        .expect("corrupt heap entry: stored bytes do not decompress");
    assert_eq!(out.len(), uncompressed_size);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compressible_payload_round_trip() {
        let data = vec![7u8; 4096];
        let packed = pack(&data);
        assert!(packed.stored().len() < data.len());
        assert_eq!(packed.uncompressed_size(), 4096);
        assert_eq!(unpack(packed.stored(), packed.uncompressed_size()), data);
    }

    #[test]
    fn test_tiny_payload_stays_raw() {
        // LZ4 grows inputs this small; the strict inequality keeps them raw.
        let data = b"hi";
        let packed = pack(data);
        assert_eq!(packed.uncompressed_size(), 0);
        assert_eq!(packed.stored(), data);
        assert_eq!(unpack(packed.stored(), 0), data);
    }

    #[test]
    fn test_incompressible_payload_stays_raw() {
        // A byte counter has no repetition for LZ4 to exploit.
        let data: Vec<u8> = (0..=255).collect();
        let packed = pack(&data);
        assert_eq!(packed.uncompressed_size(), 0);
        assert_eq!(packed.stored(), &data[..]);
    }

    #[test]
    fn test_owned_value_accessors() {
        let v = OwnedValue::Bytes(vec![1, 2, 3]);
        assert_eq!(v.kind(), EntryKind::Bytes);
        assert_eq!(v.into_bytes(), vec![1, 2, 3]);
    }
}
