//! The content table: a lock-free map from 64-bit keys to heap entries.
//!
//! Keys come from the first 8 bytes of a caller-supplied 16-byte digest;
//! collision resistance over the digest domain is the caller's problem.
//! Values under the same key are *equivalent* by contract: any copy may be
//! returned, so a writer that loses an insert race simply drops its copy.
//!
//! Supported concurrency:
//!
//! - **Concurrent writes**: one wins, the rest are dropped on the floor.
//!   The only promise is that after `add` returns, this process will see
//!   data under the key (possibly another writer's equivalent data).
//! - **Concurrent reads**: interleaved with a write they either see nothing
//!   at the slot or the complete new entry, never a torn one.
//! - **Concurrent removes**: NOT supported. Only the master removes, and
//!   only while workers are quiescent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::codec::{OwnedValue, Payload, ValueCodec};
use crate::error::{Result, ShmError};
use crate::heap;
use crate::region::SharedMem;

/// Sentinel address marking a slot whose writer is still serializing.
pub const WRITE_IN_PROGRESS: u64 = 1;

/// How long a reader spins on a write-in-progress slot before concluding
/// the writer died.
const WATCHDOG_LIMIT_SECS: u64 = 60;

/// One slot: the key's hash and the heap address of its entry.
///
/// `hash == 0` means never written; once a writer claims a hash it is never
/// rewritten (removes clear only `addr`, leaving a tombstone).
#[repr(C)]
pub(crate) struct HashSlot {
    pub(crate) hash: AtomicU64,
    pub(crate) addr: AtomicU64,
}

/// The slot array of the content table.
pub(crate) fn slots_of(shm: &SharedMem) -> &[HashSlot] {
    unsafe {
        std::slice::from_raw_parts(
            shm.base.add(shm.layout.hashtbl_off) as *const HashSlot,
            shm.layout.hash_slots,
        )
    }
}

/// Membership status of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// The key holds live data.
    Present,
    /// The key was never successfully added.
    Absent,
    /// The key was added and then explicitly removed.
    Removed,
}

/// The in-memory key for a caller-supplied 16-byte digest: its first
/// 8 bytes, which is all the atomic protocol can compare.
pub fn key_of_digest(digest: &[u8; 16]) -> u64 {
    u64::from_le_bytes(digest[..8].try_into().unwrap())
}

/// View over the content table. Obtain via [`SharedMem::values`].
pub struct ValueTable<'shm> {
    shm: &'shm SharedMem,
}

impl<'shm> ValueTable<'shm> {
    pub(crate) fn new(shm: &'shm SharedMem) -> Self {
        Self { shm }
    }

    fn slots(&self) -> &[HashSlot] {
        slots_of(self.shm)
    }

    fn mask(&self) -> usize {
        self.shm.layout.hash_slots - 1
    }

    /// Insert a value under `key`.
    ///
    /// Returns `Some((allocated, original))` byte counts when this process
    /// performed the write, or `None` when a racing writer claimed the key
    /// and this payload was dropped - in which case the table still ends up
    /// holding an *equivalent* value, by the domain contract.
    ///
    /// This path is perf sensitive; check the performance before modifying.
    pub fn add(&self, key: u64, payload: Payload<'_>) -> Result<Option<(usize, usize)>> {
        self.shm.check_should_exit()?;
        assert!(key != 0, "key hash 0 is reserved for empty slots");

        let slots = self.slots();
        let capacity = self.shm.layout.hash_slots as u64;
        let mask = self.mask();
        let init_slot = key as usize & mask;
        let mut slot = init_slot;

        loop {
            let slot_hash = slots[slot].hash.load(Ordering::SeqCst);

            if slot_hash == key {
                return self.write_at(slot, payload);
            }

            if self.shm.hcounter().load(Ordering::SeqCst) >= capacity {
                // We're never going to find a spot.
                return Err(ShmError::HashTableFull);
            }

            if slot_hash == 0 {
                // Looks free; try to grab it.
                if slots[slot]
                    .hash
                    .compare_exchange(0, key, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    let size = self.shm.hcounter().fetch_add(1, Ordering::SeqCst);
                    // Sanity check
                    assert!(size < capacity);
                    return self.write_at(slot, payload);
                }

                // Grabbing it failed. If the racing writer took the slot for
                // this same key, we cannot return until a read would succeed
                // - the racer may not even have published the sentinel yet -
                // so try the write ourselves; either we insert, or the
                // address is known non-null by the time write_at returns.
                if slots[slot].hash.load(Ordering::SeqCst) == key {
                    return self.write_at(slot, payload);
                }
            }

            slot = (slot + 1) & mask;
            if slot == init_slot {
                // We're never going to find a spot.
                return Err(ShmError::HashTableFull);
            }
        }
    }

    /// Serialize into the heap and publish, unless another writer holds the
    /// slot.
    fn write_at(&self, slot: usize, payload: Payload<'_>) -> Result<Option<(usize, usize)>> {
        let cell = &self.slots()[slot].addr;
        if cell
            .compare_exchange(0, WRITE_IN_PROGRESS, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // A racing writer owns this slot; drop our copy.
            return Ok(None);
        }

        self.shm.assert_writes_allowed();
        let (addr, alloc_size, orig_size) = heap::store(self.shm, payload)?;
        cell.store(addr as u64, Ordering::SeqCst);
        Ok(Some((alloc_size, orig_size)))
    }

    /// Probe for `key`. The returned slot either matches it or is free.
    fn find_slot(&self, key: u64) -> Result<usize> {
        assert!(key != 0, "key hash 0 is reserved for empty slots");
        let slots = self.slots();
        let mask = self.mask();
        let init_slot = key as usize & mask;
        let mut slot = init_slot;
        loop {
            let slot_hash = slots[slot].hash.load(Ordering::SeqCst);
            if slot_hash == key || slot_hash == 0 {
                return Ok(slot);
            }
            slot = (slot + 1) & mask;
            if slot == init_slot {
                return Err(ShmError::HashTableFull);
            }
        }
    }

    /// Membership status of `key`.
    ///
    /// When the key's writer is still mid-insert this spins (with a pause
    /// hint) until the entry is published. A writer that dies between
    /// claiming the slot and publishing would strand readers here, so a
    /// 60-second watchdog turns that into a fatal error.
    pub fn mem_status(&self, key: u64) -> Result<EntryStatus> {
        self.shm.check_should_exit()?;
        let slot = self.find_slot(key)?;
        let cell = &self.slots()[slot];

        if cell.hash.load(Ordering::SeqCst) != key {
            return Ok(EntryStatus::Absent);
        }

        let mut addr = cell.addr.load(Ordering::SeqCst);
        if addr == 0 {
            // Hash matches but the address was cleared: explicitly removed.
            return Ok(EntryStatus::Removed);
        }

        let start = Instant::now();
        while addr == WRITE_IN_PROGRESS {
            std::hint::spin_loop();
            if start.elapsed().as_secs() > WATCHDOG_LIMIT_SECS {
                return Err(ShmError::WatchdogStuck);
            }
            addr = cell.addr.load(Ordering::SeqCst);
        }
        if addr == 0 {
            return Ok(EntryStatus::Removed);
        }
        Ok(EntryStatus::Present)
    }

    /// Whether `key` holds live data.
    pub fn mem(&self, key: u64) -> Result<bool> {
        Ok(self.mem_status(key)? == EntryStatus::Present)
    }

    /// The value under `key`. The key MUST be present.
    pub fn get(&self, key: u64) -> Result<OwnedValue> {
        self.shm.check_should_exit()?;
        let slot = self.find_slot(key)?;
        let cell = &self.slots()[slot];
        assert_eq!(cell.hash.load(Ordering::SeqCst), key, "get on an absent key");
        let addr = cell.addr.load(Ordering::SeqCst);
        assert!(addr > WRITE_IN_PROGRESS, "get on a key with no published value");
        Ok(heap::load(addr as usize))
    }

    /// The stored (possibly compressed) size of the value under `key`.
    /// The key MUST be present.
    pub fn get_size(&self, key: u64) -> Result<usize> {
        let slot = self.find_slot(key)?;
        let cell = &self.slots()[slot];
        assert_eq!(cell.hash.load(Ordering::SeqCst), key, "get_size on an absent key");
        let addr = cell.addr.load(Ordering::SeqCst);
        assert!(addr > WRITE_IN_PROGRESS, "get_size on a key with no published value");
        Ok(heap::header_at(addr as usize).stored_size())
    }

    /// Insert a value through the caller's codec.
    pub fn add_with<C: ValueCodec>(
        &self,
        key: u64,
        value: &C::Value,
        codec: &C,
    ) -> Result<Option<(usize, usize)>> {
        let bytes = codec.encode(value);
        self.add(key, Payload::Serialized(&bytes))
    }

    /// Read a value back through the caller's codec. The key MUST be
    /// present and must have been stored with [`add_with`](Self::add_with).
    pub fn get_with<C: ValueCodec>(&self, key: u64, codec: &C) -> Result<C::Value> {
        match self.get(key)? {
            OwnedValue::Serialized(bytes) => Ok(codec.decode(&bytes)),
            OwnedValue::Bytes(_) => panic!("get_with on a raw byte-string entry"),
        }
    }

    /// Move the value under `key1` to `key2`. Master-only, workers
    /// quiescent; `key1` must be present and `key2` must hold no value.
    pub fn move_key(&self, key1: u64, key2: u64) -> Result<()> {
        let slot1 = self.find_slot(key1)?;
        let slot2 = self.find_slot(key2)?;
        let slots = self.slots();

        self.shm.assert_master();
        self.shm.assert_allow_removes();
        assert_eq!(slots[slot1].hash.load(Ordering::SeqCst), key1, "move source is absent");
        assert_eq!(slots[slot2].addr.load(Ordering::SeqCst), 0, "move destination is occupied");

        // Taking up a previously never-used slot.
        if slots[slot2].hash.load(Ordering::SeqCst) == 0 {
            self.shm.hcounter().fetch_add(1, Ordering::SeqCst);
        }
        slots[slot2].hash.store(key2, Ordering::SeqCst);
        slots[slot2]
            .addr
            .store(slots[slot1].addr.load(Ordering::SeqCst), Ordering::SeqCst);
        slots[slot1].addr.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Remove the value under `key`. Master-only, workers quiescent. The
    /// hash stays behind as a tombstone; the heap bytes become waste for
    /// the next collection.
    pub fn remove(&self, key: u64) {
        let slot = self.find_slot(key).expect("remove probed a full table");
        let cell = &self.slots()[slot];

        self.shm.assert_master();
        self.shm.assert_allow_removes();
        assert_eq!(cell.hash.load(Ordering::SeqCst), key, "remove on an absent key");
        let addr = cell.addr.load(Ordering::SeqCst);
        assert!(addr > WRITE_IN_PROGRESS, "remove on a key with no published value");

        // This size mirrors the allocation size in heap::alloc.
        let slot_size = heap::aligned_size(heap::header_at(addr as usize).total_size());
        cell.addr.store(0, Ordering::SeqCst);
        self.shm.note_removed(slot_size);
    }

    /// Occupancy: `(filled, nonempty)` where filled slots hold live data
    /// and nonempty ones at least a tombstone. Master diagnostics only;
    /// cross-checks the nonempty count against the shared counter.
    pub fn used_slots(&self) -> (u64, u64) {
        let mut filled = 0;
        let mut nonempty = 0;
        for slot in self.slots() {
            if slot.hash.load(Ordering::SeqCst) != 0 {
                nonempty += 1;
            }
            if slot.addr.load(Ordering::SeqCst) != 0 {
                filled += 1;
            }
        }
        assert_eq!(nonempty, self.shm.hcounter().load(Ordering::SeqCst));
        (filled, nonempty)
    }

    /// Total slot capacity.
    pub fn total_slots(&self) -> usize {
        self.shm.layout.hash_slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShmConfig;
    use crate::testing;

    #[test]
    fn test_key_of_digest_takes_first_8_bytes() {
        let digest: [u8; 16] = [1, 0, 0, 0, 0, 0, 0, 0, 0xAA, 0xBB, 0, 0, 0, 0, 0, 0];
        assert_eq!(key_of_digest(&digest), 1);
    }

    #[test]
    fn test_add_get_round_trip() {
        testing::region(ShmConfig::small(), |shm| {
            let values = shm.values();
            let outcome = values.add(0x01, Payload::Bytes(b"hello")).unwrap();
            let (alloc_size, orig_size) = outcome.expect("first write cannot be dropped");
            assert_eq!(orig_size, 5);
            // "hello" does not compress.
            assert_eq!(alloc_size, 5);

            assert_eq!(values.get(0x01).unwrap(), OwnedValue::Bytes(b"hello".to_vec()));
            assert_eq!(values.get_size(0x01).unwrap(), 5);
            assert_eq!(values.mem_status(0x01).unwrap(), EntryStatus::Present);
            assert_eq!(values.mem_status(0x02).unwrap(), EntryStatus::Absent);
        });
    }

    #[test]
    fn test_second_add_same_key_is_dropped() {
        testing::region(ShmConfig::small(), |shm| {
            let values = shm.values();
            assert!(values.add(7, Payload::Bytes(b"first")).unwrap().is_some());
            // The slot's addr is already published, so the sentinel CAS
            // fails and the payload is dropped.
            assert!(values.add(7, Payload::Bytes(b"first")).unwrap().is_none());
            assert_eq!(values.get(7).unwrap(), OwnedValue::Bytes(b"first".to_vec()));
        });
    }

    #[test]
    fn test_remove_leaves_tombstone() {
        testing::region(ShmConfig::small(), |shm| {
            let values = shm.values();
            values.add(9, Payload::Bytes(b"doomed")).unwrap();
            let wasted_before = shm.wasted_heap_size();

            values.remove(9);

            assert_eq!(values.mem_status(9).unwrap(), EntryStatus::Removed);
            assert!(!values.mem(9).unwrap());
            assert!(shm.wasted_heap_size() > wasted_before);
            // The tombstone still counts as a nonempty slot.
            let (filled, nonempty) = values.used_slots();
            assert_eq!(filled, 0);
            assert_eq!(nonempty, 1);
        });
    }

    #[test]
    fn test_move_key() {
        testing::region(ShmConfig::small(), |shm| {
            let values = shm.values();
            values.add(3, Payload::Bytes(b"cargo")).unwrap();
            let before = values.get(3).unwrap();

            values.move_key(3, 4).unwrap();

            assert_eq!(values.mem_status(3).unwrap(), EntryStatus::Removed);
            assert_eq!(values.mem_status(4).unwrap(), EntryStatus::Present);
            assert_eq!(values.get(4).unwrap(), before);
        });
    }

    #[test]
    fn test_table_full() {
        testing::region(ShmConfig::small(), |shm| {
            let values = shm.values();
            // Capacity is 2^8 slots.
            for key in 1..=256u64 {
                values.add(key, Payload::Bytes(b"x")).unwrap();
            }
            assert_eq!(
                values.add(1000, Payload::Bytes(b"x")),
                Err(ShmError::HashTableFull)
            );
        });
    }

    #[test]
    fn test_probe_wraps_around() {
        testing::region(ShmConfig::small(), |shm| {
            let values = shm.values();
            // Keys colliding on the last slot must wrap to the front.
            let a = 0xFFu64; // slot 255
            let b = 0x1FFu64; // slot 255 again
            values.add(a, Payload::Bytes(b"a")).unwrap();
            values.add(b, Payload::Bytes(b"b")).unwrap();
            assert_eq!(values.get(a).unwrap(), OwnedValue::Bytes(b"a".to_vec()));
            assert_eq!(values.get(b).unwrap(), OwnedValue::Bytes(b"b".to_vec()));
        });
    }

    #[test]
    fn test_codec_round_trip() {
        struct PairCodec;
        impl ValueCodec for PairCodec {
            type Value = (u32, u32);
            fn encode(&self, value: &(u32, u32)) -> Vec<u8> {
                let mut out = value.0.to_le_bytes().to_vec();
                out.extend_from_slice(&value.1.to_le_bytes());
                out
            }
            fn decode(&self, bytes: &[u8]) -> (u32, u32) {
                (
                    u32::from_le_bytes(bytes[..4].try_into().unwrap()),
                    u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
                )
            }
        }

        testing::region(ShmConfig::small(), |shm| {
            let values = shm.values();
            values.add_with(11, &(42, 99), &PairCodec).unwrap();
            assert_eq!(values.get_with(11, &PairCodec).unwrap(), (42, 99));
            assert_eq!(values.get(11).unwrap().kind(), crate::heap::EntryKind::Serialized);
        });
    }

    #[test]
    fn test_large_compressible_value() {
        testing::region(ShmConfig::small(), |shm| {
            let values = shm.values();
            let data = vec![0xABu8; 50_000];
            let (alloc_size, orig_size) =
                values.add(21, Payload::Bytes(&data)).unwrap().unwrap();
            assert_eq!(orig_size, 50_000);
            assert!(alloc_size < orig_size);
            assert_eq!(values.get(21).unwrap(), OwnedValue::Bytes(data));
            assert_eq!(values.get_size(21).unwrap(), alloc_size);
        });
    }
}
