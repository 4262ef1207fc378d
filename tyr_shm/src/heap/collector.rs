//! In-place mark-and-compact collection of the shared heap.
//!
//! Removes only clear content-table address fields; the payload bytes stay
//! behind as waste until the master runs a collection during quiescence.
//! The pass is a two-step pointer-inversion compaction with no side tables:
//!
//! 1. **Mark** - for every live content-table slot, swap the entry header
//!    into the table's address field and write the address of that field
//!    over the header in the heap. Table fields are 8-byte aligned, so the
//!    planted pointer has bit 0 clear while real headers have it set.
//! 2. **Sweep** - walk the heap bottom-up. A word with bit 0 set is a dead
//!    entry's header: skip it. A word with bit 0 clear points back at the
//!    table field holding the real header: restore the header, slide the
//!    entry as far down as possible, and point the table field at the new
//!    location.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::hashtbl::{self, WRITE_IN_PROGRESS};
use crate::heap::{aligned_size, is_header_word, EntryHeader};
use crate::region::SharedMem;

/// Whether enough of the heap is waste to be worth compacting.
///
/// The aggressive factor tolerates only 20% overhead; the default waits for
/// the heap to double its reachable size.
pub(crate) fn should_collect(shm: &SharedMem, aggressive: bool) -> bool {
    let space_overhead: f64 = if aggressive { 1.2 } else { 2.0 };
    let used = shm.used_heap_size();
    let reachable = used - shm.wasted_heap_size();
    used as f64 >= space_overhead * reachable as f64
}

/// Compact the heap. Master-only, workers quiescent.
pub(crate) fn collect(shm: &SharedMem, aggressive: bool) -> Result<()> {
    shm.assert_master();
    shm.assert_allow_removes();

    if !should_collect(shm, aggressive) {
        return Ok(());
    }

    // Step 1: the content-table entries are the roots of the marking pass.
    for slot in hashtbl::slots_of(shm) {
        let addr = slot.addr.load(Ordering::SeqCst) as usize;
        if addr == 0 {
            continue;
        }
        // No workers run during collection; a sentinel here means one died
        // mid-write, which we cannot recover from.
        assert!(
            addr as u64 != WRITE_IN_PROGRESS,
            "collect ran while a write was in progress"
        );

        // The table's addr field is about to go stale anyway, so stash the
        // header in it and leave a pointer to the field where the header
        // was. The sweep follows that pointer to restore the header and
        // patch in the relocated address. Only sound because a header and a
        // field pointer are both exactly one word.
        let header = unsafe { *(addr as *const u64) };
        slot.addr.store(header, Ordering::SeqCst);
        unsafe { *(addr as *mut u64) = &slot.addr as *const AtomicU64 as u64 };
    }

    // Step 2: slide live entries down, fixing table addresses as we go.
    let heap_init = shm.heap_init_addr();
    let top = shm.heap_top().load(Ordering::SeqCst) as usize;
    let mut src = heap_init;
    let mut dst = heap_init;

    while src < top {
        let word = unsafe { *(src as *const u64) };
        let size;
        if is_header_word(word) {
            // Still a header, so no table entry claimed it: dead. Skip.
            size = aligned_size(EntryHeader::from_raw(word).total_size());
        } else {
            // A back-pointer to the table field holding the real header.
            let back = word as *const AtomicU64;
            let header = EntryHeader::from_raw(unsafe { (*back).load(Ordering::SeqCst) });
            size = aligned_size(header.total_size());

            unsafe {
                (*back).store(dst as u64, Ordering::SeqCst);
                *(src as *mut u64) = header.raw();
                std::ptr::copy(src as *const u8, dst as *mut u8, size);
            }
            dst += size;
        }
        src += size;
    }

    shm.heap_top().store(dst as u64, Ordering::SeqCst);
    shm.wasted_heap().store(0, Ordering::SeqCst);
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::codec::{OwnedValue, Payload};
    use crate::config::ShmConfig;
    use crate::testing;

    #[test]
    fn test_collect_without_waste_is_noop() {
        testing::region(ShmConfig::small(), |shm| {
            let values = shm.values();
            values.add(1, Payload::Bytes(b"payload")).unwrap();
            let used_before = shm.used_heap_size();

            shm.collect(false).unwrap();
            assert_eq!(shm.used_heap_size(), used_before);
            assert_eq!(values.get(1).unwrap(), OwnedValue::Bytes(b"payload".to_vec()));
        });
    }

    #[test]
    fn test_collect_reclaims_removed_entries() {
        testing::region(ShmConfig::small(), |shm| {
            let values = shm.values();
            for key in 1..=20u64 {
                let data = vec![key as u8; 200];
                values.add(key, Payload::Bytes(&data)).unwrap();
            }
            for key in 1..=10u64 {
                values.remove(key);
            }
            assert!(shm.wasted_heap_size() > 0);
            let reachable = shm.used_heap_size() - shm.wasted_heap_size();

            shm.collect(true).unwrap();

            // Exactly the survivors remain, tightly packed.
            assert_eq!(shm.wasted_heap_size(), 0);
            assert_eq!(shm.used_heap_size(), reachable);
            for key in 11..=20u64 {
                assert_eq!(
                    values.get(key).unwrap(),
                    OwnedValue::Bytes(vec![key as u8; 200])
                );
            }
        });
    }

    #[test]
    fn test_collect_everything_removed_empties_heap() {
        testing::region(ShmConfig::small(), |shm| {
            let values = shm.values();
            for key in 1..=5u64 {
                values.add(key, Payload::Bytes(b"gone soon")).unwrap();
            }
            for key in 1..=5u64 {
                values.remove(key);
            }
            shm.collect(true).unwrap();
            assert_eq!(shm.used_heap_size(), 0);
            assert_eq!(shm.wasted_heap_size(), 0);
        });
    }

    #[test]
    fn test_default_factor_waits_for_doubling() {
        testing::region(ShmConfig::small(), |shm| {
            let values = shm.values();
            for key in 1..=10u64 {
                values.add(key, Payload::Bytes(&[0u8; 100])).unwrap();
            }
            // Remove a third: not enough waste for the default factor,
            // enough for the aggressive one.
            for key in 1..=3u64 {
                values.remove(key);
            }
            assert!(!shm.should_collect(false));
            assert!(shm.should_collect(true));
        });
    }
}
