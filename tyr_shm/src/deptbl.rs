//! The dependency table: a lock-free multimap from 31-bit keys to sets of
//! 31-bit values.
//!
//! Conceptually simple, implemented carefully: both the hash-table entries
//! and the linked-list storage they point at live in the same shared slot
//! array, and everything is updated from many processes with no mutexes.
//! A tag bit distinguishes hash entries from list nodes so that lookups
//! never accidentally match a list node.
//!
//! Each slot is in one of three states:
//!
//! - **empty**: raw == 0 (the initial state);
//! - **head**: the key half carries the tag; its `next` half either holds
//!   the sole value or points at a list node;
//! - **interior**: the key half holds a value (untagged, so unmatchable by
//!   lookup); its `next` half is another pointer or the terminal value.
//!
//! Storing the final value directly in the terminal `next` half means every
//! edge in the graph costs exactly one slot.
//!
//! A non-empty slot can never be encoded as all zero bits: that encoding
//! would read as the same value stored twice in one terminal node, which is
//! impossible because the bindings pre-check filters duplicates. Empty
//! therefore has a single encoding.
//!
//! Edges are only added, never removed (short of the master's wholesale
//! [`reset`](DepTable::reset)), so readers can walk chains without fear of
//! ABA.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, ShmError};
use crate::region::SharedMem;

/// Tag bit of a 31-bit slot half.
const TAG_BIT: u32 = 1 << 31;

/// Mixes an integer so its low bits make a good starting slot.
///
/// The multiply spreads entropy into the high bits; the byte swap moves
/// those good bits down to serve as the slot number.
pub(crate) fn hash_u64(n: u64) -> u64 {
    const GOLDEN_RATIO: u64 = 0x9e37_79b9_7f4a_7c15;
    n.wrapping_mul(GOLDEN_RATIO).swap_bytes()
}

/// The `next` half of a slot: either the terminal value of the list or the
/// slot number of the next node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Val(u32),
    Ptr(u32),
}

impl Next {
    fn encode(self) -> u32 {
        match self {
            Next::Val(v) => v,
            Next::Ptr(p) => p | TAG_BIT,
        }
    }
}

/// Decoded view of one slot's raw 64 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot(u64);

impl Slot {
    fn head(key: u32, next: Next) -> Self {
        Slot(((next.encode() as u64) << 32) | (key | TAG_BIT) as u64)
    }

    fn interior(val: u32, next: Next) -> Self {
        Slot(((next.encode() as u64) << 32) | val as u64)
    }

    fn raw(self) -> u64 {
        self.0
    }

    fn is_empty(self) -> bool {
        self.0 == 0
    }

    fn is_head_for(self, key: u32) -> bool {
        self.0 as u32 == key | TAG_BIT
    }

    /// The untagged low half: a value for interior nodes.
    fn num(self) -> u32 {
        self.0 as u32 & !TAG_BIT
    }

    fn next(self) -> Next {
        let half = (self.0 >> 32) as u32;
        if half & TAG_BIT != 0 {
            Next::Ptr(half & !TAG_BIT)
        } else {
            Next::Val(half)
        }
    }
}

/// View over the dependency multimap. Obtain via [`SharedMem::deps`].
#[derive(Clone, Copy)]
pub struct DepTable<'shm> {
    shm: &'shm SharedMem,
}

impl<'shm> DepTable<'shm> {
    pub(crate) fn new(shm: &'shm SharedMem) -> Self {
        Self { shm }
    }

    fn slots(&self) -> &[AtomicU64] {
        unsafe {
            std::slice::from_raw_parts(
                self.shm.base.add(self.shm.layout.deptbl_off) as *const AtomicU64,
                self.shm.layout.dep_slots,
            )
        }
    }

    /// The parallel edge-existence set: each entry is `(key << 31) | val`,
    /// used to answer "is this edge already present" in O(1) average
    /// without walking the list.
    fn bindings(&self) -> &[AtomicU64] {
        unsafe {
            std::slice::from_raw_parts(
                self.shm.base.add(self.shm.layout.bindings_off) as *const AtomicU64,
                self.shm.layout.dep_slots,
            )
        }
    }

    fn mask(&self) -> usize {
        self.shm.layout.dep_slots - 1
    }

    /// Record an edge from `key` to `val`. Does nothing if one already
    /// exists. Both vertices must fit in 31 bits.
    pub fn add(&self, key: u32, val: u32) -> Result<()> {
        self.shm.check_should_exit()?;
        assert!(
            key < TAG_BIT && val < TAG_BIT,
            "dependency vertices must fit in 31 bits"
        );
        if self.add_binding(((key as u64) << 31) | val as u64)? {
            self.prepend(key, val);
        }
        Ok(())
    }

    /// Insert into the bindings set. Returns true iff the edge is new.
    ///
    /// This path is perf sensitive; check the performance before modifying.
    fn add_binding(&self, pair: u64) -> Result<bool> {
        let bindings = self.bindings();
        let capacity = self.shm.layout.dep_slots as u64;
        let mask = self.mask();
        let mut slot = hash_u64(pair) as usize & mask;

        loop {
            // A plain load before trying the atomic speeds things up
            // considerably.
            let current = bindings[slot].load(Ordering::SeqCst);

            if current == pair {
                return Ok(false);
            }

            if self.shm.dcounter().load(Ordering::SeqCst) >= capacity {
                return Err(ShmError::DepTableFull);
            }

            if current == 0 {
                if bindings[slot]
                    .compare_exchange(0, pair, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    let size = self.shm.dcounter().fetch_add(1, Ordering::SeqCst);
                    // Sanity check
                    assert!(size <= capacity);
                    return Ok(true);
                }

                if bindings[slot].load(Ordering::SeqCst) == pair {
                    return Ok(false);
                }
            }

            slot = (slot + 1) & mask;
        }
    }

    /// Claim a free slot to serve as a list node holding `val`, and return
    /// its slot number. The caller overwrites the placeholder `next` before
    /// publishing the node through a head CAS, so no reader can observe it
    /// half-built.
    fn alloc_node(&self, key: u32, val: u32) -> usize {
        let slots = self.slots();
        let mask = self.mask();

        // Any free slot works, since list nodes are only reachable through
        // an explicit slot number in another node's next field. The pair is
        // unique at this point, so it makes a good random starting point.
        let mut slot = hash_u64(((key as u64) << 31) | val as u64) as usize & mask;
        let node = Slot::interior(val, Next::Ptr(TAG_BIT - 1));

        loop {
            if slots[slot].load(Ordering::SeqCst) == 0
                && slots[slot]
                    .compare_exchange(0, node.raw(), Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                return slot;
            }
            slot = (slot + 1) & mask;
        }
    }

    /// Prepend `val` to the list for `key`. Assumes the bindings pre-check
    /// already established that `val` is not in that list.
    fn prepend(&self, key: u32, val: u32) {
        let slots = self.slots();
        let mask = self.mask();
        let mut slot = hash_u64(key as u64) as usize & mask;

        loop {
            let mut current = slots[slot].load(Ordering::SeqCst);

            if current == 0 {
                // Empty slot: try to create a terminal head right here.
                let head = Slot::head(key, Next::Val(val));
                match slots[slot].compare_exchange(
                    0,
                    head.raw(),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => return,
                    // Some racing writer got the slot; re-examine it below.
                    Err(raced) => current = raced,
                }
            }

            if Slot(current).is_head_for(key) {
                // A list for this key exists. Chain a fresh node to whatever
                // the head points at, then swing the head to the node - the
                // classic atomic list push, retried on a lost race.
                let node = self.alloc_node(key, val);
                let head = Slot::head(key, Next::Ptr(node as u32));

                loop {
                    // The node is invisible until the head CAS lands, so a
                    // plain store of its next field is fine.
                    slots[node]
                        .store(Slot::interior(val, Slot(current).next()).raw(), Ordering::SeqCst);

                    match slots[slot].compare_exchange(
                        current,
                        head.raw(),
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    ) {
                        Ok(_) => return,
                        Err(raced) => current = raced,
                    }
                }
            }

            slot = (slot + 1) & mask;
        }
    }

    /// The values bound to `key`, in unspecified order.
    pub fn get(&self, key: u32) -> Result<Vec<u32>> {
        self.shm.check_should_exit()?;
        self.shm.assert_allow_dep_reads();
        assert!(key < TAG_BIT, "dependency vertices must fit in 31 bits");

        let slots = self.slots();
        let mask = self.mask();
        let mut slot = hash_u64(key as u64) as usize & mask;

        loop {
            let current = Slot(slots[slot].load(Ordering::SeqCst));

            if current.is_empty() {
                // No entries for this key.
                return Ok(Vec::new());
            }

            if current.is_head_for(key) {
                return Ok(self.walk(current));
            }

            slot = (slot + 1) & mask;
        }
    }

    /// Collect the values of a chain starting at a head slot.
    fn walk(&self, head: Slot) -> Vec<u32> {
        let slots = self.slots();
        let mut out = Vec::new();
        let mut cursor = head;
        loop {
            match cursor.next() {
                Next::Ptr(next_slot) => {
                    assert!((next_slot as usize) < self.shm.layout.dep_slots);
                    cursor = Slot(slots[next_slot as usize].load(Ordering::SeqCst));
                    out.push(cursor.num());
                }
                Next::Val(v) => {
                    // The tail of the list is special: next is the value.
                    out.push(v);
                    return out;
                }
            }
        }
    }

    /// Number of edges recorded.
    pub fn entry_count(&self) -> u64 {
        self.shm.dcounter().load(Ordering::SeqCst)
    }

    /// Number of non-empty slots (heads plus list nodes).
    pub fn used_slots(&self) -> usize {
        self.slots()
            .iter()
            .filter(|s| s.load(Ordering::Relaxed) != 0)
            .count()
    }

    /// Total slot capacity.
    pub fn total_slots(&self) -> usize {
        self.shm.layout.dep_slots
    }

    /// Number of edges stored under the chain rooted at `slot`, zero when
    /// the slot is empty or interior.
    pub fn entry_count_for_slot(&self, slot: usize) -> usize {
        assert!(slot < self.shm.layout.dep_slots);
        let slots = self.slots();
        let head = Slot(slots[slot].load(Ordering::SeqCst));
        if head.is_empty() || head.0 as u32 & TAG_BIT == 0 {
            return 0;
        }

        let mut count = 0;
        let mut cursor = head;
        while let Next::Ptr(next_slot) = cursor.next() {
            assert!((next_slot as usize) < self.shm.layout.dep_slots);
            cursor = Slot(slots[next_slot as usize].load(Ordering::SeqCst));
            count += 1;
        }
        // The final next in the list is always a value, not a pointer.
        count + 1
    }

    /// Iterate every `(key, values)` row. Order follows slot order.
    pub fn rows(self) -> impl Iterator<Item = (u32, Vec<u32>)> + 'shm {
        (0..self.shm.layout.dep_slots).filter_map(move |i| {
            let head = Slot(self.slots()[i].load(Ordering::SeqCst));
            if head.is_empty() || head.0 as u32 & TAG_BIT == 0 {
                return None;
            }
            Some((head.num(), self.walk(head)))
        })
    }

    /// Zero the table and its bindings set. Master-only, workers quiescent.
    pub fn reset(&self) {
        self.shm.assert_master();
        unsafe {
            std::ptr::write_bytes(
                self.shm.base.add(self.shm.layout.deptbl_off),
                0,
                self.shm.layout.dep_slots * 16,
            );
        }
        self.shm.dcounter().store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShmConfig;
    use crate::testing;

    #[test]
    fn test_slot_encoding() {
        let head = Slot::head(7, Next::Val(9));
        assert!(!head.is_empty());
        assert!(head.is_head_for(7));
        assert!(!head.is_head_for(9));
        assert_eq!(head.num(), 7);
        assert_eq!(head.next(), Next::Val(9));

        let interior = Slot::interior(5, Next::Ptr(3));
        assert!(!interior.is_head_for(5));
        assert_eq!(interior.num(), 5);
        assert_eq!(interior.next(), Next::Ptr(3));
    }

    #[test]
    fn test_empty_has_single_encoding() {
        // A terminal node holding the value 0 twice is the only all-zero
        // non-empty reading, and duplicates cannot exist.
        assert_eq!(Slot::interior(0, Next::Val(0)).raw(), 0);
        assert_ne!(Slot::head(0, Next::Val(0)).raw(), 0);
    }

    #[test]
    fn test_hash_mixes_low_bits() {
        // Sequential keys must not land on sequential slots.
        let a = hash_u64(1) & 0xff;
        let b = hash_u64(2) & 0xff;
        let c = hash_u64(3) & 0xff;
        assert!(!(b == a + 1 && c == b + 1));
    }

    #[test]
    fn test_add_get_round_trip() {
        testing::region(ShmConfig::small(), |shm| {
            let deps = shm.deps();
            deps.add(1, 2).unwrap();
            deps.add(1, 3).unwrap();
            deps.add(1, 2).unwrap(); // duplicate, ignored

            let mut vals = deps.get(1).unwrap();
            vals.sort_unstable();
            assert_eq!(vals, vec![2, 3]);
            assert_eq!(deps.entry_count(), 2);
            assert_eq!(deps.get(42).unwrap(), Vec::<u32>::new());
        });
    }

    #[test]
    fn test_long_chain() {
        testing::region(ShmConfig::small(), |shm| {
            let deps = shm.deps();
            for v in 0..50 {
                deps.add(7, v).unwrap();
            }
            let mut vals = deps.get(7).unwrap();
            vals.sort_unstable();
            assert_eq!(vals, (0..50).collect::<Vec<_>>());
            // One slot per edge.
            assert_eq!(deps.used_slots(), 50);
            assert_eq!(deps.entry_count(), 50);
        });
    }

    #[test]
    fn test_many_keys() {
        testing::region(ShmConfig::small(), |shm| {
            let deps = shm.deps();
            for k in 0..40 {
                deps.add(k, k + 100).unwrap();
                deps.add(k, k + 200).unwrap();
            }
            for k in 0..40 {
                let mut vals = deps.get(k).unwrap();
                vals.sort_unstable();
                assert_eq!(vals, vec![k + 100, k + 200]);
            }
        });
    }

    #[test]
    fn test_table_full() {
        testing::region(ShmConfig::small(), |shm| {
            let deps = shm.deps();
            // Capacity is 2^8 edges.
            for v in 0..256 {
                deps.add(1, v).unwrap();
            }
            assert_eq!(deps.add(1, 999), Err(ShmError::DepTableFull));
        });
    }

    #[test]
    fn test_reset() {
        testing::region(ShmConfig::small(), |shm| {
            let deps = shm.deps();
            deps.add(1, 2).unwrap();
            deps.add(3, 4).unwrap();
            deps.reset();
            assert_eq!(deps.entry_count(), 0);
            assert_eq!(deps.used_slots(), 0);
            assert_eq!(deps.get(1).unwrap(), Vec::<u32>::new());
            // The table accepts edges again after a reset.
            deps.add(1, 5).unwrap();
            assert_eq!(deps.get(1).unwrap(), vec![5]);
        });
    }

    #[test]
    fn test_rows_iteration() {
        testing::region(ShmConfig::small(), |shm| {
            let deps = shm.deps();
            deps.add(10, 1).unwrap();
            deps.add(10, 2).unwrap();
            deps.add(20, 3).unwrap();

            let mut rows: Vec<_> = deps.rows().collect();
            rows.sort_by_key(|(k, _)| *k);
            assert_eq!(rows.len(), 2);
            assert_eq!(rows[0].0, 10);
            let mut vals = rows[0].1.clone();
            vals.sort_unstable();
            assert_eq!(vals, vec![1, 2]);
            assert_eq!(rows[1], (20, vec![3]));
        });
    }

    #[test]
    fn test_entry_count_for_slot_matches_rows() {
        testing::region(ShmConfig::small(), |shm| {
            let deps = shm.deps();
            for v in 0..5 {
                deps.add(9, v).unwrap();
            }
            let total: usize = (0..deps.total_slots())
                .map(|s| deps.entry_count_for_slot(s))
                .sum();
            assert_eq!(total, 5);
        });
    }
}
