//! Occupancy and heap statistics.
//!
//! A [`ShmStats`] is a point-in-time snapshot taken by the master between
//! phases; the tables are scanned, so this is diagnostics, not a hot path.

use crate::region::SharedMem;

/// Snapshot of store occupancy.
#[derive(Debug, Clone)]
pub struct ShmStats {
    /// Bytes bump-allocated in the heap.
    pub used_heap_size: usize,
    /// Bytes freed by removes but not yet collected.
    pub wasted_heap_size: usize,
    /// Total heap budget in bytes.
    pub heap_capacity: usize,
    /// Content-table slots holding live data.
    pub hash_filled_slots: u64,
    /// Content-table slots holding live data or a tombstone.
    pub hash_nonempty_slots: u64,
    /// Content-table slot capacity.
    pub hash_capacity: usize,
    /// Dependency-table slots in use (heads plus list nodes).
    pub dep_used_slots: usize,
    /// Dependency edges recorded.
    pub dep_edge_count: u64,
    /// Dependency-table slot capacity.
    pub dep_capacity: usize,
}

impl ShmStats {
    pub(crate) fn snapshot(shm: &SharedMem) -> Self {
        let (hash_filled_slots, hash_nonempty_slots) = shm.values().used_slots();
        let deps = shm.deps();
        Self {
            used_heap_size: shm.used_heap_size(),
            wasted_heap_size: shm.wasted_heap_size(),
            heap_capacity: shm.layout.heap_size,
            hash_filled_slots,
            hash_nonempty_slots,
            hash_capacity: shm.values().total_slots(),
            dep_used_slots: deps.used_slots(),
            dep_edge_count: deps.entry_count(),
            dep_capacity: deps.total_slots(),
        }
    }

    /// Print a summary of store occupancy.
    pub fn print_summary(&self) {
        eprintln!("=== Shared Memory Statistics ===");
        eprintln!(
            "Heap: {} used, {} wasted, {} capacity",
            format_bytes(self.used_heap_size as u64),
            format_bytes(self.wasted_heap_size as u64),
            format_bytes(self.heap_capacity as u64)
        );
        eprintln!(
            "Content table: {} live / {} nonempty of {} slots",
            self.hash_filled_slots, self.hash_nonempty_slots, self.hash_capacity
        );
        eprintln!(
            "Dependency table: {} edges in {} of {} slots",
            self.dep_edge_count, self.dep_used_slots, self.dep_capacity
        );
    }
}

impl SharedMem {
    /// Print the occupancy summary when the configured log level asks for
    /// it.
    pub fn log_summary(&self) {
        if self.log_level() >= 1 {
            self.stats().print_summary();
        }
    }
}

/// Format bytes in human-readable form.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
