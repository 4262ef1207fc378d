//! Fixed-address region mapping, layout, and shared globals.
//!
//! The entire store lives in one contiguous region mapped at the same
//! virtual address in every process. That single decision is what lets a
//! heap address stored inside the region be dereferenced by any process
//! without translation.
//!
//! # Region layout
//!
//! ```text
//! +-----------------+----------------+-------------+--------+----------+---------+--------+
//! | small objects   | sink file name | global blob | deptbl | bindings | hashtbl |  heap  |
//! | (1 page)        | (1 page)       |             |  D x 8 |   D x 8  | H x 16  |        |
//! +-----------------+----------------+-------------+--------+----------+---------+--------+
//! ```
//!
//! The small-objects page holds every shared counter and flag, each on its
//! own cache line since they are modified atomically by many processes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::blob::GlobalBlob;
use crate::config::ShmConfig;
use crate::deptbl::DepTable;
use crate::error::{Result, ShmError};
use crate::hashtbl::ValueTable;
use crate::heap::collector;
use crate::memfd;
use crate::stats::ShmStats;

/// Cache line size; shared counters are spaced by this to avoid false
/// sharing.
pub const CACHE_LINE: usize = 64;

/// The fixed virtual address every process maps the region at. Addresses
/// stored inside the region are only valid because this is identical
/// everywhere; a mapping failure at this address is fatal.
#[cfg(target_arch = "aarch64")]
const SHARED_MEM_INIT: usize = 0x10_0000_0000;
#[cfg(not(target_arch = "aarch64"))]
const SHARED_MEM_INIT: usize = 0x5000_0000_0000;

#[cfg(target_os = "linux")]
const MAP_NORESERVE: libc::c_int = libc::MAP_NORESERVE;
#[cfg(not(target_os = "linux"))]
const MAP_NORESERVE: libc::c_int = 0;

/// The monotonic counter wraps at the largest signed value so callers can
/// store it in an i64 without surprises.
const COUNTER_MAX: u64 = i64::MAX as u64;

/// Process-local counter used before the region exists.
static EARLY_COUNTER: AtomicU64 = AtomicU64::new(1);

// Small-objects page cell indices (one cache line each).
const CELL_HEAP_TOP: usize = 0;
const CELL_HCOUNTER: usize = 1;
const CELL_DCOUNTER: usize = 2;
const CELL_COUNTER: usize = 3;
const CELL_MASTER_PID: usize = 4;
const CELL_LOG_LEVEL: usize = 5;
const CELL_SAMPLE_RATE: usize = 6;
const CELL_WORKERS_SHOULD_EXIT: usize = 7;
const CELL_WASTED_HEAP: usize = 8;
const CELL_ALLOW_REMOVES: usize = 9;
const CELL_ALLOW_DEP_READS: usize = 10;
const CELL_COUNT: usize = 11;

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

// =============================================================================
// Layout
// =============================================================================

/// Byte offsets of every sub-structure, derived once from the sizing knobs.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RegionLayout {
    pub page_size: usize,
    pub global_size_b: usize,
    pub heap_size: usize,
    /// Number of deptbl slots (power of two).
    pub dep_slots: usize,
    /// Number of hashtbl slots (power of two).
    pub hash_slots: usize,
    pub sink_name_off: usize,
    pub global_off: usize,
    pub deptbl_off: usize,
    pub bindings_off: usize,
    pub hashtbl_off: usize,
    pub heap_off: usize,
    pub total_size: usize,
}

impl RegionLayout {
    fn new(global_size_b: usize, heap_size: usize, dep_pow: u32, hash_pow: u32) -> Self {
        let page_size = page_size();
        assert!(page_size > CELL_COUNT * CACHE_LINE);
        assert!(global_size_b % 8 == 0, "global blob slot must stay 8-byte aligned");

        let dep_slots = 1usize << dep_pow;
        let hash_slots = 1usize << hash_pow;

        let sink_name_off = page_size;
        let global_off = 2 * page_size;
        let deptbl_off = global_off + global_size_b;
        let bindings_off = deptbl_off + dep_slots * 8;
        let hashtbl_off = bindings_off + dep_slots * 8;
        let heap_off = hashtbl_off + hash_slots * 16;
        let total_size = heap_off + heap_size;

        Self {
            page_size,
            global_size_b,
            heap_size,
            dep_slots,
            hash_slots,
            sink_name_off,
            global_off,
            deptbl_off,
            bindings_off,
            hashtbl_off,
            heap_off,
            total_size,
        }
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Everything a worker needs to map the region its master created.
///
/// The file descriptor is inheritable across fork; the sizing fields let the
/// worker re-derive the exact same [`RegionLayout`].
#[derive(Debug, Clone, Copy)]
pub struct Connector {
    /// Backing file descriptor, inherited by forked workers.
    pub fd: i32,
    /// Bytes reserved for the global blob slot.
    pub global_size_b: usize,
    /// Bytes of heap.
    pub heap_size: usize,
    /// log2 of the dependency table slot count.
    pub dep_table_pow: u32,
    /// log2 of the content table slot count.
    pub hash_table_pow: u32,
}

// =============================================================================
// SharedMem
// =============================================================================

/// A process's handle onto the shared region.
///
/// The master creates it with [`SharedMem::init`]; every worker creates its
/// own with [`SharedMem::connect`]. The region itself is never unmapped;
/// it is released by process exit.
pub struct SharedMem {
    pub(crate) base: *mut u8,
    pub(crate) layout: RegionLayout,
    pub(crate) fd: i32,
    my_pid: u64,
    // Process-local policy, deliberately not in the region: test runners use
    // these to enforce read-only or non-cancellable personas per process.
    writes_allowed: AtomicBool,
    can_exit: AtomicBool,
    removed_count: AtomicU64,
}

// Safety: every mutation of the mapped region goes through atomics (or is
// master-only during quiescence), and the process-local policy fields are
// atomics themselves.
unsafe impl Send for SharedMem {}
unsafe impl Sync for SharedMem {}

impl SharedMem {
    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create the region, size it, map it, and initialize shared globals.
    ///
    /// Must be called by the master before forking any worker. Returns the
    /// handle plus the [`Connector`] to hand to workers.
    pub fn init(config: &ShmConfig) -> Result<(Self, Connector)> {
        config.validate()?;
        let layout = RegionLayout::new(
            config.global_size_b,
            config.heap_size,
            config.dep_table_pow,
            config.hash_table_pow,
        );

        let fd = memfd::create_backing(
            config.shm_dir.as_deref(),
            layout.total_size,
            config.minimum_avail,
        )?;
        let base = map_fixed(fd, layout.total_size)?;

        let shm = Self::from_parts(base, layout, fd);
        shm.init_shared_globals(config.log_level, config.sample_rate);
        shm.cell(CELL_MASTER_PID).store(shm.my_pid, Ordering::SeqCst);

        // Checking that we did the maths correctly.
        assert_eq!(
            shm.heap_init_addr() + layout.heap_size,
            base as usize + layout.total_size
        );

        let connector = Connector {
            fd,
            global_size_b: config.global_size_b,
            heap_size: config.heap_size,
            dep_table_pow: config.dep_table_pow,
            hash_table_pow: config.hash_table_pow,
        };
        Ok((shm, connector))
    }

    /// Map the region created by another process's [`SharedMem::init`].
    ///
    /// Must be called by every worker before any store operation. Passing
    /// `is_master = true` transfers the master role to this process.
    pub fn connect(connector: &Connector, is_master: bool) -> Result<Self> {
        let layout = RegionLayout::new(
            connector.global_size_b,
            connector.heap_size,
            connector.dep_table_pow,
            connector.hash_table_pow,
        );
        let base = map_fixed(connector.fd, layout.total_size)?;
        let shm = Self::from_parts(base, layout, connector.fd);
        if is_master {
            shm.cell(CELL_MASTER_PID).store(shm.my_pid, Ordering::SeqCst);
        }
        Ok(shm)
    }

    fn from_parts(base: *mut u8, layout: RegionLayout, fd: i32) -> Self {
        Self {
            base,
            layout,
            fd,
            my_pid: unsafe { libc::getpid() } as u64,
            writes_allowed: AtomicBool::new(true),
            can_exit: AtomicBool::new(true),
            removed_count: AtomicU64::new(0),
        }
    }

    /// Zero and seed every shared global. Master-only, called once from
    /// `init` before any worker exists.
    fn init_shared_globals(&self, log_level: usize, sample_rate: f64) {
        // Global blob starts empty.
        unsafe { *(self.base.add(self.layout.global_off) as *mut u64) = 0 };

        self.cell(CELL_HCOUNTER).store(0, Ordering::SeqCst);
        self.cell(CELL_DCOUNTER).store(0, Ordering::SeqCst);
        self.cell(CELL_COUNTER)
            .store(EARLY_COUNTER.load(Ordering::Relaxed) + 1, Ordering::SeqCst);
        self.cell(CELL_LOG_LEVEL).store(log_level as u64, Ordering::SeqCst);
        self.cell(CELL_SAMPLE_RATE)
            .store(sample_rate.to_bits(), Ordering::SeqCst);
        self.cell(CELL_WORKERS_SHOULD_EXIT).store(0, Ordering::SeqCst);
        self.cell(CELL_WASTED_HEAP).store(0, Ordering::SeqCst);
        self.cell(CELL_ALLOW_REMOVES).store(1, Ordering::SeqCst);
        self.cell(CELL_ALLOW_DEP_READS).store(1, Ordering::SeqCst);
        self.cell(CELL_HEAP_TOP)
            .store(self.heap_init_addr() as u64, Ordering::SeqCst);

        self.clear_sink_path();
    }

    // =========================================================================
    // Shared cells
    // =========================================================================

    fn cell(&self, index: usize) -> &AtomicU64 {
        debug_assert!(index < CELL_COUNT);
        unsafe { &*(self.base.add(index * CACHE_LINE) as *const AtomicU64) }
    }

    pub(crate) fn heap_top(&self) -> &AtomicU64 {
        self.cell(CELL_HEAP_TOP)
    }

    pub(crate) fn hcounter(&self) -> &AtomicU64 {
        self.cell(CELL_HCOUNTER)
    }

    pub(crate) fn dcounter(&self) -> &AtomicU64 {
        self.cell(CELL_DCOUNTER)
    }

    pub(crate) fn wasted_heap(&self) -> &AtomicU64 {
        self.cell(CELL_WASTED_HEAP)
    }

    /// Statistics logging level (0 = nothing).
    pub fn log_level(&self) -> usize {
        self.cell(CELL_LOG_LEVEL).load(Ordering::Relaxed) as usize
    }

    /// Telemetry sampling rate.
    pub fn sample_rate(&self) -> f64 {
        f64::from_bits(self.cell(CELL_SAMPLE_RATE).load(Ordering::Relaxed))
    }

    // =========================================================================
    // Role and phase guards
    // =========================================================================
    //
    // These are hard runtime checks, not debug assertions: they guard the
    // memory safety of the lock-free protocols, not just correctness.

    /// Whether this process currently holds the master role.
    pub fn is_master(&self) -> bool {
        self.my_pid == self.cell(CELL_MASTER_PID).load(Ordering::SeqCst)
    }

    /// Hard check that this process holds the master role.
    pub fn assert_master(&self) {
        assert!(self.is_master(), "operation restricted to the master process");
    }

    /// Hard check that this process does not hold the master role.
    pub fn assert_not_master(&self) {
        assert!(!self.is_master(), "operation restricted to worker processes");
    }

    pub(crate) fn assert_allow_removes(&self) {
        assert!(
            self.cell(CELL_ALLOW_REMOVES).load(Ordering::SeqCst) != 0,
            "removes are not allowed in the current phase"
        );
    }

    pub(crate) fn assert_allow_dep_reads(&self) {
        assert!(
            self.cell(CELL_ALLOW_DEP_READS).load(Ordering::SeqCst) != 0,
            "dependency table reads are not allowed in the current phase"
        );
    }

    pub(crate) fn assert_writes_allowed(&self) {
        assert!(
            self.writes_allowed.load(Ordering::Relaxed),
            "content table writes are disabled for this process"
        );
    }

    /// Enable or disable remove/move/compact operations. Flipped by the
    /// supervisor at phase boundaries.
    pub fn set_allow_removes(&self, allowed: bool) {
        self.cell(CELL_ALLOW_REMOVES)
            .store(allowed as u64, Ordering::SeqCst);
    }

    /// Enable or disable dependency table reads; returns the previous value.
    pub fn allow_dep_reads(&self, allowed: bool) -> bool {
        self.cell(CELL_ALLOW_DEP_READS)
            .swap(allowed as u64, Ordering::SeqCst)
            != 0
    }

    /// Enable or disable content-table writes by this process only.
    pub fn set_writes_allowed(&self, allowed: bool) {
        self.writes_allowed.store(allowed, Ordering::Relaxed);
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Ask every worker to exit at its next store operation. Master-only.
    pub fn stop_workers(&self) {
        self.assert_master();
        self.cell(CELL_WORKERS_SHOULD_EXIT).store(1, Ordering::SeqCst);
    }

    /// Clear the stop flag. Master-only.
    pub fn resume_workers(&self) {
        self.assert_master();
        self.cell(CELL_WORKERS_SHOULD_EXIT).store(0, Ordering::SeqCst);
    }

    /// Control whether this process honors the stop flag. Workers disable
    /// this around critical sections that must not unwind.
    pub fn set_worker_can_exit(&self, can_exit: bool) {
        self.can_exit.store(can_exit, Ordering::Relaxed);
    }

    /// Raise [`ShmError::WorkerShouldExit`] when the master has set the stop
    /// flag and this process allows early exit.
    pub fn check_should_exit(&self) -> Result<()> {
        if self.can_exit.load(Ordering::Relaxed)
            && self.cell(CELL_WORKERS_SHOULD_EXIT).load(Ordering::SeqCst) != 0
        {
            return Err(ShmError::WorkerShouldExit);
        }
        Ok(())
    }

    // =========================================================================
    // Monotonic counter
    // =========================================================================

    /// Next value of the region-wide monotonic counter.
    pub fn counter_next(&self) -> u64 {
        self.cell(CELL_COUNTER).fetch_add(1, Ordering::Relaxed) % COUNTER_MAX
    }

    // =========================================================================
    // Heap bookkeeping
    // =========================================================================

    pub(crate) fn heap_init_addr(&self) -> usize {
        self.base as usize + self.layout.heap_off
    }

    pub(crate) fn heap_max_addr(&self) -> usize {
        self.heap_init_addr() + self.layout.heap_size
    }

    /// Bytes currently bump-allocated in the heap.
    pub fn used_heap_size(&self) -> usize {
        self.heap_top().load(Ordering::SeqCst) as usize - self.heap_init_addr()
    }

    /// Bytes freed by removes but not yet reclaimed by collection.
    pub fn wasted_heap_size(&self) -> usize {
        self.wasted_heap().load(Ordering::SeqCst) as usize
    }

    /// Whether the bump pointer has run past the end of the region.
    pub fn heap_overflow(&self) -> bool {
        self.heap_top().load(Ordering::SeqCst) as usize
            >= self.base as usize + self.layout.total_size
    }

    /// Called once server initialization is complete; the initial live size
    /// anchors the collection heuristic, so it must leave headroom.
    pub fn call_after_init(&self) -> Result<()> {
        if 2 * self.used_heap_size() >= self.layout.heap_size {
            return Err(ShmError::HeapInitTooLarge);
        }
        Ok(())
    }

    /// Count of removes performed by this process.
    pub fn removed_count(&self) -> u64 {
        self.removed_count.load(Ordering::Relaxed)
    }

    pub(crate) fn note_removed(&self, wasted: usize) {
        self.wasted_heap().fetch_add(wasted as u64, Ordering::SeqCst);
        self.removed_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Commit the pages backing `[addr, addr + len)` so that touching them
    /// cannot fault under memory pressure.
    pub(crate) fn commit(&self, addr: usize, len: usize) -> Result<()> {
        memfd::reserve(self.fd, addr - self.base as usize, len)
    }

    // =========================================================================
    // Sink file name page
    // =========================================================================

    /// Record the path of the on-disk dependency file. Must fit in one page.
    pub fn set_sink_path(&self, path: &str) {
        let bytes = path.as_bytes();
        assert!(bytes.len() < self.layout.page_size);
        unsafe {
            let dst = self.base.add(self.layout.sink_name_off);
            std::ptr::write_bytes(dst, 0, self.layout.page_size);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        }
    }

    /// The recorded on-disk dependency file path, if any.
    pub fn sink_path(&self) -> Option<String> {
        let page = unsafe {
            std::slice::from_raw_parts(
                self.base.add(self.layout.sink_name_off),
                self.layout.page_size,
            )
        };
        let len = page.iter().position(|&b| b == 0).unwrap_or(0);
        if len == 0 {
            None
        } else {
            Some(String::from_utf8_lossy(&page[..len]).into_owned())
        }
    }

    /// Forget the on-disk dependency file, returning to in-memory mode.
    pub fn clear_sink_path(&self) {
        unsafe {
            std::ptr::write_bytes(
                self.base.add(self.layout.sink_name_off),
                0,
                self.layout.page_size,
            );
        }
    }

    // =========================================================================
    // Views
    // =========================================================================

    /// The master-writes / workers-read global blob slot.
    pub fn blob(&self) -> GlobalBlob<'_> {
        GlobalBlob::new(self)
    }

    /// The dependency multimap.
    pub fn deps(&self) -> DepTable<'_> {
        DepTable::new(self)
    }

    /// The key/value content table.
    pub fn values(&self) -> ValueTable<'_> {
        ValueTable::new(self)
    }

    /// Whether a collection pass would reclaim enough to be worth running.
    pub fn should_collect(&self, aggressive: bool) -> bool {
        collector::should_collect(self, aggressive)
    }

    /// Compact the heap in place. Master-only, quiescence required; a no-op
    /// unless [`should_collect`](Self::should_collect) holds.
    pub fn collect(&self, aggressive: bool) -> Result<()> {
        collector::collect(self, aggressive)
    }

    /// Snapshot of occupancy and heap counters.
    pub fn stats(&self) -> ShmStats {
        ShmStats::snapshot(self)
    }
}

/// Next value of the monotonic counter, usable before the region exists.
///
/// Until `init` runs there is nothing shared to count on, so a process-local
/// counter stands in; `init` seeds the shared cell past it.
pub fn counter_next(shm: Option<&SharedMem>) -> u64 {
    match shm {
        Some(shm) => shm.counter_next(),
        None => EARLY_COUNTER.fetch_add(1, Ordering::Relaxed) % COUNTER_MAX,
    }
}

/// Map the backing fd at the fixed address.
fn map_fixed(fd: i32, size: usize) -> Result<*mut u8> {
    // MAP_NORESERVE because we want far more virtual memory than we will
    // actually touch.
    let mem = unsafe {
        libc::mmap(
            SHARED_MEM_INIT as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | MAP_NORESERVE | libc::MAP_FIXED,
            fd,
            0,
        )
    };
    if mem == libc::MAP_FAILED {
        return Err(ShmError::MapFailed(errno()));
    }

    // The shared heap is huge and useless in a core file.
    #[cfg(target_os = "linux")]
    unsafe {
        libc::madvise(mem, size, libc::MADV_DONTDUMP);
    }

    Ok(mem as *mut u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn test_init_seeds_globals() {
        testing::region(ShmConfig::small(), |shm| {
            assert!(shm.is_master());
            assert_eq!(shm.used_heap_size(), 0);
            assert_eq!(shm.wasted_heap_size(), 0);
            assert_eq!(shm.log_level(), 0);
            assert!(!shm.heap_overflow());
            assert!(shm.call_after_init().is_ok());
            assert_eq!(shm.sink_path(), None);
        });
    }

    #[test]
    fn test_layout_is_contiguous() {
        let layout = RegionLayout::new(4096, 1024 * 1024, 8, 8);
        assert_eq!(layout.global_off, 2 * layout.page_size);
        assert_eq!(layout.deptbl_off, layout.global_off + 4096);
        assert_eq!(layout.bindings_off, layout.deptbl_off + 256 * 8);
        assert_eq!(layout.hashtbl_off, layout.bindings_off + 256 * 8);
        assert_eq!(layout.heap_off, layout.hashtbl_off + 256 * 16);
        assert_eq!(layout.total_size, layout.heap_off + 1024 * 1024);
    }

    #[test]
    fn test_counter_is_monotonic() {
        let early1 = counter_next(None);
        let early2 = counter_next(None);
        assert!(early2 > early1);

        testing::region(ShmConfig::small(), |shm| {
            let a = shm.counter_next();
            let b = shm.counter_next();
            assert!(b > a);
            assert!(a > early2);
        });
    }

    #[test]
    fn test_stop_flag_protocol() {
        testing::region(ShmConfig::small(), |shm| {
            assert!(shm.check_should_exit().is_ok());

            shm.stop_workers();
            assert_eq!(shm.check_should_exit(), Err(ShmError::WorkerShouldExit));

            // A worker that cannot exit ignores the flag.
            shm.set_worker_can_exit(false);
            assert!(shm.check_should_exit().is_ok());
            shm.set_worker_can_exit(true);

            shm.resume_workers();
            assert!(shm.check_should_exit().is_ok());
        });
    }

    #[test]
    fn test_phase_flags() {
        testing::region(ShmConfig::small(), |shm| {
            assert!(shm.allow_dep_reads(false));
            assert!(!shm.allow_dep_reads(true));
            shm.set_allow_removes(false);
            shm.set_allow_removes(true);
            shm.assert_allow_removes();
        });
    }

    #[test]
    fn test_sink_path_round_trip() {
        testing::region(ShmConfig::small(), |shm| {
            shm.set_sink_path("/tmp/deps.bin");
            assert_eq!(shm.sink_path().as_deref(), Some("/tmp/deps.bin"));
            shm.clear_sink_path();
            assert_eq!(shm.sink_path(), None);
        });
    }

    #[test]
    fn test_connect_sees_master_state() {
        testing::region_with_connector(ShmConfig::small(), |shm, connector| {
            shm.set_sink_path("/tmp/shared.bin");
            // Role checks need a real fork (see tests/fork.rs); in-process
            // the connecting handle shares the master's pid.
            let worker = SharedMem::connect(connector, false).expect("connect failed");
            assert_eq!(worker.sink_path().as_deref(), Some("/tmp/shared.bin"));
            assert_eq!(worker.used_heap_size(), shm.used_heap_size());
        });
    }
}
