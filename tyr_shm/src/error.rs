//! Error types for the shared-memory store.
//!
//! Every failure here is a distinguishable value so that the supervisor can
//! tell a resource limit (grow the region and restart) from cooperative
//! cancellation (unwind the worker back to its supervisor). With the single
//! exception of [`ShmError::WorkerShouldExit`], these are fatal: the store
//! never retries.

use std::fmt;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ShmError>;

/// Errors surfaced by the shared-memory store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShmError {
    /// A page-level commit of shared memory failed.
    OutOfSharedMemory,
    /// No anonymous memory backend (memfd or shm object) is available.
    FailedAnonymousMemfdInit,
    /// The backing directory has less free space than the configured floor.
    /// Carries the observed number of available bytes.
    LessThanMinimumAvailable(u64),
    /// The bump allocator ran past the end of the heap.
    HeapFull,
    /// No free probe slot before wrapping back to the initial slot.
    HashTableFull,
    /// The dependency bindings table exceeded its capacity.
    DepTableFull,
    /// The master requested that workers exit; cooperative cancellation.
    WorkerShouldExit,
    /// A reader spun on a write-in-progress slot for over 60 seconds,
    /// meaning the writer almost certainly died mid-insert.
    WatchdogStuck,
    /// The live heap is already more than half the heap budget, so
    /// collection would never trigger.
    HeapInitTooLarge,
    /// Mapping the region at its fixed address failed. Carries errno.
    MapFailed(i32),
    /// A raw OS call failed. Carries the call name and errno.
    Sys(&'static str, i32),
    /// Invalid configuration. Carries a description of the offending knob.
    Config(&'static str),
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShmError::OutOfSharedMemory => write!(f, "out of shared memory"),
            ShmError::FailedAnonymousMemfdInit => {
                write!(f, "no anonymous memory backend available")
            }
            ShmError::LessThanMinimumAvailable(avail) => {
                write!(f, "backing directory has only {} bytes available", avail)
            }
            ShmError::HeapFull => write!(f, "shared heap is full"),
            ShmError::HashTableFull => write!(f, "hash table is full"),
            ShmError::DepTableFull => write!(f, "dependency table is full"),
            ShmError::WorkerShouldExit => write!(f, "worker should exit"),
            ShmError::WatchdogStuck => {
                write!(f, "busy-wait on write-in-progress slot stuck for 60s")
            }
            ShmError::HeapInitTooLarge => write!(
                f,
                "heap init size is too close to max heap size; collection would never trigger"
            ),
            ShmError::MapFailed(errno) => {
                write!(f, "mapping shared memory at fixed address failed (errno {})", errno)
            }
            ShmError::Sys(call, errno) => write!(f, "{} failed (errno {})", call, errno),
            ShmError::Config(what) => write!(f, "invalid configuration: {}", what),
        }
    }
}

impl std::error::Error for ShmError {}
