//! Shared-memory key/value and dependency store for the tyr type checker.
//!
//! THIS IS NOT A GENERAL-PURPOSE CONCURRENT HASH TABLE. The lock-free data
//! structures here only work because of how the checker's phases are
//! synchronized: workers insert and read concurrently; the master removes,
//! moves, and compacts alone, while workers are paused.
//!
//! # Architecture
//!
//! One master process creates a memory region backed by an anonymous file
//! and maps it at a **fixed virtual address**; forked workers map the same
//! fd at the same address, so raw addresses stored inside the region are
//! valid pointers in every process. Three structures share the region:
//!
//! - **Global blob slot**: one size-prefixed buffer the master uses to hand
//!   an environment to workers (master writes, workers read).
//! - **Dependency table**: a lock-free multimap of 31-bit graph edges,
//!   filled concurrently by workers; a parallel bindings set answers
//!   duplicate checks in O(1).
//! - **Content table**: a lock-free map from digest keys to variable-length
//!   heap entries (LZ4-compressed when that helps), with a bump-allocated
//!   heap and a master-run compacting collector.
//!
//! All cross-process coordination is 64-bit CAS / fetch-add plus the phase
//! discipline; nothing blocks except a bounded busy-wait on slots whose
//! writer is mid-insert.
//!
//! # Usage
//!
//! ```ignore
//! use tyr_shm::{ShmConfig, SharedMem, Payload};
//!
//! let (shm, connector) = SharedMem::init(&ShmConfig::default())?;
//! // ... fork workers; each calls SharedMem::connect(&connector, false) ...
//!
//! shm.deps().add(type_id, dependent_id)?;
//! shm.values().add(key, Payload::Bytes(&decl_blob))?;
//! ```
//!
//! # Safety
//!
//! The protocols require that:
//! - removes, moves, and compaction run only in the master, only while
//!   workers are quiescent (enforced by hard runtime guards);
//! - all writers of a given content-table key produce equivalent payloads;
//! - dependency vertices fit in 31 bits.

pub mod blob;
pub mod codec;
pub mod config;
pub mod deptbl;
pub mod error;
pub mod hashtbl;
pub mod heap;
pub mod region;
pub mod stats;

mod memfd;

// Re-exports for convenient access
pub use blob::GlobalBlob;
pub use codec::{OwnedValue, Payload, ValueCodec};
pub use config::ShmConfig;
pub use deptbl::DepTable;
pub use error::{Result, ShmError};
pub use hashtbl::{key_of_digest, EntryStatus, ValueTable, WRITE_IN_PROGRESS};
pub use heap::{EntryHeader, EntryKind};
pub use region::{counter_next, Connector, SharedMem};
pub use stats::{format_bytes, ShmStats};
