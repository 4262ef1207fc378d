//! On-disk mirror of the shared-memory dependency table.
//!
//! Saving a checker state emits the dependency table as a relational file:
//! a header row carrying a magic constant and the build revision, then one
//! row per key vertex with its value vertices as a little-endian blob.
//! Once the store has been switched to file mode (by a save-with-replace or
//! an explicit [`load`]), dependency queries are answered from the file,
//! bypassing the in-memory table entirely.
//!
//! Each process keeps at most one open reader, created lazily on first
//! query; the file path travels to workers through the region's sink-name
//! page, not through any IPC.

pub mod error;
pub mod format;
pub mod reader;
pub mod writer;

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tyr_shm::SharedMem;

pub use error::{DepFileError, Result};
pub use format::MAGIC_CONSTANT;
pub use reader::{DepFile, DepValues};
pub use writer::{save, update};

/// Environment variable naming the dependency file; empty or unset means
/// the on-disk mirror is disabled.
pub const FILE_INFO_ON_DISK_PATH: &str = "FILE_INFO_ON_DISK_PATH";

/// The dependency file selected by the environment, if any.
pub fn file_info_on_disk_path() -> Option<PathBuf> {
    std::env::var(FILE_INFO_ON_DISK_PATH)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// This process's cached reader. Opening a file is expensive (it builds the
/// whole key index), so it happens once per process, like the prepared
/// statement it replaces.
static CACHED_READER: Mutex<Option<DepFile>> = Mutex::new(None);

pub(crate) fn cache_reader(file: DepFile) {
    *CACHED_READER.lock() = Some(file);
}

/// Verify and adopt an existing dependency file. Master-only.
///
/// `expected_revision` of `None` ignores the recorded build revision; the
/// magic constant is always checked.
pub fn load(shm: &SharedMem, path: &Path, expected_revision: Option<&str>) -> Result<()> {
    shm.assert_master();
    let file = DepFile::open(path, expected_revision)?;
    cache_reader(file);
    shm.set_sink_path(&path.to_string_lossy());
    Ok(())
}

/// Answer a dependency query from the file recorded in the region.
///
/// Returns `None` when the store is in in-memory mode (no file recorded);
/// the caller should query [`tyr_shm::DepTable`] instead. In file mode a
/// worker's first query opens the reader lazily; the master's reader was
/// opened by the save or load that switched modes.
pub fn get_dep(shm: &SharedMem, key: u32) -> Result<Option<DepValues>> {
    let path = match shm.sink_path() {
        None => return Ok(None),
        Some(p) => p,
    };

    let mut cached = CACHED_READER.lock();
    if cached.is_none() {
        // The master must not reach this point: it either owns the
        // in-memory table or already opened its reader when it swapped in
        // the file.
        shm.assert_not_master();
        *cached = Some(DepFile::open(Path::new(&path), None)?);
    }
    Ok(Some(cached.as_mut().expect("reader cached above").get(key)?))
}

/// Forget the dependency file (when falling back from a saved state to a
/// full init): clears the region's sink path and this process's reader.
pub fn cleanup(shm: &SharedMem) {
    shm.clear_sink_path();
    *CACHED_READER.lock() = None;
}
