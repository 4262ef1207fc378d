//! Writing the in-memory dependency table out to a file.
//!
//! Saving walks every head chain in the shared table and emits one row per
//! key. Update mode folds new edges into any rows already on disk; after
//! incremental changes the file may hold more edges than the live graph,
//! but never misses any.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use rustc_hash::FxHashMap;
use tyr_shm::SharedMem;

use crate::error::Result;
use crate::format;
use crate::reader::DepFile;

/// Write the table to `path`, replacing any existing file. Returns the
/// number of edges written. Master-only.
///
/// With `replace_state_after_saving` the store switches to file-backed
/// dependency queries: the path is recorded in the region and the in-memory
/// table is reset.
pub fn save(
    shm: &SharedMem,
    path: &Path,
    build_revision: &str,
    replace_state_after_saving: bool,
) -> Result<u64> {
    shm.assert_master();
    let rows: Vec<(u32, Vec<u32>)> = shm.deps().rows().collect();
    let edges_added = write_rows(path, build_revision, rows)?;
    if replace_state_after_saving {
        swap_to_file(shm, path)?;
    }
    Ok(edges_added)
}

/// Merge the table into the file at `path`. Returns the number of
/// in-memory edges merged in. Master-only.
pub fn update(
    shm: &SharedMem,
    path: &Path,
    build_revision: &str,
    replace_state_after_saving: bool,
) -> Result<u64> {
    shm.assert_master();

    let mut existing: FxHashMap<u32, Vec<u32>> = FxHashMap::default();
    if path.exists() {
        let mut file = DepFile::open(path, None)?;
        for (key, values) in file.rows()? {
            existing.insert(key, values);
        }
    }

    let mut edges_added = 0u64;
    let mut merged: Vec<(u32, Vec<u32>)> = Vec::new();
    for (key, mut values) in shm.deps().rows() {
        edges_added += values.len() as u64;
        if let Some(old) = existing.remove(&key) {
            values.extend(old);
        }
        merged.push((key, values));
    }
    // Rows for keys with no new edges survive untouched.
    merged.extend(existing);

    write_rows(path, build_revision, merged)?;
    if replace_state_after_saving {
        swap_to_file(shm, path)?;
    }
    Ok(edges_added)
}

fn write_rows(path: &Path, build_revision: &str, mut rows: Vec<(u32, Vec<u32>)>) -> Result<u64> {
    // Slot order is a function of the hash; sort so files diff cleanly.
    rows.sort_unstable_by_key(|(key, _)| *key);

    let mut w = BufWriter::new(File::create(path)?);
    format::write_header(&mut w, build_revision)?;
    let mut edges = 0u64;
    for (key, values) in &rows {
        if values.is_empty() {
            continue;
        }
        format::write_row(&mut w, *key, values)?;
        edges += values.len() as u64;
    }
    format::write_done(&mut w)?;
    w.flush()?;
    Ok(edges)
}

/// Record `path` as the store's dependency source and retire the in-memory
/// table.
fn swap_to_file(shm: &SharedMem, path: &Path) -> Result<()> {
    let file = DepFile::open(path, None)?;
    crate::cache_reader(file);
    shm.set_sink_path(&path.to_string_lossy());
    shm.deps().reset();
    Ok(())
}
