//! Reading a dependency file.
//!
//! Opening a file verifies its header and builds an in-memory index from
//! key vertex to the file offset of its value blob; lookups then cost one
//! seek and one read. The blobs themselves are not resident.

use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::Path;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::error::{DepFileError, Result};
use crate::format::{self, Record};

/// The value list for one key; most keys have few dependents.
pub type DepValues = SmallVec<[u32; 8]>;

/// An open dependency file.
#[derive(Debug)]
pub struct DepFile {
    file: File,
    build_revision: String,
    /// key vertex -> (blob offset, blob byte length)
    index: FxHashMap<u32, (u64, u32)>,
}

impl DepFile {
    /// Open and verify a dependency file.
    ///
    /// `expected_revision` of `None` skips the build-revision check (the
    /// magic is always verified).
    pub fn open(path: &Path, expected_revision: Option<&str>) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let build_revision = format::read_header(&mut reader)?;
        if let Some(expected) = expected_revision {
            if build_revision != expected {
                return Err(DepFileError::BuildRevisionMismatch(
                    expected.to_string(),
                    build_revision,
                ));
            }
        }

        let mut index = FxHashMap::default();
        loop {
            match format::read_record(&mut reader)? {
                Record::Done => break,
                Record::Row { key, blob_len } => {
                    let offset = reader.stream_position()?;
                    index.insert(key, (offset, blob_len));
                    format::skip_blob(&mut reader, blob_len)?;
                }
            }
        }

        Ok(Self {
            file: reader.into_inner(),
            build_revision,
            index,
        })
    }

    /// The build revision recorded in the header.
    pub fn build_revision(&self) -> &str {
        &self.build_revision
    }

    /// Number of keys in the file.
    pub fn key_count(&self) -> usize {
        self.index.len()
    }

    /// The values bound to `key`; empty when the key has no row.
    pub fn get(&mut self, key: u32) -> Result<DepValues> {
        let (offset, blob_len) = match self.index.get(&key) {
            None => return Ok(DepValues::new()),
            Some(&entry) => entry,
        };
        self.file.seek(SeekFrom::Start(offset))?;
        let values = format::read_blob(&mut self.file, blob_len)?;
        Ok(DepValues::from_vec(values))
    }

    /// Every `(key, values)` row in the file.
    pub fn rows(&mut self) -> Result<Vec<(u32, Vec<u32>)>> {
        let keys: Vec<u32> = self.index.keys().copied().collect();
        let mut rows = Vec::with_capacity(keys.len());
        for key in keys {
            let values = self.get(key)?;
            rows.push((key, values.into_vec()));
        }
        Ok(rows)
    }
}
