//! The global blob slot.
//!
//! One size-prefixed byte buffer the master uses to hand an environment to
//! the workers: the master stores, the workers read. Only concurrent reads
//! are allowed; store/clear happen while workers are quiescent. Several
//! higher layers share this one area, so the length word doubles as an
//! in-use flag: callers must clear the slot before the next store.

use crate::error::Result;
use crate::region::SharedMem;

/// View over the global blob slot. Obtain via [`SharedMem::blob`].
pub struct GlobalBlob<'shm> {
    shm: &'shm SharedMem,
}

impl<'shm> GlobalBlob<'shm> {
    pub(crate) fn new(shm: &'shm SharedMem) -> Self {
        Self { shm }
    }

    fn len_ptr(&self) -> *mut u64 {
        unsafe { self.shm.base.add(self.shm.layout.global_off) as *mut u64 }
    }

    fn data_ptr(&self) -> *mut u8 {
        unsafe { self.shm.base.add(self.shm.layout.global_off + 8) }
    }

    /// Bytes currently stored; zero means the slot is free.
    pub fn len(&self) -> usize {
        unsafe { *self.len_ptr() as usize }
    }

    /// Whether the slot is free.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store a blob. Master-only; the slot must be clear and the payload
    /// must fit under the configured size minus the length word.
    pub fn store(&self, data: &[u8]) -> Result<()> {
        self.shm.assert_master();
        assert_eq!(self.len(), 0, "global blob slot is already in use");
        assert!(
            data.len() < self.shm.layout.global_size_b - 8,
            "global blob does not fit in its slot"
        );

        unsafe {
            *self.len_ptr() = data.len() as u64;
            self.shm.commit(self.data_ptr() as usize, data.len())?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.data_ptr(), data.len());
        }
        Ok(())
    }

    /// Copy the stored blob out. The slot must be non-empty.
    pub fn load(&self) -> Vec<u8> {
        let len = self.len();
        assert!(len != 0, "global blob slot is empty");
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.data_ptr(), out.as_mut_ptr(), len);
        }
        out
    }

    /// Release the slot. Master-only.
    pub fn clear(&self) {
        self.shm.assert_master();
        unsafe { *self.len_ptr() = 0 };
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ShmConfig;
    use crate::testing;

    #[test]
    fn test_store_load_clear() {
        testing::region(ShmConfig::small(), |shm| {
            let blob = shm.blob();
            assert!(blob.is_empty());

            blob.store(b"abc").expect("store failed");
            assert_eq!(blob.len(), 3);
            assert_eq!(blob.load(), b"abc");

            blob.clear();
            assert!(blob.is_empty());

            // The slot is reusable after a clear.
            blob.store(b"defg").expect("second store failed");
            assert_eq!(blob.load(), b"defg");
        });
    }

    #[test]
    #[should_panic(expected = "already in use")]
    fn test_double_store_panics() {
        testing::region(ShmConfig::small(), |shm| {
            shm.blob().store(b"abc").unwrap();
            let _ = shm.blob().store(b"xyz");
        });
    }

    #[test]
    #[should_panic(expected = "empty")]
    fn test_load_empty_panics() {
        testing::region(ShmConfig::small(), |shm| {
            let _ = shm.blob().load();
        });
    }
}
