//! Anonymous backing-file creation for the shared region.
//!
//! The region must be backed by a file descriptor rather than a plain
//! anonymous mapping so that spawned workers can inherit it across fork and
//! re-map it at the same address. The preferred backend is an in-RAM
//! anonymous file (`memfd_create` on Linux, an unlinked shm object on
//! macOS). When a backing directory is configured, an `mkstemp`/`unlink`
//! temp file is used instead, which allows picking a partition larger than
//! `/dev/shm`.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::path::Path;

use crate::error::{Result, ShmError};

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

// =============================================================================
// Platform-specific backends
// =============================================================================

#[cfg(target_os = "linux")]
mod platform {
    use std::os::unix::io::RawFd;

    use crate::error::{Result, ShmError};

    /// Create an anonymous in-RAM file, or None if the kernel lacks memfd.
    pub fn anonymous_fd() -> Option<RawFd> {
        let name = b"tyr_heap\0";
        let fd = unsafe { libc::memfd_create(name.as_ptr() as *const libc::c_char, 0) };
        if fd < 0 {
            None
        } else {
            Some(fd)
        }
    }

    /// Force allocation of a byte range of the backing file.
    ///
    /// Optional on Linux, but it turns a would-be `SIGBUS` under memory
    /// pressure into an explicit out-of-shared-memory error.
    pub fn reserve(fd: RawFd, offset: usize, len: usize) -> Result<()> {
        loop {
            let rc =
                unsafe { libc::posix_fallocate(fd, offset as libc::off_t, len as libc::off_t) };
            match rc {
                0 => return Ok(()),
                libc::EINTR => continue,
                _ => return Err(ShmError::OutOfSharedMemory),
            }
        }
    }
}

#[cfg(target_os = "macos")]
mod platform {
    use std::os::unix::io::RawFd;

    use crate::error::Result;

    /// Create an anonymous shm object, unlinked so it dies with the last fd.
    pub fn anonymous_fd() -> Option<RawFd> {
        let name = format!("/tyr_heap.{}\0", unsafe { libc::getpid() });
        let name_ptr = name.as_ptr() as *const libc::c_char;
        unsafe {
            // A stale object with our name would make the ftruncate below
            // fail with EINVAL the second time around.
            libc::shm_unlink(name_ptr);
            let fd = libc::shm_open(name_ptr, libc::O_CREAT | libc::O_RDWR, 0o666 as libc::c_uint);
            if fd < 0 {
                return None;
            }
            libc::shm_unlink(name_ptr);

            // shm_open sets FD_CLOEXEC; unset it so spawned workers can
            // inherit the descriptor and reconnect.
            let flags = libc::fcntl(fd, libc::F_GETFD);
            if flags >= 0 {
                libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC);
            }
            Some(fd)
        }
    }

    /// `posix_fallocate` does not exist here and `F_PREALLOCATE` does not
    /// work on shm objects, so out-of-memory detection is weaker on macOS.
    pub fn reserve(_fd: RawFd, _offset: usize, _len: usize) -> Result<()> {
        Ok(())
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
mod platform {
    use std::os::unix::io::RawFd;

    use crate::error::Result;

    pub fn anonymous_fd() -> Option<RawFd> {
        None
    }

    pub fn reserve(_fd: RawFd, _offset: usize, _len: usize) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Backend-independent front end
// =============================================================================

/// Fail init unless the backing directory has at least `minimum_avail`
/// bytes free.
fn assert_avail_exceeds_minimum(dir: &Path, minimum_avail: u64) -> Result<()> {
    if minimum_avail == 0 {
        return Ok(());
    }
    let c_dir = CString::new(dir.as_os_str().as_encoded_bytes())
        .map_err(|_| ShmError::Config("shm_dir contains an interior NUL byte"))?;
    let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(c_dir.as_ptr(), &mut stats) } != 0 {
        return Err(ShmError::Sys("statvfs", errno()));
    }
    let avail = stats.f_bsize as u64 * stats.f_bavail as u64;
    if avail < minimum_avail {
        return Err(ShmError::LessThanMinimumAvailable(avail));
    }
    Ok(())
}

/// Create an unlinked temp file in `dir` to back the region.
fn tempfile_fd(dir: &Path) -> Result<RawFd> {
    let mut template = dir.as_os_str().as_encoded_bytes().to_vec();
    template.extend_from_slice(b"/tyr_heap-XXXXXX\0");
    let fd = unsafe { libc::mkstemp(template.as_mut_ptr() as *mut libc::c_char) };
    if fd < 0 {
        return Err(ShmError::Sys("mkstemp", errno()));
    }
    unsafe { libc::unlink(template.as_ptr() as *const libc::c_char) };
    Ok(fd)
}

/// Create the region's backing file descriptor and size it.
///
/// `shm_dir = None` selects the anonymous in-RAM backend; otherwise a temp
/// file in `shm_dir` is used, subject to the free-space floor.
pub(crate) fn create_backing(
    shm_dir: Option<&Path>,
    size: usize,
    minimum_avail: u64,
) -> Result<RawFd> {
    let fd = match shm_dir {
        None => platform::anonymous_fd().ok_or(ShmError::FailedAnonymousMemfdInit)?,
        Some(dir) => {
            assert_avail_exceeds_minimum(dir, minimum_avail)?;
            tempfile_fd(dir)?
        }
    };
    if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
        let e = errno();
        unsafe { libc::close(fd) };
        return Err(ShmError::Sys("ftruncate", e));
    }
    Ok(fd)
}

/// Commit a byte range of the backing file so that touching it cannot fault.
pub(crate) fn reserve(fd: RawFd, offset: usize, len: usize) -> Result<()> {
    platform::reserve(fd, offset, len)
}
