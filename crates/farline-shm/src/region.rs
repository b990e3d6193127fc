//! Shared-region acquisition and aligned allocation.
//!
//! A [`SharedRegion`] is an mmap'd byte range that both sides of a queue can
//! reach. Three backings cover the deployment spectrum:
//!
//! - [`SharedRegion::anon`] - anonymous `memfd`, for tests and single-process
//!   use;
//! - [`SharedRegion::create_file`] / [`SharedRegion::open_file`] - a named
//!   file (typically under `/dev/shm`), for two cooperating processes;
//! - [`SharedRegion::device`] - a raw character device such as `/dev/dax1.0`
//!   at a page-aligned offset, for CXL- or PMEM-backed deployments.
//!
//! Carving the region into queue pieces goes through [`alloc_aligned`]: a
//! bump allocator with a locked cursor. Allocation only happens at wiring
//! time; the hot paths never touch it.
//!
//! [`alloc_aligned`]: SharedRegion::alloc_aligned

use std::ffi::CString;
use std::io;
use std::path::Path;
use std::ptr::NonNull;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

/// Default alignment handed out by the allocator - one cache line.
pub const LINE_ALIGN: usize = 64;

/// Errors from mapping or carving a shared region.
#[derive(Debug, Error)]
pub enum RegionError {
    /// The underlying open/truncate/map call failed.
    #[error("region io: {0}")]
    Io(#[from] io::Error),
    /// A device mapping offset was not page-aligned.
    #[error("device offset {0:#x} is not page-aligned")]
    UnalignedOffset(u64),
    /// Requested alignment was zero or not a power of two.
    #[error("alignment {0} is not a power of two")]
    BadAlignment(usize),
    /// The bump cursor cannot satisfy the request.
    #[error("region exhausted: requested {requested} bytes, {remaining} remaining")]
    Exhausted { requested: usize, remaining: usize },
    /// A path contained an interior NUL byte.
    #[error("invalid path")]
    InvalidPath,
}

/// An mmap'd shared byte range with a bump cursor for aligned carving.
pub struct SharedRegion {
    base: NonNull<u8>,
    len: usize,
    cursor: Mutex<usize>,
    fd: libc::c_int,
}

// SAFETY: the mapping is plain shared memory; the cursor is mutex-guarded
// and the mapped bytes themselves carry no Rust aliasing obligations.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Map `len` bytes of anonymous shared memory backed by a memfd.
    pub fn anon(len: usize) -> Result<Self, RegionError> {
        let name = CString::new("farline-region").expect("static name");
        // SAFETY: name is a valid NUL-terminated string.
        let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Self::map_fd(fd, len, true, 0)
    }

    /// Create (or truncate) a named backing file and map `len` bytes of it.
    ///
    /// The first process of a two-process deployment calls this; the peer
    /// attaches with [`open_file`](Self::open_file).
    pub fn create_file(path: impl AsRef<Path>, len: usize) -> Result<Self, RegionError> {
        let fd = open_path(path.as_ref(), libc::O_RDWR | libc::O_CREAT, 0o600)?;
        Self::map_fd(fd, len, true, 0)
    }

    /// Map `len` bytes of an existing backing file without resizing it.
    pub fn open_file(path: impl AsRef<Path>, len: usize) -> Result<Self, RegionError> {
        let fd = open_path(path.as_ref(), libc::O_RDWR, 0)?;
        Self::map_fd(fd, len, false, 0)
    }

    /// Map `len` bytes of a raw device (e.g. `/dev/dax1.0`) at `offset`.
    ///
    /// The offset must be page-aligned; the device is never truncated.
    pub fn device(path: impl AsRef<Path>, offset: u64, len: usize) -> Result<Self, RegionError> {
        let page = page_size() as u64;
        if offset % page != 0 {
            return Err(RegionError::UnalignedOffset(offset));
        }
        let fd = open_path(path.as_ref(), libc::O_RDWR | libc::O_SYNC, 0)?;
        Self::map_fd(fd, len, false, offset)
    }

    fn map_fd(
        fd: libc::c_int,
        len: usize,
        truncate: bool,
        offset: u64,
    ) -> Result<Self, RegionError> {
        if truncate {
            // SAFETY: fd is a freshly opened file descriptor we own.
            if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
                let err = io::Error::last_os_error();
                // SAFETY: fd is open and owned by us.
                unsafe { libc::close(fd) };
                return Err(err.into());
            }
        }
        // SAFETY: fd is valid; length and protection flags are well-formed.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                offset as libc::off_t,
            )
        };
        if base == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            // SAFETY: fd is open and owned by us.
            unsafe { libc::close(fd) };
            return Err(err.into());
        }
        debug!(len, offset, "mapped shared region");
        Ok(Self {
            // mmap returned non-NULL (MAP_FAILED is -1, checked above).
            base: NonNull::new(base as *mut u8).expect("mmap returned null"),
            len,
            cursor: Mutex::new(0),
            fd,
        })
    }

    /// Base address of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Total mapped length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes handed out so far.
    pub fn used(&self) -> usize {
        *self.cursor.lock()
    }

    /// Bytes still available to the bump cursor.
    pub fn remaining(&self) -> usize {
        self.len - self.used()
    }

    /// Carve `bytes` bytes aligned to `align` off the region.
    ///
    /// Both sides of a two-process deployment must perform the same sequence
    /// of allocations to derive identical addresses.
    pub fn alloc_aligned(&self, bytes: usize, align: usize) -> Result<NonNull<u8>, RegionError> {
        if align == 0 || !align.is_power_of_two() {
            return Err(RegionError::BadAlignment(align));
        }
        let mut cursor = self.cursor.lock();
        let base = self.base.as_ptr() as usize;
        let aligned = (base + *cursor + align - 1) & !(align - 1);
        let offset = aligned - base;
        if offset + bytes > self.len {
            return Err(RegionError::Exhausted {
                requested: bytes,
                remaining: self.len - *cursor,
            });
        }
        *cursor = offset + bytes;
        // SAFETY: aligned is derived from the non-null base and lies inside
        // the mapping.
        Ok(unsafe { NonNull::new_unchecked(aligned as *mut u8) })
    }

    /// Carve `bytes` with the default cache-line alignment.
    pub fn alloc_lines(&self, bytes: usize) -> Result<NonNull<u8>, RegionError> {
        self.alloc_aligned(bytes, LINE_ALIGN)
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: base/len describe a live mapping created by map_fd; fd is
        // owned by this region.
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len);
            libc::close(self.fd);
        }
    }
}

fn open_path(path: &Path, flags: libc::c_int, mode: libc::mode_t) -> Result<libc::c_int, RegionError> {
    use std::os::unix::ffi::OsStrExt;
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| RegionError::InvalidPath)?;
    // SAFETY: c_path is a valid NUL-terminated string.
    let fd = unsafe { libc::open(c_path.as_ptr(), flags, mode as libc::c_uint) };
    if fd < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(fd)
}

fn page_size() -> usize {
    // SAFETY: sysconf with a valid name has no preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anon_region_allocates_aligned_blocks() {
        let region = SharedRegion::anon(1 << 16).unwrap();
        let a = region.alloc_lines(64).unwrap();
        let b = region.alloc_lines(8).unwrap();
        let c = region.alloc_lines(64).unwrap();

        assert_eq!(a.as_ptr() as usize % 64, 0);
        assert_eq!(b.as_ptr() as usize % 64, 0);
        assert_eq!(c.as_ptr() as usize % 64, 0);
        assert!(b.as_ptr() as usize >= a.as_ptr() as usize + 64);
        assert!(c.as_ptr() as usize >= b.as_ptr() as usize + 64);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let region = SharedRegion::anon(4096).unwrap();
        assert!(region.alloc_lines(4096).is_ok());
        assert!(matches!(
            region.alloc_lines(64),
            Err(RegionError::Exhausted { .. })
        ));
    }

    #[test]
    fn bad_alignment_is_rejected() {
        let region = SharedRegion::anon(4096).unwrap();
        assert!(matches!(
            region.alloc_aligned(64, 3),
            Err(RegionError::BadAlignment(3))
        ));
    }

    #[test]
    fn file_backed_region_round_trips_between_mappings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");

        let writer = SharedRegion::create_file(&path, 4096).unwrap();
        let w = writer.alloc_lines(64).unwrap();
        // SAFETY: w points at 64 writable bytes we just allocated.
        unsafe { w.as_ptr().cast::<u64>().write_volatile(0xFEED) };

        let reader = SharedRegion::open_file(&path, 4096).unwrap();
        let r = reader.alloc_lines(64).unwrap();
        // SAFETY: same offset in the same backing file, 64 readable bytes.
        let got = unsafe { r.as_ptr().cast::<u64>().read_volatile() };
        assert_eq!(got, 0xFEED);
    }
}
