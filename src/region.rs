//! Backing memory for an arena.
//!
//! [`SharedRegion`] is an anonymous memfd mapped `MAP_SHARED`, which is what
//! cooperating processes use: children forked after creation inherit the
//! mapping, unrelated processes map the same pages by receiving the fd over a
//! Unix socket and calling [`SharedRegion::from_fd`]. Every extra mapping is
//! created through an `unsafe` call, since the allocator cannot see accesses
//! made through the other ones. [`HeapRegion`] is a plain in-process buffer
//! for tests and single-process use.

use std::ffi::CString;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr::NonNull;

use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::mm::{MapFlags, ProtFlags};

/// A fixed-size, 8-byte aligned block of memory an arena can be built in.
///
/// # Safety
///
/// `as_ptr()` must return the same non-null, 8-byte aligned pointer for the
/// whole life of the value, valid for reads and writes of `len()` bytes.
/// Other views of that memory may only be used under the conditions of the
/// `unsafe` call that created them.
pub unsafe trait MemoryRegion: Send + Sync {
    fn as_ptr(&self) -> NonNull<u8>;

    fn len(&self) -> usize;

    /// File descriptor other processes can map, if the region has one.
    fn fd(&self) -> Option<BorrowedFd<'_>> {
        None
    }
}

/// A region backed by Linux memfd (anonymous shared memory).
pub struct SharedRegion {
    /// The memfd file descriptor.
    fd: OwnedFd,
    /// Pointer to the mmap'd region.
    ptr: NonNull<u8>,
    /// Size of the region.
    len: usize,
}

// SAFETY: the mapping is not tied to a thread; access is serialized by the
// arena's external lock.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create a new shared memory region of `size` bytes.
    ///
    /// `name` is only visible in `/proc/<pid>/fd/`.
    pub fn new(name: &str, size: usize) -> rustix::io::Result<Self> {
        if size == 0 {
            return Err(rustix::io::Errno::INVAL);
        }

        let cname = CString::new(name.replace('\0', " ")).map_err(|_| rustix::io::Errno::INVAL)?;
        let fd = rustix::fs::memfd_create(&cname, rustix::fs::MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, size as u64)?;

        unsafe { Self::map(fd, size) }
    }

    /// Map an existing region from its file descriptor.
    ///
    /// The size is taken from the file itself.
    ///
    /// # Safety
    ///
    /// The mapping aliases every other mapping of the same file. The caller
    /// must serialize access to the memory across all of them.
    pub unsafe fn from_fd(fd: OwnedFd) -> rustix::io::Result<Self> {
        let stat = rustix::fs::fstat(&fd)?;
        let size = usize::try_from(stat.st_size).map_err(|_| rustix::io::Errno::INVAL)?;
        if size == 0 {
            return Err(rustix::io::Errno::INVAL);
        }

        unsafe { Self::map(fd, size) }
    }

    /// Duplicate the fd and map the region a second time.
    ///
    /// # Safety
    ///
    /// Same as [`SharedRegion::from_fd`].
    pub unsafe fn try_clone(&self) -> rustix::io::Result<Self> {
        let fd = rustix::io::fcntl_dupfd_cloexec(&self.fd, 0)?;
        unsafe { Self::from_fd(fd) }
    }

    unsafe fn map(fd: OwnedFd, size: usize) -> rustix::io::Result<Self> {
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };

        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or(rustix::io::Errno::NOMEM)?;

        Ok(Self { fd, ptr, len: size })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

unsafe impl MemoryRegion for SharedRegion {
    fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    fn len(&self) -> usize {
        self.len
    }

    fn fd(&self) -> Option<BorrowedFd<'_>> {
        Some(self.fd.as_fd())
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // detaching is best effort
        if let Err(e) = unsafe { rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len) } {
            log::warn!("cannot unmap shared memory region: {}", e);
        }
    }
}

/// A region on the process heap.
pub struct HeapRegion {
    ptr: NonNull<[u64]>,
    len: usize,
}

// SAFETY: the buffer is exclusively owned; access is serialized by the
// arena's external lock.
unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

impl HeapRegion {
    pub fn new(size: usize) -> Self {
        let storage = vec![0u64; size.div_ceil(8)].into_boxed_slice();
        Self {
            ptr: NonNull::from(Box::leak(storage)),
            len: size,
        }
    }
}

unsafe impl MemoryRegion for HeapRegion {
    fn as_ptr(&self) -> NonNull<u8> {
        self.ptr.cast::<u8>()
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        drop(unsafe { Box::from_raw(self.ptr.as_ptr()) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_region_second_mapping_sees_writes() {
        let first = SharedRegion::new("region-test", 4096).unwrap();
        let second = unsafe { first.try_clone() }.unwrap();

        assert_eq!(second.len(), 4096);
        assert_ne!(first.as_ptr(), second.as_ptr());

        unsafe { first.as_ptr().as_ptr().add(100).write(0xA5) };
        assert_eq!(unsafe { second.as_ptr().as_ptr().add(100).read() }, 0xA5);
    }

    #[test]
    fn test_shared_region_rejects_zero_size() {
        assert!(SharedRegion::new("empty", 0).is_err());
    }

    #[test]
    fn test_heap_region_alignment() {
        let region = HeapRegion::new(1001);
        assert_eq!(region.len(), 1001);
        assert_eq!(region.as_ptr().as_ptr() as usize % 8, 0);
        assert!(region.fd().is_none());
    }
}
