//! Shared memory allocator for process-shared caches
//!
//! This crate implements a boundary-tag allocator that lives entirely inside
//! one fixed-size shared memory region, featuring:
//! - Boundary tags at both ends of every chunk for O(1) neighbor lookup
//! - Segregated free lists (exact 8-byte size classes plus one first-fit overflow list)
//! - Eager coalescing on free
//! - In-place realloc with an allocate-copy-free fallback
//! - Offset based addressing so the region can be mapped at different
//!   addresses in different processes
//!
//! The allocator has no internal locking. Every operation goes through an
//! [`ArenaAccess`], which mutably borrows the [`Arena`], so threads share an
//! arena only behind a lock such as [`LockedArena`].
//!
//! ```rust,ignore
//! use shmem_alloc::{Arena, LockedArena};
//!
//! let cache = LockedArena::new(Arena::create(1 << 20, "value cache", "ValueCacheSize", true)?);
//!
//! let mut guard = cache.lock();
//! let mut access = guard.access();
//! let off = access.allocate(100)?.expect("arena exhausted");
//! access.payload_mut(off)?[..5].copy_from_slice(b"hello");
//! access.release(off)?;
//! ```

use core::alloc::Layout;
use core::ptr::NonNull;

pub mod arena;
pub mod lock;
pub mod region;
pub mod shmem;

pub use arena::{required_size, Arena, ArenaAccess, ArenaError, ShmOffset};
pub use lock::LockedArena;
pub use region::{HeapRegion, MemoryRegion, SharedRegion};
pub use shmem::bucket::{bucket_by_size, BUCKET_COUNT};
pub use shmem::chunk::ChunkState;
pub use shmem::stats::ShmemStats;

/// The error type used for allocation.
///
/// Every variant is unrecoverable: the shared state can no longer be trusted
/// or the arena is undersized. Exhaustion of an arena that tolerates it is not
/// an error and is reported as `Ok(None)` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// Invalid `size` or alignment. (e.g. zero-sized or too large request)
    #[error("invalid allocation size or alignment")]
    InvalidParam,
    /// No enough memory to allocate.
    #[error("out of shared memory")]
    NoMemory,
    /// Deallocate an unallocated memory region.
    #[error("address was not allocated from this arena")]
    NotAllocated,
}

/// A [`Result`] type with [`AllocError`] as the error type.
pub type AllocResult<T = ()> = Result<T, AllocError>;

/// Lets the embedding application turn an unrecoverable allocator error into
/// a process abort.
pub trait AllocResultExt<T> {
    /// Returns the value, or logs the error and aborts the process.
    fn or_abort(self) -> T;
}

impl<T> AllocResultExt<T> for AllocResult<T> {
    fn or_abort(self) -> T {
        match self {
            Ok(value) => value,
            Err(e) => {
                log::error!("shared memory allocator: unrecoverable error: {}", e);
                std::process::abort();
            }
        }
    }
}

/// Byte-granularity allocator.
pub trait ByteAllocator {
    /// Allocate memory with the given size (in bytes) and alignment.
    fn alloc(&mut self, layout: Layout) -> AllocResult<NonNull<u8>>;

    /// Deallocate memory at the given position, size, and alignment.
    fn dealloc(&mut self, pos: NonNull<u8>, layout: Layout);

    /// Returns total memory size in bytes.
    fn total_bytes(&self) -> usize;

    /// Returns allocated memory size in bytes.
    fn used_bytes(&self) -> usize;

    /// Returns available memory size in bytes.
    fn available_bytes(&self) -> usize;
}

#[inline]
const fn align_down(pos: usize, align: usize) -> usize {
    pos & !(align - 1)
}

#[inline]
const fn align_up(pos: usize, align: usize) -> usize {
    (pos + align - 1) & !(align - 1)
}

/// Checks whether the address has the demanded alignment.
///
/// Equivalent to `addr % align == 0`, but the alignment must be a power of two.
#[inline]
const fn is_aligned(base_addr: usize, align: usize) -> bool {
    base_addr & (align - 1) == 0
}
