//! Arena manager and the exclusive access API.
//!
//! An [`Arena`] owns its mapping of the region. All allocator operations go
//! through an [`ArenaAccess`], which borrows the arena mutably, so within one
//! process the borrow checker serializes them: sharing an arena between
//! threads takes a lock around it (see [`LockedArena`]). Other mappings of the
//! same region are only created through `unsafe` constructors whose callers
//! promise to serialize every mapping through one process-shared lock.
//!
//! [`LockedArena`]: crate::LockedArena

use core::alloc::Layout;
use core::fmt;
use core::marker::PhantomData;
use core::num::NonZeroUsize;
use core::ptr::NonNull;

use log::{debug, error, Level};
use rustix::fd::{BorrowedFd, OwnedFd};

use crate::region::{MemoryRegion, SharedRegion};
use crate::shmem::bucket::MIN_ALLOC;
use crate::shmem::chunk::{ChunkState, TAG_SIZE};
use crate::shmem::stats::{MemoryStatsReporter, ShmemStats};
use crate::shmem::{ShmemInfo, HEADER_SIZE, MAX_REGION_SIZE, MIN_REGION_SIZE};
use crate::{align_up, is_aligned, AllocError, AllocResult, AllocResultExt, ByteAllocator};

/// Errors raised while creating or attaching an arena.
#[derive(Debug, thiserror::Error)]
pub enum ArenaError {
    #[error("requested size {size} not within bounds [{min} <= size <= {max}]")]
    SizeOutOfBounds { size: usize, min: usize, max: usize },

    #[error("shared memory of {size} bytes is too small for {descr}")]
    TooSmall { size: usize, descr: String },

    #[error("cannot set up shared memory of {size} bytes for {descr}: {source}")]
    Os {
        size: usize,
        descr: String,
        #[source]
        source: rustix::io::Errno,
    },

    #[error("shared memory region does not hold an arena")]
    InvalidHeader,
}

/// Offset of a payload from the start of its arena's region.
///
/// Offsets mean the same thing in every process that maps the arena, which
/// is what makes them safe to store inside shared data structures.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShmOffset(NonZeroUsize);

impl ShmOffset {
    /// Wrap a raw offset, e.g. one read back from shared memory.
    pub const fn new(offset: usize) -> Option<Self> {
        match NonZeroUsize::new(offset) {
            Some(offset) => Some(Self(offset)),
            None => None,
        }
    }

    pub const fn get(self) -> usize {
        self.0.get()
    }

    fn from_chunk(chunk: usize) -> Self {
        debug_assert!(chunk != 0, "chunk offset 0 is the arena header");
        match NonZeroUsize::new(chunk + TAG_SIZE) {
            Some(offset) => Self(offset),
            None => unreachable!("payload offset wrapped around"),
        }
    }
}

impl fmt::Debug for ShmOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShmOffset({:#x})", self.get())
    }
}

/// Bookkeeping bytes needed by an arena holding `chunks_num` chunks.
///
/// Covers the header, both strings and two boundary tags per chunk; callers
/// add the payload bytes they intend to store.
pub fn required_size(chunks_num: usize, descr: &str, param: &str) -> usize {
    align_up(HEADER_SIZE + descr.len() + param.len(), 8) + chunks_num * 2 * TAG_SIZE
}

fn check_region_size(size: usize) -> Result<(), ArenaError> {
    if !(MIN_REGION_SIZE..=MAX_REGION_SIZE).contains(&size) {
        error!(
            "requested size {} not within bounds [{} <= size <= {}]",
            size, MIN_REGION_SIZE, MAX_REGION_SIZE
        );
        return Err(ArenaError::SizeOutOfBounds {
            size,
            min: MIN_REGION_SIZE,
            max: MAX_REGION_SIZE,
        });
    }
    Ok(())
}

/// A shared memory arena.
///
/// Dropping the arena unmaps its region in this process. Other processes
/// that mapped it keep their own mapping.
pub struct Arena {
    region: Box<dyn MemoryRegion>,
}

impl Arena {
    /// Create a memfd-backed arena of `size` bytes, bookkeeping included.
    ///
    /// `descr` names the arena in diagnostics, `param` is the configuration
    /// parameter the operator should raise when the arena runs out. With
    /// `allow_oom` set, exhaustion is reported to the caller as `Ok(None)`
    /// instead of a fatal error.
    pub fn create(size: usize, descr: &str, param: &str, allow_oom: bool) -> Result<Self, ArenaError> {
        check_region_size(size)?;

        let region = SharedRegion::new(descr, size).map_err(|source| {
            error!(
                "cannot create shared memory of {} bytes for {}: {}",
                size, descr, source
            );
            ArenaError::Os {
                size,
                descr: descr.into(),
                source,
            }
        })?;

        Self::with_region(Box::new(region), descr, param, allow_oom)
    }

    /// Create an arena whose usable total is at least `capacity` bytes.
    pub fn create_min(
        capacity: usize,
        descr: &str,
        param: &str,
        allow_oom: bool,
    ) -> Result<Self, ArenaError> {
        let size = align_up(capacity.clamp(MIN_ALLOC, MAX_REGION_SIZE), 8)
            .saturating_add(required_size(1, descr, param));
        Self::create(size, descr, param, allow_oom)
    }

    /// Format `region` as an empty arena.
    pub fn with_region(
        region: Box<dyn MemoryRegion>,
        descr: &str,
        param: &str,
        allow_oom: bool,
    ) -> Result<Self, ArenaError> {
        let size = region.len();
        check_region_size(size)?;

        let info = unsafe { ShmemInfo::format(region.as_ptr(), size, descr, param, allow_oom) };
        info.ok_or_else(|| {
            error!(
                "shared memory of {} bytes is too small for {} ({} bytes of bookkeeping)",
                size,
                descr,
                required_size(1, descr, param)
            );
            ArenaError::TooSmall {
                size,
                descr: descr.into(),
            }
        })?;

        Ok(Self { region })
    }

    /// Map the arena behind `fd`, typically received from the process that
    /// created it.
    ///
    /// # Safety
    ///
    /// The new mapping aliases every other mapping of the region. The caller
    /// must make sure that operations through all of them, in this process and
    /// in others, are serialized by one process-shared lock.
    pub unsafe fn attach(fd: OwnedFd) -> Result<Self, ArenaError> {
        let region = unsafe { SharedRegion::from_fd(fd) }.map_err(|source| {
            error!("cannot attach to shared memory: {}", source);
            ArenaError::Os {
                size: 0,
                descr: "<attached>".into(),
                source,
            }
        })?;
        unsafe { Self::attach_region(Box::new(region)) }
    }

    /// Wrap a region that already holds a formatted arena.
    ///
    /// # Safety
    ///
    /// Same as [`Arena::attach`].
    pub unsafe fn attach_region(region: Box<dyn MemoryRegion>) -> Result<Self, ArenaError> {
        let info = unsafe { ShmemInfo::new(region.as_ptr(), region.len()) };
        if !info.is_formatted() {
            error!(
                "shared memory region of {} bytes does not hold an arena",
                region.len()
            );
            return Err(ArenaError::InvalidHeader);
        }

        debug!(
            "shared memory {}: attached, total size: {}",
            info.description(),
            info.total_size()
        );
        Ok(Self { region })
    }

    /// Unmap the arena. The contents are not inspected.
    pub fn destroy(self) {
        debug!("shared memory {}: destroyed", self.description());
    }

    /// Exclusive access to the allocator for as long as the borrow lasts.
    ///
    /// Only one view can exist at a time, and nothing handed out by it can
    /// outlive it:
    ///
    /// ```compile_fail
    /// use shmem_alloc::{Arena, HeapRegion};
    ///
    /// let mut arena =
    ///     Arena::with_region(Box::new(HeapRegion::new(4096)), "cache", "CacheSize", true).unwrap();
    /// let mut first = arena.access();
    /// let mut second = arena.access();
    /// first.allocate(8).unwrap();
    /// second.allocate(8).unwrap();
    /// ```
    ///
    /// ```compile_fail
    /// use shmem_alloc::{Arena, HeapRegion};
    ///
    /// let mut arena =
    ///     Arena::with_region(Box::new(HeapRegion::new(4096)), "cache", "CacheSize", true).unwrap();
    /// let mut cache = arena.access();
    /// let offset = cache.allocate(8).unwrap().unwrap();
    /// let bytes = cache.payload_mut(offset).unwrap();
    /// cache.release(offset).unwrap();
    /// bytes[0] = 1;
    /// ```
    pub fn access(&mut self) -> ArenaAccess<'_> {
        ArenaAccess {
            info: self.info(),
            _arena: PhantomData,
        }
    }

    /// File descriptor to pass to [`Arena::attach`] in another process.
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.region.fd()
    }

    /// Size of the whole region.
    pub fn region_size(&self) -> usize {
        self.region.len()
    }

    /// Bytes available for chunks, tags included except for the first chunk.
    pub fn total_size(&self) -> usize {
        self.info().total_size()
    }

    /// Offsets delimiting the chunk area.
    pub fn usable_bounds(&self) -> (usize, usize) {
        let info = self.info();
        (info.lo_bound(), info.hi_bound())
    }

    pub fn description(&self) -> &str {
        // SAFETY: the strings are written once at format time
        unsafe { self.info().description_unbound() }
    }

    pub fn parameter(&self) -> &str {
        // SAFETY: as above
        unsafe { self.info().parameter_unbound() }
    }

    pub fn tolerates_exhaustion(&self) -> bool {
        self.info().allow_oom()
    }

    // Only the fields fixed at format time may be read through `&self`.
    fn info(&self) -> ShmemInfo {
        unsafe { ShmemInfo::new(self.region.as_ptr(), self.region.len()) }
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("description", &self.description())
            .field("region_size", &self.region_size())
            .field("total_size", &self.total_size())
            .finish()
    }
}

/// Exclusive view of an arena.
///
/// Holds the arena's mutable borrow and cannot be sent to another thread.
pub struct ArenaAccess<'a> {
    info: ShmemInfo,
    _arena: PhantomData<&'a mut Arena>,
}

impl ArenaAccess<'_> {
    /// Allocate at least `size` bytes.
    ///
    /// Returns `Ok(None)` when the arena is exhausted and tolerates it.
    pub fn allocate(&mut self, size: usize) -> AllocResult<Option<ShmOffset>> {
        self.check_request(size)?;

        match self.info.malloc(size) {
            Some(chunk) => Ok(Some(ShmOffset::from_chunk(chunk))),
            None => self.exhausted(size),
        }
    }

    /// Resize the payload at `offset`, or allocate when there is none.
    ///
    /// The returned offset may differ from `offset`, in which case the
    /// contents were moved. On `Ok(None)` the old payload is untouched.
    pub fn reallocate(
        &mut self,
        offset: Option<ShmOffset>,
        size: usize,
    ) -> AllocResult<Option<ShmOffset>> {
        let Some(offset) = offset else {
            return self.allocate(size);
        };

        self.check_request(size)?;
        let chunk = self.used_chunk(offset, "reallocating")?;

        match self.info.realloc(chunk, size)? {
            Some(chunk) => Ok(Some(ShmOffset::from_chunk(chunk))),
            None => self.exhausted(size),
        }
    }

    /// Give the payload at `offset` back to the arena.
    pub fn release(&mut self, offset: ShmOffset) -> AllocResult {
        let chunk = self.used_chunk(offset, "freeing")?;
        self.info.free(chunk);
        Ok(())
    }

    /// Drop every allocation at once.
    pub fn clear(&mut self) {
        self.info.reset();
    }

    pub fn get_stats(&self) -> ShmemStats {
        self.info.get_stats()
    }

    /// Log the free-list histogram and size breakdown.
    pub fn dump_stats(&self, level: Level) {
        MemoryStatsReporter::dump_stats(level, &self.info);
    }

    pub fn total_size(&self) -> usize {
        self.info.total_size()
    }

    pub fn used_size(&self) -> usize {
        self.info.used_size()
    }

    pub fn free_size(&self) -> usize {
        self.info.free_size()
    }

    /// Every chunk in address order, keyed by its payload offset.
    ///
    /// Meant for diagnostics; the walk is linear in the number of chunks.
    pub fn chunks(&self) -> impl Iterator<Item = (ShmOffset, ChunkState)> + '_ {
        self.info
            .chunk_iter()
            .map(|(chunk, state)| (ShmOffset::from_chunk(chunk), state))
    }

    /// Usable length of the payload at `offset`, at least what was asked for.
    pub fn payload_len(&self, offset: ShmOffset) -> AllocResult<usize> {
        let chunk = self.used_chunk(offset, "inspecting")?;
        Ok(self.info.chunk_size(chunk))
    }

    pub fn payload(&self, offset: ShmOffset) -> AllocResult<&[u8]> {
        let len = self.payload_len(offset)?;
        Ok(unsafe { core::slice::from_raw_parts(self.payload_ptr(offset).as_ptr(), len) })
    }

    pub fn payload_mut(&mut self, offset: ShmOffset) -> AllocResult<&mut [u8]> {
        let len = self.payload_len(offset)?;
        Ok(unsafe { core::slice::from_raw_parts_mut(self.payload_ptr(offset).as_ptr(), len) })
    }

    /// Address of the payload at `offset` in this process.
    pub fn as_ptr(&self, offset: ShmOffset) -> AllocResult<NonNull<u8>> {
        self.used_chunk(offset, "resolving")?;
        Ok(self.payload_ptr(offset))
    }

    // `offset` must be a validated payload offset
    fn payload_ptr(&self, offset: ShmOffset) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.info.ptr_at(offset.get())) }
    }

    /// Offset of an address inside this process's mapping of the arena.
    pub fn offset_of(&self, ptr: NonNull<u8>) -> Option<ShmOffset> {
        let base = self.info.ptr_at(0) as usize;
        let offset = (ptr.as_ptr() as usize).checked_sub(base)?;
        if offset >= self.info.hi_bound() {
            return None;
        }
        ShmOffset::new(offset)
    }

    fn check_request(&self, size: usize) -> AllocResult {
        if size == 0 {
            error!(
                "shared memory {}: asking for a zero-sized chunk",
                self.info.description()
            );
            return Err(AllocError::InvalidParam);
        }
        if size > MAX_REGION_SIZE {
            error!(
                "shared memory {}: asking for a too large chunk ({} bytes)",
                self.info.description(),
                size
            );
            return Err(AllocError::InvalidParam);
        }
        Ok(())
    }

    fn exhausted(&self, size: usize) -> AllocResult<Option<ShmOffset>> {
        if self.info.allow_oom() {
            return Ok(None);
        }
        MemoryStatsReporter::print_alloc_failure_stats(&self.info, size);
        Err(AllocError::NoMemory)
    }

    fn used_chunk(&self, offset: ShmOffset, what: &str) -> AllocResult<usize> {
        let chunk = offset.get().wrapping_sub(TAG_SIZE);
        if is_aligned(offset.get(), 8) && self.info.is_used_chunk(chunk) {
            return Ok(chunk);
        }

        error!(
            "shared memory {}: {} an address that was not allocated: {:#x}",
            self.info.description(),
            what,
            offset.get()
        );
        Err(AllocError::NotAllocated)
    }
}

impl ByteAllocator for ArenaAccess<'_> {
    fn alloc(&mut self, layout: Layout) -> AllocResult<NonNull<u8>> {
        if layout.align() > TAG_SIZE {
            return Err(AllocError::InvalidParam);
        }
        match self.allocate(layout.size().max(1))? {
            Some(offset) => Ok(self.payload_ptr(offset)),
            None => Err(AllocError::NoMemory),
        }
    }

    /// Aborts the process if `pos` was not allocated from this arena.
    fn dealloc(&mut self, pos: NonNull<u8>, _layout: Layout) {
        let released = match self.offset_of(pos) {
            Some(offset) => self.release(offset),
            None => {
                error!(
                    "shared memory {}: freeing a foreign address: {:p}",
                    self.info.description(),
                    pos
                );
                Err(AllocError::NotAllocated)
            }
        };
        released.or_abort();
    }

    fn total_bytes(&self) -> usize {
        self.total_size()
    }

    fn used_bytes(&self) -> usize {
        self.used_size()
    }

    fn available_bytes(&self) -> usize {
        self.free_size()
    }
}
