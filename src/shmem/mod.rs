//! Boundary-tag allocator core
//!
//! Everything the allocator knows lives inside the shared region itself:
//! the [`ArenaHeader`] at offset 0, followed by the description and parameter
//! strings, followed by the usable span `[lo_bound, hi_bound)` that is carved
//! into chunks:
//!
//! ```text
//! 0            HEADER_SIZE                lo_bound                          hi_bound
//! ┌────────────┬──────────────┬───────┬───┬─────┬─────────┬─────┬─────┬─────┬───┐
//! │ ArenaHeader│ description  │ param │pad│ tag │ payload │ tag │ tag │ ... │tag│
//! └────────────┴──────────────┴───────┴───┴─────┴─────────┴─────┴─────┴─────┴───┘
//! ```
//!
//! All references between chunks are byte offsets from the region base, so
//! the same region can be mapped at different addresses by different
//! processes. Offset 0 is the header and is used as the "no chunk" value.

pub mod bucket;
pub mod chunk;
pub mod free;
pub mod free_list;
pub mod malloc;
pub mod realloc;
pub mod stats;

use core::mem::size_of;
use core::ptr::NonNull;

use log::debug;

use crate::{align_down, align_up};

use self::bucket::{BUCKET_COUNT, MIN_ALLOC};
use self::chunk::TAG_SIZE;

/// Marks a region that has been formatted by this allocator.
pub(crate) const ARENA_MAGIC: u64 = 0x5348_4d45_4d41_4c43;

/// Smallest region accepted by the arena manager.
pub const MIN_REGION_SIZE: usize = 128;

const MAX_REGION_SIZE_64: u64 = 0x10_0000_0000;

/// Largest region accepted by the arena manager, also the largest request.
///
/// 64 GiB, or the whole address space on narrower targets.
pub const MAX_REGION_SIZE: usize = if usize::BITS >= 64 {
    MAX_REGION_SIZE_64 as usize
} else {
    usize::MAX
};

/// Bookkeeping stored at the start of the shared region.
#[repr(C)]
pub(crate) struct ArenaHeader {
    pub(crate) magic: u64,
    pub(crate) orig_size: u64,
    pub(crate) total_size: u64,
    pub(crate) used_size: u64,
    pub(crate) free_size: u64,
    pub(crate) lo_bound: u64,
    pub(crate) hi_bound: u64,
    pub(crate) descr_len: u64,
    pub(crate) param_len: u64,
    pub(crate) allow_oom: u64,
    /// Chunk offset of each bucket's list head, 0 when empty.
    pub(crate) buckets: [u64; BUCKET_COUNT],
}

pub(crate) const HEADER_SIZE: usize = size_of::<ArenaHeader>();

/// Usable bounds of a region of `len` bytes holding the given strings.
///
/// Returns `None` if the span left after the bookkeeping cannot hold a single
/// chunk of the minimum allocation size.
pub(crate) fn usable_bounds(len: usize, descr: &str, param: &str) -> Option<(usize, usize)> {
    let lo = align_up(HEADER_SIZE + descr.len() + param.len(), 8);
    let hi = align_down(len, 8);

    if hi < lo + 2 * TAG_SIZE + MIN_ALLOC {
        return None;
    }
    Some((lo, hi))
}

/// View of a formatted region.
///
/// This is a plain pointer wrapper: it does not own the region and performs
/// no locking. Callers hold the arena's external lock for as long as they use
/// one.
#[derive(Clone, Copy)]
pub(crate) struct ShmemInfo {
    base: NonNull<u8>,
    len: usize,
}

impl ShmemInfo {
    /// # Safety
    ///
    /// `base` must point to `len` writable bytes, 8-byte aligned, that stay
    /// mapped for as long as the view is used.
    pub(crate) unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        Self { base, len }
    }

    /// Write the header, the strings and one giant free chunk into the region.
    ///
    /// # Safety
    ///
    /// Same as [`ShmemInfo::new`]; in addition nothing else may be using the
    /// region while it is formatted.
    pub(crate) unsafe fn format(
        base: NonNull<u8>,
        len: usize,
        descr: &str,
        param: &str,
        allow_oom: bool,
    ) -> Option<Self> {
        let (lo, hi) = usable_bounds(len, descr, param)?;
        let mut info = unsafe { Self::new(base, len) };

        {
            let hdr = info.header_mut();
            hdr.magic = ARENA_MAGIC;
            hdr.orig_size = len as u64;
            hdr.lo_bound = lo as u64;
            hdr.hi_bound = hi as u64;
            hdr.total_size = (hi - lo - 2 * TAG_SIZE) as u64;
            hdr.descr_len = descr.len() as u64;
            hdr.param_len = param.len() as u64;
            hdr.allow_oom = allow_oom as u64;
        }

        unsafe {
            let strings = base.as_ptr().add(HEADER_SIZE);
            core::ptr::copy_nonoverlapping(descr.as_ptr(), strings, descr.len());
            core::ptr::copy_nonoverlapping(param.as_ptr(), strings.add(descr.len()), param.len());
        }

        info.reset();

        debug!(
            "shared memory {}: valid user offsets: [{:#x}, {:#x}) total size: {}",
            descr,
            lo,
            hi,
            info.total_size()
        );

        Some(info)
    }

    /// Check that the region carries a header written by [`ShmemInfo::format`].
    pub(crate) fn is_formatted(&self) -> bool {
        if self.len < HEADER_SIZE {
            return false;
        }
        let hdr = self.header();
        let lo = hdr.lo_bound as usize;
        let hi = hdr.hi_bound as usize;

        hdr.magic == ARENA_MAGIC
            && hdr.orig_size as usize == self.len
            && lo >= HEADER_SIZE.saturating_add(hdr.descr_len.saturating_add(hdr.param_len) as usize)
            && hi <= self.len
            && lo.saturating_add(2 * TAG_SIZE + MIN_ALLOC) <= hi
            && hdr.total_size as usize == hi - lo - 2 * TAG_SIZE
    }

    /// Reset to a single free chunk spanning the whole usable range.
    pub(crate) fn reset(&mut self) {
        let lo = self.lo_bound();
        let total = self.total_size();

        let hdr = self.header_mut();
        hdr.buckets = [0; BUCKET_COUNT];
        hdr.used_size = 0;
        hdr.free_size = total as u64;

        self.set_free_chunk_size(lo, total);
        self.link_chunk(lo);
    }

    pub(crate) fn header(&self) -> &ArenaHeader {
        unsafe { self.base.cast::<ArenaHeader>().as_ref() }
    }

    pub(crate) fn header_mut(&mut self) -> &mut ArenaHeader {
        unsafe { self.base.cast::<ArenaHeader>().as_mut() }
    }

    #[inline]
    pub(crate) fn word(&self, off: usize) -> u64 {
        debug_assert!(off % 8 == 0 && off + 8 <= self.len);
        unsafe { self.base.as_ptr().add(off).cast::<u64>().read() }
    }

    #[inline]
    pub(crate) fn set_word(&mut self, off: usize, value: u64) {
        debug_assert!(off % 8 == 0 && off + 8 <= self.len);
        unsafe { self.base.as_ptr().add(off).cast::<u64>().write(value) }
    }

    /// Pointer to the byte at `off` within the region.
    pub(crate) fn ptr_at(&self, off: usize) -> *mut u8 {
        debug_assert!(off <= self.len);
        unsafe { self.base.as_ptr().add(off) }
    }

    pub(crate) fn lo_bound(&self) -> usize {
        self.header().lo_bound as usize
    }

    pub(crate) fn hi_bound(&self) -> usize {
        self.header().hi_bound as usize
    }

    pub(crate) fn total_size(&self) -> usize {
        self.header().total_size as usize
    }

    pub(crate) fn used_size(&self) -> usize {
        self.header().used_size as usize
    }

    pub(crate) fn free_size(&self) -> usize {
        self.header().free_size as usize
    }

    pub(crate) fn allow_oom(&self) -> bool {
        self.header().allow_oom != 0
    }

    pub(crate) fn add_used(&mut self, bytes: usize) {
        self.header_mut().used_size += bytes as u64;
    }

    pub(crate) fn sub_used(&mut self, bytes: usize) {
        self.header_mut().used_size -= bytes as u64;
    }

    pub(crate) fn add_free(&mut self, bytes: usize) {
        self.header_mut().free_size += bytes as u64;
    }

    pub(crate) fn sub_free(&mut self, bytes: usize) {
        self.header_mut().free_size -= bytes as u64;
    }

    pub(crate) fn description(&self) -> &str {
        unsafe { self.description_unbound() }
    }

    pub(crate) fn parameter(&self) -> &str {
        unsafe { self.parameter_unbound() }
    }

    /// # Safety
    ///
    /// The region must stay mapped for `'a`.
    pub(crate) unsafe fn description_unbound<'a>(self) -> &'a str {
        let len = self.header().descr_len as usize;
        unsafe { self.string_at(HEADER_SIZE, len) }
    }

    /// # Safety
    ///
    /// The region must stay mapped for `'a`.
    pub(crate) unsafe fn parameter_unbound<'a>(self) -> &'a str {
        let hdr = self.header();
        let (off, len) = (HEADER_SIZE + hdr.descr_len as usize, hdr.param_len as usize);
        unsafe { self.string_at(off, len) }
    }

    unsafe fn string_at<'a>(self, off: usize, len: usize) -> &'a str {
        let bytes = unsafe { core::slice::from_raw_parts(self.ptr_at(off), len) };
        core::str::from_utf8(bytes).unwrap_or("<invalid>")
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::cell::RefCell;
    use std::sync::Once;

    use log::{Level, LevelFilter, Log, Metadata, Record};

    use super::bucket::bucket_by_size;
    use super::*;

    thread_local! {
        static RECORDS: RefCell<Vec<(Level, String)>> = const { RefCell::new(Vec::new()) };
    }

    /// Keeps log records per test thread, so parallel tests do not mix.
    struct CaptureLogger;

    impl Log for CaptureLogger {
        fn enabled(&self, _: &Metadata<'_>) -> bool {
            true
        }

        fn log(&self, record: &Record<'_>) {
            RECORDS.with(|r| r.borrow_mut().push((record.level(), record.args().to_string())));
        }

        fn flush(&self) {}
    }

    static LOGGER: CaptureLogger = CaptureLogger;
    static INIT_LOGGER: Once = Once::new();

    /// Run `f` and return the log records it emitted on this thread.
    pub(crate) fn capture_logs<R>(f: impl FnOnce() -> R) -> (R, Vec<(Level, String)>) {
        INIT_LOGGER.call_once(|| {
            if log::set_logger(&LOGGER).is_ok() {
                log::set_max_level(LevelFilter::Trace);
            }
        });
        RECORDS.with(|r| r.borrow_mut().clear());
        let result = f();
        let records = RECORDS.with(|r| r.borrow_mut().drain(..).collect());
        (result, records)
    }

    /// Heap backing for unit tests; `u64` storage keeps it 8-byte aligned.
    pub(crate) struct TestArena {
        _storage: Vec<u64>,
        pub(crate) info: ShmemInfo,
    }

    impl TestArena {
        pub(crate) fn new(len: usize, allow_oom: bool) -> Self {
            let mut storage = vec![0u64; len.div_ceil(8)];
            let base = NonNull::new(storage.as_mut_ptr().cast::<u8>()).unwrap();
            let info = unsafe { ShmemInfo::format(base, len, "test cache", "TestCacheSize", allow_oom) }
                .expect("test region too small");
            Self {
                _storage: storage,
                info,
            }
        }
    }

    /// Walk every chunk from `lo_bound` and check the structural invariants.
    ///
    /// Returns the number of chunks walked.
    pub(crate) fn check_invariants(info: &ShmemInfo) -> usize {
        let lo = info.lo_bound();
        let hi = info.hi_bound();
        let mut chunk = lo;
        let mut chunks = 0;
        let mut prev_free = false;
        let mut free_bytes = 0;
        let mut used_bytes = 0;

        while chunk < hi {
            let size = info.chunk_size(chunk);
            assert_eq!(
                info.word(chunk),
                info.word(chunk + TAG_SIZE + size),
                "tags differ for chunk {:#x}",
                chunk
            );
            assert_eq!(size % 8, 0);
            assert!(size >= MIN_ALLOC);

            let free = info.is_free_chunk(chunk);
            assert!(!(free && prev_free), "adjacent free chunks at {:#x}", chunk);
            if free {
                free_bytes += size;
                assert!(
                    info.bucket_contains(bucket_by_size(size), chunk),
                    "free chunk {:#x} missing from its bucket",
                    chunk
                );
            } else {
                used_bytes += size;
            }
            prev_free = free;
            chunks += 1;
            chunk = info.next_chunk(chunk);
        }

        assert_eq!(chunk, hi);
        assert_eq!(free_bytes, info.free_size());
        assert_eq!(used_bytes, info.used_size());
        assert_eq!(
            info.used_size() + info.free_size() + 2 * TAG_SIZE * (chunks - 1),
            info.total_size()
        );
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::bucket::bucket_by_size;
    use super::test_util::*;
    use super::*;

    #[test]
    fn test_format_single_chunk() {
        let arena = TestArena::new(4096, true);
        let info = arena.info;

        assert!(info.is_formatted());
        assert_eq!(info.lo_bound() % 8, 0);
        assert_eq!(info.hi_bound(), 4096);
        assert_eq!(info.used_size(), 0);
        assert_eq!(info.free_size(), info.total_size());
        assert_eq!(info.description(), "test cache");
        assert_eq!(info.parameter(), "TestCacheSize");
        assert!(info.allow_oom());
        assert_eq!(check_invariants(&info), 1);
        assert_eq!(
            info.bucket_head(bucket_by_size(info.total_size())),
            Some(info.lo_bound())
        );
    }

    #[test]
    fn test_usable_bounds_too_small() {
        assert!(usable_bounds(HEADER_SIZE, "", "").is_none());
        assert!(usable_bounds(HEADER_SIZE + 2 * TAG_SIZE + MIN_ALLOC, "", "").is_some());
        assert!(usable_bounds(HEADER_SIZE + 2 * TAG_SIZE + MIN_ALLOC, "x", "").is_none());
    }

    #[test]
    fn test_max_region_size_fits_target() {
        assert!(MAX_REGION_SIZE as u64 <= MAX_REGION_SIZE_64);
        #[cfg(target_pointer_width = "64")]
        assert_eq!(MAX_REGION_SIZE as u64, 0x10_0000_0000);
        #[cfg(target_pointer_width = "32")]
        assert_eq!(MAX_REGION_SIZE, usize::MAX);
    }
}
