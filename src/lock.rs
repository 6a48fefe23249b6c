//! An arena shared between threads of one process.
//!
//! [`Arena::access`] needs `&mut Arena`, so threads can only share an arena
//! behind a lock. [`LockedArena`] is that lock: every call takes it for the
//! duration of one allocator operation, and [`LockedArena::lock`] hands out
//! the guard for batches. It does not reach other processes; mappings there
//! are serialized by whoever attached them.

use core::alloc::Layout;
use core::ptr::NonNull;

use kspin::{SpinNoIrq, SpinNoIrqGuard};
use log::Level;

use crate::arena::{Arena, ArenaAccess, ShmOffset};
use crate::shmem::stats::ShmemStats;
use crate::{AllocResult, ByteAllocator};

/// Arena behind an IRQ-safe spin lock
pub struct LockedArena {
    arena: SpinNoIrq<Arena>,
}

impl LockedArena {
    pub const fn new(arena: Arena) -> Self {
        Self {
            arena: SpinNoIrq::new(arena),
        }
    }

    /// Take the lock; `guard.access()` then runs any number of operations.
    pub fn lock(&self) -> SpinNoIrqGuard<'_, Arena> {
        self.arena.lock()
    }

    /// Run `f` with exclusive access while holding the lock.
    pub fn with<R>(&self, f: impl FnOnce(&mut ArenaAccess<'_>) -> R) -> R {
        let mut arena = self.arena.lock();
        f(&mut arena.access())
    }

    pub fn allocate(&self, size: usize) -> AllocResult<Option<ShmOffset>> {
        self.with(|cache| cache.allocate(size))
    }

    pub fn reallocate(
        &self,
        offset: Option<ShmOffset>,
        size: usize,
    ) -> AllocResult<Option<ShmOffset>> {
        self.with(|cache| cache.reallocate(offset, size))
    }

    pub fn release(&self, offset: ShmOffset) -> AllocResult {
        self.with(|cache| cache.release(offset))
    }

    pub fn clear(&self) {
        self.with(|cache| cache.clear())
    }

    pub fn get_stats(&self) -> ShmemStats {
        self.with(|cache| cache.get_stats())
    }

    pub fn dump_stats(&self, level: Level) {
        self.with(|cache| cache.dump_stats(level))
    }

    /// Allocate for `layout`, as [`ByteAllocator::alloc`] does.
    pub fn alloc(&self, layout: Layout) -> AllocResult<NonNull<u8>> {
        self.with(|cache| cache.alloc(layout))
    }

    /// Release `pos`, aborting the process if it was not allocated here.
    pub fn dealloc(&self, pos: NonNull<u8>, layout: Layout) {
        self.with(|cache| cache.dealloc(pos, layout))
    }

    pub fn into_inner(self) -> Arena {
        self.arena.into_inner()
    }
}
