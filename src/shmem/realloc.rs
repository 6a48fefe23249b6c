//! Realloc engine.
//!
//! Resizes in place whenever the chunk itself or its free right neighbor
//! allows it, and only moves the payload when it has to.

use log::error;

use super::bucket::{proper_alloc_size, MIN_ALLOC};
use super::chunk::TAG_SIZE;
use super::ShmemInfo;
use crate::{AllocError, AllocResult};

impl ShmemInfo {
    /// Resize the used chunk `chunk` to hold at least `size` bytes.
    ///
    /// Returns the (possibly moved) chunk offset, or `None` if there is no
    /// room; in that case the old chunk is left untouched. An error means the
    /// old chunk was already released when the allocation failed.
    pub(crate) fn realloc(&mut self, chunk: usize, size: usize) -> AllocResult<Option<usize>> {
        let size = proper_alloc_size(size);
        let chunk_size = self.chunk_size(chunk);
        let next_free = self.next_is_free(chunk);

        if size <= chunk_size {
            // not much would be freed, the caller is likely to grow again
            if size > chunk_size / 4 {
                return Ok(Some(chunk));
            }

            self.shrink(chunk, chunk_size, size, next_free);
            return Ok(Some(chunk));
        }

        if next_free {
            let next_size = self.chunk_size(self.next_chunk(chunk));
            if chunk_size + 2 * TAG_SIZE + next_size >= size {
                self.grow_into_next(chunk, chunk_size, size);
                return Ok(Some(chunk));
            }
        }

        if let Some(new_chunk) = self.malloc(size) {
            self.copy_payload(chunk, new_chunk, chunk_size);
            self.free(chunk);
            return Ok(Some(new_chunk));
        }

        self.realloc_via_scratch(chunk, chunk_size, size, next_free)
    }

    /// Give back the tail of `chunk` beyond `size` bytes.
    fn shrink(&mut self, chunk: usize, chunk_size: usize, size: usize, next_free: bool) {
        let new_chunk = chunk + TAG_SIZE + size + TAG_SIZE;

        self.sub_used(chunk_size - size);

        if next_free {
            // fold the tail into the free right neighbor
            let next_chunk = self.next_chunk(chunk);
            let new_chunk_size = self.chunk_size(next_chunk) + (chunk_size - size);

            self.add_free(chunk_size - size);
            self.unlink_chunk(next_chunk);
            self.set_free_chunk_size(new_chunk, new_chunk_size);
            self.link_chunk(new_chunk);
        } else {
            let new_chunk_size = chunk_size - size - 2 * TAG_SIZE;

            self.add_free(new_chunk_size);
            self.set_free_chunk_size(new_chunk, new_chunk_size);
            self.link_chunk(new_chunk);
        }

        self.set_used_chunk_size(chunk, size);
    }

    /// Absorb the free right neighbor, then split off what is not needed.
    fn grow_into_next(&mut self, chunk: usize, chunk_size: usize, size: usize) {
        let next_chunk = self.next_chunk(chunk);
        let merged_size = chunk_size + 2 * TAG_SIZE + self.chunk_size(next_chunk);

        self.sub_used(chunk_size);
        self.add_free(chunk_size + 2 * TAG_SIZE);
        self.unlink_chunk(next_chunk);

        if merged_size < size + 2 * TAG_SIZE + MIN_ALLOC {
            self.add_used(merged_size);
            self.sub_free(merged_size);
            self.set_used_chunk_size(chunk, merged_size);
        } else {
            let new_chunk = chunk + TAG_SIZE + size + TAG_SIZE;
            let new_chunk_size = merged_size - size - 2 * TAG_SIZE;
            self.set_free_chunk_size(new_chunk, new_chunk_size);
            self.link_chunk(new_chunk);

            self.add_used(size);
            self.sub_free(merged_size);
            self.add_free(new_chunk_size);
            self.set_used_chunk_size(chunk, size);
        }
    }

    /// Last resort when growing: the request may only be blocked by the old
    /// chunk's own position. If releasing it (merged with its free neighbors)
    /// would leave a large enough chunk, park the payload in a heap buffer,
    /// release, allocate and copy back.
    fn realloc_via_scratch(
        &mut self,
        chunk: usize,
        chunk_size: usize,
        size: usize,
        next_free: bool,
    ) -> AllocResult<Option<usize>> {
        let mut reclaimable = chunk_size;
        if next_free {
            reclaimable += self.chunk_size(self.next_chunk(chunk)) + 2 * TAG_SIZE;
        }
        if self.prev_is_free(chunk) {
            reclaimable += self.chunk_size(self.prev_chunk(chunk)) + 2 * TAG_SIZE;
        }

        if size > reclaimable {
            return Ok(None);
        }

        let mut scratch = vec![0u8; chunk_size];
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.ptr_at(chunk + TAG_SIZE),
                scratch.as_mut_ptr(),
                chunk_size,
            );
        }

        self.free(chunk);

        let Some(new_chunk) = self.malloc(size) else {
            error!(
                "shared memory {}: cannot allocate {} bytes after releasing {} bytes of reclaimable space",
                self.description(),
                size,
                reclaimable
            );
            return Err(AllocError::NoMemory);
        };

        unsafe {
            core::ptr::copy_nonoverlapping(
                scratch.as_ptr(),
                self.ptr_at(new_chunk + TAG_SIZE),
                chunk_size,
            );
        }

        Ok(Some(new_chunk))
    }

    /// Copy `len` payload bytes between two used chunks.
    fn copy_payload(&mut self, from: usize, to: usize, len: usize) {
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.ptr_at(from + TAG_SIZE),
                self.ptr_at(to + TAG_SIZE),
                len,
            );
        }
    }
}
