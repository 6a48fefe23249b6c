//! Boundary-tag chunk model
//!
//! A chunk is `[tag][payload][tag]`. Both tags hold the payload size with the
//! high bit set while the chunk is in use. While a chunk is free the first two
//! words of its payload link it into its bucket's list:
//!
//! ```text
//!   used chunk:  ┌──────────┬──────────────────────────────┬──────────┐
//!                │ size|USED│ caller bytes                 │ size|USED│
//!                └──────────┴──────────────────────────────┴──────────┘
//!   free chunk:  ┌──────────┬──────┬──────┬────────────────┬──────────┐
//!                │ size     │ prev │ next │ (stale bytes)  │ size     │
//!                └──────────┴──────┴──────┴────────────────┴──────────┘
//! ```
//!
//! None of the accessors validate their input: chunk offsets only ever come
//! from this allocator.

use super::ShmemInfo;

/// Width of a boundary tag in bytes.
pub const TAG_SIZE: usize = 8;

/// High bit of a tag, set while the chunk is handed out to a caller.
pub(crate) const USED_FLAG: u64 = 1 << 63;

const PREV_LINK: usize = TAG_SIZE;
const NEXT_LINK: usize = TAG_SIZE + 8;

/// Decoded view of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Used {
        size: usize,
    },
    Free {
        size: usize,
        prev: Option<usize>,
        next: Option<usize>,
    },
}

impl ChunkState {
    pub fn size(&self) -> usize {
        match *self {
            ChunkState::Used { size } | ChunkState::Free { size, .. } => size,
        }
    }

    pub fn is_free(&self) -> bool {
        matches!(self, ChunkState::Free { .. })
    }
}

#[inline]
pub(crate) fn decode_link(raw: u64) -> Option<usize> {
    if raw == 0 {
        None
    } else {
        Some(raw as usize)
    }
}

#[inline]
pub(crate) fn encode_link(link: Option<usize>) -> u64 {
    link.map_or(0, |off| off as u64)
}

impl ShmemInfo {
    #[inline]
    pub(crate) fn chunk_size(&self, chunk: usize) -> usize {
        (self.word(chunk) & !USED_FLAG) as usize
    }

    #[inline]
    pub(crate) fn is_free_chunk(&self, chunk: usize) -> bool {
        self.word(chunk) & USED_FLAG == 0
    }

    /// Offset of the trailing tag of `chunk`.
    #[inline]
    pub(crate) fn right_tag(&self, chunk: usize) -> usize {
        chunk + TAG_SIZE + self.chunk_size(chunk)
    }

    /// Offset of the chunk that starts right after `chunk`.
    ///
    /// May equal `hi_bound`, in which case there is no such chunk.
    #[inline]
    pub(crate) fn next_chunk(&self, chunk: usize) -> usize {
        self.right_tag(chunk) + TAG_SIZE
    }

    /// Offset of the chunk that ends right before `chunk`.
    ///
    /// Only meaningful when `chunk > lo_bound`.
    #[inline]
    pub(crate) fn prev_chunk(&self, chunk: usize) -> usize {
        let prev_size = (self.word(chunk - TAG_SIZE) & !USED_FLAG) as usize;
        chunk - TAG_SIZE - prev_size - TAG_SIZE
    }

    /// Whether a free chunk starts right after `chunk`.
    pub(crate) fn next_is_free(&self, chunk: usize) -> bool {
        let next = self.next_chunk(chunk);
        next < self.hi_bound() && self.is_free_chunk(next)
    }

    /// Whether a free chunk ends right before `chunk`.
    pub(crate) fn prev_is_free(&self, chunk: usize) -> bool {
        chunk > self.lo_bound() && self.word(chunk - TAG_SIZE) & USED_FLAG == 0
    }

    /// Tag both ends of `chunk` as free. Link words are left untouched.
    pub(crate) fn set_free_chunk_size(&mut self, chunk: usize, size: usize) {
        self.set_word(chunk, size as u64);
        self.set_word(chunk + TAG_SIZE + size, size as u64);
    }

    /// Tag both ends of `chunk` as used.
    pub(crate) fn set_used_chunk_size(&mut self, chunk: usize, size: usize) {
        self.set_word(chunk, size as u64 | USED_FLAG);
        self.set_word(chunk + TAG_SIZE + size, size as u64 | USED_FLAG);
    }

    #[inline]
    pub(crate) fn free_prev(&self, chunk: usize) -> Option<usize> {
        decode_link(self.word(chunk + PREV_LINK))
    }

    #[inline]
    pub(crate) fn free_next(&self, chunk: usize) -> Option<usize> {
        decode_link(self.word(chunk + NEXT_LINK))
    }

    #[inline]
    pub(crate) fn set_free_prev(&mut self, chunk: usize, prev: Option<usize>) {
        self.set_word(chunk + PREV_LINK, encode_link(prev));
    }

    #[inline]
    pub(crate) fn set_free_next(&mut self, chunk: usize, next: Option<usize>) {
        self.set_word(chunk + NEXT_LINK, encode_link(next));
    }

    /// Decode the chunk starting at `chunk`.
    pub(crate) fn chunk_state(&self, chunk: usize) -> ChunkState {
        let size = self.chunk_size(chunk);
        if self.is_free_chunk(chunk) {
            ChunkState::Free {
                size,
                prev: self.free_prev(chunk),
                next: self.free_next(chunk),
            }
        } else {
            ChunkState::Used { size }
        }
    }

    /// Walk every chunk of the usable range in address order.
    pub(crate) fn chunk_iter(&self) -> ChunkIter<'_> {
        ChunkIter {
            info: self,
            current: self.lo_bound(),
        }
    }
}

/// Iterator over `(chunk offset, state)` for a whole arena
pub(crate) struct ChunkIter<'a> {
    info: &'a ShmemInfo,
    current: usize,
}

impl Iterator for ChunkIter<'_> {
    type Item = (usize, ChunkState);

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.current;
        if chunk >= self.info.hi_bound() {
            return None;
        }
        self.current = self.info.next_chunk(chunk);
        Some((chunk, self.info.chunk_state(chunk)))
    }
}
