//! Free/coalesce engine.
//!
//! A released chunk is merged with whichever of its neighbors are free, so
//! no two adjacent chunks are ever free at the same time.

use super::bucket::MIN_ALLOC;
use super::chunk::{TAG_SIZE, USED_FLAG};
use super::ShmemInfo;

impl ShmemInfo {
    /// Return a used chunk to the free lists, merging with free neighbors.
    pub(crate) fn free(&mut self, chunk: usize) {
        let mut chunk = chunk;
        let mut chunk_size = self.chunk_size(chunk);

        self.sub_used(chunk_size);
        self.add_free(chunk_size);

        let prev_free = self.prev_is_free(chunk);
        let next_free = self.next_is_free(chunk);

        if prev_free {
            let prev_chunk = self.prev_chunk(chunk);
            self.unlink_chunk(prev_chunk);
            chunk_size += 2 * TAG_SIZE + self.chunk_size(prev_chunk);
            self.add_free(2 * TAG_SIZE);
            chunk = prev_chunk;
        }

        if next_free {
            // `chunk` may already be the left neighbor, find the right one
            // through the freed chunk's own extent
            let next_chunk = chunk + TAG_SIZE + chunk_size + TAG_SIZE;
            self.unlink_chunk(next_chunk);
            chunk_size += 2 * TAG_SIZE + self.chunk_size(next_chunk);
            self.add_free(2 * TAG_SIZE);
        }

        self.set_free_chunk_size(chunk, chunk_size);
        self.link_chunk(chunk);
    }

    /// Check that `chunk` is a chunk currently handed out by this arena.
    ///
    /// Rejects offsets outside the usable range, misaligned offsets, free
    /// chunks (double free) and chunks whose tags disagree.
    pub(crate) fn is_used_chunk(&self, chunk: usize) -> bool {
        let lo = self.lo_bound();
        let hi = self.hi_bound();

        if chunk < lo || chunk % 8 != 0 || chunk > hi.saturating_sub(2 * TAG_SIZE + MIN_ALLOC) {
            return false;
        }

        let tag = self.word(chunk);
        if tag & USED_FLAG == 0 {
            return false;
        }

        let size = (tag & !USED_FLAG) as usize;
        match chunk.checked_add(2 * TAG_SIZE + size) {
            Some(end) if end <= hi && size % 8 == 0 => self.word(end - TAG_SIZE) == tag,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shmem::bucket::bucket_by_size;
    use crate::shmem::test_util::{check_invariants, TestArena};

    /// Three adjacent used chunks followed by the free rest of the arena.
    fn three_chunks(info: &mut ShmemInfo) -> (usize, usize, usize) {
        let a = info.malloc(48).unwrap();
        let b = info.malloc(64).unwrap();
        let c = info.malloc(80).unwrap();
        let _pin = info.malloc(24).unwrap();
        (a, b, c)
    }

    #[test]
    fn test_free_without_free_neighbors() {
        let mut arena = TestArena::new(4096, true);
        let info = &mut arena.info;
        let (_a, b, _c) = three_chunks(info);

        info.free(b);
        assert!(info.is_free_chunk(b));
        assert_eq!(info.chunk_size(b), 64);
        assert_eq!(info.bucket_head(bucket_by_size(64)), Some(b));
        check_invariants(info);
    }

    #[test]
    fn test_free_merges_left() {
        let mut arena = TestArena::new(4096, true);
        let info = &mut arena.info;
        let (a, b, _c) = three_chunks(info);

        info.free(a);
        info.free(b);
        assert!(info.is_free_chunk(a));
        assert_eq!(info.chunk_size(a), 48 + 64 + 2 * TAG_SIZE);
        assert_eq!(info.bucket_head(bucket_by_size(48)), None);
        check_invariants(info);
    }

    #[test]
    fn test_free_merges_right() {
        let mut arena = TestArena::new(4096, true);
        let info = &mut arena.info;
        let (_a, b, c) = three_chunks(info);

        info.free(c);
        info.free(b);
        assert!(info.is_free_chunk(b));
        assert_eq!(info.chunk_size(b), 64 + 80 + 2 * TAG_SIZE);
        assert_eq!(info.bucket_head(bucket_by_size(80)), None);
        check_invariants(info);
    }

    #[test]
    fn test_free_merges_both() {
        let mut arena = TestArena::new(4096, true);
        let info = &mut arena.info;
        let (a, b, c) = three_chunks(info);

        info.free(a);
        info.free(c);
        let free_before = info.free_size();
        info.free(b);

        assert_eq!(info.chunk_size(a), 48 + 64 + 80 + 4 * TAG_SIZE);
        assert_eq!(info.free_size(), free_before + 64 + 4 * TAG_SIZE);
        assert_eq!(check_invariants(info), 3);
    }

    #[test]
    fn test_free_everything_restores_giant_chunk() {
        let mut arena = TestArena::new(4096, true);
        let info = &mut arena.info;
        let total = info.total_size();

        let chunks: Vec<_> = (1..10).map(|i| info.malloc(i * 16).unwrap()).collect();
        for chunk in chunks.into_iter().rev() {
            info.free(chunk);
        }

        assert_eq!(info.used_size(), 0);
        assert_eq!(info.free_size(), total);
        assert_eq!(check_invariants(info), 1);
    }

    #[test]
    fn test_is_used_chunk() {
        let mut arena = TestArena::new(4096, true);
        let info = &mut arena.info;
        let (a, b, _c) = three_chunks(info);

        assert!(info.is_used_chunk(a));
        assert!(info.is_used_chunk(b));
        assert!(!info.is_used_chunk(a + 8));
        assert!(!info.is_used_chunk(a + 3));
        assert!(!info.is_used_chunk(0));
        assert!(!info.is_used_chunk(info.hi_bound()));

        info.free(b);
        assert!(!info.is_used_chunk(b));
    }
}
