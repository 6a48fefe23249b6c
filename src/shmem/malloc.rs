//! Allocation engine: bucket lookup, first-fit over the overflow bucket, split.

use log::{debug, error, warn};

use super::bucket::{bucket_by_size, proper_alloc_size, MIN_ALLOC, OVERFLOW_BUCKET};
use super::chunk::TAG_SIZE;
use super::ShmemInfo;

/// A first-fit scan that skips this many chunks is reported as fragmentation.
pub(crate) const FRAGMENTATION_WARN_SKIPPED: usize = 100;

impl ShmemInfo {
    /// Allocate a chunk with at least `size` bytes of payload.
    ///
    /// Returns the chunk offset, or `None` if no free chunk is large enough.
    pub(crate) fn malloc(&mut self, size: usize) -> Option<usize> {
        let size = proper_alloc_size(size);

        let mut bucket = bucket_by_size(size);
        while bucket < OVERFLOW_BUCKET && self.bucket_head(bucket).is_none() {
            bucket += 1;
        }

        let chunk = if bucket == OVERFLOW_BUCKET {
            self.first_fit(size)
        } else {
            self.bucket_head(bucket)
        }?;

        let chunk_size = self.chunk_size(chunk);
        self.unlink_chunk(chunk);

        if chunk_size < size + 2 * TAG_SIZE + MIN_ALLOC {
            // remainder too small to be a chunk of its own
            self.add_used(chunk_size);
            self.sub_free(chunk_size);
            self.set_used_chunk_size(chunk, chunk_size);
        } else {
            let new_chunk = chunk + TAG_SIZE + size + TAG_SIZE;
            let new_chunk_size = chunk_size - size - 2 * TAG_SIZE;
            self.set_free_chunk_size(new_chunk, new_chunk_size);
            self.link_chunk(new_chunk);

            self.add_used(size);
            self.sub_free(chunk_size);
            self.add_free(new_chunk_size);
            self.set_used_chunk_size(chunk, size);
        }

        Some(chunk)
    }

    /// First chunk of the overflow bucket with a payload of at least `size`.
    fn first_fit(&self, size: usize) -> Option<usize> {
        let mut skipped = 0;
        let mut skip_min = usize::MAX;
        let mut skip_max = 0;

        let found = self.bucket_iter(OVERFLOW_BUCKET).find(|&chunk| {
            let chunk_size = self.chunk_size(chunk);
            if chunk_size >= size {
                return true;
            }
            skipped += 1;
            skip_min = skip_min.min(chunk_size);
            skip_max = skip_max.max(chunk_size);
            false
        });

        // arenas that tolerate exhaustion stay quiet here
        if !self.allow_oom() {
            match found {
                None => error!(
                    "shared memory {}: no free chunk for {} bytes: skipped {} chunks, skip_min {} skip_max {}",
                    self.description(),
                    size,
                    skipped,
                    skip_min,
                    skip_max
                ),
                Some(chunk) if skipped >= FRAGMENTATION_WARN_SKIPPED => warn!(
                    "shared memory {}: fragmented: skipped {} chunks asking {} bytes, skip_min {} skip_max {} found {}",
                    self.description(),
                    skipped,
                    size,
                    skip_min,
                    skip_max,
                    self.chunk_size(chunk)
                ),
                Some(_) => {}
            }
        } else if found.is_none() {
            debug!(
                "shared memory {}: no free chunk for {} bytes",
                self.description(),
                size
            );
        }

        found
    }
}

#[cfg(test)]
mod tests {
    use log::Level;

    use super::*;
    use crate::shmem::bucket::MAX_BUCKET_SIZE;
    use crate::shmem::test_util::{capture_logs, check_invariants, TestArena};

    /// Leave `FRAGMENTATION_WARN_SKIPPED + 1` undersized free chunks at the
    /// head of the overflow bucket, each pinned apart by a used chunk.
    /// Returns the offset of the large tail chunk behind them.
    fn fragment_overflow_bucket(info: &mut ShmemInfo) -> usize {
        let holes: Vec<usize> = (0..=FRAGMENTATION_WARN_SKIPPED)
            .map(|_| {
                let hole = info.malloc(MAX_BUCKET_SIZE).unwrap();
                info.malloc(MIN_ALLOC).unwrap();
                hole
            })
            .collect();
        let tail = info.bucket_head(OVERFLOW_BUCKET).unwrap();
        for hole in holes {
            info.free(hole);
        }
        tail
    }

    fn count_level(records: &[(Level, String)], level: Level, needle: &str) -> usize {
        records
            .iter()
            .filter(|(l, msg)| *l == level && msg.contains(needle))
            .count()
    }

    #[test]
    fn test_malloc_splits_giant_chunk() {
        let mut arena = TestArena::new(4096, true);
        let info = &mut arena.info;
        let total = info.total_size();
        let lo = info.lo_bound();

        let chunk = info.malloc(100).unwrap();
        assert_eq!(chunk, lo);
        assert_eq!(info.chunk_size(chunk), 104);
        assert!(!info.is_free_chunk(chunk));
        assert_eq!(info.used_size(), 104);
        assert_eq!(info.free_size(), total - 104 - 2 * TAG_SIZE);
        assert_eq!(check_invariants(info), 2);
    }

    #[test]
    fn test_malloc_takes_whole_chunk_when_remainder_small() {
        let mut arena = TestArena::new(4096, true);
        let info = &mut arena.info;
        let total = info.total_size();

        // leave less than one minimal chunk behind
        let request = total - 2 * TAG_SIZE - MIN_ALLOC + 8;
        let chunk = info.malloc(request).unwrap();
        assert_eq!(info.chunk_size(chunk), total);
        assert_eq!(info.used_size(), total);
        assert_eq!(info.free_size(), 0);
        assert_eq!(check_invariants(info), 1);
    }

    #[test]
    fn test_malloc_exact_split_boundary() {
        let mut arena = TestArena::new(4096, true);
        let info = &mut arena.info;
        let total = info.total_size();

        // exactly one minimal chunk fits behind the request
        let request = total - 2 * TAG_SIZE - MIN_ALLOC;
        let chunk = info.malloc(request).unwrap();
        assert_eq!(info.chunk_size(chunk), request);
        assert_eq!(info.chunk_size(info.next_chunk(chunk)), MIN_ALLOC);
        assert_eq!(check_invariants(info), 2);
    }

    #[test]
    fn test_malloc_no_space() {
        let mut arena = TestArena::new(1024, true);
        let info = &mut arena.info;
        let total = info.total_size();

        assert!(info.malloc(total + 8).is_none());
        assert_eq!(info.used_size(), 0);
        assert_eq!(info.free_size(), total);
        check_invariants(info);
    }

    #[test]
    fn test_malloc_prefers_exact_bucket() {
        let mut arena = TestArena::new(8192, true);
        let info = &mut arena.info;

        let a = info.malloc(64).unwrap();
        let _pin = info.malloc(24).unwrap();
        info.free(a);

        // the freed 64-byte chunk sits in an exact bucket and is reused
        assert_eq!(info.malloc(60), Some(a));
        check_invariants(info);
    }

    #[test]
    fn test_malloc_walks_up_to_larger_bucket() {
        let mut arena = TestArena::new(8192, true);
        let info = &mut arena.info;

        let a = info.malloc(200).unwrap();
        let _pin = info.malloc(24).unwrap();
        info.free(a);

        // bucket for 32 is empty, the search moves up to the 200-byte chunk
        let b = info.malloc(32).unwrap();
        assert_eq!(b, a);
        assert_eq!(info.chunk_size(b), 32);
        assert_eq!(info.chunk_size(info.next_chunk(b)), 200 - 32 - 2 * TAG_SIZE);
        check_invariants(info);
    }

    #[test]
    fn test_fragmented_scan_warns_for_strict_arena() {
        let mut arena = TestArena::new(64 * 1024, false);
        let info = &mut arena.info;
        let tail = fragment_overflow_bucket(info);

        let (chunk, records) = capture_logs(|| info.malloc(2 * MAX_BUCKET_SIZE));
        assert_eq!(chunk, Some(tail));
        assert_eq!(count_level(&records, Level::Warn, "fragmented: skipped 101 chunks"), 1);
        assert_eq!(count_level(&records, Level::Error, ""), 0);
        check_invariants(info);
    }

    #[test]
    fn test_fragmented_scan_quiet_for_tolerant_arena() {
        let mut arena = TestArena::new(64 * 1024, true);
        let info = &mut arena.info;
        let tail = fragment_overflow_bucket(info);

        let (chunk, records) = capture_logs(|| info.malloc(2 * MAX_BUCKET_SIZE));
        assert_eq!(chunk, Some(tail));
        assert_eq!(count_level(&records, Level::Warn, ""), 0);
        check_invariants(info);
    }

    #[test]
    fn test_short_scan_does_not_warn() {
        let mut arena = TestArena::new(8192, false);
        let info = &mut arena.info;

        let hole = info.malloc(MAX_BUCKET_SIZE).unwrap();
        info.malloc(MIN_ALLOC).unwrap();
        info.free(hole);

        let (chunk, records) = capture_logs(|| info.malloc(2 * MAX_BUCKET_SIZE));
        assert!(chunk.is_some());
        assert_eq!(count_level(&records, Level::Warn, ""), 0);
    }

    #[test]
    fn test_failed_scan_logs_by_policy() {
        let mut strict = TestArena::new(1024, false);
        let total = strict.info.total_size();
        let (chunk, records) = capture_logs(|| strict.info.malloc(total + 8));
        assert!(chunk.is_none());
        assert_eq!(count_level(&records, Level::Error, "no free chunk"), 1);

        let mut tolerant = TestArena::new(1024, true);
        let (chunk, records) = capture_logs(|| tolerant.info.malloc(total + 8));
        assert!(chunk.is_none());
        assert_eq!(count_level(&records, Level::Debug, "no free chunk"), 1);
        assert_eq!(count_level(&records, Level::Error, ""), 0);
        assert_eq!(count_level(&records, Level::Warn, ""), 0);
    }
}
