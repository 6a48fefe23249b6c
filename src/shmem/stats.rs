//! Statistics and debugging for the shared memory allocator
//!
//! Provides free-list statistics and the report emitted before an
//! unrecoverable allocation failure.

use log::{error, log, Level};

use super::bucket::{bucket_min_size, BUCKET_COUNT, OVERFLOW_BUCKET};
use super::chunk::TAG_SIZE;
use super::ShmemInfo;

/// Shared memory allocator statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmemStats {
    /// Free chunks per bucket.
    pub chunks_num: [usize; BUCKET_COUNT],
    pub free_chunks: usize,
    pub used_chunks: usize,
    /// Smallest free chunk, 0 when there are no free chunks.
    pub min_chunk_size: usize,
    pub max_chunk_size: usize,
    /// Bytes taken by boundary tags of all but the first chunk.
    pub overhead: usize,
    pub free_size: usize,
    pub used_size: usize,
    pub total_size: usize,
}

impl Default for ShmemStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ShmemStats {
    pub const fn new() -> Self {
        Self {
            chunks_num: [0; BUCKET_COUNT],
            free_chunks: 0,
            used_chunks: 0,
            min_chunk_size: 0,
            max_chunk_size: 0,
            overhead: 0,
            free_size: 0,
            used_size: 0,
            total_size: 0,
        }
    }
}

impl ShmemInfo {
    /// Walk every bucket and collect statistics.
    pub(crate) fn get_stats(&self) -> ShmemStats {
        let mut stats = ShmemStats::new();
        let mut min_chunk_size = usize::MAX;

        for bucket in 0..BUCKET_COUNT {
            let mut counter = 0;
            for chunk in self.bucket_iter(bucket) {
                let size = self.chunk_size(chunk);
                counter += 1;
                min_chunk_size = min_chunk_size.min(size);
                stats.max_chunk_size = stats.max_chunk_size.max(size);
            }
            stats.chunks_num[bucket] = counter;
            stats.free_chunks += counter;
        }

        if stats.free_chunks != 0 {
            stats.min_chunk_size = min_chunk_size;
        }

        stats.total_size = self.total_size();
        stats.used_size = self.used_size();
        stats.free_size = self.free_size();
        stats.overhead = stats.total_size - stats.used_size - stats.free_size;
        stats.used_chunks = stats.overhead / (2 * TAG_SIZE) + 1 - stats.free_chunks;
        stats
    }
}

/// Detailed memory statistics reporter
pub(crate) struct MemoryStatsReporter;

impl MemoryStatsReporter {
    /// Log the free-list histogram and the size breakdown at `level`.
    pub(crate) fn dump_stats(level: Level, info: &ShmemInfo) {
        let stats = info.get_stats();

        log!(level, "=== memory statistics for {} ===", info.description());

        for (bucket, &count) in stats.chunks_num.iter().enumerate() {
            if count == 0 {
                continue;
            }
            log!(
                level,
                "free chunks of size {:>2} {:>3} bytes: {:>8}",
                if bucket == OVERFLOW_BUCKET { ">=" } else { "" },
                bucket_min_size(bucket),
                count
            );
        }

        log!(level, "min chunk size: {:>10} bytes", stats.min_chunk_size);
        log!(level, "max chunk size: {:>10} bytes", stats.max_chunk_size);
        log!(
            level,
            "memory of total size {} bytes fragmented into {} chunks",
            stats.total_size,
            stats.free_chunks + stats.used_chunks
        );
        log!(
            level,
            "of those, {:>10} bytes are in {:>8} free chunks",
            stats.free_size,
            stats.free_chunks
        );
        log!(
            level,
            "of those, {:>10} bytes are in {:>8} used chunks",
            stats.used_size,
            stats.used_chunks
        );
        log!(
            level,
            "of those, {:>10} bytes are used by allocation overhead",
            stats.overhead
        );
        log!(level, "================================");
    }

    /// Report a request the arena could not satisfy.
    ///
    /// This is a standalone function to keep allocation logic clean
    pub(crate) fn print_alloc_failure_stats(info: &ShmemInfo, request: usize) {
        error!(
            "shared memory {}: out of memory (requested {} bytes)",
            info.description(),
            request
        );
        error!(
            "shared memory {}: please increase {} configuration parameter",
            info.description(),
            info.parameter()
        );
        Self::dump_stats(Level::Error, info);
    }
}
