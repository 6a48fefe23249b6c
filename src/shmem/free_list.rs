//! Per-arena free-list registry.
//!
//! Each bucket is an intrusive doubly linked list threaded through the
//! payloads of its free chunks; the list heads live in the arena header.
//! Chunks are pushed at the head, so both link and unlink are O(1).

use super::bucket::bucket_by_size;
use super::chunk::{decode_link, encode_link};
use super::ShmemInfo;

impl ShmemInfo {
    #[inline]
    pub(crate) fn bucket_head(&self, bucket: usize) -> Option<usize> {
        decode_link(self.header().buckets[bucket])
    }

    #[inline]
    fn set_bucket_head(&mut self, bucket: usize, chunk: Option<usize>) {
        self.header_mut().buckets[bucket] = encode_link(chunk);
    }

    /// Push a free chunk at the head of the bucket its current size maps to.
    pub(crate) fn link_chunk(&mut self, chunk: usize) {
        let bucket = bucket_by_size(self.chunk_size(chunk));
        let head = self.bucket_head(bucket);

        if let Some(head) = head {
            self.set_free_prev(head, Some(chunk));
        }
        self.set_free_prev(chunk, None);
        self.set_free_next(chunk, head);
        self.set_bucket_head(bucket, Some(chunk));
    }

    /// Remove a free chunk from the bucket it is linked into.
    ///
    /// The bucket is derived from the chunk's tag, so the tag must not have
    /// been rewritten since the chunk was linked.
    pub(crate) fn unlink_chunk(&mut self, chunk: usize) {
        let bucket = bucket_by_size(self.chunk_size(chunk));
        let prev = self.free_prev(chunk);
        let next = self.free_next(chunk);

        if self.bucket_head(bucket) == Some(chunk) {
            self.set_bucket_head(bucket, next);
        } else if let Some(prev) = prev {
            self.set_free_next(prev, next);
        }

        if let Some(next) = next {
            self.set_free_prev(next, prev);
        }
    }

    /// Iterate over the chunk offsets linked into `bucket`.
    pub(crate) fn bucket_iter(&self, bucket: usize) -> BucketIter<'_> {
        BucketIter {
            info: self,
            current: self.bucket_head(bucket),
        }
    }

    #[cfg(test)]
    pub(crate) fn bucket_contains(&self, bucket: usize, chunk: usize) -> bool {
        self.bucket_iter(bucket).any(|c| c == chunk)
    }
}

/// Iterator over one bucket's free chunks
pub(crate) struct BucketIter<'a> {
    info: &'a ShmemInfo,
    current: Option<usize>,
}

impl Iterator for BucketIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.current?;
        self.current = self.info.free_next(chunk);
        Some(chunk)
    }
}
