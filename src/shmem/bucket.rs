//! Free-list size classes.
//!
//! Sizes from [`MIN_BUCKET_SIZE`] up to [`MAX_BUCKET_SIZE`] (exclusive) get one
//! bucket per 8-byte step, so any chunk found in such a bucket fits a request
//! that maps to the same or a lower bucket. Everything at or above
//! [`MAX_BUCKET_SIZE`] shares the last bucket, which is searched first-fit.

/// Smallest payload handed out; must hold the two free-list link words.
pub const MIN_ALLOC: usize = 24;

pub const MIN_BUCKET_SIZE: usize = MIN_ALLOC;
pub const MAX_BUCKET_SIZE: usize = 256;

/// Number of buckets, the last one being the overflow bucket.
pub const BUCKET_COUNT: usize = (MAX_BUCKET_SIZE - MIN_BUCKET_SIZE) / 8 + 1;

/// Index of the overflow bucket.
pub const OVERFLOW_BUCKET: usize = BUCKET_COUNT - 1;

/// Map a payload size to its bucket.
///
/// Used both when linking a free chunk and when searching for a fit.
#[inline]
pub const fn bucket_by_size(size: usize) -> usize {
    if size < MIN_BUCKET_SIZE {
        return 0;
    }
    if size < MAX_BUCKET_SIZE {
        return (size - MIN_BUCKET_SIZE) >> 3;
    }
    OVERFLOW_BUCKET
}

/// Smallest payload size that lands in `bucket`.
pub const fn bucket_min_size(bucket: usize) -> usize {
    MIN_BUCKET_SIZE + 8 * bucket
}

/// Round a request up to a multiple of 8 and to at least [`MIN_ALLOC`].
///
/// Callers bound `size` by the maximum region size first.
#[inline]
pub const fn proper_alloc_size(size: usize) -> usize {
    if size >= MIN_ALLOC {
        size + ((8 - (size & 7)) & 7)
    } else {
        MIN_ALLOC
    }
}
