//! The free-chunk index: an address-ordered map for neighbor lookups on
//! free (coalescing) plus a size-bucketed index for descent on allocation,
//! kept in sync by [`Buckets`].

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use memory_structs::{Frame, FrameRange};

/// One maximal run of contiguous free frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub start: Frame,
    pub end: Frame,
}

impl Chunk {
    pub fn size_in_frames(&self) -> usize {
        FrameRange::new(self.start, self.end).size_in_frames()
    }

    pub fn range(&self) -> FrameRange {
        FrameRange::new(self.start, self.end)
    }
}

/// Number of size buckets: one per bit position of a `usize`.
const NUM_BUCKETS: usize = usize::BITS as usize;

/// Returns the bucket index for a chunk of `frame_count` frames: the
/// position of its highest set bit, so chunks of `[2^k, 2^(k+1))` frames
/// all land in bucket `k`. A descent that needs `n` frames only has to
/// search buckets `>= floor(log2(n))`, since anything smaller can't satisfy
/// the request.
fn bucket_of(frame_count: usize) -> usize {
    debug_assert!(frame_count > 0);
    (usize::BITS - 1 - frame_count.leading_zeros()) as usize
}

/// The free-frame index backing the Physical Frame Allocator.
///
/// `by_start` is the source of truth, keyed by each chunk's starting frame
/// number, used to find left/right neighbors in O(log n) when a freed
/// range is returned. `buckets` holds the same chunks' start-frame-numbers
/// again, just partitioned by `bucket_of(size)`, so an allocation can
/// descend straight to the smallest bucket that could possibly satisfy it
/// instead of scanning every free chunk.
#[derive(Default)]
pub struct FreeIndex {
    by_start: BTreeMap<usize, Chunk>,
    buckets: [Vec<usize>; NUM_BUCKETS],
}

impl FreeIndex {
    pub fn new() -> FreeIndex {
        FreeIndex {
            by_start: BTreeMap::new(),
            buckets: Default::default(),
        }
    }

    fn bucket_insert(&mut self, chunk: &Chunk) {
        self.buckets[bucket_of(chunk.size_in_frames())].push(chunk.start.number());
    }

    fn bucket_remove(&mut self, chunk: &Chunk) {
        let bucket = &mut self.buckets[bucket_of(chunk.size_in_frames())];
        if let Some(pos) = bucket.iter().position(|&s| s == chunk.start.number()) {
            bucket.swap_remove(pos);
        }
    }

    /// Inserts a free chunk, merging it with an adjacent left/right
    /// neighbor if one exists so two free chunks never sit next to each
    /// other uncoalesced.
    pub fn insert(&mut self, mut chunk: Chunk) {
        if let Some((&_, &left)) = self.by_start.range(..chunk.start.number()).next_back() {
            if left.end.number() + 1 == chunk.start.number() {
                self.remove_exact(left);
                chunk.start = left.start;
            }
        }
        if let Some(right) = self.by_start.get(&(chunk.end.number() + 1)).copied() {
            self.remove_exact(right);
            chunk.end = right.end;
        }
        self.by_start.insert(chunk.start.number(), chunk);
        self.bucket_insert(&chunk);
    }

    fn remove_exact(&mut self, chunk: Chunk) {
        self.by_start.remove(&chunk.start.number());
        self.bucket_remove(&chunk);
    }

    /// Finds and removes a free chunk of at least `min_frames` frames whose
    /// range intersects `[window_start, window_end]`, preferring the
    /// smallest bucket that could possibly contain a fit. Returns the whole
    /// chunk removed; the caller splits off the part it doesn't need and
    /// reinserts the remainder.
    pub fn take_fitting(
        &mut self,
        min_frames: usize,
        window_start: Frame,
        window_end: Frame,
    ) -> Option<Chunk> {
        let start_bucket = bucket_of(min_frames);
        for bucket in start_bucket..NUM_BUCKETS {
            let candidates = self.buckets[bucket].clone();
            for start_number in candidates {
                let chunk = match self.by_start.get(&start_number) {
                    Some(c) => *c,
                    None => continue,
                };
                if chunk.size_in_frames() < min_frames {
                    continue;
                }
                if chunk.end < window_start || chunk.start > window_end {
                    continue;
                }
                self.remove_exact(chunk);
                return Some(chunk);
            }
        }
        None
    }

    pub fn total_free_frames(&self) -> usize {
        self.by_start.values().map(Chunk::size_in_frames).sum()
    }
}
