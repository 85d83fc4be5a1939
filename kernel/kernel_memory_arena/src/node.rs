//! The ordered node list covering the whole kernel VM window, plus the
//! size-bucketed free index used to pick a fitting node in one probe.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

/// Number of size buckets: one per bit position of a `usize`, bucket `b`
/// holding every free node whose size is in `[2^b, 2^(b+1))`.
const NUM_BUCKETS: usize = usize::BITS as usize;

pub struct Node {
    pub size: usize,
    pub allocated: bool,
}

fn bucket_of(size: usize) -> usize {
    debug_assert!(size > 0);
    (usize::BITS - 1 - size.leading_zeros()) as usize
}

/// The bucket that is *guaranteed* to hold a fitting node on the first
/// probe: for a power-of-two size, bucket `highbit(size)` itself (every
/// entry there is `>= size`); otherwise one bucket higher, since entries
/// in `highbit(size)` can be smaller than a non-power-of-two `size`.
fn guaranteed_bucket(size: usize) -> usize {
    let b = bucket_of(size);
    if size.is_power_of_two() {
        b
    } else {
        (b + 1).min(NUM_BUCKETS - 1)
    }
}

/// The ordered list of `{base, size, allocated}` nodes partitioning the
/// arena's VM window, plus a bucketed free-list index over it. The list is
/// a strict partition: every byte of the window belongs to exactly one
/// node, so a node's right neighbor is always at `base + size` and its
/// left neighbor is always the previous key in the map.
pub struct FreeIndex {
    nodes: BTreeMap<usize, Node>,
    buckets: [Vec<usize>; NUM_BUCKETS],
}

impl FreeIndex {
    pub fn new() -> FreeIndex {
        FreeIndex {
            nodes: BTreeMap::new(),
            buckets: core::array::from_fn(|_| Vec::new()),
        }
    }

    /// Seeds the arena with a single free node covering the whole window.
    pub fn seed(&mut self, base: usize, size: usize) {
        self.nodes.insert(base, Node { size, allocated: false });
        self.bucket_insert(base, size);
    }

    fn bucket_insert(&mut self, base: usize, size: usize) {
        self.buckets[bucket_of(size)].push(base);
    }

    fn bucket_remove(&mut self, base: usize, size: usize) {
        let bucket = &mut self.buckets[bucket_of(size)];
        if let Some(pos) = bucket.iter().position(|&b| b == base) {
            bucket.swap_remove(pos);
        }
    }

    /// Finds and allocates a node of exactly `size` bytes, splitting off
    /// and re-freeing any leftover. Probes the guaranteed bucket first,
    /// then escalates to higher buckets if it happens to be empty.
    pub fn reserve(&mut self, size: usize) -> Option<usize> {
        let start = guaranteed_bucket(size);
        for b in start..NUM_BUCKETS {
            let pos = self.buckets[b]
                .iter()
                .position(|&base| self.nodes.get(&base).is_some_and(|n| n.size >= size));
            let Some(pos) = pos else { continue };

            let base = self.buckets[b].swap_remove(pos);
            let node_size = self.nodes.get(&base).expect("bucket entry missing from node list").size;

            if node_size > size {
                let remainder_base = base + size;
                let remainder_size = node_size - size;
                self.nodes.insert(remainder_base, Node { size: remainder_size, allocated: false });
                self.bucket_insert(remainder_base, remainder_size);
            }

            let node = self.nodes.get_mut(&base).expect("node just matched above");
            node.size = size;
            node.allocated = true;
            return Some(base);
        }
        None
    }

    /// Marks the allocated node at `base` (of `expected_size` bytes) free
    /// again, coalescing with either neighbor if it's also free. Returns
    /// `None` if there is no such allocated node, or if its size doesn't
    /// match (a caller bug, since every allocation's size is fixed at
    /// reservation time).
    pub fn release(&mut self, base: usize, expected_size: usize) -> Option<()> {
        {
            let node = self.nodes.get(&base)?;
            if !node.allocated || node.size != expected_size {
                return None;
            }
        }

        let mut new_base = base;
        let mut new_size = expected_size;

        let right_key = new_base + new_size;
        if let Some(right) = self.nodes.get(&right_key) {
            if !right.allocated {
                let right_size = right.size;
                self.bucket_remove(right_key, right_size);
                self.nodes.remove(&right_key);
                new_size += right_size;
            }
        }

        let left = self.nodes.range(..new_base).next_back().map(|(&b, n)| (b, n.size, n.allocated));
        if let Some((left_base, left_size, left_allocated)) = left {
            if !left_allocated && left_base + left_size == new_base {
                self.bucket_remove(left_base, left_size);
                self.nodes.remove(&left_base);
                new_base = left_base;
                new_size += left_size;
            }
        }

        self.nodes.remove(&base);
        self.nodes.insert(new_base, Node { size: new_size, allocated: false });
        self.bucket_insert(new_base, new_size);
        Some(())
    }

    pub fn total_free_bytes(&self) -> usize {
        self.nodes.values().filter(|n| !n.allocated).map(|n| n.size).sum()
    }

    pub fn total_node_count(&self) -> usize {
        self.nodes.len()
    }
}
