use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::Frame;

/// The queue a [`FrameDescriptor`] currently belongs to, per spec.md §3
/// "Frame": `Free | Modified | Cached | Pageable | Unqueued`.
///
/// Membership in `Modified`/`Cached`/`Pageable` is purely bookkeeping for
/// whatever higher-level VM-object code owns the frame; the Physical Frame
/// Allocator only ever transitions a frame to/from `Free` and otherwise
/// leaves queue membership alone (see spec.md §4.1 "Queue discipline").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameQueue {
    Free = 0,
    Modified = 1,
    Cached = 2,
    Pageable = 3,
    Unqueued = 4,
}

impl FrameQueue {
    fn from_u8(raw: u8) -> FrameQueue {
        match raw {
            0 => FrameQueue::Free,
            1 => FrameQueue::Modified,
            2 => FrameQueue::Cached,
            3 => FrameQueue::Pageable,
            _ => FrameQueue::Unqueued,
        }
    }
}

/// The per-frame metadata record that spec.md §3 "Frame" describes: one
/// instance per usable physical page, created once at boot and never
/// destroyed, only ever moved between queues and allocation states.
///
/// The object back-reference and offset are left as opaque `usize`s here
/// (an object id and a byte offset) rather than a typed pointer, since the
/// VM-object layer that would give them meaning is out of scope for this
/// core (spec.md §1).
pub struct FrameDescriptor {
    frame: Frame,
    /// 0 means free. The Physical Frame Allocator is the only writer of
    /// this field during alloc/free; other increments (e.g. a second
    /// mapper sharing a frame) are owned by callers, mirroring the
    /// "owner-count" field in spec.md.
    owner_count: AtomicUsize,
    queue: AtomicU8,
    dirty: AtomicU8,
    /// `0` means "no owning VM object". Nonzero values are an opaque
    /// object id assigned by the (out of scope) VM-object layer.
    object_id: AtomicUsize,
    object_offset: AtomicUsize,
}

impl FrameDescriptor {
    /// Creates a descriptor for `frame` in the initial `Free` state with
    /// `owner_count == 0`, honoring the invariant that free frames have no
    /// object back-reference.
    pub const fn new(frame: Frame) -> FrameDescriptor {
        FrameDescriptor {
            frame,
            owner_count: AtomicUsize::new(0),
            queue: AtomicU8::new(FrameQueue::Free as u8),
            dirty: AtomicU8::new(0),
            object_id: AtomicUsize::new(0),
            object_offset: AtomicUsize::new(0),
        }
    }

    pub fn frame(&self) -> Frame {
        self.frame
    }

    pub fn owner_count(&self) -> usize {
        self.owner_count.load(Ordering::Acquire)
    }

    pub fn queue(&self) -> FrameQueue {
        FrameQueue::from_u8(self.queue.load(Ordering::Acquire))
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire) != 0
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty as u8, Ordering::Release);
    }

    pub fn object(&self) -> Option<(usize, usize)> {
        let id = self.object_id.load(Ordering::Acquire);
        if id == 0 {
            None
        } else {
            Some((id, self.object_offset.load(Ordering::Acquire)))
        }
    }

    /// Moves the frame to a new queue. The Physical Frame Allocator never
    /// calls this for any queue but `Free`/`Unqueued`; callers that own a
    /// frame (the object cache, the pager) call it to record
    /// `Modified`/`Cached`/`Pageable` membership, per spec.md §4.1.
    pub fn set_queue(&self, queue: FrameQueue) {
        self.queue.store(queue as u8, Ordering::Release);
    }

    pub fn set_object(&self, object_id: usize, offset: usize) {
        debug_assert!(object_id != 0, "object id 0 is reserved for \"no object\"");
        self.object_id.store(object_id, Ordering::Release);
        self.object_offset.store(offset, Ordering::Release);
    }

    pub fn clear_object(&self) {
        self.object_id.store(0, Ordering::Release);
        self.object_offset.store(0, Ordering::Release);
    }

    /// Transitions `Free` with `owner_count == 0` to an allocated, unqueued
    /// frame with `owner_count == 1`. Only the Physical Frame Allocator may
    /// call this, exactly once per allocation.
    pub fn mark_allocated(&self) {
        debug_assert_eq!(self.owner_count.load(Ordering::Acquire), 0);
        self.owner_count.store(1, Ordering::Release);
        self.queue.store(FrameQueue::Unqueued as u8, Ordering::Release);
    }

    /// The inverse of [`mark_allocated`](Self::mark_allocated). Only the
    /// Physical Frame Allocator may call this.
    pub fn mark_free(&self) {
        self.owner_count.store(0, Ordering::Release);
        self.queue.store(FrameQueue::Free as u8, Ordering::Release);
        self.clear_object();
        self.set_dirty(false);
    }
}
