//! Process/thread id allocation: a simple monotonic counter, the same
//! "just increment an atomic" scheme the teacher's own `TaskId`/boot-time
//! counters use rather than a recycled id pool.

use core::sync::atomic::{AtomicUsize, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(usize);

impl ThreadId {
    pub fn value(&self) -> usize {
        self.0
    }
}

impl ProcessId {
    pub fn value(&self) -> usize {
        self.0
    }
}

static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(0);
static NEXT_PROCESS_ID: AtomicUsize = AtomicUsize::new(0);

pub fn next_thread_id() -> ThreadId {
    ThreadId(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed))
}

pub fn next_process_id() -> ProcessId {
    ProcessId(NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed))
}
