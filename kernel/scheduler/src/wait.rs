//! Wait queues: the objects a [`crate::sleep`]ing thread is enqueued on,
//! and the `Sleeping -> Ready` half of `crate::wake`/`crate::interrupt`.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use kernel_config::irq_lock::IrqSafeMutex;
use task::Thread;

/// A FIFO list of threads blocked for the same reason (a lock, a
/// condition, a timeout with no other wakeup source). Spec.md §3 calls
/// this "a wait-queue"; a Sleeping thread is on exactly one.
///
/// Locked with [`IrqSafeMutex`] rather than a plain spinlock: `wake` can
/// run from an IPI handler (a thread waking another CPU's sleeper) as
/// well as from ordinary task context, so the same interrupt-reentrancy
/// hazard `percpu::PerCpu::state` has applies here.
pub struct WaitQueue {
    threads: IrqSafeMutex<VecDeque<Arc<Thread>>>,
}

impl WaitQueue {
    pub const fn new() -> WaitQueue {
        WaitQueue { threads: IrqSafeMutex::new(VecDeque::new()) }
    }

    pub(crate) fn enqueue(&self, thread: Arc<Thread>) {
        self.threads.lock().push_back(thread);
    }

    /// Removes `thread` from this queue if present, for `wake`/`interrupt`
    /// to call before re-dispatching it; returns `true` if it was found
    /// (a thread can only be removed once, which is what makes a
    /// concurrent timeout-vs-explicit-wake race resolve to exactly one
    /// winner).
    pub(crate) fn remove(&self, thread: &Arc<Thread>) -> bool {
        let mut guard = self.threads.lock();
        if let Some(pos) = guard.iter().position(|t| Arc::ptr_eq(t, thread)) {
            guard.remove(pos);
            true
        } else {
            false
        }
    }

    /// Removes and returns one waiter, FIFO order.
    pub fn wake_one(&self) -> Option<Arc<Thread>> {
        let thread = self.threads.lock().pop_front()?;
        crate::wake(&thread);
        Some(thread)
    }

    /// Wakes every waiter currently on this queue.
    pub fn wake_all(&self) {
        let drained: alloc::vec::Vec<_> = self.threads.lock().drain(..).collect();
        for thread in drained {
            crate::wake(&thread);
        }
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
