//! Per-CPU scheduler state: the ready-queue array, the runnable counters,
//! and the currently/previously running thread pointers spec.md §3's
//! "Per-CPU Scheduler" record describes.
//!
//! All of it sits behind one lock per CPU (`state`), the "per-CPU scheduler
//! spinlock" of spec.md §5's locking discipline: queue membership,
//! `runnable`, and `curr`/`prev` all change together at a dispatch, so
//! there is no benefit to splitting them further the way `ipi`'s pool and
//! per-queue locks are split (those really are touched independently).
//!
//! This lock is [`IrqSafeMutex`], not a plain `spin::Mutex`: it is taken
//! both from ordinary task context (`yield_now`, `wake`, the balancer) and
//! from [`crate::on_timer_fired`], which runs as an interrupt handler on
//! the same CPU whenever the preemption timer fires — a plain spinlock
//! would deadlock if that timer interrupt lands while task context
//! already holds this lock.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Once;

use kernel_config::irq_lock::IrqSafeMutex;
use kernel_config::sched::PRIORITY_MAX;
use task::Thread;

/// Running total of Ready threads across every CPU, maintained under each
/// CPU's own `state` lock as queue membership changes on that CPU; the
/// testable property of spec.md §8 is `sum_over_cpus(runnable) ==
/// THREADS_RUNNABLE` whenever no scheduler lock is held.
pub(crate) static THREADS_RUNNABLE: AtomicUsize = AtomicUsize::new(0);

pub(crate) struct State {
    pub(crate) queues: Vec<VecDeque<Arc<Thread>>>,
    pub(crate) runnable: usize,
    pub(crate) curr: Option<Arc<Thread>>,
    pub(crate) prev: Option<Arc<Thread>>,
    pub(crate) idle: Option<Arc<Thread>>,
    pub(crate) balancer: Option<Arc<Thread>>,
}

impl State {
    fn new() -> State {
        State {
            queues: (0..PRIORITY_MAX).map(|_| VecDeque::new()).collect(),
            runnable: 0,
            curr: None,
            prev: None,
            idle: None,
            balancer: None,
        }
    }

    /// The first non-empty queue, highest priority (lowest index) first,
    /// per spec.md §4.5's "queue selection picks the first non-empty
    /// queue, FIFO within the queue".
    pub(crate) fn pop_highest(&mut self) -> Option<Arc<Thread>> {
        for queue in self.queues.iter_mut() {
            if let Some(t) = queue.pop_front() {
                self.runnable -= 1;
                THREADS_RUNNABLE.fetch_sub(1, Ordering::AcqRel);
                return Some(t);
            }
        }
        None
    }

    pub(crate) fn push(&mut self, priority: u8, thread: Arc<Thread>) {
        self.queues[priority as usize].push_back(thread);
        self.runnable += 1;
        THREADS_RUNNABLE.fetch_add(1, Ordering::AcqRel);
    }

    /// `true` if no thread at priority `<= priority` is waiting, i.e. the
    /// demotion rule's "no threads exist at equal-or-better priorities"
    /// condition.
    pub(crate) fn none_at_or_better(&self, priority: u8) -> bool {
        self.queues[..=priority as usize].iter().all(VecDeque::is_empty)
    }

    /// `true` if some thread strictly worse than `priority` is waiting,
    /// i.e. the demotion rule's "at least one thread exists at a worse
    /// priority" condition.
    pub(crate) fn any_worse(&self, priority: u8) -> bool {
        let start = priority as usize + 1;
        start < self.queues.len() && self.queues[start..].iter().any(|q| !q.is_empty())
    }
}

pub(crate) struct PerCpu {
    pub(crate) state: IrqSafeMutex<State>,
}

static PER_CPU: Once<Vec<PerCpu>> = Once::new();

/// Lazily sizes the per-CPU table to `cpu::cpu_count()`. Safe to call from
/// every CPU's `init_per_cpu`; only the first call actually allocates.
pub(crate) fn table() -> &'static Vec<PerCpu> {
    PER_CPU.call_once(|| {
        let count = (cpu::cpu_count() as usize).max(1);
        (0..count).map(|_| PerCpu { state: IrqSafeMutex::new(State::new()) }).collect()
    })
}

pub(crate) fn this_ordinal() -> usize {
    cpu::current_cpu().ordinal().unwrap_or(0).min(table().len() - 1)
}

pub(crate) fn at(ordinal: usize) -> &'static PerCpu {
    &table()[ordinal]
}

pub(crate) fn this() -> &'static PerCpu {
    at(this_ordinal())
}

/// Restores every already-sized CPU's state to fresh, empty queues with no
/// current/previous/idle/balancer thread, and zeroes the system-wide
/// runnable counter. The table itself (`PER_CPU`'s size) can't be re-sized
/// once `table()` has run once, but clearing each entry's contents is
/// enough to give every hosted test a clean-boot-equivalent starting point.
#[cfg(test)]
pub(crate) fn reset_for_test() {
    THREADS_RUNNABLE.store(0, Ordering::Relaxed);
    for per_cpu in table() {
        *per_cpu.state.lock() = State::new();
    }
}
