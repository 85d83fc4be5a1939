//! The Scheduler (spec.md §4.5): per-CPU multilevel run queues, timeslice
//! accounting, priority adjustment, preemption, idle, and cross-CPU load
//! balancing.
//!
//! Grounded on the teacher's own `scheduler`/`preemption`/`task` crate
//! split (a dedicated `preemption` crate so any crate can disable
//! preemption without a dependency on this one; `task` owns the Thread/
//! Process data model this crate only operates on through `&Arc<Thread>`
//! handles and the `task::Dispatcher` injection point). The pack ships no
//! readable source for `scheduler` itself (its workspace directory is a
//! bare `Cargo.toml`), so the dispatch algorithm, run-queue structure, and
//! load-balancer are built directly from spec.md §4.5's numbered steps
//! rather than copied from a teacher file; see DESIGN.md.

#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

mod balance;
mod percpu;
mod switch;
#[cfg(test)]
mod test;
mod timeout;
mod wait;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use spin::Once;

use kernel_config::sched::{MAX_CPUS, PRIORITY_MAX};
use kernel_config::time::TIMESLICE_QUANTUM_MS;
use kernel_config::KResult;
use task::{Process, Thread, ThreadFlags, ThreadState};

pub use wait::WaitQueue;

bitflags! {
    /// Flags controlling how [`sleep`] behaves when the sleeping thread is
    /// killed or explicitly interrupted.
    pub struct SleepFlags: u8 {
        /// A pending `KILLED`/`INTERRUPTED` flag returns `Interrupted`
        /// immediately instead of actually blocking, and an `interrupt`
        /// call while sleeping wakes this thread early.
        const INTERRUPTIBLE = 1 << 0;
    }
}

impl SleepFlags {
    /// Never interrupted by a signal or `thread_interrupt`; only a
    /// timeout or an explicit `wake` ends the sleep.
    pub const UNINTERRUPTIBLE: SleepFlags = SleepFlags::empty();
}

/// The outcome of a [`sleep`] call, per spec.md §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepStatus {
    Ok,
    Interrupted,
    TimedOut,
    WouldBlock,
}

/// Implemented by whatever owns the per-CPU preemption hardware timer (the
/// boot/console layer, out of scope per spec.md §1) so this crate can
/// request a one-shot callback without touching a timer register
/// directly, the same injection shape `apic::InterruptRaiser` and
/// `preemption::Yielder` use.
pub trait PreemptionTimer: Sync {
    /// Arms a one-shot timer on the calling CPU that calls [`on_timer_fired`]
    /// once, `ms` milliseconds from now, replacing any timer previously
    /// armed on this CPU.
    fn arm_one_shot(&self, ms: u64);
}

static TIMER: Once<&'static dyn PreemptionTimer> = Once::new();

pub fn register_preemption_timer(timer: &'static dyn PreemptionTimer) {
    TIMER.call_once(|| timer);
}

const ZERO: AtomicU64 = AtomicU64::new(0);
/// The duration armed by this CPU's most recent [`arm_timer`] call, read
/// back by [`on_timer_fired`] as the elapsed time to feed
/// [`timeout::on_tick`] — see `timeout.rs`'s module doc for why ticking is
/// modeled this way rather than per-sleeper hardware timers.
static LAST_ARMED_MS: [AtomicU64; MAX_CPUS] = [ZERO; MAX_CPUS];

fn arm_timer(ms: u64) {
    let ordinal = percpu::this_ordinal();
    let ms = ms.max(1);
    LAST_ARMED_MS[ordinal].store(ms, Ordering::Relaxed);
    if let Some(timer) = TIMER.get() {
        timer.arm_one_shot(ms);
    }
}

/// Called by the Trap Dispatcher's timer-interrupt handler when the
/// one-shot armed by [`arm_timer`] fires.
pub fn on_timer_fired() {
    let ordinal = percpu::this_ordinal();
    let elapsed = LAST_ARMED_MS[ordinal].swap(0, Ordering::Relaxed);
    timeout::on_tick(elapsed);

    let me = current_thread();
    me.set_timeslice_remaining_ms(0);
    if preemption::is_preemption_disabled() {
        preemption::mark_missed();
    } else {
        yield_now();
    }
}

/// The one system-wide process every idle and load-balancer thread
/// belongs to; it owns the kernel address space, which is already the
/// active one whenever these threads run.
static KERNEL_PROCESS: Once<Arc<Process>> = Once::new();

fn kernel_process() -> Arc<Process> {
    KERNEL_PROCESS
        .call_once(|| {
            let space = memory::init(false)
                .unwrap_or_else(|_| kernel_config::fatal!("failed to establish the kernel address space"));
            Process::new(space, true)
        })
        .clone()
}

extern "C" fn idle_entry(_a1: u64, _a2: u64) -> ! {
    loop {
        if percpu::this().state.lock().runnable > 0 {
            yield_now();
        } else {
            halt_cpu();
        }
    }
}

#[cfg(not(test))]
fn halt_cpu() {
    x86_64::instructions::hlt();
}

#[cfg(test)]
fn halt_cpu() {
    yield_now();
}

/// Registers this crate as both the `task` dispatcher and the
/// `preemption` yielder, creates this CPU's idle thread, and (SMP only)
/// spawns its dedicated load-balancer thread. Must run once per CPU,
/// before any other call into this crate on that CPU.
pub fn init_per_cpu() {
    static DISPATCHER: SchedulerDispatcher = SchedulerDispatcher;
    task::register_dispatcher(&DISPATCHER);
    preemption::register_yielder(&DISPATCHER);

    let owner = kernel_process();
    let idle = task::thread_create("idle", owner.clone(), ThreadFlags::UNQUEUEABLE, idle_entry, 0, 0)
        .unwrap_or_else(|_| kernel_config::fatal!("failed to create the idle thread"));
    idle.set_assigned_cpu(Some(cpu::current_cpu()));
    idle.set_state(ThreadState::Running);

    let mut state = percpu::this().state.lock();
    state.idle = Some(idle.clone());
    state.curr = Some(idle);
    drop(state);

    let balancer = balance::spawn_for_this_cpu(owner);
    percpu::this().state.lock().balancer = balancer;
}

struct SchedulerDispatcher;

impl task::Dispatcher for SchedulerDispatcher {
    fn enqueue_ready(&self, thread: Arc<Thread>) {
        enqueue_ready(thread);
    }

    fn wake(&self, thread: &Arc<Thread>) -> bool {
        wake(thread)
    }

    fn exit_current(&self) -> ! {
        let me = current_thread();
        me.set_state(ThreadState::Dead);
        yield_now();
        unreachable!("a Dead thread must never be dispatched again");
    }
}

impl preemption::Yielder for SchedulerDispatcher {
    fn yield_now(&self) {
        yield_now();
    }
}

/// Puts `thread` (already `Ready`) onto its assigned CPU's run queue,
/// assigning it to the calling CPU first if it has none. `UNQUEUEABLE`
/// threads (idle, by convention) are never actually enqueued; the caller
/// is expected to dispatch them directly instead.
fn enqueue_ready(thread: Arc<Thread>) {
    if thread.flags().contains(ThreadFlags::UNQUEUEABLE) {
        return;
    }
    if thread.assigned_cpu().is_none() {
        thread.set_assigned_cpu(Some(cpu::current_cpu()));
    }
    let ordinal = thread.assigned_cpu().and_then(|c| c.ordinal()).unwrap_or_else(percpu::this_ordinal);
    let priority = thread.priority();
    percpu::at(ordinal).state.lock().push(priority, thread);
}

/// Transitions a `Sleeping` thread back to `Ready` and re-inserts it on
/// its CPU's run queue. Returns `false` if `thread` was not `Sleeping`.
/// If that CPU was idle, sends a reschedule IPI to pull it out of `hlt`.
pub fn wake(thread: &Arc<Thread>) -> bool {
    if thread.state() != ThreadState::Sleeping {
        return false;
    }
    thread.set_state(ThreadState::Ready);

    let ordinal = thread.assigned_cpu().and_then(|c| c.ordinal()).unwrap_or_else(percpu::this_ordinal);
    let was_idle = {
        let mut state = percpu::at(ordinal).state.lock();
        let was_idle = state.curr.as_ref().is_some_and(|c| is_idle_thread(c));
        state.push(thread.priority(), thread.clone());
        was_idle
    };

    if was_idle {
        if let Some(target) = cpu::cpu_at(ordinal) {
            // `ipi::send` itself special-cases sending to the caller's own
            // CPU by running the handler locally with no interrupt raised,
            // so there's nothing to skip here even if `ordinal` is ours.
            let _ = ipi::send(target, reschedule_handler, 0, 0, 0, 0, false);
        }
    }
    true
}

fn is_idle_thread(thread: &Arc<Thread>) -> bool {
    thread.flags().contains(ThreadFlags::UNQUEUEABLE) && thread.name() == "idle"
}

/// A no-op IPI handler: its only purpose is to raise the actual
/// inter-processor interrupt that pulls a `hlt`-ed CPU out of idle so it
/// re-enters the dispatch loop and notices the newly `Ready` thread.
fn reschedule_handler(_a1: u64, _a2: u64, _a3: u64, _a4: u64) -> i64 {
    0
}

/// Sets `KILLED`/`INTERRUPTED` delivery aside (that's `task::thread_kill`/
/// `thread_interrupt`'s job); this just re-exposes `thread_interrupt`
/// under the name spec.md §4.5 gives it.
pub fn interrupt(thread: &Arc<Thread>) -> KResult<()> {
    task::thread_interrupt(thread)
}

/// The thread currently running on this CPU. Used by the Trap Dispatcher to
/// find the interrupted thread's kernel-entry/exit bookkeeping and its
/// signal/FPU state without threading a parameter through every handler.
pub fn current_thread() -> Arc<Thread> {
    percpu::this()
        .state
        .lock()
        .curr
        .clone()
        .unwrap_or_else(|| kernel_config::fatal!("scheduler::init_per_cpu was never called on this CPU"))
}

/// The thread that was running on this CPU immediately before the last
/// switch, if any.
pub fn previous_thread() -> Option<Arc<Thread>> {
    percpu::this().state.lock().prev.clone()
}

/// Blocks the calling thread on `wait_queue`, atomically releasing `guard`
/// once the thread is enqueued and marked `Sleeping` (so no wakeup between
/// the caller's check and this call can be missed). `timeout_ms == Some(0)`
/// is try-lock semantics: returns `WouldBlock` immediately without
/// blocking.
pub fn sleep<T>(
    guard: spin::MutexGuard<'_, T>,
    wait_queue: &WaitQueue,
    timeout_ms: Option<u64>,
    name: &str,
    flags: SleepFlags,
) -> SleepStatus {
    sleep_core(wait_queue, timeout_ms, name, flags, move || drop(guard))
}

/// The no-caller-lock form of [`sleep`], for waits with nothing to release
/// (e.g. the load balancer's own timed wait).
pub(crate) fn sleep_timeout_only(wait_queue: &WaitQueue, timeout_ms: Option<u64>, name: &str, flags: SleepFlags) -> SleepStatus {
    sleep_core(wait_queue, timeout_ms, name, flags, || {})
}

fn sleep_core(
    wait_queue: &WaitQueue,
    timeout_ms: Option<u64>,
    name: &str,
    flags: SleepFlags,
    on_committed: impl FnOnce(),
) -> SleepStatus {
    let me = current_thread();
    log::trace!("thread {:?} sleeping on {}", me.id(), name);

    if timeout_ms == Some(0) {
        on_committed();
        return SleepStatus::WouldBlock;
    }
    let interruptible = flags.contains(SleepFlags::INTERRUPTIBLE);
    if interruptible && (me.is_killed() || me.is_interrupted()) {
        me.clear_interrupted();
        on_committed();
        return SleepStatus::Interrupted;
    }

    wait_queue.enqueue(me.clone());
    me.set_state(ThreadState::Sleeping);
    if let Some(ms) = timeout_ms {
        timeout::arm(me.clone(), ms);
    }
    on_committed();

    yield_now();

    wait_queue.remove(&me);
    let timed_out = timeout::disarm_and_check_fired(&me);
    if interruptible && me.is_interrupted() {
        me.clear_interrupted();
        SleepStatus::Interrupted
    } else if timed_out {
        SleepStatus::TimedOut
    } else {
        SleepStatus::Ok
    }
}

/// Applies spec.md §4.5's priority-adjustment rule to a thread that is
/// about to be re-queued as `Ready` after relinquishing the CPU (as
/// opposed to going `Sleeping`/`Dead`). Never touches a fixed-priority
/// process's threads.
fn adjust_priority(thread: &Thread, state: &percpu::State) {
    if thread.owner().has_fixed_priority() {
        return;
    }
    let priority = thread.priority();
    let consumed_fully = thread.timeslice_remaining_ms() == 0;

    if !consumed_fully && priority > thread.owner().min_priority() {
        thread.set_priority(priority - 1);
    } else if state.none_at_or_better(priority) && state.any_worse(priority) {
        let max = (PRIORITY_MAX - 1) as u8;
        thread.set_priority((priority + 1).min(max));
    }
}

/// Frees whichever thread this CPU's *previous* dispatch switched away from,
/// if it turned out to be `Dead`.
///
/// A thread that exits is switched away from before anything can free its
/// stack (it's still in use for the rest of this function's body up to the
/// low-level switch), and a brand new thread's fabricated first return
/// address goes straight to `task::trampoline`, never through the tail of
/// this function — so neither the exiting thread nor a freshly dispatched
/// one is ever in a position to reap it. The one thread guaranteed to reach
/// this line eventually is whichever later calls `yield_now` on the same
/// CPU, so reaping happens there instead, one dispatch's delay.
fn reap_previous(per_cpu: &percpu::PerCpu) {
    let prev = per_cpu.state.lock().prev.clone();
    if let Some(prev) = prev {
        if prev.state() == ThreadState::Dead {
            task::thread_destroy_stack(&prev);
        }
    }
}

/// The full context-switch algorithm of spec.md §4.5, steps 1-7.
pub fn yield_now() {
    let cpu_ordinal = percpu::this_ordinal();
    let per_cpu = percpu::at(cpu_ordinal);
    reap_previous(per_cpu);
    let outgoing = current_thread();

    let next = {
        let mut state = per_cpu.state.lock();

        if outgoing.state() == ThreadState::Running {
            adjust_priority(&outgoing, &state);
            outgoing.set_state(ThreadState::Ready);
            if !outgoing.flags().contains(ThreadFlags::UNQUEUEABLE) {
                state.push(outgoing.priority(), outgoing.clone());
            }
        }

        let next = match state.pop_highest() {
            Some(t) => {
                let timeslice = (t.priority() as u64 + 1) * TIMESLICE_QUANTUM_MS;
                t.set_timeslice_remaining_ms(timeslice);
                t
            }
            None => {
                let idle = state
                    .idle
                    .clone()
                    .unwrap_or_else(|| kernel_config::fatal!("no idle thread registered for this CPU"));
                idle.set_timeslice_remaining_ms(0);
                idle
            }
        };
        next.set_state(ThreadState::Running);

        state.prev = Some(outgoing.clone());
        state.curr = Some(next.clone());
        next
    };

    if !next.flags().contains(ThreadFlags::UNPREEMPTABLE) {
        arm_timer(next.timeslice_remaining_ms().max(TIMESLICE_QUANTUM_MS));
    }

    if !Arc::ptr_eq(&outgoing, &next) {
        let (cpu_depth, cpu_missed) = preemption::save_and_reset();
        outgoing.save_preempt_state(cpu_depth, cpu_missed);

        let outgoing_space = outgoing.owner().address_space();
        let next_space = next.owner().address_space();
        if outgoing_space.root_frame() != next_space.root_frame() {
            memory::mark_inactive(outgoing_space, cpu_ordinal);
            memory::switch(next_space, cpu_ordinal);
        }

        let (next_depth, next_missed) = next.take_preempt_state();
        preemption::restore(next_depth, next_missed);

        let prev_sp_ptr = outgoing.saved_sp_ptr();
        let next_sp = next.saved_sp();
        // SAFETY: `outgoing` is the thread that was running on this CPU
        // until this point, and `next` was dispatched above; both are
        // live, exclusively-owned kernel stacks per the per-CPU scheduler
        // lock's discipline.
        unsafe {
            switch::switch_stacks(prev_sp_ptr, next_sp);
        }
    }
}

/// Cooperative entry point for preemption (the trap dispatcher calls this
/// at kernel-exit time when the CPU's should-preempt flag is set and
/// preemption is not disabled).
pub fn preempt_now() {
    yield_now();
}

pub use preemption::{preempt_disable, preempt_enable};
pub use task::{thread_at_kernel_entry, thread_at_kernel_exit};
