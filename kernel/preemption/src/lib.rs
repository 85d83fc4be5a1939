//! Support for enabling/disabling preemption.
//!
//! spec.md §4.5 models the disable counter as a per-thread field so that a
//! thread's preemption state survives migration and re-dispatch; in
//! practice the counter is only ever touched by whichever thread is
//! *currently running* on a CPU (a thread can't meaningfully call `sleep`
//! or migrate while the count is non-zero without violating the
//! preemption-disabled contract it's asking for), so this crate tracks it
//! per CPU rather than threading a `task` dependency through here. The
//! `task`/`scheduler` crates copy this cell into and out of a thread's own
//! stored field across a context switch, preserving the data model in
//! spec.md §3 without a dependency cycle (see DESIGN.md).

#![no_std]

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use kernel_config::sched::MAX_CPUS;

/// One CPU's preemption-disable counter and missed-preempt flag.
struct PerCpu {
    depth: AtomicUsize,
    missed_preempt: AtomicBool,
}

const INIT: PerCpu = PerCpu { depth: AtomicUsize::new(0), missed_preempt: AtomicBool::new(false) };
static PER_CPU: [PerCpu; MAX_CPUS] = [INIT; MAX_CPUS];

fn this_cpu() -> &'static PerCpu {
    let ordinal = cpu::current_cpu().ordinal().unwrap_or(0);
    &PER_CPU[ordinal.min(MAX_CPUS - 1)]
}

/// Implemented by the scheduler to yield the current thread. Registered
/// once at scheduler init so that `preempt_enable` can trigger a deferred
/// yield without this crate depending on `scheduler` (which itself depends
/// on this crate), per the dynamic-dispatch-by-function-pointer idiom in
/// spec.md §9.
pub trait Yielder: Sync {
    fn yield_now(&self);
}

static YIELDER: spin::Once<&'static dyn Yielder> = spin::Once::new();

pub fn register_yielder(yielder: &'static dyn Yielder) {
    YIELDER.call_once(|| yielder);
}

/// Returns `true` if preemption is currently disabled on this CPU, i.e. the
/// preemption timer handler must set [`mark_missed`] rather than switching
/// threads.
pub fn is_preemption_disabled() -> bool {
    this_cpu().depth.load(Ordering::Acquire) != 0
}

/// Increments the current thread's preempt-disable counter. Must be paired
/// with [`preempt_enable`].
pub fn preempt_disable() {
    this_cpu().depth.fetch_add(1, Ordering::AcqRel);
}

/// Decrements the current thread's preempt-disable counter. If this
/// transitions it to zero and a preemption was missed while disabled,
/// immediately yields, per spec.md §4.5's preemption discipline.
///
/// Fatal if called more times than [`preempt_disable`] (a negative
/// preempt-enable is a programmer error, per spec.md §8's round-trip law).
pub fn preempt_enable() {
    let cpu = this_cpu();
    let previous = cpu.depth.fetch_sub(1, Ordering::AcqRel);
    if previous == 0 {
        cpu.depth.fetch_add(1, Ordering::AcqRel); // undo the wrap before halting
        kernel_config::fatal!("preempt_enable called with no matching preempt_disable");
    }
    if previous == 1 && cpu.missed_preempt.swap(false, Ordering::AcqRel) {
        if let Some(yielder) = YIELDER.get() {
            yielder.yield_now();
        }
    }
}

/// Atomically takes and clears this CPU's missed-preempt flag, returning
/// whether one was pending. Used by the Trap Dispatcher at the end of a
/// kernel-mode trap (spec.md §4.4 step 4): a trap taken while preemption
/// was disabled can't yield through [`preempt_enable`]'s own check because
/// the depth never changed across the trap, so the dispatcher consults this
/// directly once the trap handler itself has finished.
pub fn take_and_clear_missed() -> bool {
    this_cpu().missed_preempt.swap(false, Ordering::AcqRel)
}

/// Called by the preemption timer handler when a preemption was requested
/// while the disable counter was non-zero: the actual thread switch is
/// deferred to the matching [`preempt_enable`].
pub fn mark_missed() {
    this_cpu().missed_preempt.store(true, Ordering::Release);
}

/// Saves and clears the current CPU's preempt state, returning the value to
/// later [`restore`] into the thread that is about to run. Called by the
/// scheduler's context-switch algorithm around the outgoing thread.
pub fn save_and_reset() -> (usize, bool) {
    let cpu = this_cpu();
    let depth = cpu.depth.swap(0, Ordering::AcqRel);
    let missed = cpu.missed_preempt.swap(false, Ordering::AcqRel);
    (depth, missed)
}

/// The inverse of [`save_and_reset`]: installs a thread's saved preempt
/// state onto the CPU it is about to run on.
pub fn restore(depth: usize, missed_preempt: bool) {
    let cpu = this_cpu();
    cpu.depth.store(depth, Ordering::Release);
    cpu.missed_preempt.store(missed_preempt, Ordering::Release);
}

#[cfg(test)]
mod test {
    use super::*;
    use core::sync::atomic::AtomicUsize as Counter;

    struct CountingYielder(Counter);
    impl Yielder for CountingYielder {
        fn yield_now(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
    static YIELDS: CountingYielder = CountingYielder(Counter::new(0));

    #[test]
    fn disable_enable_round_trips_to_zero() {
        preempt_disable();
        assert!(is_preemption_disabled());
        preempt_enable();
        assert!(!is_preemption_disabled());
    }

    #[test]
    fn missed_preempt_triggers_yield_on_last_enable() {
        register_yielder(&YIELDS);
        let before = YIELDS.0.load(Ordering::SeqCst);
        preempt_disable();
        mark_missed();
        preempt_enable();
        assert_eq!(YIELDS.0.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn nested_disable_only_yields_on_outermost_enable() {
        register_yielder(&YIELDS);
        preempt_disable();
        preempt_disable();
        mark_missed();
        let before = YIELDS.0.load(Ordering::SeqCst);
        preempt_enable();
        assert_eq!(YIELDS.0.load(Ordering::SeqCst), before, "inner enable must not yield");
        preempt_enable();
        assert_eq!(YIELDS.0.load(Ordering::SeqCst), before + 1, "outer enable must yield");
    }
}
