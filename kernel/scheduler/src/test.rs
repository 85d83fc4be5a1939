extern crate std;

use std::sync::Mutex as StdMutex;

use super::*;
use memory_structs::{MemoryRegionType, PhysicalAddress, PhysicalMemoryArea};

/// Every test in this module shares the same global, `Once`-gated state
/// (`apic`'s registry, `task`'s dispatcher, this crate's per-CPU table and
/// kernel process) the same way `apic`'s own tests do, so they must run
/// serialized; this lock is that serialization, held for the duration of
/// the caller's guard.
static TEST_LOCK: StdMutex<()> = StdMutex::new(());

/// Fixed for the whole test binary: `apic::init` and the per-CPU table's
/// size are both one-shot, so every test shares one 4-CPU topology.
const CPU_COUNT: u32 = 4;

fn setup() -> std::sync::MutexGuard<'static, ()> {
    let guard = match TEST_LOCK.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };

    let areas = [PhysicalMemoryArea::new(
        PhysicalAddress::new_canonical(0),
        4096 * 4096,
        MemoryRegionType::Free,
    )];
    frame_allocator::init(&areas).unwrap();
    let _ = kernel_memory_arena::init();

    let descriptors: alloc::vec::Vec<_> =
        (0..CPU_COUNT).map(|id| apic::CpuDescriptor { apic_id: id, is_bootstrap: id == 0 }).collect();
    let _ = apic::init(&descriptors);
    apic::set_test_current_cpu(0);

    percpu::reset_for_test();
    timeout::reset_for_test();

    for ordinal in 0..CPU_COUNT {
        apic::set_test_current_cpu(ordinal);
        init_per_cpu();
    }
    apic::set_test_current_cpu(0);

    guard
}

extern "C" fn noop_entry(_a1: u64, _a2: u64) -> ! {
    loop {
        core::hint::spin_loop();
    }
}

fn make_thread(name: &str, priority: u8) -> Arc<Thread> {
    make_thread_with_flags(name, priority, ThreadFlags::empty())
}

fn make_thread_with_flags(name: &str, priority: u8, flags: ThreadFlags) -> Arc<Thread> {
    let t = task::thread_create(name, kernel_process(), flags, noop_entry, 0, 0).unwrap();
    t.set_priority(priority);
    t
}

#[test]
fn ready_queue_pops_highest_priority_first_and_fifo_within_it() {
    let _guard = setup();
    let a = make_thread("a", 2);
    let b = make_thread("b", 0);
    let c = make_thread("c", 2);

    let mut state = percpu::at(2).state.lock();
    state.push(a.priority(), a.clone());
    state.push(b.priority(), b.clone());
    state.push(c.priority(), c.clone());

    assert!(Arc::ptr_eq(&state.pop_highest().unwrap(), &b));
    assert!(Arc::ptr_eq(&state.pop_highest().unwrap(), &a));
    assert!(Arc::ptr_eq(&state.pop_highest().unwrap(), &c));
    assert!(state.pop_highest().is_none());
}

#[test]
fn none_at_or_better_and_any_worse_agree_with_queue_contents() {
    let _guard = setup();
    let mut state = percpu::at(2).state.lock();
    assert!(state.none_at_or_better(5));
    assert!(!state.any_worse(5));

    let worse = make_thread("worse", 7);
    state.push(worse.priority(), worse);
    assert!(state.none_at_or_better(5));
    assert!(state.any_worse(5));

    let better = make_thread("better", 1);
    state.push(better.priority(), better);
    assert!(!state.none_at_or_better(5));
}

#[test]
fn demotes_a_thread_that_used_its_whole_timeslice_when_a_worse_thread_is_waiting() {
    let _guard = setup();
    let mut state = percpu::at(2).state.lock();
    let running = make_thread("running", 3);
    running.set_timeslice_remaining_ms(0);
    let waiting = make_thread("waiting", 5);
    state.push(waiting.priority(), waiting);

    adjust_priority(&running, &state);
    assert_eq!(running.priority(), 4);
}

#[test]
fn promotes_a_thread_that_did_not_use_its_whole_timeslice() {
    let _guard = setup();
    let state = percpu::at(2).state.lock();
    let running = make_thread("running", 3);
    running.set_timeslice_remaining_ms(1);

    adjust_priority(&running, &state);
    assert_eq!(running.priority(), 2);
}

#[test]
fn never_adjusts_a_fixed_priority_process() {
    let _guard = setup();
    let state = percpu::at(2).state.lock();
    let space = memory::init(false).unwrap();
    let owner = task::Process::new(space, true);
    let running = task::thread_create("fixed", owner, ThreadFlags::empty(), noop_entry, 0, 0).unwrap();
    running.set_priority(3);
    running.set_timeslice_remaining_ms(0);

    adjust_priority(&running, &state);
    assert_eq!(running.priority(), 3);
}

#[test]
fn average_rounds_up_so_the_remainder_is_never_stranded() {
    assert_eq!(balance::average(16, 3), 6);
    assert_eq!(balance::average(15, 3), 5);
    assert_eq!(balance::average(0, 3), 0);
    assert_eq!(balance::average(5, 0), 0);
}

#[test]
fn balancer_pulls_only_down_to_the_target_average_and_skips_unmovable() {
    let _guard = setup();

    // Worse priority than the movable threads, so the worst-to-best scan
    // in `pull_from` reaches it first and must skip over it to keep going.
    let pinned = make_thread_with_flags("pinned", 20, ThreadFlags::UNMOVABLE);
    pinned.set_assigned_cpu(cpu::cpu_at(1));
    percpu::at(1).state.lock().push(pinned.priority(), pinned.clone());

    for i in 0..3 {
        let t = make_thread(&alloc::format!("movable-{i}"), 5);
        t.set_assigned_cpu(cpu::cpu_at(1));
        percpu::at(1).state.lock().push(t.priority(), t);
    }

    let moved = balance::pull_from(1, 0, 3, 0);
    assert_eq!(moved, 3);
    assert_eq!(percpu::at(0).state.lock().runnable, 3);
    assert_eq!(percpu::at(1).state.lock().runnable, 1);
    assert!(percpu::at(1)
        .state
        .lock()
        .queues
        .iter()
        .flatten()
        .any(|t| Arc::ptr_eq(t, &pinned)));
}

#[test]
fn wait_queue_wakes_fifo_and_wake_transitions_sleeping_to_ready() {
    let _guard = setup();
    let queue = WaitQueue::new();
    let a = make_thread("a", 5);
    let b = make_thread("b", 5);
    a.set_state(ThreadState::Sleeping);
    b.set_state(ThreadState::Sleeping);
    queue.enqueue(a.clone());
    queue.enqueue(b.clone());

    let woken = queue.wake_one().unwrap();
    assert!(Arc::ptr_eq(&woken, &a));
    assert_eq!(a.state(), ThreadState::Ready);
    assert_eq!(b.state(), ThreadState::Sleeping);

    queue.wake_all();
    assert_eq!(b.state(), ThreadState::Ready);
}

#[test]
fn wake_is_a_no_op_for_a_thread_that_is_not_sleeping() {
    let _guard = setup();
    let t = make_thread("running", 5);
    t.set_state(ThreadState::Ready);
    assert!(!wake(&t));
}

#[test]
fn timeout_fires_exactly_when_the_elapsed_ticks_reach_it_and_disarms_once() {
    let _guard = setup();
    let t = make_thread("sleeper", 5);
    t.set_state(ThreadState::Sleeping);
    timeout::arm(t.clone(), 10);

    timeout::on_tick(4);
    assert!(!timeout::disarm_and_check_fired(&t));
    timeout::arm(t.clone(), 6);

    timeout::on_tick(6);
    assert!(timeout::disarm_and_check_fired(&t));
    assert!(!timeout::disarm_and_check_fired(&t));
}

#[test]
fn sleep_would_block_immediately_on_a_zero_timeout() {
    let _guard = setup();
    let lock: spin::Mutex<()> = spin::Mutex::new(());
    let queue = WaitQueue::new();
    let guard = lock.lock();
    let status = sleep(guard, &queue, Some(0), "test", SleepFlags::UNINTERRUPTIBLE);
    assert_eq!(status, SleepStatus::WouldBlock);
}

#[test]
fn sleep_returns_interrupted_immediately_if_already_killed_and_interruptible() {
    let _guard = setup();
    let t = make_thread("victim", 5);
    percpu::at(0).state.lock().curr = Some(t.clone());
    task::thread_kill(&t);

    let lock: spin::Mutex<()> = spin::Mutex::new(());
    let queue = WaitQueue::new();
    let guard = lock.lock();
    let status = sleep(guard, &queue, None, "test", SleepFlags::INTERRUPTIBLE);
    assert_eq!(status, SleepStatus::Interrupted);
}
