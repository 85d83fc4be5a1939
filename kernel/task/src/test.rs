extern crate std;

use std::sync::Mutex as StdMutex;
use std::vec::Vec;

use super::*;
use memory_structs::{MemoryRegionType, PhysicalAddress, PhysicalMemoryArea};

static TEST_LOCK: StdMutex<()> = StdMutex::new(());

fn setup() -> std::sync::MutexGuard<'static, ()> {
    let guard = TEST_LOCK.lock().unwrap();
    let areas = [PhysicalMemoryArea::new(
        PhysicalAddress::new_canonical(0),
        4096 * 4096,
        MemoryRegionType::Free,
    )];
    frame_allocator::init(&areas).unwrap();
    let _ = kernel_memory_arena::init();
    guard
}

extern "C" fn noop_entry(_a1: u64, _a2: u64) -> ! {
    loop {
        core::hint::spin_loop();
    }
}

struct RecordingDispatcher {
    woken: StdMutex<Vec<ThreadId>>,
}

impl Dispatcher for RecordingDispatcher {
    fn enqueue_ready(&self, _thread: Arc<Thread>) {}

    fn wake(&self, thread: &Arc<Thread>) -> bool {
        self.woken.lock().unwrap().push(thread.id());
        thread.set_state(ThreadState::Ready);
        true
    }

    fn exit_current(&self) -> ! {
        loop {
            core::hint::spin_loop();
        }
    }
}

static DISPATCHER_INSTANCE: RecordingDispatcher = RecordingDispatcher { woken: StdMutex::new(Vec::new()) };

fn test_process() -> Arc<Process> {
    let space = memory::init(false).unwrap();
    Process::new(space, false)
}

#[test]
fn thread_create_starts_in_created_state_with_default_priority() {
    let _guard = setup();
    let owner = test_process();
    let t = thread_create("t1", owner, ThreadFlags::empty(), noop_entry, 0, 0).unwrap();
    assert_eq!(t.state(), ThreadState::Created);
    assert_eq!(t.priority(), kernel_config::sched::DEFAULT_PRIORITY);
}

#[test]
fn thread_run_makes_it_ready() {
    let _guard = setup();
    let owner = test_process();
    let t = thread_create("t2", owner, ThreadFlags::empty(), noop_entry, 0, 0).unwrap();
    register_dispatcher(&DISPATCHER_INSTANCE);
    thread_run(t.clone());
    assert_eq!(t.state(), ThreadState::Ready);
}

#[test]
fn kill_of_sleeping_thread_wakes_it_and_sets_the_flag() {
    let _guard = setup();
    let owner = test_process();
    let t = thread_create("t3", owner, ThreadFlags::empty(), noop_entry, 0, 0).unwrap();
    register_dispatcher(&DISPATCHER_INSTANCE);
    t.set_state(ThreadState::Sleeping);
    thread_kill(&t);
    assert!(t.is_killed());
    assert_eq!(t.state(), ThreadState::Ready);
}

#[test]
fn interrupt_of_non_sleeping_thread_is_rejected() {
    let _guard = setup();
    let owner = test_process();
    let t = thread_create("t4", owner, ThreadFlags::empty(), noop_entry, 0, 0).unwrap();
    register_dispatcher(&DISPATCHER_INSTANCE);
    t.set_state(ThreadState::Ready);
    assert!(thread_interrupt(&t).is_err());
}

#[test]
fn preempt_state_round_trips_through_save_and_take() {
    let _guard = setup();
    let owner = test_process();
    let t = thread_create("t5", owner, ThreadFlags::empty(), noop_entry, 0, 0).unwrap();
    t.save_preempt_state(3, true);
    assert_eq!(t.take_preempt_state(), (3, true));
}

#[test]
fn process_tracks_the_minimum_priority_seen() {
    let _guard = setup();
    let owner = test_process();
    let t = thread_create("t6", owner.clone(), ThreadFlags::empty(), noop_entry, 0, 0).unwrap();
    t.set_priority(2);
    assert_eq!(owner.min_priority(), 2);
}
