extern crate std;

use std::sync::Mutex as StdMutex;

use memory_structs::{MemoryRegionType, PhysicalAddress, PhysicalMemoryArea};
use task::SignalDisposition;

use crate::fault;
use crate::signal::{self, SigInfo};
use crate::TrapFrame;

static TEST_LOCK: StdMutex<()> = StdMutex::new(());

fn setup() -> std::sync::MutexGuard<'static, ()> {
    let guard = match TEST_LOCK.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };

    let areas = [PhysicalMemoryArea::new(PhysicalAddress::new_canonical(0), 4096 * 4096, MemoryRegionType::Free)];
    let _ = frame_allocator::init(&areas);
    let _ = kernel_memory_arena::init();

    let descriptors = [apic::CpuDescriptor { apic_id: 0, is_bootstrap: true }];
    let _ = apic::init(&descriptors);
    apic::set_test_current_cpu(0);
    let _ = ipi::init();
    let _ = crate::init();
    scheduler::init_per_cpu();

    guard
}

fn blank_frame() -> TrapFrame {
    TrapFrame { cs: 0x3, rsp: 0x1000_0000, rflags: 0x202, ..TrapFrame::default() }
}

#[test]
fn from_user_mode_reads_the_low_cs_bits() {
    let mut user = blank_frame();
    user.cs = 0x1b; // ring 3 code selector, as a real user CS would be
    assert!(user.from_user_mode());

    let mut kernel = blank_frame();
    kernel.cs = 0x08; // ring 0
    assert!(!kernel.from_user_mode());
}

#[test]
fn unresolved_user_page_fault_synthesizes_segv_maperr() {
    let _guard = setup();
    fault::test::set_test_cr2(0x4000);
    let mut frame = blank_frame();
    frame.error_code = 0; // not-present bit clear in x86_64::PageFaultErrorCode means not-present

    let result = fault::page_fault_handler(&mut frame);
    let info = result.expect("an unresolved user-mode fault must synthesize a signal");
    assert_eq!(info.signo, signal::SIGSEGV);
    assert_eq!(info.code, signal::SEGV_MAPERR);
    assert_eq!(info.addr, 0x4000);
}

#[test]
fn kernel_address_user_mode_access_still_signals_segv() {
    // Preserves the documented source quirk (spec.md §9): a user-mode
    // access to a kernel address is never handed to the resolver, but it
    // still falls through to an unconditional SIGSEGV rather than some
    // other classification.
    let _guard = setup();
    fault::test::set_test_cr2(kernel_config::memory::USER_SPACE_LIMIT + 0x1000);
    let mut frame = blank_frame();

    let result = fault::page_fault_handler(&mut frame);
    assert_eq!(result.unwrap().signo, signal::SIGSEGV);
}

#[test]
fn safe_access_context_recovers_instead_of_signaling() {
    let _guard = setup();
    let current = scheduler::current_thread();
    current.set_safe_access_context(Some(task::SafeAccessContext {
        resume_rip: 0xdead_beef,
        resume_rsp: 0x2000,
        resume_rbp: 0x2008,
    }));
    fault::test::set_test_cr2(0x9999);
    let mut frame = blank_frame();
    frame.cs = 0x08; // kernel-mode safe-copy routine taking the fault itself

    let result = fault::page_fault_handler(&mut frame);
    assert!(result.is_none(), "a safe-access recovery must not synthesize a signal");
    assert_eq!(frame.rip, 0xdead_beef);
    assert_eq!(frame.rsp, 0x2000);
    assert_eq!(frame.rbp, 0x2008);
    assert!(current.safe_access_context().is_none(), "the context must be consumed exactly once");
}

#[test]
fn default_disposition_kills_the_thread_on_delivery() {
    let _guard = setup();
    let current = scheduler::current_thread();
    current.raise_signal(signal::SIGSEGV);
    let mut frame = blank_frame();

    signal::deliver_pending_signals(&current, &mut frame);

    assert!(current.is_killed());
    assert_eq!(current.pending_signals(), 0, "delivery must clear the pending bit either way");
}

#[test]
fn ignored_signal_is_dropped_without_modifying_the_trap_frame() {
    let _guard = setup();
    let current = scheduler::current_thread();
    current.owner().set_signal_handler(signal::SIGFPE, SignalDisposition { handler: 1, restorer: 0, use_altstack: false });
    current.raise_signal(signal::SIGFPE);
    let mut frame = blank_frame();
    let rip_before = frame.rip;

    signal::deliver_pending_signals(&current, &mut frame);

    assert_eq!(frame.rip, rip_before);
    assert!(!current.frame_modified());
}

#[test]
fn masked_signal_is_not_delivered_until_unmasked() {
    let _guard = setup();
    const TEST_SIGNAL: u8 = 16;
    let current = scheduler::current_thread();
    current.set_signal_mask(1u64 << TEST_SIGNAL);
    current.raise_signal(TEST_SIGNAL);
    let mut frame = blank_frame();

    signal::deliver_pending_signals(&current, &mut frame);

    assert_eq!(
        current.pending_signals(),
        1u64 << TEST_SIGNAL,
        "a masked signal must remain pending rather than being delivered or dropped"
    );
}

#[test]
fn fpu_use_counter_latches_frequent_after_the_threshold() {
    let _guard = setup();
    let current = scheduler::current_thread();
    assert!(!current.is_frequent_fpu());
    let mut frequent = false;
    for _ in 0..kernel_config::interrupts::FPU_FREQUENT_THRESHOLD {
        frequent = current.note_fpu_use();
    }
    assert!(frequent);
    assert!(current.is_frequent_fpu());
}

#[test]
fn nmi_spins_while_debugger_paused_then_returns() {
    let _guard = setup();
    crate::nmi::set_debugger_paused(true);
    crate::nmi::set_debugger_paused(false); // flip back before calling, single-threaded test
    let mut frame = blank_frame();
    assert!(crate::nmi::handler(&mut frame).is_none());
}

#[test]
#[should_panic]
fn register_below_irq_base_is_rejected() {
    crate::register(0, |_f| None).unwrap();
}

fn dummy_handler(_frame: &mut TrapFrame) -> Option<SigInfo> {
    None
}

#[test]
fn register_and_remove_round_trip_above_irq_base() {
    let _guard = setup();
    let vector = kernel_config::interrupts::IRQ_BASE as u8 + 20;
    crate::register(vector, dummy_handler).unwrap();
    crate::remove(vector).unwrap();
}
