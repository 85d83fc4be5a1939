//! Task types and structure definitions: the [`Thread`] and [`Process`]
//! records the scheduler and trap dispatcher operate on.
//!
//! Reference-counting is `Arc`'s own, rather than a hand-rolled counter
//! field: a thread is destroyed (its kernel stack and `Arc` both freed)
//! exactly when its last `Arc<Thread>` drops, which is the same "drop the
//! refcount to zero" lifecycle the data model calls for.

#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

mod id;
#[cfg(test)]
mod test;

use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use bitflags::bitflags;
use spin::Once;

use cpu::CpuId;
use kernel_config::interrupts::NSIG;
use kernel_config::irq_lock::IrqSafeMutex;
use kernel_config::memory::KERNEL_STACK_SIZE_IN_PAGES;
use kernel_config::sched::DEFAULT_PRIORITY;
use kernel_config::{KResult, KernelError};
use memory_structs::VirtualAddress;

pub use id::{ProcessId, ThreadId};

/// A sigaction-style disposition for one signal number: the handler address
/// (`0` for `SIG_DFL`, `1` for `SIG_IGN`, per the user-space syscall ABI),
/// the sigreturn trampoline's address, and whether delivery should use the
/// thread's configured alternate stack.
#[derive(Clone, Copy, Debug, Default)]
pub struct SignalDisposition {
    pub handler: usize,
    pub restorer: usize,
    pub use_altstack: bool,
}

/// A thread's run state. Transitions are driven solely by the scheduler and
/// trap dispatcher, never by this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    Created,
    Ready,
    Running,
    Sleeping,
    Dead,
}

bitflags! {
    /// Per-thread disposition flags, checked by the scheduler rather than
    /// enforced here.
    pub struct ThreadFlags: u8 {
        /// Set by [`thread_kill`]; checked by `sleep`'s interruptible path
        /// and at kernel exit to decide whether to deliver a termination.
        const KILLED = 1 << 0;
        /// Set by [`thread_interrupt`]; causes an interruptible `sleep` to
        /// return `Interrupted`.
        const INTERRUPTED = 1 << 1;
        /// Never placed on a run queue (the idle thread, the load-balancer
        /// thread).
        const UNQUEUEABLE = 1 << 2;
        /// Never migrated by the cross-CPU load balancer (bound to one CPU).
        const UNMOVABLE = 1 << 3;
        /// The preemption timer must not fire while this thread is running.
        const UNPREEMPTABLE = 1 << 4;
    }
}

/// The register/stack context saved before entering a safe user-memory-access
/// routine, restored by the trap dispatcher's page-fault handler in place of
/// returning to the faulting instruction.
#[derive(Clone, Copy, Debug)]
pub struct SafeAccessContext {
    pub resume_rip: u64,
    pub resume_rsp: u64,
    pub resume_rbp: u64,
}

/// The owning container for one or more threads: an address space plus the
/// process-wide scheduling policy bits the priority-adjustment rule
/// consults.
pub struct Process {
    id: ProcessId,
    address_space: memory::AddressSpace,
    /// If set, none of this process's threads ever have their priority
    /// adjusted by the scheduler's relinquish-CPU rule.
    fixed_priority: bool,
    /// The best (numerically lowest) priority any of this process's threads
    /// currently holds; the adjustment rule's "worse than the process-wide
    /// minimum" comparison is against this value.
    min_priority: AtomicU8,
    /// This process's registered signal dispositions, indexed by signal
    /// number. Shared by every thread in the process, matching POSIX's
    /// per-process (not per-thread) `sigaction` semantics.
    ///
    /// IRQ-safe: read by the Trap Dispatcher's signal-frame setup, which
    /// runs as part of the kernel-exit path of an interrupt/exception
    /// taken from user mode, as well as written by ordinary task-context
    /// syscall handling (out of this core's scope, but a caller this core
    /// must stay safe against).
    signal_handlers: IrqSafeMutex<[SignalDisposition; NSIG]>,
}

impl Process {
    pub fn new(address_space: memory::AddressSpace, fixed_priority: bool) -> Arc<Process> {
        Arc::new(Process {
            id: id::next_process_id(),
            address_space,
            fixed_priority,
            min_priority: AtomicU8::new(DEFAULT_PRIORITY),
            signal_handlers: IrqSafeMutex::new([SignalDisposition::default(); NSIG]),
        })
    }

    /// Installs `disposition` for `signal`, returning the previous one. Out
    /// of range signal numbers return the default disposition unchanged.
    pub fn set_signal_handler(&self, signal: u8, disposition: SignalDisposition) -> SignalDisposition {
        let idx = signal as usize;
        if idx >= NSIG {
            return SignalDisposition::default();
        }
        let mut handlers = self.signal_handlers.lock();
        core::mem::replace(&mut handlers[idx], disposition)
    }

    pub fn signal_handler(&self, signal: u8) -> SignalDisposition {
        let idx = signal as usize;
        if idx >= NSIG {
            return SignalDisposition::default();
        }
        self.signal_handlers.lock()[idx]
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn address_space(&self) -> &memory::AddressSpace {
        &self.address_space
    }

    pub fn has_fixed_priority(&self) -> bool {
        self.fixed_priority
    }

    pub fn min_priority(&self) -> u8 {
        self.min_priority.load(Ordering::Relaxed)
    }

    /// Called whenever one of this process's threads adopts a new priority
    /// that might improve on the recorded minimum.
    pub fn note_priority(&self, priority: u8) {
        self.min_priority.fetch_min(priority, Ordering::Relaxed);
    }
}

struct Inner {
    state: ThreadState,
    assigned_cpu: Option<CpuId>,
    priority: u8,
    max_priority: u8,
    timeslice_remaining_ms: u64,
    signal_mask: u64,
    pending_signals: u64,
    /// The preempt-disable depth and missed-preempt flag this thread held
    /// the last time it was switched out; copied to/from the CPU-local
    /// cells in `preemption` by the scheduler's context-switch algorithm
    /// (see DESIGN.md).
    preempt_depth: usize,
    missed_preempt: bool,
    /// Address of the current user-mode trap frame on this thread's kernel
    /// stack, set by the trap dispatcher's kernel-entry hook. `0` means
    /// none (the thread is not currently in the kernel on behalf of a user
    /// trap).
    user_trap_frame: usize,
    /// Set while this thread's signal frame has been written onto the user
    /// stack but not yet consumed by `sigreturn`, so the kernel-exit path
    /// takes the full frame-restoring return instead of the fast path.
    frame_modified: bool,
    safe_access: Option<SafeAccessContext>,
    /// Number of user-mode `#NM` traps this thread has taken since the last
    /// time it was marked frequent. Reset is unnecessary once `frequent_fpu`
    /// latches, since the lazy trap stops firing for it at all.
    fpu_uses: u32,
    /// Set once `fpu_uses` crosses `kernel_config::interrupts::FPU_FREQUENT_THRESHOLD`;
    /// the FPU device-not-available handler leaves CR0.TS clear for this
    /// thread from then on instead of re-arming the lazy trap.
    frequent_fpu: bool,
    /// Whether this thread's FPU save area has been lazily allocated yet
    /// (set on its first `#NM` trap).
    fpu_allocated: bool,
    /// The alternate signal stack registered via `sigaltstack`, if any.
    altstack: Option<(VirtualAddress, usize)>,
}

/// One schedulable thread of execution.
pub struct Thread {
    id: ThreadId,
    name: String,
    owner: Arc<Process>,
    flags: AtomicU8,
    kernel_stack_base: VirtualAddress,
    kernel_stack_size: usize,
    /// The kernel stack pointer saved at the last context switch away from
    /// this thread; read and written only by the scheduler's low-level
    /// switch routine, which is why this needs to be a plain atomic cell
    /// reachable by raw pointer rather than behind `inner`'s mutex.
    saved_sp: AtomicU64,
    /// IRQ-safe: the Trap Dispatcher's kernel-entry/exit hooks and signal
    /// delivery read and write thread state from inside a trap/interrupt
    /// handler, while the scheduler mutates the same fields from ordinary
    /// task context (`yield_now`, priority adjustment, `sleep`).
    inner: IrqSafeMutex<Inner>,
}

/// The entry point a newly created thread starts running at, in the
/// standard two-argument trampoline calling convention.
pub type ThreadEntry = extern "C" fn(u64, u64) -> !;

impl Thread {
    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> &Arc<Process> {
        &self.owner
    }

    pub fn flags(&self) -> ThreadFlags {
        ThreadFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn is_killed(&self) -> bool {
        self.flags().contains(ThreadFlags::KILLED)
    }

    pub fn is_interrupted(&self) -> bool {
        self.flags().contains(ThreadFlags::INTERRUPTED)
    }

    pub fn clear_interrupted(&self) {
        self.flags.fetch_and(!ThreadFlags::INTERRUPTED.bits(), Ordering::AcqRel);
    }

    pub fn state(&self) -> ThreadState {
        self.inner.lock().state
    }

    pub fn set_state(&self, state: ThreadState) {
        self.inner.lock().state = state;
    }

    pub fn assigned_cpu(&self) -> Option<CpuId> {
        self.inner.lock().assigned_cpu
    }

    pub fn set_assigned_cpu(&self, cpu: Option<CpuId>) {
        self.inner.lock().assigned_cpu = cpu;
    }

    pub fn priority(&self) -> u8 {
        self.inner.lock().priority
    }

    pub fn set_priority(&self, priority: u8) {
        let mut inner = self.inner.lock();
        inner.priority = priority;
        drop(inner);
        self.owner.note_priority(priority);
    }

    pub fn max_priority(&self) -> u8 {
        self.inner.lock().max_priority
    }

    pub fn timeslice_remaining_ms(&self) -> u64 {
        self.inner.lock().timeslice_remaining_ms
    }

    pub fn set_timeslice_remaining_ms(&self, ms: u64) {
        self.inner.lock().timeslice_remaining_ms = ms;
    }

    pub fn signal_mask(&self) -> u64 {
        self.inner.lock().signal_mask
    }

    pub fn set_signal_mask(&self, mask: u64) {
        self.inner.lock().signal_mask = mask;
    }

    pub fn pending_signals(&self) -> u64 {
        self.inner.lock().pending_signals
    }

    /// Marks `signal` (a bit position) pending for later delivery at kernel
    /// exit.
    pub fn raise_signal(&self, signal: u8) {
        self.inner.lock().pending_signals |= 1 << signal;
    }

    pub fn clear_signal(&self, signal: u8) {
        self.inner.lock().pending_signals &= !(1 << signal);
    }

    /// Saves this thread's preempt-disable state, for the scheduler's
    /// context-switch to call around the outgoing thread alongside
    /// `preemption::save_and_reset`.
    pub fn save_preempt_state(&self, depth: usize, missed: bool) {
        let mut inner = self.inner.lock();
        inner.preempt_depth = depth;
        inner.missed_preempt = missed;
    }

    /// The counterpart the scheduler reads back when this thread is about
    /// to be dispatched, to feed `preemption::restore`.
    pub fn take_preempt_state(&self) -> (usize, bool) {
        let inner = self.inner.lock();
        (inner.preempt_depth, inner.missed_preempt)
    }

    pub fn user_trap_frame(&self) -> Option<usize> {
        let addr = self.inner.lock().user_trap_frame;
        if addr == 0 {
            None
        } else {
            Some(addr)
        }
    }

    pub fn set_user_trap_frame(&self, addr: Option<usize>) {
        self.inner.lock().user_trap_frame = addr.unwrap_or(0);
    }

    pub fn frame_modified(&self) -> bool {
        self.inner.lock().frame_modified
    }

    pub fn set_frame_modified(&self, modified: bool) {
        self.inner.lock().frame_modified = modified;
    }

    pub fn safe_access_context(&self) -> Option<SafeAccessContext> {
        self.inner.lock().safe_access
    }

    pub fn set_safe_access_context(&self, ctx: Option<SafeAccessContext>) {
        self.inner.lock().safe_access = ctx;
    }

    pub fn is_frequent_fpu(&self) -> bool {
        self.inner.lock().frequent_fpu
    }

    /// Records one lazy-FPU trap for this thread, returning whether it has
    /// just crossed (or previously crossed) the frequent-use threshold.
    pub fn note_fpu_use(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.frequent_fpu {
            return true;
        }
        inner.fpu_uses += 1;
        if inner.fpu_uses >= kernel_config::interrupts::FPU_FREQUENT_THRESHOLD {
            inner.frequent_fpu = true;
        }
        inner.frequent_fpu
    }

    pub fn fpu_allocated(&self) -> bool {
        self.inner.lock().fpu_allocated
    }

    pub fn set_fpu_allocated(&self, allocated: bool) {
        self.inner.lock().fpu_allocated = allocated;
    }

    pub fn altstack(&self) -> Option<(VirtualAddress, usize)> {
        self.inner.lock().altstack
    }

    pub fn set_altstack(&self, altstack: Option<(VirtualAddress, usize)>) {
        self.inner.lock().altstack = altstack;
    }

    pub fn kernel_stack_base(&self) -> VirtualAddress {
        self.kernel_stack_base
    }

    pub fn kernel_stack_size(&self) -> usize {
        self.kernel_stack_size
    }

    pub fn saved_sp(&self) -> u64 {
        self.saved_sp.load(Ordering::Acquire)
    }

    pub fn set_saved_sp(&self, sp: u64) {
        self.saved_sp.store(sp, Ordering::Release);
    }

    /// Raw pointer to the saved-stack-pointer cell, for the scheduler's
    /// low-level switch routine to write through directly rather than go
    /// through the atomic API (the write only ever happens while this
    /// thread is the exclusive owner of its own kernel stack).
    pub fn saved_sp_ptr(&self) -> *mut u64 {
        self.saved_sp.as_ptr()
    }
}

/// Implemented by the scheduler crate so that this crate's primitives can
/// drive run-queue insertion and yielding without depending on it directly,
/// the same dynamic-dispatch-by-trait-object shape `apic::InterruptRaiser`
/// and `preemption::Yielder` use to break the same kind of cycle.
pub trait Dispatcher: Sync {
    /// Inserts a newly-Ready thread onto its assigned CPU's run queue.
    fn enqueue_ready(&self, thread: Arc<Thread>);
    /// Transitions a Sleeping thread back to Ready and re-inserts it.
    /// Returns `false` if the thread was not actually Sleeping.
    fn wake(&self, thread: &Arc<Thread>) -> bool;
    /// Yields the calling thread immediately and never returns to this
    /// call site (the thread has been marked Dead beforehand).
    fn exit_current(&self) -> !;
}

static DISPATCHER: Once<&'static dyn Dispatcher> = Once::new();

/// Registers the one system-wide dispatcher. Must happen once, during
/// scheduler init, before any `thread_run`/`thread_kill`/`thread_exit` call.
pub fn register_dispatcher(dispatcher: &'static dyn Dispatcher) {
    DISPATCHER.call_once(|| dispatcher);
}

fn dispatcher() -> &'static dyn Dispatcher {
    match DISPATCHER.get() {
        Some(d) => *d,
        None => kernel_config::fatal!("task::register_dispatcher was never called"),
    }
}

/// Builds the initial kernel-stack contents a brand new thread needs so
/// that the scheduler's low-level switch routine can `ret` straight into
/// [`trampoline`], which then calls `entry(a1, a2)`.
///
/// # Safety
/// `stack_top` must be the highest valid address of a freshly allocated,
/// otherwise-unused kernel stack at least `TRAMPOLINE_FRAME_BYTES` bytes
/// in size.
#[cfg(not(test))]
unsafe fn prepare_initial_stack(stack_top: VirtualAddress, entry: ThreadEntry, a1: u64, a2: u64) -> u64 {
    let mut sp = stack_top.value() as *mut u64;

    // Pushed in reverse order so a forward read (low to high address) sees
    // [.. callee-saved regs ..][return_address][a1][a2][entry], matching
    // what `trampoline` expects to find just above its own return address.
    let mut push = |value: u64| {
        sp = sp.sub(1);
        core::ptr::write(sp, value);
    };

    push(entry as usize as u64);
    push(a2);
    push(a1);
    push(trampoline as usize as u64); // the fabricated "return address"

    // The callee-saved register block `scheduler`'s switch routine expects
    // to pop, in pop order: r15..r8, rdi, rsi, rbp, (8 padding bytes), rbx,
    // rdx, rcx, rax, rflags. Zero-initialized; a brand new thread has no
    // meaningful prior register state.
    for _ in 0..17 {
        push(0);
    }

    sp as u64
}

#[cfg(test)]
unsafe fn prepare_initial_stack(stack_top: VirtualAddress, _entry: ThreadEntry, _a1: u64, _a2: u64) -> u64 {
    stack_top.value() as u64
}

/// The trampoline every new thread's fabricated stack frame `ret`s into:
/// pops its two arguments and entry point off the stack and calls it, then
/// hands off to `thread_exit` if the entry point ever returns.
#[cfg(not(test))]
#[naked]
unsafe extern "C" fn trampoline() -> ! {
    core::arch::asm!(
        "pop rdi",
        "pop rsi",
        "pop rax",
        "call rax",
        "call {exit}",
        exit = sym thread_exit,
        options(noreturn)
    )
}

/// Allocates a kernel stack and arch context to enter [`trampoline`], which
/// calls `entry(a1, a2)`. The thread starts in [`ThreadState::Created`];
/// callers must hand it to the scheduler's `thread_run` to make it Ready.
pub fn thread_create(
    name: &str,
    owner: Arc<Process>,
    flags: ThreadFlags,
    entry: ThreadEntry,
    a1: u64,
    a2: u64,
) -> KResult<Arc<Thread>> {
    let stack_size = KERNEL_STACK_SIZE_IN_PAGES * kernel_config::memory::PAGE_SIZE;
    let stack_base = kernel_memory_arena::alloc(stack_size, frame_allocator::AllocFlags::empty())?;
    let stack_top = stack_base + stack_size;

    // SAFETY: `stack_base..stack_top` was just allocated fresh above and is
    // not reachable from anywhere else yet.
    let saved_sp = unsafe { prepare_initial_stack(stack_top, entry, a1, a2) };

    let priority = DEFAULT_PRIORITY;
    owner.note_priority(priority);

    Ok(Arc::new(Thread {
        id: id::next_thread_id(),
        name: String::from(name),
        owner,
        flags: AtomicU8::new(flags.bits()),
        kernel_stack_base: stack_base,
        kernel_stack_size: stack_size,
        saved_sp: AtomicU64::new(saved_sp),
        inner: IrqSafeMutex::new(Inner {
            state: ThreadState::Created,
            assigned_cpu: None,
            priority,
            max_priority: priority,
            timeslice_remaining_ms: 0,
            signal_mask: 0,
            pending_signals: 0,
            preempt_depth: 0,
            missed_preempt: false,
            user_trap_frame: 0,
            frame_modified: false,
            safe_access: None,
            fpu_uses: 0,
            frequent_fpu: false,
            fpu_allocated: false,
            altstack: None,
        }),
    }))
}

/// Frees a thread's kernel stack. Called once by the scheduler's post-switch
/// reaping step after a Dead thread's last `Arc` reference is about to be
/// dropped; never called while the thread might still be referenced.
pub fn thread_destroy_stack(thread: &Thread) {
    let _ = kernel_memory_arena::free(thread.kernel_stack_base, thread.kernel_stack_size);
}

/// Makes a Created or previously-descheduled thread Ready and enqueues it.
pub fn thread_run(thread: Arc<Thread>) {
    thread.set_state(ThreadState::Ready);
    dispatcher().enqueue_ready(thread);
}

/// Sets the `KILLED` flag. A Sleeping, interruptible thread is woken
/// immediately so its `sleep` call observes the flag and returns
/// `Interrupted`; otherwise delivery is deferred to the thread's next
/// kernel exit.
pub fn thread_kill(thread: &Arc<Thread>) {
    thread.flags.fetch_or(ThreadFlags::KILLED.bits(), Ordering::AcqRel);
    if thread.state() == ThreadState::Sleeping {
        dispatcher().wake(thread);
    }
}

/// Sets the `INTERRUPTED` flag on a sleeping thread and wakes it, causing
/// its `sleep` call to return `Interrupted`.
pub fn thread_interrupt(thread: &Arc<Thread>) -> KResult<()> {
    if thread.state() != ThreadState::Sleeping {
        return Err(KernelError::InvalidArgument);
    }
    thread.flags.fetch_or(ThreadFlags::INTERRUPTED.bits(), Ordering::AcqRel);
    dispatcher().wake(thread);
    Ok(())
}

/// Marks the calling thread Dead and yields; the scheduler's post-switch
/// path reaps it (frees its kernel stack) once it is no longer the current
/// thread on any CPU. Never returns.
pub fn thread_exit() -> ! {
    dispatcher().exit_current()
}

/// Called by the trap dispatcher on every user-mode kernel entry: records
/// where the interrupted user-mode trap frame lives so a nested fault or a
/// signal delivery can find it.
pub fn thread_at_kernel_entry(thread: &Thread, trap_frame_addr: usize) {
    thread.set_user_trap_frame(Some(trap_frame_addr));
}

/// Called by the trap dispatcher just before returning to user mode:
/// delivers any signal the kernel-exit path decided to act on, then clears
/// the recorded trap-frame pointer.
pub fn thread_at_kernel_exit(thread: &Thread) {
    thread.set_user_trap_frame(None);
}
