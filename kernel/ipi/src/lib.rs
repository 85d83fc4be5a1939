//! The Inter-Processor Communication (IPI) Core (spec.md §4.6): a bounded,
//! recyclable pool of message records used to request synchronous or
//! asynchronous execution of a handler on another CPU, delivered by an
//! actual inter-processor interrupt and drained by [`process_pending`].
//!
//! Grounded on `apic`'s ICR encoding for the actual interrupt raise, and on
//! the same free-list-behind-a-spinlock discipline `frame_allocator` uses
//! for its chunk index.

#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};

use apic::LapicIpiDestination;
use kernel_config::sched::{IPI_MESSAGES_PER_CPU, MAX_CPUS};
use kernel_config::{KResult, KernelError};
use spin::{Mutex, Once};

/// The vector this core reserves for inter-processor interrupts. Owned by
/// the Trap Dispatcher's registration of a handler that calls
/// [`process_pending`] on receipt.
pub const IPI_VECTOR: u8 = 0xFD;

/// A handler registered by a caller of [`send`]/[`broadcast`]: runs on the
/// destination CPU with the four caller-supplied arguments, returning a
/// status code that becomes the message's result unless the handler calls
/// [`acknowledge`] itself first.
pub type IpiHandler = fn(u64, u64, u64, u64) -> i64;

struct MessageInner {
    handler: Option<IpiHandler>,
    args: [u64; 4],
    acked: bool,
    status: i64,
}

struct Message {
    inner: Mutex<MessageInner>,
    /// `0` means the record is idle, on the free pool, and on no CPU's
    /// queue (spec.md §8's IPI record invariant). A synchronous send holds
    /// one count for the sender and one for the receiver; the receiver's
    /// count is released by [`process_pending`], the sender's by
    /// whichever of `send`/`broadcast` enqueued it.
    refcount: AtomicUsize,
}

impl Message {
    const fn new() -> Message {
        Message {
            inner: Mutex::new(MessageInner { handler: None, args: [0; 4], acked: false, status: 0 }),
            refcount: AtomicUsize::new(0),
        }
    }
}

struct Pool {
    messages: Vec<Message>,
    free: Mutex<Vec<usize>>,
}

static POOL: Once<Pool> = Once::new();

struct PerCpuQueue {
    queue: Mutex<VecDeque<usize>>,
    ipi_sent: AtomicBool,
}

const QUEUE_INIT: PerCpuQueue = PerCpuQueue { queue: Mutex::new(VecDeque::new()), ipi_sent: AtomicBool::new(false) };
static QUEUES: [PerCpuQueue; MAX_CPUS] = [QUEUE_INIT; MAX_CPUS];

/// The index into [`POOL`] currently being run by this CPU's call into a
/// handler from [`process_pending`], consulted by [`acknowledge`] when a
/// handler wants to set its own status before returning. `-1` means none.
const NO_MESSAGE: AtomicIsize = AtomicIsize::new(-1);
static CURRENT_PROCESSING: [AtomicIsize; MAX_CPUS] = [NO_MESSAGE; MAX_CPUS];

fn this_ordinal() -> usize {
    cpu::current_cpu().ordinal().unwrap_or(0).min(MAX_CPUS - 1)
}

/// Allocates the fixed pool of `IPI_MESSAGES_PER_CPU * cpu_count` records.
/// Must run after `cpu`/`apic` registration so `cpu_count` is final.
pub fn init() -> KResult<()> {
    let count = (cpu::cpu_count() as usize).max(1) * IPI_MESSAGES_PER_CPU;
    let messages: Vec<Message> = (0..count).map(|_| Message::new()).collect();
    let free = (0..count).collect();
    POOL.call_once(|| Pool { messages, free: Mutex::new(free) });
    Ok(())
}

fn pool() -> &'static Pool {
    POOL.get().unwrap_or_else(|| kernel_config::fatal!("ipi::init was never called"))
}

#[cfg(not(test))]
fn with_interrupts_disabled<R>(f: impl FnOnce() -> R) -> R {
    x86_64::instructions::interrupts::without_interrupts(f)
}
#[cfg(test)]
fn with_interrupts_disabled<R>(f: impl FnOnce() -> R) -> R {
    f()
}

/// Pulls a message off the free pool, busy-waiting-with-pending-processing
/// if the pool is momentarily exhausted (step 3 of spec.md §4.6's Send
/// algorithm).
fn take_message() -> usize {
    loop {
        if let Some(idx) = pool().free.lock().pop() {
            return idx;
        }
        process_pending();
    }
}

fn return_message(idx: usize) {
    let mut inner = pool().messages[idx].inner.lock();
    inner.handler = None;
    inner.args = [0; 4];
    inner.acked = false;
    inner.status = 0;
    drop(inner);
    pool().free.lock().push(idx);
}

fn release_ref(idx: usize) {
    if pool().messages[idx].refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
        return_message(idx);
    }
}

/// Sends `handler(a1,a2,a3,a4)` to run on `dest`. `sync` blocks until the
/// handler has run and returns its status; otherwise this returns
/// `Success` as soon as the message is enqueued.
///
/// Sending to the caller's own CPU is handled without raising an actual
/// interrupt, per spec.md §8's boundary behaviour.
pub fn send(dest: cpu::CpuId, handler: IpiHandler, a1: u64, a2: u64, a3: u64, a4: u64, sync: bool) -> KResult<i64> {
    let dest_ordinal = dest.ordinal().ok_or(KernelError::NotFound)?;
    if dest == cpu::current_cpu() {
        // Boundary behaviour (spec.md §8): runs locally, no IPI raised.
        let status = handler(a1, a2, a3, a4);
        return Ok(status);
    }

    with_interrupts_disabled(|| {
        let idx = take_message();
        {
            let mut inner = pool().messages[idx].inner.lock();
            inner.handler = Some(handler);
            inner.args = [a1, a2, a3, a4];
            inner.acked = false;
            inner.status = 0;
        }
        pool().messages[idx].refcount.store(2, Ordering::Release);

        enqueue_and_maybe_raise(dest_ordinal, idx);

        if sync {
            loop {
                if pool().messages[idx].inner.lock().acked {
                    break;
                }
                process_pending();
            }
            let status = pool().messages[idx].inner.lock().status;
            release_ref(idx);
            Ok(status)
        } else {
            release_ref(idx);
            Ok(0)
        }
    })
}

fn enqueue_and_maybe_raise(dest_ordinal: usize, idx: usize) {
    let q = &QUEUES[dest_ordinal];
    q.queue.lock().push_back(idx);
    if !q.ipi_sent.swap(true, Ordering::AcqRel) {
        if let Some(apic_id) = cpu::cpu_at(dest_ordinal) {
            apic::send_ipi(IPI_VECTOR, LapicIpiDestination::One(apic_id.into()));
        }
    }
}

/// Sends to every running CPU except the caller. `sync` drains acks from
/// every sent message, running local pending work while it waits (the
/// reentrancy contract: two CPUs broadcasting to each other cannot
/// deadlock, since each keeps servicing its own queue).
pub fn broadcast(handler: IpiHandler, a1: u64, a2: u64, a3: u64, a4: u64, sync: bool) -> KResult<()> {
    let self_ordinal = this_ordinal();
    let count = cpu::cpu_count() as usize;

    with_interrupts_disabled(|| {
        let mut sent = Vec::new();
        for ordinal in 0..count {
            if ordinal == self_ordinal {
                continue;
            }
            let idx = take_message();
            {
                let mut inner = pool().messages[idx].inner.lock();
                inner.handler = Some(handler);
                inner.args = [a1, a2, a3, a4];
                inner.acked = false;
                inner.status = 0;
            }
            pool().messages[idx].refcount.store(2, Ordering::Release);
            enqueue_and_maybe_raise(ordinal, idx);
            sent.push(idx);
        }

        if sync {
            for &idx in &sent {
                loop {
                    if pool().messages[idx].inner.lock().acked {
                        break;
                    }
                    process_pending();
                }
            }
        }
        for idx in sent {
            release_ref(idx);
        }
        Ok(())
    })
}

/// Explicitly sets a message's status and acknowledges it, for a handler
/// that wants to report a result other than its return value. Only valid
/// while called from inside that message's handler invocation.
pub fn acknowledge(status: i64) {
    let idx = CURRENT_PROCESSING[this_ordinal()].load(Ordering::Acquire);
    if idx < 0 {
        return;
    }
    let mut inner = pool().messages[idx as usize].inner.lock();
    inner.status = status;
    inner.acked = true;
}

/// Drains and runs every message queued for the calling CPU. Runs with
/// interrupts disabled; safe to call re-entrantly from a `send`/`broadcast`
/// busy-wait loop.
pub fn process_pending() {
    let ordinal = this_ordinal();
    let q = &QUEUES[ordinal];
    loop {
        let idx = match q.queue.lock().pop_front() {
            Some(idx) => idx,
            None => break,
        };

        let (handler, args) = {
            let inner = pool().messages[idx].inner.lock();
            (inner.handler, inner.args)
        };

        CURRENT_PROCESSING[ordinal].store(idx as isize, Ordering::Release);
        let result = handler.map(|h| h(args[0], args[1], args[2], args[3]));
        CURRENT_PROCESSING[ordinal].store(-1, Ordering::Release);

        {
            let mut inner = pool().messages[idx].inner.lock();
            if !inner.acked {
                inner.status = result.unwrap_or(0);
                inner.acked = true;
            }
        }
        release_ref(idx);
    }
    q.ipi_sent.store(false, Ordering::Release);
}

#[cfg(test)]
mod test {
    use super::*;
    use core::sync::atomic::{AtomicI64, Ordering as O};

    static SEEN: AtomicI64 = AtomicI64::new(0);

    fn recording_handler(a1: u64, _a2: u64, _a3: u64, _a4: u64) -> i64 {
        SEEN.store(a1 as i64, O::SeqCst);
        7
    }

    fn setup_single_cpu() {
        let descriptors = [apic::CpuDescriptor { apic_id: 0, is_bootstrap: true }];
        let _ = apic::init(&descriptors);
        apic::set_test_current_cpu(0);
        let _ = init();
    }

    #[test]
    fn send_to_self_runs_locally_without_a_queue() {
        setup_single_cpu();
        let result = send(cpu::current_cpu(), recording_handler, 0xdead, 0, 0, 0, true).unwrap();
        assert_eq!(result, 7);
        assert_eq!(SEEN.load(O::SeqCst), 0xdead);
    }

    #[test]
    fn send_to_unknown_cpu_is_not_found() {
        setup_single_cpu();
        let bogus = cpu::CpuId::try_from(0xFFFF_FFFFu32);
        assert!(bogus.is_err());
    }

    #[test]
    fn message_returns_to_free_pool_after_synchronous_use() {
        setup_single_cpu();
        let free_before = pool().free.lock().len();
        let _ = send(cpu::current_cpu(), recording_handler, 1, 0, 0, 0, true);
        let free_after = pool().free.lock().len();
        assert_eq!(free_before, free_after, "self-send never touches the pool");
    }
}
