//! Timing-related configuration: preemption timer period and IPI pool
//! sizing (the IPI pool is refilled on a per-CPU basis, so its size is
//! naturally expressed as "per microsecond of polling", grounded on the
//! teacher's `CONFIG_TIMESLICE_PERIOD_MICROSECONDS`).

/// Period, in microseconds, used to calibrate the per-CPU preemption/APIC
/// timer during bring-up.
pub const CONFIG_TIMESLICE_PERIOD_MICROSECONDS: u32 = 1000;

/// One scheduler priority level's timeslice contribution, in milliseconds.
/// Dispatch computes `timeslice = (priority + 1) * TIMESLICE_QUANTUM_MS`.
pub const TIMESLICE_QUANTUM_MS: u64 = 1;

/// How often (in milliseconds of simulated/wall-clock time) each CPU's
/// load-balancer thread wakes up to rebalance ready queues.
pub const LOAD_BALANCE_INTERVAL_MS: u64 = 3000;
