//! An abstraction for querying about CPUs (cores) in an SMP multicore
//! system.
//!
//! This crate contains no extra functionality of its own: it wraps
//! [`apic`]'s Local-APIC-identified [`ApicId`] in the architecture-neutral
//! `CpuId` every other core crate speaks in, mirroring the teacher's own
//! `cpu` crate, which does the same thing for its single supported
//! architecture at a time.

#![no_std]

use core::fmt;

use apic::ApicId;
use derive_more::*;

/// A unique identifier for a CPU core.
///
/// A `CpuId` is a known-valid value that is guaranteed to correspond to a
/// single CPU that [`apic::init`] was told actually exists on the current
/// system.
#[derive(
    Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord,
    Hash, Binary, Octal, LowerHex, UpperHex,
)]
#[repr(transparent)]
pub struct CpuId(u32);

impl CpuId {
    /// Returns the inner raw value of this `CpuId`.
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Returns `true` if this `CpuId` is the ID of the bootstrap CPU, the
    /// first CPU to boot.
    pub fn is_bootstrap_cpu(&self) -> bool {
        Some(self) == bootstrap_cpu().as_ref()
    }

    /// The stable ordinal index assigned to this CPU at boot, for indexing
    /// the small fixed-size per-CPU arrays the scheduler, preemption, and
    /// IPI layers each keep. `None` if this `CpuId` somehow predates
    /// registration (never true for a `CpuId` obtained through this crate).
    pub fn ordinal(&self) -> Option<usize> {
        apic::ordinal_of(ApicId::from(*self))
    }
}

impl From<ApicId> for CpuId {
    fn from(apic_id: ApicId) -> Self {
        CpuId(apic_id.value())
    }
}

impl From<CpuId> for ApicId {
    fn from(cpu_id: CpuId) -> Self {
        ApicId::try_from(cpu_id.value()).expect("an invalid CpuId was encountered")
    }
}

impl TryFrom<u32> for CpuId {
    type Error = u32;
    fn try_from(raw_cpu_id: u32) -> Result<Self, Self::Error> {
        ApicId::try_from(raw_cpu_id).map(Into::into)
    }
}

impl From<CpuId> for u32 {
    fn from(value: CpuId) -> Self {
        value.0
    }
}
impl From<CpuId> for u64 {
    fn from(value: CpuId) -> Self {
        value.0.into()
    }
}

/// Returns the number of CPUs (SMP cores) that exist and are currently
/// initialized on this system.
pub fn cpu_count() -> u32 {
    apic::cpu_count()
}

/// Returns the ID of the bootstrap CPU (if known), the first CPU to run
/// after system power-on.
pub fn bootstrap_cpu() -> Option<CpuId> {
    apic::bootstrap_cpu().map(Into::into)
}

/// Returns true if the currently executing CPU is the bootstrap CPU.
pub fn is_bootstrap_cpu() -> bool {
    apic::is_bootstrap_cpu()
}

/// Returns the ID of the currently executing CPU.
pub fn current_cpu() -> CpuId {
    apic::current_cpu().into()
}

/// Returns the CPU at the given boot-assigned ordinal index, if any.
pub fn cpu_at(ordinal: usize) -> Option<CpuId> {
    apic::apic_id_at(ordinal).map(Into::into)
}

/// A wrapper around `Option<CpuId>` with a forced type alignment of 8
/// bytes, which guarantees that it compiles down to lock-free native atomic
/// instructions when used inside an atomic cell type.
#[derive(Copy, Clone)]
#[repr(align(8))]
pub struct OptionalCpuId(Option<CpuId>);

impl From<Option<CpuId>> for OptionalCpuId {
    fn from(opt: Option<CpuId>) -> Self {
        Self(opt)
    }
}

impl From<OptionalCpuId> for Option<CpuId> {
    fn from(val: OptionalCpuId) -> Self {
        val.0
    }
}

impl fmt::Debug for OptionalCpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bootstrap_round_trips_through_apic() {
        let descriptors = [apic::CpuDescriptor { apic_id: 0, is_bootstrap: true }];
        let _ = apic::init(&descriptors);
        apic::set_test_current_cpu(0);
        assert!(is_bootstrap_cpu());
        assert_eq!(bootstrap_cpu(), Some(current_cpu()));
    }
}
