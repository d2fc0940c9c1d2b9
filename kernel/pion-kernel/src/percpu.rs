//! Per-CPU state.
//!
//! Holds the CPU-local state the trap path needs, most importantly the
//! anticipated-fault recovery slot: a `(handler, data)` pair that, when set,
//! takes over trap routing (see [`crate::trap`]). A single static instance
//! serves the BSP; the accessor is the one place to change when application
//! processors arrive.

use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use pion_core::arch::x86::structures::trapframe::TrapFrame;

/// An anticipated-fault handler. Receives the saved frame and the data word
/// registered alongside it; must leave via `trap_return` or a reflection
/// path, never by returning.
pub type RecoverFn = fn(&mut TrapFrame, usize) -> !;

/// Per-CPU data.
pub struct PerCpu {
    /// Logical CPU ID (0 for the BSP).
    cpu_id: AtomicU32,
    /// Anticipated-fault handler; null when no recovery region is active.
    recover: AtomicPtr<()>,
    /// Data word passed through to the handler.
    recover_data: AtomicUsize,
}

impl PerCpu {
    const fn new() -> Self {
        Self {
            cpu_id: AtomicU32::new(0),
            recover: AtomicPtr::new(core::ptr::null_mut()),
            recover_data: AtomicUsize::new(0),
        }
    }

    /// Returns the logical CPU ID.
    pub fn id(&self) -> u32 {
        self.cpu_id.load(Ordering::Relaxed)
    }

    /// Arms the recovery slot. Traps on this CPU short-circuit into
    /// `handler` until [`clear_recovery`](Self::clear_recovery) runs.
    ///
    /// The slot is per-CPU and trap handlers never enable interrupts, so
    /// set/clear pairs cannot interleave with a trap on the same CPU.
    pub fn set_recovery(&self, handler: RecoverFn, data: usize) {
        debug_assert!(
            self.recover.load(Ordering::Relaxed).is_null(),
            "nested recovery regions"
        );
        self.recover_data.store(data, Ordering::Relaxed);
        self.recover.store(handler as *mut (), Ordering::Release);
    }

    /// Disarms the recovery slot.
    pub fn clear_recovery(&self) {
        self.recover.store(core::ptr::null_mut(), Ordering::Release);
    }

    /// Returns the armed handler and its data word, if any.
    pub fn recovery(&self) -> Option<(RecoverFn, usize)> {
        let ptr = self.recover.load(Ordering::Acquire);
        if ptr.is_null() {
            return None;
        }
        // SAFETY: Only valid `RecoverFn` pointers are stored (or null,
        // excluded above).
        let f: RecoverFn = unsafe { core::mem::transmute(ptr) };
        Some((f, self.recover_data.load(Ordering::Relaxed)))
    }
}

/// BSP per-CPU data.
static BSP: PerCpu = PerCpu::new();

/// Returns the current CPU's data.
///
/// BSP-only for now; application processors will index by APIC ID.
pub fn current_cpu() -> &'static PerCpu {
    &BSP
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_recover(_tf: &mut TrapFrame, _data: usize) -> ! {
        unreachable!("recovery handler must not be invoked by this test");
    }

    #[test]
    fn recovery_slot_roundtrip() {
        let cpu = PerCpu::new();
        assert!(cpu.recovery().is_none());

        cpu.set_recovery(dummy_recover, 0xDEAD);
        let (f, data) = cpu.recovery().expect("slot armed");
        assert_eq!(f as usize, dummy_recover as usize);
        assert_eq!(data, 0xDEAD);

        cpu.clear_recovery();
        assert!(cpu.recovery().is_none());
    }

    #[test]
    fn bsp_accessor_is_stable() {
        let a = current_cpu() as *const PerCpu;
        let b = current_cpu() as *const PerCpu;
        assert_eq!(a, b);
        assert_eq!(current_cpu().id(), 0);
    }
}
