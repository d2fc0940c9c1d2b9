//! TLB invalidation instructions.

#![cfg(target_arch = "x86")]

use crate::addr::{PhysAddr, VirtAddr};
use crate::arch::x86::registers::control::Cr3;

/// Invalidates the TLB entry for one page (INVLPG).
#[inline]
pub fn flush(addr: VirtAddr) {
    // SAFETY: INVLPG drops a single TLB entry and has no other effect.
    unsafe {
        core::arch::asm!(
            "invlpg [{}]",
            in(reg) addr.as_u32(),
            options(nostack, preserves_flags),
        );
    }
}

/// Flushes all non-global TLB entries by reloading CR3 with `root`.
///
/// # Safety
///
/// `root` must be the physical address of a valid page directory; the CPU
/// starts translating through it immediately.
#[inline]
pub unsafe fn flush_all(root: PhysAddr) {
    unsafe { Cr3::write(root) };
}
