//! Segment register access.

#![cfg(target_arch = "x86")]

use crate::arch::x86::structures::gdt::SegmentSelector;

/// Reads the current code segment selector.
#[inline]
pub fn read_cs() -> SegmentSelector {
    let raw: u16;
    // SAFETY: Reading CS has no side effects.
    unsafe {
        core::arch::asm!("mov {0:x}, cs", out(reg) raw, options(nomem, nostack, preserves_flags));
    }
    SegmentSelector::from_raw(raw)
}
