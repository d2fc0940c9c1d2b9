//! i386 trap entry, IDT wiring, and paging bring-up.

pub mod idt;
pub mod stubs;

pub use stubs::trap_return;

use pion_core::addr::{PhysAddr, VirtAddr};
use pion_core::arch::x86::instructions::tlb;
use pion_core::arch::x86::registers::control::{Cr0, Cr3, Cr4, Cr4Flags, CR0_KERNEL};

/// Turns the MMU on with `root` installed: 4 MiB page and global-page
/// support in CR4, the directory in CR3, then the kernel CR0 flag set.
///
/// # Safety
///
/// `root` must identity-map the currently executing code (the boot
/// directory does); boot CPU calls this exactly once per CPU, before any
/// user mapping exists.
pub unsafe fn enable_paging(root: PhysAddr) {
    // SAFETY: Forwarded contract; the identity map keeps this code and
    // stack valid across the switch.
    unsafe {
        Cr4::write(Cr4::read() | Cr4Flags::PAGE_SIZE_EXTENSION | Cr4Flags::GLOBAL_PAGE);
        Cr3::write(root);
        Cr0::write(CR0_KERNEL);
    }
    // From here on the page-table engine must flush real TLBs.
    crate::mm::tlb::register(flush_page, flush_all, current_root);
}

fn flush_page(va: VirtAddr) {
    tlb::flush(va);
}

fn flush_all(root: PhysAddr) {
    // SAFETY: Reloading CR3 with the directory being modified is the
    // whole-space invalidation the TLB policy asked for.
    unsafe { tlb::flush_all(root) };
}

fn current_root() -> Option<PhysAddr> {
    Some(Cr3::read())
}
