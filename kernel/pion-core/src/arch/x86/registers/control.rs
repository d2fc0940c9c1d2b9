//! Control register flags and access.
//!
//! The flag definitions compile everywhere (they are plain data and get
//! unit-tested on the host); the read/write accessors exist only on x86.

use bitflags::bitflags;

bitflags! {
    /// CR0 flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr0Flags: u32 {
        /// Protected mode enable.
        const PROTECTED_MODE = 1 << 0;
        /// Monitor coprocessor (FWAIT traps with TS).
        const MONITOR_COPROCESSOR = 1 << 1;
        /// x87 emulation; must be clear to execute FP instructions.
        const EMULATE_COPROCESSOR = 1 << 2;
        /// Task switched; lazily saves FP state.
        const TASK_SWITCHED = 1 << 3;
        /// Native x87 error reporting.
        const NUMERIC_ERROR = 1 << 5;
        /// Honor read-only pages in supervisor mode.
        const WRITE_PROTECT = 1 << 16;
        /// Alignment check enable (with EFLAGS.AC).
        const ALIGNMENT_MASK = 1 << 18;
        /// Paging enable.
        const PAGING = 1 << 31;
    }
}

bitflags! {
    /// CR4 flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr4Flags: u32 {
        /// 4 MiB page support (PS bit in PDEs).
        const PAGE_SIZE_EXTENSION = 1 << 4;
        /// Global page support (G bit in PTEs).
        const GLOBAL_PAGE = 1 << 7;
    }
}

/// The flag set the kernel runs with once paging is on: protected mode,
/// paging, supervisor write protection, native FP error handling.
pub const CR0_KERNEL: Cr0Flags = Cr0Flags::PROTECTED_MODE
    .union(Cr0Flags::PAGING)
    .union(Cr0Flags::WRITE_PROTECT)
    .union(Cr0Flags::ALIGNMENT_MASK)
    .union(Cr0Flags::NUMERIC_ERROR)
    .union(Cr0Flags::TASK_SWITCHED)
    .union(Cr0Flags::MONITOR_COPROCESSOR);

#[cfg(target_arch = "x86")]
mod access {
    use super::{Cr0Flags, Cr4Flags};
    use crate::addr::PhysAddr;
    use core::arch::asm;

    /// CR0: machine control flags.
    pub struct Cr0;

    impl Cr0 {
        /// Reads CR0.
        #[inline]
        pub fn read() -> Cr0Flags {
            let raw: u32;
            // SAFETY: Reading CR0 has no side effects.
            unsafe { asm!("mov {}, cr0", out(reg) raw, options(nomem, nostack, preserves_flags)) };
            Cr0Flags::from_bits_truncate(raw)
        }

        /// Writes CR0.
        ///
        /// # Safety
        ///
        /// Toggling PE/PG changes the execution model out from under the
        /// running code; the caller must be on an identity-mapped path.
        #[inline]
        pub unsafe fn write(flags: Cr0Flags) {
            unsafe { asm!("mov cr0, {}", in(reg) flags.bits(), options(nostack, preserves_flags)) };
        }
    }

    /// CR2: faulting linear address of the last page fault.
    pub struct Cr2;

    impl Cr2 {
        /// Reads the faulting address recorded by the MMU.
        #[inline]
        pub fn read() -> u32 {
            let raw: u32;
            // SAFETY: Reading CR2 has no side effects.
            unsafe { asm!("mov {}, cr2", out(reg) raw, options(nomem, nostack, preserves_flags)) };
            raw
        }
    }

    /// CR3: physical address of the active page directory.
    pub struct Cr3;

    impl Cr3 {
        /// Reads the current page-directory base.
        #[inline]
        pub fn read() -> PhysAddr {
            let raw: u32;
            // SAFETY: Reading CR3 has no side effects.
            unsafe { asm!("mov {}, cr3", out(reg) raw, options(nomem, nostack, preserves_flags)) };
            PhysAddr::new(raw & 0xFFFF_F000)
        }

        /// Installs a new page directory (flushes all non-global TLB entries).
        ///
        /// # Safety
        ///
        /// `root` must point at a valid page directory that keeps the
        /// currently executing code mapped.
        #[inline]
        pub unsafe fn write(root: PhysAddr) {
            unsafe {
                asm!("mov cr3, {}", in(reg) root.as_u32(), options(nostack, preserves_flags))
            };
        }
    }

    /// CR4: architecture extension flags.
    pub struct Cr4;

    impl Cr4 {
        /// Reads CR4.
        #[inline]
        pub fn read() -> Cr4Flags {
            let raw: u32;
            // SAFETY: Reading CR4 has no side effects.
            unsafe { asm!("mov {}, cr4", out(reg) raw, options(nomem, nostack, preserves_flags)) };
            Cr4Flags::from_bits_truncate(raw)
        }

        /// Writes CR4.
        ///
        /// # Safety
        ///
        /// Clearing PSE/PGE while large or global mappings are live makes
        /// those mappings undefined.
        #[inline]
        pub unsafe fn write(flags: Cr4Flags) {
            unsafe { asm!("mov cr4, {}", in(reg) flags.bits(), options(nostack, preserves_flags)) };
        }
    }
}

#[cfg(target_arch = "x86")]
pub use access::{Cr0, Cr2, Cr3, Cr4};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_cr0_bits() {
        assert!(CR0_KERNEL.contains(Cr0Flags::PROTECTED_MODE));
        assert!(CR0_KERNEL.contains(Cr0Flags::PAGING));
        assert!(CR0_KERNEL.contains(Cr0Flags::WRITE_PROTECT));
        assert!(!CR0_KERNEL.contains(Cr0Flags::EMULATE_COPROCESSOR));
    }

    #[test]
    fn cr4_paging_extensions() {
        let flags = Cr4Flags::PAGE_SIZE_EXTENSION | Cr4Flags::GLOBAL_PAGE;
        assert_eq!(flags.bits(), (1 << 4) | (1 << 7));
    }
}
