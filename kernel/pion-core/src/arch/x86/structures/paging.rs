//! Two-level x86 page table structures.
//!
//! A page directory and a page table are both arrays of 1024 32-bit entries.
//! The hardware-defined low bits are modeled by [`PteFlags`]; bits 9 and 10
//! (ignored by the MMU) carry the kernel's *nominal* permissions, which
//! record what the owning process was granted independently of the hardware
//! writable bit — the writable bit may be temporarily clear on a page that
//! is logically writable but shared copy-on-write.

use crate::addr::PhysAddr;

/// Physical frame address mask: bits 12..31 of an entry.
pub const PTE_ADDR_MASK: u32 = 0xFFFF_F000;

bitflags::bitflags! {
    /// Page table / page directory entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        /// Entry is present.
        const PRESENT       = 1 << 0;
        /// Page is writable (hardware-enforced).
        const WRITABLE      = 1 << 1;
        /// Page is accessible from user mode.
        const USER          = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled.
        const CACHE_DISABLE = 1 << 4;
        /// Set by the MMU on any access through this entry.
        const ACCESSED      = 1 << 5;
        /// Set by the MMU on a write through this entry.
        const DIRTY         = 1 << 6;
        /// PS bit — in a PDE, maps a 4 MiB page directly.
        const LARGE_PAGE    = 1 << 7;
        /// Global page (survives CR3 reload when CR4.PGE is set).
        const GLOBAL        = 1 << 8;
        /// Nominal read permission (MMU-ignored bit 9).
        const SYS_READ      = 1 << 9;
        /// Nominal write permission (MMU-ignored bit 10).
        const SYS_WRITE     = 1 << 10;
    }
}

impl PteFlags {
    /// Both nominal permission bits.
    pub const SYS_RW: PteFlags = PteFlags::SYS_READ.union(PteFlags::SYS_WRITE);
}

bitflags::bitflags! {
    /// Page fault error code pushed by the CPU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultCode: u32 {
        /// 1 = protection violation, 0 = not-present page.
        const PRESENT = 1 << 0;
        /// 1 = write access caused the fault.
        const WRITE   = 1 << 1;
        /// 1 = fault occurred in user mode.
        const USER    = 1 << 2;
        /// 1 = a reserved bit was set in a paging structure.
        const RESERVED = 1 << 3;
    }
}

/// A single page-table or page-directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(u32);

impl Pte {
    /// Creates an entry pointing at `frame` with the given flags.
    pub const fn new(frame: PhysAddr, flags: PteFlags) -> Self {
        Self((frame.as_u32() & PTE_ADDR_MASK) | flags.bits())
    }

    /// Reconstructs an entry from its raw bits.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Returns the raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns the frame address portion.
    pub const fn addr(self) -> PhysAddr {
        PhysAddr::new(self.0 & PTE_ADDR_MASK)
    }

    /// Returns the flags portion.
    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & !PTE_ADDR_MASK)
    }

    /// Returns `true` if the PRESENT bit is set.
    pub const fn is_present(self) -> bool {
        self.0 & 1 != 0
    }

    /// Returns a copy of this entry with the same frame and new flags.
    pub const fn with_flags(self, flags: PteFlags) -> Self {
        Self((self.0 & PTE_ADDR_MASK) | flags.bits())
    }
}

/// A 4 KiB-aligned table of 1024 entries — one page directory or page table.
#[repr(C, align(4096))]
pub struct PageTable {
    /// The entries, indexed by `VirtAddr::pd_index` / `pt_index`.
    pub entries: [Pte; 1024],
}

impl PageTable {
    /// Fills every entry with `value`.
    ///
    /// Fresh user tables are filled with the canonical empty entry rather
    /// than zero, so "fill" takes the value instead of hard-coding it.
    pub fn fill(&mut self, value: Pte) {
        self.entries.fill(value);
    }
}
