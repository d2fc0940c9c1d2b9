//! System call ABI: command word encoding.
//!
//! The command word travels in `eax`. The low two bits select the call; the
//! rest are modifier flags. `READ`/`WRITE` deliberately occupy the same bit
//! positions as the page-table entries' nominal permission bits, so a
//! permission grant moves from the command word into the page tables
//! without translation.
//!
//! Remaining registers: `ebx` register-block pointer, `ecx` size, `edx`
//! child index (low byte) and node number (next byte), `esi` source
//! address, `edi` destination address.

use pion_core::arch::x86::structures::paging::PteFlags;

/// Longest string `CPUTS` transfers in one call.
pub const CPUTS_MAX: usize = 256;

/// Mask of the call-selector bits.
pub const SYS_TYPE: u32 = 0x3;

/// The four system calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysCall {
    /// Print a user string on the console.
    Cputs = 0,
    /// Push state into a child (and optionally start it).
    Put = 1,
    /// Pull state out of a child.
    Get = 2,
    /// Return to the parent.
    Ret = 3,
}

bitflags::bitflags! {
    /// Command-word modifier flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SysFlags: u32 {
        /// Transfer the register block.
        const REGS  = 1 << 3;
        /// Start the child (PUT).
        const START = 1 << 4;
        /// Snapshot the child's space into its reference directory (PUT).
        const SNAP  = 1 << 5;
        /// Zero the destination range.
        const ZERO  = 1 << 6;
        /// Copy the source range to the destination, copy-on-write.
        const COPY  = 1 << 7;
        /// Apply a permission change to the destination range.
        const PERM  = 1 << 8;
        /// Nominal read permission (same bit as the PTE's).
        const READ  = 1 << 9;
        /// Nominal write permission (same bit as the PTE's).
        const WRITE = 1 << 10;
    }
}

impl SysFlags {
    /// Three-way merge of the child against its snapshot (GET): both memory
    /// operation bits at once.
    pub const MERGE: SysFlags = SysFlags::ZERO.union(SysFlags::COPY);
    /// Mask of the memory-operation bits.
    pub const MEMOP: SysFlags = SysFlags::ZERO.union(SysFlags::COPY);
    /// Both permission bits.
    pub const RW: SysFlags = SysFlags::READ.union(SysFlags::WRITE);

    /// The nominal page permissions this command word grants.
    pub fn nominal_perm(self) -> PteFlags {
        let mut perm = PteFlags::empty();
        if self.contains(SysFlags::READ) {
            perm |= PteFlags::SYS_READ;
        }
        if self.contains(SysFlags::WRITE) {
            perm |= PteFlags::SYS_WRITE;
        }
        perm
    }
}

/// Splits a command word into the call selector and its flags.
pub fn decode(cmd: u32) -> (SysCall, SysFlags) {
    let call = match cmd & SYS_TYPE {
        0 => SysCall::Cputs,
        1 => SysCall::Put,
        2 => SysCall::Get,
        _ => SysCall::Ret,
    };
    (call, SysFlags::from_bits_truncate(cmd))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_decoding() {
        assert_eq!(decode(0).0, SysCall::Cputs);
        assert_eq!(decode(1).0, SysCall::Put);
        assert_eq!(decode(2).0, SysCall::Get);
        assert_eq!(decode(3).0, SysCall::Ret);
    }

    #[test]
    fn flags_ride_along_with_selector() {
        let (call, flags) = decode(1 | 0x8 | 0x10 | 0x80);
        assert_eq!(call, SysCall::Put);
        assert!(flags.contains(SysFlags::REGS | SysFlags::START | SysFlags::COPY));
        assert!(!flags.contains(SysFlags::ZERO));
    }

    #[test]
    fn merge_is_both_memop_bits() {
        // MERGE deliberately equals ZERO|COPY: a GET with both bits asks
        // for the three-way merge, not for either simple operation.
        assert_eq!(SysFlags::MERGE, SysFlags::ZERO | SysFlags::COPY);
        assert_eq!(SysFlags::MEMOP, SysFlags::MERGE);
    }

    #[test]
    fn permission_bits_match_pte_nominal_bits() {
        assert_eq!(SysFlags::READ.bits(), PteFlags::SYS_READ.bits());
        assert_eq!(SysFlags::WRITE.bits(), PteFlags::SYS_WRITE.bits());
        assert_eq!(
            SysFlags::RW.nominal_perm(),
            PteFlags::SYS_READ | PteFlags::SYS_WRITE
        );
        assert_eq!(SysFlags::READ.nominal_perm(), PteFlags::SYS_READ);
        assert_eq!(SysFlags::empty().nominal_perm(), PteFlags::empty());
    }

    #[test]
    fn unknown_bits_are_dropped() {
        let (_, flags) = decode(0xFFFF_0000 | 0x40);
        assert_eq!(flags, SysFlags::ZERO);
    }
}
