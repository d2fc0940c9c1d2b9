//! Segment selectors and the fixed GDT layout contract.
//!
//! The GDT itself is built by the boot path (outside this core); trap and
//! syscall code only needs the selector values and the privilege-level
//! arithmetic on them.

use core::fmt;

/// A segment selector: descriptor index, table indicator, and RPL.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct SegmentSelector(u16);

impl SegmentSelector {
    /// Creates a selector from a descriptor index and requested privilege
    /// level.
    pub const fn new(index: u16, rpl: u8) -> Self {
        Self(index << 3 | rpl as u16)
    }

    /// Creates a selector from its raw encoding.
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// Returns the raw 16-bit encoding.
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Returns the requested privilege level (bits 0..1).
    pub const fn rpl(self) -> u8 {
        (self.0 & 0b11) as u8
    }
}

impl fmt::Debug for SegmentSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentSelector({:#x})", self.0)
    }
}

/// Kernel code segment: GDT slot 1, ring 0.
pub const KERNEL_CS: SegmentSelector = SegmentSelector::new(1, 0);
/// Kernel data segment: GDT slot 2, ring 0.
pub const KERNEL_DS: SegmentSelector = SegmentSelector::new(2, 0);
/// User code segment: GDT slot 3, ring 3.
pub const USER_CS: SegmentSelector = SegmentSelector::new(3, 3);
/// User data segment: GDT slot 4, ring 3.
pub const USER_DS: SegmentSelector = SegmentSelector::new(4, 3);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_encoding() {
        assert_eq!(KERNEL_CS.as_u16(), 0x08);
        assert_eq!(KERNEL_DS.as_u16(), 0x10);
        assert_eq!(USER_CS.as_u16(), 0x1B);
        assert_eq!(USER_DS.as_u16(), 0x23);
    }

    #[test]
    fn selector_rpl() {
        assert_eq!(KERNEL_CS.rpl(), 0);
        assert_eq!(USER_CS.rpl(), 3);
    }
}
