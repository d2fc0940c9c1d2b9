//! EFLAGS register bits.

use bitflags::bitflags;

bitflags! {
    /// EFLAGS bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EFlags: u32 {
        /// Carry flag.
        const CARRY = 1 << 0;
        /// Parity flag.
        const PARITY = 1 << 2;
        /// Auxiliary carry flag.
        const AUX_CARRY = 1 << 4;
        /// Zero flag.
        const ZERO = 1 << 6;
        /// Sign flag.
        const SIGN = 1 << 7;
        /// Single-step trap flag.
        const TRAP = 1 << 8;
        /// Interrupt enable.
        const INTERRUPT = 1 << 9;
        /// Direction flag.
        const DIRECTION = 1 << 10;
        /// Overflow flag.
        const OVERFLOW = 1 << 11;
        /// I/O privilege level (both bits).
        const IOPL = 0b11 << 12;
    }
}

impl EFlags {
    /// The bits user code is allowed to set in a register block handed to
    /// the kernel: arithmetic flags and the direction flag, nothing that
    /// changes privilege or masks interrupts.
    pub const USER_MODIFIABLE: EFlags = EFlags::CARRY
        .union(EFlags::PARITY)
        .union(EFlags::AUX_CARRY)
        .union(EFlags::ZERO)
        .union(EFlags::SIGN)
        .union(EFlags::DIRECTION)
        .union(EFlags::OVERFLOW);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_mask_excludes_privileged_bits() {
        assert!(!EFlags::USER_MODIFIABLE.contains(EFlags::INTERRUPT));
        assert!(!EFlags::USER_MODIFIABLE.contains(EFlags::TRAP));
        assert!(!EFlags::USER_MODIFIABLE.intersects(EFlags::IOPL));
    }

    #[test]
    fn user_mask_value() {
        // CF | PF | AF | ZF | SF | DF | OF
        assert_eq!(EFlags::USER_MODIFIABLE.bits(), 0x0CD5);
    }
}
