//! The saved register frame built by the trap entry path.
//!
//! Layout is dictated by the entry stubs: the CPU pushes `ss`/`esp` (cross-
//! ring only), `eflags`, `cs`, `eip`, and for some vectors an error code;
//! the stub pushes the vector number, segment registers, and finally the
//! general registers with `pusha`. The struct therefore reads bottom-up
//! from the stack pointer at the time the dispatcher is called.

use core::fmt;

/// General-purpose registers in `pusha` order.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct PushRegs {
    /// Destination index.
    pub edi: u32,
    /// Source index.
    pub esi: u32,
    /// Frame pointer.
    pub ebp: u32,
    /// Stack pointer as saved by `pusha`; ignored by `popa`.
    pub oesp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    /// Accumulator; carries the syscall command word.
    pub eax: u32,
}

/// The complete saved state at the point of a trap.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct TrapFrame {
    /// General registers, pushed last by the entry stub.
    pub regs: PushRegs,
    /// Saved ES selector.
    pub es: u16,
    _pad_es: u16,
    /// Saved DS selector.
    pub ds: u16,
    _pad_ds: u16,
    /// Vector number, pushed by the per-vector stub.
    pub trapno: u32,
    /// Error code pushed by the CPU, or 0 for vectors without one.
    pub err: u32,
    /// Faulting/next instruction pointer.
    pub eip: u32,
    /// Saved code segment selector.
    pub cs: u16,
    _pad_cs: u16,
    /// Saved flags.
    pub eflags: u32,
    /// Saved stack pointer; only valid for traps from user mode.
    pub esp: u32,
    /// Saved stack segment; only valid for traps from user mode.
    pub ss: u16,
    _pad_ss: u16,
}

impl TrapFrame {
    /// An all-zero frame.
    pub const fn empty() -> Self {
        // SAFETY: TrapFrame is repr(C) and all fields are integers, so the
        // all-zero bit pattern is a valid value.
        unsafe { core::mem::zeroed() }
    }

    /// Returns `true` if the interrupted code was running in user mode
    /// (privilege bits of the saved code selector are non-zero).
    #[inline]
    pub const fn from_user_mode(&self) -> bool {
        self.cs & 0b11 != 0
    }
}

impl fmt::Display for TrapFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "TRAP frame")?;
        writeln!(f, "  edi  {:#010x}", self.regs.edi)?;
        writeln!(f, "  esi  {:#010x}", self.regs.esi)?;
        writeln!(f, "  ebp  {:#010x}", self.regs.ebp)?;
        writeln!(f, "  ebx  {:#010x}", self.regs.ebx)?;
        writeln!(f, "  edx  {:#010x}", self.regs.edx)?;
        writeln!(f, "  ecx  {:#010x}", self.regs.ecx)?;
        writeln!(f, "  eax  {:#010x}", self.regs.eax)?;
        writeln!(f, "  es   {:#06x}", self.es)?;
        writeln!(f, "  ds   {:#06x}", self.ds)?;
        writeln!(f, "  trap {:#010x}", self.trapno)?;
        writeln!(f, "  err  {:#010x}", self.err)?;
        writeln!(f, "  eip  {:#010x}", self.eip)?;
        writeln!(f, "  cs   {:#06x}", self.cs)?;
        writeln!(f, "  flag {:#010x}", self.eflags)?;
        writeln!(f, "  esp  {:#010x}", self.esp)?;
        write!(f, "  ss   {:#06x}", self.ss)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn frame_layout_matches_entry_stub() {
        // The entry stubs and trap_return hard-code this layout; lock it.
        assert_eq!(size_of::<PushRegs>(), 32);
        assert_eq!(offset_of!(TrapFrame, regs), 0);
        assert_eq!(offset_of!(TrapFrame, es), 32);
        assert_eq!(offset_of!(TrapFrame, ds), 36);
        assert_eq!(offset_of!(TrapFrame, trapno), 40);
        assert_eq!(offset_of!(TrapFrame, err), 44);
        assert_eq!(offset_of!(TrapFrame, eip), 48);
        assert_eq!(offset_of!(TrapFrame, cs), 52);
        assert_eq!(offset_of!(TrapFrame, eflags), 56);
        assert_eq!(offset_of!(TrapFrame, esp), 60);
        assert_eq!(offset_of!(TrapFrame, ss), 64);
        assert_eq!(size_of::<TrapFrame>(), 68);
    }

    #[test]
    fn user_mode_check() {
        let mut tf = TrapFrame::empty();
        tf.cs = 0x08; // kernel code selector, RPL 0
        assert!(!tf.from_user_mode());
        tf.cs = 0x1B; // user code selector, RPL 3
        assert!(tf.from_user_mode());
    }
}
