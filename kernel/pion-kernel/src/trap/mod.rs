//! Trap vector assignments and the central dispatcher.
//!
//! Every processor exception, device interrupt, and system call enters the
//! kernel through one path: a per-vector stub builds a [`TrapFrame`] and
//! calls [`trap`], which classifies the event and either returns to the
//! interrupted context, transfers control (recovery hook, scheduler,
//! reflection to the parent process), or panics.

pub mod check;
pub mod irq;

#[cfg(target_arch = "x86")]
use pion_core::arch::x86::structures::trapframe::TrapFrame;

// Architectural exception vectors.
/// Divide error.
pub const T_DIVIDE: u32 = 0;
/// Debug exception.
pub const T_DEBUG: u32 = 1;
/// Non-maskable interrupt.
pub const T_NMI: u32 = 2;
/// Breakpoint (`int3`); user-callable.
pub const T_BRKPT: u32 = 3;
/// Overflow (`into`); user-callable.
pub const T_OFLOW: u32 = 4;
/// BOUND range exceeded.
pub const T_BOUND: u32 = 5;
/// Invalid opcode.
pub const T_ILLOP: u32 = 6;
/// Device not available (FPU).
pub const T_DEVICE: u32 = 7;
/// Double fault.
pub const T_DBLFLT: u32 = 8;
/// Invalid TSS.
pub const T_TSS: u32 = 10;
/// Segment not present.
pub const T_SEGNP: u32 = 11;
/// Stack segment fault.
pub const T_STACK: u32 = 12;
/// General protection fault.
pub const T_GPFLT: u32 = 13;
/// Page fault.
pub const T_PGFLT: u32 = 14;
/// x87 floating-point error.
pub const T_FPERR: u32 = 16;
/// Alignment check.
pub const T_ALIGN: u32 = 17;
/// Machine check.
pub const T_MCHK: u32 = 18;
/// SIMD floating-point exception.
pub const T_SIMD: u32 = 19;
/// Security event.
pub const T_SECEV: u32 = 30;

/// Base vector for the 16 hardware IRQ lines.
pub const T_IRQ0: u32 = 32;
/// System call vector (`int $0x30`); user-callable.
pub const T_SYSCALL: u32 = 48;
/// Local APIC timer.
pub const T_LTIMER: u32 = 49;

/// IRQ line treated as spurious: acknowledged nowhere, returns immediately.
pub const IRQ_SPURIOUS: u32 = 7;

/// Human-readable name for a trap vector.
pub fn trap_name(trapno: u32) -> &'static str {
    const EXCEPTIONS: [&str; 20] = [
        "Divide error",
        "Debug",
        "Non-Maskable Interrupt",
        "Breakpoint",
        "Overflow",
        "BOUND Range Exceeded",
        "Invalid Opcode",
        "Device Not Available",
        "Double Fault",
        "Coprocessor Segment Overrun",
        "Invalid TSS",
        "Segment Not Present",
        "Stack Fault",
        "General Protection",
        "Page Fault",
        "(unknown trap)",
        "x87 FPU Floating-Point Error",
        "Alignment Check",
        "Machine-Check",
        "SIMD Floating-Point Exception",
    ];
    match trapno {
        0..=19 => EXCEPTIONS[trapno as usize],
        T_SECEV => "Security Event",
        T_SYSCALL => "System call",
        T_LTIMER => "Local timer",
        v if (T_IRQ0..T_IRQ0 + 16).contains(&v) => "Hardware Interrupt",
        _ => "(unknown trap)",
    }
}

/// Restores the saved frame and resumes the interrupted context.
#[cfg(target_arch = "x86")]
pub use crate::arch::x86::trap_return;

/// The central trap dispatcher. Called by the entry stubs with interrupts
/// disabled; never returns by falling off the end.
///
/// Routing order: page faults get a shot at copy-on-write resolution;
/// anticipated traps go to the armed recovery hook; hardware interrupts are
/// acknowledged and dispatched; the syscall vector hands off to the shim;
/// anything else from user mode is reflected to the parent process, and
/// anything else from kernel mode is fatal.
#[cfg(target_arch = "x86")]
pub extern "C" fn trap(tf: &mut TrapFrame) -> ! {
    use crate::mm::fault::{handle_page_fault, FaultResolution};
    use crate::mm::pmm;
    use crate::{console, percpu, proc, syscall};
    use pion_core::arch::x86::registers::control::Cr2;
    use pion_core::kprint;

    // User code may leave the direction flag set; compiled code assumes it
    // is clear.
    // SAFETY: Clearing DF has no other effect.
    unsafe { core::arch::asm!("cld", options(nomem, nostack)) };

    if tf.trapno == T_PGFLT {
        let fva = Cr2::read();
        if let Some(mut cur) = proc::current() {
            // SAFETY: The current-process pointer is valid for the duration
            // of the trap; this CPU is the process's single mutator.
            let cur = unsafe { cur.as_mut() };
            let resolution =
                pmm::with_pool(|pool| handle_page_fault(pool, &mut cur.aspace, fva));
            if resolution == FaultResolution::Resolved {
                trap_return(tf);
            }
        }
    }

    // An anticipated trap: hand the frame to the armed recovery hook.
    if let Some((recover, data)) = percpu::current_cpu().recovery() {
        recover(tf, data);
    }

    if tf.trapno == T_SYSCALL {
        syscall::syscall(tf);
    }

    if tf.trapno == T_LTIMER {
        irq::eoi();
        irq::timer_tick();
        if tf.from_user_mode() {
            proc::yield_to(tf);
        }
        trap_return(tf);
    }

    if (T_IRQ0..T_IRQ0 + 16).contains(&tf.trapno) {
        let line = (tf.trapno - T_IRQ0) as u8;
        if line as u32 == IRQ_SPURIOUS {
            trap_return(tf);
        }
        irq::eoi();
        irq::dispatch(line);
        trap_return(tf);
    }

    // Unhandled trap from user mode: reflect to the parent process,
    // migrating home first if this is not the process's home node.
    if tf.from_user_mode() {
        if let Some(cur) = proc::current() {
            // SAFETY: Valid for the duration of the trap.
            let home = unsafe { cur.as_ref() }.home_node;
            if home != proc::net_node() {
                proc::migrate(tf, home);
            }
        }
        proc::reflect(tf, -1);
    }

    // Unhandled trap in kernel mode. If this CPU was printing, drop the
    // console lock so the report below cannot deadlock into a second panic.
    console::force_unlock();
    kprint!("{}\n", tf);
    panic!("unhandled trap {} ({})", tf.trapno, trap_name(tf.trapno));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_assignments() {
        // Stable numbers: user upcalls see these in the reflected frame.
        assert_eq!(T_PGFLT, 14);
        assert_eq!(T_IRQ0, 32);
        assert_eq!(T_SYSCALL, 0x30);
        assert_eq!(T_LTIMER, T_SYSCALL + 1);
        assert!(T_SECEV > T_SIMD && T_SECEV < T_IRQ0);
    }

    #[test]
    fn trap_names() {
        assert_eq!(trap_name(T_DIVIDE), "Divide error");
        assert_eq!(trap_name(T_PGFLT), "Page Fault");
        assert_eq!(trap_name(T_SYSCALL), "System call");
        assert_eq!(trap_name(T_IRQ0 + 1), "Hardware Interrupt");
        assert_eq!(trap_name(9), "Coprocessor Segment Overrun");
        assert_eq!(trap_name(200), "(unknown trap)");
    }
}
