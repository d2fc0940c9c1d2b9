//! Trap entry stubs.
//!
//! One naked stub per installed vector. The CPU pushes `ss`/`esp` (on a
//! privilege change), `eflags`, `cs`, `eip`, and — for some exceptions — an
//! error code. The stub normalizes the stack by pushing a zero error code
//! where the CPU does not, pushes its vector number, and jumps to the
//! common entry, which finishes building the [`TrapFrame`] layout (segment
//! registers, `pusha`) and calls the dispatcher with a pointer to it.
//!
//! [`TrapFrame`]: pion_core::arch::x86::structures::trapframe::TrapFrame

use pion_core::arch::x86::structures::trapframe::TrapFrame;

/// Selector value loaded into DS/ES on kernel entry.
const KERNEL_DS: u16 = 0x10;

/// Stub for a vector whose exception does not push an error code.
macro_rules! stub {
    ($name:ident, $vec:expr) => {
        #[unsafe(naked)]
        pub extern "C" fn $name() {
            // SAFETY: Naked stub; the pushed words complete the TrapFrame
            // layout expected by `trap_entry`.
            unsafe {
                core::arch::naked_asm!(
                    "push 0",
                    "push {vec}",
                    "jmp {entry}",
                    vec = const $vec,
                    entry = sym trap_entry,
                );
            }
        }
    };
}

/// Stub for a vector whose exception pushes a real error code.
macro_rules! stub_err {
    ($name:ident, $vec:expr) => {
        #[unsafe(naked)]
        pub extern "C" fn $name() {
            // SAFETY: As in `stub!`; the CPU already pushed the error code.
            unsafe {
                core::arch::naked_asm!(
                    "push {vec}",
                    "jmp {entry}",
                    vec = const $vec,
                    entry = sym trap_entry,
                );
            }
        }
    };
}

/// Common entry: save segments and general registers, switch to the kernel
/// data segments, and call the dispatcher with the frame pointer.
#[unsafe(naked)]
extern "C" fn trap_entry() {
    // SAFETY: Completes the TrapFrame exactly as its layout test pins it:
    // regs lowest, then es, ds, trapno, err, and the CPU-pushed words.
    unsafe {
        core::arch::naked_asm!(
            "push ds",
            "push es",
            "pusha",
            "mov ax, {kds}",
            "mov ds, ax",
            "mov es, ax",
            "push esp",
            "call {trap}",
            kds = const KERNEL_DS,
            trap = sym crate::trap::trap,
        );
    }
}

/// Restores a saved frame and resumes it with `iret`.
///
/// The frame is consumed: its storage is the kernel stack area the entry
/// path built, and the stack pointer is rewound onto it.
#[unsafe(naked)]
pub extern "C" fn trap_return(_tf: &mut TrapFrame) -> ! {
    // SAFETY: Unwinds the exact layout trap_entry pushed; `add esp, 8`
    // drops the vector number and error code before iret.
    unsafe {
        core::arch::naked_asm!(
            "mov esp, [esp + 4]",
            "popa",
            "pop es",
            "pop ds",
            "add esp, 8",
            "iretd",
        );
    }
}

// Architectural exceptions.
stub!(divide, 0);
stub!(debug, 1);
stub!(nmi, 2);
stub!(breakpoint, 3);
stub!(overflow, 4);
stub!(bound, 5);
stub!(illegal_op, 6);
stub!(device, 7);
stub_err!(double_fault, 8);
stub_err!(invalid_tss, 10);
stub_err!(segment_not_present, 11);
stub_err!(stack_fault, 12);
stub_err!(general_protection, 13);
stub_err!(page_fault, 14);
stub!(fp_error, 16);
stub_err!(alignment, 17);
stub!(machine_check, 18);
stub!(simd, 19);
stub_err!(security_event, 30);

// Hardware IRQ lines 0..16 (vectors 32..48).
stub!(irq0, 32);
stub!(irq1, 33);
stub!(irq2, 34);
stub!(irq3, 35);
stub!(irq4, 36);
stub!(irq5, 37);
stub!(irq6, 38);
stub!(irq7, 39);
stub!(irq8, 40);
stub!(irq9, 41);
stub!(irq10, 42);
stub!(irq11, 43);
stub!(irq12, 44);
stub!(irq13, 45);
stub!(irq14, 46);
stub!(irq15, 47);

stub!(syscall, 48);
stub!(local_timer, 49);

/// The IRQ stubs in line order, for table-driven IDT setup.
pub static IRQ_STUBS: [extern "C" fn(); 16] = [
    irq0, irq1, irq2, irq3, irq4, irq5, irq6, irq7, irq8, irq9, irq10, irq11, irq12, irq13,
    irq14, irq15,
];
