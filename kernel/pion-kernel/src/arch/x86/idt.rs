//! IDT construction and loading.

use pion_core::arch::x86::structures::gate::InterruptTable;
use pion_core::arch::x86::structures::gdt::KERNEL_CS;
use pion_core::sync::LazyLock;

use crate::trap::{
    T_ALIGN, T_BOUND, T_BRKPT, T_DBLFLT, T_DEBUG, T_DEVICE, T_DIVIDE, T_FPERR, T_GPFLT,
    T_ILLOP, T_IRQ0, T_LTIMER, T_MCHK, T_NMI, T_OFLOW, T_PGFLT, T_SECEV, T_SEGNP, T_SIMD,
    T_STACK, T_SYSCALL, T_TSS,
};

use super::stubs;

/// The one IDT every CPU loads. Built on first use, on the boot CPU.
static IDT: LazyLock<InterruptTable> = LazyLock::new(build);

fn build() -> InterruptTable {
    let mut idt = InterruptTable::new();

    let mut gate = |vector: u32, stub: extern "C" fn(), dpl: u8| {
        idt.set_gate(vector as u8, stub as usize as u32, KERNEL_CS, dpl);
    };

    gate(T_DIVIDE, stubs::divide, 0);
    gate(T_DEBUG, stubs::debug, 0);
    gate(T_NMI, stubs::nmi, 0);
    // int3 and into are legitimate user instructions.
    gate(T_BRKPT, stubs::breakpoint, 3);
    gate(T_OFLOW, stubs::overflow, 3);
    gate(T_BOUND, stubs::bound, 0);
    gate(T_ILLOP, stubs::illegal_op, 0);
    gate(T_DEVICE, stubs::device, 0);
    gate(T_DBLFLT, stubs::double_fault, 0);
    gate(T_TSS, stubs::invalid_tss, 0);
    gate(T_SEGNP, stubs::segment_not_present, 0);
    gate(T_STACK, stubs::stack_fault, 0);
    gate(T_GPFLT, stubs::general_protection, 0);
    gate(T_PGFLT, stubs::page_fault, 0);
    gate(T_FPERR, stubs::fp_error, 0);
    gate(T_ALIGN, stubs::alignment, 0);
    gate(T_MCHK, stubs::machine_check, 0);
    gate(T_SIMD, stubs::simd, 0);
    gate(T_SECEV, stubs::security_event, 0);

    for (line, stub) in stubs::IRQ_STUBS.iter().enumerate() {
        gate(T_IRQ0 + line as u32, *stub, 0);
    }

    gate(T_SYSCALL, stubs::syscall, 3);
    gate(T_LTIMER, stubs::local_timer, 0);

    idt
}

/// Loads the IDT into this CPU. Every CPU shares the same table.
///
/// # Safety
///
/// The GDT must already be in place (the gates reference the kernel code
/// selector).
pub unsafe fn init() {
    // SAFETY: IDT is a static; stubs are 'static fn items.
    unsafe { IDT.load() };
}
