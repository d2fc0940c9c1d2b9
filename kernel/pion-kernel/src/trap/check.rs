//! Trap-handling self-test.
//!
//! Deliberately takes one of each recoverable exception with the per-CPU
//! recovery hook armed, verifying that every trap reports the right vector
//! and unwinds back onto the same stack (checked with a stack cookie).
//! Runs once from kernel mode at boot; the same checks are reachable from
//! ring 3 through [`trap_check_user`] in the early smoke harness, which
//! runs with the kernel image accessible so the recovery slot can be armed.

#![cfg(target_arch = "x86")]

use core::arch::asm;

use pion_core::arch::x86::instructions::segmentation;
use pion_core::arch::x86::structures::trapframe::TrapFrame;
use pion_core::kdebug;

use super::{trap_return, T_BOUND, T_BRKPT, T_DIVIDE, T_GPFLT, T_ILLOP, T_OFLOW};
use crate::percpu;

/// Communication block between the checker and its recovery handler.
#[repr(C)]
struct CheckArgs {
    /// Where to resume after the anticipated trap (offset 0; the asm
    /// sequences store the resume label here by address).
    resume_eip: u32,
    /// Vector of the trap that fired, reported by the recovery handler.
    trapno: u32,
}

const NO_TRAP: u32 = u32::MAX;

/// Recovery handler for anticipated traps: record the vector, point the
/// saved frame at the caller-designated resume address, and return.
fn check_recover(tf: &mut TrapFrame, data: usize) -> ! {
    // SAFETY: `data` is the address of the live CheckArgs on the checking
    // function's stack; the checker does not return before clearing the
    // recovery slot.
    let args = unsafe { &mut *(data as *mut CheckArgs) };
    tf.eip = args.resume_eip;
    args.trapno = tf.trapno;
    trap_return(tf);
}

/// Verifies trap handling from kernel mode. Boot CPU, after the IDT loads.
pub fn trap_check_kernel() {
    assert_eq!(segmentation::read_cs().rpl(), 0, "not in kernel mode");
    run_checks(false);
    kdebug!("trap check (kernel) passed");
}

/// Verifies trap handling from user mode, including the privileged-
/// instruction case. Called from the ring-3 smoke harness.
pub fn trap_check_user() {
    assert_eq!(segmentation::read_cs().rpl(), 3, "not in user mode");
    run_checks(true);
    kdebug!("trap check (user) passed");
}

fn run_checks(user_mode: bool) {
    let mut args = CheckArgs {
        resume_eip: 0,
        trapno: NO_TRAP,
    };
    let args_ptr = &mut args as *mut CheckArgs;
    let cpu = percpu::current_cpu();
    cpu.set_recovery(check_recover, args_ptr as usize);

    // Anything below that unwinds with the wrong stack pointer will come
    // back to a frame where this value is gone.
    let cookie: u32 = 0xFEED_FACE;

    // Divide by zero.
    // SAFETY: The recovery hook is armed; each faulting instruction resumes
    // at the numbered label stored just before it.
    unsafe {
        asm!(
            "mov {t}, offset 2f",
            "mov [{a}], {t}",
            "xor eax, eax",
            "xor edx, edx",
            "div eax",
            "2:",
            a = in(reg) args_ptr,
            t = out(reg) _,
            out("eax") _,
            out("edx") _,
        );
    }
    assert_eq!(args.trapno, T_DIVIDE);

    // The stack must have come back with us.
    assert_eq!(read_cookie(&cookie), 0xFEED_FACE);

    // Breakpoint.
    // SAFETY: As above.
    unsafe {
        asm!(
            "mov {t}, offset 2f",
            "mov [{a}], {t}",
            "int3",
            "2:",
            a = in(reg) args_ptr,
            t = out(reg) _,
        );
    }
    assert_eq!(args.trapno, T_BRKPT);

    // Overflow: `into` with OF set.
    // SAFETY: As above.
    unsafe {
        asm!(
            "mov {t}, offset 2f",
            "mov [{a}], {t}",
            "mov eax, 0x70000000",
            "add eax, eax",
            "into",
            "2:",
            a = in(reg) args_ptr,
            t = out(reg) _,
            out("eax") _,
        );
    }
    assert_eq!(args.trapno, T_OFLOW);

    // BOUND with an out-of-range index.
    let bounds: [i32; 2] = [1, 3];
    // SAFETY: As above.
    unsafe {
        asm!(
            "mov {t}, offset 2f",
            "mov [{a}], {t}",
            "xor {i:e}, {i:e}",
            "bound {i:e}, [{b}]",
            "2:",
            a = in(reg) args_ptr,
            b = in(reg) bounds.as_ptr(),
            t = out(reg) _,
            i = out(reg) _,
        );
    }
    assert_eq!(args.trapno, T_BOUND);

    // Illegal instruction.
    // SAFETY: As above.
    unsafe {
        asm!(
            "mov {t}, offset 2f",
            "mov [{a}], {t}",
            "ud2",
            "2:",
            a = in(reg) args_ptr,
            t = out(reg) _,
        );
    }
    assert_eq!(args.trapno, T_ILLOP);

    // General protection: load an invalid segment selector.
    // SAFETY: As above; FS is dead in kernel and harness code.
    unsafe {
        asm!(
            "mov {t}, offset 2f",
            "mov [{a}], {t}",
            "mov eax, 0xffffffff",
            "mov fs, ax",
            "2:",
            a = in(reg) args_ptr,
            t = out(reg) _,
            out("eax") _,
        );
    }
    assert_eq!(args.trapno, T_GPFLT);

    // General protection: privileged instruction from ring 3.
    if user_mode {
        // SAFETY: As above; `cli` from ring 3 with IOPL 0 faults before
        // having any effect.
        unsafe {
            asm!(
                "mov {t}, offset 2f",
                "mov [{a}], {t}",
                "cli",
                "2:",
                a = in(reg) args_ptr,
                t = out(reg) _,
            );
        }
        assert_eq!(args.trapno, T_GPFLT);
    }

    assert_eq!(read_cookie(&cookie), 0xFEED_FACE);
    cpu.clear_recovery();
}

/// Reads the cookie through a volatile load so the check survives
/// optimization.
#[inline(never)]
fn read_cookie(cookie: &u32) -> u32 {
    // SAFETY: `cookie` is a live stack variable.
    unsafe { core::ptr::read_volatile(cookie) }
}
