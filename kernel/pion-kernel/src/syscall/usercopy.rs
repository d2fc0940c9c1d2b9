//! Validated, fault-recoverable access to user memory from syscall context.
//!
//! Kernel code must never trust a user-supplied address: the range is
//! checked against the user window first, and the actual copy runs with the
//! per-CPU recovery hook armed. A page fault inside the copy then aborts
//! the system call and reflects the trap to the parent using the *user's*
//! saved frame — from the parent's point of view the child's `int`
//! instruction itself faulted.

use pion_core::arch::x86::structures::trapframe::TrapFrame;
use pion_core::layout;

use crate::percpu;
use crate::proc;
use crate::trap::T_PGFLT;

/// Reflects `trapno` to the parent as if the user's trap instruction had
/// caused it: the saved frame keeps its original instruction pointer.
pub fn systrap(utf: &mut TrapFrame, trapno: u32, err: u32) -> ! {
    utf.trapno = trapno;
    utf.err = err;
    proc::reflect(utf, 0)
}

/// Recovery handler armed around user-memory copies. `data` carries the
/// user's frame; the kernel-side frame supplies the trap cause.
fn copy_recover(ktf: &mut TrapFrame, data: usize) -> ! {
    percpu::current_cpu().clear_recovery();
    // The syscall path holds no spinlocks across user copies (the process
    // lock is released before any copy), so nothing to release here.
    //
    // SAFETY: `data` is the user frame pointer armed by `usercopy` on this
    // CPU; it outlives the copy it guards.
    let utf = unsafe { &mut *(data as *mut TrapFrame) };
    systrap(utf, ktf.trapno, ktf.err)
}

/// Validates that `[uva, uva + size)` lies entirely in the user window;
/// aborts the syscall with a reflected page fault if not. The check itself
/// cannot wrap: it is phrased against the window bounds.
pub fn check_user_range(utf: &mut TrapFrame, uva: u32, size: u32) {
    if !layout::user_contains_range(uva, size) {
        systrap(utf, T_PGFLT, 0);
    }
}

/// Copies `size` bytes between kernel memory and validated user memory,
/// recovering from faults mid-copy by aborting the syscall.
///
/// `copyout` selects the direction: true writes user memory from `kptr`.
///
/// # Safety
///
/// `kptr` must be valid for `size` bytes in the chosen direction. The user
/// side may fault at any point; that path is handled.
pub unsafe fn usercopy(utf: &mut TrapFrame, copyout: bool, kptr: *mut u8, uva: u32, size: u32) {
    check_user_range(utf, uva, size);

    let cpu = percpu::current_cpu();
    cpu.set_recovery(copy_recover, utf as *mut TrapFrame as usize);

    // SAFETY: The user range was validated; a fault during the access is
    // caught by the armed recovery hook. Kernel side per caller contract.
    unsafe {
        let uptr = uva as usize as *mut u8;
        if copyout {
            core::ptr::copy(kptr, uptr, size as usize);
        } else {
            core::ptr::copy(uptr, kptr, size as usize);
        }
    }

    cpu.clear_recovery();
}
