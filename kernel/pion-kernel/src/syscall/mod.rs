//! System call dispatch.
//!
//! Decodes the command word and routes to the four calls. The interesting
//! part for the VM core is the memory-operation plumbing: `PUT`/`GET`
//! translate their `ZERO`/`COPY`/`MERGE`/`SNAP`/`PERM` flags into the
//! page-table engine, and every user buffer goes through the validated,
//! fault-recoverable [`usercopy`] path. Parent/child rendezvous, start,
//! and migration are control transfers into the process collaborator.

pub mod abi;
pub mod usercopy;

use pion_core::addr::VirtAddr;
use pion_core::layout::{self, VM_USERHI, VM_USERLO};

use crate::mm::{merge, FramePool, VmError};
use crate::proc::{CpuState, Process};
use abi::SysFlags;

#[cfg(target_arch = "x86")]
pub use entry::syscall;

/// Applies the memory-operation flags of a `PUT`: the parent pushes state
/// *into* the child. `ZERO` clears the child's destination range (and wins
/// over `COPY` when both bits ride in, matching the wire encoding where
/// `MERGE` is only meaningful on `GET`); `COPY` lazily copies parent source
/// to child destination; `PERM` adjusts the child's nominal permissions;
/// `SNAP` records the child's entire user window into its reference
/// snapshot.
pub(crate) fn put_memop(
    pool: &FramePool,
    parent: &mut Process,
    child: &mut Process,
    flags: SysFlags,
    sva: u32,
    dva: u32,
    size: u32,
) -> Result<(), VmError> {
    let memop = flags & SysFlags::MEMOP;
    if memop.contains(SysFlags::ZERO) {
        child.aspace.remove(pool, VirtAddr::new(dva), size);
    } else if memop.contains(SysFlags::COPY) {
        merge::copy_range(
            pool,
            &mut parent.aspace,
            VirtAddr::new(sva),
            &mut child.aspace,
            VirtAddr::new(dva),
            size,
        )?;
    }

    if flags.contains(SysFlags::PERM) {
        child
            .aspace
            .set_perm(pool, VirtAddr::new(dva), size, flags.nominal_perm())?;
    }

    if flags.contains(SysFlags::SNAP) {
        let Process {
            aspace, snapshot, ..
        } = child;
        merge::copy_range(
            pool,
            aspace,
            layout::user_lo(),
            snapshot,
            layout::user_lo(),
            VM_USERHI - VM_USERLO,
        )?;
    }
    Ok(())
}

/// Applies the memory-operation flags of a `GET`: the parent pulls state
/// *out of* the child. Both memory bits together ask for the three-way
/// merge of the child against its snapshot; otherwise `ZERO` and `COPY`
/// mirror the `PUT` forms with the roles reversed. `PERM` adjusts the
/// parent's own range.
pub(crate) fn get_memop(
    pool: &FramePool,
    parent: &mut Process,
    child: &mut Process,
    flags: SysFlags,
    sva: u32,
    dva: u32,
    size: u32,
) -> Result<(), VmError> {
    let memop = flags & SysFlags::MEMOP;
    if memop == SysFlags::MERGE {
        let Process {
            aspace, snapshot, ..
        } = child;
        merge::merge(
            pool,
            snapshot,
            aspace,
            VirtAddr::new(sva),
            &mut parent.aspace,
            VirtAddr::new(dva),
            size,
        )?;
    } else if memop.contains(SysFlags::ZERO) {
        parent.aspace.remove(pool, VirtAddr::new(dva), size);
    } else if memop.contains(SysFlags::COPY) {
        merge::copy_range(
            pool,
            &mut child.aspace,
            VirtAddr::new(sva),
            &mut parent.aspace,
            VirtAddr::new(dva),
            size,
        )?;
    }

    if flags.contains(SysFlags::PERM) {
        parent
            .aspace
            .set_perm(pool, VirtAddr::new(dva), size, flags.nominal_perm())?;
    }
    Ok(())
}

/// Clamps a user-supplied register block to what user code may set: the
/// arithmetic flags and DF, nothing privileged.
pub(crate) fn sanitize_user_state(state: &mut CpuState) {
    use pion_core::arch::x86::registers::eflags::EFlags;
    state.tf.eflags &= EFlags::USER_MODIFIABLE.bits();
}

#[cfg(target_arch = "x86")]
mod entry {
    use super::abi::{decode, SysCall, SysFlags, CPUTS_MAX};
    use super::usercopy::{systrap, usercopy};
    use super::*;
    use crate::mm::{aspace, pmm};
    use crate::proc::{self, ProcState};
    use crate::trap::{trap_return, T_GPFLT, T_PGFLT};
    use core::ptr::NonNull;
    use pion_core::arch::x86::structures::trapframe::TrapFrame;
    use pion_core::{kprint, kwarn};

    /// Entry from the trap dispatcher for the syscall vector.
    pub fn syscall(tf: &mut TrapFrame) -> ! {
        let (call, flags) = decode(tf.regs.eax);
        match call {
            SysCall::Cputs => do_cputs(tf),
            SysCall::Put => do_put(tf, flags),
            SysCall::Get => do_get(tf, flags),
            SysCall::Ret => do_ret(tf),
        }
    }

    fn do_cputs(tf: &mut TrapFrame) -> ! {
        let mut buf = [0u8; CPUTS_MAX + 1];
        // SAFETY: `buf` holds CPUTS_MAX bytes; faults abort the syscall.
        unsafe { usercopy(tf, false, buf.as_mut_ptr(), tf.regs.ebx, CPUTS_MAX as u32) };
        buf[CPUTS_MAX] = 0;

        let len = buf.iter().position(|&b| b == 0).unwrap_or(CPUTS_MAX);
        match core::str::from_utf8(&buf[..len]) {
            Ok(s) => kprint!("{s}"),
            // Print the valid prefix of a malformed string.
            Err(e) => {
                let valid = e.valid_up_to();
                // SAFETY: valid_up_to() bounds the well-formed prefix.
                kprint!("{}", unsafe {
                    core::str::from_utf8_unchecked(&buf[..valid])
                });
            }
        }
        trap_return(tf)
    }

    /// Routes execution to the node this call addresses, if it is not the
    /// one we are on: an explicit node number wins, otherwise the
    /// process's home.
    fn route_to_node(tf: &mut TrapFrame, cur: &Process, node: u8) {
        if node != proc::net_node() {
            if node != 0 {
                proc::migrate(tf, node);
            } else if cur.home_node != proc::net_node() {
                proc::migrate(tf, cur.home_node);
            }
        }
    }

    /// Looks up (or for `PUT`, creates) the child and waits for it to reach
    /// a rendezvous point. Returns the child pointer with the parent's lock
    /// already released.
    fn stopped_child(
        tf: &mut TrapFrame,
        curp: NonNull<Process>,
        childno: usize,
        create: bool,
    ) -> NonNull<Process> {
        // SAFETY: The current-process pointer is valid for this trap; this
        // CPU is its single mutator, and no other reference is live here.
        let cur = unsafe { &mut *curp.as_ptr() };
        let guard = cur.lock.lock();

        if cur.children[childno].is_none() {
            if !create {
                drop(guard);
                systrap(tf, T_GPFLT, 0);
            }
            let child = pmm::with_pool(|pool| Process::alloc(pool, &aspace::boot_template()));
            match child {
                Some(c) => cur.children[childno] = Some(c),
                None => {
                    drop(guard);
                    kwarn!("syscall: no memory for child {childno}");
                    systrap(tf, T_PGFLT, 0);
                }
            }
        }
        let childp = cur.children[childno].unwrap();

        // SAFETY: Child records outlive their parent's table entry.
        if unsafe { childp.as_ref() }.state != ProcState::Stop {
            drop(guard);
            // Parks this process; the scheduler re-runs the whole syscall
            // when the child stops.
            proc::wait_child(curp, childno, tf);
        }
        drop(guard);
        childp
    }

    fn do_put(tf: &mut TrapFrame, flags: SysFlags) -> ! {
        let childno = (tf.regs.edx & 0xFF) as usize;
        let node = ((tf.regs.edx >> 8) & 0xFF) as u8;

        let Some(curp) = proc::current() else {
            systrap(tf, T_GPFLT, 0);
        };
        // SAFETY: Valid for this trap; dropped before any &mut derivation.
        route_to_node(tf, unsafe { curp.as_ref() }, node);

        let childp = stopped_child(tf, curp, childno, true);
        // SAFETY: Parent and child are distinct records; the child is
        // stopped, so this CPU is the single mutator of both.
        let cur = unsafe { &mut *curp.as_ptr() };
        let child = unsafe { &mut *childp.as_ptr() };

        if flags.contains(SysFlags::REGS) {
            let dst = &mut child.saved as *mut CpuState as *mut u8;
            // SAFETY: `dst` covers a full CpuState in the child record.
            unsafe {
                usercopy(
                    tf,
                    false,
                    dst,
                    tf.regs.ebx,
                    core::mem::size_of::<CpuState>() as u32,
                )
            };
            sanitize_user_state(&mut child.saved);
        }

        let (sva, dva, size) = (tf.regs.esi, tf.regs.edi, tf.regs.ecx);
        let memop = flags & SysFlags::MEMOP;
        if memop.contains(SysFlags::ZERO) {
            super::usercopy::check_user_range(tf, dva, size);
        } else if memop.contains(SysFlags::COPY) {
            super::usercopy::check_user_range(tf, sva, size);
            super::usercopy::check_user_range(tf, dva, size);
        }

        let result =
            pmm::with_pool(|pool| put_memop(pool, cur, child, flags, sva, dva, size));
        if let Err(err) = result {
            kwarn!("syscall: put memory operation failed: {err}");
            systrap(tf, T_PGFLT, 0);
        }

        if flags.contains(SysFlags::START) {
            proc::ready(childp);
        }
        trap_return(tf)
    }

    fn do_get(tf: &mut TrapFrame, flags: SysFlags) -> ! {
        let childno = (tf.regs.edx & 0xFF) as usize;
        let node = ((tf.regs.edx >> 8) & 0xFF) as u8;

        let Some(curp) = proc::current() else {
            systrap(tf, T_GPFLT, 0);
        };
        // SAFETY: Valid for this trap; dropped before any &mut derivation.
        route_to_node(tf, unsafe { curp.as_ref() }, node);

        let childp = stopped_child(tf, curp, childno, false);
        // SAFETY: Parent and child are distinct records; the child is
        // stopped, so this CPU is the single mutator of both.
        let cur = unsafe { &mut *curp.as_ptr() };
        let child = unsafe { &mut *childp.as_ptr() };

        if flags.contains(SysFlags::REGS) {
            let src = &mut child.saved as *mut CpuState as *mut u8;
            // SAFETY: `src` covers a full CpuState in the child record.
            unsafe {
                usercopy(
                    tf,
                    true,
                    src,
                    tf.regs.ebx,
                    core::mem::size_of::<CpuState>() as u32,
                )
            };
        }

        let (sva, dva, size) = (tf.regs.esi, tf.regs.edi, tf.regs.ecx);
        let memop = flags & SysFlags::MEMOP;
        if memop != SysFlags::MERGE {
            if memop.contains(SysFlags::ZERO) {
                super::usercopy::check_user_range(tf, dva, size);
            } else if memop.contains(SysFlags::COPY) {
                super::usercopy::check_user_range(tf, sva, size);
                super::usercopy::check_user_range(tf, dva, size);
            }
        }

        let result =
            pmm::with_pool(|pool| get_memop(pool, cur, child, flags, sva, dva, size));
        if let Err(err) = result {
            kwarn!("syscall: get memory operation failed: {err}");
            systrap(tf, T_PGFLT, 0);
        }
        trap_return(tf)
    }

    fn do_ret(tf: &mut TrapFrame) -> ! {
        if let Some(curp) = proc::current() {
            // SAFETY: Valid for this trap.
            let home = unsafe { curp.as_ref() }.home_node;
            if home != proc::net_node() {
                proc::migrate(tf, home);
            }
        }
        proc::reflect(tf, 1)
    }
}
