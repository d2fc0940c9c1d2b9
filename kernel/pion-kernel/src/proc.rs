//! Process records and the scheduler collaborator seam.
//!
//! The VM core needs very little from the process layer: the record that
//! owns a process's address space and reference snapshot, and a handful of
//! control transfers (reflect a trap to the parent, park a waiting parent,
//! mark a child runnable, migrate). Scheduling, rendezvous, and migration
//! proper live outside the core and register themselves here at boot; the
//! defaults either report "no process" or panic, which keeps the core
//! runnable in early boot and in the self-tests.

use core::ptr::NonNull;

use pion_core::arch::x86::structures::trapframe::TrapFrame;
use pion_core::sync::SpinLock;

use crate::mm::{AddrSpace, FramePool};
use pion_core::layout::PAGE_SIZE;

/// Children per process (indexed by the low byte of the syscall's child
/// argument).
pub const MAX_CHILDREN: usize = 256;

/// Run state, owned by the scheduler; the syscall path only reads it to
/// decide whether a child is at a rendezvous point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ProcState {
    /// Stopped at a rendezvous point; parent may inspect and modify.
    Stop,
    /// Queued to run.
    Ready,
    /// Executing on some CPU.
    Running,
    /// Parent waiting on a child.
    Waiting,
}

/// The register block transferred by the `REGS` syscall flag.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct CpuState {
    /// Saved user-visible registers.
    pub tf: TrapFrame,
}

/// A process record. Lives in a single frame from the pool; one page is
/// plenty and keeps process allocation independent of any kernel heap.
pub struct Process {
    /// Guards `state` and `children` across parent/child rendezvous.
    /// Released before any user-memory copy.
    pub lock: SpinLock<()>,
    /// Run state (see [`ProcState`]).
    pub state: ProcState,
    /// Node this process calls home; traps reflect there.
    pub home_node: u8,
    /// The process's address space.
    pub aspace: AddrSpace,
    /// Reference snapshot the merge operation diffs against.
    pub snapshot: AddrSpace,
    /// Saved register block for `PUT`/`GET` with `REGS`.
    pub saved: CpuState,
    /// Child table.
    pub children: [Option<NonNull<Process>>; MAX_CHILDREN],
}

impl Process {
    /// Allocates a process record in a pool frame, with a fresh address
    /// space and snapshot directory cloned from `template`.
    ///
    /// Returns `None` (with everything unwound) if the pool runs dry.
    pub fn alloc(pool: &FramePool, template: &AddrSpace) -> Option<NonNull<Process>> {
        const {
            assert!(
                core::mem::size_of::<Process>() <= PAGE_SIZE as usize,
                "Process must fit in one frame"
            );
        }

        let frame = pool.alloc()?;
        pool.incref(frame);

        let Some(aspace) = AddrSpace::new_user(pool, template) else {
            release_frame(pool, frame);
            return None;
        };
        let Some(snapshot) = AddrSpace::new_user(pool, template) else {
            aspace.destroy(pool);
            release_frame(pool, frame);
            return None;
        };

        let ptr = pool.frame_ptr(frame) as *mut Process;
        // SAFETY: A fresh, exclusively owned frame large enough for the
        // record (checked above).
        unsafe {
            ptr.write(Process {
                lock: SpinLock::new(()),
                state: ProcState::Stop,
                home_node: 0,
                aspace,
                snapshot,
                saved: CpuState {
                    tf: TrapFrame::empty(),
                },
                children: [None; MAX_CHILDREN],
            });
        }
        NonNull::new(ptr)
    }

    /// Frees a process record: both directories, then the record frame.
    /// The scheduler tears down children first.
    ///
    /// # Safety
    ///
    /// `proc` must have come from [`Process::alloc`] on this pool and have
    /// no remaining users.
    pub unsafe fn free(proc: NonNull<Process>, pool: &FramePool) {
        // SAFETY: Caller guarantees exclusive ownership.
        let record = unsafe { proc.as_ptr().read() };
        record.aspace.destroy(pool);
        record.snapshot.destroy(pool);
        release_frame(pool, pool.ptr_to_phys(proc.as_ptr() as *mut u8));
    }
}

fn release_frame(pool: &FramePool, frame: pion_core::addr::PhysAddr) {
    if pool.decref(frame) == 0 {
        pool.free(frame);
    }
}

// ---------------------------------------------------------------------------
// Scheduler hooks
// ---------------------------------------------------------------------------

/// Control-transfer callbacks registered by the process/scheduler layer.
#[derive(Clone, Copy)]
pub struct SchedHooks {
    /// The process running on this CPU, if any.
    pub current: fn() -> Option<NonNull<Process>>,
    /// Reflects the saved frame to the parent as the visible trap cause;
    /// `code` distinguishes voluntary returns from faults.
    pub reflect: fn(&mut TrapFrame, i32) -> !,
    /// Parks the parent until child `childno` reaches a rendezvous point.
    pub wait_child: fn(NonNull<Process>, usize, &mut TrapFrame) -> !,
    /// Marks a stopped child runnable.
    pub ready: fn(NonNull<Process>),
    /// Gives up the CPU after a timer tick from user mode.
    pub yield_to: fn(&mut TrapFrame) -> !,
    /// Moves the process (with the saved frame) to another node.
    pub migrate: fn(&mut TrapFrame, u8) -> !,
    /// This node's number (0 when networking is absent).
    pub net_node: fn() -> u8,
}

static HOOKS: SpinLock<Option<SchedHooks>> = SpinLock::new(None);

/// Registers the process-layer callbacks. Boot, once.
pub fn register_hooks(hooks: SchedHooks) {
    *HOOKS.lock() = Some(hooks);
}

fn hooks() -> Option<SchedHooks> {
    *HOOKS.lock()
}

/// The process running on this CPU, or `None` before the process layer is
/// up (early boot, self-tests).
pub fn current() -> Option<NonNull<Process>> {
    hooks().and_then(|h| (h.current)())
}

/// Reflects `tf` to the current process's parent. Diverges.
pub fn reflect(tf: &mut TrapFrame, code: i32) -> ! {
    match hooks() {
        Some(h) => (h.reflect)(tf, code),
        None => panic!("trap reflection with no process layer registered"),
    }
}

/// Parks the parent until the child stops. Diverges.
pub fn wait_child(parent: NonNull<Process>, childno: usize, tf: &mut TrapFrame) -> ! {
    match hooks() {
        Some(h) => (h.wait_child)(parent, childno, tf),
        None => panic!("child wait with no process layer registered"),
    }
}

/// Marks a stopped child runnable.
pub fn ready(child: NonNull<Process>) {
    if let Some(h) = hooks() {
        (h.ready)(child);
    }
}

/// Yields the CPU on behalf of the interrupted user context. Diverges.
pub fn yield_to(tf: &mut TrapFrame) -> ! {
    match hooks() {
        Some(h) => (h.yield_to)(tf),
        None => panic!("yield with no process layer registered"),
    }
}

/// Migrates the current process to `node`. Diverges.
pub fn migrate(tf: &mut TrapFrame, node: u8) -> ! {
    match hooks() {
        Some(h) => (h.migrate)(tf, node),
        None => panic!("migration with no process layer registered"),
    }
}

/// This node's number.
pub fn net_node() -> u8 {
    hooks().map_or(0, |h| (h.net_node)())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::testpool::new_pool;

    #[test]
    fn record_fits_one_frame() {
        assert!(core::mem::size_of::<Process>() <= PAGE_SIZE as usize);
    }

    #[test]
    fn alloc_builds_independent_directories() {
        let pool = new_pool(64);
        let template = AddrSpace::new_boot(&pool).unwrap();
        let proc = Process::alloc(&pool, &template).unwrap();
        // SAFETY: Freshly allocated, exclusively owned.
        let record = unsafe { proc.as_ref() };
        assert_eq!(record.state, ProcState::Stop);
        assert_ne!(record.aspace.root(), record.snapshot.root());
        assert_ne!(record.aspace.root(), template.root());
        assert!(record.children.iter().all(|c| c.is_none()));
    }

    #[test]
    fn alloc_unwinds_on_exhaustion() {
        // A pool with frames for the record but not for both directories.
        let pool = new_pool(8);
        let template = AddrSpace::new_boot(&pool).unwrap();
        // 6 allocatable - 1 (template) = 5 left; record + 2 dirs = 3 fit,
        // so shrink further by stealing all but two frames.
        let held: Vec<_> = (0..3).map(|_| pool.alloc().unwrap()).collect();
        assert!(Process::alloc(&pool, &template).is_none());
        // Nothing leaked: the frames taken during the attempt came back.
        assert_eq!(pool.free_frames(), 2);
        for f in held {
            pool.free(f);
        }
    }

    #[test]
    fn free_releases_record_and_directories() {
        let pool = new_pool(64);
        let template = AddrSpace::new_boot(&pool).unwrap();
        let before = pool.free_frames();
        let proc = Process::alloc(&pool, &template).unwrap();
        assert_eq!(pool.free_frames(), before - 3);
        // SAFETY: Sole owner.
        unsafe { Process::free(proc, &pool) };
        assert_eq!(pool.free_frames(), before);
    }

    #[test]
    fn default_hooks() {
        // Before the process layer registers, the core sees no current
        // process and node 0; control transfers would panic instead of
        // jumping through null.
        assert!(current().is_none());
        assert_eq!(net_node(), 0);
    }
}
