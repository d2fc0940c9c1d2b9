//! Copy-on-write page fault resolution.
//!
//! The trap dispatcher hands every page fault here first. A fault on a slot
//! that is logically writable (`SYS_WRITE` set) but hardware write-protected
//! is the copy-on-write signal: the resolver materializes a private writable
//! copy and the faulting instruction retries, invisibly to the process.
//! Anything else is left for the dispatcher to route onward.

use pion_core::addr::VirtAddr;
use pion_core::arch::x86::structures::paging::{Pte, PteFlags};
use pion_core::layout::{self, PAGE_SIZE};

use super::aspace::AddrSpace;
use super::pmm::FramePool;
use super::tlb;

/// Outcome of [`handle_page_fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    /// The fault was consumed; return to the faulting instruction.
    Resolved,
    /// Not a fault this layer understands; route onward (reflect to the
    /// parent for user mode, recovery hook or panic for kernel mode).
    NotHandled,
}

/// Attempts to resolve a page fault at `fva` against `aspace`.
///
/// Faults outside the user window, on slots without write intent, and
/// encountered when the pool cannot supply a copy frame are all reported as
/// [`FaultResolution::NotHandled`]; the address space is left unchanged in
/// those cases (apart from a possibly demand-allocated page table).
pub fn handle_page_fault(
    pool: &FramePool,
    aspace: &mut AddrSpace,
    fva: u32,
) -> FaultResolution {
    if !layout::user_contains(fva) {
        return FaultResolution::NotHandled;
    }
    let va = VirtAddr::new(fva).align_down(PAGE_SIZE);
    tlb::inval_range(aspace.root(), va, PAGE_SIZE);

    let Some(slot) = aspace.walk(pool, va, true) else {
        return FaultResolution::NotHandled;
    };
    // SAFETY: Slot pointer from walk() on the (single-mutator) handle.
    let pte = unsafe { *slot.as_ref() };
    let flags = pte.flags();

    // Only a write-protected slot with nominal write permission is ours.
    if flags.contains(PteFlags::WRITABLE) || !flags.contains(PteFlags::SYS_WRITE) {
        return FaultResolution::NotHandled;
    }

    let frame = pte.addr();
    let resolved_flags = (flags | PteFlags::WRITABLE | PteFlags::PRESENT) - PteFlags::SYS_RW;

    if frame == pool.zero_frame() || pool.refcount(frame) > 1 {
        // Shared (or the zero frame): copy into a private frame.
        let Some(private) = pool.alloc() else {
            return FaultResolution::NotHandled;
        };
        // SAFETY: `private` is fresh and unmapped; `frame` stays intact.
        unsafe { pool.copy_frame(frame, private) };
        pool.incref(private);
        if frame != pool.zero_frame() && pool.decref(frame) == 0 {
            pool.free(frame);
        }
        // SAFETY: Writing the slot obtained above.
        unsafe { *slot.as_ptr() = Pte::new(private, resolved_flags) };
    } else {
        // Sole owner: the protection was left over from an earlier share.
        // SAFETY: Writing the slot obtained above.
        unsafe { *slot.as_ptr() = pte.with_flags(resolved_flags) };
    }

    FaultResolution::Resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::testpool::new_pool;
    use pion_core::layout::VM_USERLO;

    fn ulo() -> VirtAddr {
        layout::user_lo()
    }

    fn write_page(pool: &FramePool, frame: pion_core::addr::PhysAddr, byte: u8) {
        unsafe { core::ptr::write_bytes(pool.frame_ptr(frame), byte, PAGE_SIZE as usize) };
    }

    fn read_byte(pool: &FramePool, frame: pion_core::addr::PhysAddr) -> u8 {
        unsafe { *pool.frame_ptr(frame) }
    }

    #[test]
    fn fault_outside_user_window_not_handled() {
        let pool = new_pool(64);
        let mut pd = AddrSpace::new_boot(&pool).unwrap();
        assert_eq!(
            handle_page_fault(&pool, &mut pd, 0x1000),
            FaultResolution::NotHandled
        );
        assert_eq!(
            handle_page_fault(&pool, &mut pd, VM_USERLO - 4),
            FaultResolution::NotHandled
        );
    }

    #[test]
    fn fault_without_write_intent_not_handled() {
        let pool = new_pool(64);
        let mut pd = AddrSpace::new_boot(&pool).unwrap();
        // Read-only grant: a write fault on it is genuine.
        pd.set_perm(&pool, ulo(), PAGE_SIZE, PteFlags::SYS_READ).unwrap();
        assert_eq!(
            handle_page_fault(&pool, &mut pd, VM_USERLO),
            FaultResolution::NotHandled
        );
    }

    #[test]
    fn zero_fill_on_first_write() {
        let pool = new_pool(64);
        let mut pd = AddrSpace::new_boot(&pool).unwrap();
        pd.set_perm(&pool, ulo(), PAGE_SIZE, PteFlags::SYS_RW).unwrap();

        // Faulting address may be anywhere in the page.
        assert_eq!(
            handle_page_fault(&pool, &mut pd, VM_USERLO + 0x123),
            FaultResolution::Resolved
        );
        let pte = pd.lookup(&pool, ulo());
        assert_ne!(pte.addr(), pool.zero_frame());
        assert!(pte.flags().contains(PteFlags::PRESENT | PteFlags::WRITABLE));
        // Materialized: the nominal bookkeeping is cleared.
        assert!(!pte.flags().intersects(PteFlags::SYS_RW));
        assert_eq!(pool.refcount(pte.addr()), 1);
        // The private copy starts as a copy of the zero frame.
        assert_eq!(read_byte(&pool, pte.addr()), 0);
    }

    #[test]
    fn cow_split_of_shared_frame() {
        let pool = new_pool(64);
        let mut pd = AddrSpace::new_boot(&pool).unwrap();
        let shared = pool.alloc().unwrap();
        write_page(&pool, shared, 0xAA);

        // Map the frame twice, read-shared with write intent — the state
        // copy_range leaves both sides in.
        let flags = PteFlags::USER | PteFlags::SYS_RW;
        pd.insert(&pool, shared, ulo(), flags).unwrap();
        pd.insert(&pool, shared, ulo() + PAGE_SIZE, flags).unwrap();
        assert_eq!(pool.refcount(shared), 2);

        assert_eq!(
            handle_page_fault(&pool, &mut pd, VM_USERLO),
            FaultResolution::Resolved
        );

        let private = pd.lookup(&pool, ulo()).addr();
        assert_ne!(private, shared);
        assert_eq!(pool.refcount(private), 1);
        assert_eq!(pool.refcount(shared), 1);
        // Contents were carried over; the other mapping is untouched.
        assert_eq!(read_byte(&pool, private), 0xAA);
        assert_eq!(pd.lookup(&pool, ulo() + PAGE_SIZE).addr(), shared);
    }

    #[test]
    fn sole_owner_write_enables_in_place() {
        let pool = new_pool(64);
        let mut pd = AddrSpace::new_boot(&pool).unwrap();
        let frame = pool.alloc().unwrap();
        write_page(&pool, frame, 0x5A);
        pd.insert(&pool, frame, ulo(), PteFlags::USER | PteFlags::SYS_RW)
            .unwrap();
        assert_eq!(pool.refcount(frame), 1);
        let free_before = pool.free_frames();

        assert_eq!(
            handle_page_fault(&pool, &mut pd, VM_USERLO),
            FaultResolution::Resolved
        );
        let pte = pd.lookup(&pool, ulo());
        // No copy: same frame, now hardware-writable.
        assert_eq!(pte.addr(), frame);
        assert!(pte.flags().contains(PteFlags::WRITABLE));
        assert_eq!(pool.free_frames(), free_before);
    }

    #[test]
    fn fault_with_exhausted_pool_not_handled() {
        let pool = new_pool(64);
        let mut pd = AddrSpace::new_boot(&pool).unwrap();
        pd.set_perm(&pool, ulo(), PAGE_SIZE, PteFlags::SYS_RW).unwrap();
        let stolen = pool.take_free_list();
        assert_eq!(
            handle_page_fault(&pool, &mut pd, VM_USERLO),
            FaultResolution::NotHandled
        );
        pool.put_free_list(stolen);
    }

    #[test]
    fn already_writable_fault_not_handled() {
        // A fault on a writable mapping is not a COW fault (e.g. a user
        // touched someone else's page through a stale pointer).
        let pool = new_pool(64);
        let mut pd = AddrSpace::new_boot(&pool).unwrap();
        let frame = pool.alloc().unwrap();
        pd.insert(&pool, frame, ulo(), PteFlags::USER | PteFlags::WRITABLE)
            .unwrap();
        assert_eq!(
            handle_page_fault(&pool, &mut pd, VM_USERLO),
            FaultResolution::NotHandled
        );
    }
}
