//! Lazy address-space copy and three-way merge.
//!
//! [`copy_range`] duplicates a 4 MiB-aligned range between two directories
//! without copying page contents: both sides end up referencing the same
//! frames read-only with `SYS_WRITE` recording the original write
//! permission, so the first write on either side lands in the
//! copy-on-write resolver.
//!
//! [`merge`] folds the changes a source space made since a reference
//! snapshot into a destination space. Unchanged tables are skipped by
//! directory-entry comparison; pages changed on one side only are adopted
//! by sharing; pages changed on both sides are merged word by word, with
//! a three-way disagreement on any 32-bit word dropping the whole page.

use core::ptr::NonNull;

use pion_core::addr::VirtAddr;
use pion_core::arch::x86::structures::paging::{Pte, PteFlags};
use pion_core::kwarn;
use pion_core::layout::{self, NPT_ENTRIES, PAGE_SIZE, PTAB_SPAN};

use super::aspace::AddrSpace;
use super::pmm::FramePool;
use super::{tlb, VmError};

fn assert_transfer_args(sva: VirtAddr, dva: VirtAddr, size: u32) {
    assert!(layout::ptab_aligned(sva.as_u32()), "source not 4 MiB aligned");
    assert!(layout::ptab_aligned(dva.as_u32()), "dest not 4 MiB aligned");
    assert!(layout::ptab_aligned(size), "size not 4 MiB aligned");
    assert!(layout::user_contains_range(sva.as_u32(), size));
    assert!(layout::user_contains_range(dva.as_u32(), size));
}

/// Virtually copies `[sva, sva + size)` of `src` onto `[dva, dva + size)`
/// of `dst` using copy-on-write.
///
/// Every non-empty source entry is write-protected in place (hardware
/// writable cleared, `SYS_WRITE` recording the intent) and gains one
/// reference; the destination receives a bit-copy of each source table.
/// The destination range is assumed empty — callers unmap it first if it
/// might not be (this matches the syscall protocol, which zeroes before
/// copying).
///
/// On allocation failure the already-processed prefix is left in place and
/// the caller is expected to unwind by tearing down the destination range.
pub fn copy_range(
    pool: &FramePool,
    src: &mut AddrSpace,
    sva: VirtAddr,
    dst: &mut AddrSpace,
    dva: VirtAddr,
    size: u32,
) -> Result<(), VmError> {
    assert_transfer_args(sva, dva, size);
    tlb::inval_range(src.root(), sva, size);
    tlb::inval_range(dst.root(), dva, size);

    let mut off = 0;
    while off < size {
        let spde = src.pde(pool, sva + off);
        let dpde_slot = dst.pde_slot(pool, dva + off);

        if spde.addr() == pool.zero_frame() {
            // Nothing mapped under this directory entry; the destination
            // becomes logically empty the same way.
            // SAFETY: Directory slot of the (single-mutator) dst handle.
            unsafe { *dpde_slot.as_ptr() = spde };
            off += PTAB_SPAN;
            continue;
        }

        let table = pool.alloc().ok_or(VmError::OutOfMemory)?;
        let stable = pool.table_ptr(spde.addr());
        for i in 0..NPT_ENTRIES {
            // SAFETY: src is the single mutator of its tables.
            let entry = unsafe { &mut (*stable).entries[i] };
            if entry.addr() == pool.zero_frame() {
                continue;
            }
            let mut flags = entry.flags() | PteFlags::SYS_READ;
            if flags.intersects(PteFlags::WRITABLE | PteFlags::SYS_WRITE) {
                flags = (flags - PteFlags::WRITABLE) | PteFlags::SYS_WRITE;
            }
            *entry = Pte::new(entry.addr(), flags);
            pool.incref(entry.addr());
        }

        // Bit-copy the now write-protected table; both sides share every
        // frame read-only from here on.
        // SAFETY: `table` is fresh; the source table is a valid frame.
        unsafe { pool.copy_frame(spde.addr(), table) };
        pool.incref(table);
        // SAFETY: Directory slot of the dst handle.
        unsafe { *dpde_slot.as_ptr() = Pte::new(table, spde.flags()) };

        off += PTAB_SPAN;
    }
    Ok(())
}

/// Merges the changes `src` made relative to the snapshot `snap` into
/// `dst`, over the 4 MiB-aligned range `[sva, sva + size)` / `[dva, ...)`.
///
/// Adopting a page that only the source changed write-protects the source
/// entry as a side effect: both spaces then share the page copy-on-write,
/// exactly as after [`copy_range`].
pub fn merge(
    pool: &FramePool,
    snap: &AddrSpace,
    src: &mut AddrSpace,
    sva: VirtAddr,
    dst: &mut AddrSpace,
    dva: VirtAddr,
    size: u32,
) -> Result<(), VmError> {
    assert_transfer_args(sva, dva, size);
    tlb::inval_range(src.root(), sva, size);
    tlb::inval_range(dst.root(), dva, size);

    let mut off = 0;
    while off < size {
        // A directory entry equal to the snapshot's means the whole 4 MiB
        // region is untouched.
        if src.pde(pool, sva + off) == snap.pde(pool, sva + off) {
            off += PTAB_SPAN;
            continue;
        }

        let chunk_end = off + PTAB_SPAN;
        while off < chunk_end {
            let s_va = sva + off;
            let d_va = dva + off;
            let rv = snap.lookup(pool, s_va);
            let sv = src.lookup(pool, s_va);
            let dv = dst.lookup(pool, d_va);
            off += PAGE_SIZE;

            if sv == rv && dv == rv {
                continue;
            }

            if dv == rv && sv != rv {
                adopt_source_page(pool, src, s_va, sv, dst, d_va, dv)?;
                continue;
            }

            // Changed on both sides.
            let dslot = dst.walk(pool, d_va, true).ok_or(VmError::OutOfMemory)?;
            merge_page(pool, rv, sv, dslot, d_va)?;
        }
    }
    Ok(())
}

/// Adopts a page changed only at the source: the destination drops its
/// frame and shares the source's, both sides read-only.
fn adopt_source_page(
    pool: &FramePool,
    src: &mut AddrSpace,
    s_va: VirtAddr,
    sv: Pte,
    dst: &mut AddrSpace,
    d_va: VirtAddr,
    dv: Pte,
) -> Result<(), VmError> {
    let dslot = dst.walk(pool, d_va, true).ok_or(VmError::OutOfMemory)?;

    if dv.addr() != pool.zero_frame() && pool.decref(dv.addr()) == 0 {
        pool.free(dv.addr());
    }

    let adopted = if sv.addr() == pool.zero_frame() {
        // The source reverted to (or stayed at) an empty-style entry;
        // nothing to share or protect.
        sv
    } else {
        pool.incref(sv.addr());
        let mut flags = sv.flags();
        if flags.intersects(PteFlags::WRITABLE | PteFlags::SYS_WRITE) {
            flags = (flags - PteFlags::WRITABLE) | PteFlags::SYS_WRITE;
        }
        let shared = Pte::new(sv.addr(), flags);
        // Write-protect the source side as well; its next write re-splits.
        if let Some(sslot) = src.walk(pool, s_va, false) {
            // SAFETY: Slot of the (single-mutator) src handle.
            unsafe { *sslot.as_ptr() = shared };
        }
        shared
    };

    // SAFETY: Slot of the dst handle.
    unsafe { *dslot.as_ptr() = adopted };
    Ok(())
}

/// Merges one page that changed on both sides, word by word.
///
/// A word where the destination still matches the reference takes the
/// source's value; a word all three disagree on is a conflict — the
/// destination page is dropped to the canonical empty entry and both
/// sides' changes to it are discarded.
fn merge_page(
    pool: &FramePool,
    rv: Pte,
    sv: Pte,
    dslot: NonNull<Pte>,
    d_va: VirtAddr,
) -> Result<(), VmError> {
    // SAFETY: Slot pointer provided by the caller's walk().
    let mut dv = unsafe { *dslot.as_ref() };
    let dflags = dv.flags();

    // A read-shared destination must be broken into a private copy before
    // any word is written.
    if dflags.contains(PteFlags::PRESENT | PteFlags::SYS_WRITE)
        && !dflags.contains(PteFlags::WRITABLE)
    {
        if dv.addr() == pool.zero_frame() || pool.refcount(dv.addr()) > 1 {
            let private = pool.alloc().ok_or(VmError::OutOfMemory)?;
            // SAFETY: `private` is fresh and unmapped.
            unsafe { pool.copy_frame(dv.addr(), private) };
            pool.incref(private);
            if dv.addr() != pool.zero_frame() && pool.decref(dv.addr()) == 0 {
                pool.free(dv.addr());
            }
            dv = Pte::new(private, dflags);
        }
        dv = dv.with_flags((dv.flags() | PteFlags::WRITABLE) - PteFlags::SYS_RW);
        // SAFETY: Slot pointer provided by the caller.
        unsafe { *dslot.as_ptr() = dv };
    }

    if !dv.flags().contains(PteFlags::PRESENT | PteFlags::WRITABLE) {
        // The destination deleted or write-revoked the page while the
        // source changed it: irreconcilable intents. Drop the page rather
        // than scribble on a frame we don't own.
        kwarn!("merge: page at {d_va} not mergeable (entry {:#x}), dropping", dv.bits());
        if dv.addr() != pool.zero_frame() && pool.decref(dv.addr()) == 0 {
            pool.free(dv.addr());
        }
        // SAFETY: Slot pointer provided by the caller.
        unsafe { *dslot.as_ptr() = pool.pte_zero() };
        return Ok(());
    }

    let rp = pool.frame_ptr(rv.addr()) as *const u32;
    let sp = pool.frame_ptr(sv.addr()) as *const u32;
    let dp = pool.frame_ptr(dv.addr()) as *mut u32;
    debug_assert!(dv.addr() != pool.zero_frame());

    for i in 0..(PAGE_SIZE / 4) as usize {
        // SAFETY: All three are valid frames; dv is private and writable.
        let (r, s) = unsafe { (*rp.add(i), *sp.add(i)) };
        if r == s {
            continue;
        }
        // SAFETY: As above.
        let d = unsafe { *dp.add(i) };
        if d != r && d != s {
            // Conflict at 32-bit granularity (single-write atomicity on the
            // target): discard the page entirely.
            kwarn!(
                "merge: conflicting write at {d_va}+{:#x}: source {s:#010x} reference {r:#010x} destination {d:#010x}",
                i * 4
            );
            let frame = dv.addr();
            if pool.decref(frame) == 0 {
                pool.free(frame);
            }
            // SAFETY: Slot pointer provided by the caller.
            unsafe { *dslot.as_ptr() = pool.pte_zero() };
            return Ok(());
        }
        if d == r {
            // Unchanged on the destination side: accept the source's word.
            // SAFETY: As above.
            unsafe { *dp.add(i) = s };
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::fault::{handle_page_fault, FaultResolution};
    use crate::mm::testpool::new_pool;
    use pion_core::addr::PhysAddr;
    use pion_core::layout::VM_USERLO;

    fn ulo() -> VirtAddr {
        layout::user_lo()
    }

    fn boot(pool: &FramePool) -> AddrSpace {
        AddrSpace::new_boot(pool).unwrap()
    }

    fn fill_words(pool: &FramePool, frame: PhysAddr, f: impl Fn(usize) -> u32) {
        let ptr = pool.frame_ptr(frame) as *mut u32;
        for i in 0..1024 {
            unsafe { ptr.add(i).write(f(i)) };
        }
    }

    fn word(pool: &FramePool, frame: PhysAddr, i: usize) -> u32 {
        unsafe { *(pool.frame_ptr(frame) as *const u32).add(i) }
    }

    #[test]
    fn copy_shares_frames_read_only() {
        let pool = new_pool(64);
        let mut src = boot(&pool);
        let mut dst = boot(&pool);

        let frame = pool.alloc().unwrap();
        fill_words(&pool, frame, |_| 0xAAAA_AAAA);
        src.insert(&pool, frame, ulo(), PteFlags::USER | PteFlags::WRITABLE)
            .unwrap();

        copy_range(&pool, &mut src, ulo(), &mut dst, ulo(), PTAB_SPAN).unwrap();

        // Both sides reference the frame, read-only with recorded intent.
        for pd in [&src, &dst] {
            let pte = pd.lookup(&pool, ulo());
            assert_eq!(pte.addr(), frame);
            assert!(!pte.flags().contains(PteFlags::WRITABLE));
            assert!(pte.flags().contains(PteFlags::SYS_WRITE | PteFlags::SYS_READ));
        }
        assert_eq!(pool.refcount(frame), 2);

        // The tables are distinct frames with equal contents.
        assert_ne!(src.pde(&pool, ulo()).addr(), dst.pde(&pool, ulo()).addr());
        assert_eq!(pool.refcount(dst.pde(&pool, ulo()).addr()), 1);
    }

    #[test]
    fn copy_of_empty_region_stays_empty() {
        let pool = new_pool(64);
        let mut src = boot(&pool);
        let mut dst = boot(&pool);
        let frames = pool.free_frames();
        copy_range(&pool, &mut src, ulo(), &mut dst, ulo(), 4 * PTAB_SPAN).unwrap();
        // No tables were allocated for empty directory entries.
        assert_eq!(pool.free_frames(), frames);
        assert_eq!(dst.pde(&pool, ulo()), pool.pte_zero());
    }

    #[test]
    fn copy_out_of_memory_reports_failure() {
        let pool = new_pool(64);
        let mut src = boot(&pool);
        let mut dst = boot(&pool);
        let frame = pool.alloc().unwrap();
        src.insert(&pool, frame, ulo(), PteFlags::USER | PteFlags::WRITABLE)
            .unwrap();
        let stolen = pool.take_free_list();
        assert_eq!(
            copy_range(&pool, &mut src, ulo(), &mut dst, ulo(), PTAB_SPAN),
            Err(VmError::OutOfMemory)
        );
        pool.put_free_list(stolen);
    }

    #[test]
    fn cow_round_trip_through_copy_and_fault() {
        // Fill a page with 0xAA, copy the space, write 0xBB on the source
        // side: the fault splits the sharing and the destination still
        // reads 0xAA.
        let pool = new_pool(64);
        let mut src = boot(&pool);
        let mut dst = boot(&pool);

        let frame = pool.alloc().unwrap();
        fill_words(&pool, frame, |_| 0xAAAA_AAAA);
        src.insert(&pool, frame, ulo(), PteFlags::USER | PteFlags::WRITABLE)
            .unwrap();

        copy_range(&pool, &mut src, ulo(), &mut dst, ulo(), PTAB_SPAN).unwrap();

        assert_eq!(
            handle_page_fault(&pool, &mut src, VM_USERLO),
            FaultResolution::Resolved
        );
        let src_frame = src.lookup(&pool, ulo()).addr();
        assert_ne!(src_frame, frame);
        // Simulate the retried store that the resolver returns to.
        unsafe { (pool.frame_ptr(src_frame) as *mut u32).write(0xBBBB_BBBB) };

        assert_eq!(word(&pool, src_frame, 0), 0xBBBB_BBBB);
        assert_eq!(word(&pool, dst.lookup(&pool, ulo()).addr(), 0), 0xAAAA_AAAA);
        assert_eq!(pool.refcount(frame), 1);
        assert_eq!(pool.refcount(src_frame), 1);
    }

    #[test]
    fn merge_skips_unchanged_tables() {
        let pool = new_pool(64);
        let snap = boot(&pool);
        let mut src = boot(&pool);
        let mut dst = boot(&pool);
        let frames = pool.free_frames();
        // Nothing differs anywhere: the whole range is skipped at the
        // directory level and nothing is allocated.
        merge(&pool, &snap, &mut src, ulo(), &mut dst, ulo(), 8 * PTAB_SPAN).unwrap();
        assert_eq!(pool.free_frames(), frames);
    }

    #[test]
    fn merge_adopts_source_only_change() {
        let pool = new_pool(64);
        let snap = boot(&pool);
        let mut src = boot(&pool);
        let mut dst = boot(&pool);

        let frame = pool.alloc().unwrap();
        fill_words(&pool, frame, |i| i as u32);
        src.insert(&pool, frame, ulo(), PteFlags::USER | PteFlags::WRITABLE)
            .unwrap();

        merge(&pool, &snap, &mut src, ulo(), &mut dst, ulo(), PTAB_SPAN).unwrap();

        // Both sides now share the page read-only; writes re-split.
        let spte = src.lookup(&pool, ulo());
        let dpte = dst.lookup(&pool, ulo());
        assert_eq!(spte, dpte);
        assert_eq!(spte.addr(), frame);
        assert!(!spte.flags().contains(PteFlags::WRITABLE));
        assert!(spte.flags().contains(PteFlags::SYS_WRITE));
        assert_eq!(pool.refcount(frame), 2);
    }

    #[test]
    fn merge_combines_disjoint_word_changes() {
        let pool = new_pool(64);
        let snap = boot(&pool); // reference: all pages read as zero

        let mut src = boot(&pool);
        let s_frame = pool.alloc().unwrap();
        fill_words(&pool, s_frame, |i| if i <= 1 { 0xAAAA_AAAA } else { 0 });
        src.insert(&pool, s_frame, ulo(), PteFlags::USER | PteFlags::WRITABLE)
            .unwrap();

        let mut dst = boot(&pool);
        let d_frame = pool.alloc().unwrap();
        fill_words(&pool, d_frame, |i| if i == 2 { 0xBBBB_BBBB } else { 0 });
        dst.insert(&pool, d_frame, ulo(), PteFlags::USER | PteFlags::WRITABLE)
            .unwrap();

        merge(&pool, &snap, &mut src, ulo(), &mut dst, ulo(), PTAB_SPAN).unwrap();

        // Destination ends up with both sides' words; no conflict occurred.
        let merged = dst.lookup(&pool, ulo());
        assert_eq!(merged.addr(), d_frame);
        assert_eq!(word(&pool, d_frame, 0), 0xAAAA_AAAA);
        assert_eq!(word(&pool, d_frame, 1), 0xAAAA_AAAA);
        assert_eq!(word(&pool, d_frame, 2), 0xBBBB_BBBB);
        assert_eq!(word(&pool, d_frame, 3), 0);
    }

    #[test]
    fn merge_conflict_drops_destination_page() {
        let pool = new_pool(64);
        let snap = boot(&pool);

        let mut src = boot(&pool);
        let s_frame = pool.alloc().unwrap();
        fill_words(&pool, s_frame, |i| if i == 2 { 0xCCCC_CCCC } else { 0 });
        src.insert(&pool, s_frame, ulo(), PteFlags::USER | PteFlags::WRITABLE)
            .unwrap();

        let mut dst = boot(&pool);
        let d_frame = pool.alloc().unwrap();
        fill_words(&pool, d_frame, |i| if i == 2 { 0xBBBB_BBBB } else { 0 });
        dst.insert(&pool, d_frame, ulo(), PteFlags::USER | PteFlags::WRITABLE)
            .unwrap();

        merge(&pool, &snap, &mut src, ulo(), &mut dst, ulo(), PTAB_SPAN).unwrap();

        // Word 2 disagreed three ways: the destination page is gone.
        assert_eq!(dst.lookup(&pool, ulo()), pool.pte_zero());
        assert_eq!(pool.refcount(d_frame), 0);
        // The source side keeps its page.
        assert_eq!(src.lookup(&pool, ulo()).addr(), s_frame);
    }

    #[test]
    fn merge_breaks_read_shared_destination() {
        // Destination still shares its page with the source of an earlier
        // copy; merging into it must split the sharing before any word is
        // written.
        let pool = new_pool(64);
        let mut src = boot(&pool);
        let mut dst = boot(&pool);
        let original = pool.alloc().unwrap();
        fill_words(&pool, original, |_| 0x1111_1111);
        src.insert(&pool, original, ulo(), PteFlags::USER | PteFlags::WRITABLE)
            .unwrap();
        copy_range(&pool, &mut src, ulo(), &mut dst, ulo(), PTAB_SPAN).unwrap();
        assert_eq!(pool.refcount(original), 2);

        // A snapshot whose page holds equal contents in a distinct frame:
        // both sides count as entry-changed, so the word merge runs against
        // the read-shared destination.
        let mut snap = boot(&pool);
        let r_frame = pool.alloc().unwrap();
        fill_words(&pool, r_frame, |_| 0x1111_1111);
        snap.insert(&pool, r_frame, ulo(), PteFlags::USER | PteFlags::WRITABLE)
            .unwrap();

        merge(&pool, &snap, &mut src, ulo(), &mut dst, ulo(), PTAB_SPAN).unwrap();

        // The destination was COW-broken into a private writable copy and
        // the share with the source was dropped.
        let merged = dst.lookup(&pool, ulo());
        assert_ne!(merged.addr(), original);
        assert_eq!(pool.refcount(merged.addr()), 1);
        assert_eq!(pool.refcount(original), 1);
        assert!(merged.flags().contains(PteFlags::WRITABLE));
        assert!(!merged.flags().intersects(PteFlags::SYS_RW));
        assert_eq!(word(&pool, merged.addr(), 0), 0x1111_1111);
    }
}
