//! Per-process address spaces: page-directory management and mapping
//! operations.
//!
//! An [`AddrSpace`] is a handle on a page-directory frame. The kernel region
//! of every directory consists of immutable 4 MiB identity mappings cloned
//! from the boot template; only the user window `[VM_USERLO, VM_USERHI)` is
//! ever walked or modified. User page tables are demand-allocated, and every
//! frame reachable from a directory holds one reference per referencing
//! slot.
//!
//! All operations take the [`FramePool`] explicitly. The handle is the
//! single mutator of its tables (`&mut self` on every mutating operation);
//! other CPUs may run concurrently on *other* address spaces.

use core::ptr::NonNull;

use pion_core::addr::{PhysAddr, VirtAddr};
use pion_core::arch::x86::structures::paging::{Pte, PteFlags};
use pion_core::layout::{
    self, PAGE_SIZE, PTAB_SPAN, VM_USERHI, VM_USERLO,
};

use super::pmm::FramePool;
use super::{tlb, VmError};

/// Flags on a demand-allocated page-directory entry. The MMU checks
/// permissions at both levels, so directory entries stay permissive and the
/// page-table entries carry the real policy.
const PDE_FLAGS: PteFlags = PteFlags::PRESENT
    .union(PteFlags::WRITABLE)
    .union(PteFlags::USER)
    .union(PteFlags::ACCESSED);

/// Flags on the kernel identity-map directory entries.
const KERNEL_PDE_FLAGS: PteFlags = PteFlags::PRESENT
    .union(PteFlags::WRITABLE)
    .union(PteFlags::LARGE_PAGE)
    .union(PteFlags::GLOBAL);

/// A handle on one page directory.
pub struct AddrSpace {
    root: PhysAddr,
}

impl AddrSpace {
    /// Builds the boot template directory: user window all `PTE_ZERO`,
    /// everything else identity-mapped with global 4 MiB pages, kernel-only.
    pub fn new_boot(pool: &FramePool) -> Option<Self> {
        let root = pool.alloc()?;
        pool.incref(root);
        let table = pool.table_ptr(root);
        for i in 0..layout::NPD_ENTRIES {
            let va = (i as u32) << 22;
            let pde = if layout::user_contains(va) {
                pool.pte_zero()
            } else {
                Pte::new(PhysAddr::new(va), KERNEL_PDE_FLAGS)
            };
            // SAFETY: root is a fresh frame owned by this handle.
            unsafe { (*table).entries[i] = pde };
        }
        Some(Self { root })
    }

    /// Allocates a new directory initialized from `template` (normally the
    /// boot directory). The new directory starts with an empty user window
    /// if the template's is empty.
    pub fn new_user(pool: &FramePool, template: &AddrSpace) -> Option<Self> {
        let root = pool.alloc()?;
        pool.incref(root);
        // SAFETY: Source and destination are distinct whole frames; the
        // template is not being mutated (shared reference).
        unsafe { pool.copy_frame(template.root, root) };
        Some(Self { root })
    }

    /// The physical address of the page-directory frame.
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// Reads the directory entry covering `va`.
    pub(crate) fn pde(&self, pool: &FramePool, va: VirtAddr) -> Pte {
        // SAFETY: root is a valid directory frame for the handle's lifetime.
        unsafe { (*pool.table_ptr(self.root)).entries[va.pd_index()] }
    }

    /// Returns a pointer to the directory slot covering `va`. Used by the
    /// copy/merge engine, which works in whole-table units.
    pub(crate) fn pde_slot(&mut self, pool: &FramePool, va: VirtAddr) -> NonNull<Pte> {
        assert!(layout::user_contains(va.as_u32()));
        let dir = pool.table_ptr(self.root);
        // SAFETY: `&mut self` makes this handle the only mutator.
        unsafe { NonNull::from(&mut (*dir).entries[va.pd_index()]) }
    }

    /// Returns a pointer to the page-table entry for user address `va`,
    /// demand-allocating the page table when `create` is set.
    ///
    /// Returns `None` if no table covers `va` and `create` is false, or if
    /// the pool cannot supply a table frame. A fresh table is filled with
    /// the canonical empty entry and installed writable; hardware checks
    /// permissions at both levels, so the real policy lives in the returned
    /// slot.
    pub fn walk(&mut self, pool: &FramePool, va: VirtAddr, create: bool) -> Option<NonNull<Pte>> {
        assert!(layout::user_contains(va.as_u32()), "walk outside user window: {va}");
        let dir = pool.table_ptr(self.root);
        // SAFETY: `&mut self` makes this handle the only mutator of the
        // directory and of every table hanging off it.
        unsafe {
            let pde_slot = &mut (*dir).entries[va.pd_index()];
            if *pde_slot == pool.pte_zero() {
                if !create {
                    return None;
                }
                let pt = pool.alloc()?;
                let table = pool.table_ptr(pt);
                (*table).fill(pool.pte_zero());
                pool.incref(pt);
                *pde_slot = Pte::new(pt, PDE_FLAGS);
                return Some(NonNull::from(&mut (*table).entries[va.pt_index()]));
            }
            let table = pool.table_ptr(pde_slot.addr());
            Some(NonNull::from(&mut (*table).entries[va.pt_index()]))
        }
    }

    /// Reads the page-table entry for `va` without allocating: an absent
    /// table reads as the canonical empty entry.
    pub fn lookup(&self, pool: &FramePool, va: VirtAddr) -> Pte {
        let pde = self.pde(pool, va);
        if pde == pool.pte_zero() {
            return pool.pte_zero();
        }
        // SAFETY: A present user PDE references a valid page table.
        unsafe { (*pool.table_ptr(pde.addr())).entries[va.pt_index()] }
    }

    /// Translates a user virtual address to the mapped frame, if both
    /// levels are present. The hardware normally does this; the software
    /// version backs assertions and tests.
    pub fn translate(&self, pool: &FramePool, va: VirtAddr) -> Option<PhysAddr> {
        assert!(layout::user_contains(va.as_u32()));
        let pde = self.pde(pool, va);
        if !pde.is_present() {
            return None;
        }
        // SAFETY: A present user PDE references a valid page table.
        let pte = unsafe { (*pool.table_ptr(pde.addr())).entries[va.pt_index()] };
        pte.is_present().then(|| pte.addr())
    }

    /// Maps `frame` at `va` with permissions `perm` (PRESENT is implied).
    ///
    /// An existing mapping at `va` is removed first; the incoming frame's
    /// reference is taken *before* that removal, so re-inserting the sole
    /// reference to a frame at its own slot does not bounce the frame
    /// through the free list.
    ///
    /// Returns the entry slot on success, `None` if a page table could not
    /// be allocated (the operation has no effect in that case).
    pub fn insert(
        &mut self,
        pool: &FramePool,
        frame: PhysAddr,
        va: VirtAddr,
        perm: PteFlags,
    ) -> Option<NonNull<Pte>> {
        let slot = self.walk(pool, va, true)?;
        pool.incref(frame);
        // SAFETY: `slot` came from walk() on this handle; a single-page
        // remove never frees the table it lives in (the directory entry
        // still references it), so the pointer stays valid across it.
        unsafe {
            if *slot.as_ref() != pool.pte_zero() {
                self.remove(pool, va, PAGE_SIZE);
            }
            *slot.as_ptr() = Pte::new(frame, perm | PteFlags::PRESENT);
        }
        Some(slot)
    }

    /// Unmaps `[va, va + size)`, dropping one reference per mapped frame
    /// and collapsing page tables that the range covers entirely.
    ///
    /// `va` and `size` must be page-aligned and inside the user window.
    /// Afterwards every entry in the range is the canonical empty entry.
    pub fn remove(&mut self, pool: &FramePool, va: VirtAddr, size: u32) {
        assert!(layout::page_aligned(va.as_u32()) && layout::page_aligned(size));
        assert!(layout::user_contains_range(va.as_u32(), size));
        tlb::inval_range(self.root, va, size);

        let end = va.as_u32() + size;
        let mut cur = va.as_u32();

        // Head: single slots up to the first 4 MiB boundary.
        let head_end = end.min(VirtAddr::new(cur).align_up(PTAB_SPAN).as_u32());
        while cur < head_end {
            self.clear_slot(pool, VirtAddr::new(cur));
            cur += PAGE_SIZE;
        }

        // Bulk: whole page tables, dropped as a unit. Freeing the table
        // frame releases every mapping it still holds.
        while end - cur >= PTAB_SPAN {
            let dir = pool.table_ptr(self.root);
            // SAFETY: Single mutator; cur is in the user window.
            unsafe {
                let pde_slot = &mut (*dir).entries[VirtAddr::new(cur).pd_index()];
                if *pde_slot != pool.pte_zero() {
                    let pt = pde_slot.addr();
                    if pool.decref(pt) == 0 {
                        free_ptab(pool, pt);
                    }
                    *pde_slot = pool.pte_zero();
                }
            }
            cur += PTAB_SPAN;
        }

        // Tail: single slots after the last whole table.
        while cur < end {
            self.clear_slot(pool, VirtAddr::new(cur));
            cur += PAGE_SIZE;
        }
    }

    /// Clears one 4 KiB slot, dropping the mapped frame's reference.
    fn clear_slot(&mut self, pool: &FramePool, va: VirtAddr) {
        let Some(slot) = self.walk(pool, va, false) else {
            return;
        };
        // SAFETY: Slot pointer from walk() on this handle.
        unsafe {
            let old = *slot.as_ref();
            let frame = old.addr();
            if frame != pool.zero_frame() && pool.decref(frame) == 0 {
                pool.free(frame);
            }
            *slot.as_ptr() = pool.pte_zero();
        }
    }

    /// Sets the nominal permissions on `[va, va + size)`.
    ///
    /// `nominal` may only contain `SYS_READ`/`SYS_WRITE`. Granting
    /// `SYS_READ` maps the slot user-readable (an empty slot becomes a
    /// read-only view of the shared zero frame); granting `SYS_WRITE` marks
    /// the slot logically writable while leaving the hardware writable bit
    /// clear, so the first write lands in the copy-on-write resolver.
    /// An empty `nominal` strips all permissions.
    pub fn set_perm(
        &mut self,
        pool: &FramePool,
        va: VirtAddr,
        size: u32,
        nominal: PteFlags,
    ) -> Result<(), VmError> {
        assert!(layout::page_aligned(va.as_u32()) && layout::page_aligned(size));
        assert!(layout::user_contains_range(va.as_u32(), size));
        assert!(
            PteFlags::SYS_RW.contains(nominal),
            "set_perm takes nominal bits only"
        );
        tlb::inval_range(self.root, va, size);

        let mut grant = nominal | PteFlags::USER;
        if nominal.contains(PteFlags::SYS_READ) {
            grant |= PteFlags::PRESENT;
        }

        let mut cur = va.as_u32();
        let end = cur + size;
        while cur < end {
            let slot = self
                .walk(pool, VirtAddr::new(cur), true)
                .ok_or(VmError::OutOfMemory)?;
            // SAFETY: Slot pointer from walk() on this handle.
            unsafe {
                let old = *slot.as_ref();
                *slot.as_ptr() = if nominal.is_empty() {
                    Pte::new(old.addr(), PteFlags::empty())
                } else {
                    Pte::from_bits(old.bits() | grant.bits())
                };
            }
            cur += PAGE_SIZE;
        }
        Ok(())
    }

    /// Tears the address space down: unmaps the whole user window, then
    /// frees the directory frame itself.
    pub fn destroy(mut self, pool: &FramePool) {
        self.remove(pool, layout::user_lo(), VM_USERHI - VM_USERLO);
        if pool.decref(self.root) == 0 {
            pool.free(self.root);
        }
    }
}

/// Frees a page-table frame, dropping one reference per mapping it holds.
pub(crate) fn free_ptab(pool: &FramePool, pt: PhysAddr) {
    let table = pool.table_ptr(pt);
    for i in 0..layout::NPT_ENTRIES {
        // SAFETY: The table frame just reached refcount 0: no directory
        // references it anymore, so this is the only accessor.
        let entry = unsafe { (*table).entries[i] };
        let frame = entry.addr();
        if frame != pool.zero_frame() && pool.decref(frame) == 0 {
            pool.free(frame);
        }
    }
    pool.free(pt);
}

// ---------------------------------------------------------------------------
// Kernel-level boot directory glue
// ---------------------------------------------------------------------------

use core::sync::atomic::{AtomicU32, Ordering};

/// Sentinel: boot directory not built yet.
const BOOT_UNSET: u32 = u32::MAX;

/// Physical root of the boot page directory, set once at init.
static BOOT_ROOT: AtomicU32 = AtomicU32::new(BOOT_UNSET);

/// Builds the boot directory in the global pool. Boot CPU only, once.
pub fn init(pool: &FramePool) {
    let boot = AddrSpace::new_boot(pool).expect("no memory for boot page directory");
    let prev = BOOT_ROOT.compare_exchange(
        BOOT_UNSET,
        boot.root().as_u32(),
        Ordering::Release,
        Ordering::Relaxed,
    );
    assert!(prev.is_ok(), "boot page directory already built");
    core::mem::forget(boot);
}

/// The boot page directory, as a template for [`AddrSpace::new_user`].
///
/// The returned handle aliases the global boot directory: it is only a
/// template and must never be passed to [`AddrSpace::destroy`].
///
/// # Panics
///
/// Panics if called before [`init`].
pub fn boot_template() -> AddrSpace {
    let root = BOOT_ROOT.load(Ordering::Acquire);
    assert!(root != BOOT_UNSET, "boot page directory not built");
    AddrSpace {
        root: PhysAddr::new(root),
    }
}
