//! TLB invalidation policy, decoupled from the architecture.
//!
//! The page-table engine calls [`inval_range`] whenever it modifies entries
//! that could be live in the TLB. The actual flush instructions and the
//! "which page directory is installed right now" query are registered at
//! boot; before registration (and on the host, where there is no TLB) the
//! callbacks are no-ops, which is safe because no stale entries can exist.

use core::sync::atomic::{AtomicPtr, Ordering};

use pion_core::addr::{PhysAddr, VirtAddr};
use pion_core::layout::PAGE_SIZE;

/// Flush a single page translation.
type FlushPageFn = fn(VirtAddr);
/// Flush every non-global translation by reloading the root.
type FlushAllFn = fn(PhysAddr);
/// Report the currently installed page-directory root, or `None` when no
/// user address space is active (flush conservatively in that case).
type CurrentRootFn = fn() -> Option<PhysAddr>;

fn nop_flush_page(_va: VirtAddr) {}
fn nop_flush_all(_root: PhysAddr) {}
fn no_current_root() -> Option<PhysAddr> {
    None
}

static FLUSH_PAGE: AtomicPtr<()> = AtomicPtr::new(nop_flush_page as *mut ());
static FLUSH_ALL: AtomicPtr<()> = AtomicPtr::new(nop_flush_all as *mut ());
static CURRENT_ROOT: AtomicPtr<()> = AtomicPtr::new(no_current_root as *mut ());

/// Registers the architecture flush callbacks and the current-root query.
///
/// Called once during boot, after paging is enabled.
pub fn register(flush_page: FlushPageFn, flush_all: FlushAllFn, current_root: CurrentRootFn) {
    FLUSH_PAGE.store(flush_page as *mut (), Ordering::Release);
    FLUSH_ALL.store(flush_all as *mut (), Ordering::Release);
    CURRENT_ROOT.store(current_root as *mut (), Ordering::Release);
}

#[inline]
fn flush_page(va: VirtAddr) {
    let ptr = FLUSH_PAGE.load(Ordering::Acquire);
    // SAFETY: Only valid `FlushPageFn` pointers are stored.
    let f: FlushPageFn = unsafe { core::mem::transmute(ptr) };
    f(va);
}

#[inline]
fn flush_all(root: PhysAddr) {
    let ptr = FLUSH_ALL.load(Ordering::Acquire);
    // SAFETY: Only valid `FlushAllFn` pointers are stored.
    let f: FlushAllFn = unsafe { core::mem::transmute(ptr) };
    f(root);
}

#[inline]
fn current_root() -> Option<PhysAddr> {
    let ptr = CURRENT_ROOT.load(Ordering::Acquire);
    // SAFETY: Only valid `CurrentRootFn` pointers are stored.
    let f: CurrentRootFn = unsafe { core::mem::transmute(ptr) };
    f()
}

/// Invalidates the TLB for `[va, va + size)` of the address space rooted at
/// `root`, before the corresponding entries are modified.
///
/// Policy: if `root` is not the installed page directory the entries cannot
/// be cached and nothing is flushed; a single page uses the one-page
/// invalidation; anything larger reloads the root, dropping all non-global
/// entries.
pub fn inval_range(root: PhysAddr, va: VirtAddr, size: u32) {
    match current_root() {
        Some(installed) if installed != root => return,
        _ => {}
    }
    if size == PAGE_SIZE {
        flush_page(va);
    } else {
        flush_all(root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static PAGE_FLUSHES: AtomicU32 = AtomicU32::new(0);
    static FULL_FLUSHES: AtomicU32 = AtomicU32::new(0);

    fn count_page(_va: VirtAddr) {
        PAGE_FLUSHES.fetch_add(1, Ordering::SeqCst);
    }
    fn count_all(_root: PhysAddr) {
        FULL_FLUSHES.fetch_add(1, Ordering::SeqCst);
    }
    fn fixed_root() -> Option<PhysAddr> {
        Some(PhysAddr::new(0x1000))
    }

    #[test]
    fn policy_selects_flush_kind_and_skips_foreign_roots() {
        // Registration is process-global; exercise the whole policy in one
        // test to avoid ordering hazards with parallel test threads.
        register(count_page, count_all, fixed_root);

        let installed = PhysAddr::new(0x1000);
        let foreign = PhysAddr::new(0x2000);

        let pages_before = PAGE_FLUSHES.load(Ordering::SeqCst);
        let full_before = FULL_FLUSHES.load(Ordering::SeqCst);

        inval_range(installed, VirtAddr::new(0x4000_0000), PAGE_SIZE);
        assert_eq!(PAGE_FLUSHES.load(Ordering::SeqCst), pages_before + 1);

        inval_range(installed, VirtAddr::new(0x4000_0000), PAGE_SIZE * 4);
        assert_eq!(FULL_FLUSHES.load(Ordering::SeqCst), full_before + 1);

        // Not the installed root: no flush at all.
        inval_range(foreign, VirtAddr::new(0x4000_0000), PAGE_SIZE);
        inval_range(foreign, VirtAddr::new(0x4000_0000), PAGE_SIZE * 4);
        assert_eq!(PAGE_FLUSHES.load(Ordering::SeqCst), pages_before + 1);
        assert_eq!(FULL_FLUSHES.load(Ordering::SeqCst), full_before + 1);

        register(nop_flush_page, nop_flush_all, no_current_root);
    }
}
