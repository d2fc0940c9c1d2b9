//! Refcounted physical frame pool.
//!
//! Tracks every 4 KiB frame in the managed region with a [`PageInfo`]
//! record (reference count + free-list link) and hands out frames from a
//! LIFO free list. The metadata array is carved out of the managed region
//! itself, followed by the pinned all-zeroes frame that backs every empty
//! mapping.
//!
//! The pool also owns the physical-to-pointer translation: on the identity-
//! mapped i386 kernel the offset is zero, while host tests point it at a
//! heap arena. All page-table code reaches physical memory through
//! [`FramePool::frame_ptr`], so it runs unmodified in both worlds.

use core::sync::atomic::{AtomicU32, Ordering};

use pion_core::addr::PhysAddr;
use pion_core::arch::x86::structures::paging::{PageTable, Pte, PteFlags};
use pion_core::layout::PAGE_SIZE;
use pion_core::sync::SpinLock;

/// Free-list terminator.
const NO_FRAME: u32 = u32::MAX;

/// Per-frame metadata.
///
/// `refcount` counts the PTE slots (and page-directory handles) referencing
/// the frame; it is zero while the frame sits on the free list. `next_free`
/// is the free-list link, only meaningful while free and only touched under
/// the free-list lock.
pub struct PageInfo {
    refcount: AtomicU32,
    next_free: AtomicU32,
}

struct FreeList {
    head: u32,
    count: usize,
}

/// A free list temporarily taken out of the pool (see
/// [`FramePool::take_free_list`]). Returned intact via
/// [`FramePool::put_free_list`].
pub struct StolenFreeList {
    head: u32,
    count: usize,
}

/// The physical frame pool.
pub struct FramePool {
    /// First managed physical address.
    base: PhysAddr,
    /// Number of frames in the managed region.
    frames: usize,
    /// Added to a physical address to obtain a dereferenceable pointer.
    map_offset: usize,
    /// Per-frame metadata, resident in the first frames of the region.
    info: &'static [PageInfo],
    /// The pinned frame of zero bytes shared by all empty mappings.
    zero_frame: PhysAddr,
    free: SpinLock<FreeList>,
}

// SAFETY: All mutable state is either atomic (refcounts, links) or behind
// the free-list SpinLock; the info slice itself is never resized.
unsafe impl Send for FramePool {}
unsafe impl Sync for FramePool {}

impl FramePool {
    /// Creates a pool over the physical region `[base, base + size)`.
    ///
    /// The first frames of the region hold the metadata array, the next
    /// frame becomes the shared zero frame, and the remainder goes on the
    /// free list (lowest address on top).
    ///
    /// # Safety
    ///
    /// - `base` and `size` must be page-aligned and describe usable memory
    ///   not referenced by anyone else.
    /// - `map_offset` must translate every physical address in the region
    ///   to a valid, exclusively owned pointer for the pool's lifetime.
    pub unsafe fn new(base: PhysAddr, size: u32, map_offset: usize) -> Self {
        assert!(base.is_aligned(PAGE_SIZE) && size % PAGE_SIZE == 0);
        let frames = (size / PAGE_SIZE) as usize;

        let info_bytes = frames * core::mem::size_of::<PageInfo>();
        let info_frames = info_bytes.div_ceil(PAGE_SIZE as usize);
        // Metadata, zero frame, and at least one allocatable frame.
        assert!(frames > info_frames + 1, "region too small for frame pool");

        let info_ptr = (base.as_usize().wrapping_add(map_offset)) as *mut PageInfo;
        // SAFETY: The caller guarantees the region is exclusively ours and
        // the offset maps it to valid memory; PageInfo has no drop glue.
        let info = unsafe {
            for i in 0..frames {
                info_ptr.add(i).write(PageInfo {
                    refcount: AtomicU32::new(0),
                    next_free: AtomicU32::new(NO_FRAME),
                });
            }
            core::slice::from_raw_parts(info_ptr, frames)
        };

        // Pin the metadata frames and the zero frame: refcount 1, never on
        // the free list.
        for frame in info.iter().take(info_frames + 1) {
            frame.refcount.store(1, Ordering::Relaxed);
        }

        let zero_frame = base + info_frames as u32 * PAGE_SIZE;
        let zero_ptr = (zero_frame.as_usize().wrapping_add(map_offset)) as *mut u8;
        // SAFETY: zero_frame is inside the exclusively owned region.
        unsafe { core::ptr::write_bytes(zero_ptr, 0, PAGE_SIZE as usize) };

        // Chain the remaining frames, highest first, so allocation hands out
        // ascending addresses.
        let first_free = info_frames + 1;
        let mut head = NO_FRAME;
        for idx in (first_free..frames).rev() {
            info[idx].next_free.store(head, Ordering::Relaxed);
            head = idx as u32;
        }

        Self {
            base,
            frames,
            map_offset,
            info,
            zero_frame,
            free: SpinLock::new(FreeList {
                head,
                count: frames - first_free,
            }),
        }
    }

    fn index(&self, pa: PhysAddr) -> usize {
        debug_assert!(pa.is_aligned(PAGE_SIZE), "unaligned frame {pa}");
        let idx = ((pa - self.base) / PAGE_SIZE) as usize;
        debug_assert!(idx < self.frames, "frame {pa} outside pool");
        idx
    }

    fn frame_at(&self, idx: usize) -> PhysAddr {
        self.base + idx as u32 * PAGE_SIZE
    }

    /// Allocates one frame, or `None` when the pool is exhausted.
    ///
    /// The frame comes back with refcount 0 and undefined contents; the
    /// caller takes its reference with [`incref`](Self::incref) once the
    /// frame is actually mapped somewhere.
    pub fn alloc(&self) -> Option<PhysAddr> {
        let mut free = self.free.lock();
        if free.head == NO_FRAME {
            return None;
        }
        let idx = free.head as usize;
        free.head = self.info[idx].next_free.load(Ordering::Relaxed);
        free.count -= 1;
        debug_assert_eq!(self.info[idx].refcount.load(Ordering::Relaxed), 0);
        Some(self.frame_at(idx))
    }

    /// Returns a frame with refcount 0 to the free list.
    pub fn free(&self, pa: PhysAddr) {
        let idx = self.index(pa);
        assert_eq!(
            self.info[idx].refcount.load(Ordering::Relaxed),
            0,
            "freeing frame {pa} with live references"
        );
        debug_assert!(pa != self.zero_frame, "freeing the zero frame");
        let mut free = self.free.lock();
        self.info[idx].next_free.store(free.head, Ordering::Relaxed);
        free.head = idx as u32;
        free.count += 1;
    }

    /// Takes one reference on `pa`.
    pub fn incref(&self, pa: PhysAddr) {
        let idx = self.index(pa);
        self.info[idx].refcount.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops one reference on `pa`, returning the remaining count.
    ///
    /// The caller owns the freeing decision: a return of 0 means the frame
    /// is dead and must be given back with [`free`](Self::free) (directly,
    /// or via the page-table teardown path for table frames).
    #[must_use = "a result of 0 means the frame must be freed"]
    pub fn decref(&self, pa: PhysAddr) -> u32 {
        let idx = self.index(pa);
        debug_assert!(pa != self.zero_frame, "refcounting the zero frame");
        let prev = self.info[idx].refcount.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "refcount underflow on frame {pa}");
        prev - 1
    }

    /// Returns the current reference count of `pa`.
    pub fn refcount(&self, pa: PhysAddr) -> u32 {
        self.info[self.index(pa)].refcount.load(Ordering::Acquire)
    }

    /// Returns the number of frames currently on the free list.
    pub fn free_frames(&self) -> usize {
        self.free.lock().count
    }

    /// The pinned all-zeroes frame.
    pub fn zero_frame(&self) -> PhysAddr {
        self.zero_frame
    }

    /// The canonical empty entry: the zero frame's address with no flags.
    /// A slot equal to this value reads as zero and is conceptually unmapped.
    pub fn pte_zero(&self) -> Pte {
        Pte::new(self.zero_frame, PteFlags::empty())
    }

    /// Translates a managed (or zero-frame) physical address to a pointer.
    pub fn frame_ptr(&self, pa: PhysAddr) -> *mut u8 {
        debug_assert!(self.index(pa) < self.frames);
        pa.as_usize().wrapping_add(self.map_offset) as *mut u8
    }

    /// Translates a pointer obtained from [`frame_ptr`](Self::frame_ptr)
    /// back to the frame's physical address.
    pub fn ptr_to_phys(&self, ptr: *mut u8) -> PhysAddr {
        let pa = PhysAddr::new((ptr as usize).wrapping_sub(self.map_offset) as u32);
        debug_assert!(self.index(pa.align_down(PAGE_SIZE)) < self.frames);
        pa
    }

    /// Translates a page-table frame address to a [`PageTable`] pointer.
    pub fn table_ptr(&self, pa: PhysAddr) -> *mut PageTable {
        self.frame_ptr(pa) as *mut PageTable
    }

    /// Copies one page of bytes from frame `src` to frame `dst`.
    ///
    /// # Safety
    ///
    /// Both frames must belong to this pool and `dst` must not be mapped
    /// anywhere that could alias `src` during the copy.
    pub unsafe fn copy_frame(&self, src: PhysAddr, dst: PhysAddr) {
        debug_assert!(src != dst);
        // SAFETY: Distinct frames cannot overlap; both pointers are valid
        // for one page by the caller's contract.
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.frame_ptr(src) as *const u8,
                self.frame_ptr(dst),
                PAGE_SIZE as usize,
            );
        }
    }

    /// Detaches the whole free list, leaving the pool out of memory.
    ///
    /// Used by the self-checks to provoke allocation failure on demand.
    pub fn take_free_list(&self) -> StolenFreeList {
        let mut free = self.free.lock();
        let stolen = StolenFreeList {
            head: free.head,
            count: free.count,
        };
        free.head = NO_FRAME;
        free.count = 0;
        stolen
    }

    /// Reattaches a free list taken with [`take_free_list`](Self::take_free_list).
    ///
    /// The pool's current list must be empty (the caller drains any frames
    /// it freed in between before restoring).
    pub fn put_free_list(&self, stolen: StolenFreeList) {
        let mut free = self.free.lock();
        assert_eq!(free.head, NO_FRAME, "free list not drained before restore");
        free.head = stolen.head;
        free.count = stolen.count;
    }
}

// ---------------------------------------------------------------------------
// Kernel-level pool glue
// ---------------------------------------------------------------------------

/// The global frame pool.
static POOL: SpinLock<Option<FramePool>> = SpinLock::new(None);

/// Initializes the global pool over the boot memory region.
///
/// # Safety
///
/// Same contract as [`FramePool::new`]; additionally must be called exactly
/// once, on the boot CPU, before any mapping operation.
pub unsafe fn init(base: PhysAddr, size: u32, map_offset: usize) {
    // SAFETY: Forwarded to the caller.
    let pool = unsafe { FramePool::new(base, size, map_offset) };
    let mut global = POOL.lock();
    assert!(global.is_none(), "frame pool already initialized");
    *global = Some(pool);
}

/// Executes a closure with a reference to the global pool.
///
/// # Panics
///
/// Panics if the pool has not been initialized.
pub fn with_pool<R>(f: impl FnOnce(&FramePool) -> R) -> R {
    let pool = POOL.lock();
    f(pool.as_ref().expect("frame pool not initialized"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::testpool::{new_pool, TEST_BASE};

    #[test]
    fn metadata_accounting() {
        let pool = new_pool(64);
        // 64 PageInfo records fit one page, so: 1 metadata frame, 1 zero
        // frame, 62 allocatable.
        assert_eq!(pool.free_frames(), 62);
        assert_eq!(pool.zero_frame().as_u32(), TEST_BASE + PAGE_SIZE);
    }

    #[test]
    fn zero_frame_is_zeroed_and_pinned() {
        let pool = new_pool(64);
        let ptr = pool.frame_ptr(pool.zero_frame());
        let page = unsafe { core::slice::from_raw_parts(ptr, PAGE_SIZE as usize) };
        assert!(page.iter().all(|&b| b == 0));
        assert_eq!(pool.refcount(pool.zero_frame()), 1);
    }

    #[test]
    fn pte_zero_has_no_flags() {
        let pool = new_pool(64);
        let pte = pool.pte_zero();
        assert!(!pte.is_present());
        assert_eq!(pte.addr(), pool.zero_frame());
        assert!(pte.flags().is_empty());
    }

    #[test]
    fn alloc_ascending_then_lifo() {
        let pool = new_pool(64);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_eq!(b - a, PAGE_SIZE);

        // Freed frames come back most-recently-freed first.
        pool.free(a);
        assert_eq!(pool.alloc().unwrap(), a);
    }

    #[test]
    fn refcount_lifecycle() {
        let pool = new_pool(64);
        let f = pool.alloc().unwrap();
        assert_eq!(pool.refcount(f), 0);
        pool.incref(f);
        pool.incref(f);
        assert_eq!(pool.refcount(f), 2);
        assert_eq!(pool.decref(f), 1);
        assert_eq!(pool.decref(f), 0);
        pool.free(f);
        assert_eq!(pool.free_frames(), 62);
    }

    #[test]
    #[should_panic(expected = "live references")]
    fn free_with_references_panics() {
        let pool = new_pool(64);
        let f = pool.alloc().unwrap();
        pool.incref(f);
        pool.free(f);
    }

    #[test]
    fn exhaustion_and_steal() {
        let pool = new_pool(8);
        // 1 metadata + 1 zero frame -> 6 allocatable.
        let stolen = pool.take_free_list();
        assert!(pool.alloc().is_none());
        pool.put_free_list(stolen);
        assert_eq!(pool.free_frames(), 6);
        assert!(pool.alloc().is_some());
    }

    #[test]
    fn copy_frame_copies_page() {
        let pool = new_pool(64);
        let src = pool.alloc().unwrap();
        let dst = pool.alloc().unwrap();
        unsafe {
            core::ptr::write_bytes(pool.frame_ptr(src), 0xAA, PAGE_SIZE as usize);
            pool.copy_frame(src, dst);
        }
        let copied = unsafe { core::slice::from_raw_parts(pool.frame_ptr(dst), 4096) };
        assert!(copied.iter().all(|&b| b == 0xAA));
    }
}
