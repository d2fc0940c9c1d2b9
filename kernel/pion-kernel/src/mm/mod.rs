//! Memory management: physical frame pool, page-directory manager,
//! copy-on-write fault resolution, and the address-space copy/merge engine.

pub mod aspace;
pub mod fault;
pub mod merge;
pub mod pmm;
pub mod tlb;

pub use aspace::AddrSpace;
pub use pmm::FramePool;

/// Errors surfaced by the memory-management engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// The frame pool is exhausted.
    OutOfMemory,
}

impl core::fmt::Display for VmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of physical memory"),
        }
    }
}

#[cfg(test)]
pub(crate) mod testpool {
    //! Shared test scaffolding: a [`FramePool`] over a leaked heap arena.

    use super::pmm::FramePool;
    use core::alloc::Layout;
    use pion_core::addr::PhysAddr;
    use pion_core::layout::PAGE_SIZE;

    /// Physical base address the test pools pretend to manage.
    pub const TEST_BASE: u32 = 0x0010_0000;

    /// Builds a pool over `frames` fresh pages. The arena is leaked: pools
    /// are cheap and tests are short-lived processes.
    pub fn new_pool(frames: usize) -> FramePool {
        let bytes = frames * PAGE_SIZE as usize;
        let layout = Layout::from_size_align(bytes, PAGE_SIZE as usize).unwrap();
        // SAFETY: layout has non-zero size.
        let arena = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!arena.is_null());

        let map_offset = (arena as usize).wrapping_sub(TEST_BASE as usize);
        // SAFETY: The arena is a fresh, exclusively owned allocation of
        // `frames` pages, and `map_offset` maps [TEST_BASE, TEST_BASE+bytes)
        // exactly onto it.
        unsafe { FramePool::new(PhysAddr::new(TEST_BASE), bytes as u32, map_offset) }
    }
}
