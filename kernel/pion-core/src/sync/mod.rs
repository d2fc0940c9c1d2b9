//! Synchronization primitives for the kernel.
//!
//! Provides [`SpinLock`] and [`LazyLock`], both usable in `static` items
//! before any allocator or scheduler exists.

mod lazy;
mod spinlock;

pub use lazy::LazyLock;
pub use spinlock::{SpinLock, SpinLockGuard};
