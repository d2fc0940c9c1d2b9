//! Lazy initialization primitive for `no_std`.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::ops::Deref;
use core::sync::atomic::{AtomicU8, Ordering};

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

/// A value that is initialized on first access.
///
/// `no_std` replacement for `std::sync::LazyLock`: an atomic state machine
/// picks one initializer, everyone else spins until the value is ready.
/// The kernel builds with `panic = abort`, so a panicking init closure halts
/// the machine rather than leaving waiters spinning.
pub struct LazyLock<T, F = fn() -> T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
    init: UnsafeCell<Option<F>>,
}

// SAFETY: The state machine guarantees the value is written exactly once,
// before any reader observes READY, and the init closure is consumed once.
unsafe impl<T: Send + Sync, F: Send> Send for LazyLock<T, F> {}
unsafe impl<T: Send + Sync, F: Send> Sync for LazyLock<T, F> {}

impl<T, F: FnOnce() -> T> LazyLock<T, F> {
    /// Creates a new `LazyLock` with the given initializer.
    pub const fn new(init: F) -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            value: UnsafeCell::new(MaybeUninit::uninit()),
            init: UnsafeCell::new(Some(init)),
        }
    }

    fn force(&self) -> &T {
        if self.state.load(Ordering::Acquire) == READY {
            // SAFETY: READY means the value was fully written.
            return unsafe { (*self.value.get()).assume_init_ref() };
        }

        if self
            .state
            .compare_exchange(UNINIT, INITIALIZING, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            // SAFETY: We are the sole thread in INITIALIZING state.
            let init = unsafe { (*self.init.get()).take().unwrap() };
            let value = init();
            // SAFETY: Still the sole initializer; nobody reads until READY.
            unsafe { (*self.value.get()).write(value) };
            self.state.store(READY, Ordering::Release);
        } else {
            while self.state.load(Ordering::Acquire) != READY {
                core::hint::spin_loop();
            }
        }

        // SAFETY: State is READY.
        unsafe { (*self.value.get()).assume_init_ref() }
    }
}

impl<T, F: FnOnce() -> T> Deref for LazyLock<T, F> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        self.force()
    }
}
