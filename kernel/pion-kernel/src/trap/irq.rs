//! Hardware interrupt dispatch.
//!
//! A static table of per-line handler pointers, populated by device drivers
//! at registration time. The dispatcher acknowledges the local APIC through
//! a registered callback (the APIC, like all devices, lives outside the
//! core) and invokes the line's handler if one is present; an unclaimed
//! line is logged once per occurrence and otherwise ignored.

use core::sync::atomic::{AtomicPtr, Ordering};

use pion_core::kdebug;

/// Number of ISA IRQ lines routed through vectors 32..48.
pub const NUM_IRQ_LINES: usize = 16;

/// Handler signature: receives the IRQ line number.
pub type IrqHandler = fn(u8);

/// Per-line handler table; null means unclaimed.
static HANDLERS: [AtomicPtr<()>; NUM_IRQ_LINES] = {
    const UNCLAIMED: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());
    [UNCLAIMED; NUM_IRQ_LINES]
};

/// Error from handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqError {
    /// Line number is outside 0..16.
    InvalidLine,
    /// A handler is already registered for this line.
    AlreadyClaimed,
}

/// Registers `handler` for IRQ `line`.
pub fn register_handler(line: u8, handler: IrqHandler) -> Result<(), IrqError> {
    let slot = HANDLERS
        .get(line as usize)
        .ok_or(IrqError::InvalidLine)?;
    slot.compare_exchange(
        core::ptr::null_mut(),
        handler as *mut (),
        Ordering::AcqRel,
        Ordering::Acquire,
    )
    .map(|_| ())
    .map_err(|_| IrqError::AlreadyClaimed)
}

/// Removes the handler for IRQ `line`.
pub fn unregister_handler(line: u8) {
    if let Some(slot) = HANDLERS.get(line as usize) {
        slot.store(core::ptr::null_mut(), Ordering::Release);
    }
}

/// Dispatches IRQ `line` to its handler. Returns `true` if one was present.
pub fn dispatch(line: u8) -> bool {
    let Some(slot) = HANDLERS.get(line as usize) else {
        return false;
    };
    let ptr = slot.load(Ordering::Acquire);
    if ptr.is_null() {
        kdebug!("irq: unclaimed line {line}");
        return false;
    }
    // SAFETY: Only valid `IrqHandler` pointers are stored.
    let handler: IrqHandler = unsafe { core::mem::transmute(ptr) };
    handler(line);
    true
}

// ---------------------------------------------------------------------------
// Interrupt-controller and timer-tick hooks
// ---------------------------------------------------------------------------

fn nop_eoi() {}
fn nop_tick() {}

static EOI_FN: AtomicPtr<()> = AtomicPtr::new(nop_eoi as *mut ());
static TICK_FN: AtomicPtr<()> = AtomicPtr::new(nop_tick as *mut ());

/// Registers the end-of-interrupt callback (local APIC driver).
pub fn set_eoi_fn(f: fn()) {
    EOI_FN.store(f as *mut (), Ordering::Release);
}

/// Registers the timer-tick callback (network/time collaborator).
pub fn set_tick_fn(f: fn()) {
    TICK_FN.store(f as *mut (), Ordering::Release);
}

/// Acknowledges the interrupt at the local APIC.
pub fn eoi() {
    let ptr = EOI_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `fn()` pointers are stored.
    let f: fn() = unsafe { core::mem::transmute(ptr) };
    f();
}

/// Runs the periodic tick work hung off the local timer.
pub fn timer_tick() {
    let ptr = TICK_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `fn()` pointers are stored.
    let f: fn() = unsafe { core::mem::transmute(ptr) };
    f();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static FIRED: AtomicU32 = AtomicU32::new(0);

    fn test_handler(line: u8) {
        FIRED.fetch_add(1 + line as u32, Ordering::SeqCst);
    }

    #[test]
    fn register_dispatch_unregister() {
        // Line 9 is private to this test.
        assert_eq!(register_handler(9, test_handler), Ok(()));
        assert_eq!(
            register_handler(9, test_handler),
            Err(IrqError::AlreadyClaimed)
        );

        let before = FIRED.load(Ordering::SeqCst);
        assert!(dispatch(9));
        assert_eq!(FIRED.load(Ordering::SeqCst), before + 10);

        unregister_handler(9);
        assert!(!dispatch(9));
    }

    #[test]
    fn invalid_line_rejected() {
        assert_eq!(register_handler(16, test_handler), Err(IrqError::InvalidLine));
        assert!(!dispatch(200));
    }

    #[test]
    fn unclaimed_line_is_not_fatal() {
        assert!(!dispatch(15));
    }

    #[test]
    fn default_hooks_are_noops() {
        // Must not crash before drivers register anything.
        eoi();
        timer_tick();
    }
}
