//! The kernel console front-end.
//!
//! Serializes output from all CPUs through one spinlock and forwards bytes
//! to a device callback registered at boot (serial, video — drivers live
//! outside the core). Registers itself as the [`pion_core::log`] sink, so
//! `kprint!`/`klog!` flow through here once [`init`] has run.
//!
//! The trap dispatcher's panic path calls [`force_unlock`]: if a CPU
//! panics while holding the console lock, the panic report must still get
//! out instead of deadlocking into a recursive panic.

use core::fmt::{self, Write};

use pion_core::log::LogLevel;
use pion_core::sync::SpinLock;

/// Device output callback: emit one byte.
pub type PutcFn = fn(u8);

struct Console {
    putc: Option<PutcFn>,
}

impl Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if let Some(putc) = self.putc {
            for b in s.bytes() {
                putc(b);
            }
        }
        Ok(())
    }
}

static CONSOLE: SpinLock<Console> = SpinLock::new(Console { putc: None });

/// Registers the device output callback and wires the console up as the
/// global log sink.
pub fn init(putc: PutcFn) {
    CONSOLE.lock().putc = Some(putc);
    pion_core::log::set_sink(sink);
}

fn sink(level: Option<LogLevel>, args: fmt::Arguments<'_>) {
    let mut console = CONSOLE.lock();
    let _ = match level {
        Some(level) => console.write_fmt(format_args!("[{}] {}\n", level.name(), args)),
        None => console.write_fmt(args),
    };
}

/// Releases the console lock no matter who holds it.
///
/// Only for the panic path: a CPU that traps fatally while printing would
/// otherwise spin on its own lock.
pub fn force_unlock() {
    // SAFETY: Callers are on a no-return path; the holder (if any) is this
    // CPU and will not resume printing.
    unsafe { CONSOLE.force_unlock() };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static CAPTURED: Mutex<Vec<u8>> = Mutex::new(Vec::new());

    fn capture_putc(b: u8) {
        CAPTURED.lock().unwrap().push(b);
    }

    #[test]
    fn init_routes_log_macros_through_console() {
        init(capture_putc);

        CAPTURED.lock().unwrap().clear();
        pion_core::kprint!("raw {}", 7);
        pion_core::kwarn!("careful");

        let captured = CAPTURED.lock().unwrap().clone();
        let text = String::from_utf8(captured).unwrap();
        assert!(text.contains("raw 7"));
        assert!(text.contains("[WARN ] careful\n"));
    }

    #[test]
    fn force_unlock_releases_held_lock() {
        core::mem::forget(CONSOLE.lock());
        force_unlock();
        // Re-acquirable without deadlock.
        drop(CONSOLE.lock());
    }
}
