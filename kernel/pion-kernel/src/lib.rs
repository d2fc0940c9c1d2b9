//! The pion kernel.
//!
//! A small research kernel for protected-mode i386: a single trap dispatch
//! point, two-level page tables with demand-allocated page tables and
//! refcounted frames, copy-on-write address-space duplication, a three-way
//! merge of speculatively diverged address spaces, and the syscall shim that
//! ties them together.
//!
//! The crate is a library; a boot crate provides the entry point, memory
//! map, and device setup, then calls the `init` functions of the modules
//! below. Everything that touches real hardware is gated on
//! `target_arch = "x86"`, which keeps the rest of the kernel — in
//! particular the whole memory-management engine — buildable and unit-
//! testable on the host.

#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod console;
pub mod mm;
pub mod percpu;
pub mod proc;
pub mod syscall;
pub mod trap;

pub use pion_core::{kdebug, kerr, kfatal, kinfo, klog, kprint, kprintln, kwarn};
