//! Architecture-specific kernel code.

#[cfg(target_arch = "x86")]
pub mod x86;
