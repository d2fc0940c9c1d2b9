//! Control and flags register definitions.

pub mod control;
pub mod eflags;
