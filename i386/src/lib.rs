//! x86 (IA-32) platform primitives: port I/O, control registers, EFLAGS,
//! descriptor-table loads and the descriptor/gate/TSS layouts.
//!
//! Register wrappers take `usize` operands so they assemble for the i386
//! kernel target and for the build host (where the unit tests of the kernel
//! crate run, without ever calling them). The few pieces of genuinely
//! 32-bit-only code (trap stubs, context switch, boot entry) live in the
//! kernel crate behind `cfg(target_arch = "x86")`.

#![no_std]

pub mod ports;
pub mod registers;
pub mod segmentation;

pub use ports::*;
pub use registers::*;
pub use segmentation::*;
