//! mica: a 32-bit protected-mode x86 teaching kernel.
//!
//! The crate doubles as a library so the pure data-structure modules
//! (allocator, lists, vma bookkeeping, scheduler queue, codecs) build and
//! unit-test on the host; everything that needs ring-0 x86 sits behind
//! `cfg(target_arch = "x86")`. The bootable binary lives in `main.rs`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod clock;
pub mod console;
pub mod elf;
pub mod error;
pub mod first_fit;
pub mod ide;
pub mod kmalloc;
pub mod list;
pub mod memlayout;
pub mod param;
pub mod picirq;
pub mod pmm;
pub mod printf;
pub mod proc;
pub mod sched;
pub mod sem;
pub mod skew_heap;
pub mod swap;
pub mod swapfs;
pub mod sync;
pub mod sysfile;
pub mod trap;
pub mod vmm;

#[cfg(target_arch = "x86")]
pub mod exec;
#[cfg(target_arch = "x86")]
pub mod syscall;
