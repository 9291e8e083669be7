// Kernel-wide tunables.

/// Upper bound on live processes. Pids are unique in `[1, MAX_PID)`.
pub const MAX_PROCESS: usize = 4096;
pub const MAX_PID: i32 = (MAX_PROCESS * 2) as i32;

pub const PROC_NAME_LEN: usize = 15;

/// Timer interrupts per diagnostic heartbeat line.
pub const TICK_NUM: usize = 100;

/// Largest time slice handed to a process by the scheduler.
pub const MAX_TIME_SLICE: i32 = 5;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Pages given to the kernel heap at boot.
pub const KHEAP_PAGES: usize = 512;

pub const EXEC_MAX_ARG_NUM: usize = 32;
pub const EXEC_MAX_ARG_LEN: usize = 4095;
