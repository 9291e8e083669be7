//! Interrupt-disable-as-mutex.
//!
//! Single CPU: every critical section over shared kernel state is a
//! save/disable/restore of EFLAGS.IF. The guard nests; the restore
//! re-enables only if the save observed interrupts enabled.

use i386::{cli, read_eflags, sti, FL_IF};

pub struct IntrGuard {
    flag: bool,
}

/// Disable interrupts, remembering whether they were on.
pub fn local_intr_save() -> IntrGuard {
    let enabled = read_eflags() & FL_IF != 0;
    if enabled {
        cli();
    }
    IntrGuard { flag: enabled }
}

impl Drop for IntrGuard {
    fn drop(&mut self) {
        if self.flag {
            sti();
        }
    }
}
