//! Counting semaphore built on sleep/wakeup.
//!
//! Guards structural mutation of a shared mm (`mm_sem`). Must never be
//! taken with interrupts disabled or while holding another semaphore.

use crate::list::ListEntry;
use crate::sync::local_intr_save;

#[cfg(target_arch = "x86")]
use crate::proc::{self, Proc, ProcState, WT_KSEM};
#[cfg(target_arch = "x86")]
use crate::sched;
#[cfg(target_arch = "x86")]
use crate::to_struct;

pub struct Semaphore {
    value: i32,
    wait_queue: ListEntry,
}

#[cfg(target_arch = "x86")]
struct WaitT {
    proc: *mut Proc,
    wakeup_flags: u32,
    wait_link: ListEntry,
}

impl Semaphore {
    pub const fn new(value: i32) -> Self {
        Semaphore {
            value,
            wait_queue: ListEntry::new(),
        }
    }

    /// Finish construction once the semaphore sits at its final address.
    pub unsafe fn init(&mut self) {
        self.wait_queue.init();
    }

    #[cfg(target_arch = "x86")]
    pub unsafe fn down(&mut self) {
        let intr = local_intr_save();
        if self.value > 0 {
            self.value -= 1;
            return;
        }

        // contended: queue up on the kernel stack and sleep
        let mut wait = WaitT {
            proc: proc::current(),
            wakeup_flags: WT_KSEM,
            wait_link: ListEntry::new(),
        };
        self.wait_queue.add_before(&mut wait.wait_link);
        let p = wait.proc;
        (*p).state = ProcState::Sleeping;
        (*p).wait_state = WT_KSEM;
        // restore IF before yielding; never sleep with interrupts off
        drop(intr);
        sched::schedule();
        assert_eq!(wait.wakeup_flags, WT_KSEM);
    }

    #[cfg(target_arch = "x86")]
    pub unsafe fn up(&mut self) {
        let _intr = local_intr_save();
        if self.wait_queue.is_empty() {
            self.value += 1;
        } else {
            let le = self.wait_queue.next();
            let wait = to_struct!(le, WaitT, wait_link);
            (*le).del();
            sched::wakeup_proc((*wait).proc);
        }
    }

    pub fn value(&self) -> i32 {
        let _intr = local_intr_save();
        self.value
    }
}
