//! Stride scheduler over a skew-heap run queue.
//!
//! Each pick charges the winner `BIG_STRIDE / priority`, so CPU share is
//! proportional to priority. Strides wrap; comparisons use the signed
//! distance, which stays correct while all live strides sit within
//! `BIG_STRIDE` of each other.

use core::ptr;

use crate::param::MAX_TIME_SLICE;
use crate::proc::{self, Proc, ProcState};
use crate::skew_heap::{skew_heap_insert, skew_heap_remove, SkewHeapEntry};
use crate::sync::local_intr_save;
use crate::to_struct;

pub const BIG_STRIDE: u32 = 0x7FFF_FFFF;

pub struct RunQueue {
    pub proc_num: usize,
    pub max_time_slice: i32,
    pub run_pool: *mut SkewHeapEntry,
}

static mut RQ: RunQueue = RunQueue {
    proc_num: 0,
    max_time_slice: MAX_TIME_SLICE,
    run_pool: ptr::null_mut(),
};

unsafe fn le2proc(node: *mut SkewHeapEntry) -> *mut Proc {
    to_struct!(node, Proc, run_pool)
}

/// Order by accumulated stride; break ties by pointer identity so the
/// order is total.
unsafe fn proc_stride_comp(a: *mut SkewHeapEntry, b: *mut SkewHeapEntry) -> i32 {
    let p = le2proc(a);
    let q = le2proc(b);
    let c = (*p).stride.wrapping_sub((*q).stride) as i32;
    if c > 0 {
        1
    } else if c < 0 {
        -1
    } else if a < b {
        -1
    } else {
        1
    }
}

pub unsafe fn rq_enqueue(rq: *mut RunQueue, proc: *mut Proc) {
    (*rq).run_pool = skew_heap_insert((*rq).run_pool, &mut (*proc).run_pool, proc_stride_comp);
    if (*proc).time_slice == 0 || (*proc).time_slice > (*rq).max_time_slice {
        (*proc).time_slice = (*rq).max_time_slice;
    }
    (*proc).rq = rq;
    (*rq).proc_num += 1;
}

pub unsafe fn rq_dequeue(rq: *mut RunQueue, proc: *mut Proc) {
    (*rq).run_pool = skew_heap_remove((*rq).run_pool, &mut (*proc).run_pool, proc_stride_comp);
    (*rq).proc_num -= 1;
}

/// Smallest-stride proc, charged for the win. Null when the queue is
/// empty.
pub unsafe fn rq_pick_next(rq: *mut RunQueue) -> *mut Proc {
    if (*rq).run_pool.is_null() {
        return ptr::null_mut();
    }
    let p = le2proc((*rq).run_pool);
    let pass = if (*p).priority == 0 {
        BIG_STRIDE
    } else {
        BIG_STRIDE / (*p).priority
    };
    (*p).stride = (*p).stride.wrapping_add(pass);
    p
}

unsafe fn rq_proc_tick(_rq: *mut RunQueue, proc: *mut Proc) {
    if (*proc).time_slice > 0 {
        (*proc).time_slice -= 1;
    }
    if (*proc).time_slice == 0 {
        (*proc).need_resched = true;
    }
}

fn rq() -> *mut RunQueue {
    &raw mut RQ
}

unsafe fn sched_class_enqueue(proc: *mut Proc) {
    if proc != proc::IDLE_PROC {
        rq_enqueue(rq(), proc);
    }
}

unsafe fn sched_class_dequeue(proc: *mut Proc) {
    rq_dequeue(rq(), proc);
}

unsafe fn sched_class_pick_next() -> *mut Proc {
    rq_pick_next(rq())
}

pub fn sched_init() {
    unsafe {
        RQ.proc_num = 0;
        RQ.max_time_slice = MAX_TIME_SLICE;
        RQ.run_pool = ptr::null_mut();
    }
    log::info!("sched class: stride_scheduler");
}

/// Timer-tick hook: burn the running proc's slice; idle always yields.
pub fn sched_tick(proc: *mut Proc) {
    if proc.is_null() {
        return; // tick before process management is up
    }
    unsafe {
        if proc != proc::IDLE_PROC {
            rq_proc_tick(rq(), proc);
        } else {
            (*proc).need_resched = true;
        }
    }
}

/// Make `proc` Runnable and queue it, unless it is the running proc.
pub fn wakeup_proc(proc: *mut Proc) {
    unsafe {
        assert!((*proc).state != ProcState::Zombie, "wakeup of a zombie");
        let _intr = local_intr_save();
        if (*proc).state != ProcState::Runnable {
            (*proc).state = ProcState::Runnable;
            (*proc).wait_state = 0;
            if proc != proc::current() {
                sched_class_enqueue(proc);
            }
        } else {
            log::warn!("wakeup runnable process.");
        }
    }
}

/// Pick and switch to the next proc; the idle proc runs when the queue is
/// empty.
#[cfg(target_arch = "x86")]
pub fn schedule() {
    unsafe {
        let _intr = local_intr_save();
        let cur = proc::current();
        (*cur).need_resched = false;
        if (*cur).state == ProcState::Runnable {
            sched_class_enqueue(cur);
        }
        let mut next = sched_class_pick_next();
        if !next.is_null() {
            sched_class_dequeue(next);
        } else {
            next = proc::IDLE_PROC;
        }
        (*next).runs += 1;
        if next != cur {
            proc::proc_run(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::alloc_proc;

    struct TestRq(Box<RunQueue>);

    impl TestRq {
        fn new() -> Self {
            TestRq(Box::new(RunQueue {
                proc_num: 0,
                max_time_slice: MAX_TIME_SLICE,
                run_pool: ptr::null_mut(),
            }))
        }
        fn as_ptr(&mut self) -> *mut RunQueue {
            &mut *self.0 as *mut RunQueue
        }
    }

    unsafe fn spawn(pid: i32, priority: u32) -> *mut Proc {
        let p = alloc_proc();
        (*p).pid = pid;
        (*p).priority = priority;
        (*p).state = ProcState::Runnable;
        p
    }

    unsafe fn run_picks(rq: *mut RunQueue, procs: &[*mut Proc], picks: usize) -> Vec<usize> {
        let mut counts = vec![0usize; procs.len()];
        for p in procs {
            rq_enqueue(rq, *p);
        }
        for _ in 0..picks {
            let next = rq_pick_next(rq);
            assert!(!next.is_null());
            rq_dequeue(rq, next);
            let idx = procs.iter().position(|&p| p == next).unwrap();
            counts[idx] += 1;
            rq_enqueue(rq, next);
        }
        for p in procs {
            rq_dequeue(rq, *p);
        }
        counts
    }

    fn free(procs: &[*mut Proc]) {
        for &p in procs {
            unsafe {
                drop(Box::from_raw(p));
            }
        }
    }

    #[test]
    fn double_priority_doubles_share() {
        unsafe {
            let mut rq = TestRq::new();
            let procs = [spawn(1, 2), spawn(2, 1)];
            let n = 9000;
            let counts = run_picks(rq.as_ptr(), &procs, n);
            let ratio = counts[0] as f64 / counts[1] as f64;
            assert!(
                (ratio - 2.0).abs() < 0.05,
                "expected ~2:1, got {}:{}",
                counts[0],
                counts[1]
            );
            free(&procs);
        }
    }

    #[test]
    fn one_to_three_priority_ratio() {
        unsafe {
            let mut rq = TestRq::new();
            let procs = [spawn(1, 3), spawn(2, 1)];
            let counts = run_picks(rq.as_ptr(), &procs, 10_000);
            let ratio = counts[0] as f64 / counts[1] as f64;
            assert!(
                (2.7..=3.3).contains(&ratio),
                "expected ~3:1, got {}:{}",
                counts[0],
                counts[1]
            );
            free(&procs);
        }
    }

    #[test]
    fn equal_priorities_stay_fair_across_stride_wrap() {
        unsafe {
            let mut rq = TestRq::new();
            // priority 1 advances by BIG_STRIDE per pick, so u32 wrap
            // happens every couple of picks; fairness must survive it
            let procs = [spawn(1, 1), spawn(2, 1)];
            let counts = run_picks(rq.as_ptr(), &procs, 1000);
            let diff = (counts[0] as i64 - counts[1] as i64).abs();
            assert!(diff <= 1, "unfair across wrap: {}:{}", counts[0], counts[1]);
            free(&procs);
        }
    }

    #[test]
    fn enqueue_resets_exhausted_time_slice() {
        unsafe {
            let mut rq = TestRq::new();
            let p = spawn(1, 1);
            (*p).time_slice = 0;
            rq_enqueue(rq.as_ptr(), p);
            assert_eq!((*p).time_slice, MAX_TIME_SLICE);
            rq_dequeue(rq.as_ptr(), p);

            // a partially used slice is kept
            (*p).time_slice = 2;
            rq_enqueue(rq.as_ptr(), p);
            assert_eq!((*p).time_slice, 2);
            rq_dequeue(rq.as_ptr(), p);
            free(&[p]);
        }
    }

    #[test]
    fn tick_exhaustion_requests_reschedule() {
        unsafe {
            let mut rq = TestRq::new();
            let p = spawn(1, 1);
            (*p).time_slice = 2;
            rq_proc_tick(rq.as_ptr(), p);
            assert!(!(*p).need_resched);
            rq_proc_tick(rq.as_ptr(), p);
            assert!((*p).need_resched, "slice exhausted must set need_resched");
            free(&[p]);
        }
    }

    #[test]
    fn priority_zero_is_treated_as_lowest() {
        unsafe {
            let mut rq = TestRq::new();
            let procs = [spawn(1, 0), spawn(2, 2)];
            let counts = run_picks(rq.as_ptr(), &procs, 3000);
            // priority 0 pays the whole BIG_STRIDE per pick, like 1 does
            assert!(counts[1] > counts[0]);
            free(&procs);
        }
    }
}
