//! The syscall surface: a fixed table indexed by the number in EAX, five
//! arguments in EDX/ECX/EBX/EDI/ESI, result back through EAX.

use crate::clock;
use crate::error::{as_syscall_ret, Result};
use crate::exec;
use crate::printf::cputchar;
use crate::proc;
use crate::pmm;
use crate::trap::{print_trap_frame, TrapFrame};

pub const SYS_EXIT: u32 = 1;
pub const SYS_FORK: u32 = 2;
pub const SYS_WAIT: u32 = 3;
pub const SYS_EXEC: u32 = 4;
pub const SYS_CLONE: u32 = 5;
pub const SYS_YIELD: u32 = 10;
pub const SYS_SLEEP: u32 = 11;
pub const SYS_KILL: u32 = 12;
pub const SYS_GETTIME: u32 = 17;
pub const SYS_GETPID: u32 = 18;
pub const SYS_PUTC: u32 = 30;
pub const SYS_PGDIR: u32 = 31;

const NUM_SYSCALLS: usize = 32;

type SyscallFn = unsafe fn(&[u32; 5]) -> Result<i32>;

unsafe fn sys_exit(arg: &[u32; 5]) -> Result<i32> {
    proc::do_exit(arg[0] as i32)
}

unsafe fn sys_fork(_arg: &[u32; 5]) -> Result<i32> {
    let tf = (*proc::current()).tf;
    let stack = (*tf).tf_esp as usize;
    proc::do_fork(0, stack, tf)
}

unsafe fn sys_wait(arg: &[u32; 5]) -> Result<i32> {
    proc::do_wait(arg[0] as i32, arg[1] as usize).map(|_| 0)
}

unsafe fn sys_exec(arg: &[u32; 5]) -> Result<i32> {
    exec::do_execve(arg[0] as usize, arg[1] as usize, arg[2] as usize)
}

unsafe fn sys_yield(_arg: &[u32; 5]) -> Result<i32> {
    proc::do_yield()
}

unsafe fn sys_kill(arg: &[u32; 5]) -> Result<i32> {
    proc::do_kill(arg[0] as i32)
}

unsafe fn sys_getpid(_arg: &[u32; 5]) -> Result<i32> {
    Ok((*proc::current()).pid)
}

unsafe fn sys_putc(arg: &[u32; 5]) -> Result<i32> {
    cputchar(arg[0] as u8);
    Ok(0)
}

unsafe fn sys_pgdir(_arg: &[u32; 5]) -> Result<i32> {
    pmm::print_pgdir();
    Ok(0)
}

unsafe fn sys_gettime(_arg: &[u32; 5]) -> Result<i32> {
    Ok(clock::system_read_timer() as i32)
}

static SYSCALLS: [Option<SyscallFn>; NUM_SYSCALLS] = {
    let mut table: [Option<SyscallFn>; NUM_SYSCALLS] = [None; NUM_SYSCALLS];
    table[SYS_EXIT as usize] = Some(sys_exit as SyscallFn);
    table[SYS_FORK as usize] = Some(sys_fork as SyscallFn);
    table[SYS_WAIT as usize] = Some(sys_wait as SyscallFn);
    table[SYS_EXEC as usize] = Some(sys_exec as SyscallFn);
    table[SYS_YIELD as usize] = Some(sys_yield as SyscallFn);
    table[SYS_KILL as usize] = Some(sys_kill as SyscallFn);
    table[SYS_GETPID as usize] = Some(sys_getpid as SyscallFn);
    table[SYS_PUTC as usize] = Some(sys_putc as SyscallFn);
    table[SYS_PGDIR as usize] = Some(sys_pgdir as SyscallFn);
    table[SYS_GETTIME as usize] = Some(sys_gettime as SyscallFn);
    table
};

/// Dispatch the trap frame's syscall. Unknown numbers are a bug in the
/// caller bad enough to stop the machine, frame dump included.
pub unsafe fn syscall(tf: &mut TrapFrame) {
    let num = tf.tf_regs.reg_eax as usize;
    if num < NUM_SYSCALLS {
        if let Some(f) = SYSCALLS[num] {
            let args = [
                tf.tf_regs.reg_edx,
                tf.tf_regs.reg_ecx,
                tf.tf_regs.reg_ebx,
                tf.tf_regs.reg_edi,
                tf.tf_regs.reg_esi,
            ];
            tf.tf_regs.reg_eax = as_syscall_ret(f(&args)) as u32;
            return;
        }
    }
    let cur = proc::current();
    print_trap_frame(tf);
    panic!(
        "undefined syscall {}, pid = {}, name = {}.",
        num,
        (*cur).pid,
        proc::proc_name(cur)
    );
}
