//! Process management: the proc table, the process tree, and the
//! fork/exit/wait/kill lifecycle.
//!
//! idle (pid 0) runs on the boot stack and yields forever; init (pid 1)
//! is the first forked kernel thread, spawns the user bootstrap and reaps
//! orphans. Everything else descends from those two.

use alloc::boxed::Box;
use core::ptr;

use crate::error::{KernelError, Result};
use crate::list::ListEntry;
#[allow(unused_imports)]
use crate::memlayout::{pdx, KSTACK_PAGE, KSTACK_SIZE, PG_SIZE, PTE_P, PTE_W, VPT};
use crate::param::{MAX_PID, MAX_PROCESS, PROC_NAME_LEN};
use crate::pmm;
use crate::sched;
use crate::skew_heap::SkewHeapEntry;
#[cfg(target_arch = "x86")]
use crate::sync::local_intr_save;
use crate::sysfile::FilesStruct;
use crate::to_struct;
use crate::trap::TrapFrame;
#[allow(unused_imports)]
use crate::vmm::{self, MmStruct};

/* fork flags */
pub const CLONE_VM: u32 = 0x0000_0100; // share the mm
pub const CLONE_THREAD: u32 = 0x0000_0200; // thread group
pub const CLONE_FS: u32 = 0x0000_0800; // share the file table

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Uninit,
    Sleeping,
    Runnable, // runnable, possibly running
    Zombie,   // waiting for the parent to reap it
}

bitflags::bitflags! {
    pub struct ProcFlags: u32 {
        /// Marked for death; self-terminates at the next chance.
        const EXITING = 0x1;
    }
}

/* wait states */
pub const WT_INTERRUPTED: u32 = 0x8000_0000; // wait may be broken by kill
pub const WT_CHILD: u32 = 0x0000_0001 | WT_INTERRUPTED;
pub const WT_TIMER: u32 = 0x0000_0002 | WT_INTERRUPTED;
pub const WT_KBD: u32 = 0x0000_0004 | WT_INTERRUPTED;
pub const WT_KSEM: u32 = 0x0000_0100;

/// Callee-saved register context for `switch_to`. Field order is the
/// layout the context-switch assembly indexes.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct Context {
    pub eip: u32,
    pub esp: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
}

impl Context {
    pub const fn zero() -> Self {
        Context {
            eip: 0,
            esp: 0,
            ebx: 0,
            ecx: 0,
            edx: 0,
            esi: 0,
            edi: 0,
            ebp: 0,
        }
    }
}

#[repr(C)]
pub struct Proc {
    pub state: ProcState,
    pub pid: i32,
    /// Times the scheduler has picked this proc.
    pub runs: i32,
    /// Bottom of the two-page kernel stack.
    pub kstack: usize,
    pub need_resched: bool,
    pub parent: *mut Proc,
    pub mm: *mut MmStruct, // null for pure kernel threads
    pub context: Context,
    /// Trap frame of the innermost trap, on the kernel stack.
    pub tf: *mut TrapFrame,
    /// Physical address of the page directory to run with.
    pub cr3: usize,
    pub flags: ProcFlags,
    pub name: [u8; PROC_NAME_LEN + 1],
    pub list_link: ListEntry,
    pub hash_link: ListEntry,
    pub exit_code: i32,
    pub wait_state: u32,
    pub cptr: *mut Proc, // youngest child
    pub yptr: *mut Proc, // younger sibling
    pub optr: *mut Proc, // older sibling
    pub rq: *mut sched::RunQueue,
    pub run_link: ListEntry,
    pub time_slice: i32,
    pub run_pool: SkewHeapEntry,
    pub stride: u32,
    pub priority: u32,
    pub filesp: *mut FilesStruct,
}

const HASH_SHIFT: usize = 10;
const HASH_LIST_SIZE: usize = 1 << HASH_SHIFT;

pub static mut PROC_LIST: ListEntry = ListEntry::new();
static mut HASH_LIST: [ListEntry; HASH_LIST_SIZE] = [ListEntry::new(); HASH_LIST_SIZE];

pub static mut IDLE_PROC: *mut Proc = ptr::null_mut();
pub static mut INIT_PROC: *mut Proc = ptr::null_mut();
static mut CURRENT: *mut Proc = ptr::null_mut();

static mut N_PROCESS: usize = 0;

pub fn current() -> *mut Proc {
    unsafe { CURRENT }
}

pub fn n_process() -> usize {
    unsafe { N_PROCESS }
}

const GOLDEN_RATIO_PRIME_32: u32 = 0x9E37_0001;

fn pid_hashfn(pid: i32) -> usize {
    ((pid as u32).wrapping_mul(GOLDEN_RATIO_PRIME_32) >> (32 - HASH_SHIFT)) as usize
}

pub unsafe fn le2proc_list(le: *mut ListEntry) -> *mut Proc {
    to_struct!(le, Proc, list_link)
}

unsafe fn le2proc_hash(le: *mut ListEntry) -> *mut Proc {
    to_struct!(le, Proc, hash_link)
}

#[cfg(target_arch = "x86")]
/// Link a fresh proc into the global list and its parent's child chain.
unsafe fn set_links(proc: *mut Proc) {
    PROC_LIST.add_after(&mut (*proc).list_link);
    (*proc).yptr = ptr::null_mut();
    (*proc).optr = (*(*proc).parent).cptr;
    if !(*proc).optr.is_null() {
        (*(*proc).optr).yptr = proc;
    }
    (*(*proc).parent).cptr = proc;
    N_PROCESS += 1;
}

#[cfg(target_arch = "x86")]
unsafe fn remove_links(proc: *mut Proc) {
    (*proc).list_link.del();
    if !(*proc).optr.is_null() {
        (*(*proc).optr).yptr = (*proc).yptr;
    }
    if !(*proc).yptr.is_null() {
        (*(*proc).yptr).optr = (*proc).optr;
    } else {
        (*(*proc).parent).cptr = (*proc).optr;
    }
    N_PROCESS -= 1;
}

/// A zeroed proc: Uninit, no pid, boot CR3, empty links.
pub fn alloc_proc() -> *mut Proc {
    let proc = Box::into_raw(Box::new(Proc {
        state: ProcState::Uninit,
        pid: -1,
        runs: 0,
        kstack: 0,
        need_resched: false,
        parent: ptr::null_mut(),
        mm: ptr::null_mut(),
        context: Context::zero(),
        tf: ptr::null_mut(),
        cr3: unsafe { pmm::BOOT_CR3 },
        flags: ProcFlags::empty(),
        name: [0; PROC_NAME_LEN + 1],
        list_link: ListEntry::new(),
        hash_link: ListEntry::new(),
        exit_code: 0,
        wait_state: 0,
        cptr: ptr::null_mut(),
        yptr: ptr::null_mut(),
        optr: ptr::null_mut(),
        rq: ptr::null_mut(),
        run_link: ListEntry::new(),
        time_slice: 0,
        run_pool: SkewHeapEntry::new(),
        stride: 0,
        priority: 0,
        filesp: ptr::null_mut(),
    }));
    unsafe {
        (*proc).list_link.init();
        (*proc).hash_link.init();
        (*proc).run_link.init();
        (*proc).run_pool.init();
    }
    proc
}

pub unsafe fn set_proc_name(proc: *mut Proc, name: &str) {
    (*proc).name = [0; PROC_NAME_LEN + 1];
    let n = core::cmp::min(name.len(), PROC_NAME_LEN);
    (&mut (*proc).name)[..n].copy_from_slice(&name.as_bytes()[..n]);
}

pub unsafe fn proc_name<'a>(proc: *const Proc) -> &'a str {
    let len = (*proc)
        .name
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(PROC_NAME_LEN);
    core::str::from_utf8_unchecked(&(&(*proc).name)[..len])
}

#[cfg(target_arch = "x86")]
static mut LAST_PID: i32 = MAX_PID;
#[cfg(target_arch = "x86")]
static mut NEXT_SAFE: i32 = MAX_PID;

/// Allocate a pid unique among live processes.
///
/// `[LAST_PID, NEXT_SAFE)` is known collision-free; the proc list is only
/// rescanned when that window is exhausted. A wraparound always rescans:
/// low pids (init's, for one) stay taken for the life of the system.
#[cfg(target_arch = "x86")]
unsafe fn get_pid() -> i32 {
    const _: () = assert!(MAX_PID > MAX_PROCESS as i32);
    LAST_PID += 1;
    let wrapped = LAST_PID >= MAX_PID;
    if wrapped {
        LAST_PID = 1;
    }
    if wrapped || LAST_PID >= NEXT_SAFE {
        NEXT_SAFE = MAX_PID;
        'repeat: loop {
            let list = &mut PROC_LIST as *mut ListEntry;
            let mut le = (*list).next();
            while le != list {
                let proc = le2proc_list(le);
                if (*proc).pid == LAST_PID {
                    LAST_PID += 1;
                    if LAST_PID >= NEXT_SAFE {
                        if LAST_PID >= MAX_PID {
                            LAST_PID = 1;
                        }
                        NEXT_SAFE = MAX_PID;
                        continue 'repeat;
                    }
                } else if (*proc).pid > LAST_PID && NEXT_SAFE > (*proc).pid {
                    NEXT_SAFE = (*proc).pid;
                }
                le = (*le).next();
            }
            break;
        }
    }
    LAST_PID
}

#[cfg(target_arch = "x86")]
unsafe fn hash_proc(proc: *mut Proc) {
    HASH_LIST[pid_hashfn((*proc).pid)].add_after(&mut (*proc).hash_link);
}

#[cfg(target_arch = "x86")]
unsafe fn unhash_proc(proc: *mut Proc) {
    (*proc).hash_link.del();
}

/// Look a live proc up by pid.
pub fn find_proc(pid: i32) -> *mut Proc {
    if pid <= 0 || pid >= MAX_PID {
        return ptr::null_mut();
    }
    unsafe {
        let list = &mut HASH_LIST[pid_hashfn(pid)] as *mut ListEntry;
        let mut le = (*list).next();
        while le != list {
            let proc = le2proc_hash(le);
            if (*proc).pid == pid {
                return proc;
            }
            le = (*le).next();
        }
    }
    ptr::null_mut()
}

#[cfg(target_arch = "x86")]
/// Two pages of kernel stack, owned by the proc until `do_wait` reaps it.
fn setup_kstack(proc: *mut Proc) -> Result<()> {
    let page = pmm::alloc_pages(KSTACK_PAGE);
    if page.is_null() {
        return Err(KernelError::NoMem);
    }
    unsafe {
        (*proc).kstack = pmm::page2kva(page);
    }
    Ok(())
}

#[cfg(target_arch = "x86")]
unsafe fn put_kstack(proc: *mut Proc) {
    pmm::free_pages(pmm::kva2page((*proc).kstack), KSTACK_PAGE);
}

/// A fresh page directory: the kernel half of `boot_pgdir` plus its own
/// VPT self-map.
pub fn setup_pgdir(mm: *mut MmStruct) -> Result<()> {
    let page = pmm::alloc_page();
    if page.is_null() {
        return Err(KernelError::NoMem);
    }
    unsafe {
        let pgdir = pmm::page2kva(page) as *mut usize;
        ptr::copy_nonoverlapping(pmm::BOOT_PGDIR as *const usize, pgdir, PG_SIZE / 4);
        *pgdir.add(pdx(VPT)) = pmm::page2pa(page) | PTE_P | PTE_W;
        (*mm).pgdir = pgdir;
    }
    Ok(())
}

pub unsafe fn put_pgdir(mm: *mut MmStruct) {
    pmm::free_page(pmm::kva2page((*mm).pgdir as usize));
}

#[cfg(target_arch = "x86")]
/// Share or duplicate the parent's file table.
unsafe fn copy_fs(clone_flags: u32, proc: *mut Proc) -> Result<()> {
    let old_filesp = (*CURRENT).filesp;
    assert!(!old_filesp.is_null());

    let filesp = if clone_flags & CLONE_FS != 0 {
        old_filesp
    } else {
        let filesp = crate::sysfile::files_create();
        if let Err(e) = crate::sysfile::dup_fs(filesp, old_filesp) {
            crate::sysfile::files_destroy(filesp);
            return Err(e);
        }
        filesp
    };
    crate::sysfile::files_count_inc(filesp);
    (*proc).filesp = filesp;
    Ok(())
}

#[cfg(target_arch = "x86")]
unsafe fn put_fs(proc: *mut Proc) {
    let filesp = (*proc).filesp;
    if !filesp.is_null() {
        if crate::sysfile::files_count_dec(filesp) == 0 {
            crate::sysfile::files_destroy(filesp);
        }
    }
}

/// Share or deep-copy the parent's address space.
#[cfg(target_arch = "x86")]
unsafe fn copy_mm(clone_flags: u32, proc: *mut Proc) -> Result<()> {
    let oldmm = (*CURRENT).mm;
    if oldmm.is_null() {
        // kernel threads have no user half
        return Ok(());
    }

    let mm = if clone_flags & CLONE_VM != 0 {
        oldmm
    } else {
        let mm = vmm::mm_create();
        if let Err(e) = setup_pgdir(mm) {
            vmm::mm_destroy(mm);
            return Err(e);
        }

        vmm::lock_mm(oldmm);
        let ret = vmm::dup_mmap(mm, oldmm);
        vmm::unlock_mm(oldmm);

        if let Err(e) = ret {
            vmm::exit_mmap(mm);
            put_pgdir(mm);
            vmm::mm_destroy(mm);
            return Err(e);
        }
        mm
    };

    vmm::mm_count_inc(mm);
    (*proc).mm = mm;
    (*proc).cr3 = pmm::paddr((*mm).pgdir as usize);
    Ok(())
}

/// Plant the child's trap frame at the top of its kernel stack and aim
/// its first context switch at the trap-return path.
#[cfg(target_arch = "x86")]
unsafe fn copy_thread(proc: *mut Proc, esp: usize, tf: *const TrapFrame) {
    let slot = ((*proc).kstack + KSTACK_SIZE) as *mut TrapFrame;
    let child_tf = slot.offset(-1);
    *child_tf = *tf;
    (*child_tf).tf_regs.reg_eax = 0; // fork returns 0 in the child
    (*child_tf).tf_esp = esp as u32;
    (*child_tf).tf_eflags |= i386::FL_IF as u32;

    (*proc).tf = child_tf;
    (*proc).context.eip = forkret as usize as u32;
    (*proc).context.esp = child_tf as u32;
}

/// Create a child process.
///
/// `stack` is the parent's user stack pointer, 0 to fork a kernel thread.
/// Returns the child pid to the caller; the child itself resumes in
/// `forkret` and leaves through the trap-return path with EAX = 0.
#[cfg(target_arch = "x86")]
pub unsafe fn do_fork(clone_flags: u32, stack: usize, tf: *const TrapFrame) -> Result<i32> {
    if N_PROCESS >= MAX_PROCESS {
        return Err(KernelError::NoFreeProc);
    }

    let proc = alloc_proc();
    (*proc).parent = CURRENT;

    if let Err(e) = setup_kstack(proc) {
        drop(Box::from_raw(proc));
        return Err(e);
    }
    if let Err(e) = copy_fs(clone_flags, proc) {
        put_kstack(proc);
        drop(Box::from_raw(proc));
        return Err(e);
    }
    if let Err(e) = copy_mm(clone_flags, proc) {
        put_fs(proc);
        put_kstack(proc);
        drop(Box::from_raw(proc));
        return Err(e);
    }
    copy_thread(proc, stack, tf);

    {
        let _intr = local_intr_save();
        (*proc).pid = get_pid();
        hash_proc(proc);
        set_links(proc);
    }

    sched::wakeup_proc(proc);
    Ok((*proc).pid)
}

/// Release everything but the kernel stack and the proc struct, become a
/// Zombie, hand surviving children to init, wake the reaper, leave.
///
/// `extern "C"` + unmangled: `kernel_thread_entry` tail-calls this from
/// assembly with the thread's return value.
#[cfg(target_arch = "x86")]
#[no_mangle]
pub unsafe extern "C" fn do_exit(error_code: i32) -> ! {
    if CURRENT == IDLE_PROC {
        panic!("idleproc exit.");
    }
    if CURRENT == INIT_PROC {
        panic!("initproc exit.");
    }

    let mm = (*CURRENT).mm;
    if !mm.is_null() {
        // run on the kernel page table while the user half is torn down
        i386::lcr3(pmm::BOOT_CR3);
        if vmm::mm_count_dec(mm) == 0 {
            vmm::exit_mmap(mm);
            put_pgdir(mm);
            vmm::mm_destroy(mm);
        }
        (*CURRENT).mm = ptr::null_mut();
    }
    put_fs(CURRENT);
    (*CURRENT).filesp = ptr::null_mut();
    (*CURRENT).state = ProcState::Zombie;
    (*CURRENT).exit_code = error_code;

    {
        let _intr = local_intr_save();
        let parent = (*CURRENT).parent;
        if (*parent).wait_state == WT_CHILD {
            sched::wakeup_proc(parent);
        }
        // reparent surviving children to init
        while !(*CURRENT).cptr.is_null() {
            let child = (*CURRENT).cptr;
            (*CURRENT).cptr = (*child).optr;

            (*child).yptr = ptr::null_mut();
            (*child).optr = (*INIT_PROC).cptr;
            if !(*child).optr.is_null() {
                (*(*INIT_PROC).cptr).yptr = child;
            }
            (*child).parent = INIT_PROC;
            (*INIT_PROC).cptr = child;
            if (*child).state == ProcState::Zombie && (*INIT_PROC).wait_state == WT_CHILD {
                sched::wakeup_proc(INIT_PROC);
            }
        }
    }

    sched::schedule();
    panic!("do_exit will not return!! pid {}.", (*CURRENT).pid);
}

/// Wait for child `pid` (or any child when 0) to become a Zombie, store
/// its exit code to user memory, and free its last resources.
#[cfg(target_arch = "x86")]
pub unsafe fn do_wait(pid: i32, code_store: usize) -> Result<()> {
    let mm = (*CURRENT).mm;
    if code_store != 0 {
        if !vmm::user_mem_check(mm, code_store, core::mem::size_of::<i32>(), true) {
            return Err(KernelError::Invalid);
        }
    }

    let zombie = loop {
        let mut haskid = false;
        let mut found: *mut Proc = ptr::null_mut();
        if pid != 0 {
            let proc = find_proc(pid);
            if !proc.is_null() && (*proc).parent == CURRENT {
                haskid = true;
                if (*proc).state == ProcState::Zombie {
                    found = proc;
                }
            }
        } else {
            let mut proc = (*CURRENT).cptr;
            while !proc.is_null() {
                haskid = true;
                if (*proc).state == ProcState::Zombie {
                    found = proc;
                    break;
                }
                proc = (*proc).optr;
            }
        }

        if !found.is_null() {
            break found;
        }
        if !haskid {
            return Err(KernelError::BadProc);
        }

        (*CURRENT).state = ProcState::Sleeping;
        (*CURRENT).wait_state = WT_CHILD;
        sched::schedule();
        if (*CURRENT).flags.contains(ProcFlags::EXITING) {
            do_exit(KernelError::Killed.code());
        }
    };

    if zombie == IDLE_PROC || zombie == INIT_PROC {
        panic!("wait idleproc or initproc.");
    }
    if code_store != 0 {
        let code = (*zombie).exit_code;
        if !vmm::copy_to_user(mm, code_store, &code as *const i32 as *const u8, 4) {
            return Err(KernelError::Invalid);
        }
    }
    {
        let _intr = local_intr_save();
        unhash_proc(zombie);
        remove_links(zombie);
    }
    put_kstack(zombie);
    drop(Box::from_raw(zombie));
    Ok(())
}

/// Ask the scheduler to move on at the next opportunity.
pub fn do_yield() -> Result<i32> {
    unsafe {
        (*CURRENT).need_resched = true;
    }
    Ok(0)
}

/// Flag `pid` for termination; break it out of an interruptible wait.
pub fn do_kill(pid: i32) -> Result<i32> {
    let proc = find_proc(pid);
    if proc.is_null() {
        return Err(KernelError::Invalid);
    }
    unsafe {
        if (*proc).flags.contains(ProcFlags::EXITING) {
            return Err(KernelError::Killed);
        }
        (*proc).flags |= ProcFlags::EXITING;
        if (*proc).wait_state & WT_INTERRUPTED != 0 {
            sched::wakeup_proc(proc);
        }
    }
    Ok(0)
}

/* the first switch into a new proc lands here */

#[cfg(target_arch = "x86")]
extern "C" {
    fn forkrets(tf: *mut TrapFrame) -> !;
    fn kernel_thread_entry();
    fn switch_to(from: *mut Context, to: *const Context);
    static mut bootstack: u8;
}

#[cfg(target_arch = "x86")]
extern "C" fn forkret() -> ! {
    unsafe { forkrets((*CURRENT).tf) }
}

/// Switch to `proc`: kernel stack top into the TSS, its page directory
/// into CR3, then the register context.
#[cfg(target_arch = "x86")]
pub unsafe fn proc_run(proc: *mut Proc) {
    if proc != CURRENT {
        let _intr = local_intr_save();
        let prev = CURRENT;
        CURRENT = proc;
        pmm::load_esp0((*proc).kstack + KSTACK_SIZE);
        i386::lcr3((*proc).cr3);
        switch_to(&mut (*prev).context, &(*proc).context);
    }
}

/// Spawn a kernel thread running `func(arg)`, sharing the kernel mm.
#[cfg(target_arch = "x86")]
pub unsafe fn kernel_thread(func: extern "C" fn(usize) -> i32, arg: usize, clone_flags: u32) -> Result<i32> {
    let mut tf: TrapFrame = core::mem::zeroed();
    tf.tf_cs = crate::memlayout::KERNEL_CS;
    tf.tf_ds = crate::memlayout::KERNEL_DS;
    tf.tf_es = crate::memlayout::KERNEL_DS;
    tf.tf_ss = crate::memlayout::KERNEL_DS;
    tf.tf_regs.reg_ebx = func as usize as u32;
    tf.tf_regs.reg_edx = arg as u32;
    tf.tf_eip = kernel_thread_entry as usize as u32;
    do_fork(clone_flags | CLONE_VM, 0, &tf)
}

/// `int 0x80` from kernel context, used by the bootstrap threads to exec
/// a user image through the normal syscall path.
#[cfg(target_arch = "x86")]
unsafe fn kernel_execve(name: &[u8], argv: &[*const u8]) -> i32 {
    let ret: i32;
    // ebx is reserved by LLVM on x86, so it is juggled by hand
    core::arch::asm!(
        "push ebx",
        "mov ebx, {argv}",
        "int 0x80",
        "pop ebx",
        argv = in(reg) argv.as_ptr(),
        inlateout("eax") crate::syscall::SYS_EXEC => ret,
        in("edx") name.as_ptr(),
        in("ecx") argv.len(),
    );
    ret
}

/// Kernel thread that replaces itself with the user bootstrap program.
#[cfg(target_arch = "x86")]
extern "C" fn user_main(_arg: usize) -> i32 {
    unsafe {
        crate::cprintf!(
            "kernel_execve: pid = {}, name = \"user\".\n",
            (*CURRENT).pid
        );
        // NUL-terminated, the way the exec path reads user strings
        let name = b"user\0";
        let argv: [*const u8; 1] = [name.as_ptr()];
        kernel_execve(name, &argv);
    }
    panic!("user_main execve failed.");
}

/// Second kernel thread: spawn the user bootstrap, reap children, check
/// that everything came back.
#[cfg(target_arch = "x86")]
extern "C" fn init_main(_arg: usize) -> i32 {
    unsafe {
        let n_free_pages_store = pmm::n_free_pages();
        let kernel_allocated_store = crate::kmalloc::kallocated();

        kernel_thread(user_main, 0, 0).expect("create user_main failed.");

        while do_wait(0, 0).is_ok() {
            sched::schedule();
        }

        crate::cprintf!("all user-mode processes have quit.\n");
        assert!((*INIT_PROC).cptr.is_null() && (*INIT_PROC).yptr.is_null() && (*INIT_PROC).optr.is_null());
        assert!(N_PROCESS == 2);
        assert!(n_free_pages_store == pmm::n_free_pages());
        assert!(kernel_allocated_store == crate::kmalloc::kallocated());
        crate::cprintf!("init check memory pass.\n");
        0
    }
}

/// Make idle out of the boot thread, then fork init.
#[cfg(target_arch = "x86")]
pub fn proc_init() {
    unsafe {
        PROC_LIST.init();
        for le in HASH_LIST.iter_mut() {
            le.init();
        }

        let idle = alloc_proc();
        (*idle).pid = 0;
        (*idle).state = ProcState::Runnable;
        (*idle).kstack = &raw mut bootstack as usize;
        (*idle).need_resched = true;
        (*idle).filesp = crate::sysfile::files_create();
        crate::sysfile::files_count_inc((*idle).filesp);
        set_proc_name(idle, "idle");
        N_PROCESS += 1;

        IDLE_PROC = idle;
        CURRENT = idle;

        let pid = kernel_thread(init_main, 0, 0).expect("create init_main failed.");
        INIT_PROC = find_proc(pid);
        set_proc_name(INIT_PROC, "init");
        (*INIT_PROC).priority = 1;
    }
}

/// What the boot thread does forever after `kern_init` finishes.
#[cfg(target_arch = "x86")]
pub fn cpu_idle() -> ! {
    loop {
        unsafe {
            if (*CURRENT).need_resched {
                sched::schedule();
            }
        }
    }
}
