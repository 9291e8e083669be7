//! Trap and interrupt dispatch.
//!
//! 256 16-byte stubs push a unified (error code, vector) pair and fall
//! into a common entry that builds the `TrapFrame` and calls `trap()`.
//! The IDT points every vector at its stub; only the syscall gate is
//! reachable from ring 3.

use crate::cprintf;
use crate::memlayout::KERNEL_CS;
use crate::picirq::IRQ_OFFSET;

/* trap numbers (processor-defined) */
pub const T_DIVIDE: u32 = 0; // divide error
pub const T_DEBUG: u32 = 1;
pub const T_NMI: u32 = 2;
pub const T_BRKPT: u32 = 3;
pub const T_OFLOW: u32 = 4;
pub const T_BOUND: u32 = 5;
pub const T_ILLOP: u32 = 6; // illegal opcode
pub const T_DEVICE: u32 = 7;
pub const T_DBLFLT: u32 = 8;
pub const T_TSS: u32 = 10;
pub const T_SEGNP: u32 = 11;
pub const T_STACK: u32 = 12;
pub const T_GPFLT: u32 = 13;
pub const T_PGFLT: u32 = 14;
pub const T_FPERR: u32 = 16;
pub const T_ALIGN: u32 = 17;
pub const T_MCHK: u32 = 18;
pub const T_SIMDERR: u32 = 19;

/// `int 0x80`, the only user-reachable gate.
pub const T_SYSCALL: u32 = 0x80;

/// General registers in `pushal` order (EDI lowest).
#[derive(Clone, Copy)]
#[repr(C)]
pub struct PushRegs {
    pub reg_edi: u32,
    pub reg_esi: u32,
    pub reg_ebp: u32,
    pub reg_oesp: u32, // where pushal stashed esp, useless
    pub reg_ebx: u32,
    pub reg_edx: u32,
    pub reg_ecx: u32,
    pub reg_eax: u32,
}

/// The frame the common trap entry leaves on the kernel stack. The last
/// two fields only exist when the trap crossed privilege levels.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct TrapFrame {
    pub tf_regs: PushRegs,
    pub tf_gs: u16,
    tf_padding0: u16,
    pub tf_fs: u16,
    tf_padding1: u16,
    pub tf_es: u16,
    tf_padding2: u16,
    pub tf_ds: u16,
    tf_padding3: u16,
    pub tf_trapno: u32,
    /* pushed by the hardware, or a stub's 0 */
    pub tf_err: u32,
    pub tf_eip: u32,
    pub tf_cs: u16,
    tf_padding4: u16,
    pub tf_eflags: u32,
    /* below here only on a privilege-level crossing */
    pub tf_esp: u32,
    pub tf_ss: u16,
    tf_padding5: u16,
}

fn trap_name(trapno: u32) -> &'static str {
    const EXCNAMES: [&str; 20] = [
        "Divide error",
        "Debug",
        "Non-Maskable Interrupt",
        "Breakpoint",
        "Overflow",
        "BOUND Range Exceeded",
        "Invalid Opcode",
        "Device Not Available",
        "Double Fault",
        "Coprocessor Segment Overrun",
        "Invalid TSS",
        "Segment Not Present",
        "Stack Fault",
        "General Protection",
        "Page Fault",
        "(unknown trap)",
        "x87 FPU Floating-Point Error",
        "Alignment Check",
        "Machine-Check",
        "SIMD Floating-Point Exception",
    ];
    if (trapno as usize) < EXCNAMES.len() {
        return EXCNAMES[trapno as usize];
    }
    if trapno as usize >= IRQ_OFFSET && (trapno as usize) < IRQ_OFFSET + 16 {
        return "Hardware Interrupt";
    }
    "(unknown trap)"
}

pub fn print_regs(regs: &PushRegs) {
    cprintf!("  edi  0x{:08x}\n", regs.reg_edi);
    cprintf!("  esi  0x{:08x}\n", regs.reg_esi);
    cprintf!("  ebp  0x{:08x}\n", regs.reg_ebp);
    cprintf!("  esp  0x{:08x}\n", regs.reg_oesp);
    cprintf!("  ebx  0x{:08x}\n", regs.reg_ebx);
    cprintf!("  edx  0x{:08x}\n", regs.reg_edx);
    cprintf!("  ecx  0x{:08x}\n", regs.reg_ecx);
    cprintf!("  eax  0x{:08x}\n", regs.reg_eax);
}

const IA32FLAGS: [Option<&str>; 22] = [
    Some("CF"),
    None,
    Some("PF"),
    None,
    Some("AF"),
    None,
    Some("ZF"),
    Some("SF"),
    Some("TF"),
    Some("IF"),
    Some("DF"),
    Some("OF"),
    None,
    None,
    Some("NT"),
    None,
    Some("RF"),
    Some("VM"),
    Some("AC"),
    Some("VIF"),
    Some("VIP"),
    Some("ID"),
];

pub fn print_trap_frame(tf: &TrapFrame) {
    cprintf!("trapframe at {:p}\n", tf as *const TrapFrame);
    print_regs(&tf.tf_regs);
    cprintf!("  ds   0x----{:04x}\n", tf.tf_ds);
    cprintf!("  es   0x----{:04x}\n", tf.tf_es);
    cprintf!("  fs   0x----{:04x}\n", tf.tf_fs);
    cprintf!("  gs   0x----{:04x}\n", tf.tf_gs);
    cprintf!("  trap 0x{:08x} {}\n", tf.tf_trapno, trap_name(tf.tf_trapno));
    cprintf!("  err  0x{:08x}\n", tf.tf_err);
    cprintf!("  eip  0x{:08x}\n", tf.tf_eip);
    cprintf!("  cs   0x----{:04x}\n", tf.tf_cs);
    cprintf!("  flag 0x{:08x} ", tf.tf_eflags);
    for (i, name) in IA32FLAGS.iter().enumerate() {
        if tf.tf_eflags & (1 << i) != 0 {
            if let Some(name) = name {
                cprintf!("{},", name);
            }
        }
    }
    cprintf!("IOPL={}\n", (tf.tf_eflags >> 12) & 3);

    if !trap_in_kernel(tf) {
        cprintf!("  esp  0x{:08x}\n", tf.tf_esp);
        cprintf!("  ss   0x----{:04x}\n", tf.tf_ss);
    }
}

/// Did this trap interrupt kernel code?
pub fn trap_in_kernel(tf: &TrapFrame) -> bool {
    tf.tf_cs == KERNEL_CS
}

/*
 * 256 trap stubs at a fixed 16-byte stride. Vectors 8, 10-14 and 17 get
 * a hardware error code; every other stub pushes a 0 so the frame layout
 * is uniform. The common entry saves segments and registers, loads the
 * kernel data segments and hands the frame to trap().
 */
#[cfg(target_arch = "x86")]
core::arch::global_asm!(
    r#"
.text
.globl __vector_stubs
.p2align 4
__vector_stubs:
.set i, 0
.rept 256
.p2align 4
.if (i == 8) || ((i >= 10) && (i <= 14)) || (i == 17)
.else
    pushl $0
.endif
    pushl $i
    jmp __alltraps
.set i, i + 1
.endr

.globl __alltraps
__alltraps:
    pushl %ds
    pushl %es
    pushl %fs
    pushl %gs
    pushal

    movl $0x10, %eax        # GD_KDATA
    movw %ax, %ds
    movw %ax, %es

    pushl %esp              # trap(tf)
    call trap
    popl %esp

.globl __trapret
__trapret:
    popal
    popl %gs
    popl %fs
    popl %es
    popl %ds
    addl $0x8, %esp         # trapno, error code
    iret

# forkrets(tf): first return of a forked thread, straight out of the
# prepared trap frame
.globl forkrets
forkrets:
    movl 4(%esp), %esp
    jmp __trapret

# switch_to(from, to): save callee-saved context, load the next one
.globl switch_to
switch_to:
    movl 4(%esp), %eax      # from
    popl 0(%eax)            # eip, the return address
    movl %esp, 4(%eax)
    movl %ebx, 8(%eax)
    movl %ecx, 12(%eax)
    movl %edx, 16(%eax)
    movl %esi, 20(%eax)
    movl %edi, 24(%eax)
    movl %ebp, 28(%eax)

    movl 4(%esp), %eax      # to
    movl 28(%eax), %ebp
    movl 24(%eax), %edi
    movl 20(%eax), %esi
    movl 16(%eax), %edx
    movl 12(%eax), %ecx
    movl 8(%eax), %ebx
    movl 4(%eax), %esp
    pushl 0(%eax)           # eip
    ret

# kernel_thread_entry: %ebx = fn, %edx = arg; exit with the return value
.globl kernel_thread_entry
kernel_thread_entry:
    pushl %edx
    call *%ebx
    pushl %eax
    call do_exit
"#,
    options(att_syntax)
);

#[cfg(target_arch = "x86")]
extern "C" {
    static __vector_stubs: u8;
}

#[cfg(target_arch = "x86")]
static mut IDT: [i386::GateDesc; 256] = [i386::GateDesc::zero(); 256];

/// Fill the IDT: one interrupt gate per vector, the syscall trap gate
/// alone opened to ring 3.
#[cfg(target_arch = "x86")]
pub fn idt_init() {
    use crate::memlayout::GD_KTEXT;
    use i386::{lidt, DtDesc, GateDesc, DPL_KERNEL, DPL_USER};

    unsafe {
        let base = &raw const __vector_stubs as usize;
        for (i, gate) in IDT.iter_mut().enumerate() {
            *gate = GateDesc::intr_gate((base + i * 16) as u32, GD_KTEXT, DPL_KERNEL);
        }
        // int 0x80 must be callable from user mode, and keeps IF set
        IDT[T_SYSCALL as usize] = GateDesc::trap_gate(
            (base + T_SYSCALL as usize * 16) as u32,
            GD_KTEXT,
            DPL_USER,
        );

        let idt_pd = DtDesc {
            pd_lim: core::mem::size_of_val(&IDT) as u16 - 1,
            pd_base: IDT.as_ptr() as usize as u32,
        };
        lidt(&idt_pd);
    }
}

#[cfg(target_arch = "x86")]
fn print_pgfault(tf: &TrapFrame) {
    // bit 0: protection fault vs no page; bit 1: write; bit 2: user mode
    cprintf!(
        "page fault at 0x{:08x}: {}/{} [{}].\n",
        i386::rcr2(),
        if tf.tf_err & 4 != 0 { 'U' } else { 'K' },
        if tf.tf_err & 2 != 0 { 'W' } else { 'R' },
        if tf.tf_err & 1 != 0 {
            "protection fault"
        } else {
            "no page found"
        }
    );
}

#[cfg(target_arch = "x86")]
fn pgfault_handler(tf: &mut TrapFrame) -> crate::error::Result<()> {
    use crate::proc;
    print_pgfault(tf);

    let cur = proc::current();
    if cur.is_null() {
        print_trap_frame(tf);
        panic!("page fault before process management is up.");
    }
    let mm = unsafe { (*cur).mm };
    if mm.is_null() {
        print_trap_frame(tf);
        panic!("page fault in a kernel thread without an mm.");
    }
    unsafe { crate::vmm::do_pgfault(mm, tf.tf_err, i386::rcr2()) }
}

#[cfg(target_arch = "x86")]
fn trap_dispatch(tf: &mut TrapFrame) {
    use crate::param::TICK_NUM;
    use crate::proc;
    use crate::{clock, console, picirq, sched, syscall};

    match tf.tf_trapno {
        T_PGFLT => {
            if let Err(e) = pgfault_handler(tf) {
                print_trap_frame(tf);
                if proc::current().is_null() || trap_in_kernel(tf) {
                    panic!("handle pgfault failed. {}", e);
                }
                cprintf!("killed by kernel.\n");
                unsafe {
                    proc::do_exit(crate::error::KernelError::Killed.code());
                }
            }
        }
        T_SYSCALL => unsafe {
            syscall::syscall(tf);
        },
        n if n as usize == IRQ_OFFSET + picirq::IRQ_TIMER as usize => {
            let ticks = clock::tick();
            sched::sched_tick(proc::current());
            if ticks % TICK_NUM == 0 {
                cprintf!("{} ticks\n", TICK_NUM);
            }
        }
        n if n as usize == IRQ_OFFSET + picirq::IRQ_COM1 as usize => {
            console::serial_intr();
        }
        n if n as usize == IRQ_OFFSET + picirq::IRQ_KBD as usize => {
            console::kbd_intr();
        }
        n if n as usize == IRQ_OFFSET + picirq::IRQ_IDE1 as usize
            || n as usize == IRQ_OFFSET + picirq::IRQ_IDE2 as usize =>
        {
            // polled driver, nothing to do
        }
        _ => {
            if trap_in_kernel(tf) {
                print_trap_frame(tf);
                panic!("unexpected trap in kernel.");
            }
            // a stray user trap just kills the process
            print_trap_frame(tf);
            unsafe {
                proc::do_exit(crate::error::KernelError::Killed.code());
            }
        }
    }

    // the cascaded slave needs its EOI by hand
    let trapno = tf.tf_trapno as usize;
    if (IRQ_OFFSET + 8..IRQ_OFFSET + 16).contains(&trapno) {
        picirq::pic_send_eoi_slave();
    }
}

/// Common trap entry. Chains `proc.tf` across nested traps; on the way
/// back to user mode runs the EXITING check and the deferred reschedule.
#[cfg(target_arch = "x86")]
#[no_mangle]
pub extern "C" fn trap(tf: *mut TrapFrame) {
    use crate::proc::{self, ProcFlags};

    unsafe {
        let tf = &mut *tf;
        let cur = proc::current();
        if cur.is_null() {
            trap_dispatch(tf);
            return;
        }

        let otf = (*cur).tf;
        (*cur).tf = tf;
        let in_kernel = trap_in_kernel(tf);

        trap_dispatch(tf);

        (*cur).tf = otf;
        if !in_kernel {
            if (*cur).flags.contains(ProcFlags::EXITING) {
                proc::do_exit(crate::error::KernelError::Killed.code());
            }
            if (*cur).need_resched {
                crate::sched::schedule();
            }
        }
    }
}
