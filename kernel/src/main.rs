//! The bootable kernel image: real-mode loader hand-off, bootstrap
//! paging, the boot stack, and the boot sequence.
//!
//! On non-x86 hosts this builds as an empty stub so `cargo test` can
//! exercise the library crate.

#![cfg_attr(target_arch = "x86", no_std)]
#![cfg_attr(target_arch = "x86", no_main)]

#[cfg(target_arch = "x86")]
mod boot {
    use kernel::cprintf;
    use kernel::{clock, console, ide, kmalloc, picirq, pmm, printf, proc, sched, swap, sysfile, trap};

    /*
     * The boot loader leaves us in 32-bit protected mode at kern_entry,
     * paging off, the e820 map at physical 0x8000. A bootstrap directory
     * of 4 MiB pages maps the first 64 MiB at both 0 and KERN_BASE, just
     * long enough to reach pmm_init's real page table.
     */
    core::arch::global_asm!(
        r#"
.text
.globl kern_entry
kern_entry:
    # bootstrap page directory, by physical address
    movl $__boot_pgdir, %eax
    subl $0xC0000000, %eax
    movl %eax, %cr3

    # 4 MiB pages for the bootstrap window
    movl %cr4, %eax
    orl $0x00000010, %eax       # CR4_PSE
    movl %eax, %cr4

    # paging on: PG | AM | WP | NE | MP | PE, TS and EM off
    movl %cr0, %eax
    orl $0x80050023, %eax
    andl $0xFFFFFFF3, %eax
    movl %eax, %cr0

    # long jump into the high half
    leal 1f, %eax
    jmp *%eax
1:
    movl $bootstack_top, %esp
    movl $0, %ebp

    # clear bss before any Rust runs
    movl $__bss_start, %edi
    movl $__bss_end, %ecx
    subl %edi, %ecx
    xorl %eax, %eax
    cld
    rep stosb

    call kern_init
spin:
    hlt
    jmp spin

.data
.p2align 12
.globl __boot_pgdir
__boot_pgdir:
.set j, 0
.rept 16
    .long (j << 22) | 0x83      # PS | W | P
.set j, j + 1
.endr
.space (768 - 16) * 4
.set j, 0
.rept 16
    .long (j << 22) | 0x83
.set j, j + 1
.endr
.space (1024 - 768 - 16) * 4

.globl bootstack
.p2align 12
bootstack:
    .space 8192                 # KSTACK_SIZE
.globl bootstack_top
bootstack_top:
"#,
        options(att_syntax)
    );

    #[no_mangle]
    pub extern "C" fn kern_init() -> ! {
        console::cons_init();
        printf::log_init();

        cprintf!("\nmica kernel is loading ...\n\n");

        pmm::pmm_init(); // physical pages, boot page table, GDT/TSS
        kmalloc::kmalloc_init(); // kernel heap for boxed objects

        picirq::pic_init(); // 8259A pair
        trap::idt_init(); // trap gates

        sched::sched_init(); // stride run queue
        proc::proc_init(); // idle + init threads

        clock::clock_init(); // 100 Hz timer
        i386::sti();

        ide::ide_init(); // polled disks
        swap::swap_init(); // reclaim policy + swap slots
        sysfile::fs_init(); // program store

        proc::cpu_idle()
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        i386::cli();
        if let Some(loc) = info.location() {
            cprintf!(
                "kernel panic at {}:{}:\n    {}\n",
                loc.file(),
                loc.line(),
                info.message()
            );
        } else {
            cprintf!("kernel panic: {}\n", info.message());
        }
        loop {
            i386::hlt();
        }
    }
}

#[cfg(not(target_arch = "x86"))]
fn main() {}
