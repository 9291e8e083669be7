use core::arch::asm;

bitflags::bitflags! {
    /// EFLAGS register bits.
    pub struct Eflags: usize {
        const CF   = 1 << 0;  // carry
        const PF   = 1 << 2;  // parity
        const AF   = 1 << 4;  // aux carry
        const ZF   = 1 << 6;  // zero
        const SF   = 1 << 7;  // sign
        const TF   = 1 << 8;  // trap (single step)
        const IF   = 1 << 9;  // interrupt enable
        const DF   = 1 << 10; // direction
        const OF   = 1 << 11; // overflow
        const IOPL = 3 << 12; // I/O privilege level
        const NT   = 1 << 14; // nested task
        const RF   = 1 << 16; // resume
        const VM   = 1 << 17; // virtual 8086 mode
        const AC   = 1 << 18; // alignment check
        const ID   = 1 << 21; // cpuid available
    }
}

pub const FL_IF: usize = Eflags::IF.bits();
pub const FL_IOPL_MASK: usize = Eflags::IOPL.bits();

/* Control Register flags */
pub const CR0_PE: usize = 0x0000_0001; // Protection Enable
pub const CR0_MP: usize = 0x0000_0002; // Monitor coProcessor
pub const CR0_EM: usize = 0x0000_0004; // Emulation
pub const CR0_TS: usize = 0x0000_0008; // Task Switched
pub const CR0_NE: usize = 0x0000_0020; // Numeric Error
pub const CR0_WP: usize = 0x0001_0000; // Write Protect
pub const CR0_AM: usize = 0x0004_0000; // Alignment Mask
pub const CR0_PG: usize = 0x8000_0000; // Paging

pub const CR4_PSE: usize = 0x0000_0010; // Page Size Extensions

#[inline]
pub fn read_eflags() -> usize {
    let f: usize;
    unsafe {
        asm!("pushf", "pop {}", out(reg) f, options(preserves_flags));
    }
    f
}

#[inline]
pub fn rcr0() -> usize {
    let r: usize;
    unsafe {
        asm!("mov {}, cr0", out(reg) r, options(nomem, nostack, preserves_flags));
    }
    r
}

#[inline]
pub fn lcr0(val: usize) {
    unsafe {
        asm!("mov cr0, {}", in(reg) val, options(nomem, nostack, preserves_flags));
    }
}

/// Faulting linear address of the last page fault.
#[inline]
pub fn rcr2() -> usize {
    let r: usize;
    unsafe {
        asm!("mov {}, cr2", out(reg) r, options(nomem, nostack, preserves_flags));
    }
    r
}

#[inline]
pub fn rcr3() -> usize {
    let r: usize;
    unsafe {
        asm!("mov {}, cr3", out(reg) r, options(nomem, nostack, preserves_flags));
    }
    r
}

/// Load the page-directory base register. Reloads the whole TLB.
#[inline]
pub fn lcr3(pa: usize) {
    unsafe {
        asm!("mov cr3, {}", in(reg) pa, options(nomem, nostack, preserves_flags));
    }
}

#[inline]
pub fn rcr4() -> usize {
    let r: usize;
    unsafe {
        asm!("mov {}, cr4", out(reg) r, options(nomem, nostack, preserves_flags));
    }
    r
}

#[inline]
pub fn lcr4(val: usize) {
    unsafe {
        asm!("mov cr4, {}", in(reg) val, options(nomem, nostack, preserves_flags));
    }
}

/// Invalidate the TLB entry for one linear address.
#[inline]
pub fn invlpg(la: usize) {
    unsafe {
        asm!("invlpg [{}]", in(reg) la, options(nostack, preserves_flags));
    }
}

/// Enable external interrupts.
#[inline]
pub fn sti() {
    unsafe {
        asm!("sti", options(nomem, nostack));
    }
}

/// Disable external interrupts.
#[inline]
pub fn cli() {
    unsafe {
        asm!("cli", options(nomem, nostack));
    }
}

/// Halt until the next interrupt.
#[inline]
pub fn hlt() {
    unsafe {
        asm!("hlt", options(nomem, nostack));
    }
}
