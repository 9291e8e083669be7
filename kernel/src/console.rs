//! Console driver: CGA text output plus COM1 serial, keyboard and serial
//! input feeding a ring buffer from IRQ context.

use crate::memlayout::KERN_BASE;
use crate::sync::local_intr_save;
use i386::{inb, outb};

const CGA_BASE: usize = KERN_BASE + 0xB8000;
const CRT_ROWS: usize = 25;
const CRT_COLS: usize = 80;
const CRT_SIZE: usize = CRT_ROWS * CRT_COLS;

// 6845 CRT controller
const ADDR_6845: u16 = 0x3D4;
const DATA_6845: u16 = 0x3D5;

const COM1: u16 = 0x3F8;
const COM_RX: u16 = 0; // in:  receive buffer (DLAB=0)
const COM_TX: u16 = 0; // out: transmit buffer (DLAB=0)
const COM_DLL: u16 = 0; // out: divisor latch low (DLAB=1)
const COM_DLM: u16 = 1; // out: divisor latch high (DLAB=1)
const COM_IER: u16 = 1; // out: interrupt enable register
const COM_IER_RDI: u8 = 0x01; // enable receiver data interrupt
const COM_IIR: u16 = 2; // in: interrupt id register
const COM_FCR: u16 = 2; // out: fifo control register
const COM_LCR: u16 = 3; // out: line control register
const COM_LCR_DLAB: u8 = 0x80;
const COM_LCR_WLEN8: u8 = 0x03;
const COM_MCR: u16 = 4; // out: modem control register
const COM_LSR: u16 = 5; // in: line status register
const COM_LSR_DATA: u8 = 0x01; // data available
const COM_LSR_TXRDY: u8 = 0x20; // transmit buffer avail

const KBSTATP: u16 = 0x64; // kbd controller status port
const KBS_DIB: u8 = 0x01; // kbd data in buffer
const KBDATAP: u16 = 0x60; // kbd data port

static mut CRT_POS: usize = 0;
static mut SERIAL_EXISTS: bool = false;

const CONS_BUF_SIZE: usize = 512;

struct ConsBuf {
    buf: [u8; CONS_BUF_SIZE],
    rpos: usize,
    wpos: usize,
}

static mut CONS: ConsBuf = ConsBuf {
    buf: [0; CONS_BUF_SIZE],
    rpos: 0,
    wpos: 0,
};

fn crt_at() -> *mut u16 {
    CGA_BASE as *mut u16
}

fn cga_init() {
    unsafe {
        // preserve the cursor the boot loader left behind
        outb(ADDR_6845, 14);
        let mut pos = (inb(DATA_6845) as usize) << 8;
        outb(ADDR_6845, 15);
        pos |= inb(DATA_6845) as usize;
        CRT_POS = pos % CRT_SIZE;
    }
}

fn cga_putc(c: u8) {
    unsafe {
        let crt = crt_at();
        match c {
            0x08 => {
                // backspace
                if CRT_POS > 0 {
                    CRT_POS -= 1;
                    crt.add(CRT_POS).write_volatile(0x0700 | b' ' as u16);
                }
            }
            b'\n' => {
                CRT_POS += CRT_COLS;
                CRT_POS -= CRT_POS % CRT_COLS;
            }
            b'\r' => {
                CRT_POS -= CRT_POS % CRT_COLS;
            }
            _ => {
                crt.add(CRT_POS).write_volatile(0x0700 | c as u16);
                CRT_POS += 1;
            }
        }

        // scroll up one row
        if CRT_POS >= CRT_SIZE {
            for i in 0..CRT_SIZE - CRT_COLS {
                crt.add(i).write_volatile(crt.add(i + CRT_COLS).read_volatile());
            }
            for i in CRT_SIZE - CRT_COLS..CRT_SIZE {
                crt.add(i).write_volatile(0x0700 | b' ' as u16);
            }
            CRT_POS -= CRT_COLS;
        }

        outb(ADDR_6845, 14);
        outb(DATA_6845, (CRT_POS >> 8) as u8);
        outb(ADDR_6845, 15);
        outb(DATA_6845, CRT_POS as u8);
    }
}

fn serial_init() {
    // fifo off, 8N1, 115200 baud
    outb(COM1 + COM_FCR, 0);
    outb(COM1 + COM_LCR, COM_LCR_DLAB);
    outb(COM1 + COM_DLL, 1);
    outb(COM1 + COM_DLM, 0);
    outb(COM1 + COM_LCR, COM_LCR_WLEN8);
    outb(COM1 + COM_MCR, 0);
    outb(COM1 + COM_IER, COM_IER_RDI);

    unsafe {
        SERIAL_EXISTS = inb(COM1 + COM_LSR) != 0xFF;
    }
    // drain stale state
    inb(COM1 + COM_IIR);
    inb(COM1 + COM_RX);
}

fn serial_putc_raw(c: u8) {
    let mut patience = 12800;
    while inb(COM1 + COM_LSR) & COM_LSR_TXRDY == 0 && patience > 0 {
        patience -= 1;
    }
    outb(COM1 + COM_TX, c);
}

fn serial_putc(c: u8) {
    if c == 0x08 {
        serial_putc_raw(0x08);
        serial_putc_raw(b' ');
        serial_putc_raw(0x08);
    } else {
        serial_putc_raw(c);
    }
}

/// Stash one byte of input from IRQ context.
unsafe fn cons_intr(c: u8) {
    if c == 0 {
        return;
    }
    let next = (CONS.wpos + 1) % CONS_BUF_SIZE;
    if next != CONS.rpos {
        CONS.buf[CONS.wpos] = c;
        CONS.wpos = next;
    }
}

/// Serial receive interrupt (IRQ 4).
pub fn serial_intr() {
    unsafe {
        if !SERIAL_EXISTS {
            return;
        }
        while inb(COM1 + COM_LSR) & COM_LSR_DATA != 0 {
            let c = inb(COM1 + COM_RX);
            // serial sends DEL for backspace
            cons_intr(if c == 0x7F { 0x08 } else { c });
        }
    }
}

/* scancode set 1, enough for the debug console */
#[rustfmt::skip]
static NORMAL_MAP: [u8; 0x3A] = [
    0, 0x1B, b'1', b'2', b'3', b'4', b'5', b'6',
    b'7', b'8', b'9', b'0', b'-', b'=', 0x08, b'\t',
    b'q', b'w', b'e', b'r', b't', b'y', b'u', b'i',
    b'o', b'p', b'[', b']', b'\n', 0, b'a', b's',
    b'd', b'f', b'g', b'h', b'j', b'k', b'l', b';',
    b'\'', b'`', 0, b'\\', b'z', b'x', b'c', b'v',
    b'b', b'n', b'm', b',', b'.', b'/', 0, b'*',
    0, b' ',
];

/// Keyboard interrupt (IRQ 1).
pub fn kbd_intr() {
    unsafe {
        while inb(KBSTATP) & KBS_DIB != 0 {
            let data = inb(KBDATAP);
            if data & 0x80 != 0 {
                continue; // key release
            }
            let code = data as usize;
            if code < NORMAL_MAP.len() {
                cons_intr(NORMAL_MAP[code]);
            }
        }
    }
}

pub fn cons_init() {
    cga_init();
    serial_init();
}

/// Write one character to screen and serial.
pub fn cons_putc(c: u8) {
    let _intr = local_intr_save();
    cga_putc(c);
    unsafe {
        if SERIAL_EXISTS {
            serial_putc(c);
        }
    }
}

/// Next buffered input character, or 0 when none is pending.
pub fn cons_getc() -> u8 {
    let _intr = local_intr_save();
    // poll, in case a device interrupt got lost
    serial_intr();
    kbd_intr();
    unsafe {
        if CONS.rpos == CONS.wpos {
            return 0;
        }
        let c = CONS.buf[CONS.rpos];
        CONS.rpos = (CONS.rpos + 1) % CONS_BUF_SIZE;
        c
    }
}
