//! 8253 programmable interval timer, IRQ 0 at 100 Hz.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::picirq::{pic_enable, IRQ_TIMER};
use i386::outb;

const IO_TIMER1: u16 = 0x040;

const TIMER_FREQ: u32 = 1_193_182;
const fn timer_div(freq: u32) -> u32 {
    (TIMER_FREQ + freq / 2) / freq
}

// control word: counter 0, LSB then MSB, mode 2 (rate generator)
const TIMER_MODE: u16 = IO_TIMER1 + 3;
const TIMER_SEL0: u8 = 0x00;
const TIMER_RATEGEN: u8 = 0x04;
const TIMER_16BIT: u8 = 0x30;

/// Timer interrupts since boot.
pub static TICKS: AtomicUsize = AtomicUsize::new(0);

pub fn clock_init() {
    outb(TIMER_MODE, TIMER_SEL0 | TIMER_RATEGEN | TIMER_16BIT);
    outb(IO_TIMER1, (timer_div(100) % 256) as u8);
    outb(IO_TIMER1, (timer_div(100) / 256) as u8);

    TICKS.store(0, Ordering::Relaxed);

    pic_enable(IRQ_TIMER);
    log::info!("++ setup timer interrupts");
}

pub fn tick() -> usize {
    TICKS.fetch_add(1, Ordering::Relaxed) + 1
}

pub fn system_read_timer() -> usize {
    TICKS.load(Ordering::Relaxed)
}
