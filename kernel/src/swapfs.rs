//! Swap backing store: page-sized reads and writes against the swap disk,
//! addressed by swap entry.

use crate::error::Result;
use crate::ide::{ide_device_size, ide_device_valid, ide_read_secs, ide_write_secs, SECT_SIZE};
use crate::memlayout::{Page, PG_SIZE};
use crate::pmm::page2kva;
use crate::swap::{set_max_swap_offset, swap_offset, SwapEntry};

/// The swap area lives on the primary-channel slave disk.
pub const SWAP_DEV_NO: usize = 1;

/// Sectors per page.
pub const PAGE_NSECT: usize = PG_SIZE / SECT_SIZE;

pub fn swapfs_init() {
    const _: () = assert!(PG_SIZE % SECT_SIZE == 0);
    if !ide_device_valid(SWAP_DEV_NO) {
        panic!("swap fs isn't available.");
    }
    set_max_swap_offset(ide_device_size(SWAP_DEV_NO) / PAGE_NSECT);
}

pub unsafe fn swapfs_read(entry: SwapEntry, page: *mut Page) -> Result<()> {
    ide_read_secs(
        SWAP_DEV_NO,
        swap_offset(entry) * PAGE_NSECT,
        page2kva(page) as *mut u8,
        PAGE_NSECT,
    )
}

pub unsafe fn swapfs_write(entry: SwapEntry, page: *mut Page) -> Result<()> {
    ide_write_secs(
        SWAP_DEV_NO,
        swap_offset(entry) * PAGE_NSECT,
        page2kva(page) as *const u8,
        PAGE_NSECT,
    )
}
