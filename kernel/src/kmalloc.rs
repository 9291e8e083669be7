//! Kernel heap backing `alloc::boxed::Box` for proc/mm/vma objects.
//!
//! A fixed slab of pages is taken from the physical allocator once at boot
//! and handed to the list allocator; page frames themselves never come
//! from here.

use linked_list_allocator::LockedHeap;

use crate::memlayout::PG_SIZE;
use crate::param::KHEAP_PAGES;
use crate::pmm;

#[cfg_attr(all(target_arch = "x86", not(test)), global_allocator)]
static HEAP: LockedHeap = LockedHeap::empty();

pub fn kmalloc_init() {
    unsafe {
        let base = pmm::alloc_pages(KHEAP_PAGES);
        assert!(!base.is_null(), "kmalloc_init: no memory for the kernel heap");
        HEAP.lock()
            .init(pmm::page2kva(base) as *mut u8, KHEAP_PAGES * PG_SIZE);
    }
    log::info!("kernel heap: {} KiB", KHEAP_PAGES * PG_SIZE / 1024);
}

/// Bytes currently handed out, for the leak checks around process exit.
pub fn kallocated() -> usize {
    HEAP.lock().used()
}
