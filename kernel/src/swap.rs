//! Swap: slot allocation on the swap device, the second-chance (clock)
//! reclaim policy over the working-set list, and the eviction/refault
//! paths.
//!
//! A non-present, nonzero PTE holds a swap entry: the slot offset shifted
//! left by 8, so bit 0 (Present) is clear and a zeroed PTE can never be
//! mistaken for one. Slot 0 is reserved.

use alloc::boxed::Box;
use alloc::vec;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::error::{KernelError, Result};
use crate::list::ListEntry;
use crate::memlayout::{Page, PTE_A, PTE_P};
use crate::pmm;
use crate::swapfs;
use crate::sync::local_intr_save;
use crate::to_struct;
use crate::vmm::MmStruct;

pub type SwapEntry = usize;

static SWAP_INIT_OK: AtomicBool = AtomicBool::new(false);

static mut MAX_SWAP_OFFSET: usize = 0;

/// Circular working-set list, insertion order, oldest first. One list for
/// the whole machine, like the rest of the single-CPU kernel state.
static mut PRA_LIST_HEAD: ListEntry = ListEntry::new();

static mut SWAP_MAP: Option<SwapMap> = None;

pub static mut SWAP_OUT_NUM: usize = 0;
pub static mut SWAP_IN_NUM: usize = 0;

pub fn swap_init_ok() -> bool {
    SWAP_INIT_OK.load(Ordering::Relaxed)
}

pub(crate) fn set_max_swap_offset(max: usize) {
    unsafe {
        MAX_SWAP_OFFSET = max;
    }
}

#[inline]
pub fn swap_offset(entry: SwapEntry) -> usize {
    let offset = entry >> 8;
    unsafe {
        assert!(
            offset > 0 && offset < MAX_SWAP_OFFSET,
            "bad swap entry {:#x}",
            entry
        );
    }
    offset
}

#[inline]
pub fn swap_entry_from_offset(offset: usize) -> SwapEntry {
    offset << 8
}

/// Slot bitmap over the swap device; offset 0 stays taken forever.
struct SwapMap {
    bits: Box<[u32]>,
    hint: usize,
}

impl SwapMap {
    fn new(max_offset: usize) -> Self {
        let words = (max_offset + 31) / 32;
        let mut bits = vec![0u32; words].into_boxed_slice();
        bits[0] = 1; // slot 0 reserved
        SwapMap {
            bits,
            hint: 1,
        }
    }

    fn alloc(&mut self, max_offset: usize) -> Option<usize> {
        let mut off = self.hint;
        for _ in 0..max_offset {
            if off >= max_offset {
                off = 1;
            }
            if self.bits[off / 32] & (1 << (off % 32)) == 0 {
                self.bits[off / 32] |= 1 << (off % 32);
                self.hint = off + 1;
                return Some(off);
            }
            off += 1;
        }
        None
    }

    fn free(&mut self, off: usize) {
        assert!(self.bits[off / 32] & (1 << (off % 32)) != 0, "free of free swap slot");
        self.bits[off / 32] &= !(1 << (off % 32));
    }
}

pub fn swap_init() {
    if !crate::ide::ide_device_valid(swapfs::SWAP_DEV_NO) {
        log::warn!("swap: no swap disk, paging to disk disabled");
        return;
    }
    swapfs::swapfs_init();

    unsafe {
        let max = MAX_SWAP_OFFSET;
        assert!(max > 1, "swap device too small");
        PRA_LIST_HEAD.init();
        SWAP_MAP = Some(SwapMap::new(max));
    }

    SWAP_INIT_OK.store(true, Ordering::Relaxed);
    log::info!("swap: second-chance clock policy, {} slots", unsafe {
        MAX_SWAP_OFFSET
    });
}

/// Attach the reclaim policy to a fresh mm.
pub fn swap_init_mm(mm: *mut MmStruct) {
    unsafe {
        (*mm).sm_priv = &raw mut PRA_LIST_HEAD;
    }
}

unsafe fn pra2page(le: *mut ListEntry) -> *mut Page {
    to_struct!(le, Page, pra_page_link)
}

/// A user frame entered the working set: queue it at the tail (youngest).
pub fn map_swappable(mm: *mut MmStruct, la: usize, page: *mut Page, _swap_in: bool) {
    let _intr = local_intr_save();
    unsafe {
        assert!(!(*mm).sm_priv.is_null());
        (*page).pra_vaddr = la;
        (*(*mm).sm_priv).add_before(&mut (*page).pra_page_link);
    }
}

/// Withdraw the frame mapping `la` from the reclaim policy.
pub unsafe fn set_unswappable(mm: *mut MmStruct, la: usize) {
    let _intr = local_intr_save();
    if let Some(ptep) = pmm::get_pte((*mm).pgdir, la, false) {
        if *ptep & PTE_P != 0 {
            let page = pmm::pte2page(*ptep);
            (*page).pra_page_link.del();
        }
    }
}

fn swap_entry_alloc() -> Result<SwapEntry> {
    let _intr = local_intr_save();
    unsafe {
        let max = MAX_SWAP_OFFSET;
        let map = SWAP_MAP.as_mut().ok_or(KernelError::SwapFault)?;
        map.alloc(max)
            .map(swap_entry_from_offset)
            .ok_or(KernelError::SwapFault)
    }
}

/// Release the slot named by a PTE-resident swap entry.
pub fn swap_entry_free(entry: SwapEntry) {
    if !swap_init_ok() {
        return;
    }
    let _intr = local_intr_save();
    unsafe {
        let off = swap_offset(entry);
        if let Some(map) = SWAP_MAP.as_mut() {
            map.free(off);
        }
    }
}

/// Pick a victim with the clock scan: a set Accessed bit buys one more
/// round (cleared, rotated to the tail); a clear one means eviction.
/// Frames whose PTE no longer maps them in this mm fall off the list.
///
/// In tick context the scan must stay cheap, so no second chances are
/// granted: the oldest frame is taken as-is.
unsafe fn swap_out_victim(mm: *mut MmStruct, in_tick: bool) -> *mut Page {
    let head = (*mm).sm_priv;
    assert!(!head.is_null());

    // every frame gets at most one second chance, so 2x the largest
    // possible working set bounds the scan
    let mut scans_left = 2 * 65536;
    loop {
        if (*head).is_empty() || scans_left == 0 {
            return core::ptr::null_mut();
        }
        scans_left -= 1;

        let le = (*head).next();
        let page = pra2page(le);
        let la = (*page).pra_vaddr;

        let ptep = match pmm::get_pte((*mm).pgdir, la, false) {
            None => {
                (*le).del();
                continue;
            }
            Some(p) => p,
        };
        if *ptep & PTE_P == 0 || pmm::pte2page(*ptep) != page {
            // stale: the mapping moved on without telling the policy
            (*le).del();
            continue;
        }

        if !in_tick && *ptep & PTE_A != 0 {
            *ptep &= !PTE_A;
            pmm::tlb_invalidate((*mm).pgdir, la);
            (*le).del();
            (*head).add_before(le); // second chance
        } else {
            (*le).del();
            return page;
        }
    }
}

/// Evict up to `n` frames of `mm` to the swap device. Returns how many
/// went out. `in_tick` marks a call from timer-tick context, where the
/// victim scan skips the second-chance rotation to bound its work.
pub unsafe fn swap_out(mm: *mut MmStruct, n: usize, in_tick: bool) -> usize {
    let mut freed = 0;
    while freed < n {
        let page = swap_out_victim(mm, in_tick);
        if page.is_null() {
            break;
        }
        let v = (*page).pra_vaddr;
        let ptep = pmm::get_pte((*mm).pgdir, v, false).expect("victim lost its page table");
        assert!(*ptep & PTE_P != 0);

        let entry = match swap_entry_alloc() {
            Err(_) => {
                // device full: put the frame back and give up
                map_swappable(mm, v, page, false);
                break;
            }
            Ok(e) => e,
        };
        if swapfs::swapfs_write(entry, page).is_err() {
            log::warn!("swap_out: write failed for {:#010x}", v);
            swap_entry_free(entry);
            map_swappable(mm, v, page, false);
            break;
        }

        log::debug!(
            "swap_out: store page {:#010x} to slot {}",
            v,
            swap_offset(entry)
        );
        *ptep = entry;
        assert!((*page).page_ref_dec() == 0);
        pmm::free_page(page);
        pmm::tlb_invalidate((*mm).pgdir, v);
        SWAP_OUT_NUM += 1;
        freed += 1;
    }
    freed
}

/// Materialize the swapped-out page behind `addr`: fresh frame, read from
/// the slot, release the slot. The caller installs the mapping.
pub unsafe fn swap_in(mm: *mut MmStruct, addr: usize) -> Result<*mut Page> {
    let page = pmm::alloc_page();
    if page.is_null() {
        return Err(KernelError::NoMem);
    }

    let ptep = pmm::get_pte((*mm).pgdir, addr, false).ok_or(KernelError::SwapFault)?;
    let entry = *ptep;
    assert!(entry != 0 && entry & PTE_P == 0);

    if let Err(e) = swapfs::swapfs_read(entry, page) {
        pmm::free_page(page);
        return Err(e);
    }
    log::debug!(
        "swap_in: load page {:#010x} from slot {}",
        addr,
        swap_offset(entry)
    );
    swap_entry_free(entry);
    SWAP_IN_NUM += 1;
    Ok(page)
}

/// Memory-pressure hook for the page allocator: evict from the current
/// process's address space.
#[cfg(target_arch = "x86")]
pub fn try_reclaim(n: usize) -> Result<usize> {
    unsafe {
        let cur = crate::proc::current();
        if !cur.is_null() && !(*cur).mm.is_null() {
            let freed = swap_out((*cur).mm, n, false);
            if freed > 0 {
                return Ok(freed);
            }
        }
    }
    Err(KernelError::NoMem)
}

#[cfg(not(target_arch = "x86"))]
pub fn try_reclaim(_n: usize) -> Result<usize> {
    Err(KernelError::NoMem)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_codec_keeps_present_bit_clear() {
        set_max_swap_offset(1024);
        for off in [1usize, 2, 511, 1023] {
            let entry = swap_entry_from_offset(off);
            assert_eq!(entry & PTE_P, 0, "swap entry must not look present");
            assert_ne!(entry, 0, "valid entries are nonzero");
            assert_eq!(swap_offset(entry), off);
        }
    }

    #[test]
    #[should_panic(expected = "bad swap entry")]
    fn offset_zero_is_reserved() {
        set_max_swap_offset(1024);
        swap_offset(swap_entry_from_offset(0));
    }

    #[test]
    fn slot_map_allocates_distinct_slots_and_reuses_freed() {
        let max = 64;
        let mut map = SwapMap::new(max);
        let mut got = Vec::new();
        while let Some(off) = map.alloc(max) {
            assert!(off > 0 && off < max);
            assert!(!got.contains(&off), "slot handed out twice");
            got.push(off);
        }
        assert_eq!(got.len(), max - 1); // everything but slot 0

        map.free(17);
        map.free(3);
        let a = map.alloc(max).unwrap();
        let b = map.alloc(max).unwrap();
        let mut pair = [a, b];
        pair.sort();
        assert_eq!(pair, [3, 17]);
        assert!(map.alloc(max).is_none());
    }

    #[test]
    #[should_panic(expected = "free of free swap slot")]
    fn double_slot_free_is_detected() {
        let mut map = SwapMap::new(16);
        let off = map.alloc(16).unwrap();
        map.free(off);
        map.free(off);
    }
}
