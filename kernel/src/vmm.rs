//! Virtual-memory objects: per-process vma lists, the page-fault handler
//! with swap-in, and validated user-memory access.

use alloc::boxed::Box;
use core::ptr;

use crate::error::{KernelError, Result};
use crate::list::ListEntry;
use crate::memlayout::{
    kern_access, round_down, round_up, user_access, Pde, PG_SIZE, PTE_P, PTE_U, PTE_W,
};
use crate::pmm;
use crate::sem::Semaphore;
use crate::swap;
use crate::to_struct;

bitflags::bitflags! {
    pub struct VmFlags: u32 {
        const READ  = 0x1;
        const WRITE = 0x2;
        const EXEC  = 0x4;
        const STACK = 0x8;
    }
}

/// A contiguous, same-permission range of user virtual addresses.
#[repr(C)]
pub struct VmaStruct {
    pub vm_mm: *mut MmStruct,
    pub vm_start: usize, // page-aligned, inclusive
    pub vm_end: usize,   // page-aligned, exclusive
    pub vm_flags: VmFlags,
    pub list_link: ListEntry, // kept sorted by vm_start
}

/// The per-process virtual address space: a page directory plus the
/// ordered vma list.
#[repr(C)]
pub struct MmStruct {
    pub mmap_list: ListEntry,
    /// Last vma hit by `find_vma`; constant-time lookup under locality.
    pub mmap_cache: *mut VmaStruct,
    pub pgdir: *mut Pde,
    pub map_count: usize,
    /// Processes sharing this mm; freed when it drops to zero.
    pub mm_count: i32,
    /// Serializes structural mutation when the mm is shared.
    pub mm_sem: Semaphore,
    /// Reclaim-policy state, set up once swap is online.
    pub sm_priv: *mut ListEntry,
}

unsafe fn le2vma(le: *mut ListEntry) -> *mut VmaStruct {
    to_struct!(le, VmaStruct, list_link)
}

pub fn mm_create() -> *mut MmStruct {
    let mm = Box::into_raw(Box::new(MmStruct {
        mmap_list: ListEntry::new(),
        mmap_cache: ptr::null_mut(),
        pgdir: ptr::null_mut(),
        map_count: 0,
        mm_count: 0,
        mm_sem: Semaphore::new(1),
        sm_priv: ptr::null_mut(),
    }));
    unsafe {
        (*mm).mmap_list.init();
        (*mm).mm_sem.init();
        if swap::swap_init_ok() {
            swap::swap_init_mm(mm);
        }
    }
    mm
}

/// Free the vma list and the mm itself. The page directory and mapped
/// frames must already be gone (`exit_mmap` + `put_pgdir`).
pub unsafe fn mm_destroy(mm: *mut MmStruct) {
    assert!((*mm).mm_count == 0);
    let list = &mut (*mm).mmap_list as *mut ListEntry;
    let mut le = (*list).next();
    while le != list {
        let next = (*le).next();
        (*le).del();
        drop(Box::from_raw(le2vma(le)));
        le = next;
    }
    drop(Box::from_raw(mm));
}

pub fn vma_create(vm_start: usize, vm_end: usize, vm_flags: VmFlags) -> *mut VmaStruct {
    Box::into_raw(Box::new(VmaStruct {
        vm_mm: ptr::null_mut(),
        vm_start,
        vm_end,
        vm_flags,
        list_link: ListEntry::new(),
    }))
}

/// The vma containing `addr`, if any. Refreshes the one-entry cache.
pub unsafe fn find_vma(mm: *mut MmStruct, addr: usize) -> *mut VmaStruct {
    if mm.is_null() {
        return ptr::null_mut();
    }
    let mut vma = (*mm).mmap_cache;
    if !(!vma.is_null() && (*vma).vm_start <= addr && (*vma).vm_end > addr) {
        vma = ptr::null_mut();
        let list = &mut (*mm).mmap_list as *mut ListEntry;
        let mut le = (*list).next();
        while le != list {
            let v = le2vma(le);
            if (*v).vm_start <= addr && addr < (*v).vm_end {
                vma = v;
                break;
            }
            le = (*le).next();
        }
    }
    if !vma.is_null() {
        (*mm).mmap_cache = vma;
    }
    vma
}

/// First vma overlapping `[start, end)`, ignoring the cache.
unsafe fn find_vma_intersection(mm: *mut MmStruct, start: usize, end: usize) -> *mut VmaStruct {
    let list = &mut (*mm).mmap_list as *mut ListEntry;
    let mut le = (*list).next();
    while le != list {
        let v = le2vma(le);
        if (*v).vm_start < end && start < (*v).vm_end {
            return v;
        }
        le = (*le).next();
    }
    ptr::null_mut()
}

unsafe fn check_vma_overlap(prev: *mut VmaStruct, next: *mut VmaStruct) {
    assert!((*prev).vm_start < (*prev).vm_end);
    assert!((*prev).vm_end <= (*next).vm_start);
    assert!((*next).vm_start < (*next).vm_end);
}

/// Insert `vma` keeping the list sorted; the range must not overlap its
/// neighbours.
pub unsafe fn insert_vma_struct(mm: *mut MmStruct, vma: *mut VmaStruct) {
    assert!((*vma).vm_start < (*vma).vm_end);
    let list = &mut (*mm).mmap_list as *mut ListEntry;

    let mut le_prev = list;
    let mut le = (*list).next();
    while le != list {
        if (*le2vma(le)).vm_start > (*vma).vm_start {
            break;
        }
        le_prev = le;
        le = (*le).next();
    }
    let le_next = (*le_prev).next();

    if le_prev != list {
        check_vma_overlap(le2vma(le_prev), vma);
    }
    if le_next != list {
        check_vma_overlap(vma, le2vma(le_next));
    }

    (*vma).vm_mm = mm;
    (*le_prev).add_after(&mut (*vma).list_link);
    (*mm).map_count += 1;
}

/// Carve a new vma over `[addr, addr+len)` (page-rounded). Fails if any
/// part leaves the user range or touches an existing vma.
pub unsafe fn mm_map(
    mm: *mut MmStruct,
    addr: usize,
    len: usize,
    vm_flags: VmFlags,
    vma_store: Option<&mut *mut VmaStruct>,
) -> Result<()> {
    assert!(!mm.is_null());
    let start = round_down(addr, PG_SIZE);
    let end = round_up(addr + len, PG_SIZE);
    if !user_access(start, end) {
        return Err(KernelError::Invalid);
    }
    if !find_vma_intersection(mm, start, end).is_null() {
        return Err(KernelError::Invalid);
    }

    let vma = vma_create(start, end, vm_flags);
    insert_vma_struct(mm, vma);
    if let Some(store) = vma_store {
        *store = vma;
    }
    Ok(())
}

/// Clone `from`'s vmas into `to` and eagerly deep-copy every mapped page.
/// On failure the caller tears down the partially built `to`.
pub unsafe fn dup_mmap(to: *mut MmStruct, from: *mut MmStruct) -> Result<()> {
    assert!(!to.is_null() && !from.is_null());
    let list = &mut (*from).mmap_list as *mut ListEntry;
    let mut le = (*list).next();
    while le != list {
        let vma = le2vma(le);
        let nvma = vma_create((*vma).vm_start, (*vma).vm_end, (*vma).vm_flags);
        insert_vma_struct(to, nvma);

        // pages of this range that went to swap must come back before the
        // copy: their PTEs hold opaque entries, not frames
        if swap::swap_init_ok() {
            swap_in_range(from, vma)?;
        }
        pmm::copy_range((*to).pgdir, (*from).pgdir, (*vma).vm_start, (*vma).vm_end, false)?;
        le = (*le).next();
    }
    Ok(())
}

unsafe fn swap_in_range(mm: *mut MmStruct, vma: *mut VmaStruct) -> Result<()> {
    let mut perm = PTE_U;
    if (*vma).vm_flags.contains(VmFlags::WRITE) {
        perm |= PTE_W;
    }
    let mut la = (*vma).vm_start;
    while la < (*vma).vm_end {
        if let Some(ptep) = pmm::get_pte((*mm).pgdir, la, false) {
            if *ptep != 0 && *ptep & PTE_P == 0 {
                let page = swap::swap_in(mm, la)?;
                pmm::page_insert((*mm).pgdir, page, la, perm)?;
                swap::map_swappable(mm, la, page, true);
                (*page).pra_vaddr = la;
            }
        }
        la += PG_SIZE;
    }
    Ok(())
}

/// Unmap every vma's range and free the emptied user page tables.
pub unsafe fn exit_mmap(mm: *mut MmStruct) {
    assert!(!mm.is_null() && (*mm).mm_count == 0);
    let pgdir = (*mm).pgdir;
    let list = &mut (*mm).mmap_list as *mut ListEntry;

    let mut le = (*list).next();
    while le != list {
        let vma = le2vma(le);
        pmm::unmap_range(pgdir, (*vma).vm_start, (*vma).vm_end);
        le = (*le).next();
    }
    let mut le = (*list).next();
    while le != list {
        let vma = le2vma(le);
        pmm::exit_range(pgdir, (*vma).vm_start, (*vma).vm_end);
        le = (*le).next();
    }
}

pub unsafe fn mm_count_inc(mm: *mut MmStruct) -> i32 {
    (*mm).mm_count += 1;
    (*mm).mm_count
}

pub unsafe fn mm_count_dec(mm: *mut MmStruct) -> i32 {
    (*mm).mm_count -= 1;
    (*mm).mm_count
}

#[cfg(target_arch = "x86")]
pub unsafe fn lock_mm(mm: *mut MmStruct) {
    if !mm.is_null() {
        (*mm).mm_sem.down();
    }
}

#[cfg(target_arch = "x86")]
pub unsafe fn unlock_mm(mm: *mut MmStruct) {
    if !mm.is_null() {
        (*mm).mm_sem.up();
    }
}

/// Page faults served since boot.
pub static mut PGFAULT_NUM: usize = 0;

/// Handle a page fault against `mm`.
///
/// The error code is the hardware's: bit 0 protection (1) vs not-present
/// (0), bit 1 write (1) vs read (0), bit 2 user (1) vs kernel (0).
pub unsafe fn do_pgfault(mm: *mut MmStruct, error_code: u32, addr: usize) -> Result<()> {
    PGFAULT_NUM += 1;

    let vma = find_vma(mm, addr);
    if vma.is_null() || (*vma).vm_start > addr {
        log::warn!("pgfault: no vma covers {:#010x}", addr);
        return Err(KernelError::Invalid);
    }

    match error_code & 3 {
        1 | 3 => {
            // present: a protection fault. There is no COW and no
            // permission upgrade, so this can only be a bad access.
            log::warn!("pgfault: protection fault at {:#010x}", addr);
            return Err(KernelError::Invalid);
        }
        2 => {
            // write to a missing page
            if !(*vma).vm_flags.contains(VmFlags::WRITE) {
                log::warn!("pgfault: write to unwritable vma at {:#010x}", addr);
                return Err(KernelError::Invalid);
            }
        }
        _ => {
            // read from a missing page
            if !(*vma)
                .vm_flags
                .intersects(VmFlags::READ | VmFlags::EXEC)
            {
                log::warn!("pgfault: read of unreadable vma at {:#010x}", addr);
                return Err(KernelError::Invalid);
            }
        }
    }

    let mut perm = PTE_U;
    if (*vma).vm_flags.contains(VmFlags::WRITE) {
        perm |= PTE_W;
    }
    let addr = round_down(addr, PG_SIZE);

    let ptep = pmm::get_pte((*mm).pgdir, addr, true).ok_or(KernelError::NoMem)?;

    if *ptep == 0 {
        // never mapped: hand out a fresh zeroed frame
        if pmm::pgdir_alloc_page(mm, (*mm).pgdir, addr, perm).is_null() {
            return Err(KernelError::NoMem);
        }
    } else {
        // the entry encodes a page on the swap device
        if !swap::swap_init_ok() {
            panic!("pgfault: swap entry {:#x} but swap is offline", *ptep);
        }
        let page = swap::swap_in(mm, addr)?;
        pmm::page_insert((*mm).pgdir, page, addr, perm)?;
        swap::map_swappable(mm, addr, page, true);
        (*page).pra_vaddr = addr;
    }
    Ok(())
}

/// Check that `[addr, addr+len)` is fully covered by vmas with the needed
/// permission. For a kernel caller without an mm, fall back to the kernel
/// window. The first page of a stack vma is a guard and never writable.
pub unsafe fn user_mem_check(mm: *mut MmStruct, addr: usize, len: usize, write: bool) -> bool {
    if mm.is_null() {
        return kern_access(addr, addr + len);
    }
    if !user_access(addr, addr + len) {
        return false;
    }
    let mut start = addr;
    let end = addr + len;
    while start < end {
        let vma = find_vma(mm, start);
        if vma.is_null() || start < (*vma).vm_start {
            return false;
        }
        let need = if write { VmFlags::WRITE } else { VmFlags::READ };
        if !(*vma).vm_flags.contains(need) {
            return false;
        }
        if write && (*vma).vm_flags.contains(VmFlags::STACK) {
            if start < (*vma).vm_start + PG_SIZE {
                return false;
            }
        }
        start = (*vma).vm_end;
    }
    true
}

/// Copy `len` bytes from user `src` after validation.
pub unsafe fn copy_from_user(
    mm: *mut MmStruct,
    dst: *mut u8,
    src: usize,
    len: usize,
    writable: bool,
) -> bool {
    if !user_mem_check(mm, src, len, writable) {
        return false;
    }
    ptr::copy_nonoverlapping(src as *const u8, dst, len);
    true
}

/// Copy `len` bytes to user `dst` after validation.
pub unsafe fn copy_to_user(mm: *mut MmStruct, dst: usize, src: *const u8, len: usize) -> bool {
    if !user_mem_check(mm, dst, len, true) {
        return false;
    }
    ptr::copy_nonoverlapping(src, dst as *mut u8, len);
    true
}

unsafe fn strnlen_raw(s: *const u8, maxn: usize) -> usize {
    let mut n = 0;
    while n < maxn && *s.add(n) != 0 {
        n += 1;
    }
    n
}

/// Copy a NUL-terminated user string into `dst` (capacity `maxn`),
/// validating page by page so the scan never strays past a vma edge.
pub unsafe fn copy_string(mm: *mut MmStruct, dst: *mut u8, src: usize, maxn: usize) -> bool {
    let mut dst = dst;
    let mut src = src;
    let mut maxn = maxn;
    let mut part = round_down(src + PG_SIZE, PG_SIZE) - src;
    loop {
        if part > maxn {
            part = maxn;
        }
        if !user_mem_check(mm, src, part, false) {
            return false;
        }
        let alen = strnlen_raw(src as *const u8, part);
        if alen < part {
            ptr::copy_nonoverlapping(src as *const u8, dst, alen + 1);
            return true;
        }
        if part == maxn {
            return false; // unterminated
        }
        ptr::copy_nonoverlapping(src as *const u8, dst, part);
        dst = dst.add(part);
        src += part;
        maxn -= part;
        part = PG_SIZE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memlayout::{USER_BASE, USER_TOP, UTEXT};

    unsafe fn vma_bounds(mm: *mut MmStruct) -> Vec<(usize, usize)> {
        let list = &mut (*mm).mmap_list as *mut ListEntry;
        let mut out = Vec::new();
        let mut le = (*list).next();
        while le != list {
            let v = le2vma(le);
            out.push(((*v).vm_start, (*v).vm_end));
            le = (*le).next();
        }
        out
    }

    fn destroy(mm: *mut MmStruct) {
        unsafe {
            assert_eq!((*mm).mm_count, 0);
            mm_destroy(mm);
        }
    }

    #[test]
    fn vma_list_stays_sorted_and_counted() {
        unsafe {
            let mm = mm_create();
            let ranges = [
                (UTEXT + 0x5000, UTEXT + 0x6000),
                (UTEXT, UTEXT + 0x1000),
                (UTEXT + 0x2000, UTEXT + 0x4000),
            ];
            for &(s, e) in &ranges {
                insert_vma_struct(mm, vma_create(s, e, VmFlags::READ));
            }
            assert_eq!((*mm).map_count, 3);
            let bounds = vma_bounds(mm);
            assert_eq!(
                bounds,
                vec![
                    (UTEXT, UTEXT + 0x1000),
                    (UTEXT + 0x2000, UTEXT + 0x4000),
                    (UTEXT + 0x5000, UTEXT + 0x6000),
                ]
            );
            // pairwise non-overlap
            for w in bounds.windows(2) {
                assert!(w[0].1 <= w[1].0);
            }
            destroy(mm);
        }
    }

    #[test]
    fn find_vma_hits_and_caches() {
        unsafe {
            let mm = mm_create();
            let vma = vma_create(UTEXT, UTEXT + 0x3000, VmFlags::READ | VmFlags::WRITE);
            insert_vma_struct(mm, vma);

            assert!(find_vma(mm, UTEXT - 1).is_null());
            assert_eq!(find_vma(mm, UTEXT), vma);
            assert_eq!((*mm).mmap_cache, vma, "hit must refresh the cache");
            assert_eq!(find_vma(mm, UTEXT + 0x2FFF), vma);
            assert!(find_vma(mm, UTEXT + 0x3000).is_null());
            destroy(mm);
        }
    }

    #[test]
    fn mm_map_validates_range_and_overlap() {
        unsafe {
            let mm = mm_create();
            assert!(mm_map(mm, UTEXT, 0x4000, VmFlags::READ, None).is_ok());
            assert_eq!((*mm).map_count, 1);

            // below the user range
            assert_eq!(
                mm_map(mm, USER_BASE - PG_SIZE, PG_SIZE, VmFlags::READ, None),
                Err(KernelError::Invalid)
            );
            // above it
            assert_eq!(
                mm_map(mm, USER_TOP - PG_SIZE, 2 * PG_SIZE, VmFlags::READ, None),
                Err(KernelError::Invalid)
            );
            // straddling an existing vma, including one that merely starts
            // inside the new range
            assert_eq!(
                mm_map(mm, UTEXT + 0x3000, 0x2000, VmFlags::READ, None),
                Err(KernelError::Invalid)
            );
            assert_eq!(
                mm_map(mm, UTEXT - 0x1000, 0x2000, VmFlags::READ, None),
                Err(KernelError::Invalid)
            );
            assert_eq!((*mm).map_count, 1);

            // a disjoint range still works
            let mut store = ptr::null_mut();
            assert!(mm_map(mm, UTEXT + 0x10000, 0x1000, VmFlags::WRITE, Some(&mut store)).is_ok());
            assert_eq!((*store).vm_start, UTEXT + 0x10000);
            destroy(mm);
        }
    }

    #[test]
    fn user_mem_check_covers_permissions_and_guard() {
        unsafe {
            let mm = mm_create();
            insert_vma_struct(
                mm,
                vma_create(UTEXT, UTEXT + 0x2000, VmFlags::READ | VmFlags::WRITE),
            );
            insert_vma_struct(
                mm,
                vma_create(UTEXT + 0x2000, UTEXT + 0x3000, VmFlags::READ),
            );
            let stack_base = USER_TOP - 4 * PG_SIZE;
            insert_vma_struct(
                mm,
                vma_create(
                    stack_base,
                    USER_TOP,
                    VmFlags::READ | VmFlags::WRITE | VmFlags::STACK,
                ),
            );

            // contiguous coverage across two vmas, read only
            assert!(user_mem_check(mm, UTEXT, 0x3000, false));
            // write stops at the read-only vma
            assert!(!user_mem_check(mm, UTEXT, 0x3000, true));
            // hole behind the vmas
            assert!(!user_mem_check(mm, UTEXT, 0x4000, false));
            // stack guard page rejects writes but not reads
            assert!(!user_mem_check(mm, stack_base, 16, true));
            assert!(user_mem_check(mm, stack_base, 16, false));
            assert!(user_mem_check(mm, stack_base + PG_SIZE, 16, true));
            destroy(mm);
        }
    }
}
