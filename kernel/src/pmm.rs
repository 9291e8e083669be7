//! Physical memory management: the page-descriptor array, the first-fit
//! allocator facade, the boot page directory with its VPT self-map, and
//! the PTE-level mapping operations everything else builds on.

use core::ptr;

use crate::cprintf;
use crate::error::{KernelError, Result};
use crate::first_fit::FreeArea;
use crate::memlayout::*;
use crate::sync::local_intr_save;
use crate::swap;
use crate::vmm::MmStruct;
use i386::{invlpg, rcr3, TaskState};

/// Descriptor array covering physical pages `[0, NPAGE)`.
pub static mut PAGES: *mut Page = ptr::null_mut();
pub static mut NPAGE: usize = 0;

static mut FREE_AREA: FreeArea = FreeArea::new();

/// Kernel virtual address of the boot-time page directory.
pub static mut BOOT_PGDIR: *mut Pde = ptr::null_mut();
/// Physical address of the boot-time page directory.
pub static mut BOOT_CR3: usize = 0;

static mut TS: TaskState = TaskState::zero();
#[cfg(target_arch = "x86")]
static mut GDT: [i386::SegDesc; 6] = [i386::SegDesc::null(); 6];

/* kernel-virtual <-> physical, valid inside the direct-map window */

#[inline]
pub fn paddr(kva: usize) -> usize {
    assert!(kva >= KERN_BASE, "paddr of a non-kernel address");
    kva - KERN_BASE
}

#[inline]
pub fn kaddr(pa: usize) -> usize {
    assert!(pa < KMEM_SIZE, "kaddr of an unmapped physical address");
    pa + KERN_BASE
}

pub unsafe fn pa2page(pa: usize) -> *mut Page {
    assert!(ppn(pa) < NPAGE, "pa2page: address out of range");
    PAGES.add(ppn(pa))
}

pub unsafe fn page2ppn(page: *mut Page) -> usize {
    page.offset_from(PAGES) as usize
}

pub unsafe fn page2pa(page: *mut Page) -> usize {
    page2ppn(page) << PG_SHIFT
}

pub unsafe fn page2kva(page: *mut Page) -> usize {
    kaddr(page2pa(page))
}

pub unsafe fn kva2page(kva: usize) -> *mut Page {
    pa2page(paddr(kva))
}

pub unsafe fn pte2page(pte: Pte) -> *mut Page {
    assert!(pte & PTE_P != 0, "pte2page: entry not present");
    pa2page(pte_addr(pte))
}

pub unsafe fn pde2page(pde: Pde) -> *mut Page {
    pa2page(pte_addr(pde))
}

/// Allocate `n` contiguous frames. Under memory pressure (single-frame
/// requests with swap online) victims are evicted until one frees up.
pub fn alloc_pages(n: usize) -> *mut Page {
    loop {
        let page = {
            let _intr = local_intr_save();
            unsafe { FREE_AREA.alloc_pages(n) }
        };
        if !page.is_null() || n > 1 || !swap::swap_init_ok() {
            return page;
        }
        if swap::try_reclaim(n).is_err() {
            return ptr::null_mut();
        }
    }
}

pub fn alloc_page() -> *mut Page {
    alloc_pages(1)
}

pub fn free_pages(base: *mut Page, n: usize) {
    let _intr = local_intr_save();
    unsafe {
        FREE_AREA.free_pages(base, n);
    }
}

pub fn free_page(page: *mut Page) {
    free_pages(page, 1);
}

pub fn n_free_pages() -> usize {
    let _intr = local_intr_save();
    unsafe { FREE_AREA.n_free() }
}

/// Invalidate a TLB entry, but only if the page tables being edited are
/// the ones in use by the processor.
pub fn tlb_invalidate(pgdir: *mut Pde, la: usize) {
    unsafe {
        if rcr3() == paddr(pgdir as usize) {
            invlpg(la);
        }
    }
}

/// Point `TSS.esp0` at a new kernel stack top, for the next
/// privilege-raising interrupt.
pub fn load_esp0(esp0: usize) {
    unsafe {
        TS.ts_esp0 = esp0 as u32;
    }
}

/// Walk the page directory to the PTE of `la`, optionally growing a page
/// table. Returns the kernel-virtual address of the PTE, or `None` when
/// the table is missing (and `create` is off) or memory ran out.
pub unsafe fn get_pte(pgdir: *mut Pde, la: usize, create: bool) -> Option<*mut Pte> {
    let pdep = pgdir.add(pdx(la));
    if *pdep & PTE_P == 0 {
        if !create {
            return None;
        }
        let page = alloc_page();
        if page.is_null() {
            return None;
        }
        (*page).set_page_ref(1);
        let pa = page2pa(page);
        ptr::write_bytes(kaddr(pa) as *mut u8, 0, PG_SIZE);
        *pdep = pa | PTE_U | PTE_W | PTE_P;
    }
    Some((kaddr(pte_addr(*pdep)) as *mut Pte).add(ptx(la)))
}

/// The frame mapped at `la`, if present. Stores the PTE address through
/// `ptep_store` when given.
pub unsafe fn get_page(pgdir: *mut Pde, la: usize, ptep_store: Option<&mut *mut Pte>) -> *mut Page {
    let ptep = get_pte(pgdir, la, false);
    if let Some(store) = ptep_store {
        *store = ptep.unwrap_or(ptr::null_mut());
    }
    match ptep {
        Some(p) if *p & PTE_P != 0 => pte2page(*p),
        _ => ptr::null_mut(),
    }
}

/// Drop the mapping held by `ptep`: decrement the frame ref, free it at
/// zero, clear the entry, flush the TLB.
unsafe fn page_remove_pte(pgdir: *mut Pde, la: usize, ptep: *mut Pte) {
    if *ptep & PTE_P != 0 {
        let page = pte2page(*ptep);
        if (*page).page_ref_dec() == 0 {
            free_page(page);
        }
        *ptep = 0;
        tlb_invalidate(pgdir, la);
    }
}

/// Unmap `la` if it is mapped.
pub unsafe fn page_remove(pgdir: *mut Pde, la: usize) {
    if let Some(ptep) = get_pte(pgdir, la, false) {
        page_remove_pte(pgdir, la, ptep);
    }
}

/// Map `page` at `la` with `perm`, replacing any existing mapping.
pub unsafe fn page_insert(pgdir: *mut Pde, page: *mut Page, la: usize, perm: usize) -> Result<()> {
    let ptep = get_pte(pgdir, la, true).ok_or(KernelError::NoMem)?;
    (*page).page_ref_inc();
    if *ptep & PTE_P != 0 {
        let p = pte2page(*ptep);
        if p == page {
            (*page).page_ref_dec();
        } else {
            page_remove_pte(pgdir, la, ptep);
        }
    }
    *ptep = page2pa(page) | PTE_P | perm;
    tlb_invalidate(pgdir, la);
    Ok(())
}

/// Allocate a frame and map it at `la`; with swap online and an owning
/// `mm`, register it with the reclaim policy.
pub unsafe fn pgdir_alloc_page(
    mm: *mut MmStruct,
    pgdir: *mut Pde,
    la: usize,
    perm: usize,
) -> *mut Page {
    let page = alloc_page();
    if page.is_null() {
        return page;
    }
    if page_insert(pgdir, page, la, perm).is_err() {
        free_page(page);
        return ptr::null_mut();
    }
    if swap::swap_init_ok() && !mm.is_null() {
        swap::map_swappable(mm, la, page, true);
        (*page).pra_vaddr = la;
        assert_eq!((*page).page_ref(), 1);
    }
    page
}

/// Bulk early-boot mapping of `[la, la+size)` to `[pa, pa+size)`. Frames
/// are Reserved; no ref counts move.
pub unsafe fn boot_map_segment(pgdir: *mut Pde, la: usize, size: usize, pa: usize, perm: usize) {
    assert_eq!(pg_off(la), pg_off(pa));
    let mut n = round_up(size + pg_off(la), PG_SIZE) / PG_SIZE;
    let mut la = round_down(la, PG_SIZE);
    let mut pa = round_down(pa, PG_SIZE);
    while n > 0 {
        let ptep = get_pte(pgdir, la, true).expect("boot_map_segment: out of memory");
        *ptep = pa | PTE_P | perm;
        n -= 1;
        la += PG_SIZE;
        pa += PG_SIZE;
    }
}

/// Unmap every page of `[start, end)`, releasing frames and swap slots.
pub unsafe fn unmap_range(pgdir: *mut Pde, start: usize, end_: usize) {
    assert!(start % PG_SIZE == 0 && end_ % PG_SIZE == 0);
    assert!(user_access(start, end_));

    let mut la = start;
    while la < end_ {
        let ptep = match get_pte(pgdir, la, false) {
            None => {
                // whole page table absent, skip its span
                la = round_down(la + PT_SIZE, PT_SIZE);
                continue;
            }
            Some(p) => p,
        };
        if *ptep & PTE_P != 0 {
            page_remove_pte(pgdir, la, ptep);
        } else if *ptep != 0 {
            swap::swap_entry_free(*ptep);
            *ptep = 0;
        }
        la += PG_SIZE;
    }
}

/// Free the now-empty user page tables covering `[start, end)`.
pub unsafe fn exit_range(pgdir: *mut Pde, start: usize, end_: usize) {
    assert!(start % PG_SIZE == 0 && end_ % PG_SIZE == 0);
    assert!(user_access(start, end_));

    let mut la = round_down(start, PT_SIZE);
    loop {
        let pdep = pgdir.add(pdx(la));
        if *pdep & PTE_P != 0 {
            free_page(pde2page(*pdep));
            *pdep = 0;
        }
        la += PT_SIZE;
        if la == 0 || la >= end_ {
            break;
        }
    }
}

/// Duplicate the present mappings of `[start, end)` from one address
/// space into another, deep-copying page contents.
pub unsafe fn copy_range(
    to: *mut Pde,
    from: *mut Pde,
    start: usize,
    end_: usize,
    share: bool,
) -> Result<()> {
    assert!(start % PG_SIZE == 0 && end_ % PG_SIZE == 0);
    assert!(user_access(start, end_));
    // sharing is what CLONE_VM is for; copy_range always duplicates
    assert!(!share);

    let mut la = start;
    while la < end_ {
        let ptep = match get_pte(from, la, false) {
            None => {
                la = round_down(la + PT_SIZE, PT_SIZE);
                continue;
            }
            Some(p) => p,
        };
        if *ptep & PTE_P != 0 {
            let perm = *ptep & PTE_USER;
            let page = pte2page(*ptep);
            let npage = alloc_page();
            if npage.is_null() {
                return Err(KernelError::NoMem);
            }
            ptr::copy_nonoverlapping(
                page2kva(page) as *const u8,
                page2kva(npage) as *mut u8,
                PG_SIZE,
            );
            page_insert(to, npage, la, perm)?;
        }
        la += PG_SIZE;
    }
    Ok(())
}

/* boot-time setup */

extern "C" {
    // first address after the kernel image, from kernel.ld
    static mut end: u8;
    // boot stack, from entry.rs
    static mut bootstack: u8;
}

#[cfg(target_arch = "x86")]
fn page_init() {
    unsafe {
        let mem_map = &*(kaddr(E820_PA) as *const E820Map);

        let mut max_pa: u64 = 0;
        cprintf!("e820map:\n");
        for i in 0..mem_map.n_map as usize {
            let entry = mem_map.map[i];
            let begin = entry.addr;
            let end_pa = begin + entry.size;
            cprintf!(
                "  memory: {:08x}, [{:08x}, {:08x}], type = {}.\n",
                { entry.size },
                begin,
                end_pa - 1,
                { entry.typ }
            );
            if entry.typ == E820_MEM && begin < KMEM_SIZE as u64 && end_pa > max_pa {
                max_pa = end_pa;
            }
        }
        if max_pa > KMEM_SIZE as u64 {
            max_pa = KMEM_SIZE as u64;
        }

        NPAGE = max_pa as usize / PG_SIZE;
        let kernel_end = &raw mut end as usize;
        PAGES = round_up(kernel_end, PG_SIZE) as *mut Page;

        for i in 0..NPAGE {
            (*PAGES.add(i)).flags = PageFlags::RESERVED;
        }

        // everything below the end of the page array is kernel-owned
        let free_begin = paddr(PAGES.add(NPAGE) as usize);

        FREE_AREA.init();
        for i in 0..mem_map.n_map as usize {
            let entry = mem_map.map[i];
            if entry.typ != E820_MEM {
                continue;
            }
            let mut begin = entry.addr as usize;
            let mut end_pa = (entry.addr + entry.size) as usize;
            if begin < free_begin {
                begin = free_begin;
            }
            if end_pa > KMEM_SIZE {
                end_pa = KMEM_SIZE;
            }
            if begin < end_pa {
                begin = round_up(begin, PG_SIZE);
                end_pa = round_down(end_pa, PG_SIZE);
                if begin < end_pa {
                    FREE_AREA.init_memmap(pa2page(begin), (end_pa - begin) / PG_SIZE);
                }
            }
        }
        log::info!("free memory: {} pages", FREE_AREA.n_free());
    }
}

#[cfg(target_arch = "x86")]
fn gdt_init() {
    use i386::{
        lgdt, load_data_segs, ltr, set_cs, DtDesc, SegDesc, DPL_KERNEL, DPL_USER, STA_R, STA_W,
        STA_X, STS_T32A,
    };

    unsafe {
        // privilege-raising interrupts land on the boot stack until the
        // scheduler installs per-process kernel stacks
        TS.ts_esp0 = (&raw mut bootstack as usize + KSTACK_SIZE) as u32;
        TS.ts_ss0 = KERNEL_DS;

        GDT[SEG_KTEXT as usize] = SegDesc::seg32(STA_X | STA_R, 0, 0xFFFF_FFFF, DPL_KERNEL);
        GDT[SEG_KDATA as usize] = SegDesc::seg32(STA_W, 0, 0xFFFF_FFFF, DPL_KERNEL);
        GDT[SEG_UTEXT as usize] = SegDesc::seg32(STA_X | STA_R, 0, 0xFFFF_FFFF, DPL_USER);
        GDT[SEG_UDATA as usize] = SegDesc::seg32(STA_W, 0, 0xFFFF_FFFF, DPL_USER);
        GDT[SEG_TSS as usize] = SegDesc::seg16(
            STS_T32A,
            &raw mut TS as usize as u32,
            core::mem::size_of::<TaskState>() as u32 - 1,
            DPL_KERNEL,
        );

        let gdt_pd = DtDesc {
            pd_lim: core::mem::size_of_val(&GDT) as u16 - 1,
            pd_base: GDT.as_ptr() as usize as u32,
        };
        lgdt(&gdt_pd);
        load_data_segs(KERNEL_DS, USER_DS);
        set_cs(KERNEL_CS);
        ltr(GD_TSS);
    }
}

#[cfg(target_arch = "x86")]
pub fn pmm_init() {
    log::info!("memory management: first_fit");

    // build the page array from the e820 map and donate the usable runs
    page_init();

    unsafe {
        // the boot page directory inherits nothing: one fresh frame
        let page = alloc_page();
        assert!(!page.is_null(), "pmm_init: cannot allocate boot_pgdir");
        BOOT_PGDIR = page2kva(page) as *mut Pde;
        ptr::write_bytes(BOOT_PGDIR as *mut u8, 0, PG_SIZE);
        BOOT_CR3 = page2pa(page);

        // recursive self-map: makes every PTE of the current address
        // space addressable through the VPT window
        *BOOT_PGDIR.add(pdx(VPT)) = BOOT_CR3 | PTE_P | PTE_W;

        // map all physical memory at KERN_BASE
        boot_map_segment(BOOT_PGDIR, KERN_BASE, KMEM_SIZE, 0, PTE_W);

        i386::lcr3(BOOT_CR3);
        gdt_init();

        check_boot_pgdir();
    }
}

#[cfg(target_arch = "x86")]
unsafe fn check_boot_pgdir() {
    assert_eq!(
        *BOOT_PGDIR.add(pdx(VPT)),
        BOOT_CR3 | PTE_P | PTE_W,
        "VPT self-map lost"
    );
    // spot-check the kernel window against the direct map
    for la in [KERN_BASE, KERN_BASE + KMEM_SIZE / 2, KERN_TOP - PG_SIZE] {
        let ptep = get_pte(BOOT_PGDIR, la, false).expect("kernel window unmapped");
        assert_eq!(pte_addr(*ptep), paddr(la));
    }
    cprintf!("check_boot_pgdir() succeeded!\n");
}

/* page-directory dump, reached through the `pgdir` syscall */

fn perm2str(perm: usize) -> &'static str {
    match (perm & PTE_U != 0, perm & PTE_W != 0) {
        (true, true) => "urw",
        (true, false) => "ur-",
        (false, true) => "-rw",
        (false, false) => "-r-",
    }
}

/// Maximal run of identically-mapped entries in `table[..right)` starting
/// at or after `start`; returns `(run_left, run_right, perm)`.
unsafe fn get_pgtable_items(
    right: usize,
    start: usize,
    table: *const usize,
) -> Option<(usize, usize, usize)> {
    let mut start = start;
    while start < right && *table.add(start) & PTE_P == 0 {
        start += 1;
    }
    if start >= right {
        return None;
    }
    let run_left = start;
    let perm = *table.add(start) & PTE_USER;
    start += 1;
    while start < right && *table.add(start) & PTE_USER == perm {
        start += 1;
    }
    Some((run_left, start, perm))
}

/// Dump the current page directory through the VPT window.
pub fn print_pgdir() {
    // the self-map makes the directory itself visible at this address
    let vpt = VPT as *const usize;
    let vpd = pg_addr(pdx(VPT), pdx(VPT), 0) as *const usize;

    cprintf!("-------------------- BEGIN --------------------\n");
    unsafe {
        let mut right = 0;
        while let Some((l, r, perm)) = get_pgtable_items(N_PDE_ENTRY, right, vpd) {
            right = r;
            cprintf!(
                "PDE({:03x}) {:08x}-{:08x} {:08x} {}\n",
                r - l,
                l * PT_SIZE,
                r * PT_SIZE,
                (r - l) * PT_SIZE,
                perm2str(perm)
            );
            let mut r2 = l * N_PTE_ENTRY;
            while let Some((l2, rr, perm)) = get_pgtable_items(r * N_PTE_ENTRY, r2, vpt) {
                r2 = rr;
                cprintf!(
                    "  |-- PTE({:05x}) {:08x}-{:08x} {:08x} {}\n",
                    rr - l2,
                    l2 * PG_SIZE,
                    rr * PG_SIZE,
                    (rr - l2) * PG_SIZE,
                    perm2str(perm)
                );
            }
        }
    }
    cprintf!("--------------------- END ---------------------\n");
}
