//! exec: replace the calling process's address space with an ELF image
//! from the program store.

use alloc::vec;
use alloc::vec::Vec;
use core::ptr;

use crate::elf::{ElfHeader, ProgHeader, ELF_MAGIC, ELF_PF_R, ELF_PF_W, ELF_PF_X, ELF_PT_LOAD};
use crate::error::{KernelError, Result};
use crate::memlayout::{
    round_down, PG_SIZE, PTE_U, PTE_USER, PTE_W, USER_CS, USER_DS, USTACK_SIZE, USTACK_TOP,
};
use crate::param::{EXEC_MAX_ARG_LEN, EXEC_MAX_ARG_NUM, PROC_NAME_LEN};
use crate::pmm;
use crate::proc::{self, put_pgdir, setup_pgdir};
use crate::sysfile;
use crate::trap::TrapFrame;
use crate::vmm::{self, VmFlags};
use i386::FL_IF;

fn flags2vm(p_flags: u32) -> (VmFlags, usize) {
    let mut vm_flags = VmFlags::empty();
    if p_flags & ELF_PF_X != 0 {
        vm_flags |= VmFlags::EXEC;
    }
    if p_flags & ELF_PF_W != 0 {
        vm_flags |= VmFlags::WRITE;
    }
    if p_flags & ELF_PF_R != 0 {
        vm_flags |= VmFlags::READ;
    }
    let mut perm = PTE_U;
    if vm_flags.contains(VmFlags::WRITE) {
        perm |= PTE_W;
    }
    (vm_flags, perm)
}

fn load_icode_read(fd: i32, buf: *mut u8, len: usize, offset: usize) -> Result<()> {
    sysfile::sysfile_seek(fd, offset)?;
    if sysfile::sysfile_read(fd, buf, len)? != len {
        return Err(KernelError::InvalidElf);
    }
    Ok(())
}

/// Read each PT_LOAD segment into a fresh mm, zeroing the BSS tail, and
/// pre-map the top of the user stack.
unsafe fn load_segments(fd: i32, mm: *mut vmm::MmStruct) -> Result<ElfHeader> {
    let mut elf = ElfHeader::zeroed();
    load_icode_read(
        fd,
        &mut elf as *mut ElfHeader as *mut u8,
        core::mem::size_of::<ElfHeader>(),
        0,
    )?;
    if elf.e_magic != ELF_MAGIC {
        return Err(KernelError::InvalidElf);
    }

    for phnum in 0..elf.e_phnum as usize {
        let phoff = elf.e_phoff as usize + core::mem::size_of::<ProgHeader>() * phnum;
        let mut ph = ProgHeader::zeroed();
        load_icode_read(
            fd,
            &mut ph as *mut ProgHeader as *mut u8,
            core::mem::size_of::<ProgHeader>(),
            phoff,
        )?;
        if ph.p_type != ELF_PT_LOAD {
            continue;
        }
        if ph.p_filesz > ph.p_memsz {
            return Err(KernelError::InvalidElf);
        }
        if ph.p_filesz == 0 {
            continue;
        }
        let (vm_flags, perm) = flags2vm(ph.p_flags);
        vmm::mm_map(mm, ph.p_va as usize, ph.p_memsz as usize, vm_flags, None)?;

        let mut offset = ph.p_offset as usize;
        let mut start = ph.p_va as usize;
        let mut la = round_down(start, PG_SIZE);
        let mut end = ph.p_va as usize + ph.p_filesz as usize;
        let mut page = ptr::null_mut();

        // file-backed part
        while start < end {
            page = pmm::pgdir_alloc_page(mm, (*mm).pgdir, la, perm);
            if page.is_null() {
                return Err(KernelError::NoMem);
            }
            let off = start - la;
            let mut size = PG_SIZE - off;
            la += PG_SIZE;
            if end < la {
                size -= la - end;
            }
            load_icode_read(fd, (pmm::page2kva(page) + off) as *mut u8, size, offset)?;
            start += size;
            offset += size;
        }

        // BSS tail
        end = ph.p_va as usize + ph.p_memsz as usize;
        if start < la {
            if start == end {
                continue;
            }
            let off = start + PG_SIZE - la;
            let mut size = PG_SIZE - off;
            if end < la {
                size -= la - end;
            }
            ptr::write_bytes((pmm::page2kva(page) + off) as *mut u8, 0, size);
            start += size;
            assert!((end < la && start == end) || (end >= la && start == la));
        }
        while start < end {
            page = pmm::pgdir_alloc_page(mm, (*mm).pgdir, la, perm);
            if page.is_null() {
                return Err(KernelError::NoMem);
            }
            let off = start - la;
            let mut size = PG_SIZE - off;
            la += PG_SIZE;
            if end < la {
                size -= la - end;
            }
            ptr::write_bytes((pmm::page2kva(page) + off) as *mut u8, 0, size);
            start += size;
        }
    }
    let _ = sysfile::sysfile_close(fd);

    // user stack: guard page at the bottom stays unmapped by the checker
    vmm::mm_map(
        mm,
        USTACK_TOP - USTACK_SIZE,
        USTACK_SIZE,
        VmFlags::READ | VmFlags::WRITE | VmFlags::STACK,
        None,
    )?;
    for i in 1..=4 {
        if pmm::pgdir_alloc_page(mm, (*mm).pgdir, USTACK_TOP - i * PG_SIZE, PTE_USER).is_null() {
            return Err(KernelError::NoMem);
        }
    }
    Ok(elf)
}

/// Build the new image for the current process (whose old mm is already
/// gone): segments, stack, argv, and a user-mode trap frame at
/// `elf.e_entry`.
unsafe fn load_icode(fd: i32, kargv: &[Vec<u8>]) -> Result<()> {
    assert!(kargv.len() <= EXEC_MAX_ARG_NUM);
    let cur = proc::current();
    if !(*cur).mm.is_null() {
        panic!("load_icode: current mm must be empty.");
    }

    let mm = vmm::mm_create();
    if let Err(e) = setup_pgdir(mm) {
        vmm::mm_destroy(mm);
        return Err(e);
    }

    let elf = match load_segments(fd, mm) {
        Err(e) => {
            vmm::exit_mmap(mm);
            put_pgdir(mm);
            vmm::mm_destroy(mm);
            return Err(e);
        }
        Ok(elf) => elf,
    };

    // commit to the new image
    vmm::mm_count_inc(mm);
    (*cur).mm = mm;
    (*cur).cr3 = pmm::paddr((*mm).pgdir as usize);
    i386::lcr3((*cur).cr3);

    // argv strings, then the pointer array, then argc, all on the user
    // stack (faults in lazily past the pre-mapped pages)
    let argc = kargv.len();
    let argv_size: usize = kargv.iter().map(|s| s.len() + 1).sum();
    let strtop = USTACK_TOP - (argv_size / 4 + 1) * 4;
    let uargv = (strtop - argc * 4) as *mut u32;

    let mut str_at = strtop;
    for (i, arg) in kargv.iter().enumerate() {
        *uargv.add(i) = str_at as u32;
        ptr::copy_nonoverlapping(arg.as_ptr(), str_at as *mut u8, arg.len());
        *((str_at + arg.len()) as *mut u8) = 0;
        str_at += arg.len() + 1;
    }

    let stacktop = uargv as usize - 4;
    *(stacktop as *mut u32) = argc as u32;

    let tf = &mut *(*cur).tf;
    *tf = core::mem::zeroed();
    tf.tf_cs = USER_CS;
    tf.tf_ds = USER_DS;
    tf.tf_es = USER_DS;
    tf.tf_ss = USER_DS;
    tf.tf_esp = stacktop as u32;
    tf.tf_eip = elf.e_entry;
    tf.tf_eflags = FL_IF as u32;
    Ok(())
}

unsafe fn copy_kargv(
    mm: *mut vmm::MmStruct,
    argc: usize,
    argv: usize,
) -> Result<Vec<Vec<u8>>> {
    if !vmm::user_mem_check(mm, argv, core::mem::size_of::<u32>() * argc, false) {
        return Err(KernelError::Invalid);
    }
    let mut kargv = Vec::with_capacity(argc);
    for i in 0..argc {
        let uptr = *((argv + 4 * i) as *const u32) as usize;
        let mut buf = vec![0u8; EXEC_MAX_ARG_LEN + 1];
        if !vmm::copy_string(mm, buf.as_mut_ptr(), uptr, EXEC_MAX_ARG_LEN + 1) {
            return Err(KernelError::Invalid);
        }
        let len = buf.iter().position(|&b| b == 0).unwrap_or(EXEC_MAX_ARG_LEN);
        buf.truncate(len);
        kargv.push(buf);
    }
    Ok(kargv)
}

/// The exec syscall. Argument-validation failures return to the caller;
/// once the old address space is torn down, failure exits the process.
pub unsafe fn do_execve(name: usize, argc: usize, argv: usize) -> Result<i32> {
    let cur = proc::current();
    let mm = (*cur).mm;

    if !(1..=EXEC_MAX_ARG_NUM).contains(&argc) {
        return Err(KernelError::Invalid);
    }

    vmm::lock_mm(mm);
    let mut local_name = [0u8; PROC_NAME_LEN + 1];
    if name != 0 {
        if !vmm::copy_string(mm, local_name.as_mut_ptr(), name, PROC_NAME_LEN + 1) {
            vmm::unlock_mm(mm);
            return Err(KernelError::Invalid);
        }
    } else {
        local_name[..6].copy_from_slice(b"<null>");
    }
    let kargv = match copy_kargv(mm, argc, argv) {
        Err(e) => {
            vmm::unlock_mm(mm);
            return Err(e);
        }
        Ok(v) => v,
    };
    vmm::unlock_mm(mm);

    sysfile::files_closeall((*cur).filesp);

    let path = core::str::from_utf8(&kargv[0]).map_err(|_| KernelError::Invalid);
    let fd = match path.and_then(sysfile::sysfile_open) {
        Err(e) => {
            proc::do_exit(e.code());
        }
        Ok(fd) => fd,
    };

    if !mm.is_null() {
        i386::lcr3(pmm::BOOT_CR3);
        if vmm::mm_count_dec(mm) == 0 {
            vmm::exit_mmap(mm);
            put_pgdir(mm);
            vmm::mm_destroy(mm);
        }
        (*cur).mm = ptr::null_mut();
    }

    if let Err(e) = load_icode(fd, &kargv) {
        proc::do_exit(e.code());
    }

    let name_len = local_name
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(PROC_NAME_LEN);
    proc::set_proc_name(cur, core::str::from_utf8_unchecked(&local_name[..name_len]));
    Ok(0)
}
