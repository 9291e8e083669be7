//! Program store for exec, standing in for a real VFS.
//!
//! The first sector of disk0 is a table of contents mapping program names
//! to sector extents; `sysfile_*` expose the usual open/seek/read/close
//! surface over it, with a per-process handle table that fork shares or
//! duplicates (`CLONE_FS`).

use alloc::boxed::Box;
use core::ptr;

use crate::error::{KernelError, Result};
use crate::ide::{ide_device_valid, ide_read_secs, SECT_SIZE};
use crate::param::NOFILE;
use crate::proc;

/// Programs live on the secondary-channel master disk.
pub const DISK0_DEV_NO: usize = 2;

const FS_MAGIC: u32 = 0x4D49_4341; // "MICA"
const TOC_MAX: usize = 15;
const FS_NAME_LEN: usize = 24;

#[derive(Clone, Copy)]
#[repr(C)]
struct TocEntry {
    name: [u8; FS_NAME_LEN],
    start_sect: u32,
    size: u32, // bytes
}

#[repr(C)]
struct Toc {
    magic: u32,
    n_files: u32,
    entries: [TocEntry; TOC_MAX],
}

static mut TOC: Toc = Toc {
    magic: 0,
    n_files: 0,
    entries: [TocEntry {
        name: [0; FS_NAME_LEN],
        start_sect: 0,
        size: 0,
    }; TOC_MAX],
};

static mut FS_AVAILABLE: bool = false;

pub fn fs_init() {
    if !ide_device_valid(DISK0_DEV_NO) {
        log::warn!("fs: no program store disk");
        return;
    }
    unsafe {
        let mut sect = [0u8; SECT_SIZE];
        if ide_read_secs(DISK0_DEV_NO, 0, sect.as_mut_ptr(), 1).is_err() {
            log::warn!("fs: cannot read table of contents");
            return;
        }
        TOC = (sect.as_ptr() as *const Toc).read_unaligned();
        if TOC.magic != FS_MAGIC || TOC.n_files as usize > TOC_MAX {
            log::warn!("fs: bad table of contents (magic {:#x})", TOC.magic);
            return;
        }
        FS_AVAILABLE = true;
        log::info!("fs: {} programs in store", TOC.n_files);
    }
}

fn toc_lookup(name: &str) -> Option<usize> {
    unsafe {
        if !FS_AVAILABLE {
            return None;
        }
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() > FS_NAME_LEN {
            return None;
        }
        for i in 0..TOC.n_files as usize {
            let ent = &TOC.entries[i];
            let len = ent.name.iter().position(|&b| b == 0).unwrap_or(FS_NAME_LEN);
            if &ent.name[..len] == bytes {
                return Some(i);
            }
        }
        None
    }
}

/* per-process open-file state */

#[derive(Clone, Copy)]
struct FileDesc {
    used: bool,
    toc_idx: usize,
    pos: usize,
}

impl FileDesc {
    const fn closed() -> Self {
        FileDesc {
            used: false,
            toc_idx: 0,
            pos: 0,
        }
    }
}

pub struct FilesStruct {
    files_count: i32,
    fds: [FileDesc; NOFILE],
}

pub fn files_create() -> *mut FilesStruct {
    Box::into_raw(Box::new(FilesStruct {
        files_count: 0,
        fds: [FileDesc::closed(); NOFILE],
    }))
}

pub unsafe fn files_destroy(filesp: *mut FilesStruct) {
    assert!((*filesp).files_count == 0);
    drop(Box::from_raw(filesp));
}

pub unsafe fn files_count_inc(filesp: *mut FilesStruct) -> i32 {
    (*filesp).files_count += 1;
    (*filesp).files_count
}

pub unsafe fn files_count_dec(filesp: *mut FilesStruct) -> i32 {
    (*filesp).files_count -= 1;
    (*filesp).files_count
}

pub unsafe fn dup_fs(to: *mut FilesStruct, from: *mut FilesStruct) -> Result<()> {
    (*to).fds = (*from).fds;
    Ok(())
}

pub unsafe fn files_closeall(filesp: *mut FilesStruct) {
    for fd in (*filesp).fds.iter_mut() {
        *fd = FileDesc::closed();
    }
}

unsafe fn cur_files() -> Result<*mut FilesStruct> {
    let cur = proc::current();
    if cur.is_null() || (*cur).filesp.is_null() {
        return Err(KernelError::BadProc);
    }
    Ok((*cur).filesp)
}

/// Open a program by name; returns the descriptor index.
pub fn sysfile_open(name: &str) -> Result<i32> {
    let idx = toc_lookup(name).ok_or(KernelError::Invalid)?;
    unsafe {
        let filesp = cur_files()?;
        for (fd, desc) in (*filesp).fds.iter_mut().enumerate() {
            if !desc.used {
                *desc = FileDesc {
                    used: true,
                    toc_idx: idx,
                    pos: 0,
                };
                return Ok(fd as i32);
            }
        }
    }
    Err(KernelError::NoFreeProc)
}

unsafe fn fd_slot(fd: i32) -> Result<*mut FileDesc> {
    let filesp = cur_files()?;
    if fd < 0 || fd as usize >= NOFILE || !(*filesp).fds[fd as usize].used {
        return Err(KernelError::Invalid);
    }
    Ok(&mut (*filesp).fds[fd as usize])
}

pub fn sysfile_close(fd: i32) -> Result<()> {
    unsafe {
        let slot = fd_slot(fd)?;
        *slot = FileDesc::closed();
    }
    Ok(())
}

/// Absolute seek.
pub fn sysfile_seek(fd: i32, pos: usize) -> Result<()> {
    unsafe {
        let slot = fd_slot(fd)?;
        let ent = &TOC.entries[(*slot).toc_idx];
        if pos > ent.size as usize {
            return Err(KernelError::Invalid);
        }
        (*slot).pos = pos;
    }
    Ok(())
}

/// Read up to `len` bytes at the descriptor's position. Short reads only
/// happen at end of file.
pub fn sysfile_read(fd: i32, buf: *mut u8, len: usize) -> Result<usize> {
    unsafe {
        let slot = fd_slot(fd)?;
        let ent = TOC.entries[(*slot).toc_idx];
        let mut pos = (*slot).pos;
        let end = core::cmp::min(pos + len, ent.size as usize);

        let mut dst = buf;
        let mut sect_buf = [0u8; SECT_SIZE];
        while pos < end {
            let sect = ent.start_sect as usize + pos / SECT_SIZE;
            let off = pos % SECT_SIZE;
            let chunk = core::cmp::min(SECT_SIZE - off, end - pos);
            ide_read_secs(DISK0_DEV_NO, sect, sect_buf.as_mut_ptr(), 1)?;
            ptr::copy_nonoverlapping(sect_buf.as_ptr().add(off), dst, chunk);
            dst = dst.add(chunk);
            pos += chunk;
        }

        let read = pos - (*slot).pos;
        (*slot).pos = pos;
        Ok(read)
    }
}
