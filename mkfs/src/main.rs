//! Build a program-store image for the kernel's disk0.
//!
//! Disk layout:
//! [ table of contents | file 0 | file 1 | ... ]
//!
//! Sector 0 holds the table of contents: a magic word, the file count,
//! and one 32-byte entry per file (name, start sector, byte size). Each
//! file starts on a sector boundary. The layout must match the kernel's
//! `sysfile` module.

use clap::Parser;
use std::fs::File;
use std::io::{Read, Result, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const SECT_SIZE: usize = 512;
const FS_MAGIC: u32 = 0x4D49_4341; // "MICA"
const TOC_MAX: usize = 15;
const FS_NAME_LEN: usize = 24;

struct TocEntry {
    name: [u8; FS_NAME_LEN],
    start_sect: u32,
    size: u32,
}

#[derive(Parser, Debug)]
struct Args {
    /// Name of the output img file
    #[arg(short, long)]
    output_name: String,

    /// Files to place in the image, named by their file stem
    #[arg(short, long)]
    files: Vec<PathBuf>,
}

fn wsect(img: &mut File, sec: usize, buf: &[u8]) -> Result<()> {
    img.seek(SeekFrom::Start((sec * SECT_SIZE) as u64))?;
    img.write_all(buf)?;
    Ok(())
}

fn entry_name(path: &Path) -> [u8; FS_NAME_LEN] {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .expect("file name is not valid UTF-8");
    assert!(
        stem.len() <= FS_NAME_LEN,
        "name '{}' longer than {} bytes",
        stem,
        FS_NAME_LEN
    );
    let mut name = [0u8; FS_NAME_LEN];
    name[..stem.len()].copy_from_slice(stem.as_bytes());
    name
}

fn main() -> Result<()> {
    let args = Args::parse();
    assert!(
        args.files.len() <= TOC_MAX,
        "at most {} files fit in the table of contents",
        TOC_MAX
    );

    let mut img = File::options()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&args.output_name)?;

    let mut entries = Vec::new();
    let mut next_sect = 1usize; // sector 0 is the table of contents

    for path in &args.files {
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;

        entries.push(TocEntry {
            name: entry_name(path),
            start_sect: next_sect as u32,
            size: data.len() as u32,
        });

        let nsects = data.len().div_ceil(SECT_SIZE);
        data.resize(nsects * SECT_SIZE, 0);
        wsect(&mut img, next_sect, &data)?;

        println!(
            "{}: {} bytes at sector {}",
            path.display(),
            entries.last().unwrap().size,
            next_sect
        );
        next_sect += nsects;
    }

    // table of contents, little-endian throughout
    let mut toc = vec![0u8; SECT_SIZE];
    toc[0..4].copy_from_slice(&FS_MAGIC.to_le_bytes());
    toc[4..8].copy_from_slice(&(entries.len() as u32).to_le_bytes());
    for (i, ent) in entries.iter().enumerate() {
        let at = 8 + i * 32;
        toc[at..at + FS_NAME_LEN].copy_from_slice(&ent.name);
        toc[at + 24..at + 28].copy_from_slice(&ent.start_sect.to_le_bytes());
        toc[at + 28..at + 32].copy_from_slice(&ent.size.to_le_bytes());
    }
    wsect(&mut img, 0, &toc)?;

    println!(
        "{}: {} files, {} sectors",
        args.output_name,
        entries.len(),
        next_sect
    );
    Ok(())
}
