//! Hand-mapping of the dynamic linker

use core::fmt;

use linux_raw_sys::general::{
    AT_ENTRY, AT_NULL, AT_PHDR, AT_PHNUM, MAP_ANONYMOUS, MAP_FIXED, MAP_NORESERVE, MAP_PRIVATE,
    PROT_EXEC, PROT_NONE, PROT_READ, PROT_WRITE,
};
use xmas_elf::ElfFile;
use xmas_elf::header;
use xmas_elf::program;

use crate::sys::{self, Errno, align_down, align_up};

/// Bytes read from the front of the file; program headers must lie inside
pub const HEADER_WINDOW: usize = 832;

pub const MAX_SEGMENTS: usize = 16;

const PHDR_SIZE: usize = 56;

/// `\x7fELF`, 64-bit, little endian, version 1, System V, zero padding
const EXPECTED_IDENT: [u8; 16] = [0x7f, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    Open(Errno),
    Read(Errno),
    BadIdent,
    NotSharedObject,
    ProgramHeadersOutsideWindow,
    TooManySegments,
    Parse(&'static str),
    Map(Errno),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Open(e) => write!(f, "couldn't open dynamic linker (errno {})", e),
            LoadError::Read(e) => write!(f, "couldn't read dynamic linker (errno {})", e),
            LoadError::BadIdent => f.write_str("dynamic linker is not a 64-bit LSB SysV ELF"),
            LoadError::NotSharedObject => f.write_str("dynamic linker is not ET_DYN"),
            LoadError::ProgramHeadersOutsideWindow => {
                f.write_str("dynamic linker program headers are out of reach")
            }
            LoadError::TooManySegments => f.write_str("dynamic linker has too many segments"),
            LoadError::Parse(msg) => write!(f, "dynamic linker: {}", msg),
            LoadError::Map(e) => write!(f, "couldn't map dynamic linker (errno {})", e),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Segment {
    pub vaddr: usize,
    pub memsz: usize,
    pub filesz: usize,
    pub offset: usize,
    pub prot: u32,
}

/// Everything needed to map an image, taken from its header window
#[derive(Debug)]
pub struct LoadPlan {
    segments: [Segment; MAX_SEGMENTS],
    count: usize,
    /// Bytes of address space from the load base to the end of the last
    /// segment
    pub span: usize,
    pub entry: usize,
    pub phoff: usize,
    pub phnum: usize,
}

impl LoadPlan {
    pub fn segments(&self) -> &[Segment] {
        &self.segments[..self.count]
    }
}

/// Validate the header window and collect the `PT_LOAD` segments.
pub fn plan(image: &[u8]) -> Result<LoadPlan, LoadError> {
    if image.len() < EXPECTED_IDENT.len() || image[..EXPECTED_IDENT.len()] != EXPECTED_IDENT {
        return Err(LoadError::BadIdent);
    }
    let elf = ElfFile::new(image).map_err(LoadError::Parse)?;
    let pt2 = &elf.header.pt2;
    if pt2.type_().as_type() != header::Type::SharedObject {
        return Err(LoadError::NotSharedObject);
    }

    let phoff = pt2.ph_offset() as usize;
    let phnum = pt2.ph_count() as usize;
    let table_end = phnum
        .checked_mul(PHDR_SIZE)
        .and_then(|size| size.checked_add(phoff));
    if pt2.ph_entry_size() as usize != PHDR_SIZE || table_end.is_none_or(|end| end > image.len())
    {
        return Err(LoadError::ProgramHeadersOutsideWindow);
    }

    let mut plan = LoadPlan {
        segments: [Segment::default(); MAX_SEGMENTS],
        count: 0,
        span: 0,
        entry: pt2.entry_point() as usize,
        phoff,
        phnum,
    };

    for ph in elf.program_iter() {
        if !matches!(ph.get_type(), Ok(program::Type::Load)) {
            continue;
        }
        let flags = ph.flags();
        let mut prot = 0;
        if flags.is_read() {
            prot |= PROT_READ;
        }
        if flags.is_write() {
            prot |= PROT_WRITE;
        }
        if flags.is_execute() {
            prot |= PROT_EXEC;
        }
        let segment = Segment {
            vaddr: ph.virtual_addr() as usize,
            memsz: ph.mem_size() as usize,
            filesz: ph.file_size() as usize,
            offset: ph.offset() as usize,
            prot,
        };
        if segment.filesz > segment.memsz {
            return Err(LoadError::Parse("segment file size exceeds memory size"));
        }
        let end = segment
            .vaddr
            .checked_add(segment.memsz)
            .ok_or(LoadError::Parse("segment wraps the address space"))?;

        let slot = plan
            .segments
            .get_mut(plan.count)
            .ok_or(LoadError::TooManySegments)?;
        *slot = segment;
        plan.count += 1;
        plan.span = plan.span.max(align_up(end));
    }

    if plan.count == 0 {
        return Err(LoadError::Parse("no loadable segments"));
    }
    Ok(plan)
}

/// Map `plan`'s segments from `fd` at a free base address; returns the base.
///
/// The process is single-threaded here, so the reserve-then-unmap probe
/// cannot race with another mapping.
pub fn map(fd: i32, plan: &LoadPlan) -> Result<usize, LoadError> {
    let base = unsafe {
        sys::mmap(
            0,
            plan.span,
            PROT_NONE,
            MAP_PRIVATE | MAP_ANONYMOUS | MAP_NORESERVE,
            -1,
            0,
        )
    }
    .map_err(LoadError::Map)?;
    unsafe { sys::munmap(base, plan.span) };

    for seg in plan.segments() {
        let start = align_down(base + seg.vaddr);
        let file_end = align_up(base + seg.vaddr + seg.filesz);
        let mem_end = align_up(base + seg.vaddr + seg.memsz);

        if file_end > start {
            let mapped = unsafe {
                sys::mmap(
                    start,
                    file_end - start,
                    seg.prot,
                    MAP_PRIVATE | MAP_FIXED,
                    fd,
                    align_down(seg.offset),
                )
            }
            .map_err(LoadError::Map)?;
            if mapped != start {
                return Err(LoadError::Map(linux_raw_sys::errno::ENOMEM as Errno));
            }
        }

        if seg.memsz > seg.filesz {
            // bss: zero the tail of the last file page, then map anonymous
            // pages for the rest
            let zero_from = base + seg.vaddr + seg.filesz;
            if file_end > zero_from && seg.prot & PROT_WRITE != 0 {
                unsafe { core::ptr::write_bytes(zero_from as *mut u8, 0, file_end - zero_from) };
            }
            let anon_from = file_end.max(start);
            if mem_end > anon_from {
                unsafe {
                    sys::mmap(
                        anon_from,
                        mem_end - anon_from,
                        seg.prot,
                        MAP_PRIVATE | MAP_ANONYMOUS | MAP_FIXED,
                        -1,
                        0,
                    )
                }
                .map_err(LoadError::Map)?;
            }
        }
    }
    Ok(base)
}

/// Point the auxiliary vector at the mapped image so it believes it was
/// started by the kernel as the main program.
///
/// # Safety
/// `auxv` points at a writable, `AT_NULL`-terminated vector of
/// `(type, value)` pairs.
pub unsafe fn patch_auxv(auxv: *mut usize, base: usize, plan: &LoadPlan) {
    let mut entry = auxv;
    loop {
        let kind = unsafe { *entry };
        if kind == AT_NULL as usize {
            break;
        }
        let value = unsafe { entry.add(1) };
        match kind as u32 {
            AT_PHDR => unsafe { *value = base + plan.phoff },
            AT_PHNUM => unsafe { *value = plan.phnum },
            AT_ENTRY => unsafe { *value = base + plan.entry },
            _ => {}
        }
        entry = unsafe { entry.add(2) };
    }
}
