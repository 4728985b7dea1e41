//! argv/envp rewriting for emulated `execve`

use core::ptr;

use linux_raw_sys::general::{MAP_ANONYMOUS, MAP_PRIVATE, PROT_READ, PROT_WRITE};

use sandbox_protocol::LOADER_ARGV0;

use crate::sys::{self, Errno};

const PWD: &[u8] = b"PWD=";

/// Bump allocator over one anonymous mapping, released in one piece
pub struct Arena {
    base: *mut u8,
    cap: usize,
    used: usize,
    mapped: bool,
}

impl Arena {
    pub fn map(size: usize) -> Result<Self, Errno> {
        let cap = sys::align_up(size.max(1));
        let base = unsafe {
            sys::mmap(
                0,
                cap,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )?
        };
        Ok(Self {
            base: base as *mut u8,
            cap,
            used: 0,
            mapped: true,
        })
    }

    /// Arena over caller-owned memory; never unmapped.
    ///
    /// # Safety
    /// `base` must be valid for `cap` bytes, 8-byte aligned, for the
    /// arena's lifetime.
    pub unsafe fn from_raw(base: *mut u8, cap: usize) -> Self {
        Self {
            base,
            cap,
            used: 0,
            mapped: false,
        }
    }

    fn alloc(&mut self, bytes: usize, align: usize) -> Option<*mut u8> {
        let start = self.used.checked_add(align - 1)? & !(align - 1);
        let end = start.checked_add(bytes)?;
        if end > self.cap {
            return None;
        }
        self.used = end;
        Some(unsafe { self.base.add(start) })
    }

    fn alloc_ptrs(&mut self, count: usize) -> Option<*mut *const u8> {
        let bytes = count.checked_mul(size_of::<usize>())?;
        self.alloc(bytes, align_of::<usize>()).map(|p| p.cast())
    }

    /// Concatenate `parts` into a NUL-terminated string
    pub fn alloc_str(&mut self, parts: &[&[u8]]) -> Option<*const u8> {
        let len: usize = parts.iter().map(|p| p.len()).sum();
        let out = self.alloc(len + 1, 1)?;
        let mut at = 0;
        for part in parts {
            unsafe { ptr::copy_nonoverlapping(part.as_ptr(), out.add(at), part.len()) };
            at += part.len();
        }
        unsafe { out.add(at).write(0) };
        Some(out)
    }

    pub fn release(self) {
        if self.mapped {
            unsafe { sys::munmap(self.base as usize, self.cap) };
        }
    }
}

/// Entries before the terminating NULL; a NULL vector is empty
///
/// # Safety
/// `vec` is NULL or a NULL-terminated array of pointers.
pub unsafe fn count(vec: *const *const u8) -> usize {
    if vec.is_null() {
        return 0;
    }
    let mut n = 0;
    while !unsafe { *vec.add(n) }.is_null() {
        n += 1;
    }
    n
}

/// Arena bytes for both rewritten vectors plus `strings` bytes of text
pub fn arena_size(argc: usize, envc: usize, strings: usize) -> usize {
    (argc + envc + 5) * size_of::<usize>() + strings + 2 * align_of::<usize>()
}

/// `["[sandbox]", path, argv[1..]..., NULL]`
///
/// The caller's `argv[0]` is dropped: the loader takes the program from
/// its own `argv[1]` and passes the rest through.
///
/// # Safety
/// `argv` is NULL or a NULL-terminated pointer array.
pub unsafe fn build_argv(
    arena: &mut Arena,
    path: *const u8,
    argv: *const *const u8,
) -> Option<*const *const u8> {
    let argc = unsafe { count(argv) };
    let rest = argc.saturating_sub(1);
    let out = arena.alloc_ptrs(rest + 3)?;
    unsafe {
        out.write(LOADER_ARGV0.as_ptr().cast());
        out.add(1).write(path);
        for i in 0..rest {
            out.add(2 + i).write(*argv.add(1 + i));
        }
        out.add(2 + rest).write(ptr::null());
    }
    Some(out.cast_const())
}

/// Copy of `envp` with `PWD=` replaced by `pwd`, or `pwd` prepended
///
/// # Safety
/// `envp` is NULL or a NULL-terminated array of C strings.
pub unsafe fn build_envp(
    arena: &mut Arena,
    envp: *const *const u8,
    pwd: *const u8,
) -> Option<*const *const u8> {
    let envc = unsafe { count(envp) };
    let existing = unsafe { find_env(envp, PWD) };
    let out = arena.alloc_ptrs(envc + 2)?;
    unsafe {
        let mut at = 0;
        if existing.is_none() {
            out.write(pwd);
            at = 1;
        }
        for i in 0..envc {
            let entry = if Some(i) == existing { pwd } else { *envp.add(i) };
            out.add(at + i).write(entry);
        }
        out.add(at + envc).write(ptr::null());
    }
    Some(out.cast_const())
}

/// `PWD=<cwd>` in the arena
pub fn pwd_entry(arena: &mut Arena, cwd: &[u8]) -> Option<*const u8> {
    arena.alloc_str(&[PWD, cwd])
}

/// Index of the first entry starting with `prefix`
///
/// # Safety
/// `envp` is NULL or a NULL-terminated array of C strings.
pub unsafe fn find_env(envp: *const *const u8, prefix: &[u8]) -> Option<usize> {
    let envc = unsafe { count(envp) };
    (0..envc).find(|&i| unsafe { starts_with(*envp.add(i), prefix) })
}

/// Value of the first `prefix` entry, without the prefix
///
/// # Safety
/// `envp` is NULL or a NULL-terminated array of C strings that outlive
/// the returned slice.
pub unsafe fn env_value<'a>(envp: *const *const u8, prefix: &[u8]) -> Option<&'a [u8]> {
    let i = unsafe { find_env(envp, prefix) }?;
    let entry = unsafe { *envp.add(i) };
    let len = unsafe { c_strlen(entry, usize::MAX) }?;
    Some(unsafe { core::slice::from_raw_parts(entry.add(prefix.len()), len - prefix.len()) })
}

/// Length of a C string, or `None` if no NUL appears in `max` bytes
///
/// # Safety
/// `s` is readable up to its terminator or `max` bytes.
pub unsafe fn c_strlen(s: *const u8, max: usize) -> Option<usize> {
    (0..max).find(|&i| unsafe { *s.add(i) } == 0)
}

unsafe fn starts_with(s: *const u8, prefix: &[u8]) -> bool {
    prefix
        .iter()
        .enumerate()
        .all(|(i, &b)| unsafe { *s.add(i) } == b)
}
