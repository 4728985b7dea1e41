//! Static entry image executed in place of every sandboxed program.
//!
//! The kernel starts us at `_start` with the original stack; we map the
//! dynamic linker, then jump to it so it loads the real program named by
//! `argv[1]`.

#![no_std]
#![no_main]
#![no_builtins]

use core::arch::global_asm;
use core::panic::PanicInfo;

use sandbox_preload::sys;

global_asm!(
    ".globl _start",
    ".type _start, @function",
    "_start:",
    "    mov rdi, rsp",
    "    call {entry}",
    // ld-linux reads rdx as an atexit hook; zero means none
    "    xor edx, edx",
    "    jmp rax",
    entry = sym sandbox_preload::bootstrap::bootstrap_start,
);

#[panic_handler]
fn panic(info: &PanicInfo<'_>) -> ! {
    sys::fatal(format_args!("panic: {}", info.message()))
}

// The image is linked without libc, but rustc still emits calls to these.

#[unsafe(no_mangle)]
pub unsafe extern "C" fn memcpy(dst: *mut u8, src: *const u8, n: usize) -> *mut u8 {
    let mut i = 0;
    while i < n {
        unsafe { *dst.add(i) = *src.add(i) };
        i += 1;
    }
    dst
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn memmove(dst: *mut u8, src: *const u8, n: usize) -> *mut u8 {
    if (dst as usize) <= (src as usize) {
        return unsafe { memcpy(dst, src, n) };
    }
    let mut i = n;
    while i > 0 {
        i -= 1;
        unsafe { *dst.add(i) = *src.add(i) };
    }
    dst
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn memset(dst: *mut u8, value: i32, n: usize) -> *mut u8 {
    let mut i = 0;
    while i < n {
        unsafe { *dst.add(i) = value as u8 };
        i += 1;
    }
    dst
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn memcmp(a: *const u8, b: *const u8, n: usize) -> i32 {
    let mut i = 0;
    while i < n {
        let (x, y) = unsafe { (*a.add(i), *b.add(i)) };
        if x != y {
            return x as i32 - y as i32;
        }
        i += 1;
    }
    0
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn bcmp(a: *const u8, b: *const u8, n: usize) -> i32 {
    unsafe { memcmp(a, b, n) }
}
