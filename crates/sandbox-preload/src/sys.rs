//! Raw x86-64 syscalls and the handful of kernel structs the preload touches

use core::arch::asm;
use core::fmt;

use linux_raw_sys::general::{
    __NR_close, __NR_dup2, __NR_execveat, __NR_exit_group, __NR_fchmod, __NR_fcntl, __NR_fstat,
    __NR_mmap, __NR_munmap, __NR_open, __NR_read, __NR_recvmsg, __NR_rt_sigaction, __NR_sendto,
    __NR_write,
};

pub type Errno = i32;

// Not exported by the linux-raw-sys modules this crate enables.
pub const X_OK: u32 = 1;
pub const SOL_SOCKET: i32 = 1;
pub const SCM_RIGHTS: i32 = 1;
pub const MSG_EOR: u32 = 0x80;
pub const MSG_NOSIGNAL: u32 = 0x4000;
pub const MSG_CMSG_CLOEXEC: u32 = 0x4000_0000;
pub const SA_RESTORER: u32 = 0x0400_0000;

pub const PAGE_SIZE: usize = 4096;

pub const fn align_down(value: usize) -> usize {
    value & !(PAGE_SIZE - 1)
}

pub const fn align_up(value: usize) -> usize {
    align_down(value + PAGE_SIZE - 1)
}

#[inline(always)]
pub unsafe fn syscall1(nr: u32, a1: usize) -> isize {
    let ret: isize;
    unsafe {
        asm!(
            "syscall",
            inlateout("rax") nr as isize => ret,
            in("rdi") a1,
            lateout("rcx") _,
            lateout("r11") _,
            options(nostack),
        );
    }
    ret
}

#[inline(always)]
pub unsafe fn syscall2(nr: u32, a1: usize, a2: usize) -> isize {
    let ret: isize;
    unsafe {
        asm!(
            "syscall",
            inlateout("rax") nr as isize => ret,
            in("rdi") a1,
            in("rsi") a2,
            lateout("rcx") _,
            lateout("r11") _,
            options(nostack),
        );
    }
    ret
}

#[inline(always)]
pub unsafe fn syscall3(nr: u32, a1: usize, a2: usize, a3: usize) -> isize {
    let ret: isize;
    unsafe {
        asm!(
            "syscall",
            inlateout("rax") nr as isize => ret,
            in("rdi") a1,
            in("rsi") a2,
            in("rdx") a3,
            lateout("rcx") _,
            lateout("r11") _,
            options(nostack),
        );
    }
    ret
}

#[inline(always)]
pub unsafe fn syscall4(nr: u32, a1: usize, a2: usize, a3: usize, a4: usize) -> isize {
    let ret: isize;
    unsafe {
        asm!(
            "syscall",
            inlateout("rax") nr as isize => ret,
            in("rdi") a1,
            in("rsi") a2,
            in("rdx") a3,
            in("r10") a4,
            lateout("rcx") _,
            lateout("r11") _,
            options(nostack),
        );
    }
    ret
}

#[inline(always)]
pub unsafe fn syscall5(nr: u32, a1: usize, a2: usize, a3: usize, a4: usize, a5: usize) -> isize {
    let ret: isize;
    unsafe {
        asm!(
            "syscall",
            inlateout("rax") nr as isize => ret,
            in("rdi") a1,
            in("rsi") a2,
            in("rdx") a3,
            in("r10") a4,
            in("r8") a5,
            lateout("rcx") _,
            lateout("r11") _,
            options(nostack),
        );
    }
    ret
}

#[inline(always)]
pub unsafe fn syscall6(
    nr: u32,
    a1: usize,
    a2: usize,
    a3: usize,
    a4: usize,
    a5: usize,
    a6: usize,
) -> isize {
    let ret: isize;
    unsafe {
        asm!(
            "syscall",
            inlateout("rax") nr as isize => ret,
            in("rdi") a1,
            in("rsi") a2,
            in("rdx") a3,
            in("r10") a4,
            in("r8") a5,
            in("r9") a6,
            lateout("rcx") _,
            lateout("r11") _,
            options(nostack),
        );
    }
    ret
}

/// Split a raw return value into a result; the kernel reports errors as
/// `-4095..=-1`.
pub fn check(ret: isize) -> Result<usize, Errno> {
    if (-4095..0).contains(&ret) {
        Err(-ret as Errno)
    } else {
        Ok(ret as usize)
    }
}

pub fn exit_group(code: i32) -> ! {
    unsafe {
        asm!(
            "syscall",
            in("rax") __NR_exit_group as usize,
            in("rdi") code as isize,
            options(noreturn, nostack),
        );
    }
}

pub unsafe fn open(path: *const u8, flags: u32, mode: u32) -> Result<i32, Errno> {
    check(unsafe { syscall3(__NR_open, path as usize, flags as usize, mode as usize) })
        .map(|fd| fd as i32)
}

pub fn read(fd: i32, buf: &mut [u8]) -> Result<usize, Errno> {
    check(unsafe { syscall3(__NR_read, fd as usize, buf.as_mut_ptr() as usize, buf.len()) })
}

pub fn write(fd: i32, buf: &[u8]) -> Result<usize, Errno> {
    check(unsafe { syscall3(__NR_write, fd as usize, buf.as_ptr() as usize, buf.len()) })
}

pub fn close(fd: i32) {
    unsafe { syscall1(__NR_close, fd as usize) };
}

pub fn dup2(old: i32, new: i32) -> Result<i32, Errno> {
    check(unsafe { syscall2(__NR_dup2, old as usize, new as usize) }).map(|fd| fd as i32)
}

pub fn fcntl(fd: i32, cmd: u32, arg: usize) -> Result<usize, Errno> {
    check(unsafe { syscall3(__NR_fcntl, fd as usize, cmd as usize, arg) })
}

pub unsafe fn fstat(fd: i32, buf: *mut u8) -> isize {
    unsafe { syscall2(__NR_fstat, fd as usize, buf as usize) }
}

pub fn fchmod(fd: i32, mode: u32) -> isize {
    unsafe { syscall2(__NR_fchmod, fd as usize, mode as usize) }
}

pub unsafe fn mmap(
    addr: usize,
    len: usize,
    prot: u32,
    flags: u32,
    fd: i32,
    offset: usize,
) -> Result<usize, Errno> {
    check(unsafe {
        syscall6(
            __NR_mmap,
            addr,
            len,
            prot as usize,
            flags as usize,
            fd as isize as usize,
            offset,
        )
    })
}

pub unsafe fn munmap(addr: usize, len: usize) {
    unsafe { syscall2(__NR_munmap, addr, len) };
}

pub fn send(fd: i32, buf: &[u8], flags: u32) -> Result<usize, Errno> {
    check(unsafe {
        syscall6(
            __NR_sendto,
            fd as usize,
            buf.as_ptr() as usize,
            buf.len(),
            flags as usize,
            0,
            0,
        )
    })
}

pub unsafe fn recvmsg(fd: i32, msg: *mut MsgHdr, flags: u32) -> Result<usize, Errno> {
    check(unsafe { syscall3(__NR_recvmsg, fd as usize, msg as usize, flags as usize) })
}

pub unsafe fn execveat(
    dirfd: i32,
    path: usize,
    argv: *const *const u8,
    envp: *const *const u8,
    flags: u32,
) -> isize {
    unsafe {
        syscall5(
            __NR_execveat,
            dirfd as usize,
            path,
            argv as usize,
            envp as usize,
            flags as usize,
        )
    }
}

pub unsafe fn rt_sigaction(sig: u32, act: &KernelSigaction) -> Result<usize, Errno> {
    check(unsafe {
        syscall4(
            __NR_rt_sigaction,
            sig as usize,
            act as *const KernelSigaction as usize,
            0,
            size_of::<u64>(),
        )
    })
}

#[repr(C)]
pub struct IoVec {
    pub base: *mut u8,
    pub len: usize,
}

#[repr(C)]
pub struct MsgHdr {
    pub name: *mut u8,
    pub namelen: u32,
    pub iov: *mut IoVec,
    pub iovlen: usize,
    pub control: *mut u8,
    pub controllen: usize,
    pub flags: i32,
}

#[repr(C)]
pub struct CmsgHdr {
    pub len: usize,
    pub level: i32,
    pub kind: i32,
}

/// The kernel's `struct sigaction`, not libc's
#[repr(C)]
pub struct KernelSigaction {
    pub handler: usize,
    pub flags: u64,
    pub restorer: usize,
    pub mask: u64,
}

/// Leading fields of `siginfo_t`
#[repr(C)]
pub struct SigInfo {
    pub signo: i32,
    pub errno: i32,
    pub code: i32,
}

/// Unbuffered writer for fd 2
pub struct Stderr;

impl fmt::Write for Stderr {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut rest = s.as_bytes();
        while !rest.is_empty() {
            match write(2, rest) {
                Ok(0) | Err(_) => return Err(fmt::Error),
                Ok(n) => rest = &rest[n..],
            }
        }
        Ok(())
    }
}

/// Print `sandbox: <msg>` to stderr
pub fn report(args: fmt::Arguments<'_>) {
    use fmt::Write;
    let _ = Stderr.write_fmt(format_args!("sandbox: {}\n", args));
}

pub fn fatal(args: fmt::Arguments<'_>) -> ! {
    report(args);
    exit_group(1)
}
