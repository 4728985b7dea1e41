//! SIGSYS handler emulating trapped syscalls through the broker
//!
//! Each handler returns what the kernel would: a value or `-errno` in
//! `rax`. Paths are flattened against a virtual working directory before
//! they leave the process.

use core::ffi::c_void;

use linux_raw_sys::errno::{
    EACCES, EFAULT, EINVAL, EIO, ENAMETOOLONG, ENOENT, ENOMEM, ENOSYS, ERANGE,
};
use linux_raw_sys::general::{
    __NR_access, __NR_chdir, __NR_chmod, __NR_clone, __NR_clone3, __NR_creat, __NR_execve,
    __NR_execveat, __NR_faccessat, __NR_faccessat2, __NR_fork, __NR_getcwd, __NR_getrusage,
    __NR_lstat, __NR_newfstatat, __NR_open, __NR_openat, __NR_readlink, __NR_readlinkat,
    __NR_stat, __NR_statx, __NR_sysinfo, __NR_uname, __NR_unlink, __NR_unlinkat, __NR_vfork,
    AT_EMPTY_PATH, AT_FDCWD, AT_REMOVEDIR, CLONE_CHILD_CLEARTID, CLONE_CHILD_SETTID,
    CLONE_PARENT_SETTID, F_GETFD, F_SETFD, FD_CLOEXEC, MAP_ANONYMOUS, MAP_FIXED,
    MAP_PRIVATE, O_CLOEXEC, O_CREAT, O_RDONLY, O_TRUNC, O_WRONLY, PROT_READ, SA_NODEFER,
    SA_SIGINFO, SIGSYS,
};
use sandbox_protocol::{
    CONTROL_FD, DEFAULT_CWD, FORK_CLONE_FLAGS, GATE_PAGE, GATE_PATH, Op, Request,
};

use crate::channel;
use crate::context::{TrapContext, Trapped};
use crate::exec::{self, Arena};
use crate::path::{self, FlatPath};
use crate::sync::SpinLock;
use crate::sys::{self, SigInfo};

static CWD: SpinLock<FlatPath> = SpinLock::new(FlatPath::root());

/// Longest user string read from the child's memory
const MAX_USER_PATH: usize = 4096;

const RUSAGE_SIZE: usize = 144;

const UTS_FIELD: usize = 65;

/// Reported by `uname`; an old Ubuntu release that identifies nothing
const UTSNAME: [&[u8]; 6] = [
    b"Linux",
    b"ubuntu",
    b"4.4.0-21-generic",
    b"#37-Ubuntu SMP Mon Apr 18 18:33:37 UTC 2016",
    b"x86_64",
    b"(none)",
];

const FAKE_RAM: u64 = 4 * 1024 * 1024 * 1024;

#[repr(C)]
struct Sysinfo {
    uptime: i64,
    loads: [u64; 3],
    totalram: u64,
    freeram: u64,
    sharedram: u64,
    bufferram: u64,
    totalswap: u64,
    freeswap: u64,
    procs: u16,
    pad: u16,
    totalhigh: u64,
    freehigh: u64,
    mem_unit: u32,
}

core::arch::global_asm!(
    ".pushsection .text.sandbox_restore_rt,\"ax\",@progbits",
    ".globl sandbox_restore_rt",
    ".type sandbox_restore_rt,@function",
    "sandbox_restore_rt:",
    "mov eax, {nr}",
    "syscall",
    ".popsection",
    nr = const linux_raw_sys::general::__NR_rt_sigreturn,
);

unsafe extern "C" {
    fn sandbox_restore_rt();
}

/// Install the SIGSYS handler and seed the virtual cwd from `PWD`.
///
/// # Safety
/// `envp` is the NULL-terminated environment from the initial stack.
pub unsafe fn install(envp: *const *const u8) {
    // SA_NODEFER: emulated execve never returns from the handler
    let act = sys::KernelSigaction {
        handler: on_sigsys as usize,
        flags: (SA_SIGINFO | sys::SA_RESTORER | SA_NODEFER) as u64,
        restorer: sandbox_restore_rt as usize,
        mask: 0,
    };
    if let Err(err) = unsafe { sys::rt_sigaction(SIGSYS, &act) } {
        sys::fatal(format_args!("couldn't install SIGSYS handler (errno {})", err));
    }

    let start = unsafe { exec::env_value(envp, b"PWD=") }
        .and_then(|pwd| path::flatten(b"/", pwd))
        .or_else(|| path::flatten(b"/", DEFAULT_CWD.as_bytes()));
    if let Some(start) = start {
        *CWD.lock() = start;
    }
}

unsafe extern "C" fn on_sigsys(_sig: i32, info: *mut SigInfo, ucontext: *mut c_void) {
    let mut context = unsafe { TrapContext::from_ucontext(ucontext) };
    let call = context.syscall();

    let filter_errno = unsafe { (*info).errno };
    let ret = if filter_errno != 0 {
        let [a0, a1, a2, a3, a4, a5] = call.args;
        sys::report(format_args!(
            "denied syscall {} ({:#x} {:#x} {:#x} {:#x} {:#x} {:#x})",
            call.nr, a0, a1, a2, a3, a4, a5,
        ));
        -(filter_errno as isize)
    } else {
        unsafe { emulate(&call, &mut context) }
    };
    context.set_return(ret);
}

fn neg(errno: u32) -> isize {
    -(errno as isize)
}

/// Dispatch one trapped syscall. Only the clone child touches `context`
/// beyond its return value.
unsafe fn emulate(call: &Trapped, context: &mut TrapContext) -> isize {
    let [a0, a1, a2, a3, a4, _] = call.args;
    let at_fdcwd = AT_FDCWD as isize as usize;
    unsafe {
        match call.nr as u32 {
            __NR_open => open(a0 as *const u8, a1 as u32, a2 as u32),
            __NR_openat if a0 == at_fdcwd => open(a1 as *const u8, a2 as u32, a3 as u32),
            __NR_openat => {
                report_path("denied openat relative to a directory", a1 as *const u8);
                neg(ENOENT)
            }
            __NR_creat => open(a0 as *const u8, O_CREAT | O_WRONLY | O_TRUNC, a1 as u32),

            __NR_stat | __NR_lstat => stat(a0 as *const u8, a1 as *mut u8),
            __NR_newfstatat => newfstatat(a0, a1 as *const u8, a2 as *mut u8, a3 as u32),
            __NR_statx => neg(ENOSYS),

            __NR_access => status_request(Op::Access, a0 as *const u8, [a1 as u32, 0, 0]),
            __NR_faccessat | __NR_faccessat2 if a0 == at_fdcwd => {
                status_request(Op::Access, a1 as *const u8, [a2 as u32, 0, 0])
            }
            __NR_unlink => status_request(Op::Unlink, a0 as *const u8, [0; 3]),
            __NR_unlinkat if a0 == at_fdcwd && a2 as u32 & AT_REMOVEDIR == 0 => {
                status_request(Op::Unlink, a1 as *const u8, [0; 3])
            }
            __NR_faccessat | __NR_faccessat2 | __NR_unlinkat => neg(ENOENT),

            __NR_chmod => chmod(a0 as *const u8, a1 as u32),
            __NR_chdir => chdir(a0 as *const u8),
            __NR_getcwd => getcwd(a0 as *mut u8, a1),
            __NR_readlink => readlink(a0 as *const u8),
            __NR_readlinkat => readlink(a1 as *const u8),

            __NR_fork | __NR_vfork => fork(0, 0, context),
            __NR_clone => clone(a0, a1, a2, a3, context),
            __NR_clone3 => neg(ENOSYS),
            __NR_execve => execveat(
                at_fdcwd,
                a0 as *const u8,
                a1 as *const *const u8,
                a2 as *const *const u8,
                0,
            ),
            __NR_execveat => execveat(
                a0,
                a1 as *const u8,
                a2 as *const *const u8,
                a3 as *const *const u8,
                a4 as u32,
            ),

            __NR_uname => uname(a0 as *mut u8),
            __NR_sysinfo => sysinfo(a0 as *mut Sysinfo),
            __NR_getrusage => zero_fill(a1 as *mut u8, RUSAGE_SIZE),

            nr => {
                sys::report(format_args!("can't emulate syscall {}", nr));
                neg(ENOSYS)
            }
        }
    }
}

/// Borrow a NUL-terminated string from the child's memory
unsafe fn user_str<'a>(ptr: *const u8) -> Result<&'a [u8], isize> {
    if ptr.is_null() {
        return Err(neg(EFAULT));
    }
    match unsafe { exec::c_strlen(ptr, MAX_USER_PATH) } {
        Some(len) => Ok(unsafe { core::slice::from_raw_parts(ptr, len) }),
        None => Err(neg(ENAMETOOLONG)),
    }
}

unsafe fn flatten_user(ptr: *const u8) -> Result<FlatPath, isize> {
    let raw = unsafe { user_str(ptr) }?;
    if raw.is_empty() {
        return Err(neg(ENOENT));
    }
    let cwd = CWD.lock();
    path::flatten(cwd.as_bytes(), raw).ok_or(neg(ENOENT))
}

unsafe fn report_path(what: &str, ptr: *const u8) {
    match unsafe { user_str(ptr) } {
        Ok(raw) => sys::report(format_args!("{} {}", what, raw.escape_ascii())),
        Err(_) => sys::report(format_args!("{}", what)),
    }
}

/// Forward a path request and hand back the broker's answer
unsafe fn path_request(
    op: Op,
    ptr: *const u8,
    flags: [u32; 3],
) -> Result<Option<i32>, isize> {
    let flat = unsafe { flatten_user(ptr) }?;
    let Ok(req) = Request::with_path(op, flat.as_bytes()) else {
        return Err(neg(ENOENT));
    };
    channel::call(&req.with_flags(flags)).map_err(|err| -(err as isize))
}

/// A path request whose success carries no descriptor
unsafe fn status_request(op: Op, ptr: *const u8, flags: [u32; 3]) -> isize {
    match unsafe { path_request(op, ptr, flags) } {
        Ok(Some(stray)) => {
            sys::close(stray);
            0
        }
        Ok(None) => 0,
        Err(err) => err,
    }
}

unsafe fn open(path: *const u8, flags: u32, mode: u32) -> isize {
    let fd = match unsafe { path_request(Op::Open, path, [flags, mode, 0]) } {
        Ok(Some(fd)) => fd,
        // an open reply always carries the descriptor
        Ok(None) => return neg(EIO),
        Err(err) => return err,
    };
    if flags & O_CLOEXEC == 0
        && let Ok(current) = sys::fcntl(fd, F_GETFD, 0)
    {
        let _ = sys::fcntl(fd, F_SETFD, current & !(FD_CLOEXEC as usize));
    }
    fd as isize
}

unsafe fn stat(path: *const u8, buf: *mut u8) -> isize {
    let fd = unsafe { open(path, O_RDONLY | O_CLOEXEC, 0) };
    if fd < 0 {
        return fd;
    }
    let ret = unsafe { sys::fstat(fd as i32, buf) };
    sys::close(fd as i32);
    ret
}

unsafe fn newfstatat(dirfd: usize, path: *const u8, buf: *mut u8, flags: u32) -> isize {
    if flags & AT_EMPTY_PATH != 0 && unsafe { user_str(path) }.is_ok_and(|p| p.is_empty()) {
        return unsafe { sys::fstat(dirfd as i32, buf) };
    }
    if dirfd != AT_FDCWD as isize as usize {
        return neg(ENOENT);
    }
    unsafe { stat(path, buf) }
}

unsafe fn chmod(path: *const u8, mode: u32) -> isize {
    let fd = unsafe { open(path, O_RDONLY | O_CLOEXEC, 0) };
    if fd < 0 {
        return fd;
    }
    let ret = sys::fchmod(fd as i32, mode);
    sys::close(fd as i32);
    ret
}

unsafe fn chdir(path: *const u8) -> isize {
    match unsafe { flatten_user(path) } {
        Ok(mut flat) => {
            flat.trim_trailing_slash();
            *CWD.lock() = flat;
            0
        }
        Err(err) => err,
    }
}

unsafe fn getcwd(buf: *mut u8, size: usize) -> isize {
    let cwd = *CWD.lock();
    let bytes = cwd.as_bytes();
    if buf.is_null() {
        return neg(EFAULT);
    }
    if size < bytes.len() + 1 {
        return neg(ERANGE);
    }
    unsafe {
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), buf, bytes.len());
        buf.add(bytes.len()).write(0);
    }
    (bytes.len() + 1) as isize
}

unsafe fn readlink(path: *const u8) -> isize {
    // ttyname(3) probes /proc/self/fd/N; keep that quiet
    let quiet = unsafe { user_str(path) }.is_ok_and(|p| p.starts_with(b"/proc/self/fd/"));
    if !quiet {
        unsafe { report_path("denied readlink", path) };
    }
    neg(EACCES)
}

unsafe fn clone(
    flags: usize,
    stack: usize,
    _parent_tid: usize,
    child_tid: usize,
    context: &mut TrapContext,
) -> isize {
    // threads pass the filter untrapped; anything here is a process
    if flags & CLONE_PARENT_SETTID as usize != 0 {
        return neg(EINVAL);
    }
    let wants_tid = flags & (CLONE_CHILD_SETTID | CLONE_CHILD_CLEARTID) as usize != 0;
    unsafe { fork(if wants_tid { child_tid } else { 0 }, stack, context) }
}

/// Fork with a fresh broker channel at fd 3 in the child.
///
/// The raw clone always uses [`FORK_CLONE_FLAGS`], the one process clone
/// the filter lets through. The kernel skips the tid writes when
/// `child_tid` is NULL. The child resumes on `stack` when one was given;
/// the clone itself runs on the current stack so both processes can
/// return from the handler.
unsafe fn fork(child_tid: usize, stack: usize, context: &mut TrapContext) -> isize {
    let channel = match channel::fork_channel() {
        Ok(fd) => fd,
        Err(_) => return neg(ENOMEM),
    };
    let ret = unsafe {
        sys::syscall5(
            __NR_clone,
            FORK_CLONE_FLAGS as usize,
            0,
            0,
            child_tid,
            0,
        )
    };
    if ret == 0 {
        if sys::dup2(channel, CONTROL_FD).is_err() {
            sys::fatal(format_args!("couldn't install forked broker channel"));
        }
        sys::close(channel);
        if stack != 0 {
            context.set_stack(stack);
        }
        return 0;
    }
    sys::close(channel);
    ret
}

/// `execve` through the preload image: the loader runs again in the new
/// image and loads `path` as its `argv[1]`.
unsafe fn execveat(
    dirfd: usize,
    path: *const u8,
    argv: *const *const u8,
    envp: *const *const u8,
    flags: u32,
) -> isize {
    if dirfd != AT_FDCWD as isize as usize || flags & !AT_EMPTY_PATH != 0 {
        return neg(ENOSYS);
    }
    let flat = match unsafe { flatten_user(path) } {
        Ok(flat) => flat,
        Err(err) => return err,
    };
    let Ok(probe) = Request::with_path(Op::Access, flat.as_bytes()) else {
        return neg(ENOENT);
    };
    match channel::call(&probe.with_flags([sys::X_OK, 0, 0])) {
        Ok(Some(stray)) => sys::close(stray),
        Ok(None) => {}
        Err(err) => return -(err as isize),
    }

    let cwd = *CWD.lock();
    let (argc, envc) = unsafe { (exec::count(argv), exec::count(envp)) };
    let text = flat.len() + 1 + b"PWD=".len() + cwd.len() + 1;
    let mut arena = match Arena::map(exec::arena_size(argc, envc, text)) {
        Ok(arena) => arena,
        Err(_) => return neg(ENOMEM),
    };

    let vectors = (|| {
        let program = arena.alloc_str(&[flat.as_bytes()])?;
        let new_argv = unsafe { exec::build_argv(&mut arena, program, argv) }?;
        let pwd = exec::pwd_entry(&mut arena, cwd.as_bytes())?;
        let new_envp = unsafe { exec::build_envp(&mut arena, envp, pwd) }?;
        Some((new_argv, new_envp))
    })();
    let Some((new_argv, new_envp)) = vectors else {
        arena.release();
        return neg(ENOMEM);
    };

    let image = match channel::emulator_image() {
        Ok(fd) => fd,
        Err(_) => {
            arena.release();
            return neg(ENOMEM);
        }
    };

    let gate = unsafe {
        sys::mmap(
            GATE_PAGE,
            sys::PAGE_SIZE,
            PROT_READ,
            MAP_PRIVATE | MAP_ANONYMOUS | MAP_FIXED,
            -1,
            0,
        )
    };
    let ret = match gate {
        Ok(_) => unsafe { sys::execveat(image, GATE_PATH, new_argv, new_envp, AT_EMPTY_PATH) },
        Err(err) => -(err as isize),
    };

    // only reached when the exec failed
    sys::close(image);
    arena.release();
    ret
}

unsafe fn uname(buf: *mut u8) -> isize {
    if buf.is_null() {
        return neg(EFAULT);
    }
    for (i, field) in UTSNAME.iter().enumerate() {
        let slot = unsafe { buf.add(i * UTS_FIELD) };
        unsafe {
            core::ptr::write_bytes(slot, 0, UTS_FIELD);
            core::ptr::copy_nonoverlapping(field.as_ptr(), slot, field.len());
        }
    }
    0
}

unsafe fn sysinfo(info: *mut Sysinfo) -> isize {
    if info.is_null() {
        return neg(EFAULT);
    }
    unsafe {
        core::ptr::write_bytes(info.cast::<u8>(), 0, size_of::<Sysinfo>());
        (*info).totalram = FAKE_RAM;
        (*info).freeram = FAKE_RAM;
        (*info).procs = 1;
        (*info).mem_unit = 1;
    }
    0
}

unsafe fn zero_fill(buf: *mut u8, len: usize) -> isize {
    if buf.is_null() {
        return neg(EFAULT);
    }
    unsafe { core::ptr::write_bytes(buf, 0, len) };
    0
}
