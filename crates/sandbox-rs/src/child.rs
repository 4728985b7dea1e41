//! The window between `clone` and `execveat`
//!
//! Everything the child needs is prepared by the parent in a [`ChildPlan`]
//! before cloning. [`ChildPlan::run`] executes in the new process, which
//! shares nothing with the parent's other threads: any lock they held
//! (the allocator's included) stays held forever. Code reachable from
//! `run` therefore must not allocate, lock, or format; it uses raw libc
//! calls on pre-built buffers and reports failure only through `_exit(1)`.

use std::ffi::{CString, c_char};
use std::os::fd::RawFd;

use sandbox_core::capabilities::EMPTY_ROOT;
use sandbox_core::{Result, SandboxError};
use sandbox_protocol::{CONTROL_FD, GATE_PAGE, GATE_PATH, IMAGE_FD, Op, Request, Response};
use sandbox_seccomp::{BpfProgram, SeccompBpf};

use crate::rlimit::RlimitConfig;

const PAGE_SIZE: usize = 0x1000;

/// Parked descriptors are moved above this before being placed at 0..=4
const PARK_BASE: RawFd = 100;

/// Step of the child sequence that failed, printed before `_exit`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Sync,
    Descriptors,
    Rlimits,
    DeathSignal,
    Handshake,
    Chroot,
    Seccomp,
    GatePage,
    Exec,
}

impl Stage {
    fn message(self) -> &'static [u8] {
        match self {
            Stage::Sync => b"sandbox: launch failed: namespace sync\n",
            Stage::Descriptors => b"sandbox: launch failed: descriptor setup\n",
            Stage::Rlimits => b"sandbox: launch failed: setrlimit\n",
            Stage::DeathSignal => b"sandbox: launch failed: PR_SET_PDEATHSIG\n",
            Stage::Handshake => b"sandbox: launch failed: broker handshake\n",
            Stage::Chroot => b"sandbox: launch failed: chroot\n",
            Stage::Seccomp => b"sandbox: launch failed: seccomp\n",
            Stage::GatePage => b"sandbox: launch failed: gate page\n",
            Stage::Exec => b"sandbox: launch failed: execveat\n",
        }
    }
}

/// Everything the cloned child does, fixed before `clone`.
pub(crate) struct ChildPlan<'a> {
    /// stdin, stdout, stderr, control socket, emulator image, in that order
    sources: [RawFd; 5],
    sync: Option<RawFd>,
    rlimits: RlimitConfig,
    filter: &'a BpfProgram,
    ping: Request,
    root: CString,
    // owners of the pointer arrays below; moving a Vec keeps its buffer
    _argv: Vec<CString>,
    _envp: Vec<CString>,
    argv_ptrs: Vec<*const c_char>,
    envp_ptrs: Vec<*const c_char>,
}

impl<'a> ChildPlan<'a> {
    pub(crate) fn new(
        sources: [RawFd; 5],
        sync: Option<RawFd>,
        rlimits: RlimitConfig,
        filter: &'a BpfProgram,
        argv: &[String],
        envp: &[String],
    ) -> Result<Self> {
        let argv = to_cstrings(argv)?;
        let envp = to_cstrings(envp)?;
        let argv_ptrs = null_terminated(&argv);
        let envp_ptrs = null_terminated(&envp);
        Ok(Self {
            sources,
            sync,
            rlimits,
            filter,
            ping: Request::new(Op::Ping),
            root: CString::new(format!("{}/", EMPTY_ROOT))
                .map_err(|e| SandboxError::InvalidConfig(e.to_string()))?,
            _argv: argv,
            _envp: envp,
            argv_ptrs,
            envp_ptrs,
        })
    }

    /// Body of the cloned child. Only returns through `_exit`.
    pub(crate) fn run(&self) -> isize {
        let stage = match self.exec() {
            Err(stage) => stage,
            Ok(()) => Stage::Exec,
        };
        let msg = stage.message();
        unsafe {
            libc::write(2, msg.as_ptr().cast(), msg.len());
            libc::_exit(1)
        }
    }

    fn exec(&self) -> std::result::Result<(), Stage> {
        if let Some(sync) = self.sync {
            wait_for_parent(sync).map_err(|_| Stage::Sync)?;
        }
        self.install_descriptors().map_err(|_| Stage::Descriptors)?;
        self.rlimits.apply_raw().map_err(|_| Stage::Rlimits)?;

        if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong) } != 0 {
            return Err(Stage::DeathSignal);
        }
        self.handshake().map_err(|_| Stage::Handshake)?;

        if unsafe { libc::chroot(self.root.as_ptr()) } != 0
            || unsafe { libc::chdir(c"/".as_ptr()) } != 0
        {
            return Err(Stage::Chroot);
        }

        SeccompBpf::install(self.filter).map_err(|_| Stage::Seccomp)?;
        map_gate_page().map_err(|_| Stage::GatePage)?;

        unsafe {
            libc::syscall(
                libc::SYS_execveat,
                IMAGE_FD,
                GATE_PATH as *const c_char,
                self.argv_ptrs.as_ptr(),
                self.envp_ptrs.as_ptr(),
                libc::AT_EMPTY_PATH,
            );
        }
        Err(Stage::Exec)
    }

    /// Put the five inherited descriptors at 0..=4 and close the rest.
    ///
    /// Sources may already sit inside 0..=4, so each is parked above
    /// [`PARK_BASE`] first; `dup2` then clears the parked copy's
    /// close-on-exec flag in the target slot.
    fn install_descriptors(&self) -> std::result::Result<(), ()> {
        let mut parked = [-1; 5];
        for (slot, &source) in parked.iter_mut().zip(&self.sources) {
            let fd = unsafe { libc::fcntl(source, libc::F_DUPFD_CLOEXEC, PARK_BASE) };
            if fd < 0 {
                return Err(());
            }
            *slot = fd;
        }
        for (target, &fd) in parked.iter().enumerate() {
            if unsafe { libc::dup2(fd, target as RawFd) } < 0 {
                return Err(());
            }
        }
        debug_assert_eq!(CONTROL_FD, 3);
        debug_assert_eq!(IMAGE_FD, 4);
        close_from(5);
        Ok(())
    }

    /// Ping the broker and insist on an answer before going further.
    fn handshake(&self) -> std::result::Result<(), ()> {
        let req = self.ping.as_bytes();
        let sent = unsafe {
            libc::send(
                CONTROL_FD,
                req.as_ptr().cast(),
                req.len(),
                libc::MSG_EOR | libc::MSG_NOSIGNAL,
            )
        };
        if sent != req.len() as isize {
            return Err(());
        }

        let mut buf = [0u8; Response::SIZE];
        let got = unsafe { libc::recv(CONTROL_FD, buf.as_mut_ptr().cast(), buf.len(), 0) };
        if got != Response::SIZE as isize {
            return Err(());
        }
        match Response::decode(&buf, Op::Ping) {
            Ok(rsp) if rsp.is_ok() => Ok(()),
            _ => Err(()),
        }
    }
}

/// Block until the parent has written the user namespace maps.
fn wait_for_parent(sync: RawFd) -> std::result::Result<(), ()> {
    let mut byte = [0u8; 1];
    loop {
        let n = unsafe { libc::read(sync, byte.as_mut_ptr().cast(), 1) };
        if n == 1 {
            return Ok(());
        }
        if n < 0 && unsafe { *libc::__errno_location() } == libc::EINTR {
            continue;
        }
        return Err(());
    }
}

fn close_from(first: RawFd) {
    let ret = unsafe { libc::syscall(libc::SYS_close_range, first as u32, u32::MAX, 0u32) };
    if ret == 0 {
        return;
    }
    let max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let max = if max > 0 { max as RawFd } else { 1024 };
    for fd in first..max {
        unsafe { libc::close(fd) };
    }
}

/// Map the zero page whose last byte is the `execveat` pathname.
///
/// The page above it must be outside the user address space, so the
/// filter's pointer comparison names the only byte string at that address.
fn map_gate_page() -> std::result::Result<(), ()> {
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED;
    let above = unsafe {
        libc::mmap(
            (GATE_PAGE + PAGE_SIZE) as *mut libc::c_void,
            PAGE_SIZE,
            libc::PROT_READ,
            flags,
            -1,
            0,
        )
    };
    if above != libc::MAP_FAILED {
        return Err(());
    }

    let gate = unsafe {
        libc::mmap(
            GATE_PAGE as *mut libc::c_void,
            PAGE_SIZE,
            libc::PROT_READ,
            flags,
            -1,
            0,
        )
    };
    if gate as usize != GATE_PAGE {
        return Err(());
    }
    Ok(())
}

fn to_cstrings(items: &[String]) -> Result<Vec<CString>> {
    items
        .iter()
        .map(|item| {
            CString::new(item.as_bytes()).map_err(|_| {
                SandboxError::InvalidConfig(format!("argument contains a NUL byte: {:?}", item))
            })
        })
        .collect()
}

fn null_terminated(items: &[CString]) -> Vec<*const c_char> {
    items
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}
