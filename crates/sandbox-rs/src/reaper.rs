//! SIGCHLD to reactor plumbing
//!
//! The signal handler only copies the dying child's pid into a self-pipe.
//! Each [`ChildReaper`] owns one such pipe plus the set of pids it launched,
//! and does the actual `waitpid` work on the reactor thread.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};

use log::debug;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{Pid, pipe2};
use sandbox_core::{Result, SandboxError};

use crate::reactor::SessionId;

/// Reapers that may exist at the same time
pub const MAX_REAPERS: usize = 8;

/// One self-pipe. Pipes are created on first use and never closed, so the
/// handler can never write into a descriptor number that was reused.
struct Slot {
    claimed: AtomicBool,
    read: AtomicI32,
    write: AtomicI32,
}

impl Slot {
    const fn new() -> Self {
        Self {
            claimed: AtomicBool::new(false),
            read: AtomicI32::new(-1),
            write: AtomicI32::new(-1),
        }
    }
}

static SLOTS: [Slot; MAX_REAPERS] = [const { Slot::new() }; MAX_REAPERS];
static HANDLER: OnceLock<std::result::Result<(), Errno>> = OnceLock::new();

extern "C" fn on_sigchld(_: libc::c_int, info: *mut libc::siginfo_t, _: *mut libc::c_void) {
    unsafe {
        let errno = libc::__errno_location();
        let saved = *errno;
        let pid = if info.is_null() { 0 } else { (*info).si_pid() };
        let bytes = pid.to_ne_bytes();
        for slot in &SLOTS {
            let fd = slot.write.load(Ordering::Acquire);
            if fd >= 0 {
                // a full pipe already guarantees a wakeup
                libc::write(fd, bytes.as_ptr().cast(), bytes.len());
            }
        }
        *errno = saved;
    }
}

fn install_handler() -> Result<()> {
    let result = HANDLER.get_or_init(|| {
        let action = SigAction::new(
            SigHandler::SigAction(on_sigchld),
            SaFlags::SA_SIGINFO | SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
            SigSet::empty(),
        );
        unsafe { sigaction(Signal::SIGCHLD, &action) }.map(|_| ())
    });
    result.map_err(|e| SandboxError::Syscall(format!("sigaction(SIGCHLD): {}", e)))
}

/// A child that finished, with the session that launched it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reaped {
    pub session: SessionId,
    pub pid: Pid,
    pub status: WaitStatus,
}

/// Waits for the children of one reactor
#[derive(Debug)]
pub struct ChildReaper {
    slot: usize,
    pids: Mutex<HashMap<Pid, SessionId>>,
}

impl ChildReaper {
    pub fn new() -> Result<Self> {
        install_handler()?;

        for (index, slot) in SLOTS.iter().enumerate() {
            if slot
                .claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            if slot.read.load(Ordering::Acquire) < 0 {
                match pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC) {
                    Ok((read, write)) => {
                        slot.read.store(read.into_raw_fd(), Ordering::Release);
                        slot.write.store(write.into_raw_fd(), Ordering::Release);
                    }
                    Err(e) => {
                        slot.claimed.store(false, Ordering::Release);
                        return Err(SandboxError::Syscall(format!("pipe2: {}", e)));
                    }
                }
            }
            let reaper = Self {
                slot: index,
                pids: Mutex::new(HashMap::new()),
            };
            reaper.drain();
            return Ok(reaper);
        }

        Err(SandboxError::ResourceExhausted(format!(
            "at most {} reactors may run at once",
            MAX_REAPERS
        )))
    }

    /// Track `pid` on behalf of `session`
    pub fn watch(&self, pid: Pid, session: SessionId) {
        self.pids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pid, session);
    }

    pub fn watched(&self) -> usize {
        self.pids.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn drain(&self) {
        let fd = self.as_raw_fd();
        let mut buf = [0u8; 256];
        while unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) } > 0 {}
    }

    /// Collect every watched child that has exited.
    ///
    /// Each pid is polled with `WNOHANG` rather than trusting the pids in
    /// the pipe, since signals coalesce.
    pub fn reap(&self) -> Vec<Reaped> {
        self.drain();

        let mut pids = self.pids.lock().unwrap_or_else(PoisonError::into_inner);
        let mut done = Vec::new();
        pids.retain(|&pid, &mut session| match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => true,
            Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                done.push(Reaped {
                    session,
                    pid,
                    status,
                });
                false
            }
            Ok(_) => true,
            Err(Errno::EINTR) => true,
            Err(e) => {
                debug!("waitpid({}): {}; dropping", pid, e);
                false
            }
        });
        done
    }
}

impl AsRawFd for ChildReaper {
    /// Read end of the self-pipe, readable after any SIGCHLD
    fn as_raw_fd(&self) -> RawFd {
        SLOTS[self.slot].read.load(Ordering::Acquire)
    }
}

impl Drop for ChildReaper {
    fn drop(&mut self) {
        self.drain();
        SLOTS[self.slot].claimed.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{ForkResult, fork};

    fn wait_readable(fd: RawFd) {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, 5000) };
        assert_eq!(ret, 1, "no SIGCHLD wakeup");
    }

    #[test]
    fn reaps_exit_status() {
        let reaper = ChildReaper::new().unwrap();
        let child = match unsafe { fork() }.unwrap() {
            ForkResult::Child => unsafe { libc::_exit(7) },
            ForkResult::Parent { child } => child,
        };
        reaper.watch(child, SessionId(1));

        let mut reaped = Vec::new();
        while reaped.is_empty() {
            wait_readable(reaper.as_raw_fd());
            reaped = reaper.reap();
        }
        assert_eq!(
            reaped,
            vec![Reaped {
                session: SessionId(1),
                pid: child,
                status: WaitStatus::Exited(child, 7),
            }]
        );
        assert_eq!(reaper.watched(), 0);
    }

    #[test]
    fn reaps_killed_child() {
        let reaper = ChildReaper::new().unwrap();
        let child = match unsafe { fork() }.unwrap() {
            ForkResult::Child => loop {
                unsafe { libc::pause() };
            },
            ForkResult::Parent { child } => child,
        };
        reaper.watch(child, SessionId(2));
        assert!(reaper.reap().is_empty());

        nix::sys::signal::kill(child, Signal::SIGKILL).unwrap();
        let mut reaped = Vec::new();
        while reaped.is_empty() {
            wait_readable(reaper.as_raw_fd());
            reaped = reaper.reap();
        }
        assert_eq!(
            reaped[0].status,
            WaitStatus::Signaled(child, Signal::SIGKILL, false)
        );
    }

    #[test]
    fn slots_are_reused() {
        let first = ChildReaper::new().unwrap();
        let fd = first.as_raw_fd();
        let slot = first.slot;
        drop(first);
        let again = ChildReaper::new().unwrap();
        if again.slot == slot {
            assert_eq!(again.as_raw_fd(), fd);
        }
    }
}
