//! Test support: a scripted broker on the control slot

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use sandbox_protocol::{CONTROL_FD, Request, Response};

static FD_SLOTS: Mutex<()> = Mutex::new(());

/// Serialise tests that create descriptors or depend on which slot the
/// kernel hands out next.
pub fn lock_fd_slots() -> MutexGuard<'static, ()> {
    FD_SLOTS.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Move `fd` to a slot at or above 10 so it cannot collide with fixed slots
fn lift(fd: RawFd) -> OwnedFd {
    let high = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 10) };
    assert!(high >= 10, "F_DUPFD_CLOEXEC failed");
    unsafe { libc::close(fd) };
    unsafe { OwnedFd::from_raw_fd(high) }
}

/// Lowest descriptor number the kernel would allocate now
pub fn lowest_free_fd() -> RawFd {
    let fd = unsafe { libc::fcntl(2, libc::F_DUPFD, 0) };
    assert!(fd >= 0);
    unsafe { libc::close(fd) };
    fd
}

pub fn is_open(fd: RawFd) -> bool {
    unsafe { libc::fcntl(fd, libc::F_GETFD) >= 0 }
}

/// One end of a seqpacket pair installed at [`CONTROL_FD`]; the other end
/// answers requests with scripted replies. Whatever held the slot before
/// is put back on drop.
pub struct ScriptedBroker {
    peer: OwnedFd,
    saved: Option<OwnedFd>,
    _slots: MutexGuard<'static, ()>,
}

impl ScriptedBroker {
    pub fn install() -> Self {
        let slots = lock_fd_slots();
        let saved = is_open(CONTROL_FD).then(|| {
            let fd = unsafe { libc::fcntl(CONTROL_FD, libc::F_DUPFD_CLOEXEC, 10) };
            assert!(fd >= 10);
            unsafe { OwnedFd::from_raw_fd(fd) }
        });

        let mut pair = [0; 2];
        let ret = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
                0,
                pair.as_mut_ptr(),
            )
        };
        assert_eq!(ret, 0, "socketpair failed");
        let peer = lift(pair[0]);
        let child = lift(pair[1]);
        assert_eq!(unsafe { libc::dup2(child.as_raw_fd(), CONTROL_FD) }, CONTROL_FD);

        Self {
            peer,
            saved,
            _slots: slots,
        }
    }

    /// Answer the next request with `reply`, passing a copy of `attach`
    /// along with it. The handle yields the request that was answered.
    pub fn answer(&self, reply: Response, attach: Option<RawFd>) -> JoinHandle<Request> {
        let peer = self.peer.as_raw_fd();
        thread::spawn(move || {
            let mut buf = [0u8; Request::SIZE];
            let n = unsafe { libc::recv(peer, buf.as_mut_ptr().cast(), buf.len(), 0) };
            assert!(n > 0, "no request arrived");
            let req = Request::decode(&buf[..n as usize]).unwrap();
            send_reply(peer, &reply, attach);
            req
        })
    }
}

impl Drop for ScriptedBroker {
    fn drop(&mut self) {
        match &self.saved {
            Some(saved) => unsafe {
                libc::dup2(saved.as_raw_fd(), CONTROL_FD);
            },
            None => unsafe {
                libc::close(CONTROL_FD);
            },
        }
    }
}

fn send_reply(peer: RawFd, reply: &Response, attach: Option<RawFd>) {
    let bytes = reply.as_bytes();
    let mut iov = libc::iovec {
        iov_base: bytes.as_ptr() as *mut libc::c_void,
        iov_len: bytes.len(),
    };
    let mut control = [0u64; 3];
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    if let Some(fd) = attach {
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = size_of_val(&control);
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(size_of::<i32>() as u32) as usize;
            libc::CMSG_DATA(cmsg).cast::<i32>().write_unaligned(fd);
        }
    }
    let sent = unsafe { libc::sendmsg(peer, &msg, libc::MSG_EOR) };
    assert_eq!(sent, bytes.len() as isize, "reply not sent");
}

/// A host file holding `contents`, opened read-only
pub fn scratch_file(name: &str, contents: &[u8]) -> std::fs::File {
    let path = std::env::temp_dir().join(format!("preload-{}-{}", name, std::process::id()));
    std::fs::write(&path, contents).unwrap();
    let file = std::fs::File::open(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    file
}
