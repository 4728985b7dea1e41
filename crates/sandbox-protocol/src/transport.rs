//! `SOCK_SEQPACKET` transport with optional `SCM_RIGHTS` descriptor passing.

use std::io;
use std::mem::size_of;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use crate::message::{Op, Request, Response};

/// Create a connected `AF_UNIX SOCK_SEQPACKET` pair, both ends close-on-exec.
pub fn seqpacket_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    let ret = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

fn cmsg_space() -> usize {
    unsafe { libc::CMSG_SPACE(size_of::<RawFd>() as u32) as usize }
}

/// Send one datagram, attaching `fd` when given.
///
/// Returns an error unless the whole datagram was accepted.
pub fn send_with_fd(
    socket: BorrowedFd<'_>,
    bytes: &[u8],
    fd: Option<BorrowedFd<'_>>,
    flags: libc::c_int,
) -> io::Result<()> {
    let iov = libc::iovec {
        iov_base: bytes.as_ptr() as *mut libc::c_void,
        iov_len: bytes.len(),
    };

    let mut cmsg_buf = vec![0u8; cmsg_space()];
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &iov as *const _ as *mut _;
    msg.msg_iovlen = 1;

    if let Some(fd) = fd {
        msg.msg_control = cmsg_buf.as_mut_ptr().cast();
        msg.msg_controllen = cmsg_buf.len();

        let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        if cmsg.is_null() {
            return Err(io::Error::other("CMSG_FIRSTHDR null"));
        }
        let raw = fd.as_raw_fd();
        unsafe {
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(size_of::<RawFd>() as u32) as usize;
            std::ptr::copy_nonoverlapping(
                (&raw as *const RawFd).cast::<u8>(),
                libc::CMSG_DATA(cmsg),
                size_of::<RawFd>(),
            );
        }
    }

    let ret = unsafe { libc::sendmsg(socket.as_raw_fd(), &msg, flags) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    if ret as usize != bytes.len() {
        return Err(io::Error::new(io::ErrorKind::WriteZero, "short datagram"));
    }
    Ok(())
}

/// Receive one datagram into `buf`, collecting at most one passed descriptor.
///
/// Received descriptors are close-on-exec. A datagram larger than `buf` or
/// with truncated ancillary data is an error.
pub fn recv_with_fd(
    socket: BorrowedFd<'_>,
    buf: &mut [u8],
    flags: libc::c_int,
) -> io::Result<(usize, Option<OwnedFd>)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };

    let mut cmsg_buf = vec![0u8; cmsg_space()];
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = cmsg_buf.len();

    let ret = unsafe {
        libc::recvmsg(
            socket.as_raw_fd(),
            &mut msg,
            flags | libc::MSG_CMSG_CLOEXEC,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut received = None;
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    while !cmsg.is_null() {
        unsafe {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let mut raw: RawFd = -1;
                std::ptr::copy_nonoverlapping(
                    libc::CMSG_DATA(cmsg),
                    (&mut raw as *mut RawFd).cast::<u8>(),
                    size_of::<RawFd>(),
                );
                let owned = OwnedFd::from_raw_fd(raw);
                if received.is_some() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "more than one descriptor attached",
                    ));
                }
                received = Some(owned);
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    if msg.msg_flags & (libc::MSG_TRUNC | libc::MSG_CTRUNC) != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "datagram or control data truncated",
        ));
    }
    Ok((ret as usize, received))
}

/// Blocking request/response exchange, the way the child side talks.
///
/// Used by the launcher tests and by embedders that want to drive a broker
/// session from ordinary Rust code.
pub fn call(
    socket: BorrowedFd<'_>,
    req: &Request,
) -> io::Result<(Response, Option<OwnedFd>)> {
    let op = Op::try_from(req.op).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    send_with_fd(socket, req.as_bytes(), None, libc::MSG_EOR | libc::MSG_NOSIGNAL)?;
    let mut buf = [0u8; Response::SIZE];
    let (n, fd) = recv_with_fd(socket, &mut buf, 0)?;
    let rsp = Response::decode(&buf[..n], op)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok((rsp, fd))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    #[test]
    fn socketpair_creation() {
        let (a, b) = seqpacket_pair().unwrap();
        assert_ne!(a.as_raw_fd(), b.as_raw_fd());
        let flags = unsafe { libc::fcntl(a.as_raw_fd(), libc::F_GETFD) };
        assert_eq!(flags & libc::FD_CLOEXEC, libc::FD_CLOEXEC);
    }

    #[test]
    fn datagram_boundaries_are_kept() {
        let (a, b) = seqpacket_pair().unwrap();
        send_with_fd(a.as_fd(), b"one", None, 0).unwrap();
        send_with_fd(a.as_fd(), b"three", None, 0).unwrap();

        let mut buf = [0u8; 16];
        let (n, fd) = recv_with_fd(b.as_fd(), &mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"one");
        assert!(fd.is_none());
        let (n, _) = recv_with_fd(b.as_fd(), &mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"three");
    }

    #[test]
    fn descriptor_travels_with_payload() {
        let (a, b) = seqpacket_pair().unwrap();
        let (pipe_r, pipe_w) = pipe_pair();

        send_with_fd(a.as_fd(), b"fd", Some(pipe_r.as_fd()), 0).unwrap();
        let mut buf = [0u8; 4];
        let (n, fd) = recv_with_fd(b.as_fd(), &mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"fd");
        let fd = fd.expect("descriptor attached");

        let payload = b"x";
        assert_eq!(
            unsafe { libc::write(pipe_w.as_raw_fd(), payload.as_ptr().cast(), 1) },
            1
        );
        let mut got = [0u8; 1];
        assert_eq!(
            unsafe { libc::read(fd.as_raw_fd(), got.as_mut_ptr().cast(), 1) },
            1
        );
        assert_eq!(&got, payload);
    }

    #[test]
    fn oversized_datagram_is_an_error() {
        let (a, b) = seqpacket_pair().unwrap();
        send_with_fd(a.as_fd(), &[7u8; 32], None, 0).unwrap();
        let mut small = [0u8; 8];
        let err = recv_with_fd(b.as_fd(), &mut small, 0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn nonblocking_receive_reports_would_block() {
        let (_a, b) = seqpacket_pair().unwrap();
        let mut buf = [0u8; 8];
        let err = recv_with_fd(b.as_fd(), &mut buf, libc::MSG_DONTWAIT).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    fn pipe_pair() -> (OwnedFd, OwnedFd) {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) }, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }
}
