//! The child side of the control socket

use sandbox_protocol::{CONTROL_FD, Op, Request, Response};

use crate::sync::SpinLock;
use crate::sys::{self, CmsgHdr, Errno, IoVec, MsgHdr};

// One request in flight per process; threads queue here.
static CHANNEL: SpinLock<()> = SpinLock::new(());

/// Send one request on fd 3 and wait for the answer.
///
/// `Ok(Some(fd))` when the reply carried a descriptor, `Ok(None)` for a
/// bare success, `Err(errno)` for a refusal. A broken channel ends the
/// process: nothing can be emulated without it.
pub fn call(req: &Request) -> Result<Option<i32>, Errno> {
    let Ok(op) = req.op() else {
        return Err(linux_raw_sys::errno::EINVAL as Errno);
    };

    let _guard = CHANNEL.lock();

    if sys::send(CONTROL_FD, req.as_bytes(), sys::MSG_EOR | sys::MSG_NOSIGNAL).is_err() {
        sys::fatal(format_args!("broker channel closed"));
    }

    let mut buf = [0u8; Response::SIZE];
    let mut iov = IoVec {
        base: buf.as_mut_ptr(),
        len: buf.len(),
    };
    // cmsghdr plus one int, padded to 8 bytes
    let mut control = [0u64; 3];
    let mut msg = MsgHdr {
        name: core::ptr::null_mut(),
        namelen: 0,
        iov: &mut iov,
        iovlen: 1,
        control: control.as_mut_ptr().cast(),
        controllen: size_of_val(&control),
        flags: 0,
    };

    let received = unsafe { sys::recvmsg(CONTROL_FD, &mut msg, sys::MSG_CMSG_CLOEXEC) };
    let fd = unsafe { attached_fd(&msg) };
    let rsp = match received {
        Ok(len) => Response::decode(&buf[..len], op),
        Err(_) => sys::fatal(format_args!("broker channel closed")),
    };
    let Ok(rsp) = rsp else {
        sys::fatal(format_args!("broker sent a malformed reply"));
    };

    match fd {
        Some(fd) => Ok(Some(fd)),
        None if rsp.is_ok() => Ok(None),
        None => Err(rsp.err),
    }
}

/// Descriptor carried in an `SCM_RIGHTS` control message, if any
unsafe fn attached_fd(msg: &MsgHdr) -> Option<i32> {
    if msg.controllen < size_of::<CmsgHdr>() + size_of::<i32>() {
        return None;
    }
    let cmsg = msg.control.cast::<CmsgHdr>();
    let header = unsafe { &*cmsg };
    if header.level != sys::SOL_SOCKET || header.kind != sys::SCM_RIGHTS {
        return None;
    }
    let data = unsafe { msg.control.add(size_of::<CmsgHdr>()).cast::<i32>() };
    Some(unsafe { data.read_unaligned() })
}

/// Ask the broker for a fresh control channel before forking.
pub fn fork_channel() -> Result<i32, Errno> {
    match call(&Request::new(Op::Fork)) {
        Ok(Some(fd)) => Ok(fd),
        Ok(None) => Err(linux_raw_sys::errno::EIO as Errno),
        Err(err) => Err(err),
    }
}

/// Ask the broker for the preload image to `execveat` through.
pub fn emulator_image() -> Result<i32, Errno> {
    match call(&Request::new(Op::GetEmulatorImage)) {
        Ok(Some(fd)) => Ok(fd),
        Ok(None) => Err(linux_raw_sys::errno::EIO as Errno),
        Err(err) => Err(err),
    }
}
