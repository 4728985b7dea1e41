//! Request dispatch: one decoded request in, one response plus attachment out

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;

use log::debug;
use sandbox_protocol::transport::seqpacket_pair;
use sandbox_protocol::{Op, ProtocolError, Request, Response};

use crate::filesystem::Filesystem;

/// Descriptor sent alongside a response
#[derive(Debug)]
pub enum Attachment {
    None,
    /// Freshly opened; closed once sent
    Owned(OwnedFd),
    /// The emulator image; shared by every session and never closed here
    Shared(Arc<OwnedFd>),
    /// A new control channel: `child_end` is sent, `parent_end` is watched
    Channel {
        child_end: OwnedFd,
        parent_end: OwnedFd,
    },
}

impl Attachment {
    /// Descriptor to put in the `SCM_RIGHTS` message, if any
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        match self {
            Attachment::None => None,
            Attachment::Owned(fd) => Some(fd.as_fd()),
            Attachment::Shared(fd) => Some(fd.as_fd()),
            Attachment::Channel { child_end, .. } => Some(child_end.as_fd()),
        }
    }
}

/// A response ready to send
#[derive(Debug)]
pub struct Reply {
    pub response: Response,
    pub attachment: Attachment,
}

impl Reply {
    fn ok(op: Op) -> Self {
        Self {
            response: Response::ok(op as u32),
            attachment: Attachment::None,
        }
    }

    fn error(op: Op, errno: i32) -> Self {
        Self {
            response: Response::error(op as u32, errno),
            attachment: Attachment::None,
        }
    }

    fn with(op: Op, attachment: Attachment) -> Self {
        Self {
            response: Response::ok(op as u32),
            attachment,
        }
    }
}

/// Answers child requests against one [`Filesystem`]
#[derive(Debug, Clone)]
pub struct Broker {
    fs: Arc<Filesystem>,
    image: Option<Arc<OwnedFd>>,
}

impl Broker {
    /// `image` is the sealed emulator image handed out for `GetEmulatorImage`;
    /// without one that request fails with `ENOENT`.
    pub fn new(fs: Arc<Filesystem>, image: Option<Arc<OwnedFd>>) -> Self {
        Self { fs, image }
    }

    pub fn filesystem(&self) -> &Arc<Filesystem> {
        &self.fs
    }

    /// Answer one request.
    ///
    /// Only framing problems are errors; every policy outcome is a
    /// [`Reply`] carrying an errno.
    pub fn handle_request(&self, req: &Request) -> Result<Reply, ProtocolError> {
        let op = req.op()?;
        let reply = match op {
            Op::Ping => Reply::ok(op),
            Op::Open | Op::Unlink | Op::Access => {
                let path = req.path_bytes()?;
                let flags = req.flags[0] as i32;
                let mode = req.flags[1];
                match self.fs.child_file(op, path, flags, mode) {
                    Ok(Some(fd)) => Reply::with(op, Attachment::Owned(fd)),
                    Ok(None) => Reply::ok(op),
                    Err(errno) => {
                        debug!("{:?} {} -> errno {}", op, path.escape_ascii(), errno);
                        Reply::error(op, errno)
                    }
                }
            }
            Op::GetEmulatorImage => match &self.image {
                Some(image) => Reply::with(op, Attachment::Shared(Arc::clone(image))),
                None => Reply::error(op, libc::ENOENT),
            },
            Op::Fork => match seqpacket_pair() {
                Ok((parent_end, child_end)) => Reply::with(
                    op,
                    Attachment::Channel {
                        child_end,
                        parent_end,
                    },
                ),
                Err(err) => Reply::error(op, err.raw_os_error().unwrap_or(libc::ENOMEM)),
            },
            Op::ShMem => Reply::error(op, libc::ENOSYS),
        };
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker() -> Broker {
        Broker::new(Arc::new(Filesystem::new()), None)
    }

    #[test]
    fn ping_is_empty_success() {
        let reply = broker().handle_request(&Request::new(Op::Ping)).unwrap();
        assert_eq!(reply.response, Response::ok(Op::Ping as u32));
        assert!(reply.attachment.fd().is_none());
    }

    #[test]
    fn shmem_is_not_implemented() {
        let reply = broker().handle_request(&Request::new(Op::ShMem)).unwrap();
        assert_eq!(reply.response.err, libc::ENOSYS);
    }

    #[test]
    fn image_request_without_image() {
        let reply = broker()
            .handle_request(&Request::new(Op::GetEmulatorImage))
            .unwrap();
        assert_eq!(reply.response.err, libc::ENOENT);
    }

    #[test]
    fn image_is_shared_not_moved() {
        let image = Arc::new(OwnedFd::from(tempfile::tempfile().unwrap()));
        let broker = Broker::new(Arc::new(Filesystem::new()), Some(Arc::clone(&image)));
        for _ in 0..2 {
            let reply = broker
                .handle_request(&Request::new(Op::GetEmulatorImage))
                .unwrap();
            assert!(reply.response.is_ok());
            assert!(matches!(reply.attachment, Attachment::Shared(_)));
        }
        assert_eq!(Arc::strong_count(&image), 2);
    }

    #[test]
    fn fork_creates_channel() {
        let reply = broker().handle_request(&Request::new(Op::Fork)).unwrap();
        assert!(reply.response.is_ok());
        assert!(matches!(reply.attachment, Attachment::Channel { .. }));
    }

    #[test]
    fn denied_open_carries_errno() {
        let req = Request::with_path(Op::Open, b"/etc/shadow").unwrap();
        let reply = broker().handle_request(&req).unwrap();
        assert_eq!(reply.response.op, Op::Open as u32);
        assert_eq!(reply.response.err, libc::EACCES);
    }

    #[test]
    fn unknown_op_is_a_protocol_error() {
        let mut req = Request::new(Op::Ping);
        req.op = 0;
        assert_eq!(
            broker().handle_request(&req).unwrap_err(),
            ProtocolError::UnknownOp(0)
        );
    }
}
