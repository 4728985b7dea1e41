//! One sandboxed process tree and its control channels

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use log::{debug, warn};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use sandbox_core::SandboxError;
use sandbox_protocol::transport::{recv_with_fd, send_with_fd};
use sandbox_protocol::{ProtocolError, Request};

use crate::broker::{Attachment, Broker};

/// What happened on a readable channel
#[derive(Debug)]
pub enum Event {
    /// Nothing left to read
    Idle,
    /// One request answered
    Handled,
    /// A `Fork` request produced a new channel the caller should watch
    ChannelOpened(RawFd),
    /// The peer closed this channel; other channels remain
    ChannelClosed(OwnedFd),
    /// The session ended; the listed channels must be deregistered
    Terminated(Vec<OwnedFd>),
}

/// Broker state for one sandboxed process tree.
///
/// Every descendant of the root child talks over its own channel; they all
/// share one [`Broker`] and therefore one mount policy.
#[derive(Debug)]
pub struct Session {
    pid: Option<Pid>,
    channels: HashMap<RawFd, OwnedFd>,
    broker: Arc<Broker>,
    terminated: bool,
    fault: Option<SandboxError>,
}

impl Session {
    /// Session over the broker side of the root child's control socket
    pub fn new(broker: Arc<Broker>, control: OwnedFd) -> Self {
        let mut channels = HashMap::new();
        channels.insert(control.as_raw_fd(), control);
        Self {
            pid: None,
            channels,
            broker,
            terminated: false,
            fault: None,
        }
    }

    /// Record the root child; termination kills it
    pub fn set_pid(&mut self, pid: Pid) {
        self.pid = Some(pid);
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// Forget the root child once it has been reaped, so a recycled pid is
    /// never signalled
    pub fn child_exited(&mut self) {
        self.pid = None;
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Raw descriptors of the open channels, for poll registration
    pub fn channel_fds(&self) -> Vec<RawFd> {
        self.channels.keys().copied().collect()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Handle at most one datagram from channel `fd`.
    ///
    /// Call repeatedly until [`Event::Idle`] when driven by an
    /// edge-triggered poller.
    pub fn on_readable(&mut self, fd: RawFd) -> Event {
        let Some(channel) = self.channels.get(&fd) else {
            return Event::Idle;
        };

        let mut buf = [0u8; Request::SIZE + 1];
        let received = recv_with_fd(channel.as_fd(), &mut buf, libc::MSG_DONTWAIT);
        let (len, stray) = match received {
            Ok(ok) => ok,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Event::Idle,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Event::Handled,
            Err(err) => {
                warn!("control channel {}: {}", fd, err);
                return Event::Terminated(self.terminate());
            }
        };

        if len == 0 {
            let Some(closed) = self.channels.remove(&fd) else {
                return Event::Idle;
            };
            if self.channels.is_empty() {
                debug!("last control channel closed");
                let mut rest = self.terminate();
                rest.push(closed);
                return Event::Terminated(rest);
            }
            return Event::ChannelClosed(closed);
        }

        if stray.is_some() {
            warn!("child attached a descriptor to a request");
            return Event::Terminated(self.terminate());
        }

        let reply = match Request::decode(&buf[..len]).and_then(|req| self.broker.handle_request(&req)) {
            Ok(reply) => reply,
            Err(err) => {
                self.protocol_violation(err);
                return Event::Terminated(self.terminate());
            }
        };

        let flags = libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL | libc::MSG_EOR;
        let channel = match self.channels.get(&fd) {
            Some(channel) => channel,
            None => return Event::Idle,
        };
        if let Err(err) = send_with_fd(
            channel.as_fd(),
            reply.response.as_bytes(),
            reply.attachment.fd(),
            flags,
        ) {
            warn!("control channel {}: send failed: {}", fd, err);
            return Event::Terminated(self.terminate());
        }

        match reply.attachment {
            Attachment::Channel { parent_end, .. } => {
                let raw = parent_end.as_raw_fd();
                self.channels.insert(raw, parent_end);
                Event::ChannelOpened(raw)
            }
            _ => Event::Handled,
        }
    }

    fn protocol_violation(&mut self, err: ProtocolError) {
        let err = SandboxError::Protocol(err.to_string());
        match self.pid {
            Some(pid) => warn!("sandbox {}: {}", pid, err),
            None => warn!("sandbox: {}", err),
        }
        self.fault = Some(err);
    }

    /// The protocol violation that ended the session, if one did
    pub fn fault(&self) -> Option<&SandboxError> {
        self.fault.as_ref()
    }

    /// Kill the process tree root and hand back every channel.
    ///
    /// The root runs in its own pid namespace, so killing it takes all
    /// descendants with it.
    pub fn terminate(&mut self) -> Vec<OwnedFd> {
        if !self.terminated {
            self.terminated = true;
            if let Some(pid) = self.pid {
                let _ = kill(pid, Signal::SIGKILL);
            }
        }
        self.channels.drain().map(|(_, fd)| fd).collect()
    }
}
