//! Single-threaded event loop serving the control channels of many sessions
//!
//! Every channel of every session is registered edge-triggered with one
//! `mio::Poll`; a readable channel is drained request by request until
//! the session reports it idle. Child exits arrive through the
//! [`ChildReaper`] self-pipe, and per-session deadlines are enforced by
//! bounding the poll timeout.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use sandbox_broker::{Event, Session};
use sandbox_core::{Result, SandboxError};

use crate::reaper::ChildReaper;

const REAPER: Token = Token(0);
const EVENT_CAPACITY: usize = 64;

/// Identifies one session within a [`Reactor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a session's root child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionExit {
    /// Exit status, or 128 + signal number when killed
    pub exit_code: i32,
    pub signal: Option<i32>,
    /// The session was killed because its deadline passed
    pub timed_out: bool,
}

impl SessionExit {
    fn from_status(status: WaitStatus, timed_out: bool) -> Self {
        match status {
            WaitStatus::Exited(_, code) => Self {
                exit_code: code,
                signal: None,
                timed_out,
            },
            WaitStatus::Signaled(_, signal, _) => Self {
                exit_code: 128 + signal as i32,
                signal: Some(signal as i32),
                timed_out,
            },
            _ => Self {
                exit_code: -1,
                signal: None,
                timed_out,
            },
        }
    }
}

struct Entry {
    session: Session,
    deadline: Option<Instant>,
    timed_out: bool,
    exit: Option<SessionExit>,
}

fn channel_token(fd: RawFd) -> Token {
    Token(fd as usize + 1)
}

fn token_fd(token: Token) -> RawFd {
    (token.0 - 1) as RawFd
}

fn register(registry: &Registry, fd: RawFd) -> io::Result<()> {
    registry.register(&mut SourceFd(&fd), channel_token(fd), Interest::READABLE)
}

fn deregister(registry: &Registry, owners: &mut HashMap<RawFd, SessionId>, fds: Vec<OwnedFd>) {
    for fd in fds {
        let raw = fd.as_raw_fd();
        owners.remove(&raw);
        if let Err(err) = registry.deregister(&mut SourceFd(&raw)) {
            debug!("deregister {}: {}", raw, err);
        }
    }
}

/// Serves sessions until their children exit
pub struct Reactor {
    poll: Poll,
    events: Events,
    reaper: ChildReaper,
    sessions: HashMap<SessionId, Entry>,
    /// Channel descriptor to owning session; descriptors are unique while open
    owners: HashMap<RawFd, SessionId>,
    next_id: u64,
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("sessions", &self.sessions.len())
            .field("channels", &self.owners.len())
            .finish()
    }
}

impl Reactor {
    pub fn new() -> Result<Self> {
        let poll = Poll::new()?;
        let reaper = ChildReaper::new()?;
        poll.registry()
            .register(&mut SourceFd(&reaper.as_raw_fd()), REAPER, Interest::READABLE)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            reaper,
            sessions: HashMap::new(),
            owners: HashMap::new(),
            next_id: 1,
        })
    }

    /// Start serving `session`, whose root child is `pid`.
    ///
    /// With a `timeout` the session is killed once it has run that long.
    pub fn add_session(
        &mut self,
        mut session: Session,
        pid: Pid,
        timeout: Option<Duration>,
    ) -> Result<SessionId> {
        let id = SessionId(self.next_id);
        self.next_id += 1;

        session.set_pid(pid);
        for fd in session.channel_fds() {
            if let Err(err) = register(self.poll.registry(), fd) {
                session.terminate();
                return Err(err.into());
            }
            self.owners.insert(fd, id);
        }
        self.reaper.watch(pid, id);
        self.sessions.insert(
            id,
            Entry {
                session,
                deadline: timeout.map(|t| Instant::now() + t),
                timed_out: false,
                exit: None,
            },
        );
        debug!("session {} serving pid {}", id, pid);
        Ok(id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Kill a session's process tree now. Its exit is still reported by
    /// [`Reactor::run_until_exit`].
    pub fn kill(&mut self, id: SessionId) -> Result<()> {
        let entry = self.sessions.get_mut(&id).ok_or(SandboxError::NotRunning)?;
        let fds = entry.session.terminate();
        deregister(self.poll.registry(), &mut self.owners, fds);
        Ok(())
    }

    /// Serve until session `id` has exited, then forget it.
    pub fn run_until_exit(&mut self, id: SessionId) -> Result<SessionExit> {
        loop {
            let entry = self.sessions.get(&id).ok_or(SandboxError::NotRunning)?;
            if let Some(exit) = entry.exit {
                self.sessions.remove(&id);
                return Ok(exit);
            }
            self.run_once(None)?;
        }
    }

    /// Wait for one batch of events, at most `max_wait` or until the
    /// nearest session deadline.
    pub fn run_once(&mut self, max_wait: Option<Duration>) -> Result<()> {
        let timeout = self.poll_timeout(max_wait);
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }

        let tokens: Vec<Token> = self.events.iter().map(|event| event.token()).collect();
        for token in tokens {
            if token == REAPER {
                self.reap();
            } else {
                self.serve_channel(token_fd(token));
            }
        }
        self.expire_deadlines();
        Ok(())
    }

    fn poll_timeout(&self, max_wait: Option<Duration>) -> Option<Duration> {
        let now = Instant::now();
        let nearest = self
            .sessions
            .values()
            .filter(|entry| entry.exit.is_none() && !entry.timed_out)
            .filter_map(|entry| entry.deadline)
            .min()
            .map(|deadline| deadline.saturating_duration_since(now));
        match (nearest, max_wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn serve_channel(&mut self, fd: RawFd) {
        let Some(&id) = self.owners.get(&fd) else {
            return;
        };
        let Some(entry) = self.sessions.get_mut(&id) else {
            return;
        };
        let registry = self.poll.registry();

        loop {
            match entry.session.on_readable(fd) {
                Event::Idle => break,
                Event::Handled => continue,
                Event::ChannelOpened(new_fd) => {
                    match register(registry, new_fd) {
                        Ok(()) => {
                            self.owners.insert(new_fd, id);
                        }
                        Err(err) => {
                            warn!("session {}: cannot watch forked channel: {}", id, err);
                            let fds = entry.session.terminate();
                            deregister(registry, &mut self.owners, fds);
                            break;
                        }
                    }
                    continue;
                }
                Event::ChannelClosed(closed) => {
                    deregister(registry, &mut self.owners, vec![closed]);
                    break;
                }
                Event::Terminated(fds) => {
                    debug!("session {} closed", id);
                    deregister(registry, &mut self.owners, fds);
                    break;
                }
            }
        }
    }

    fn reap(&mut self) {
        for reaped in self.reaper.reap() {
            let Some(entry) = self.sessions.get_mut(&reaped.session) else {
                continue;
            };
            entry.session.child_exited();
            let fds = entry.session.terminate();
            deregister(self.poll.registry(), &mut self.owners, fds);

            let exit = SessionExit::from_status(reaped.status, entry.timed_out);
            info!(
                "session {} (pid {}) exited: code {}{}",
                reaped.session,
                reaped.pid,
                exit.exit_code,
                if exit.timed_out { ", timed out" } else { "" }
            );
            entry.exit = Some(exit);
        }
    }

    fn expire_deadlines(&mut self) {
        let now = Instant::now();
        for (id, entry) in self.sessions.iter_mut() {
            let expired = entry.exit.is_none()
                && !entry.timed_out
                && entry.deadline.is_some_and(|deadline| deadline <= now);
            if expired {
                warn!("session {} exceeded its deadline; killing", id);
                entry.timed_out = true;
                let fds = entry.session.terminate();
                deregister(self.poll.registry(), &mut self.owners, fds);
            }
        }
    }
}
