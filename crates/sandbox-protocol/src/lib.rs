//! sandbox-protocol: control-socket messages between child and broker
//!
//! Every message is one fixed-size `#[repr(C)]` struct carried by exactly one
//! `SOCK_SEQPACKET` datagram. A response may carry a single descriptor as
//! `SCM_RIGHTS` ancillary data. The message types are `no_std` so the
//! freestanding preload can share them; the socket helpers need the `std`
//! feature.

#![cfg_attr(not(feature = "std"), no_std)]

pub mod message;
#[cfg(feature = "std")]
pub mod transport;

pub use message::{Op, ProtocolError, Request, Response, PATH_CAPACITY};

/// Descriptor slot of the control socket inside the child
pub const CONTROL_FD: i32 = 3;

/// Descriptor slot of the sealed preload image inside the child
pub const IMAGE_FD: i32 = 4;

/// Page mapped read-only just below the top of the user address space
pub const GATE_PAGE: usize = 0x7FFF_FFFF_E000;

/// Last byte of [`GATE_PAGE`]; used as the empty `execveat` pathname
pub const GATE_PATH: usize = GATE_PAGE + 0xFFF;

/// `clone` flags the emulator forks with:
/// `SIGCHLD | CLONE_CHILD_SETTID | CLONE_CHILD_CLEARTID | CLONE_PARENT_SETTID`.
///
/// The filter passes `clone` with exactly these flags and a NULL parent
/// tid pointer. The emulator refuses `CLONE_PARENT_SETTID` from the
/// program, so only its own forks carry them.
pub const FORK_CLONE_FLAGS: u64 = 17 | 0x0100_0000 | 0x0020_0000 | 0x0010_0000;

/// argv[0] the loader sees; the real program path follows it
pub const LOADER_ARGV0: &core::ffi::CStr = c"[sandbox]";

/// Working directory the child starts in when no `PWD` is supplied
pub const DEFAULT_CWD: &str = "/@CWD";
