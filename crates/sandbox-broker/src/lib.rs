//! sandbox-broker: the trusted side of the control socket
//!
//! A [`Filesystem`] holds the mount table: sandbox path prefixes mapped to
//! native host directories, in-memory tmp directories, or fixed errno
//! answers. A [`Broker`] turns decoded requests into replies against it,
//! and a [`Session`] drives the channels of one sandboxed process tree.

pub mod broker;
pub mod filesystem;
pub mod mount;
pub mod path;
pub mod policy;
pub mod session;
mod syslibs;

pub use broker::{Attachment, Broker, Reply};
pub use filesystem::{Filesystem, ViolationCallback};
pub use mount::{MountKind, MountMatch, MountTable};
pub use policy::{ErrnoSpec, Grant, Limits, Policy};
pub use session::{Event, Session};
