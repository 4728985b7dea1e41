//! sandbox-rs: run untrusted Linux programs behind a filesystem broker
//!
//! The child starts in fresh namespaces, re-rooted into an empty
//! directory, under a seccomp filter that traps every path-taking syscall.
//! A preloaded emulator turns those traps into requests over a control
//! socket, and the broker in this process answers them from a mount table
//! of explicit grants. Everything not granted is denied.
//!
//! # Example
//!
//! ```ignore
//! use sandbox_rs::SandboxBuilder;
//! use std::time::Duration;
//!
//! let mut sandbox = SandboxBuilder::new("my-sandbox")
//!     .memory_limit_str("256M")?
//!     .grant_native("/srv/data/", 0)
//!     .grant_tmp("/tmp/", 10)
//!     .timeout(Duration::from_secs(30))
//!     .build()?;
//!
//! let result = sandbox.run("/bin/cat", &["/srv/data/input.txt"])?;
//! println!("exit code {} ({} violations)", result.exit_code, result.violations);
//! ```

mod child;
pub mod controller;
pub mod image;
pub mod launcher;
pub mod reactor;
pub mod reaper;
pub mod rlimit;
pub mod stream;

// Re-export sub-crate types for convenience
pub use sandbox_broker::{Broker, Filesystem, Grant, Policy, Session};
pub use sandbox_core::{self as core, Result, SandboxError, capabilities::SystemCapabilities, util};
pub use sandbox_namespace::{NamespaceConfig, NamespaceType};
pub use sandbox_seccomp::{SeccompBpf, TrapFilter};

pub use controller::{Sandbox, SandboxBuilder, SandboxConfig, SandboxResult};
pub use image::EmulatorImage;
pub use launcher::{Launched, Launcher};
pub use reactor::{Reactor, SessionExit, SessionId};
pub use rlimit::RlimitConfig;
pub use stream::{ProcessStream, StreamChunk};
