//! sandbox-core: shared types, errors, and capability detection
//!
//! This crate provides the foundational types used by all sandbox sub-crates:
//! - Error types and Result alias
//! - Utility functions (size parsing, UID/GID queries, errno names)
//! - Runtime capability detection (user namespaces, seccomp, preload image)

pub mod capabilities;
pub mod error;
pub mod util;

pub use capabilities::SystemCapabilities;
pub use error::{Result, SandboxError};
