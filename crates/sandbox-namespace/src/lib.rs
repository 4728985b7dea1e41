//! sandbox-namespace: Linux namespace selection for the sandboxed child
//!
//! Provides the namespace set passed to `clone` and optional user namespace
//! UID/GID mapping written by the parent.

pub mod config;
pub mod user_ns;

pub use config::{NamespaceConfig, NamespaceType};
