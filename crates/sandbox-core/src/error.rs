//! Error types for sandbox operations

use std::io;
use thiserror::Error;

/// Result type for sandbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Errors that can occur on the trusted side of the sandbox.
///
/// Nothing in here ever crosses the control socket: the child only ever
/// sees numeric errno values.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Syscall error: {0}")]
    Syscall(String),

    #[error("Namespace error: {0}")]
    Namespace(String),

    #[error("Seccomp error: {0}")]
    Seccomp(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Policy error: {0}")]
    Policy(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Launch failed: {0}")]
    Launch(String),

    #[error("Sandbox not running")]
    NotRunning,

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Feature not available: {0}")]
    FeatureNotAvailable(String),
}

impl SandboxError {
    /// Wrap the current `errno` with the name of the failing call.
    pub fn last_os_error(call: &str) -> Self {
        SandboxError::Syscall(format!("{}: {}", call, io::Error::last_os_error()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SandboxError::NotRunning;
        assert_eq!(err.to_string(), "Sandbox not running");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let sandbox_err = SandboxError::from(io_err);
        assert!(sandbox_err.to_string().contains("IO error"));
    }

    #[test]
    fn test_result_error() {
        fn returns_error() -> Result<i32> {
            Err(SandboxError::NotRunning)
        }
        assert!(returns_error().is_err());
    }

    #[test]
    fn test_protocol_error_display() {
        let err = SandboxError::Protocol("unterminated path".to_string());
        assert_eq!(err.to_string(), "Protocol violation: unterminated path");
    }

    #[test]
    fn test_last_os_error_names_call() {
        let err = SandboxError::last_os_error("socketpair");
        assert!(err.to_string().starts_with("Syscall error: socketpair:"));
    }
}
