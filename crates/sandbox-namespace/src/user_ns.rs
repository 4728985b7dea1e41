//! User namespace UID/GID mapping support
//!
//! A child in a fresh user namespace runs as the overflow uid until the
//! parent writes `/proc/<pid>/uid_map` and `gid_map`. The sandbox works
//! without a mapping; it only makes ownership shown by `fstat` readable.

use log::debug;
use nix::unistd::Pid;
use sandbox_core::{Result, SandboxError};
use std::fs;

/// Map `uid`/`gid` outside the namespace to root inside it.
pub fn setup_user_namespace(child_pid: Pid, uid: u32, gid: u32) -> Result<()> {
    let pid = child_pid.as_raw();

    fs::write(format!("/proc/{}/uid_map", pid), format!("0 {} 1\n", uid)).map_err(|e| {
        SandboxError::Namespace(format!("Failed to write uid_map for pid {}: {}", pid, e))
    })?;

    // Required before an unprivileged writer may set gid_map
    fs::write(format!("/proc/{}/setgroups", pid), "deny\n").map_err(|e| {
        SandboxError::Namespace(format!("Failed to write setgroups for pid {}: {}", pid, e))
    })?;

    fs::write(format!("/proc/{}/gid_map", pid), format!("0 {} 1\n", gid)).map_err(|e| {
        SandboxError::Namespace(format!("Failed to write gid_map for pid {}: {}", pid, e))
    })?;

    debug!("mapped uid {} / gid {} to root in pid {}", uid, gid, pid);
    Ok(())
}
