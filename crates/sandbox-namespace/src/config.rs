//! Namespace management for sandbox isolation

use nix::sched::CloneFlags;
use nix::unistd::Pid;
use sandbox_core::{Result, SandboxError};
use std::os::unix::fs::MetadataExt;

/// Namespace types that can be isolated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceType {
    Pid,
    Ipc,
    Net,
    Mount,
    Uts,
    User,
    Cgroup,
}

impl NamespaceType {
    /// Name of the entry under `/proc/<pid>/ns/`
    pub fn proc_name(self) -> &'static str {
        match self {
            NamespaceType::Pid => "pid",
            NamespaceType::Ipc => "ipc",
            NamespaceType::Net => "net",
            NamespaceType::Mount => "mnt",
            NamespaceType::Uts => "uts",
            NamespaceType::User => "user",
            NamespaceType::Cgroup => "cgroup",
        }
    }
}

/// Configuration for namespace isolation
#[derive(Debug, Clone, PartialEq)]
pub struct NamespaceConfig {
    pub pid: bool,
    pub ipc: bool,
    pub net: bool,
    pub mount: bool,
    pub uts: bool,
    pub user: bool,
    pub cgroup: bool,
    /// Map the caller's uid/gid to root inside the user namespace
    pub map_user: bool,
}

impl Default for NamespaceConfig {
    /// Every namespace; the child must not share anything with the host
    fn default() -> Self {
        Self::all()
    }
}

impl NamespaceConfig {
    /// All namespaces enabled, ids left unmapped
    pub fn all() -> Self {
        Self {
            pid: true,
            ipc: true,
            net: true,
            mount: true,
            uts: true,
            user: true,
            cgroup: true,
            map_user: false,
        }
    }

    /// No namespaces; only for tests that exercise the launcher plumbing
    pub fn none() -> Self {
        Self {
            pid: false,
            ipc: false,
            net: false,
            mount: false,
            uts: false,
            user: false,
            cgroup: false,
            map_user: false,
        }
    }

    /// Convert to clone flags
    pub fn to_clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        if self.pid {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.ipc {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        if self.net {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.mount {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.uts {
            flags |= CloneFlags::CLONE_NEWUTS;
        }
        if self.user {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        if self.cgroup {
            flags |= CloneFlags::CLONE_NEWCGROUP;
        }
        flags
    }

    pub fn all_enabled(&self) -> bool {
        self.enabled_count() == 7
    }

    pub fn enabled_count(&self) -> usize {
        [
            self.pid,
            self.ipc,
            self.net,
            self.mount,
            self.uts,
            self.user,
            self.cgroup,
        ]
        .iter()
        .filter(|&&x| x)
        .count()
    }

    /// Reject combinations the kernel will refuse for an unprivileged caller.
    pub fn validate(&self, is_root: bool) -> Result<()> {
        if self.map_user && !self.user {
            return Err(SandboxError::Namespace(
                "map_user requires a user namespace".to_string(),
            ));
        }
        if !is_root && !self.user && self.enabled_count() > 0 {
            return Err(SandboxError::Namespace(
                "creating namespaces without root needs a user namespace".to_string(),
            ));
        }
        Ok(())
    }
}

/// Get namespace inode (for identification)
pub fn get_namespace_inode(ns_type: NamespaceType) -> Result<u64> {
    get_namespace_inode_for_pid(ns_type, None)
}

/// Get namespace inode for a specific process
pub fn get_namespace_inode_for_pid(ns_type: NamespaceType, pid: Option<Pid>) -> Result<u64> {
    let ns_type = ns_type.proc_name();
    let pid_str = match pid {
        Some(p) => p.as_raw().to_string(),
        None => "self".to_string(),
    };
    let path = format!("/proc/{}/ns/{}", pid_str, ns_type);
    let stat = std::fs::metadata(&path).map_err(|e| {
        SandboxError::Namespace(format!(
            "Failed to get namespace info for pid={} ns={}: {}",
            pid_str, ns_type, e
        ))
    })?;

    Ok(stat.ino())
}

/// Check if two processes share a namespace
pub fn shares_namespace(
    ns_type: NamespaceType,
    pid1: Option<Pid>,
    pid2: Option<Pid>,
) -> Result<bool> {
    let inode1 = get_namespace_inode_for_pid(ns_type, pid1)?;
    let inode2 = get_namespace_inode_for_pid(ns_type, pid2)?;
    Ok(inode1 == inode2)
}
