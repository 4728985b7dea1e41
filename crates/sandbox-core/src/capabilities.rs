//! Runtime detection of available system capabilities
//!
//! Probes the running kernel and system configuration to determine whether a
//! brokered sandbox can be launched at all on this host.

use std::path::Path;

/// Empty directory the child is re-rooted into
pub const EMPTY_ROOT: &str = "/proc/sys/debug";

/// Detected system capabilities for sandboxing
#[derive(Debug, Clone)]
pub struct SystemCapabilities {
    /// Running as root (euid == 0)
    pub has_root: bool,
    /// Unprivileged user namespaces are available
    pub has_user_namespaces: bool,
    /// Seccomp BPF filtering is available
    pub has_seccomp: bool,
    /// memfd_create works and supports sealing
    pub has_memfd: bool,
    /// The empty re-root directory exists
    pub has_empty_root: bool,
    /// Host is x86_64, the only supported architecture
    pub is_x86_64: bool,
}

impl SystemCapabilities {
    /// Detect all available capabilities on the current system
    pub fn detect() -> Self {
        Self {
            has_root: detect_root(),
            has_user_namespaces: detect_user_namespaces(),
            has_seccomp: detect_seccomp(),
            has_memfd: detect_memfd(),
            has_empty_root: Path::new(EMPTY_ROOT).is_dir(),
            is_x86_64: cfg!(target_arch = "x86_64"),
        }
    }

    /// Everything the launcher relies on is present
    pub fn can_launch(&self) -> bool {
        self.is_x86_64
            && self.has_seccomp
            && self.has_memfd
            && self.has_empty_root
            && (self.has_user_namespaces || self.has_root)
    }

    /// Get a human-readable summary of capabilities
    pub fn summary(&self) -> String {
        let check = |available: bool| if available { "[ok]" } else { "[--]" };

        [
            format!("{} Root privileges", check(self.has_root)),
            format!("{} User namespaces", check(self.has_user_namespaces)),
            format!("{} Seccomp BPF", check(self.has_seccomp)),
            format!("{} Sealed memfd", check(self.has_memfd)),
            format!("{} Empty root {}", check(self.has_empty_root), EMPTY_ROOT),
            format!("{} x86_64", check(self.is_x86_64)),
        ]
        .join("\n")
    }
}

fn detect_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

fn detect_user_namespaces() -> bool {
    if let Ok(content) = std::fs::read_to_string("/proc/sys/kernel/unprivileged_userns_clone")
        && content.trim() == "0"
    {
        return false;
    }

    if let Ok(content) = std::fs::read_to_string("/proc/sys/user/max_user_namespaces")
        && let Ok(max) = content.trim().parse::<u64>()
    {
        return max > 0;
    }

    // If we can't read the files, assume available on modern kernels
    true
}

fn detect_seccomp() -> bool {
    // 0 when available but inactive, -1/EINVAL when not built in
    let ret = unsafe { libc::prctl(libc::PR_GET_SECCOMP, 0, 0, 0, 0) };
    ret >= 0
}

fn detect_memfd() -> bool {
    let fd = unsafe {
        libc::memfd_create(
            c"sandbox-probe".as_ptr(),
            libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING,
        )
    };
    if fd < 0 {
        return false;
    }
    let sealed = unsafe { libc::fcntl(fd, libc::F_ADD_SEALS, libc::F_SEAL_SEAL) } == 0;
    unsafe { libc::close(fd) };
    sealed
}
