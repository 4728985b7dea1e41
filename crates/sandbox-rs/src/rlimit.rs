//! setrlimit-based resource limits applied in the child before the filter
//!
//! The address-space limit is the only one that bounds `mmap`; the process
//! limit is loose because the child's user namespace is charged for more
//! than its own tasks.

use sandbox_core::{Result, SandboxError};

/// Default address-space ceiling, 1 GiB
pub const DEFAULT_ADDRESS_SPACE: u64 = 1024 * 1024 * 1024;
/// Default process ceiling
pub const DEFAULT_PROCESSES: u64 = 500;
/// Default file-size ceiling, 8 MiB
pub const DEFAULT_FILE_SIZE: u64 = 8 * 1024 * 1024;

/// Resource limits via setrlimit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RlimitConfig {
    /// Maximum address space size in bytes (RLIMIT_AS)
    pub max_memory: Option<u64>,
    /// Maximum CPU time in seconds (RLIMIT_CPU)
    pub max_cpu_seconds: Option<u64>,
    /// Maximum number of processes (RLIMIT_NPROC)
    pub max_processes: Option<u64>,
    /// Maximum file size in bytes (RLIMIT_FSIZE)
    pub max_file_size: Option<u64>,
    /// Maximum number of open files (RLIMIT_NOFILE)
    pub max_open_files: Option<u64>,
}

impl Default for RlimitConfig {
    fn default() -> Self {
        Self {
            max_memory: Some(DEFAULT_ADDRESS_SPACE),
            max_cpu_seconds: None,
            max_processes: Some(DEFAULT_PROCESSES),
            max_file_size: Some(DEFAULT_FILE_SIZE),
            max_open_files: None,
        }
    }
}

impl RlimitConfig {
    /// No limits at all
    pub fn unlimited() -> Self {
        Self {
            max_memory: None,
            max_cpu_seconds: None,
            max_processes: None,
            max_file_size: None,
            max_open_files: None,
        }
    }

    fn entries(&self) -> [(libc::__rlimit_resource_t, Option<u64>); 5] {
        [
            (libc::RLIMIT_FSIZE, self.max_file_size),
            (libc::RLIMIT_AS, self.max_memory),
            (libc::RLIMIT_NPROC, self.max_processes),
            (libc::RLIMIT_CPU, self.max_cpu_seconds),
            (libc::RLIMIT_NOFILE, self.max_open_files),
        ]
    }

    /// Apply resource limits to the current process.
    pub fn apply(&self) -> Result<()> {
        self.apply_raw().map_err(|(resource, errno)| {
            SandboxError::Syscall(format!(
                "setrlimit({}) failed: {}",
                resource_name(resource),
                std::io::Error::from_raw_os_error(errno)
            ))
        })
    }

    /// Same as [`RlimitConfig::apply`] without allocating, for the window
    /// between `clone` and `execveat`.
    pub fn apply_raw(&self) -> std::result::Result<(), (libc::__rlimit_resource_t, i32)> {
        for (resource, limit) in self.entries() {
            let Some(limit) = limit else { continue };
            let rlim = libc::rlimit {
                rlim_cur: limit,
                rlim_max: limit,
            };
            if unsafe { libc::setrlimit(resource, &rlim) } != 0 {
                let errno = unsafe { *libc::__errno_location() };
                return Err((resource, errno));
            }
        }
        Ok(())
    }
}

fn resource_name(resource: libc::__rlimit_resource_t) -> &'static str {
    match resource {
        libc::RLIMIT_AS => "RLIMIT_AS",
        libc::RLIMIT_CPU => "RLIMIT_CPU",
        libc::RLIMIT_NPROC => "RLIMIT_NPROC",
        libc::RLIMIT_FSIZE => "RLIMIT_FSIZE",
        libc::RLIMIT_NOFILE => "RLIMIT_NOFILE",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_sandbox_ceilings() {
        let config = RlimitConfig::default();
        assert_eq!(config.max_memory, Some(1 << 30));
        assert_eq!(config.max_processes, Some(500));
        assert_eq!(config.max_file_size, Some(8 << 20));
        assert!(config.max_cpu_seconds.is_none());
    }

    #[test]
    fn test_empty_config_apply_succeeds() {
        assert!(RlimitConfig::unlimited().apply().is_ok());
    }

    #[test]
    fn test_resource_names() {
        assert_eq!(resource_name(libc::RLIMIT_AS), "RLIMIT_AS");
        assert_eq!(resource_name(libc::RLIMIT_FSIZE), "RLIMIT_FSIZE");
    }
}
