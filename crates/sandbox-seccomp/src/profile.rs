//! Which syscalls a sandboxed child may make directly

use std::collections::BTreeSet;

use sandbox_core::{Result, SandboxError};

/// Syscalls with a conditional rule; never in the unconditional allow list.
pub const CONDITIONAL_SYSCALLS: &[&str] = &["clone", "execveat"];

/// Syscalls that name host paths or reveal host state. The in-child emulator
/// handles these (or answers `ENOSYS`); allowing one would bypass the broker.
pub const EMULATED_SYSCALLS: &[&str] = &[
    "open",
    "openat",
    "creat",
    "stat",
    "lstat",
    "newfstatat",
    "statx",
    "access",
    "faccessat",
    "faccessat2",
    "unlink",
    "unlinkat",
    "readlink",
    "readlinkat",
    "chmod",
    "fchmodat",
    "chown",
    "lchown",
    "chdir",
    "fchdir",
    "getcwd",
    "mkdir",
    "mkdirat",
    "rmdir",
    "rename",
    "link",
    "symlink",
    "statfs",
    "utimensat",
    "chroot",
    "mount",
    "execve",
    "fork",
    "vfork",
    "clone3",
    "uname",
    "sysinfo",
    "getrusage",
    "ptrace",
    "seccomp",
    "setuid",
    "setgid",
];

/// Allow list for the trap-by-default filter.
///
/// Everything not allowed raises `SIGSYS`. `clone` is allowed only for
/// thread creation and `execveat` only through the gate page; see
/// [`crate::SeccompBpf`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrapFilter {
    allowed: BTreeSet<String>,
}

impl Default for TrapFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl TrapFilter {
    /// Filter with the standard passthrough set
    pub fn new() -> Self {
        let allowed = Self::passthrough_syscalls()
            .into_iter()
            .map(str::to_string)
            .collect();
        Self { allowed }
    }

    /// Syscalls that only act on descriptors, memory, or the calling
    /// process tree and therefore need no mediation.
    fn passthrough_syscalls() -> Vec<&'static str> {
        vec![
            // Lifecycle
            "exit",
            "exit_group",
            "wait4",
            "waitid",
            "kill",
            "tkill",
            "tgkill",
            // Memory
            "brk",
            "mmap",
            "munmap",
            "mprotect",
            "mremap",
            "madvise",
            "msync",
            "mincore",
            "memfd_create",
            "membarrier",
            // Descriptor I/O
            "read",
            "write",
            "readv",
            "writev",
            "pread64",
            "pwrite64",
            "preadv",
            "pwritev",
            "preadv2",
            "pwritev2",
            "lseek",
            "close",
            "close_range",
            "fstat",
            "fstatfs",
            "fcntl",
            "flock",
            "fsync",
            "fdatasync",
            "ftruncate",
            "fallocate",
            "fadvise64",
            "readahead",
            "sync_file_range",
            "getdents",
            "getdents64",
            "fchmod",
            "fchown",
            "ioctl",
            "sendfile",
            "splice",
            "tee",
            "vmsplice",
            "copy_file_range",
            "dup",
            "dup2",
            "dup3",
            "pipe",
            "pipe2",
            "eventfd",
            "eventfd2",
            // Polling
            "select",
            "pselect6",
            "poll",
            "ppoll",
            "epoll_create1",
            "epoll_ctl",
            "epoll_wait",
            "epoll_pwait",
            // Signals
            "rt_sigaction",
            "rt_sigprocmask",
            "rt_sigreturn",
            "rt_sigpending",
            "rt_sigtimedwait",
            "rt_sigqueueinfo",
            "rt_sigsuspend",
            "sigaltstack",
            "signalfd4",
            "pause",
            // Time and timers
            "nanosleep",
            "clock_nanosleep",
            "clock_gettime",
            "clock_getres",
            "gettimeofday",
            "time",
            "times",
            "getitimer",
            "setitimer",
            "alarm",
            "timer_create",
            "timer_settime",
            "timer_gettime",
            "timer_getoverrun",
            "timer_delete",
            "timerfd_create",
            "timerfd_settime",
            "timerfd_gettime",
            // Threads and scheduling
            "futex",
            "set_tid_address",
            "set_robust_list",
            "get_robust_list",
            "rseq",
            "arch_prctl",
            "prctl",
            "sched_yield",
            "sched_getaffinity",
            "sched_getparam",
            "sched_getscheduler",
            "sched_get_priority_max",
            "sched_get_priority_min",
            "getcpu",
            "getpriority",
            // Identity
            "getpid",
            "getppid",
            "gettid",
            "getuid",
            "geteuid",
            "getgid",
            "getegid",
            "getresuid",
            "getresgid",
            "getgroups",
            "getpgrp",
            "getpgid",
            "setpgid",
            "getsid",
            "setsid",
            "umask",
            // Limits
            "getrlimit",
            "setrlimit",
            "prlimit64",
            "getrandom",
            // Sockets; the network namespace is empty
            "socket",
            "socketpair",
            "connect",
            "accept",
            "accept4",
            "bind",
            "listen",
            "shutdown",
            "sendto",
            "recvfrom",
            "sendmsg",
            "recvmsg",
            "sendmmsg",
            "recvmmsg",
            "getsockname",
            "getpeername",
            "setsockopt",
            "getsockopt",
        ]
    }

    /// Add syscall to the allow list
    pub fn allow_syscall(&mut self, name: impl Into<String>) {
        self.allowed.insert(name.into());
    }

    /// Remove a syscall from the allow list so it traps
    pub fn trap_syscall(&mut self, name: &str) {
        self.allowed.remove(name);
    }

    /// Check if syscall passes through unconditionally
    pub fn is_allowed(&self, name: &str) -> bool {
        self.allowed.contains(name)
    }

    /// Get allowed syscalls
    pub fn allowed_syscalls(&self) -> &BTreeSet<String> {
        &self.allowed
    }

    /// Count allowed syscalls
    pub fn allowed_count(&self) -> usize {
        self.allowed.len()
    }

    /// Reject allow lists that would let the child bypass the broker.
    pub fn validate(&self) -> Result<()> {
        if self.allowed.is_empty() {
            return Err(SandboxError::Seccomp(
                "Filter has no allowed syscalls".to_string(),
            ));
        }
        if let Some(name) = self
            .allowed
            .iter()
            .find(|name| EMULATED_SYSCALLS.contains(&name.as_str()))
        {
            return Err(SandboxError::Seccomp(format!(
                "'{}' must trap to the emulator and cannot be allowed",
                name
            )));
        }
        if let Some(name) = self
            .allowed
            .iter()
            .find(|name| CONDITIONAL_SYSCALLS.contains(&name.as_str()))
        {
            return Err(SandboxError::Seccomp(format!(
                "'{}' has a fixed conditional rule and cannot be allowed outright",
                name
            )));
        }
        Ok(())
    }

    /// Sorted allow list, for display
    pub fn export(&self) -> Result<Vec<String>> {
        self.validate()?;
        Ok(self.allowed.iter().cloned().collect())
    }
}
