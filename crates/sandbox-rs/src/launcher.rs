//! Starting a child inside fresh namespaces
//!
//! The parent prepares a [`ChildPlan`], clones with the configured
//! namespace flags, and keeps the broker end of the control socket. The
//! child runs the plan and ends up in the preload via `execveat`.

use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::path::Path;

use log::{debug, warn};
use nix::fcntl::OFlag;
use nix::sched::clone;
use nix::sys::signal::Signal;
use nix::unistd::{Pid, pipe2, write};
use sandbox_core::util::{find_program, get_gid, get_uid};
use sandbox_core::{Result, SandboxError};
use sandbox_namespace::NamespaceConfig;
use sandbox_namespace::user_ns::setup_user_namespace;
use sandbox_protocol::LOADER_ARGV0;
use sandbox_protocol::transport::seqpacket_pair;
use sandbox_seccomp::{BpfProgram, SeccompBpf, TrapFilter};

use crate::child::ChildPlan;
use crate::image::EmulatorImage;
use crate::rlimit::RlimitConfig;

/// Stack for the cloned child until it execs
const CHILD_STACK_SIZE: usize = 128 * 1024;

/// Environment every sandboxed program starts with
const BASE_ENV: &[(&str, &str)] = &[
    ("TERM", "xterm"),
    ("PATH", "/usr/bin:/bin"),
    ("TMPDIR", "/tmp"),
    ("LANG", "en_US.UTF-8"),
];

/// A started child and the broker side of its control socket
#[derive(Debug)]
pub struct Launched {
    pub pid: Pid,
    pub control: OwnedFd,
}

/// Reusable launch configuration; the filter is compiled once.
pub struct Launcher {
    filter: BpfProgram,
    namespaces: NamespaceConfig,
    rlimits: RlimitConfig,
    env: Vec<(String, String)>,
}

impl std::fmt::Debug for Launcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launcher")
            .field("filter_len", &self.filter.len())
            .field("namespaces", &self.namespaces)
            .field("rlimits", &self.rlimits)
            .field("env", &self.env)
            .finish()
    }
}

impl Launcher {
    pub fn new(namespaces: NamespaceConfig, rlimits: RlimitConfig) -> Result<Self> {
        Self::with_filter(&TrapFilter::new(), namespaces, rlimits)
    }

    pub fn with_filter(
        filter: &TrapFilter,
        namespaces: NamespaceConfig,
        rlimits: RlimitConfig,
    ) -> Result<Self> {
        namespaces.validate(get_uid() == 0)?;
        Ok(Self {
            filter: SeccompBpf::compile_to_bpf(filter)?,
            namespaces,
            rlimits,
            env: Vec::new(),
        })
    }

    /// Add or override an environment entry
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        match self.env.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = value,
            None => self.env.push((key, value)),
        }
        self
    }

    /// Resolve `program` the way the child's loader will see it
    pub fn resolve_program(program: &str) -> Result<String> {
        let path = find_program(program).ok_or_else(|| {
            SandboxError::Launch(format!("command not found: {}", program))
        })?;
        let path = if path.is_absolute() {
            path
        } else {
            std::path::absolute(&path)?
        };
        path.into_os_string()
            .into_string()
            .map_err(|p| SandboxError::Launch(format!("program path is not UTF-8: {:?}", p)))
    }

    /// argv handed to the preload: its marker, the program, then `args`
    pub fn build_argv(program: &str, args: &[String]) -> Vec<String> {
        let mut argv = Vec::with_capacity(args.len() + 2);
        argv.push(LOADER_ARGV0.to_string_lossy().into_owned());
        argv.push(program.to_string());
        argv.extend(args.iter().cloned());
        argv
    }

    /// envp handed to the preload: the base set plus overrides
    pub fn build_envp(&self) -> Vec<String> {
        let mut env: Vec<(String, String)> = BASE_ENV
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        for (key, value) in &self.env {
            match env.iter_mut().find(|(k, _)| k == key) {
                Some((_, existing)) => existing.clone_from(value),
                None => env.push((key.clone(), value.clone())),
            }
        }
        env.into_iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }

    /// Start `program` with `stdio` as its descriptors 0, 1 and 2.
    ///
    /// Returns once the child exists; it is blocked on its liveness ping
    /// until the control socket is served.
    pub fn launch(
        &self,
        program: &str,
        args: &[String],
        stdio: [BorrowedFd<'_>; 3],
        image: &EmulatorImage,
    ) -> Result<Launched> {
        let program = Self::resolve_program(program)?;
        let argv = Self::build_argv(&program, args);
        let envp = self.build_envp();

        let (control, child_end) = seqpacket_pair()?;
        let map_user = self.namespaces.user && self.namespaces.map_user;
        let sync = if map_user {
            let (read, write) = pipe2(OFlag::O_CLOEXEC)
                .map_err(|e| SandboxError::Syscall(format!("pipe2: {}", e)))?;
            Some((read, write))
        } else {
            None
        };

        let plan = ChildPlan::new(
            [
                stdio[0].as_raw_fd(),
                stdio[1].as_raw_fd(),
                stdio[2].as_raw_fd(),
                child_end.as_raw_fd(),
                image.fd().as_raw_fd(),
            ],
            sync.as_ref().map(|(read, _)| read.as_raw_fd()),
            self.rlimits,
            &self.filter,
            &argv,
            &envp,
        )?;

        let mut stack = vec![0u8; CHILD_STACK_SIZE];
        let flags = self.namespaces.to_clone_flags();
        // SAFETY: the callback only runs ChildPlan::run, which neither
        // allocates nor returns except through _exit
        let pid = unsafe {
            clone(
                Box::new(|| plan.run()),
                &mut stack,
                flags,
                Some(Signal::SIGCHLD as i32),
            )
        }
        .map_err(|e| match e {
            nix::errno::Errno::EPERM | nix::errno::Errno::EINVAL | nix::errno::Errno::ENOSPC => {
                SandboxError::Namespace(format!("clone({:?}): {}", flags, e))
            }
            _ => SandboxError::Syscall(format!("clone: {}", e)),
        })?;
        drop(child_end);

        if let Some((read, write_end)) = sync {
            drop(read);
            if let Err(err) = setup_user_namespace(pid, get_uid(), get_gid()) {
                warn!("sandbox {}: {}", pid, err);
            }
            if let Err(err) = write(&write_end, &[1]) {
                warn!("sandbox {}: releasing child failed: {}", pid, err);
            }
        }

        debug!(
            "launched {} as pid {} ({} args)",
            Path::new(&program).display(),
            pid,
            args.len()
        );
        Ok(Launched { pid, control })
    }
}
