//! Sandbox configuration, builder, and the run entry points

use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, info};
use nix::fcntl::OFlag;
use nix::sys::signal::{Signal, kill};
use nix::unistd::{Pid, pipe2};

use sandbox_broker::{Broker, ErrnoSpec, Filesystem, Grant, Policy, Session};
use sandbox_core::capabilities::SystemCapabilities;
use sandbox_core::{Result, SandboxError};
use sandbox_namespace::NamespaceConfig;

use crate::image::EmulatorImage;
use crate::launcher::Launcher;
use crate::reactor::{Reactor, SessionExit, SessionId};
use crate::rlimit::RlimitConfig;
use crate::stream::{ProcessStream, StreamChunk, spawn_fd_reader};

/// Wall-clock limit when none is configured
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Sandbox configuration
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Name used in log lines
    pub id: String,
    pub namespaces: NamespaceConfig,
    pub rlimits: RlimitConfig,
    /// Wall-clock limit; the session is killed when it passes
    pub timeout: Option<Duration>,
    /// Environment entries added to the base set
    pub env: Vec<(String, String)>,
    /// Grant the runtime bundle dynamically linked programs need
    pub syslibs: bool,
    /// Explicit grants, installed after the bundle so they take precedence
    pub grants: Vec<Grant>,
    /// Host directory served as the child's working directory, with its
    /// write budget
    pub cwd: Option<(PathBuf, u32)>,
    /// Preload binary; located automatically when unset
    pub preload: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            namespaces: NamespaceConfig::all(),
            rlimits: RlimitConfig::default(),
            timeout: Some(DEFAULT_TIMEOUT),
            env: Vec::new(),
            syslibs: true,
            grants: Vec::new(),
            cwd: None,
            preload: None,
        }
    }
}

impl SandboxConfig {
    /// Validate against this host
    pub fn validate(&self) -> Result<()> {
        self.validate_invariants()?;

        let caps = SystemCapabilities::detect();
        if !caps.is_x86_64 {
            return Err(SandboxError::FeatureNotAvailable(
                "only x86_64 hosts are supported".to_string(),
            ));
        }
        if !caps.has_seccomp {
            return Err(SandboxError::FeatureNotAvailable(
                "Seccomp is required for sandboxing".to_string(),
            ));
        }
        self.namespaces.validate(caps.has_root)
    }

    fn validate_invariants(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(SandboxError::InvalidConfig(
                "Sandbox ID cannot be empty".to_string(),
            ));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(SandboxError::InvalidConfig(
                "timeout must be positive".to_string(),
            ));
        }
        if self.rlimits.max_processes == Some(0) {
            return Err(SandboxError::InvalidConfig(
                "process limit must allow the child itself".to_string(),
            ));
        }
        Ok(())
    }

    /// Grants as a policy, for [`Policy::apply`]
    fn policy(&self) -> Policy {
        Policy {
            syslibs: self.syslibs,
            grants: self.grants.clone(),
            ..Default::default()
        }
    }
}

type Violation = Arc<dyn Fn(&Path, bool) + Send + Sync>;

/// Builder pattern for sandbox creation
pub struct SandboxBuilder {
    config: SandboxConfig,
    on_violation: Option<Violation>,
}

impl SandboxBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            config: SandboxConfig {
                id: id.to_string(),
                ..Default::default()
            },
            on_violation: None,
        }
    }

    /// Address-space limit in bytes
    pub fn memory_limit(mut self, bytes: u64) -> Self {
        self.config.rlimits.max_memory = Some(bytes);
        self
    }

    /// Set memory limit from string (e.g., "100M")
    pub fn memory_limit_str(self, s: &str) -> Result<Self> {
        let bytes = sandbox_core::util::parse_memory_size(s)?;
        Ok(self.memory_limit(bytes))
    }

    pub fn max_processes(mut self, max: u64) -> Self {
        self.config.rlimits.max_processes = Some(max);
        self
    }

    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.config.rlimits.max_file_size = Some(bytes);
        self
    }

    pub fn rlimits(mut self, rlimits: RlimitConfig) -> Self {
        self.config.rlimits = rlimits;
        self
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.config.timeout = Some(duration);
        self
    }

    /// Let the child run for as long as it likes
    pub fn no_timeout(mut self) -> Self {
        self.config.timeout = None;
        self
    }

    pub fn namespaces(mut self, config: NamespaceConfig) -> Self {
        self.config.namespaces = config;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.push((key.into(), value.into()));
        self
    }

    /// Whether to grant the runtime bundle (on by default)
    pub fn syslibs(mut self, enabled: bool) -> Self {
        self.config.syslibs = enabled;
        self
    }

    /// Expose a host file or directory (trailing `/`) at the same path
    pub fn grant_native(mut self, path: impl Into<PathBuf>, write_budget: u32) -> Self {
        self.config.grants.push(Grant::Native {
            native: path.into(),
            at: None,
            write_budget,
        });
        self
    }

    /// Expose `host` at `sandbox_path`
    pub fn grant_native_at(
        mut self,
        host: impl Into<PathBuf>,
        sandbox_path: impl Into<PathBuf>,
        write_budget: u32,
    ) -> Self {
        self.config.grants.push(Grant::Native {
            native: host.into(),
            at: Some(sandbox_path.into()),
            write_budget,
        });
        self
    }

    /// In-memory directory allowing `budget` files to be created
    pub fn grant_tmp(mut self, path: impl Into<PathBuf>, budget: u32) -> Self {
        self.config.grants.push(Grant::Tmp {
            tmp: path.into(),
            budget,
        });
        self
    }

    pub fn grant_errno(mut self, path: impl Into<PathBuf>, errno: i32, noisy: bool) -> Self {
        self.config.grants.push(Grant::Error {
            error: path.into(),
            errno: ErrnoSpec::Number(errno),
            noisy,
        });
        self
    }

    /// Make `path` quietly absent
    pub fn hide(self, path: impl Into<PathBuf>) -> Self {
        self.grant_errno(path, libc::ENOENT, false)
    }

    /// Serve `host_dir` as the child's starting directory
    pub fn grant_cwd(mut self, host_dir: impl Into<PathBuf>, write_budget: u32) -> Self {
        self.config.cwd = Some((host_dir.into(), write_budget));
        self
    }

    /// Merge a policy file's grants, limits and timeout
    pub fn policy(mut self, policy: &Policy) -> Self {
        self.config.syslibs = policy.syslibs;
        self.config.grants.extend(policy.grants.iter().cloned());
        let limits = &policy.limits;
        if limits.address_space.is_some() {
            self.config.rlimits.max_memory = limits.address_space;
        }
        if limits.processes.is_some() {
            self.config.rlimits.max_processes = limits.processes;
        }
        if limits.file_size.is_some() {
            self.config.rlimits.max_file_size = limits.file_size;
        }
        if let Some(secs) = policy.timeout_secs {
            self.config.timeout = Some(Duration::from_secs(secs));
        }
        self
    }

    pub fn preload(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.preload = Some(path.into());
        self
    }

    /// Run `callback` with the path and write intent of each reported denial
    pub fn on_violation<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Path, bool) + Send + Sync + 'static,
    {
        self.on_violation = Some(Arc::new(callback));
        self
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn build(self) -> Result<Sandbox> {
        self.config.validate()?;
        Sandbox::new(self.config, self.on_violation)
    }
}

/// Sandbox execution result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxResult {
    /// Exit status, or 128 + signal when killed
    pub exit_code: i32,
    /// Signal that killed the program, if any
    pub signal: Option<i32>,
    /// Killed for exceeding the timeout
    pub timed_out: bool,
    /// Wall clock time in milliseconds
    pub wall_time_ms: u64,
    /// Denials reported during this run
    pub violations: u64,
}

impl SandboxResult {
    fn new(exit: SessionExit, started: Instant, violations: u64) -> Self {
        Self {
            exit_code: exit.exit_code,
            signal: exit.signal,
            timed_out: exit.timed_out,
            wall_time_ms: started.elapsed().as_millis() as u64,
            violations,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// A configured sandbox; each run starts a fresh child under the same
/// filesystem policy.
pub struct Sandbox {
    config: SandboxConfig,
    filesystem: Arc<Filesystem>,
    launcher: Launcher,
    image: Option<EmulatorImage>,
    running: Arc<Mutex<Option<Pid>>>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("config", &self.config)
            .field("filesystem", &self.filesystem)
            .field("running", &self.pid())
            .finish()
    }
}

impl Sandbox {
    fn new(config: SandboxConfig, on_violation: Option<Violation>) -> Result<Self> {
        let filesystem = Arc::new(Filesystem::new());
        if let Some(callback) = on_violation {
            filesystem.set_violation_callback(move |path, write| callback(path, write));
        }
        config.policy().apply(&filesystem, None)?;
        if let Some((dir, budget)) = &config.cwd {
            filesystem.grant_cwd(dir, *budget)?;
        }

        let mut launcher = Launcher::new(config.namespaces.clone(), config.rlimits)?;
        for (key, value) in &config.env {
            launcher = launcher.env(key.clone(), value.clone());
        }
        if config.cwd.is_some() {
            launcher = launcher.env("PWD", sandbox_protocol::DEFAULT_CWD);
        }

        debug!(
            "sandbox {} ready: {} mount rules",
            config.id,
            filesystem.rule_count()
        );
        Ok(Self {
            config,
            filesystem,
            launcher,
            image: None,
            running: Arc::new(Mutex::new(None)),
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// The mount policy; grants added here apply to later runs
    pub fn filesystem(&self) -> &Arc<Filesystem> {
        &self.filesystem
    }

    fn pid(&self) -> Option<Pid> {
        *self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.pid().is_some()
    }

    fn image(&mut self) -> Result<EmulatorImage> {
        if let Some(image) = &self.image {
            return Ok(image.clone());
        }
        let image = match &self.config.preload {
            Some(path) => EmulatorImage::load(path)?,
            None => EmulatorImage::shared()?,
        };
        self.image = Some(image.clone());
        Ok(image)
    }

    /// Everything up to a served session: image, program grant, launch.
    fn start(
        &mut self,
        program: &str,
        args: &[&str],
        stdio: [BorrowedFd<'_>; 3],
    ) -> Result<(Reactor, SessionId)> {
        if self.is_running() {
            return Err(SandboxError::InvalidConfig(format!(
                "sandbox {} is already running",
                self.config.id
            )));
        }
        let image = self.image()?;

        if self.config.syslibs {
            let path = Launcher::resolve_program(program)?;
            if let Err(err) = self.filesystem.grant_native(&path, 0) {
                debug!("program {} not granted: {}", path, err);
            }
        }

        // the reaper must exist before the child can exit
        let mut reactor = Reactor::new()?;
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let launched = self.launcher.launch(program, &args, stdio, &image)?;

        let broker = Arc::new(Broker::new(
            Arc::clone(&self.filesystem),
            Some(Arc::clone(image.fd())),
        ));
        let session = Session::new(broker, launched.control);
        let id = reactor.add_session(session, launched.pid, self.config.timeout)?;
        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = Some(launched.pid);
        info!(
            "sandbox {}: started {} as pid {}",
            self.config.id, program, launched.pid
        );
        Ok((reactor, id))
    }

    /// Run `program` with the caller's stdio and wait for it.
    pub fn run(&mut self, program: &str, args: &[&str]) -> Result<SandboxResult> {
        let started = Instant::now();
        let before = self.filesystem.violations();
        let (stdin, stdout, stderr) = (io::stdin(), io::stdout(), io::stderr());
        let stdio = [stdin.as_fd(), stdout.as_fd(), stderr.as_fd()];
        let (mut reactor, id) = self.start(program, args, stdio)?;

        let exit = reactor.run_until_exit(id);
        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = None;
        let exit = exit?;

        let result = SandboxResult::new(exit, started, self.filesystem.violations() - before);
        debug!("sandbox {}: {:?}", self.config.id, result);
        Ok(result)
    }

    /// Run `program` with its stdout and stderr captured line by line.
    ///
    /// The stream ends with a [`StreamChunk::Exit`].
    pub fn run_with_stream(&mut self, program: &str, args: &[&str]) -> Result<ProcessStream> {
        let started = Instant::now();
        let before = self.filesystem.violations();

        let (stdout_read, stdout_write) = pipe2(OFlag::O_CLOEXEC)
            .map_err(|e| SandboxError::Syscall(format!("pipe2: {}", e)))?;
        let (stderr_read, stderr_write) = pipe2(OFlag::O_CLOEXEC)
            .map_err(|e| SandboxError::Syscall(format!("pipe2: {}", e)))?;

        let stdin = io::stdin();
        let stdio = [stdin.as_fd(), stdout_write.as_fd(), stderr_write.as_fd()];
        let (mut reactor, id) = self.start(program, args, stdio)?;
        drop(stdout_write);
        drop(stderr_write);

        let (writer, stream) = ProcessStream::new();
        spawn_fd_reader(stdout_read, false, writer.clone())?;
        spawn_fd_reader(stderr_read, true, writer.clone())?;

        let filesystem = Arc::clone(&self.filesystem);
        let running = Arc::clone(&self.running);
        std::thread::Builder::new()
            .name(format!("sandbox-{}", self.config.id))
            .spawn(move || {
                let exit = reactor.run_until_exit(id);
                *running.lock().unwrap_or_else(PoisonError::into_inner) = None;
                let chunk = match exit {
                    Ok(exit) => {
                        let result =
                            SandboxResult::new(exit, started, filesystem.violations() - before);
                        StreamChunk::Exit {
                            exit_code: result.exit_code,
                            signal: result.signal,
                            timed_out: result.timed_out,
                            violations: result.violations,
                        }
                    }
                    Err(err) => {
                        log::warn!("sandbox reactor failed: {}", err);
                        StreamChunk::Exit {
                            exit_code: -1,
                            signal: None,
                            timed_out: false,
                            violations: filesystem.violations() - before,
                        }
                    }
                };
                let _ = writer.send(chunk);
            })?;

        Ok(stream)
    }

    /// Kill the running child, if any
    pub fn kill(&mut self) -> Result<()> {
        if let Some(pid) = self.pid() {
            kill(pid, Signal::SIGKILL)
                .map_err(|e| SandboxError::Syscall(format!("Failed to kill process: {}", e)))?;
        }
        Ok(())
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        let _ = self.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_protocol::Op;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sandbox(builder: SandboxBuilder) -> Sandbox {
        let config = builder.config;
        config.validate_invariants().unwrap();
        Sandbox::new(config, builder.on_violation).unwrap()
    }

    #[test]
    fn test_sandbox_config_default() {
        let config = SandboxConfig::default();
        assert_eq!(config.id, "default");
        assert_eq!(config.timeout, Some(DEFAULT_TIMEOUT));
        assert_eq!(config.rlimits, RlimitConfig::default());
        assert!(config.syslibs);
        assert!(config.namespaces.all_enabled());
    }

    #[test]
    fn test_sandbox_config_validate_empty_id() {
        let config = SandboxConfig {
            id: String::new(),
            ..Default::default()
        };
        assert!(config.validate_invariants().is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let builder = SandboxBuilder::new("t").timeout(Duration::ZERO);
        assert!(builder.config.validate_invariants().is_err());
    }

    #[test]
    fn test_sandbox_builder_memory_limit_str() -> Result<()> {
        let builder = SandboxBuilder::new("test").memory_limit_str("100M")?;
        assert_eq!(builder.config.rlimits.max_memory, Some(100 * 1024 * 1024));
        Ok(())
    }

    #[test]
    fn test_builder_collects_grants() {
        let builder = SandboxBuilder::new("test")
            .grant_native("/srv/", 0)
            .grant_native_at("/data/", "/mnt/data/", 2)
            .grant_tmp("/tmp/", 5)
            .hide("/home/");
        assert_eq!(builder.config.grants.len(), 4);
        assert_eq!(
            builder.config.grants[3],
            Grant::Error {
                error: PathBuf::from("/home/"),
                errno: ErrnoSpec::Number(libc::ENOENT),
                noisy: false
            }
        );
    }

    #[test]
    fn test_policy_merges_limits() {
        let policy = Policy::from_json(
            r#"{ "syslibs": false, "limits": { "processes": 20 }, "timeout_secs": 5,
                 "grants": [ { "tmp": "/scratch/", "budget": 1 } ] }"#,
        )
        .unwrap();
        let builder = SandboxBuilder::new("p").policy(&policy);
        let config = builder.config();
        assert!(!config.syslibs);
        assert_eq!(config.rlimits.max_processes, Some(20));
        assert_eq!(config.rlimits.max_memory, Some(crate::rlimit::DEFAULT_ADDRESS_SPACE));
        assert_eq!(config.timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.grants.len(), 1);
    }

    #[test]
    fn test_grants_reach_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("in.txt"), b"x").unwrap();
        let sb = sandbox(
            SandboxBuilder::new("fs")
                .syslibs(false)
                .grant_native_at(format!("{}/", dir.path().display()), "/input/", 0)
                .grant_tmp("/tmp/", 1),
        );
        let fs = sb.filesystem();
        assert!(fs.child_file(Op::Access, b"/input/in.txt", libc::R_OK, 0).is_ok());
        assert_eq!(
            fs.child_file(Op::Open, b"/etc/passwd", libc::O_RDONLY, 0)
                .unwrap_err(),
            libc::EACCES
        );
    }

    #[test]
    fn test_violation_callback_is_installed() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let sb = sandbox(
            SandboxBuilder::new("cb")
                .syslibs(false)
                .on_violation(move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
        );
        let _ = sb
            .filesystem()
            .child_file(Op::Open, b"/secret", libc::O_RDONLY, 0);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cwd_grant_sets_pwd() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(SandboxBuilder::new("cwd").syslibs(false).grant_cwd(dir.path(), 0));
        assert!(sb.launcher.build_envp().contains(&"PWD=/@CWD".to_string()));
        assert!(
            sb.filesystem()
                .child_file(Op::Access, b"/@CWD", libc::R_OK, 0)
                .is_ok()
        );
    }

    #[test]
    fn test_missing_preload_fails_before_launch() {
        let mut sb = sandbox(
            SandboxBuilder::new("nopreload")
                .syslibs(false)
                .preload("/nonexistent/sandbox-preload"),
        );
        assert!(sb.run("/bin/true", &[]).is_err());
        assert!(!sb.is_running());
    }

    #[test]
    fn test_kill_without_child() {
        let mut sb = sandbox(SandboxBuilder::new("kill").syslibs(false));
        sb.kill().unwrap();
    }

    #[test]
    fn test_result_success() {
        let exit = SessionExit {
            exit_code: 0,
            signal: None,
            timed_out: false,
        };
        let result = SandboxResult::new(exit, Instant::now(), 0);
        assert!(result.success());
    }
}
