//! Filesystem policy: grants, tmp files, and request resolution

use std::collections::HashMap;
use std::ffi::{CString, OsStr};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use log::{debug, warn};
use sandbox_core::{Result, SandboxError};
use sandbox_protocol::{DEFAULT_CWD, Op};

use crate::mount::{MountKind, MountTable};
use crate::path::{check_open_flags, is_traversal, is_write, strip_trailing_slashes};

/// Called with the requested path and whether the request was a write.
pub type ViolationCallback = Arc<dyn Fn(&Path, bool) + Send + Sync>;

/// memfd names are limited to 249 bytes by the kernel
const MEMFD_NAME_MAX: usize = 200;

#[derive(Debug, Default)]
struct FsState {
    mounts: MountTable,
    tmpfiles: HashMap<Vec<u8>, OwnedFd>,
    mountfds: HashMap<PathBuf, Arc<OwnedFd>>,
}

/// A request that failed, and whether the failure counts as a violation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Denial {
    errno: i32,
    report: bool,
}

impl Denial {
    fn quiet(errno: i32) -> Self {
        Self {
            errno,
            report: false,
        }
    }

    fn reported(errno: i32) -> Self {
        Self {
            errno,
            report: true,
        }
    }
}

/// Work decided under the state lock and carried out after releasing it
enum NativeOp {
    Open(i32, u32),
    Unlink,
    Access(i32),
}

/// Mount policy shared by every session of one sandbox.
///
/// Starts out denying everything with a reported `EACCES`; grants add
/// longer-prefix rules on top.
pub struct Filesystem {
    state: Mutex<FsState>,
    on_violation: RwLock<ViolationCallback>,
    violations: AtomicU64,
}

impl Default for Filesystem {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem")
            .field("state", &*self.lock())
            .field("violations", &self.violations())
            .finish()
    }
}

impl Filesystem {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FsState::default()),
            on_violation: RwLock::new(Arc::new(log_violation)),
            violations: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the callback run on every reported denial.
    ///
    /// The callback runs without any broker lock held.
    pub fn set_violation_callback<F>(&self, callback: F)
    where
        F: Fn(&Path, bool) + Send + Sync + 'static,
    {
        *self
            .on_violation
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(callback);
    }

    /// Number of reported denials so far
    pub fn violations(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }

    /// Insert a rule directly. Keys ending in `/` are directory rules.
    pub fn add_rule(&self, sandbox_path: impl AsRef<Path>, kind: MountKind) {
        let key = sandbox_path.as_ref().as_os_str().as_bytes().to_vec();
        self.lock().mounts.insert(key, kind);
    }

    /// Number of rules in the mount table, the default `/` rule included
    pub fn rule_count(&self) -> usize {
        self.lock().mounts.len()
    }

    /// Expose a host path at the same sandbox path
    pub fn grant_native(&self, path: impl AsRef<Path>, write_budget: u32) -> Result<()> {
        let path = path.as_ref();
        self.grant_native_at(path, path, write_budget)
    }

    /// Expose `host_path` at `sandbox_path`.
    ///
    /// Both must end in `/` for a directory grant; for a single file the
    /// final components must be equal, since the child's name is resolved
    /// inside the host file's directory. If the host directory cannot be
    /// opened the sandbox path is left answering `ENOENT`.
    pub fn grant_native_at(
        &self,
        host_path: impl AsRef<Path>,
        sandbox_path: impl AsRef<Path>,
        write_budget: u32,
    ) -> Result<()> {
        let host = host_path.as_ref().as_os_str().as_bytes();
        let child = sandbox_path.as_ref().as_os_str().as_bytes();

        if last_component(host) != last_component(child) {
            return Err(SandboxError::InvalidConfig(format!(
                "grant {} -> {}: final path components must match",
                host.escape_ascii(),
                child.escape_ascii()
            )));
        }
        if is_traversal(child) {
            return Err(SandboxError::InvalidConfig(format!(
                "sandbox path must be absolute and normalized: {}",
                child.escape_ascii()
            )));
        }

        let mount_dir = PathBuf::from(OsStr::from_bytes(parent_with_slash(host)));
        let mut state = self.lock();

        let dir = match state.mountfds.get(&mount_dir) {
            Some(dir) => Arc::clone(dir),
            None => match open_mount_dir(&mount_dir) {
                Ok(fd) => {
                    let dir = Arc::new(fd);
                    state.mountfds.insert(mount_dir.clone(), Arc::clone(&dir));
                    dir
                }
                Err(err) => {
                    state.mounts.insert(
                        child,
                        MountKind::Error {
                            errno: libc::ENOENT,
                            noisy: false,
                        },
                    );
                    return Err(SandboxError::Io(std::io::Error::new(
                        err.kind(),
                        format!("open {}: {}", mount_dir.display(), err),
                    )));
                }
            },
        };

        debug!(
            "grant native {} -> {} (write budget {})",
            host.escape_ascii(),
            child.escape_ascii(),
            write_budget
        );
        state
            .mounts
            .insert(child, MountKind::Native { dir, write_budget });
        Ok(())
    }

    /// Serve `sandbox_path` from memory, allowing `budget` files to be created
    pub fn grant_tmp(&self, sandbox_path: impl AsRef<Path>, budget: u32) {
        self.add_rule(sandbox_path, MountKind::Tmp { budget });
    }

    /// Answer every request under `sandbox_path` with `errno`
    pub fn grant_errno(&self, sandbox_path: impl AsRef<Path>, errno: i32, noisy: bool) {
        self.add_rule(sandbox_path, MountKind::Error { errno, noisy });
    }

    /// Make `sandbox_path` look absent without reporting anything
    pub fn hide(&self, sandbox_path: impl AsRef<Path>) {
        self.grant_errno(sandbox_path, libc::ENOENT, false);
    }

    /// Map a host directory to the child's default working directory
    pub fn grant_cwd(&self, host_dir: impl AsRef<Path>, write_budget: u32) -> Result<()> {
        let mut host = host_dir.as_ref().as_os_str().as_bytes().to_vec();
        if !host.ends_with(b"/") {
            host.push(b'/');
        }
        let child = format!("{}/", DEFAULT_CWD);
        self.grant_native_at(OsStr::from_bytes(&host), child, write_budget)
    }

    /// Resolve one child request.
    ///
    /// `Open` returns the new descriptor; `Unlink` and `Access` return
    /// `None` on success. Errors are positive errno values for the wire.
    pub fn child_file(
        &self,
        op: Op,
        path: &[u8],
        flags: i32,
        mode: u32,
    ) -> std::result::Result<Option<OwnedFd>, i32> {
        if op == Op::Open {
            check_open_flags(flags)?;
        }
        if !op.takes_path() {
            return Err(libc::EINVAL);
        }

        let write = is_write(op, flags);
        match self.resolve(op, path, flags, mode, write) {
            Ok(fd) => Ok(fd),
            Err(denial) => {
                if denial.report {
                    self.report(path, write);
                }
                Err(denial.errno)
            }
        }
    }

    fn report(&self, path: &[u8], write: bool) {
        self.violations.fetch_add(1, Ordering::Relaxed);
        let callback = Arc::clone(
            &self
                .on_violation
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        );
        callback(Path::new(OsStr::from_bytes(path)), write);
    }

    fn resolve(
        &self,
        op: Op,
        path: &[u8],
        flags: i32,
        mode: u32,
        write: bool,
    ) -> std::result::Result<Option<OwnedFd>, Denial> {
        if is_traversal(path) {
            return Err(Denial::reported(libc::EACCES));
        }
        let path = strip_trailing_slashes(path);

        let mut guard = self.lock();
        let state = &mut *guard;
        let found = state
            .mounts
            .lookup(path)
            .ok_or(Denial::reported(libc::EACCES))?;
        let relpath: &[u8] = if found.prefix_len > path.len() {
            b"."
        } else {
            &path[found.prefix_len..]
        };

        let (dir, native_op) = match state.mounts.get_mut(&found.key) {
            Some(MountKind::Error { errno, noisy }) => {
                return Err(Denial {
                    errno: *errno,
                    report: *noisy,
                });
            }
            Some(MountKind::Tmp { budget }) => {
                return tmp_file(
                    &mut state.tmpfiles,
                    budget,
                    op,
                    path,
                    flags,
                    found.exact_path,
                    write,
                );
            }
            Some(MountKind::Native { dir, write_budget }) => {
                if write {
                    if *write_budget == 0 {
                        return Err(Denial::reported(libc::EACCES));
                    }
                    *write_budget -= 1;
                }
                let native_op = match op {
                    Op::Open => NativeOp::Open(flags, mode),
                    Op::Unlink => NativeOp::Unlink,
                    _ => NativeOp::Access(flags),
                };
                (Arc::clone(dir), native_op)
            }
            None => return Err(Denial::reported(libc::EACCES)),
        };
        let relpath = CString::new(relpath).map_err(|_| Denial::quiet(libc::EINVAL))?;
        drop(guard);

        native_file(&dir, &relpath, native_op).map_err(Denial::quiet)
    }
}

fn native_file(
    dir: &OwnedFd,
    relpath: &CString,
    op: NativeOp,
) -> std::result::Result<Option<OwnedFd>, i32> {
    let dirfd = dir.as_raw_fd();
    match op {
        NativeOp::Open(flags, mode) => {
            let fd = unsafe {
                libc::openat(
                    dirfd,
                    relpath.as_ptr(),
                    flags | libc::O_CLOEXEC | libc::O_NOCTTY,
                    mode as libc::c_uint,
                )
            };
            if fd < 0 {
                return Err(last_errno());
            }
            Ok(Some(unsafe { OwnedFd::from_raw_fd(fd) }))
        }
        NativeOp::Unlink => {
            if unsafe { libc::unlinkat(dirfd, relpath.as_ptr(), 0) } < 0 {
                return Err(last_errno());
            }
            Ok(None)
        }
        NativeOp::Access(mode) => {
            if unsafe { libc::faccessat(dirfd, relpath.as_ptr(), mode, 0) } < 0 {
                return Err(last_errno());
            }
            Ok(None)
        }
    }
}

fn tmp_file(
    tmpfiles: &mut HashMap<Vec<u8>, OwnedFd>,
    budget: &mut u32,
    op: Op,
    path: &[u8],
    flags: i32,
    exact_path: bool,
    write: bool,
) -> std::result::Result<Option<OwnedFd>, Denial> {
    match op {
        Op::Open => {
            if !tmpfiles.contains_key(path) {
                if !write {
                    return Err(Denial::quiet(libc::ENOENT));
                }
                if *budget == 0 {
                    return Err(Denial::reported(libc::ENOMEM));
                }
                *budget -= 1;
                tmpfiles.insert(path.to_vec(), create_tmp(path)?);
            }
            let backing = tmpfiles
                .get(path)
                .ok_or(Denial::quiet(libc::ENOENT))?;
            reopen(backing, flags).map(Some).map_err(Denial::quiet)
        }
        Op::Unlink => match tmpfiles.remove(path) {
            Some(_) => Ok(None),
            None => Err(Denial::quiet(libc::ENOENT)),
        },
        _ => {
            if exact_path || tmpfiles.contains_key(path) {
                Ok(None)
            } else {
                Err(Denial::quiet(libc::ENOENT))
            }
        }
    }
}

fn create_tmp(path: &[u8]) -> std::result::Result<OwnedFd, Denial> {
    let full = String::from_utf8_lossy(path);
    let mut end = full.len().min(MEMFD_NAME_MAX);
    while !full.is_char_boundary(end) {
        end -= 1;
    }
    let memfd = memfd::MemfdOptions::default()
        .close_on_exec(true)
        .create(&full[..end])
        .map_err(|err| {
            warn!("memfd_create for {} failed: {}", full, err);
            Denial::quiet(libc::ENOMEM)
        })?;
    Ok(OwnedFd::from(memfd.into_file()))
}

/// Open an independent description of a tmp file, so each open gets its
/// own offset and access mode.
fn reopen(backing: &OwnedFd, flags: i32) -> std::result::Result<OwnedFd, i32> {
    let proc_path = CString::new(format!("/proc/self/fd/{}", backing.as_raw_fd()))
        .map_err(|_| libc::EINVAL)?;
    let flags = (flags | libc::O_CLOEXEC | libc::O_NOCTTY) & !(libc::O_EXCL | libc::O_CREAT);
    let fd = unsafe { libc::open(proc_path.as_ptr(), flags) };
    if fd < 0 {
        return Err(last_errno());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn open_mount_dir(dir: &Path) -> std::io::Result<OwnedFd> {
    let cpath = CString::new(dir.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let fd = unsafe {
        libc::open(
            cpath.as_ptr(),
            libc::O_DIRECTORY | libc::O_PATH | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn last_component(path: &[u8]) -> &[u8] {
    match path.iter().rposition(|&b| b == b'/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

fn parent_with_slash(path: &[u8]) -> &[u8] {
    match path.iter().rposition(|&b| b == b'/') {
        Some(i) => &path[..=i],
        None => b"./",
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}

fn log_violation(path: &Path, write: bool) {
    warn!(
        "sandbox: denied {} {}",
        if write { "writing" } else { "reading" },
        path.display()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::sync::atomic::AtomicUsize;

    fn open(fs: &Filesystem, path: &str, flags: i32) -> std::result::Result<OwnedFd, i32> {
        fs.child_file(Op::Open, path.as_bytes(), flags, 0o644)
            .map(|fd| fd.expect("open returns a descriptor"))
    }

    fn counting(fs: &Filesystem) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        fs.set_violation_callback(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[test]
    fn deny_by_default_reports_once() {
        let fs = Filesystem::new();
        let count = counting(&fs);
        assert_eq!(open(&fs, "/etc/passwd", libc::O_RDONLY).unwrap_err(), libc::EACCES);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(fs.violations(), 1);
    }

    #[test]
    fn bad_flags_fail_before_lookup() {
        let fs = Filesystem::new();
        let count = counting(&fs);
        assert_eq!(open(&fs, "/x", libc::O_ACCMODE).unwrap_err(), libc::EINVAL);
        assert_eq!(open(&fs, "/x", libc::O_PATH).unwrap_err(), libc::EINVAL);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn traversal_is_denied_even_under_a_grant() {
        let dir = tempfile::tempdir().unwrap();
        let fs = Filesystem::new();
        fs.grant_native_at(format!("{}/", dir.path().display()), "/srv/", 10)
            .unwrap();
        let count = counting(&fs);
        assert_eq!(
            open(&fs, "/srv/../etc/shadow", libc::O_RDONLY).unwrap_err(),
            libc::EACCES
        );
        assert_eq!(open(&fs, "srv/x", libc::O_RDONLY).unwrap_err(), libc::EACCES);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn quiet_errno_rule() {
        let fs = Filesystem::new();
        fs.hide("/etc/ld.so.preload");
        let count = counting(&fs);
        assert_eq!(
            fs.child_file(Op::Access, b"/etc/ld.so.preload", libc::R_OK, 0)
                .unwrap_err(),
            libc::ENOENT
        );
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn native_read_only_grant() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.txt"), b"hello").unwrap();
        let fs = Filesystem::new();
        fs.grant_native_at(format!("{}/", dir.path().display()), "/srv/", 0)
            .unwrap();

        let fd = open(&fs, "/srv/data.txt", libc::O_RDONLY).unwrap();
        let mut text = String::new();
        std::fs::File::from(fd).read_to_string(&mut text).unwrap();
        assert_eq!(text, "hello");

        let count = counting(&fs);
        assert_eq!(
            open(&fs, "/srv/data.txt", libc::O_WRONLY).unwrap_err(),
            libc::EACCES
        );
        assert_eq!(
            fs.child_file(Op::Unlink, b"/srv/data.txt", 0, 0).unwrap_err(),
            libc::EACCES
        );
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(dir.path().join("data.txt").exists());
    }

    #[test]
    fn native_write_budget_is_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let fs = Filesystem::new();
        fs.grant_native_at(format!("{}/", dir.path().display()), "/out/", 1)
            .unwrap();

        let fd = open(&fs, "/out/new", libc::O_WRONLY | libc::O_CREAT).unwrap();
        std::fs::File::from(fd).write_all(b"x").unwrap();
        assert_eq!(std::fs::read(dir.path().join("new")).unwrap(), b"x");

        assert_eq!(
            fs.child_file(Op::Unlink, b"/out/new", 0, 0).unwrap_err(),
            libc::EACCES
        );
    }

    #[test]
    fn directory_grant_root_is_dot() {
        let dir = tempfile::tempdir().unwrap();
        let fs = Filesystem::new();
        fs.grant_native_at(format!("{}/", dir.path().display()), "/srv/", 0)
            .unwrap();
        let fd = open(&fs, "/srv", libc::O_RDONLY | libc::O_DIRECTORY).unwrap();
        let meta = std::fs::File::from(fd).metadata().unwrap();
        assert!(meta.is_dir());
        assert!(fs.child_file(Op::Access, b"/srv/", libc::R_OK, 0).is_ok());
    }

    #[test]
    fn single_file_grant_requires_matching_names() {
        let fs = Filesystem::new();
        assert!(fs.grant_native_at("/etc/hosts", "/etc/other", 0).is_err());
        assert!(fs.grant_native_at("/etc/hosts", "/x/hosts", 0).is_ok());
    }

    #[test]
    fn missing_host_directory_becomes_enoent() {
        let fs = Filesystem::new();
        assert!(fs.grant_native("/definitely/not/here/", 0).is_err());
        let count = counting(&fs);
        assert_eq!(
            open(&fs, "/definitely/not/here/x", libc::O_RDONLY).unwrap_err(),
            libc::ENOENT
        );
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn mount_handles_are_shared() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"").unwrap();
        std::fs::write(dir.path().join("b"), b"").unwrap();
        let fs = Filesystem::new();
        fs.grant_native(dir.path().join("a"), 0).unwrap();
        fs.grant_native(dir.path().join("b"), 0).unwrap();
        assert_eq!(fs.lock().mountfds.len(), 1);
    }

    #[test]
    fn tmp_budget_runs_out() {
        let fs = Filesystem::new();
        fs.grant_tmp("/tmp/", 2);
        let count = counting(&fs);
        let create = libc::O_RDWR | libc::O_CREAT;

        assert!(open(&fs, "/tmp/a", create).is_ok());
        assert!(open(&fs, "/tmp/b", create).is_ok());
        assert_eq!(open(&fs, "/tmp/c", create).unwrap_err(), libc::ENOMEM);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // an existing file does not need budget
        assert!(open(&fs, "/tmp/a", create).is_ok());
    }

    #[test]
    fn tmp_reopen_shares_data_not_offset() {
        let fs = Filesystem::new();
        fs.grant_tmp("/tmp/", 4);

        let mut first = std::fs::File::from(
            open(&fs, "/tmp/shared", libc::O_RDWR | libc::O_CREAT | libc::O_EXCL).unwrap(),
        );
        first.write_all(b"hello").unwrap();

        let mut second =
            std::fs::File::from(open(&fs, "/tmp/shared", libc::O_RDONLY).unwrap());
        let mut text = String::new();
        second.read_to_string(&mut text).unwrap();
        assert_eq!(text, "hello");
        assert_eq!(first.stream_position().unwrap(), 5);
        assert_eq!(second.seek(SeekFrom::Current(0)).unwrap(), 5);
    }

    #[test]
    fn tmp_read_of_missing_file_is_enoent() {
        let fs = Filesystem::new();
        fs.grant_tmp("/tmp/", 4);
        assert_eq!(open(&fs, "/tmp/none", libc::O_RDONLY).unwrap_err(), libc::ENOENT);
    }

    #[test]
    fn tmp_unlink_and_access() {
        let fs = Filesystem::new();
        fs.grant_tmp("/tmp/", 4);
        open(&fs, "/tmp/f", libc::O_WRONLY | libc::O_CREAT).unwrap();

        assert!(fs.child_file(Op::Access, b"/tmp/f", libc::F_OK, 0).is_ok());
        assert!(fs.child_file(Op::Access, b"/tmp", libc::F_OK, 0).is_ok());
        assert!(fs.child_file(Op::Unlink, b"/tmp/f", 0, 0).is_ok());
        assert_eq!(
            fs.child_file(Op::Unlink, b"/tmp/f", 0, 0).unwrap_err(),
            libc::ENOENT
        );
        assert_eq!(
            fs.child_file(Op::Access, b"/tmp/f", libc::F_OK, 0).unwrap_err(),
            libc::ENOENT
        );
    }

    #[test]
    fn long_tmp_names_fit_memfd_limit() {
        let fs = Filesystem::new();
        fs.grant_tmp("/tmp/", 1);
        let name = format!("/tmp/{}", "n".repeat(250));
        assert!(open(&fs, &name, libc::O_WRONLY | libc::O_CREAT).is_ok());
    }

    #[test]
    fn cwd_grant_maps_default_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("input"), b"1").unwrap();
        let fs = Filesystem::new();
        fs.grant_cwd(dir.path(), 0).unwrap();
        assert!(open(&fs, "/@CWD/input", libc::O_RDONLY).is_ok());
    }

    #[test]
    fn callback_sees_path_and_direction() {
        let fs = Filesystem::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        fs.set_violation_callback(move |path, write| {
            sink.lock().unwrap().push((path.to_path_buf(), write));
        });
        let _ = open(&fs, "/home/user", libc::O_WRONLY);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[(PathBuf::from("/home/user"), true)]);
    }
}
