//! Seccomp enforcement tests
//!
//! These tests verify that the trap filter actually raises SIGSYS for
//! mediated syscalls and lets the passthrough set run. They do NOT require
//! root, seccomp only needs PR_SET_NO_NEW_PRIVS.
//!
//! Each test forks a child process, applies the filter, and reports back
//! through its exit status.

use std::sync::atomic::{AtomicUsize, Ordering};

use sandbox_seccomp::{SeccompBpf, TrapFilter};

static TRAPS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn count_sigsys(_: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) {
    TRAPS.fetch_add(1, Ordering::SeqCst);
}

unsafe fn install_counter() {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = count_sigsys as usize;
        sa.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER;
        libc::sigaction(libc::SIGSYS, &sa, std::ptr::null_mut());
    }
}

fn wait_exit_code(pid: libc::pid_t) -> i32 {
    let mut status: i32 = 0;
    let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
    assert_eq!(ret, pid);
    assert!(
        libc::WIFEXITED(status),
        "Child should have exited normally, status=0x{:x}",
        status
    );
    libc::WEXITSTATUS(status)
}

/// Without a handler, a trapped syscall terminates the process with SIGSYS.
#[test]
fn trap_filter_kills_without_handler() {
    let program = SeccompBpf::compile_to_bpf(&TrapFilter::new()).unwrap();
    unsafe {
        let pid = libc::fork();
        assert!(pid >= 0, "fork failed: {}", std::io::Error::last_os_error());

        if pid == 0 {
            if SeccompBpf::install(&program).is_err() {
                libc::_exit(99);
            }
            libc::syscall(libc::SYS_openat, libc::AT_FDCWD, c"/etc/passwd".as_ptr(), 0);
            libc::_exit(42);
        } else {
            let mut status: i32 = 0;
            libc::waitpid(pid, &mut status, 0);
            assert!(
                libc::WIFSIGNALED(status),
                "Child should have been killed by signal, status=0x{:x}",
                status
            );
            assert_eq!(libc::WTERMSIG(status), libc::SIGSYS);
        }
    }
}

/// A trapped syscall is skipped and reaches the SIGSYS handler; the caller
/// then sees ENOSYS because the handler leaves the return register alone.
#[test]
fn trapped_syscall_reaches_handler() {
    let program = SeccompBpf::compile_to_bpf(&TrapFilter::new()).unwrap();
    unsafe {
        let pid = libc::fork();
        assert!(pid >= 0, "fork failed");

        if pid == 0 {
            install_counter();
            if SeccompBpf::install(&program).is_err() {
                libc::_exit(99);
            }
            let mut buf = [0u8; 64];
            let ret = libc::syscall(libc::SYS_getcwd, buf.as_mut_ptr(), buf.len());
            let errno = *libc::__errno_location();
            if ret != -1 || errno != libc::ENOSYS {
                libc::_exit(2);
            }
            if TRAPS.load(Ordering::SeqCst) != 1 {
                libc::_exit(3);
            }
            libc::_exit(0);
        } else {
            assert_eq!(wait_exit_code(pid), 0);
        }
    }
}

/// Passthrough syscalls do not trap.
#[test]
fn passthrough_syscalls_run() {
    let program = SeccompBpf::compile_to_bpf(&TrapFilter::new()).unwrap();
    unsafe {
        let pid = libc::fork();
        assert!(pid >= 0, "fork failed");

        if pid == 0 {
            install_counter();
            if SeccompBpf::install(&program).is_err() {
                libc::_exit(99);
            }
            let _ = libc::getpid();
            let mut fds = [0i32; 2];
            if libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) != 0 {
                libc::_exit(2);
            }
            if libc::write(fds[1], b"ok".as_ptr().cast(), 2) != 2 {
                libc::_exit(3);
            }
            libc::_exit(TRAPS.load(Ordering::SeqCst) as i32);
        } else {
            assert_eq!(wait_exit_code(pid), 0);
        }
    }
}

/// execveat passes only through the gate page; any other pathname traps.
#[test]
fn execveat_outside_gate_traps() {
    let program = SeccompBpf::compile_to_bpf(&TrapFilter::new()).unwrap();
    unsafe {
        let pid = libc::fork();
        assert!(pid >= 0, "fork failed");

        if pid == 0 {
            install_counter();
            if SeccompBpf::install(&program).is_err() {
                libc::_exit(99);
            }
            let argv: [*const libc::c_char; 1] = [std::ptr::null()];
            libc::syscall(
                libc::SYS_execveat,
                -1,
                c"".as_ptr(),
                argv.as_ptr(),
                argv.as_ptr(),
                libc::AT_EMPTY_PATH,
            );
            libc::_exit(TRAPS.load(Ordering::SeqCst) as i32);
        } else {
            assert_eq!(wait_exit_code(pid), 1);
        }
    }
}

/// fork-style clone traps, thread-style clone flags do not match the trap.
#[test]
fn plain_fork_traps() {
    let program = SeccompBpf::compile_to_bpf(&TrapFilter::new()).unwrap();
    unsafe {
        let pid = libc::fork();
        assert!(pid >= 0, "fork failed");

        if pid == 0 {
            install_counter();
            if SeccompBpf::install(&program).is_err() {
                libc::_exit(99);
            }
            let ret = libc::syscall(libc::SYS_clone, libc::SIGCHLD, 0, 0, 0, 0);
            if ret == 0 {
                // only reachable if the filter let a plain fork through
                libc::_exit(7);
            }
            libc::_exit(TRAPS.load(Ordering::SeqCst) as i32);
        } else {
            assert_eq!(wait_exit_code(pid), 1);
        }
    }
}

/// The emulator's own fork passes; the same flags with a parent tid pointer trap.
#[test]
fn emulator_fork_flags_pass() {
    use sandbox_protocol::FORK_CLONE_FLAGS;

    let program = SeccompBpf::compile_to_bpf(&TrapFilter::new()).unwrap();
    unsafe {
        let pid = libc::fork();
        assert!(pid >= 0, "fork failed");

        if pid == 0 {
            install_counter();
            if SeccompBpf::install(&program).is_err() {
                libc::_exit(99);
            }
            let ret = libc::syscall(libc::SYS_clone, FORK_CLONE_FLAGS, 0, 0, 0, 0);
            if ret == 0 {
                libc::_exit(0);
            }
            if ret < 0 {
                libc::_exit(10);
            }
            let mut status = 0;
            if libc::waitpid(ret as libc::pid_t, &mut status, 0) != ret as libc::pid_t
                || !libc::WIFEXITED(status)
                || libc::WEXITSTATUS(status) != 0
            {
                libc::_exit(11);
            }

            let mut tid = 0i32;
            let ret = libc::syscall(
                libc::SYS_clone,
                FORK_CLONE_FLAGS,
                0,
                &mut tid as *mut i32,
                0,
                0,
            );
            if ret == 0 {
                libc::_exit(7);
            }
            libc::_exit(TRAPS.load(Ordering::SeqCst) as i32);
        } else {
            assert_eq!(wait_exit_code(pid), 1);
        }
    }
}
