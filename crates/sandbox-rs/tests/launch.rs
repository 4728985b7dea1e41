//! End-to-end launch tests
//!
//! These need unprivileged user namespaces and a built `sandbox-preload`
//! next to the test binary (or named by `SANDBOX_PRELOAD`), so they are
//! ignored by default:
//!
//! ```text
//! (cd crates/sandbox-preload && cargo build)
//! cargo test -p sandbox-rs -- --ignored
//! ```

use sandbox_rs::{EmulatorImage, SandboxBuilder, StreamChunk, SystemCapabilities};
use std::fs;
use std::time::Duration;

fn ready() -> bool {
    let caps = SystemCapabilities::detect();
    if !caps.can_launch() {
        eprintln!("skipping: {}", caps.summary());
        return false;
    }
    if EmulatorImage::locate().is_err() {
        eprintln!("skipping: sandbox-preload not built");
        return false;
    }
    true
}

#[test]
#[ignore]
fn true_exits_zero() {
    if !ready() {
        return;
    }
    let mut sandbox = SandboxBuilder::new("e2e-true")
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap();
    let result = sandbox.run("true", &[]).unwrap();
    assert!(result.success(), "{:?}", result);
    assert_eq!(result.violations, 0);
}

#[test]
#[ignore]
fn granted_file_is_readable() {
    if !ready() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("hello.txt"), "hello from the host\n").unwrap();

    let mut sandbox = SandboxBuilder::new("e2e-cat")
        .grant_native_at(format!("{}/", dir.path().display()), "/data/", 0)
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap();
    let stream = sandbox.run_with_stream("cat", &["/data/hello.txt"]).unwrap();

    let mut lines = Vec::new();
    let mut exit = None;
    for chunk in stream {
        match chunk {
            StreamChunk::Stdout(line) => lines.push(line),
            StreamChunk::Stderr(_) => {}
            StreamChunk::Exit { exit_code, .. } => exit = Some(exit_code),
        }
    }
    assert_eq!(exit, Some(0));
    assert_eq!(lines, vec!["hello from the host".to_string()]);
}

#[test]
#[ignore]
fn ungranted_file_is_denied() {
    if !ready() {
        return;
    }
    let mut sandbox = SandboxBuilder::new("e2e-denied")
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap();
    let result = sandbox.run("cat", &["/etc/shadow"]).unwrap();
    assert_ne!(result.exit_code, 0);
    assert!(result.violations >= 1);
}

#[test]
#[ignore]
fn runaway_program_times_out() {
    if !ready() {
        return;
    }
    let mut sandbox = SandboxBuilder::new("e2e-timeout")
        .timeout(Duration::from_millis(500))
        .build()
        .unwrap();
    let result = sandbox.run("sleep", &["30"]).unwrap();
    assert!(result.timed_out);
    assert_eq!(result.signal, Some(libc::SIGKILL));
}
