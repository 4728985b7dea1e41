//! The sealed in-memory copy of the preload binary
//!
//! Every child receives the same descriptor at slot 4 and executes it with
//! `execveat(AT_EMPTY_PATH)`. Seals make it immutable, so one copy is
//! shared by all children of the process.

use std::fs::File;
use std::io::Write;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use log::debug;
use memfd::{FileSeal, MemfdOptions};
use sandbox_core::{Result, SandboxError};

/// Environment variable naming the preload binary
pub const PRELOAD_ENV: &str = "SANDBOX_PRELOAD";

/// File name looked for next to the current executable
pub const PRELOAD_NAME: &str = "sandbox-preload";

static SHARED: OnceLock<EmulatorImage> = OnceLock::new();

/// Read-only handle to the bootstrap loader and syscall emulator
#[derive(Debug, Clone)]
pub struct EmulatorImage {
    fd: Arc<OwnedFd>,
}

impl EmulatorImage {
    /// Copy `bytes` into a new sealed memfd.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if !bytes.starts_with(b"\x7fELF") {
            return Err(SandboxError::Launch(
                "emulator image is not an ELF file".to_string(),
            ));
        }

        let memfd = MemfdOptions::default()
            .close_on_exec(true)
            .allow_sealing(true)
            .create(PRELOAD_NAME)
            .map_err(|e| SandboxError::Launch(format!("memfd_create: {}", e)))?;
        memfd.as_file().write_all(bytes)?;
        for seal in [
            FileSeal::SealShrink,
            FileSeal::SealGrow,
            FileSeal::SealWrite,
            FileSeal::SealSeal,
        ] {
            memfd
                .add_seal(seal)
                .map_err(|e| SandboxError::Launch(format!("sealing emulator image: {}", e)))?;
        }

        // children get a read-only description of the sealed file
        let sealed = memfd.into_file();
        let readonly = File::open(format!("/proc/self/fd/{}", sealed.as_raw_fd()))
            .map_err(|e| SandboxError::Launch(format!("reopening emulator image: {}", e)))?;

        Ok(Self {
            fd: Arc::new(OwnedFd::from(readonly)),
        })
    }

    /// Load the preload binary from `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            SandboxError::Launch(format!("cannot read {}: {}", path.display(), e))
        })?;
        debug!("loaded emulator image {} ({} bytes)", path.display(), bytes.len());
        Self::from_bytes(&bytes)
    }

    /// Where the preload binary is expected: `$SANDBOX_PRELOAD`, else
    /// `sandbox-preload` beside the current executable or one level up
    /// (cargo puts test binaries in `deps/`).
    pub fn locate() -> Result<PathBuf> {
        if let Some(path) = std::env::var_os(PRELOAD_ENV) {
            return Ok(PathBuf::from(path));
        }

        let exe = std::env::current_exe()?;
        let mut dir = exe.parent();
        for _ in 0..2 {
            let Some(current) = dir else { break };
            let candidate = current.join(PRELOAD_NAME);
            if candidate.is_file() {
                return Ok(candidate);
            }
            dir = current.parent();
        }

        Err(SandboxError::FeatureNotAvailable(format!(
            "{} not found; build it or set {}",
            PRELOAD_NAME, PRELOAD_ENV
        )))
    }

    /// The process-wide image, loaded from [`EmulatorImage::locate`] on
    /// first use.
    pub fn shared() -> Result<Self> {
        if let Some(image) = SHARED.get() {
            return Ok(image.clone());
        }
        let image = Self::load(Self::locate()?)?;
        // a racing thread may have won; either copy is equivalent
        Ok(SHARED.get_or_init(|| image).clone())
    }

    pub fn fd(&self) -> &Arc<OwnedFd> {
        &self.fd
    }
}

impl AsFd for EmulatorImage {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
