//! Grants a dynamically linked program needs to start

use log::debug;
use sandbox_core::util::find_program;

use crate::filesystem::Filesystem;

/// Loader, C runtime, and the handful of files they touch at startup
const NATIVE: &[&str] = &[
    "/lib64/ld-linux-x86-64.so.2",
    "/usr/lib/x86_64-linux-gnu/libstdc++.so.6",
    "/lib/x86_64-linux-gnu/libdl.so.2",
    "/lib/x86_64-linux-gnu/libpthread.so.0",
    "/lib/x86_64-linux-gnu/libc.so.6",
    "/lib/x86_64-linux-gnu/libm.so.6",
    "/lib/x86_64-linux-gnu/libgcc_s.so.1",
    "/lib/x86_64-linux-gnu/libselinux.so.1",
    "/lib/x86_64-linux-gnu/libpcre.so.3",
    "/bin/sh",
    "/dev/urandom",
    "/etc/ld.so.cache",
];

/// Probed by the loader and libc; absent is the expected answer
const HIDDEN: &[&str] = &[
    "/etc/ld.so.nohwcap",
    "/etc/ld.so.preload",
    "/usr/share/locale/",
    "/usr/share/locale-langpack/",
    "/usr/lib/locale/",
];

/// Files `/tmp/` may hold
const TMP_BUDGET: u32 = 100;

impl Filesystem {
    /// Grant the standard runtime bundle, plus `exe` read-only if given.
    ///
    /// Grants whose host directory is missing are skipped.
    pub fn grant_syslibs(&self, exe: Option<&str>) {
        for path in NATIVE {
            if let Err(err) = self.grant_native(path, 0) {
                debug!("syslib {} skipped: {}", path, err);
            }
        }
        self.grant_errno("/dev/", libc::EACCES, false);
        for path in HIDDEN {
            self.hide(path);
        }
        self.grant_tmp("/tmp/", TMP_BUDGET);

        if let Some(exe) = exe {
            match find_program(exe) {
                Some(path) => {
                    if let Err(err) = self.grant_native(&path, 0) {
                        debug!("program {} not granted: {}", path.display(), err);
                    }
                }
                None => debug!("program {} not found on PATH", exe),
            }
        }
    }
}
