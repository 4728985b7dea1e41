//! Process entry: recover the initial stack, then hand over to ld-linux

use linux_raw_sys::general::{O_CLOEXEC, O_RDONLY};

use crate::emulator;
use crate::loader::{self, HEADER_WINDOW, LoadError};
use crate::sys;

const DYNAMIC_LINKER: &[u8] = b"/lib64/ld-linux-x86-64.so.2\0";

/// Called from `_start` with the kernel's initial stack pointer; returns
/// the dynamic linker's entry point for `_start` to jump to.
///
/// # Safety
/// `sp` must be the untouched initial process stack:
/// `argc, argv..., NULL, envp..., NULL, auxv...`.
pub unsafe extern "C" fn bootstrap_start(sp: *mut usize) -> usize {
    let argc = unsafe { *sp };
    let argv = unsafe { sp.add(1) };
    let envp = unsafe { argv.add(argc + 1) };
    let mut end = envp;
    while unsafe { *end } != 0 {
        end = unsafe { end.add(1) };
    }
    let auxv = unsafe { end.add(1) };

    unsafe { emulator::install(envp as *const *const u8) };

    match unsafe { load_dynamic_linker(auxv) } {
        Ok(entry) => entry,
        Err(err) => sys::fatal(format_args!("{}", err)),
    }
}

/// Map ld-linux and make the auxiliary vector describe it.
///
/// The open goes through the SIGSYS handler like any other, so the broker
/// decides whether the loader is visible at all.
unsafe fn load_dynamic_linker(auxv: *mut usize) -> Result<usize, LoadError> {
    let fd = unsafe { sys::open(DYNAMIC_LINKER.as_ptr(), O_RDONLY | O_CLOEXEC, 0) }
        .map_err(LoadError::Open)?;

    let mapped = read_window(fd).and_then(|(window, len)| {
        let plan = loader::plan(&window[..len])?;
        let base = loader::map(fd, &plan)?;
        Ok((plan, base))
    });
    sys::close(fd);
    let (plan, base) = mapped?;

    unsafe { loader::patch_auxv(auxv, base, &plan) };
    Ok(base + plan.entry)
}

fn read_window(fd: i32) -> Result<([u8; HEADER_WINDOW], usize), LoadError> {
    let mut window = [0u8; HEADER_WINDOW];
    let mut filled = 0;
    while filled < window.len() {
        match sys::read(fd, &mut window[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err == linux_raw_sys::errno::EINTR as i32 => {}
            Err(err) => return Err(LoadError::Read(err)),
        }
    }
    Ok((window, filled))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_reads_up_to_its_size() {
        let _slots = crate::testing::lock_fd_slots();
        let Ok(file) = std::fs::File::open("/lib64/ld-linux-x86-64.so.2") else {
            return;
        };
        let fd = std::os::fd::AsRawFd::as_raw_fd(&file);
        let (window, len) = read_window(fd).unwrap();
        assert_eq!(len, HEADER_WINDOW);
        assert_eq!(&window[..4], b"\x7fELF");
    }

    #[test]
    fn short_files_stop_at_eof() {
        let _slots = crate::testing::lock_fd_slots();
        let file = crate::testing::scratch_file("window", b"\x7fELF tiny");
        let (_, len) = read_window(std::os::fd::AsRawFd::as_raw_fd(&file)).unwrap();
        assert_eq!(len, 9);
    }
}
