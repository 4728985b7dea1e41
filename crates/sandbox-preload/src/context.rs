//! The register file a `SIGSYS` interrupted.
//!
//! Emulation only sees [`Trapped`] and the accessors on [`TrapContext`];
//! a port to another architecture adds its own layout here.

use core::ffi::c_void;

/// The trapped syscall: number and six argument registers
#[derive(Debug, Clone, Copy)]
pub struct Trapped {
    pub nr: usize,
    pub args: [usize; 6],
}

#[cfg(target_arch = "x86_64")]
mod arch {
    /// Byte offset of `uc_mcontext.gregs` inside `ucontext_t`
    pub const GREGS_OFFSET: usize = 40;

    pub const REG_R8: usize = 0;
    pub const REG_R9: usize = 1;
    pub const REG_R10: usize = 2;
    pub const REG_RDI: usize = 8;
    pub const REG_RSI: usize = 9;
    pub const REG_RDX: usize = 12;
    pub const REG_RAX: usize = 13;
    pub const REG_RSP: usize = 15;

    pub const NR: usize = REG_RAX;
    pub const ARGS: [usize; 6] = [REG_RDI, REG_RSI, REG_RDX, REG_R10, REG_R8, REG_R9];
    pub const RET: usize = REG_RAX;
    pub const SP: usize = REG_RSP;
}

/// Saved general registers of the interrupted thread
pub struct TrapContext {
    gregs: *mut usize,
}

impl TrapContext {
    /// # Safety
    /// `ucontext` is the third argument of an `SA_SIGINFO` handler and
    /// outlives the returned value.
    pub unsafe fn from_ucontext(ucontext: *mut c_void) -> Self {
        let gregs = unsafe { ucontext.cast::<u8>().add(arch::GREGS_OFFSET).cast() };
        Self { gregs }
    }

    fn get(&self, reg: usize) -> usize {
        unsafe { *self.gregs.add(reg) }
    }

    fn set(&mut self, reg: usize, value: usize) {
        unsafe { *self.gregs.add(reg) = value };
    }

    pub fn syscall(&self) -> Trapped {
        Trapped {
            nr: self.get(arch::NR),
            args: arch::ARGS.map(|reg| self.get(reg)),
        }
    }

    /// What the interrupted syscall appears to return
    pub fn set_return(&mut self, ret: isize) {
        self.set(arch::RET, ret as usize);
    }

    /// Resume on a different stack
    pub fn set_stack(&mut self, sp: usize) {
        self.set(arch::SP, sp);
    }
}
