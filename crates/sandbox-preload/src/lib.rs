//! sandbox-preload: the first code that runs inside the sandbox
//!
//! The launcher `execveat`s this image instead of the target program. It
//! installs a `SIGSYS` handler that turns trapped syscalls into broker
//! requests over the control socket, maps the real dynamic linker by hand,
//! and jumps to it with the original stack so it loads `argv[1]` as the
//! main program.
//!
//! Everything here is freestanding: raw syscalls, no allocator, no libc.

#![cfg_attr(not(test), no_std)]

#[cfg(not(target_arch = "x86_64"))]
compile_error!("sandbox-preload only supports x86_64 Linux");

pub mod bootstrap;
pub mod channel;
pub mod context;
pub mod emulator;
pub mod exec;
pub mod loader;
pub mod path;
pub mod sync;
pub mod sys;

#[cfg(test)]
mod testing;
