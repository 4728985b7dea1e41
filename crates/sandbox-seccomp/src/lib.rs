//! sandbox-seccomp: trap-by-default syscall filtering
//!
//! The child runs under a filter that allows a fixed set of harmless
//! syscalls and raises `SIGSYS` for everything else, so the in-child
//! emulator can forward filesystem access to the broker. Building the
//! filter allocates; installing it does not, so the program is compiled in
//! the parent before `clone` and only installed in the child.

pub mod bpf;
pub mod profile;
pub mod syscall_table;

pub use bpf::SeccompBpf;
pub use profile::TrapFilter;
pub use seccompiler::BpfProgram;
