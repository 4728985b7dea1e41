//! Seccomp BPF filter compilation and loading using seccompiler

use crate::profile::TrapFilter;
use crate::syscall_table::get_syscall_number_from_name;
use sandbox_core::{Result, SandboxError};
use sandbox_protocol::{FORK_CLONE_FLAGS, GATE_PATH};
use seccompiler::{
    BpfProgram, SeccompAction, SeccompCmpArgLen, SeccompCmpOp, SeccompCondition,
    SeccompFilter as SeccompilerFilter, SeccompRule, apply_filter,
};
use std::collections::BTreeMap;
use std::convert::TryInto;

/// Seccomp BPF filter compiler and loader
pub struct SeccompBpf;

impl SeccompBpf {
    /// Compile filter to a BpfProgram ready for [`SeccompBpf::install`].
    ///
    /// Unmatched syscalls trap. `clone` passes only with `CLONE_THREAD` set
    /// or as the emulator's own fork ([`FORK_CLONE_FLAGS`]);
    /// `execveat` passes only with the gate-page pathname and
    /// `AT_EMPTY_PATH`, so the emulator's hand-built exec is the only way to
    /// replace the image.
    pub fn compile_to_bpf(filter: &TrapFilter) -> Result<BpfProgram> {
        filter.validate()?;

        let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();
        for syscall_name in filter.allowed_syscalls() {
            match get_syscall_number_from_name(syscall_name) {
                Some(num) => {
                    rules.entry(num).or_default();
                }
                None => {
                    return Err(SandboxError::Seccomp(format!(
                        "Unknown syscall to allow: '{}'. This syscall is not supported on this architecture.",
                        syscall_name
                    )));
                }
            }
        }

        let thread_only = condition(
            0,
            SeccompCmpArgLen::Qword,
            SeccompCmpOp::MaskedEq(libc::CLONE_THREAD as u64),
            libc::CLONE_THREAD as u64,
        )?;
        let fork_flags = condition(0, SeccompCmpArgLen::Qword, SeccompCmpOp::Eq, FORK_CLONE_FLAGS)?;
        let no_parent_tid = condition(2, SeccompCmpArgLen::Qword, SeccompCmpOp::Eq, 0)?;
        rules.insert(
            libc::SYS_clone,
            vec![rule(vec![thread_only])?, rule(vec![fork_flags, no_parent_tid])?],
        );

        let gate_path = condition(1, SeccompCmpArgLen::Qword, SeccompCmpOp::Eq, GATE_PATH as u64)?;
        let empty_path = condition(
            4,
            SeccompCmpArgLen::Dword,
            SeccompCmpOp::Eq,
            libc::AT_EMPTY_PATH as u64,
        )?;
        rules.insert(libc::SYS_execveat, vec![rule(vec![gate_path, empty_path])?]);

        let seccompiler_filter = SeccompilerFilter::new(
            rules,
            SeccompAction::Trap,
            SeccompAction::Allow,
            seccompiler::TargetArch::x86_64,
        )
        .map_err(|e| SandboxError::Seccomp(format!("Failed to create filter: {}", e)))?;

        let bpf_program: BpfProgram = seccompiler_filter
            .try_into()
            .map_err(|e| SandboxError::Seccomp(format!("Failed to compile filter: {}", e)))?;

        log::debug!("compiled trap filter: {} instructions", bpf_program.len());
        Ok(bpf_program)
    }

    /// Install an already compiled program on the calling thread.
    ///
    /// Sets `PR_SET_NO_NEW_PRIVS` first. Performs no allocation, so it is
    /// usable between `clone` and `execve`; failure is reported as a raw
    /// errno for the same reason.
    pub fn install(program: &BpfProgram) -> std::result::Result<(), i32> {
        apply_filter(program)
            .map_err(|_| std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EPERM))
    }
}

fn condition(
    arg: u8,
    len: SeccompCmpArgLen,
    op: SeccompCmpOp,
    value: u64,
) -> Result<SeccompCondition> {
    SeccompCondition::new(arg, len, op, value)
        .map_err(|e| SandboxError::Seccomp(format!("Invalid condition: {}", e)))
}

fn rule(conditions: Vec<SeccompCondition>) -> Result<SeccompRule> {
    SeccompRule::new(conditions).map_err(|e| SandboxError::Seccomp(format!("Invalid rule: {}", e)))
}
