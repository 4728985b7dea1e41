//! Small helpers shared by the host-side crates

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::{Result, SandboxError};

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Effective UID of the calling process
pub fn get_uid() -> u32 {
    unsafe { libc::geteuid() }
}

/// Effective GID of the calling process
pub fn get_gid() -> u32 {
    unsafe { libc::getegid() }
}

/// Resolve a program name to an absolute host path using `PATH` semantics.
///
/// Names containing a `/` are returned as given.
pub fn find_program(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        return Some(PathBuf::from(program));
    }

    let path_value = std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string());
    path_value
        .split(':')
        .map(|entry| if entry.is_empty() { "." } else { entry })
        .map(|dir| Path::new(dir).join(program))
        .find(|candidate| {
            candidate
                .metadata()
                .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
        })
}

/// Parse a human size such as `512M`, `1G` or `4096`.
pub fn parse_memory_size(s: &str) -> Result<u64> {
    let s = s.trim().to_uppercase();

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix('G') {
        (n, 1024u64 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('M') {
        (n, 1024u64 * 1024)
    } else if let Some(n) = s.strip_suffix('K') {
        (n, 1024u64)
    } else if let Some(n) = s.strip_suffix('B') {
        (n, 1u64)
    } else {
        (s.as_str(), 1u64)
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| SandboxError::InvalidConfig(format!("Invalid memory size: {}", s)))?;

    num.checked_mul(multiplier)
        .ok_or_else(|| SandboxError::InvalidConfig(format!("Memory size overflow: {}", s)))
}

const ERRNO_NAMES: &[(&str, i32)] = &[
    ("EPERM", libc::EPERM),
    ("ENOENT", libc::ENOENT),
    ("EIO", libc::EIO),
    ("ENOMEM", libc::ENOMEM),
    ("EACCES", libc::EACCES),
    ("EEXIST", libc::EEXIST),
    ("ENOTDIR", libc::ENOTDIR),
    ("EISDIR", libc::EISDIR),
    ("EINVAL", libc::EINVAL),
    ("ENOSPC", libc::ENOSPC),
    ("EROFS", libc::EROFS),
    ("ENOSYS", libc::ENOSYS),
];

/// Resolve an errno given either by name (`"ENOENT"`) or number (`"2"`).
pub fn parse_errno(s: &str) -> Result<i32> {
    let s = s.trim();
    if let Ok(n) = s.parse::<i32>() {
        return if (1..0x1000).contains(&n) {
            Ok(n)
        } else {
            Err(SandboxError::InvalidConfig(format!("errno out of range: {}", n)))
        };
    }
    ERRNO_NAMES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(s))
        .map(|(_, value)| *value)
        .ok_or_else(|| SandboxError::InvalidConfig(format!("Unknown errno name: {}", s)))
}

/// Symbolic name for an errno, for log lines.
pub fn errno_name(errno: i32) -> &'static str {
    ERRNO_NAMES
        .iter()
        .find(|(_, value)| *value == errno)
        .map(|(name, _)| *name)
        .unwrap_or("E?")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_size_bytes() {
        assert_eq!(parse_memory_size("100").unwrap(), 100);
        assert_eq!(parse_memory_size("100B").unwrap(), 100);
    }

    #[test]
    fn test_parse_memory_size_units() {
        assert_eq!(parse_memory_size("1K").unwrap(), 1024);
        assert_eq!(parse_memory_size("8m").unwrap(), 8 * 1024 * 1024);
        assert_eq!(parse_memory_size("1G").unwrap(), 1024 * 1024 * 1024);
    }

    #[test]
    fn test_parse_memory_size_invalid() {
        assert!(parse_memory_size("lots").is_err());
        assert!(parse_memory_size("99999999999999999999G").is_err());
    }

    #[test]
    fn test_parse_errno_by_name_and_number() {
        assert_eq!(parse_errno("ENOENT").unwrap(), libc::ENOENT);
        assert_eq!(parse_errno("eacces").unwrap(), libc::EACCES);
        assert_eq!(parse_errno("13").unwrap(), 13);
        assert!(parse_errno("0").is_err());
        assert!(parse_errno("EWHATEVER").is_err());
    }

    #[test]
    fn test_find_program() {
        assert_eq!(find_program("/bin/x").unwrap(), PathBuf::from("/bin/x"));
        let sh = find_program("sh").expect("sh on PATH");
        assert!(sh.is_absolute());
        assert!(find_program("definitely-not-a-real-program-xyz").is_none());
    }

    #[test]
    fn test_errno_name() {
        assert_eq!(errno_name(libc::ENOMEM), "ENOMEM");
        assert_eq!(errno_name(4000), "E?");
    }
}
