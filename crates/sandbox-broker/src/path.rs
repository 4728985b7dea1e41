//! Request path and flag checks applied before any mount lookup

use sandbox_protocol::Op;

/// Open flags a child may pass; anything else is answered with `EINVAL`.
pub const ALLOWED_OPEN_FLAGS: i32 = libc::O_ACCMODE
    | libc::O_APPEND
    | libc::O_ASYNC
    | libc::O_CLOEXEC
    | libc::O_CREAT
    | libc::O_DIRECTORY
    | libc::O_EXCL
    | libc::O_LARGEFILE
    | libc::O_NOATIME
    | libc::O_NOCTTY
    | libc::O_NOFOLLOW
    | libc::O_NONBLOCK
    | libc::O_TRUNC;

/// Reject flag words the broker will not forward to `openat`.
pub fn check_open_flags(flags: i32) -> Result<(), i32> {
    if flags & !ALLOWED_OPEN_FLAGS != 0 {
        return Err(libc::EINVAL);
    }
    if flags & libc::O_ACCMODE == libc::O_ACCMODE {
        return Err(libc::EINVAL);
    }
    Ok(())
}

/// Whether a request may modify the filesystem.
///
/// `Unlink` always writes and `Access` never does; `Open` writes when the
/// access mode is not read-only or `O_CREAT`/`O_TRUNC` is present.
pub fn is_write(op: Op, flags: i32) -> bool {
    match op {
        Op::Open => {
            flags & libc::O_ACCMODE != libc::O_RDONLY
                || flags & (libc::O_CREAT | libc::O_TRUNC) != 0
        }
        Op::Unlink => true,
        _ => false,
    }
}

/// True for paths the broker refuses to resolve at all: relative paths,
/// `.`/`..` components, and empty components.
pub fn is_traversal(path: &[u8]) -> bool {
    if path.first() != Some(&b'/') {
        return true;
    }
    contains(path, b"/./")
        || contains(path, b"/../")
        || contains(path, b"//")
        || path.ends_with(b"/.")
        || path.ends_with(b"/..")
}

/// Strip every trailing `/`; `/` itself becomes the empty string.
pub fn strip_trailing_slashes(path: &[u8]) -> &[u8] {
    let end = path.iter().rposition(|&b| b != b'/').map_or(0, |i| i + 1);
    &path[..end]
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traversal_patterns() {
        for path in [
            &b"relative"[..],
            b"",
            b"/srv/../etc/shadow",
            b"/srv/./x",
            b"/srv/..",
            b"/srv/.",
            b"/..",
            b"/srv//x",
        ] {
            assert!(is_traversal(path), "{:?}", path.escape_ascii().to_string());
        }
    }

    #[test]
    fn ordinary_paths_pass() {
        for path in [&b"/"[..], b"/srv", b"/srv/", b"/srv/.hidden", b"/srv/a..b", b"/a/..b/c"] {
            assert!(!is_traversal(path));
        }
    }

    #[test]
    fn write_classification() {
        assert!(!is_write(Op::Open, libc::O_RDONLY));
        assert!(is_write(Op::Open, libc::O_WRONLY));
        assert!(is_write(Op::Open, libc::O_RDWR));
        assert!(is_write(Op::Open, libc::O_RDONLY | libc::O_CREAT));
        assert!(is_write(Op::Open, libc::O_RDONLY | libc::O_TRUNC));
        assert!(is_write(Op::Unlink, 0));
        assert!(!is_write(Op::Access, libc::W_OK));
    }

    #[test]
    fn flag_allowlist() {
        assert!(check_open_flags(libc::O_RDONLY | libc::O_CLOEXEC).is_ok());
        assert!(check_open_flags(libc::O_WRONLY | libc::O_CREAT | libc::O_EXCL).is_ok());
        assert_eq!(check_open_flags(libc::O_ACCMODE), Err(libc::EINVAL));
        assert_eq!(check_open_flags(libc::O_PATH), Err(libc::EINVAL));
        assert_eq!(check_open_flags(libc::O_TMPFILE), Err(libc::EINVAL));
    }

    #[test]
    fn trailing_slashes() {
        assert_eq!(strip_trailing_slashes(b"/srv///"), b"/srv");
        assert_eq!(strip_trailing_slashes(b"/"), b"");
        assert_eq!(strip_trailing_slashes(b"/a/b"), b"/a/b");
    }
}
