//! The mount table: sandbox path prefixes mapped to rules

use std::collections::BTreeMap;
use std::fmt;
use std::os::fd::OwnedFd;
use std::sync::Arc;

/// What a mount-table entry does with a matching request
#[derive(Clone)]
pub enum MountKind {
    /// Resolve against a host directory handle opened `O_PATH`.
    /// `write_budget` is the number of write requests still allowed.
    Native {
        dir: Arc<OwnedFd>,
        write_budget: u32,
    },
    /// Serve from in-memory files; `budget` counts files that may still be
    /// created.
    Tmp { budget: u32 },
    /// Fail with `errno`; `noisy` rules also report a violation.
    Error { errno: i32, noisy: bool },
}

impl fmt::Debug for MountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountKind::Native { dir, write_budget } => f
                .debug_struct("Native")
                .field("dir", &std::os::fd::AsRawFd::as_raw_fd(dir.as_ref()))
                .field("write_budget", write_budget)
                .finish(),
            MountKind::Tmp { budget } => f.debug_struct("Tmp").field("budget", budget).finish(),
            MountKind::Error { errno, noisy } => f
                .debug_struct("Error")
                .field("errno", errno)
                .field("noisy", noisy)
                .finish(),
        }
    }
}

/// Result of a longest-prefix lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountMatch {
    /// Key of the winning rule
    pub key: Vec<u8>,
    /// Length of the directory part of the key, trailing `/` included.
    /// Bytes of the request beyond this are the path relative to the rule.
    pub prefix_len: usize,
    /// The request named the rule's directory itself
    pub exact_path: bool,
}

/// Sandbox-visible paths mapped to rules.
///
/// Keys ending in `/` are directory rules and match everything below them;
/// other keys match only themselves. The table always holds a `/` rule.
#[derive(Debug, Clone)]
pub struct MountTable {
    rules: BTreeMap<Vec<u8>, MountKind>,
}

impl Default for MountTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MountTable {
    /// Table that denies everything with a reported `EACCES`
    pub fn new() -> Self {
        let mut rules = BTreeMap::new();
        rules.insert(
            b"/".to_vec(),
            MountKind::Error {
                errno: libc::EACCES,
                noisy: true,
            },
        );
        Self { rules }
    }

    /// Insert or replace the rule for `key`
    pub fn insert(&mut self, key: impl Into<Vec<u8>>, kind: MountKind) {
        self.rules.insert(key.into(), kind);
    }

    pub fn get(&self, key: &[u8]) -> Option<&MountKind> {
        self.rules.get(key)
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut MountKind> {
        self.rules.get_mut(key)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &MountKind)> {
        self.rules.iter().map(|(k, v)| (k.as_slice(), v))
    }

    /// Longest matching rule for `path`, which must already have had its
    /// trailing slashes stripped (so `/` arrives as the empty string).
    pub fn lookup(&self, path: &[u8]) -> Option<MountMatch> {
        let mut best: Option<MountMatch> = None;
        let mut best_len = 0usize;

        for key in self.rules.keys() {
            if best.is_some() && key.len() <= best_len {
                continue;
            }
            let exact_path;
            if key.ends_with(b"/") {
                let dir = &key[..key.len() - 1];
                if path == dir {
                    exact_path = true;
                } else if path.starts_with(key) {
                    exact_path = false;
                } else {
                    continue;
                }
            } else if path == key.as_slice() {
                exact_path = false;
            } else {
                continue;
            }

            best_len = key.len();
            let prefix_len = key.iter().rposition(|&b| b == b'/').map_or(0, |i| i + 1);
            best = Some(MountMatch {
                key: key.clone(),
                prefix_len,
                exact_path,
            });
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet(errno: i32) -> MountKind {
        MountKind::Error {
            errno,
            noisy: false,
        }
    }

    #[test]
    fn root_rule_catches_everything() {
        let table = MountTable::new();
        let m = table.lookup(b"/etc/passwd").unwrap();
        assert_eq!(m.key, b"/");
        assert_eq!(m.prefix_len, 1);
        assert!(!m.exact_path);

        let root = table.lookup(b"").unwrap();
        assert_eq!(root.key, b"/");
        assert!(root.exact_path);
    }

    #[test]
    fn longest_prefix_wins() {
        let mut table = MountTable::new();
        table.insert(&b"/a/"[..], quiet(libc::ENOENT));
        table.insert(&b"/a/b/"[..], quiet(libc::EPERM));

        let m = table.lookup(b"/a/b/c").unwrap();
        assert_eq!(m.key, b"/a/b/");
        assert_eq!(m.prefix_len, 5);
        assert_eq!(&b"/a/b/c"[m.prefix_len..], b"c");

        assert_eq!(table.lookup(b"/a/x").unwrap().key, b"/a/");
        assert_eq!(table.lookup(b"/ab").unwrap().key, b"/");
    }

    #[test]
    fn directory_rule_matches_its_own_path() {
        let mut table = MountTable::new();
        table.insert(&b"/srv/"[..], quiet(libc::ENOENT));
        let m = table.lookup(b"/srv").unwrap();
        assert_eq!(m.key, b"/srv/");
        assert!(m.exact_path);
        assert!(m.prefix_len > b"/srv".len());
    }

    #[test]
    fn file_rule_matches_only_itself() {
        let mut table = MountTable::new();
        table.insert(&b"/etc/hosts"[..], quiet(libc::ENOENT));

        let m = table.lookup(b"/etc/hosts").unwrap();
        assert_eq!(m.key, b"/etc/hosts");
        assert_eq!(m.prefix_len, 5);
        assert_eq!(&b"/etc/hosts"[m.prefix_len..], b"hosts");

        assert_eq!(table.lookup(b"/etc/hosts/x").unwrap().key, b"/");
        assert_eq!(table.lookup(b"/etc/hostsx").unwrap().key, b"/");
    }
}
