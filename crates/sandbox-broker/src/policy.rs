//! JSON policy files describing a mount table

use std::path::{Path, PathBuf};

use log::debug;
use sandbox_core::util::parse_errno;
use sandbox_core::{Result, SandboxError};
use serde::{Deserialize, Serialize};

use crate::filesystem::Filesystem;

/// An errno written either as a number or a symbolic name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrnoSpec {
    Number(i32),
    Name(String),
}

impl ErrnoSpec {
    pub fn resolve(&self) -> Result<i32> {
        match self {
            ErrnoSpec::Number(n) => parse_errno(&n.to_string()),
            ErrnoSpec::Name(name) => parse_errno(name),
        }
    }
}

fn default_tmp_budget() -> u32 {
    100
}

/// One mount-table entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged, deny_unknown_fields)]
pub enum Grant {
    Native {
        native: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        at: Option<PathBuf>,
        #[serde(default)]
        write_budget: u32,
    },
    Tmp {
        tmp: PathBuf,
        #[serde(default = "default_tmp_budget")]
        budget: u32,
    },
    Error {
        error: PathBuf,
        errno: ErrnoSpec,
        #[serde(default)]
        noisy: bool,
    },
}

/// Resource limits applied to the child before it starts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Limits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_space: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

/// A complete sandbox policy as read from disk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    /// Grant the shared-library bundle a dynamically linked program needs
    #[serde(default)]
    pub syslibs: bool,
    #[serde(default)]
    pub grants: Vec<Grant>,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Policy {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| SandboxError::Policy(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| SandboxError::Policy(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::Policy(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
            .map_err(|e| SandboxError::Policy(format!("{}: {}", path.display(), e)))
    }

    /// Install every grant into `fs`, syslibs first so explicit grants win.
    ///
    /// `exe` is the program about to run; with `syslibs` set it is granted
    /// read-only as well.
    pub fn apply(&self, fs: &Filesystem, exe: Option<&str>) -> Result<()> {
        if self.syslibs {
            fs.grant_syslibs(exe);
        }
        for grant in &self.grants {
            debug!("policy grant {:?}", grant);
            match grant {
                Grant::Native {
                    native,
                    at,
                    write_budget,
                } => {
                    let at = at.as_deref().unwrap_or(native.as_path());
                    fs.grant_native_at(native, at, *write_budget)?;
                }
                Grant::Tmp { tmp, budget } => fs.grant_tmp(tmp, *budget),
                Grant::Error {
                    error,
                    errno,
                    noisy,
                } => fs.grant_errno(error, errno.resolve()?, *noisy),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_protocol::Op;

    const SAMPLE: &str = r#"{
        "syslibs": false,
        "grants": [
            { "native": "/etc/", "at": "/host-etc/", "write_budget": 0 },
            { "tmp": "/tmp/", "budget": 3 },
            { "error": "/home/", "errno": "ENOENT", "noisy": false },
            { "error": "/root/", "errno": 1 }
        ],
        "limits": { "address_space": 1073741824, "processes": 500 },
        "timeout_secs": 60
    }"#;

    #[test]
    fn parses_all_grant_forms() {
        let policy = Policy::from_json(SAMPLE).unwrap();
        assert_eq!(policy.grants.len(), 4);
        assert_eq!(
            policy.grants[1],
            Grant::Tmp {
                tmp: PathBuf::from("/tmp/"),
                budget: 3
            }
        );
        assert!(matches!(
            &policy.grants[3],
            Grant::Error { errno: ErrnoSpec::Number(1), noisy: false, .. }
        ));
        assert_eq!(policy.limits.address_space, Some(1 << 30));
        assert_eq!(policy.limits.file_size, None);
        assert_eq!(policy.timeout_secs, Some(60));
    }

    #[test]
    fn defaults_apply() {
        let policy = Policy::from_json(r#"{ "grants": [ { "tmp": "/tmp/" } ] }"#).unwrap();
        assert!(!policy.syslibs);
        assert_eq!(
            policy.grants[0],
            Grant::Tmp {
                tmp: PathBuf::from("/tmp/"),
                budget: 100
            }
        );
    }

    #[test]
    fn rejects_unknown_fields() {
        assert!(Policy::from_json(r#"{ "grantz": [] }"#).is_err());
        assert!(Policy::from_json(r#"{ "grants": [ { "mystery": "/x" } ] }"#).is_err());
    }

    #[test]
    fn apply_installs_rules() {
        let policy = Policy::from_json(SAMPLE).unwrap();
        let fs = Filesystem::new();
        policy.apply(&fs, None).unwrap();
        assert_eq!(fs.rule_count(), 5);

        assert!(fs
            .child_file(Op::Access, b"/host-etc/passwd", libc::R_OK, 0)
            .is_ok());
        assert_eq!(
            fs.child_file(Op::Access, b"/home/x", libc::R_OK, 0).unwrap_err(),
            libc::ENOENT
        );
        assert_eq!(
            fs.child_file(Op::Access, b"/root/x", libc::R_OK, 0).unwrap_err(),
            libc::EPERM
        );
    }

    #[test]
    fn bad_errno_name_fails_apply() {
        let policy =
            Policy::from_json(r#"{ "grants": [ { "error": "/x/", "errno": "EBOGUS" } ] }"#)
                .unwrap();
        assert!(policy.apply(&Filesystem::new(), None).is_err());
    }

    #[test]
    fn json_round_trip_is_stable() {
        let policy = Policy::from_json(SAMPLE).unwrap();
        let again = Policy::from_json(&policy.to_json().unwrap()).unwrap();
        assert_eq!(policy, again);
    }
}
