use std::ffi::CString;
use std::fmt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use nix::unistd::{self, Gid, Uid, User};

use crate::error::{Result, SupervisorError};

/// Identity a child process assumes before running its task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub uid: Uid,
    /// Primary group; always the first entry of `groups`.
    pub gid: Gid,
    pub groups: Vec<Gid>,
    label: String,
}

impl Credentials {
    /// Credentials of a file owner, with the owning group as the only group.
    pub fn from_owner(uid: Uid, gid: Gid) -> Self {
        Self {
            uid,
            gid,
            groups: vec![gid],
            label: format!("({uid}:{gid})"),
        }
    }

    /// Owner of `path`. Symbolic links are not followed.
    pub fn of_path(path: &Path) -> Result<Self> {
        let meta = std::fs::symlink_metadata(path).map_err(|source| {
            SupervisorError::SourceUnavailable {
                path: path.to_path_buf(),
                source,
            }
        })?;
        Ok(Self::from_owner(
            Uid::from_raw(meta.uid()),
            Gid::from_raw(meta.gid()),
        ))
    }

    /// Resolve a user name to its uid, primary gid and group list.
    pub fn for_user(name: &str) -> Result<Self> {
        let user = User::from_name(name)
            .map_err(SupervisorError::Credentials)?
            .ok_or_else(|| SupervisorError::UnknownUser(name.to_string()))?;
        let cname = CString::new(user.name.as_str())
            .map_err(|_| SupervisorError::UnknownUser(name.to_string()))?;
        let mut groups =
            unistd::getgrouplist(&cname, user.gid).map_err(SupervisorError::Credentials)?;

        // primary group first
        groups.retain(|g| *g != user.gid);
        groups.insert(0, user.gid);

        Ok(Self {
            uid: user.uid,
            gid: user.gid,
            groups,
            label: user.name,
        })
    }

    /// Credentials of the calling process.
    pub fn current() -> Self {
        Self::from_owner(unistd::getuid(), unistd::getgid())
    }

    /// Whether the calling process already runs with exactly this identity.
    pub fn is_current(&self) -> bool {
        unistd::geteuid() == self.uid
            && unistd::getuid() == self.uid
            && unistd::getegid() == self.gid
            && unistd::getgid() == self.gid
    }

    /// Switch the calling process to these credentials.
    ///
    /// Groups are changed before the user, since the right to change them is
    /// gone once the uid is no longer privileged.
    pub fn assume(&self) -> nix::Result<()> {
        if unistd::geteuid().is_root() {
            unistd::setgroups(&self.groups)?;
        }
        unistd::setgid(self.gid)?;
        unistd::setuid(self.uid)?;
        Ok(())
    }
}

impl fmt::Display for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}
