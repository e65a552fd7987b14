use std::ffi::OsStr;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::error::{Result, SupervisorError};

/// Size of a path buffer including its terminator.
pub const PATH_CAPACITY: usize = 4096;

/// Longest path a `BoundedPath` can hold.
pub const MAX_PATH_LEN: usize = PATH_CAPACITY - 1;

/// A path that fits in a fixed-capacity buffer.
///
/// Construction rejects over-long input instead of truncating it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BoundedPath(PathBuf);

impl BoundedPath {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if path.as_os_str().len() > MAX_PATH_LEN {
            return Err(SupervisorError::PathTooLong {
                path,
                max: MAX_PATH_LEN,
            });
        }
        Ok(Self(path))
    }

    /// Bytes still available after this path, e.g. for a file name.
    pub fn remaining(&self) -> usize {
        MAX_PATH_LEN - self.len()
    }

    pub fn len(&self) -> usize {
        self.0.as_os_str().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.as_os_str().is_empty()
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl AsRef<Path> for BoundedPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl PartialEq<Path> for BoundedPath {
    fn eq(&self, other: &Path) -> bool {
        self.0.as_path() == other
    }
}

impl fmt::Display for BoundedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.display().fmt(f)
    }
}

/// A directory prefix that file names are appended to.
///
/// The prefix always ends in `/` so joining is plain concatenation and the
/// name budget is known up front.
#[derive(Debug, Clone)]
pub struct DirPrefix {
    bytes: Vec<u8>,
}

impl DirPrefix {
    pub fn new(dir: &Path) -> Result<Self> {
        let mut bytes = dir.as_os_str().as_bytes().to_vec();
        if bytes.last() != Some(&b'/') {
            bytes.push(b'/');
        }
        if bytes.len() > MAX_PATH_LEN {
            return Err(SupervisorError::PathTooLong {
                path: dir.to_path_buf(),
                max: MAX_PATH_LEN,
            });
        }
        Ok(Self { bytes })
    }

    /// Longest file name that still fits after this prefix.
    pub fn name_budget(&self) -> usize {
        MAX_PATH_LEN - self.bytes.len()
    }

    pub fn join(&self, name: impl AsRef<[u8]>) -> Result<BoundedPath> {
        let name = name.as_ref();
        let mut bytes = Vec::with_capacity(self.bytes.len() + name.len());
        bytes.extend_from_slice(&self.bytes);
        bytes.extend_from_slice(name);
        BoundedPath::new(PathBuf::from(OsStr::from_bytes(&bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_overlong_path() {
        let long = "a".repeat(MAX_PATH_LEN + 1);
        assert!(matches!(
            BoundedPath::new(long),
            Err(SupervisorError::PathTooLong { max: MAX_PATH_LEN, .. })
        ));

        let exact = "a".repeat(MAX_PATH_LEN);
        let path = BoundedPath::new(exact).unwrap();
        assert_eq!(path.remaining(), 0);
    }

    #[test]
    fn prefix_adds_single_separator() {
        let a = DirPrefix::new(Path::new("/a")).unwrap();
        let b = DirPrefix::new(Path::new("/a/")).unwrap();
        assert_eq!(a.join("x").unwrap().as_path(), Path::new("/a/x"));
        assert_eq!(b.join("x").unwrap().as_path(), Path::new("/a/x"));
        assert_eq!(a.name_budget(), MAX_PATH_LEN - 3);
    }

    #[test]
    fn oversized_prefix_is_rejected() {
        let dir = PathBuf::from("/".repeat(MAX_PATH_LEN + 1));
        assert!(DirPrefix::new(&dir).is_err());
    }
}
