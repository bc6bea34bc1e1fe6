use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::fsutil::write_atomic;

/// Filesystem handle confined to one directory. Names are single path
/// components; anything that could escape the root is rejected.
#[derive(Debug)]
pub struct ScopedDir {
    root: PathBuf,
    read_only: bool,
}

impl ScopedDir {
    pub fn open(root: impl Into<PathBuf>, read_only: bool) -> io::Result<Self> {
        let root = root.into();
        if !fs::metadata(&root)?.is_dir() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, format!("{} is not a directory", root.display())));
        }
        Ok(Self { root, read_only })
    }

    pub fn root(&self) -> &Path { &self.root }

    fn resolve(&self, name: &str) -> io::Result<PathBuf> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, format!("invalid file name {name:?}")));
        }
        Ok(self.root.join(name))
    }

    /// File contents, `None` when the file does not exist.
    pub fn read(&self, name: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.resolve(name)?) {
            Ok(b) => Ok(Some(b)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn write_atomic(&self, name: &str, data: &[u8], mode: u32) -> io::Result<()> {
        if self.read_only {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "volume is mounted read-only"));
        }
        write_atomic(&self.resolve(name)?, data, mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confines_names_to_root() {
        let dir = tempfile::tempdir().unwrap();
        let scoped = ScopedDir::open(dir.path(), false).unwrap();
        assert!(scoped.read("missing").unwrap().is_none());
        scoped.write_atomic("a.yaml", b"x: 1\n", 0o600).unwrap();
        assert_eq!(scoped.read("a.yaml").unwrap().unwrap(), b"x: 1\n");
        for bad in ["", "..", "../etc", "a/b"] {
            assert!(scoped.read(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn read_only_refuses_writes() {
        let dir = tempfile::tempdir().unwrap();
        let scoped = ScopedDir::open(dir.path(), true).unwrap();
        let err = scoped.write_atomic("a", b"", 0o600).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }
}
