use alloc::{string::String, vec::Vec};
use thiserror::Error;

pub mod fat;

#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
pub enum FileError {
    #[error("I/O error")]
    Io,
    #[error("File not found")]
    NotFound,
    #[error("Invalid path")]
    InvalidPath,
    #[error("File already exists")]
    AlreadyExists,
    #[error("File system is full")]
    NotEnoughSpace,
    #[error("Unexpected end of file")]
    UnexpectedEof,
    #[error("Not a directory")]
    NotADirectory,
    #[error("Is a directory")]
    IsADirectory,
    #[error("File system is corrupted")]
    CorruptedFS,
    #[error("Unsupported operation")]
    UnsupportedOperation,
}

impl From<crate::BlockDeviceError> for FileError {
    fn from(error: crate::BlockDeviceError) -> Self {
        match error {
            crate::BlockDeviceError::Transport
            | crate::BlockDeviceError::Rejected(_)
            | crate::BlockDeviceError::UnalignedAccess => Self::Io,
            crate::BlockDeviceError::OutOfBounds => Self::UnexpectedEof,
            crate::BlockDeviceError::Unsupported => Self::UnsupportedOperation,
        }
    }
}

pub type FileResult<T> = Result<T, FileError>;

/// Path-level access to a mounted file system.
///
/// Paths are absolute and `/`-separated. Name comparison rules are up to the
/// file system (FAT compares names case-insensitively).
pub trait FileSystem {
    /// Creates an empty file. The parent directory must already exist.
    fn create(&mut self, path: Path) -> FileResult<()>;
    /// Creates an empty directory holding only `.` and `..`.
    fn create_dir(&mut self, path: Path) -> FileResult<()>;
    /// Removes a file, or a directory together with everything below it.
    fn delete(&mut self, path: Path) -> FileResult<()>;
    /// Returns whether anything, file or directory, lives at `path`.
    fn exists(&mut self, path: Path) -> FileResult<bool>;
    /// Fails unless `path` names a regular file.
    fn open(&mut self, path: Path) -> FileResult<()>;
    /// Persists the size and timestamps of the file at `path`.
    fn close(&mut self, path: Path) -> FileResult<()>;
    /// Reads at `offset`, returning a short count only at the end of the file.
    fn read(&mut self, path: Path, buffer: &mut [u8], offset: u64) -> FileResult<usize>;
    /// Writes at `offset`. The file grows as needed and any gap reads as zeroes.
    fn write(&mut self, path: Path, buffer: &[u8], offset: u64) -> FileResult<usize>;
    /// Moves (and possibly renames) a file or directory.
    fn rename(&mut self, from: Path, to: Path) -> FileResult<()>;
    /// Returns size and kind of the node at `path`.
    fn metadata(&mut self, path: Path) -> FileResult<FileMetadata>;
    /// Lists the children of a directory as full paths.
    fn read_dir(&mut self, path: Path) -> FileResult<Vec<PathBuf>>;
}

#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct PathBuf(String);

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct Path<'a>(&'a str);

impl PathBuf {
    #[must_use]
    #[inline]
    pub fn new(path: &str) -> Self {
        Self(String::from(path))
    }

    /// Appends a component, inserting a separator when needed.
    pub fn push(&mut self, component: &str) {
        if !self.0.ends_with('/') {
            self.0.push('/');
        }
        self.0.push_str(component.trim_start_matches('/'));
    }

    #[must_use]
    #[inline]
    pub fn as_path(&self) -> Path<'_> {
        Path(&self.0)
    }

    #[must_use]
    pub fn join(&self, component: &str) -> Self {
        let mut path = self.clone();
        path.push(component);
        path
    }
}

impl core::borrow::Borrow<str> for PathBuf {
    #[inline]
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl<'a> Path<'a> {
    #[must_use]
    #[inline]
    pub const fn new(path: &'a str) -> Self {
        Self(path)
    }

    /// Non-empty components of the path.
    pub fn components(&self) -> impl Iterator<Item = &'a str> + use<'a> {
        self.0.split('/').filter(|c| !c.is_empty())
    }

    #[must_use]
    /// Splits the path into its parent directory and its last component.
    ///
    /// Returns `None` for the root directory.
    pub fn split_last(&self) -> Option<(Self, &'a str)> {
        let trimmed = self.0.trim_end_matches('/');
        let (parent, name) = trimmed.rsplit_once('/').unwrap_or(("", trimmed));
        if name.is_empty() {
            None
        } else {
            Some((Self(parent), name))
        }
    }
}

impl Path<'_> {
    #[must_use]
    #[inline]
    pub fn to_owned(&self) -> PathBuf {
        PathBuf::new(self.0)
    }

    #[must_use]
    #[inline]
    pub const fn as_str(&self) -> &str {
        self.0
    }
}

impl<'a> From<&'a str> for Path<'a> {
    #[inline]
    fn from(value: &'a str) -> Self {
        Self(value)
    }
}

impl core::ops::Deref for Path<'_> {
    type Target = str;

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.0
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FileType {
    File,
    Directory,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FileMetadata {
    size: u64,
    file_type: FileType,
    read_only: bool,
}

impl FileMetadata {
    #[must_use]
    #[inline]
    pub const fn new(size: u64, file_type: FileType, read_only: bool) -> Self {
        Self {
            size,
            file_type,
            read_only,
        }
    }

    #[must_use]
    #[inline]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    #[inline]
    pub const fn file_type(&self) -> FileType {
        self.file_type
    }

    #[must_use]
    #[inline]
    pub const fn is_read_only(&self) -> bool {
        self.read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pathbuf() {
        let mut path = PathBuf::new("/DCIM/");
        path.push("/100CANON");
        assert_eq!(path.as_path().as_str(), "/DCIM/100CANON");

        let root = PathBuf::new("/");
        assert_eq!(root.join("a.txt").as_path().as_str(), "/a.txt");
    }

    #[test]
    fn test_path_split() {
        let path = Path::new("/docs/2024/report.txt");
        assert_eq!(
            path.components().collect::<Vec<_>>(),
            ["docs", "2024", "report.txt"]
        );

        let (parent, name) = path.split_last().unwrap();
        assert_eq!(parent.as_str(), "/docs/2024");
        assert_eq!(name, "report.txt");

        let (parent, name) = Path::new("/top/").split_last().unwrap();
        assert_eq!(parent.as_str(), "");
        assert_eq!(name, "top");

        assert!(Path::new("/").split_last().is_none());
        assert!(Path::new("").split_last().is_none());
    }
}
