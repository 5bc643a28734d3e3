//! FAT32 file system implementation.
use super::{FileError, FileMetadata, FileResult, FileSystem, FileType, Path, PathBuf};
use crate::{BlockDevice, BlockDeviceError};
use alloc::vec::Vec;
use thiserror::Error;

pub mod bs;
pub mod chain;
pub mod date;
pub mod dir;
pub mod dirent;
#[expect(clippy::module_inception, reason = "FS is named after this table")]
pub mod fat;
pub mod file;
pub mod format;
pub mod fsinfo;
pub mod node;
mod volume;

pub use file::{FatFile, FileStream, SeekFrom};
pub use node::{FatDirectory, UsbFile};
pub use volume::{FatFs, MountOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cluster(u32);

impl Cluster {
    /// First cluster of the data area.
    pub const FIRST_DATA: Self = Self(2);
    /// Highest cluster number a FAT32 entry can address.
    pub const MAX_DATA: u32 = 0x0FFF_FFF6;

    #[must_use]
    #[inline]
    pub const fn new(cluster: u32) -> Self {
        Self(cluster)
    }

    #[must_use]
    #[inline]
    pub const fn value(&self) -> u32 {
        self.0
    }

    #[must_use]
    #[inline]
    /// A start cluster of 0 means "no data allocated".
    pub const fn is_free(&self) -> bool {
        self.0 == 0
    }

    #[must_use]
    #[inline]
    /// Returns true if the cluster lies in the data area of a volume whose
    /// last cluster is `max_cluster`.
    pub const fn is_data(&self, max_cluster: u32) -> bool {
        self.0 >= Self::FIRST_DATA.0 && self.0 <= max_cluster
    }
}

impl core::fmt::Display for Cluster {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
/// Error type for FAT filesystem operations
pub enum FatError {
    #[error("Device error: {0}")]
    Device(#[from] BlockDeviceError),
    #[error("Invalid filesystem: {0}")]
    InvalidFilesystem(&'static str),
    #[error("Corrupt cluster chain at cluster {cluster}")]
    CorruptChain { cluster: Cluster },
    #[error("No free cluster left")]
    DiskFull,
    #[error("Out of range")]
    OutOfRange,
    #[error("Invalid operation: {0}")]
    UsageError(&'static str),
    #[error("Not found")]
    NotFound,
    #[error("Already exists")]
    AlreadyExists,
    #[error("Invalid file name")]
    InvalidName,
    #[error("Failed to write FAT copy {mirror}: {source}")]
    MirrorWrite {
        mirror: u8,
        source: BlockDeviceError,
    },
}

pub type FatResult<T> = Result<T, FatError>;

impl From<FatError> for FileError {
    fn from(error: FatError) -> Self {
        match error {
            FatError::Device(error) | FatError::MirrorWrite { source: error, .. } => error.into(),
            FatError::InvalidFilesystem(_) | FatError::CorruptChain { .. } => Self::CorruptedFS,
            FatError::DiskFull => Self::NotEnoughSpace,
            FatError::OutOfRange => Self::UnexpectedEof,
            FatError::UsageError(_) => Self::UnsupportedOperation,
            FatError::NotFound => Self::NotFound,
            FatError::AlreadyExists => Self::AlreadyExists,
            FatError::InvalidName => Self::InvalidPath,
        }
    }
}

impl<D: BlockDevice> FatFs<D> {
    fn lookup(&mut self, path: Path) -> FileResult<UsbFile> {
        self.root()
            .search(self, path.as_str())?
            .ok_or(FileError::NotFound)
    }

    fn lookup_dir(&mut self, path: Path) -> FileResult<FatDirectory> {
        match self.lookup(path)? {
            UsbFile::Directory(dir) => Ok(dir),
            UsbFile::File(_) => Err(FileError::NotADirectory),
        }
    }

    fn lookup_file(&mut self, path: Path) -> FileResult<FatFile> {
        match self.lookup(path)? {
            UsbFile::File(file) => Ok(file),
            UsbFile::Directory(_) => Err(FileError::IsADirectory),
        }
    }

    /// Resolves the parent directory of `path` and returns it with the last component.
    fn lookup_parent<'p>(&mut self, path: Path<'p>) -> FileResult<(FatDirectory, &'p str)> {
        let (parent, name) = path.split_last().ok_or(FileError::InvalidPath)?;
        Ok((self.lookup_dir(parent)?, name))
    }
}

impl<D: BlockDevice> FileSystem for FatFs<D> {
    fn create(&mut self, path: Path) -> FileResult<()> {
        let (parent, name) = self.lookup_parent(path)?;
        parent.create_file(self, name)?;
        Ok(())
    }

    fn create_dir(&mut self, path: Path) -> FileResult<()> {
        let (parent, name) = self.lookup_parent(path)?;
        parent.create_directory(self, name)?;
        Ok(())
    }

    fn delete(&mut self, path: Path) -> FileResult<()> {
        match self.lookup(path)? {
            UsbFile::File(file) => file.delete(self)?,
            UsbFile::Directory(dir) if dir.is_root() => {
                return Err(FileError::UnsupportedOperation);
            }
            UsbFile::Directory(dir) => dir.delete(self)?,
        }
        Ok(())
    }

    fn exists(&mut self, path: Path) -> FileResult<bool> {
        Ok(self.root().search(self, path.as_str())?.is_some())
    }

    fn open(&mut self, path: Path) -> FileResult<()> {
        self.lookup_file(path).map(|_| ())
    }

    fn close(&mut self, path: Path) -> FileResult<()> {
        self.lookup_file(path)?.close(self)?;
        Ok(())
    }

    fn read(&mut self, path: Path, buffer: &mut [u8], offset: u64) -> FileResult<usize> {
        let mut file = self.lookup_file(path)?;
        let available = file.length().saturating_sub(offset);
        let len = usize::try_from(available).map_or(buffer.len(), |a| a.min(buffer.len()));
        if len == 0 {
            return Ok(0);
        }
        file.read(self, offset, &mut buffer[..len])?;
        Ok(len)
    }

    fn write(&mut self, path: Path, buffer: &[u8], offset: u64) -> FileResult<usize> {
        let mut file = self.lookup_file(path)?;
        file.write(self, offset, buffer)?;
        file.flush(self)?;
        Ok(buffer.len())
    }

    fn rename(&mut self, from: Path, to: Path) -> FileResult<()> {
        let (to_parent, to_name) = self.lookup_parent(to)?;
        match self.lookup(from)? {
            UsbFile::File(mut file) => {
                if file.parent_cluster() != to_parent.first_cluster() {
                    file.move_to(self, &to_parent)?;
                }
                if file.name() != to_name {
                    file.set_name(self, to_name)?;
                }
            }
            UsbFile::Directory(mut dir) => {
                if dir.parent_cluster() != Some(to_parent.first_cluster()) {
                    dir.move_to(self, &to_parent)?;
                }
                if dir.name() != to_name {
                    dir.set_name(self, to_name)?;
                }
            }
        }
        Ok(())
    }

    fn metadata(&mut self, path: Path) -> FileResult<FileMetadata> {
        let node = self.lookup(path)?;
        let file_type = if node.is_directory() {
            FileType::Directory
        } else {
            FileType::File
        };
        Ok(FileMetadata::new(
            node.length(),
            file_type,
            node.attributes().is_read_only(),
        ))
    }

    fn read_dir(&mut self, path: Path) -> FileResult<Vec<PathBuf>> {
        let dir = self.lookup_dir(path)?;
        let base = PathBuf::new(if path.is_empty() { "/" } else { path.as_str() });
        Ok(dir
            .list(self)?
            .iter()
            .map(|name| base.join(name))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_methods() {
        let free = Cluster::new(0);
        assert!(free.is_free());
        assert!(!free.is_data(100));

        assert!(!Cluster::new(1).is_data(100));
        assert!(Cluster::FIRST_DATA.is_data(100));
        assert!(Cluster::new(100).is_data(100));
        assert!(!Cluster::new(101).is_data(100));
    }

    #[test]
    fn test_error_conversion() {
        assert_eq!(FileError::from(FatError::DiskFull), FileError::NotEnoughSpace);
        assert_eq!(
            FileError::from(FatError::CorruptChain {
                cluster: Cluster::new(7)
            }),
            FileError::CorruptedFS
        );
        assert_eq!(
            FileError::from(FatError::Device(BlockDeviceError::Transport)),
            FileError::Io
        );
        assert_eq!(
            FileError::from(FatError::MirrorWrite {
                mirror: 1,
                source: BlockDeviceError::OutOfBounds
            }),
            FileError::UnexpectedEof
        );
    }
}
