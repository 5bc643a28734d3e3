//! Files and directories of a mounted volume.
//!
//! Handles are plain values: every operation takes the [`FatFs`] they belong to.
use super::{
    Cluster, FatError, FatFile, FatFs, FatResult,
    date::{Date, DateTime},
    dir::{DirRecord, DirectoryTable},
    dirent::{Attributes, DirEntry, ShortName},
    volume::Volume,
};
use crate::{BlockDevice, fs::Path};
use alloc::{string::String, vec::Vec};
use hashbrown::HashSet;

/// A directory of a mounted volume.
#[derive(Debug, Clone)]
pub struct FatDirectory {
    first_cluster: Cluster,
    /// Parent directory and own entry, `None` for the root directory.
    link: Option<(Cluster, DirEntry)>,
    name: String,
}

impl FatDirectory {
    pub(crate) const fn root(cluster: Cluster) -> Self {
        Self {
            first_cluster: cluster,
            link: None,
            name: String::new(),
        }
    }

    pub(crate) fn from_record(parent: Cluster, record: DirRecord) -> Self {
        let entry = *record.entry();
        Self {
            first_cluster: entry.first_cluster(),
            link: Some((parent, entry)),
            name: record.name().into(),
        }
    }

    #[must_use]
    #[inline]
    pub const fn is_root(&self) -> bool {
        self.link.is_none()
    }

    #[must_use]
    #[inline]
    pub const fn first_cluster(&self) -> Cluster {
        self.first_cluster
    }

    #[must_use]
    #[inline]
    /// First cluster of the parent directory.
    pub const fn parent_cluster(&self) -> Option<Cluster> {
        match self.link {
            Some((parent, _)) => Some(parent),
            None => None,
        }
    }

    #[must_use]
    #[inline]
    /// Name of the directory, empty for the root directory.
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    #[inline]
    pub const fn entry(&self) -> Option<&DirEntry> {
        match &self.link {
            Some((_, entry)) => Some(entry),
            None => None,
        }
    }

    #[must_use]
    pub const fn attributes(&self) -> Attributes {
        match &self.link {
            Some((_, entry)) => entry.attributes(),
            None => Attributes::new(Attributes::DIRECTORY),
        }
    }

    pub fn parent<D: BlockDevice>(&self, fs: &mut FatFs<D>) -> FatResult<Option<Self>> {
        self.parent_cluster()
            .map(|parent| fs.directory_at(parent))
            .transpose()
    }

    /// Names of the entries of the directory.
    pub fn list<D: BlockDevice>(&self, fs: &mut FatFs<D>) -> FatResult<Vec<String>> {
        Ok(fs
            .table(self.first_cluster)?
            .records()
            .map(|record| String::from(record.name()))
            .collect())
    }

    /// Handles to the entries of the directory.
    pub fn list_files<D: BlockDevice>(&self, fs: &mut FatFs<D>) -> FatResult<Vec<UsbFile>> {
        Ok(fs
            .table(self.first_cluster)?
            .records()
            .map(|record| UsbFile::from_record(self.first_cluster, record.clone()))
            .collect())
    }

    /// Looks up the direct child named `name`, ignoring case.
    pub fn child<D: BlockDevice>(
        &self,
        fs: &mut FatFs<D>,
        name: &str,
    ) -> FatResult<Option<UsbFile>> {
        Ok(fs
            .table(self.first_cluster)?
            .find(name)
            .map(|record| UsbFile::from_record(self.first_cluster, record.clone())))
    }

    /// Resolves a `/`-separated path relative to this directory.
    ///
    /// An empty path resolves to the directory itself. A path going through a
    /// file resolves to nothing.
    pub fn search<D: BlockDevice>(
        &self,
        fs: &mut FatFs<D>,
        path: &str,
    ) -> FatResult<Option<UsbFile>> {
        let mut current = UsbFile::Directory(self.clone());
        for component in Path::new(path).components() {
            let UsbFile::Directory(dir) = &current else {
                return Ok(None);
            };
            match dir.child(fs, component)? {
                Some(node) => current = node,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Creates an empty file in this directory.
    pub fn create_file<D: BlockDevice>(
        &self,
        fs: &mut FatFs<D>,
        name: &str,
    ) -> FatResult<FatFile> {
        let (table, volume) = fs.table_and_volume(self.first_cluster)?;
        table.check_available(name)?;

        let cluster = volume.fat.allocate(&mut volume.device)?;
        let mut entry = DirEntry::new(
            ShortName::new([b' '; 11]),
            Attributes::new(Attributes::ARCHIVE),
            volume.now(),
        );
        entry.set_first_cluster(cluster);

        let record = match table.add_entry(volume, name, entry) {
            Ok(record) => record,
            Err(err) => {
                release(volume, cluster);
                return Err(err);
            }
        };
        table.write_back(volume)?;
        volume.flush()?;
        log::debug!("Created file {name:?} at cluster {cluster}");
        Ok(FatFile::from_record(self.first_cluster, record))
    }

    /// Creates an empty directory in this directory.
    pub fn create_directory<D: BlockDevice>(
        &self,
        fs: &mut FatFs<D>,
        name: &str,
    ) -> FatResult<Self> {
        let (table, volume) = fs.table_and_volume(self.first_cluster)?;
        table.check_available(name)?;

        let cluster = volume.fat.allocate(&mut volume.device)?;
        let now = volume.now();
        let dotdot = if self.is_root() {
            Cluster::new(0)
        } else {
            self.first_cluster
        };
        if let Err(err) = DirectoryTable::create(volume, cluster, dotdot, now) {
            release(volume, cluster);
            return Err(err);
        }

        let mut entry = DirEntry::new(
            ShortName::new([b' '; 11]),
            Attributes::new(Attributes::DIRECTORY),
            now,
        );
        entry.set_first_cluster(cluster);

        let record = match table.add_entry(volume, name, entry) {
            Ok(record) => record,
            Err(err) => {
                release(volume, cluster);
                return Err(err);
            }
        };
        table.write_back(volume)?;
        volume.flush()?;
        log::debug!("Created directory {name:?} at cluster {cluster}");
        Ok(Self::from_record(self.first_cluster, record))
    }

    /// Renames the directory within its parent.
    pub fn set_name<D: BlockDevice>(&mut self, fs: &mut FatFs<D>, name: &str) -> FatResult<()> {
        let Some((parent, entry)) = self.link else {
            return Err(FatError::UsageError("the root directory cannot be renamed"));
        };
        let (table, volume) = fs.table_and_volume(parent)?;
        let record = table.rename_entry(volume, &entry.short_name(), name)?;
        table.write_back(volume)?;
        volume.flush()?;

        self.name = record.name().into();
        self.link = Some((parent, *record.entry()));
        Ok(())
    }

    /// Moves the directory into `target`, keeping its name and contents.
    pub fn move_to<D: BlockDevice>(&mut self, fs: &mut FatFs<D>, target: &Self) -> FatResult<()> {
        let Some((parent, entry)) = self.link else {
            return Err(FatError::UsageError("the root directory cannot be moved"));
        };
        if target.first_cluster == parent {
            return Ok(());
        }
        self.check_not_ancestor_of(fs, target)?;

        let (target_table, volume) = fs.table_and_volume(target.first_cluster)?;
        let record = target_table.add_entry(volume, &self.name, entry)?;
        target_table.write_back(volume)?;

        let (source_table, volume) = fs.table_and_volume(parent)?;
        source_table.remove_entry(&entry.short_name())?;
        source_table.write_back(volume)?;

        let dotdot = if target.is_root() {
            Cluster::new(0)
        } else {
            target.first_cluster
        };
        let (own_table, volume) = fs.table_and_volume(self.first_cluster)?;
        own_table.set_dotdot(dotdot)?;
        own_table.write_back(volume)?;
        volume.flush()?;

        log::debug!(
            "Moved directory {:?} from cluster {parent} to cluster {}",
            self.name,
            target.first_cluster
        );
        self.name = record.name().into();
        self.link = Some((target.first_cluster, *record.entry()));
        Ok(())
    }

    /// Walks up from `target` to the root, failing if this directory is on the way.
    fn check_not_ancestor_of<D: BlockDevice>(
        &self,
        fs: &mut FatFs<D>,
        target: &Self,
    ) -> FatResult<()> {
        let mut visited = HashSet::new();
        let mut cursor = target.first_cluster;
        loop {
            if cursor == self.first_cluster {
                return Err(FatError::UsageError(
                    "a directory cannot be moved into itself",
                ));
            }
            if fs.volume_mut().is_root(cursor) {
                return Ok(());
            }
            if !visited.insert(cursor) {
                return Err(FatError::InvalidFilesystem("loop in '..' entries"));
            }
            cursor = fs.parent_of(cursor)?;
        }
    }

    /// Deletes the directory and everything below it.
    pub fn delete<D: BlockDevice>(self, fs: &mut FatFs<D>) -> FatResult<()> {
        let Some((parent, entry)) = self.link else {
            return Err(FatError::UsageError("the root directory cannot be deleted"));
        };
        for child in self.list_files(fs)? {
            child.delete(fs)?;
        }

        let (table, volume) = fs.table_and_volume(parent)?;
        table.remove_entry(&entry.short_name())?;
        table.write_back(volume)?;
        release(volume, self.first_cluster);
        volume.flush()?;
        fs.drop_table(self.first_cluster);
        log::debug!("Deleted directory {:?}", self.name);
        Ok(())
    }

    /// Writes the pending changes of the directory table and of the FAT.
    pub fn flush<D: BlockDevice>(&self, fs: &mut FatFs<D>) -> FatResult<()> {
        let (table, volume) = fs.table_and_volume(self.first_cluster)?;
        table.write_back(volume)?;
        volume.flush()
    }
}

/// Frees the chain starting at `cluster`. A corrupt chain is freed as far as it can be.
pub(crate) fn release<D: BlockDevice>(volume: &mut Volume<D>, cluster: Cluster) {
    if cluster.is_free() {
        return;
    }
    if let Err(err) = volume.fat.free(&mut volume.device, cluster) {
        log::warn!("Failed to free the chain at cluster {cluster}: {err}");
    }
}

/// A file or a directory.
#[derive(Debug, Clone)]
pub enum UsbFile {
    File(FatFile),
    Directory(FatDirectory),
}

impl From<FatFile> for UsbFile {
    fn from(file: FatFile) -> Self {
        Self::File(file)
    }
}

impl From<FatDirectory> for UsbFile {
    fn from(dir: FatDirectory) -> Self {
        Self::Directory(dir)
    }
}

impl UsbFile {
    pub(crate) fn from_record(parent: Cluster, record: DirRecord) -> Self {
        if record.entry().is_directory() {
            Self::Directory(FatDirectory::from_record(parent, record))
        } else {
            Self::File(FatFile::from_record(parent, record))
        }
    }

    #[must_use]
    #[inline]
    pub fn name(&self) -> &str {
        match self {
            Self::File(file) => file.name(),
            Self::Directory(dir) => dir.name(),
        }
    }

    #[must_use]
    #[inline]
    pub const fn is_directory(&self) -> bool {
        matches!(self, Self::Directory(_))
    }

    #[must_use]
    #[inline]
    pub const fn is_root(&self) -> bool {
        match self {
            Self::File(_) => false,
            Self::Directory(dir) => dir.is_root(),
        }
    }

    #[must_use]
    #[inline]
    pub const fn as_file(&self) -> Option<&FatFile> {
        match self {
            Self::File(file) => Some(file),
            Self::Directory(_) => None,
        }
    }

    #[must_use]
    #[inline]
    pub const fn as_directory(&self) -> Option<&FatDirectory> {
        match self {
            Self::File(_) => None,
            Self::Directory(dir) => Some(dir),
        }
    }

    #[must_use]
    pub fn into_file(self) -> Option<FatFile> {
        match self {
            Self::File(file) => Some(file),
            Self::Directory(_) => None,
        }
    }

    #[must_use]
    pub fn into_directory(self) -> Option<FatDirectory> {
        match self {
            Self::File(_) => None,
            Self::Directory(dir) => Some(dir),
        }
    }

    const fn entry(&self) -> Option<&DirEntry> {
        match self {
            Self::File(file) => Some(file.entry()),
            Self::Directory(dir) => dir.entry(),
        }
    }

    #[must_use]
    pub const fn attributes(&self) -> Attributes {
        match self {
            Self::File(file) => file.entry().attributes(),
            Self::Directory(dir) => dir.attributes(),
        }
    }

    #[must_use]
    /// Creation time, `None` for the root directory.
    pub fn created_at(&self) -> Option<DateTime> {
        self.entry().map(DirEntry::created)
    }

    #[must_use]
    /// Last modification time, `None` for the root directory.
    pub fn last_modified(&self) -> Option<DateTime> {
        self.entry().map(DirEntry::modified)
    }

    #[must_use]
    /// Last access date, `None` for the root directory.
    pub fn last_accessed(&self) -> Option<Date> {
        self.entry().map(DirEntry::accessed)
    }

    #[must_use]
    /// Size in bytes, 0 for directories.
    pub fn length(&self) -> u64 {
        match self {
            Self::File(file) => file.length(),
            Self::Directory(_) => 0,
        }
    }

    #[must_use]
    pub const fn parent_cluster(&self) -> Option<Cluster> {
        match self {
            Self::File(file) => Some(file.parent_cluster()),
            Self::Directory(dir) => dir.parent_cluster(),
        }
    }

    /// Directory holding this node, `None` for the root directory.
    pub fn parent<D: BlockDevice>(&self, fs: &mut FatFs<D>) -> FatResult<Option<FatDirectory>> {
        self.parent_cluster()
            .map(|parent| fs.directory_at(parent))
            .transpose()
    }

    const fn directory(&self) -> FatResult<&FatDirectory> {
        match self {
            Self::Directory(dir) => Ok(dir),
            Self::File(_) => Err(FatError::UsageError("not a directory")),
        }
    }

    const fn file_mut(&mut self) -> FatResult<&mut FatFile> {
        match self {
            Self::File(file) => Ok(file),
            Self::Directory(_) => Err(FatError::UsageError("not a file")),
        }
    }

    pub fn list<D: BlockDevice>(&self, fs: &mut FatFs<D>) -> FatResult<Vec<String>> {
        self.directory()?.list(fs)
    }

    pub fn list_files<D: BlockDevice>(&self, fs: &mut FatFs<D>) -> FatResult<Vec<Self>> {
        self.directory()?.list_files(fs)
    }

    pub fn search<D: BlockDevice>(&self, fs: &mut FatFs<D>, path: &str) -> FatResult<Option<Self>> {
        self.directory()?.search(fs, path)
    }

    pub fn create_file<D: BlockDevice>(&self, fs: &mut FatFs<D>, name: &str) -> FatResult<Self> {
        self.directory()?.create_file(fs, name).map(Self::File)
    }

    pub fn create_directory<D: BlockDevice>(
        &self,
        fs: &mut FatFs<D>,
        name: &str,
    ) -> FatResult<Self> {
        self.directory()?
            .create_directory(fs, name)
            .map(Self::Directory)
    }

    pub fn read<D: BlockDevice>(
        &mut self,
        fs: &mut FatFs<D>,
        offset: u64,
        dst: &mut [u8],
    ) -> FatResult<()> {
        self.file_mut()?.read(fs, offset, dst)
    }

    pub fn write<D: BlockDevice>(
        &mut self,
        fs: &mut FatFs<D>,
        offset: u64,
        src: &[u8],
    ) -> FatResult<()> {
        self.file_mut()?.write(fs, offset, src)
    }

    pub fn set_length<D: BlockDevice>(&mut self, fs: &mut FatFs<D>, length: u64) -> FatResult<()> {
        self.file_mut()?.set_length(fs, length)
    }

    pub fn flush<D: BlockDevice>(&mut self, fs: &mut FatFs<D>) -> FatResult<()> {
        match self {
            Self::File(file) => file.flush(fs),
            Self::Directory(dir) => dir.flush(fs),
        }
    }

    pub fn close<D: BlockDevice>(self, fs: &mut FatFs<D>) -> FatResult<()> {
        match self {
            Self::File(file) => file.close(fs),
            Self::Directory(dir) => dir.flush(fs),
        }
    }

    pub fn set_name<D: BlockDevice>(&mut self, fs: &mut FatFs<D>, name: &str) -> FatResult<()> {
        match self {
            Self::File(file) => file.set_name(fs, name),
            Self::Directory(dir) => dir.set_name(fs, name),
        }
    }

    pub fn move_to<D: BlockDevice>(
        &mut self,
        fs: &mut FatFs<D>,
        target: &FatDirectory,
    ) -> FatResult<()> {
        match self {
            Self::File(file) => file.move_to(fs, target),
            Self::Directory(dir) => dir.move_to(fs, target),
        }
    }

    pub fn delete<D: BlockDevice>(self, fs: &mut FatFs<D>) -> FatResult<()> {
        match self {
            Self::File(file) => file.delete(fs),
            Self::Directory(dir) => dir.delete(fs),
        }
    }
}
