use super::{
    Cluster, FatDirectory, FatError, FatFs, FatResult,
    chain::ClusterChain,
    dir::DirRecord,
    dirent::{Attributes, DirEntry},
    node::release,
    volume::Volume,
};
use crate::BlockDevice;
use alloc::{string::String, vec};

/// A regular file of a mounted volume.
///
/// Data and cluster links are on disk when a write returns. Size and timestamp
/// changes stay in the handle until [`FatFile::flush`] or [`FatFile::close`]
/// writes the directory entry.
#[derive(Debug, Clone)]
pub struct FatFile {
    /// First cluster of the directory holding the file.
    parent: Cluster,
    name: String,
    entry: DirEntry,
    /// Loaded on first access.
    chain: Option<ClusterChain>,
}

impl FatFile {
    pub(crate) fn from_record(parent: Cluster, record: DirRecord) -> Self {
        Self {
            parent,
            name: record.name().into(),
            entry: *record.entry(),
            chain: None,
        }
    }

    #[must_use]
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    #[inline]
    /// Size of the file in bytes.
    pub fn length(&self) -> u64 {
        u64::from(self.entry.file_size())
    }

    #[must_use]
    #[inline]
    pub const fn parent_cluster(&self) -> Cluster {
        self.parent
    }

    #[must_use]
    #[inline]
    pub const fn entry(&self) -> &DirEntry {
        &self.entry
    }

    fn chain<D: BlockDevice>(&mut self, volume: &mut Volume<D>) -> FatResult<&mut ClusterChain> {
        let chain = match self.chain.take() {
            Some(chain) => chain,
            None => ClusterChain::load(volume, self.entry.first_cluster())?,
        };
        Ok(self.chain.insert(chain))
    }

    /// Fills `dst` with the bytes starting at `offset`.
    ///
    /// The whole range must lie within the file.
    pub fn read<D: BlockDevice>(
        &mut self,
        fs: &mut FatFs<D>,
        offset: u64,
        dst: &mut [u8],
    ) -> FatResult<()> {
        let end = offset
            .checked_add(dst.len() as u64)
            .ok_or(FatError::OutOfRange)?;
        if end > self.length() {
            return Err(FatError::OutOfRange);
        }

        let volume = fs.volume_mut();
        self.chain(volume)?.read(volume, offset, dst)?;
        self.entry.set_accessed(volume.now().date());
        Ok(())
    }

    /// Writes `src` at `offset`, growing the file when the write ends past its end.
    ///
    /// Bytes between the old end and `offset` read back as zeros.
    pub fn write<D: BlockDevice>(
        &mut self,
        fs: &mut FatFs<D>,
        offset: u64,
        src: &[u8],
    ) -> FatResult<()> {
        let end = offset
            .checked_add(src.len() as u64)
            .ok_or(FatError::OutOfRange)?;
        let volume = fs.volume_mut();
        if end > self.length() {
            let size = u32::try_from(end).map_err(|_| FatError::OutOfRange)?;
            self.resize(volume, size, offset)?;
        }

        self.chain(volume)?.write(volume, offset, src)?;
        let now = volume.now();
        self.entry.set_modified(now);
        self.entry.set_accessed(now.date());
        self.entry.set_attributes(Attributes::new(
            self.entry.attributes().bits() | Attributes::ARCHIVE,
        ));
        Ok(())
    }

    /// Truncates or extends the file. New bytes read back as zeros.
    pub fn set_length<D: BlockDevice>(&mut self, fs: &mut FatFs<D>, length: u64) -> FatResult<()> {
        let size = u32::try_from(length).map_err(|_| FatError::OutOfRange)?;
        self.resize(fs.volume_mut(), size, length)?;
        self.entry.set_modified(fs.volume_mut().now());
        Ok(())
    }

    /// Resizes the chain to `size` bytes and zeroes the new bytes below `zero_until`.
    ///
    /// A changed chain is written to every FAT copy before any data goes through
    /// it. The first cluster in the entry follows the chain even when growing
    /// fails halfway, so the clusters allocated so far stay reachable.
    fn resize<D: BlockDevice>(
        &mut self,
        volume: &mut Volume<D>,
        size: u32,
        zero_until: u64,
    ) -> FatResult<()> {
        let old = self.length();
        let new = u64::from(size);
        let chain = self.chain(volume)?;
        let clusters = chain.len();
        let resized = chain.set_length(volume, new);
        let first = chain.first();
        let linked = if chain.len() == clusters {
            Ok(())
        } else {
            volume.fat.flush(&mut volume.device)
        };
        let zeroed = resized
            .and(linked)
            .and_then(|()| zero_fill(chain, volume, old, zero_until.min(new)));
        self.entry.set_first_cluster(first);
        zeroed?;

        self.entry.set_file_size(size);
        log::trace!("Resized {:?} from {old} to {new} bytes", self.name);
        Ok(())
    }

    /// Writes the directory entry and the pending FAT changes.
    pub fn flush<D: BlockDevice>(&mut self, fs: &mut FatFs<D>) -> FatResult<()> {
        let (table, volume) = fs.table_and_volume(self.parent)?;
        table.update_entry(&self.entry)?;
        table.write_back(volume)?;
        volume.flush()
    }

    /// Flushes the file and drops the handle.
    pub fn close<D: BlockDevice>(mut self, fs: &mut FatFs<D>) -> FatResult<()> {
        self.flush(fs)
    }

    /// Renames the file within its directory.
    pub fn set_name<D: BlockDevice>(&mut self, fs: &mut FatFs<D>, name: &str) -> FatResult<()> {
        let (table, volume) = fs.table_and_volume(self.parent)?;
        table.update_entry(&self.entry)?;
        let record = table.rename_entry(volume, &self.entry.short_name(), name)?;
        table.write_back(volume)?;
        volume.flush()?;

        self.name = record.name().into();
        self.entry = *record.entry();
        Ok(())
    }

    /// Moves the file into `target`, keeping its name and data.
    pub fn move_to<D: BlockDevice>(
        &mut self,
        fs: &mut FatFs<D>,
        target: &FatDirectory,
    ) -> FatResult<()> {
        if target.first_cluster() == self.parent {
            return Ok(());
        }

        let (target_table, volume) = fs.table_and_volume(target.first_cluster())?;
        let record = target_table.add_entry(volume, &self.name, self.entry)?;
        target_table.write_back(volume)?;

        let (source_table, volume) = fs.table_and_volume(self.parent)?;
        source_table.remove_entry(&self.entry.short_name())?;
        source_table.write_back(volume)?;
        volume.flush()?;

        log::debug!(
            "Moved file {:?} from cluster {} to cluster {}",
            self.name,
            self.parent,
            target.first_cluster()
        );
        self.parent = target.first_cluster();
        self.name = record.name().into();
        self.entry = *record.entry();
        Ok(())
    }

    /// Removes the file from its directory and frees its clusters.
    pub fn delete<D: BlockDevice>(self, fs: &mut FatFs<D>) -> FatResult<()> {
        let (table, volume) = fs.table_and_volume(self.parent)?;
        table.remove_entry(&self.entry.short_name())?;
        table.write_back(volume)?;
        release(volume, self.entry.first_cluster());
        volume.flush()?;
        log::debug!("Deleted file {:?}", self.name);
        Ok(())
    }
}

/// Writes zeros over `[from, to)` of the chain.
fn zero_fill<D: BlockDevice>(
    chain: &ClusterChain,
    volume: &mut Volume<D>,
    from: u64,
    to: u64,
) -> FatResult<()> {
    if from >= to {
        return Ok(());
    }
    let zeros = vec![0; volume.boot.cluster_size() as usize];
    let mut position = from;
    while position < to {
        let len = usize::try_from(to - position).map_or(zeros.len(), |left| left.min(zeros.len()));
        chain.write(volume, position, &zeros[..len])?;
        position += len as u64;
    }
    Ok(())
}

/// Position argument of [`FileStream::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    Start(u64),
    End(i64),
    Current(i64),
}

/// Sequential access to a file, tracking a position.
///
/// Dropping the stream writes nothing: call [`FileStream::flush`] to persist
/// the size and timestamps.
pub struct FileStream<'a, D> {
    fs: &'a mut FatFs<D>,
    file: &'a mut FatFile,
    position: u64,
}

impl<'a, D: BlockDevice> FileStream<'a, D> {
    #[must_use]
    #[inline]
    /// Opens a stream at the start of `file`.
    pub const fn new(fs: &'a mut FatFs<D>, file: &'a mut FatFile) -> Self {
        Self {
            fs,
            file,
            position: 0,
        }
    }

    #[must_use]
    #[inline]
    /// Opens a stream at the end of `file`.
    pub fn append(fs: &'a mut FatFs<D>, file: &'a mut FatFile) -> Self {
        let position = file.length();
        Self { fs, file, position }
    }

    #[must_use]
    #[inline]
    pub const fn position(&self) -> u64 {
        self.position
    }

    #[must_use]
    #[inline]
    pub const fn file(&self) -> &FatFile {
        &*self.file
    }

    /// Reads up to `buf.len()` bytes, returning 0 at the end of the file.
    pub fn read(&mut self, buf: &mut [u8]) -> FatResult<usize> {
        let available = self.file.length().saturating_sub(self.position);
        let len = usize::try_from(available).map_or(buf.len(), |a| a.min(buf.len()));
        if len == 0 {
            return Ok(0);
        }
        self.file.read(self.fs, self.position, &mut buf[..len])?;
        self.position += len as u64;
        Ok(len)
    }

    /// Writes all of `buf` at the current position.
    pub fn write(&mut self, buf: &[u8]) -> FatResult<usize> {
        self.file.write(self.fs, self.position, buf)?;
        self.position += buf.len() as u64;
        Ok(buf.len())
    }

    /// Moves the position. Seeking past the end is allowed; the next write fills the gap.
    pub fn seek(&mut self, pos: SeekFrom) -> FatResult<u64> {
        let (base, delta) = match pos {
            SeekFrom::Start(position) => {
                self.position = position;
                return Ok(position);
            }
            SeekFrom::End(delta) => (self.file.length(), delta),
            SeekFrom::Current(delta) => (self.position, delta),
        };
        self.position = base
            .checked_add_signed(delta)
            .ok_or(FatError::OutOfRange)?;
        Ok(self.position)
    }

    pub fn flush(&mut self) -> FatResult<()> {
        self.file.flush(self.fs)
    }
}
