use super::{
    Cluster, FatDirectory, FatError, FatResult,
    bs::BootSector,
    date::{DateTime, DosEpochClock, TimeProvider},
    dir::DirectoryTable,
    fat::Fat,
    fsinfo::FsInfoSector,
};
use crate::BlockDevice;
use alloc::{boxed::Box, string::String, vec};
use hashbrown::{HashMap, hash_map::Entry};
use msd_core::layout::PackedLayout;

/// Mount-time settings of a [`FatFs`].
pub struct MountOptions {
    fat_cache_sectors: usize,
    clock: Box<dyn TimeProvider>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            fat_cache_sectors: 64,
            clock: Box::new(DosEpochClock),
        }
    }
}

impl MountOptions {
    #[must_use]
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    #[inline]
    /// Number of clean FAT sectors kept in memory.
    pub const fn with_fat_cache_sectors(mut self, sectors: usize) -> Self {
        self.fat_cache_sectors = sectors;
        self
    }

    #[must_use]
    #[inline]
    /// Source of the timestamps written to directory entries.
    pub fn with_clock(mut self, clock: impl TimeProvider + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }
}

/// Device, geometry and allocation state shared by every node of a volume.
pub(crate) struct Volume<D> {
    pub device: D,
    pub boot: BootSector,
    pub fat: Fat,
    clock: Box<dyn TimeProvider>,
    /// Last FSInfo contents written, `None` when the volume has no usable FSInfo sector.
    fs_info: Option<FsInfoSector>,
}

impl<D: BlockDevice> Volume<D> {
    fn open(mut device: D, options: MountOptions) -> FatResult<Self> {
        let boot = BootSector::read(&mut device)?;

        let fs_info = match boot.fs_info_sector() {
            Some(sector) => {
                let mut block = vec![0; boot.bytes_per_sector() as usize];
                device.read(&mut block, u64::from(sector))?;
                FsInfoSector::read_from(&block).filter(|info| {
                    let valid = info.is_valid();
                    if !valid {
                        log::warn!("Ignoring FSInfo sector {sector} with bad signatures");
                    }
                    valid
                })
            }
            None => None,
        };

        let fat = Fat::new(
            &boot,
            options.fat_cache_sectors,
            fs_info.and_then(|info| info.free_count()),
            fs_info.and_then(|info| info.next_free()),
        );

        Ok(Self {
            device,
            boot,
            fat,
            clock: options.clock,
            fs_info,
        })
    }

    #[must_use]
    #[inline]
    pub fn now(&self) -> DateTime {
        self.clock.now()
    }

    #[must_use]
    #[inline]
    pub fn is_root(&self, cluster: Cluster) -> bool {
        cluster == self.boot.root_cluster()
    }

    /// Writes `buf` at the start of `cluster`, zero-filling the rest of it.
    pub fn init_cluster(&mut self, cluster: Cluster, buf: &[u8]) -> FatResult<()> {
        let mut data = vec![0; self.boot.cluster_size() as usize];
        data[..buf.len()].copy_from_slice(buf);
        self.device
            .write(&data, self.boot.cluster_start(cluster))
            .map_err(FatError::from)
    }

    /// Writes the dirty FAT sectors to every copy, then the FSInfo sector if it changed.
    pub fn flush(&mut self) -> FatResult<()> {
        self.fat.flush(&mut self.device)?;

        let (Some(sector), Some(last)) = (self.boot.fs_info_sector(), self.fs_info) else {
            return Ok(());
        };
        let free_count = self.fat.free_count_hint();
        let next_free = Some(self.fat.next_free_hint());
        if last.free_count() == free_count && last.next_free() == next_free {
            return Ok(());
        }

        let mut info = last;
        info.set_free_count(free_count);
        info.set_next_free(next_free);
        let mut block = vec![0; self.boot.bytes_per_sector() as usize];
        info.write_to(&mut block);
        self.device.write(&block, u64::from(sector))?;
        self.fs_info = Some(info);
        log::trace!("Updated FSInfo: {free_count:?} free clusters");
        Ok(())
    }
}

/// A mounted FAT32 volume.
///
/// Every node operation takes the volume it belongs to. Modified FAT sectors
/// are written by [`FatFs::flush`], by the structural node operations (create,
/// rename, move, delete and file flushes) and whenever a file's chain grows or
/// shrinks. Dropping the volume writes nothing.
pub struct FatFs<D> {
    volume: Volume<D>,
    /// Loaded directory tables, by first cluster.
    tables: HashMap<Cluster, DirectoryTable>,
}

impl<D: BlockDevice> FatFs<D> {
    /// Mounts the FAT32 volume found at block 0 of `device`.
    pub fn mount(device: D, options: MountOptions) -> FatResult<Self> {
        let volume = Volume::open(device, options)?;
        log::info!(
            "Mounted FAT32 volume {:?}: {} clusters of {} bytes",
            volume.boot.volume_label(),
            volume.boot.cluster_count(),
            volume.boot.cluster_size()
        );
        Ok(Self {
            volume,
            tables: HashMap::new(),
        })
    }

    #[must_use]
    #[inline]
    pub fn root(&self) -> FatDirectory {
        FatDirectory::root(self.volume.boot.root_cluster())
    }

    /// Label from the root directory, or from the boot sector when the root has none.
    pub fn volume_label(&mut self) -> FatResult<String> {
        let root = self.volume.boot.root_cluster();
        let (table, volume) = self.table_and_volume(root)?;
        Ok(table
            .volume_label()
            .unwrap_or_else(|| volume.boot.volume_label())
            .into())
    }

    #[must_use]
    #[inline]
    pub const fn cluster_size(&self) -> u32 {
        self.volume.boot.cluster_size()
    }

    #[must_use]
    #[inline]
    /// Size of the data area in bytes.
    pub fn capacity(&self) -> u64 {
        u64::from(self.volume.boot.cluster_count()) * u64::from(self.volume.boot.cluster_size())
    }

    /// Free space in bytes.
    pub fn free_space(&mut self) -> FatResult<u64> {
        let free = self.volume.fat.free_clusters(&mut self.volume.device)?;
        Ok(u64::from(free) * u64::from(self.volume.boot.cluster_size()))
    }

    #[must_use]
    #[inline]
    pub const fn boot_sector(&self) -> &BootSector {
        &self.volume.boot
    }

    #[must_use]
    #[inline]
    pub const fn device(&self) -> &D {
        &self.volume.device
    }

    /// Writes every pending FAT and FSInfo change.
    pub fn flush(&mut self) -> FatResult<()> {
        self.volume.flush()
    }

    /// Flushes the volume and hands the device back.
    pub fn unmount(mut self) -> FatResult<D> {
        self.flush()?;
        Ok(self.volume.device)
    }

    #[inline]
    pub(crate) const fn volume_mut(&mut self) -> &mut Volume<D> {
        &mut self.volume
    }

    /// Returns the table of the directory starting at `cluster`, loading it if needed.
    pub(crate) fn table_and_volume(
        &mut self,
        cluster: Cluster,
    ) -> FatResult<(&mut DirectoryTable, &mut Volume<D>)> {
        let table = match self.tables.entry(cluster) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let is_root = self.volume.is_root(cluster);
                entry.insert(DirectoryTable::load(&mut self.volume, cluster, is_root)?)
            }
        };
        Ok((table, &mut self.volume))
    }

    #[inline]
    pub(crate) fn table(&mut self, cluster: Cluster) -> FatResult<&mut DirectoryTable> {
        self.table_and_volume(cluster).map(|(table, _)| table)
    }

    /// Forgets the table of a deleted directory.
    pub(crate) fn drop_table(&mut self, cluster: Cluster) {
        self.tables.remove(&cluster);
    }

    /// Builds the handle of the directory starting at `cluster`.
    pub(crate) fn directory_at(&mut self, cluster: Cluster) -> FatResult<FatDirectory> {
        if self.volume.is_root(cluster) {
            return Ok(self.root());
        }
        let parent = self.parent_of(cluster)?;
        let record = self
            .table(parent)?
            .find_by_cluster(cluster)
            .cloned()
            .ok_or(FatError::NotFound)?;
        Ok(FatDirectory::from_record(parent, record))
    }

    /// First cluster of the parent of the directory starting at `cluster`, from its `..` entry.
    pub(crate) fn parent_of(&mut self, cluster: Cluster) -> FatResult<Cluster> {
        let root = self.volume.boot.root_cluster();
        let dotdot = self
            .table(cluster)?
            .dotdot()
            .ok_or(FatError::InvalidFilesystem("directory without a '..' entry"))?;
        Ok(if dotdot.is_free() { root } else { dotdot })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        MemoryDevice,
        fs::fat::format::{FormatOptions, format},
    };

    fn formatted() -> MemoryDevice {
        let mut device = MemoryDevice::new(512, 8192);
        format(&mut device, &FormatOptions::new().with_volume_label("TESTVOL")).unwrap();
        device
    }

    #[test]
    fn test_mount_reads_geometry() {
        let mut fs = FatFs::mount(formatted(), MountOptions::new()).unwrap();
        assert_eq!(fs.cluster_size(), 4096);
        assert_eq!(fs.volume_label().unwrap(), "TESTVOL");
        assert!(fs.root().is_root());

        let clusters = u64::from(fs.boot_sector().cluster_count());
        assert_eq!(fs.capacity(), clusters * 4096);
        // The root directory holds the only used cluster.
        assert_eq!(fs.free_space().unwrap(), (clusters - 1) * 4096);
    }

    struct Records(std::sync::Mutex<Vec<(log::Level, String)>>);

    impl log::Log for Records {
        fn enabled(&self, _metadata: &log::Metadata) -> bool {
            true
        }

        fn log(&self, record: &log::Record) {
            self.0
                .lock()
                .unwrap()
                .push((record.level(), record.args().to_string()));
        }

        fn flush(&self) {}
    }

    static RECORDS: Records = Records(std::sync::Mutex::new(Vec::new()));

    #[test]
    fn test_mount_is_logged() {
        // Fails harmlessly if a logger is already installed.
        let _ = log::set_logger(&RECORDS);
        log::set_max_level(log::LevelFilter::Info);

        FatFs::mount(formatted(), MountOptions::new()).unwrap();
        let records = RECORDS.0.lock().unwrap();
        assert!(records.iter().any(|(level, message)| {
            *level == log::Level::Info
                && message.starts_with("Mounted FAT32 volume")
                && message.contains("TESTVOL")
        }));
    }

    #[test]
    fn test_mount_rejects_garbage() {
        let device = MemoryDevice::new(512, 8192);
        assert!(matches!(
            FatFs::mount(device, MountOptions::new()),
            Err(FatError::InvalidFilesystem(_))
        ));
    }

    #[test]
    fn test_bad_fs_info_is_ignored() {
        let mut device = formatted();
        device.as_bytes_mut()[512] = 0;
        let mut fs = FatFs::mount(device, MountOptions::new()).unwrap();

        // Counted from the FAT instead.
        let clusters = u64::from(fs.boot_sector().cluster_count());
        assert_eq!(fs.free_space().unwrap(), (clusters - 1) * 4096);

        // And never rewritten.
        fs.root().create_file(&mut fs, "a.txt").unwrap();
        let device = fs.unmount().unwrap();
        assert_eq!(device.as_bytes()[512], 0);
    }
}
