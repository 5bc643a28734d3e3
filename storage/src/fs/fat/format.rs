//! Creation of empty FAT32 volumes.
use super::{
    Cluster, FatError, FatResult,
    bs::{BootSector, ExtendedBootSector},
    date::DateTime,
    dirent::{Attributes, DirEntry, ShortName},
    fat::fat32,
    fsinfo::FsInfoSector,
};
use crate::BlockDevice;
use alloc::vec;
use msd_core::layout::PackedLayout;

const MEDIA_FIXED: u8 = 0xF8;
/// Sectors of the FATs written per device call.
const ZERO_CHUNK_SECTORS: u32 = 32;

/// Geometry and identity of a volume created by [`format`].
#[derive(Debug, Clone)]
pub struct FormatOptions {
    sectors_per_cluster: u8,
    reserved_sectors: u16,
    fat_count: u8,
    volume_id: Option<u32>,
    volume_label: Option<[u8; 11]>,
    invalid_label: bool,
    timestamp: DateTime,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            sectors_per_cluster: 8,
            reserved_sectors: 32,
            fat_count: 2,
            volume_id: None,
            volume_label: None,
            invalid_label: false,
            timestamp: DateTime::EPOCH,
        }
    }
}

impl FormatOptions {
    #[must_use]
    #[inline]
    /// Eight sectors per cluster, 32 reserved sectors, two FATs and no label.
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    #[inline]
    pub const fn with_sectors_per_cluster(mut self, sectors: u8) -> Self {
        self.sectors_per_cluster = sectors;
        self
    }

    #[must_use]
    #[inline]
    pub const fn with_reserved_sectors(mut self, sectors: u16) -> Self {
        self.reserved_sectors = sectors;
        self
    }

    #[must_use]
    #[inline]
    pub const fn with_fat_count(mut self, count: u8) -> Self {
        self.fat_count = count;
        self
    }

    #[must_use]
    #[inline]
    /// Serial number of the volume. Derived from the timestamp when not set.
    pub const fn with_volume_id(mut self, id: u32) -> Self {
        self.volume_id = Some(id);
        self
    }

    #[must_use]
    /// Label of up to 11 printable ASCII characters, stored upper case.
    pub fn with_volume_label(mut self, label: &str) -> Self {
        self.volume_label = encode_label(label);
        self.invalid_label = self.volume_label.is_none();
        self
    }

    #[must_use]
    #[inline]
    /// Creation time of the root directory label entry.
    pub const fn with_timestamp(mut self, timestamp: DateTime) -> Self {
        self.timestamp = timestamp;
        self
    }
}

fn encode_label(label: &str) -> Option<[u8; 11]> {
    let forbidden = |b: u8| b < b' ' || b > b'~' || b"\"*+,./:;<=>?[\\]|".contains(&b);
    if label.is_empty() || label.len() > 11 || label.bytes().any(forbidden) {
        return None;
    }
    let mut raw = [b' '; 11];
    for (dst, src) in raw.iter_mut().zip(label.bytes()) {
        *dst = src.to_ascii_uppercase();
    }
    Some(raw)
}

/// Number of sectors each FAT needs to cover the clusters left once the FATs are placed.
fn sectors_per_fat(
    total_sectors: u32,
    bytes_per_sector: u32,
    options: &FormatOptions,
) -> FatResult<u32> {
    let reserved = u32::from(options.reserved_sectors);
    let fat_count = u32::from(options.fat_count);
    let entries_per_sector = bytes_per_sector / fat32::ENTRY_SIZE as u32;

    let mut sectors = 1;
    loop {
        let metadata = reserved + fat_count * sectors;
        if metadata >= total_sectors {
            return Err(FatError::UsageError("device too small for a FAT32 volume"));
        }
        let clusters = (total_sectors - metadata) / u32::from(options.sectors_per_cluster);
        let needed = (clusters + 2).div_ceil(entries_per_sector);
        if needed <= sectors {
            return Ok(sectors);
        }
        sectors = needed;
    }
}

/// Writes an empty FAT32 volume over the whole device.
///
/// The sector size is the block size of the device. The root directory takes
/// the first data cluster and holds the volume label, if any.
pub fn format<D: BlockDevice>(device: &mut D, options: &FormatOptions) -> FatResult<()> {
    if options.invalid_label {
        return Err(FatError::InvalidName);
    }
    let bytes_per_sector = u16::try_from(device.block_size())
        .map_err(|_| FatError::UsageError("unsupported sector size"))?;
    if options.sectors_per_cluster == 0 {
        return Err(FatError::UsageError("sectors per cluster is not a power of two"));
    }
    let total_sectors = u32::try_from(device.block_count()).unwrap_or(u32::MAX);
    let fat_sectors = sectors_per_fat(total_sectors, u32::from(bytes_per_sector), options)?;

    let (date, time) = (options.timestamp.date(), options.timestamp.time());
    let volume_id = options
        .volume_id
        .unwrap_or_else(|| (u32::from(date.to_dos()) << 16) | u32::from(time.to_dos().0));

    let raw = ExtendedBootSector::new()
        .with_bytes_per_sector(bytes_per_sector)
        .with_sectors_per_cluster(options.sectors_per_cluster)
        .with_reserved_sectors(options.reserved_sectors)
        .with_fat_count(options.fat_count)
        .with_media_descriptor(MEDIA_FIXED)
        .with_total_sectors(total_sectors)
        .with_sectors_per_fat(fat_sectors)
        .with_root_cluster(Cluster::FIRST_DATA.value())
        .with_volume_id(volume_id)
        .with_volume_label(options.volume_label.unwrap_or(ExtendedBootSector::NO_NAME));

    let mut sector = vec![0; usize::from(bytes_per_sector)];
    raw.write_to(&mut sector);
    // Validates the geometry the same way mounting does.
    let boot = BootSector::parse(&sector).map_err(|err| match err {
        FatError::InvalidFilesystem(reason) => FatError::UsageError(reason),
        err => err,
    })?;

    // Boot sector and its backup.
    device.write(&sector, 0)?;
    if let Some(backup) = boot.backup_boot_sector() {
        device.write(&sector, u64::from(backup))?;
    }

    // Only the root directory is in use.
    let info = FsInfoSector::new(
        Some(boot.cluster_count() - 1),
        Some(Cluster::FIRST_DATA.value() + 1),
    );
    sector.fill(0);
    info.write_to(&mut sector);
    if let Some(fs_info) = boot.fs_info_sector() {
        device.write(&sector, u64::from(fs_info))?;
        if let Some(backup) = boot.backup_boot_sector() {
            device.write(&sector, u64::from(backup + fs_info))?;
        }
    }

    write_fats(device, &boot)?;

    // Empty root directory, with the label entry first.
    let mut root = vec![0; boot.cluster_size() as usize];
    if let Some(label) = options.volume_label {
        let entry = DirEntry::new(
            ShortName::new(label),
            Attributes::new(Attributes::VOLUME_ID),
            options.timestamp,
        );
        entry.write_to(&mut root);
    }
    device.write(&root, boot.cluster_start(boot.root_cluster()))?;

    log::info!(
        "Formatted FAT32 volume: {} clusters of {} bytes, {} sectors per FAT",
        boot.cluster_count(),
        boot.cluster_size(),
        fat_sectors
    );
    Ok(())
}

/// Zeroes every FAT, then marks the reserved entries and the root directory.
fn write_fats<D: BlockDevice>(device: &mut D, boot: &BootSector) -> FatResult<()> {
    let bytes_per_sector = boot.bytes_per_sector() as usize;
    let zeros = vec![0; bytes_per_sector * ZERO_CHUNK_SECTORS as usize];

    let mut head = vec![0; bytes_per_sector];
    head[..4].copy_from_slice(&(0x0FFF_FF00 | u32::from(MEDIA_FIXED)).to_le_bytes());
    head[4..8].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
    let root = boot.root_cluster().value() as usize * fat32::ENTRY_SIZE;
    head[root..root + 4].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());

    for mirror in 0..boot.fat_count() {
        let start = boot.fat_start(mirror);
        let mut done = 1;
        while done < boot.sectors_per_fat() {
            let count = (boot.sectors_per_fat() - done).min(ZERO_CHUNK_SECTORS);
            let len = count as usize * bytes_per_sector;
            device.write(&zeros[..len], start + u64::from(done))?;
            done += count;
        }
        device.write(&head, start)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        MemoryDevice,
        fs::fat::{
            FatFs, MountOptions,
            fat::{Fat, FatEntry},
        },
    };

    #[test]
    fn test_default_geometry() {
        let mut device = MemoryDevice::new(512, 8192);
        format(&mut device, &FormatOptions::new()).unwrap();

        let boot = BootSector::read(&mut device).unwrap();
        assert_eq!(boot.bytes_per_sector(), 512);
        assert_eq!(boot.cluster_size(), 4096);
        assert_eq!(boot.reserved_sectors(), 32);
        assert_eq!(boot.fat_count(), 2);
        assert_eq!(boot.sectors_per_fat(), 8);
        assert_eq!(boot.data_start(), 48);
        assert_eq!(boot.cluster_count(), 1018);
        assert_eq!(boot.root_cluster(), Cluster::FIRST_DATA);
        assert_eq!(boot.volume_label(), "NO NAME");

        // Backup boot sector.
        let bytes = device.as_bytes();
        assert_eq!(bytes[..512], bytes[6 * 512..7 * 512]);
    }

    #[test]
    fn test_fat_and_fs_info() {
        let mut device = MemoryDevice::new(512, 8192);
        format(&mut device, &FormatOptions::new()).unwrap();
        let boot = BootSector::read(&mut device).unwrap();

        let bytes = device.as_bytes();
        let fat0 = &bytes[32 * 512..40 * 512];
        let fat1 = &bytes[40 * 512..48 * 512];
        assert_eq!(fat0, fat1);
        assert_eq!(fat0[..4], [0xF8, 0xFF, 0xFF, 0x0F]);
        assert_eq!(fat0[4..8], [0xFF, 0xFF, 0xFF, 0x0F]);
        assert!(fat0[12..].iter().all(|&b| b == 0));

        let info = FsInfoSector::read_from(&bytes[512..1024]).unwrap();
        assert!(info.is_valid());
        assert_eq!(info.free_count(), Some(boot.cluster_count() - 1));
        assert_eq!(info.next_free(), Some(3));
        assert_eq!(bytes[512..1024], bytes[7 * 512..8 * 512]);

        let mut fat = Fat::new(&boot, 4, None, None);
        assert_eq!(
            fat.entry(&mut device, Cluster::FIRST_DATA).unwrap(),
            FatEntry::EndOfChain
        );
        assert_eq!(
            fat.entry(&mut device, Cluster::new(3)).unwrap(),
            FatEntry::Free
        );
        assert_eq!(
            fat.free_clusters(&mut device).unwrap(),
            boot.cluster_count() - 1
        );
    }

    #[test]
    fn test_label() {
        let mut device = MemoryDevice::new(512, 8192);
        let options = FormatOptions::new()
            .with_volume_label("backup")
            .with_volume_id(0xCAFE_F00D);
        format(&mut device, &options).unwrap();

        let boot = BootSector::read(&mut device).unwrap();
        assert_eq!(boot.volume_label(), "BACKUP");
        assert_eq!(boot.volume_id(), 0xCAFE_F00D);

        let mut fs = FatFs::mount(device, MountOptions::new()).unwrap();
        assert_eq!(fs.volume_label().unwrap(), "BACKUP");
        // The label entry is not listed.
        assert!(fs.root().list(&mut fs).unwrap().is_empty());

        let mut device = MemoryDevice::new(512, 8192);
        assert_eq!(
            format(&mut device, &FormatOptions::new().with_volume_label("way too long")),
            Err(FatError::InvalidName)
        );
        assert_eq!(
            format(&mut device, &FormatOptions::new().with_volume_label("a/b")),
            Err(FatError::InvalidName)
        );
    }

    #[test]
    fn test_large_sectors() {
        let mut device = MemoryDevice::new(4096, 2048);
        format(&mut device, &FormatOptions::new().with_sectors_per_cluster(1)).unwrap();

        let mut fs = FatFs::mount(device, MountOptions::new()).unwrap();
        assert_eq!(fs.cluster_size(), 4096);
        let mut file = fs.root().create_file(&mut fs, "x.bin").unwrap();
        file.write(&mut fs, 0, &[1; 6000]).unwrap();
        file.close(&mut fs).unwrap();
        assert_eq!(fs.root().search(&mut fs, "x.bin").unwrap().unwrap().length(), 6000);
    }

    #[test]
    fn test_rejects_bad_geometry() {
        let mut device = MemoryDevice::new(512, 40);
        assert!(matches!(
            format(&mut device, &FormatOptions::new()),
            Err(FatError::UsageError(_))
        ));

        let mut device = MemoryDevice::new(512, 8192);
        assert!(matches!(
            format(&mut device, &FormatOptions::new().with_sectors_per_cluster(3)),
            Err(FatError::UsageError(_))
        ));
        assert!(matches!(
            format(&mut device, &FormatOptions::new().with_fat_count(0)),
            Err(FatError::UsageError(_))
        ));
    }
}
