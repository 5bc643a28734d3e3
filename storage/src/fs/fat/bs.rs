//! FAT32 boot sector
use super::{Cluster, FatError, FatResult};
use crate::BlockDevice;
use alloc::{string::String, vec};
use msd_core::{layout::PackedLayout, static_assert};

/// BIOS Parameter Block (BPB) of a FAT32 volume.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct ExtendedBootParamBlock {
    /// Bytes per sector.
    ///
    /// This field is either 512, 1024, 2048, or 4096.
    bytes_per_sector: u16,
    sectors_per_cluster: u8,
    reserved_sectors: u16,
    fat_count: u8,
    /// Must be 0 on FAT32.
    root_entries: u16,
    /// Must be 0 on FAT32, `total_sectors_large` holds the count.
    total_sectors: u16,
    /// Example: 0xF8 for fixed disk and 0xF0 for removable disk.
    media_descriptor: u8,
    /// Must be 0 on FAT32, `sectors_per_fat_large` holds the count.
    sectors_per_fat: u16,
    sectors_per_track: u16,
    heads: u16,
    hidden_sectors: u32,
    total_sectors_large: u32,
    sectors_per_fat_large: u32,
    /// Bit 7 set: only the FAT numbered by bits 0-3 is active.
    ext_flags: u16,
    version: u16,
    root_cluster: u32,
    fs_info_sector: u16,
    backup_boot_sector: u16,
    _reserved: [u8; 12],
    drive_number: u8,
    _reserved1: u8,
    /// 0x29 when the three following fields are present.
    boot_flag: u8,
    volume_id: u32,
    volume_label: [u8; 11],
    fs_type: [u8; 8],
}

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct ExtendedBootSector {
    boot_jump: [u8; 3],
    oem_name: [u8; 8],
    bpb: ExtendedBootParamBlock,
    boot_code: [u8; 420],
    boot_signature: [u8; 2],
}
static_assert!(
    size_of::<ExtendedBootSector>() == 512,
    "ExtendedBootSector size is not 512 bytes"
);

// Safety: packed, made of integers and byte arrays only.
unsafe impl PackedLayout for ExtendedBootSector {}

impl Default for ExtendedBootSector {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtendedBootSector {
    pub const SIGNATURE: [u8; 2] = [0x55, 0xAA];
    /// Label of volumes without a name.
    pub const NO_NAME: [u8; 11] = *b"NO NAME    ";

    #[must_use]
    /// A 512-byte sector, 4 KiB cluster volume with two FATs and an empty geometry.
    pub const fn new() -> Self {
        Self {
            boot_jump: [0xEB, 0x58, 0x90],
            oem_name: *b"MSWIN4.1",
            bpb: ExtendedBootParamBlock {
                bytes_per_sector: 512u16.to_le(),
                sectors_per_cluster: 8,
                reserved_sectors: 32u16.to_le(),
                fat_count: 2,
                root_entries: 0,
                total_sectors: 0,
                media_descriptor: 0xF8,
                sectors_per_fat: 0,
                sectors_per_track: 63u16.to_le(),
                heads: 255u16.to_le(),
                hidden_sectors: 0,
                total_sectors_large: 0,
                sectors_per_fat_large: 0,
                ext_flags: 0,
                version: 0,
                root_cluster: 2u32.to_le(),
                fs_info_sector: 1u16.to_le(),
                backup_boot_sector: 6u16.to_le(),
                _reserved: [0; 12],
                drive_number: 0x80,
                _reserved1: 0,
                boot_flag: 0x29,
                volume_id: 0,
                volume_label: Self::NO_NAME,
                fs_type: *b"FAT32   ",
            },
            boot_code: [0; 420],
            boot_signature: Self::SIGNATURE,
        }
    }

    #[must_use]
    #[inline]
    pub const fn with_bytes_per_sector(mut self, bytes: u16) -> Self {
        self.bpb.bytes_per_sector = bytes.to_le();
        self
    }

    #[must_use]
    #[inline]
    pub const fn with_sectors_per_cluster(mut self, sectors: u8) -> Self {
        self.bpb.sectors_per_cluster = sectors;
        self
    }

    #[must_use]
    #[inline]
    pub const fn with_reserved_sectors(mut self, sectors: u16) -> Self {
        self.bpb.reserved_sectors = sectors.to_le();
        self
    }

    #[must_use]
    #[inline]
    pub const fn with_fat_count(mut self, count: u8) -> Self {
        self.bpb.fat_count = count;
        self
    }

    #[must_use]
    #[inline]
    pub const fn with_media_descriptor(mut self, media: u8) -> Self {
        self.bpb.media_descriptor = media;
        self
    }

    #[must_use]
    #[inline]
    pub const fn with_total_sectors(mut self, sectors: u32) -> Self {
        self.bpb.total_sectors_large = sectors.to_le();
        self
    }

    #[must_use]
    #[inline]
    pub const fn with_sectors_per_fat(mut self, sectors: u32) -> Self {
        self.bpb.sectors_per_fat_large = sectors.to_le();
        self
    }

    #[must_use]
    #[inline]
    pub const fn with_root_cluster(mut self, cluster: u32) -> Self {
        self.bpb.root_cluster = cluster.to_le();
        self
    }

    #[must_use]
    #[inline]
    pub const fn with_fs_info_sector(mut self, sector: u16) -> Self {
        self.bpb.fs_info_sector = sector.to_le();
        self
    }

    #[must_use]
    #[inline]
    pub const fn with_backup_boot_sector(mut self, sector: u16) -> Self {
        self.bpb.backup_boot_sector = sector.to_le();
        self
    }

    #[must_use]
    #[inline]
    pub const fn with_volume_id(mut self, id: u32) -> Self {
        self.bpb.volume_id = id.to_le();
        self
    }

    #[must_use]
    #[inline]
    pub const fn with_volume_label(mut self, label: [u8; 11]) -> Self {
        self.bpb.volume_label = label;
        self
    }

    #[must_use]
    #[inline]
    pub const fn bytes_per_sector(&self) -> u16 {
        u16::from_le(self.bpb.bytes_per_sector)
    }

    #[must_use]
    #[inline]
    pub const fn sectors_per_cluster(&self) -> u8 {
        self.bpb.sectors_per_cluster
    }

    #[must_use]
    #[inline]
    pub const fn reserved_sectors(&self) -> u16 {
        u16::from_le(self.bpb.reserved_sectors)
    }

    #[must_use]
    #[inline]
    pub const fn fat_count(&self) -> u8 {
        self.bpb.fat_count
    }

    #[must_use]
    #[inline]
    pub const fn media_descriptor(&self) -> u8 {
        self.bpb.media_descriptor
    }

    #[must_use]
    #[inline]
    pub const fn total_sectors(&self) -> u32 {
        u32::from_le(self.bpb.total_sectors_large)
    }

    #[must_use]
    #[inline]
    pub const fn sectors_per_fat(&self) -> u32 {
        u32::from_le(self.bpb.sectors_per_fat_large)
    }

    #[must_use]
    #[inline]
    pub const fn ext_flags(&self) -> u16 {
        u16::from_le(self.bpb.ext_flags)
    }

    #[must_use]
    #[inline]
    pub const fn root_cluster(&self) -> u32 {
        u32::from_le(self.bpb.root_cluster)
    }

    #[must_use]
    #[inline]
    pub const fn fs_info_sector(&self) -> u16 {
        u16::from_le(self.bpb.fs_info_sector)
    }

    #[must_use]
    #[inline]
    pub const fn backup_boot_sector(&self) -> u16 {
        u16::from_le(self.bpb.backup_boot_sector)
    }

    #[must_use]
    #[inline]
    pub const fn volume_id(&self) -> u32 {
        u32::from_le(self.bpb.volume_id)
    }

    #[must_use]
    #[inline]
    pub const fn volume_label(&self) -> [u8; 11] {
        self.bpb.volume_label
    }

    /// Checks the signature, the FAT32 markers and the volume geometry.
    pub fn validate(&self) -> Result<(), &'static str> {
        const MAX_BYTES_PER_CLUSTER: u32 = 64 * 1024;
        const MAX_FAT_COUNT: u8 = 2;

        if self.boot_signature != Self::SIGNATURE {
            return Err("missing boot sector signature");
        }

        let bytes_per_sector = self.bytes_per_sector();
        if !bytes_per_sector.is_power_of_two() || !(512..=4096).contains(&bytes_per_sector) {
            return Err("unsupported sector size");
        }

        let sectors_per_cluster = self.sectors_per_cluster();
        if !sectors_per_cluster.is_power_of_two() {
            return Err("sectors per cluster is not a power of two");
        }
        if u32::from(bytes_per_sector) * u32::from(sectors_per_cluster) > MAX_BYTES_PER_CLUSTER {
            return Err("cluster larger than 64 KiB");
        }

        let reserved = self.reserved_sectors();
        if reserved == 0 {
            return Err("no reserved sectors");
        }
        for sector in [self.fs_info_sector(), self.backup_boot_sector()] {
            if sector != 0 && sector != u16::MAX && sector >= reserved {
                return Err("FSInfo or backup sector outside the reserved area");
            }
        }

        if self.fat_count() == 0 || self.fat_count() > MAX_FAT_COUNT {
            return Err("unsupported FAT count");
        }

        // FAT12/16 keep their sizes in the 16-bit fields.
        if u16::from_le(self.bpb.root_entries) != 0
            || u16::from_le(self.bpb.total_sectors) != 0
            || u16::from_le(self.bpb.sectors_per_fat) != 0
            || self.sectors_per_fat() == 0
        {
            return Err("not a FAT32 volume");
        }

        if self.root_cluster() < Cluster::FIRST_DATA.value() {
            return Err("invalid root cluster");
        }

        let metadata =
            u64::from(reserved) + u64::from(self.fat_count()) * u64::from(self.sectors_per_fat());
        if metadata >= u64::from(self.total_sectors()) {
            return Err("no data area");
        }

        Ok(())
    }
}

/// Geometry of a mounted FAT32 volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootSector {
    bytes_per_sector: u32,
    sectors_per_cluster: u32,
    reserved_sectors: u32,
    fat_count: u8,
    sectors_per_fat: u32,
    root_cluster: Cluster,
    total_sectors: u32,
    fs_info_sector: Option<u32>,
    backup_boot_sector: Option<u32>,
    ext_flags: u16,
    volume_id: u32,
    volume_label: String,
    cluster_count: u32,
}

impl BootSector {
    /// Reads and validates the boot sector at block 0 of `device`.
    pub fn read<D: BlockDevice>(device: &mut D) -> FatResult<Self> {
        let block_size = device.block_size();
        if block_size < ExtendedBootSector::SIZE {
            return Err(FatError::InvalidFilesystem("block size below 512 bytes"));
        }
        let mut block = vec![0; block_size];
        device.read(&mut block, 0)?;

        let boot = Self::parse(&block)?;
        if boot.bytes_per_sector as usize != block_size {
            return Err(FatError::InvalidFilesystem(
                "sector size differs from the device block size",
            ));
        }
        if u64::from(boot.total_sectors) > device.block_count() {
            return Err(FatError::InvalidFilesystem("volume larger than the device"));
        }
        Ok(boot)
    }

    /// Parses the raw boot sector.
    pub fn parse(sector: &[u8]) -> FatResult<Self> {
        let raw = ExtendedBootSector::read_from(sector)
            .ok_or(FatError::InvalidFilesystem("boot sector too short"))?;
        raw.validate().map_err(FatError::InvalidFilesystem)?;

        let bytes_per_sector = u32::from(raw.bytes_per_sector());
        let sectors_per_cluster = u32::from(raw.sectors_per_cluster());
        let reserved_sectors = u32::from(raw.reserved_sectors());
        let data_start = reserved_sectors + u32::from(raw.fat_count()) * raw.sectors_per_fat();

        // The data area and the FAT size both bound the number of usable clusters.
        let data_clusters = (raw.total_sectors() - data_start) / sectors_per_cluster;
        let fat_entries = raw.sectors_per_fat().saturating_mul(bytes_per_sector / 4);
        let cluster_count = data_clusters
            .min(fat_entries.saturating_sub(2))
            .min(Cluster::MAX_DATA - 1);
        if cluster_count == 0 {
            return Err(FatError::InvalidFilesystem("no data clusters"));
        }

        let root_cluster = Cluster::new(raw.root_cluster());
        if !root_cluster.is_data(cluster_count + 1) {
            return Err(FatError::InvalidFilesystem("root cluster outside the data area"));
        }

        let optional_sector = |sector: u16| (sector != 0 && sector != u16::MAX).then_some(u32::from(sector));
        let label = raw.volume_label();

        Ok(Self {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            fat_count: raw.fat_count(),
            sectors_per_fat: raw.sectors_per_fat(),
            root_cluster,
            total_sectors: raw.total_sectors(),
            fs_info_sector: optional_sector(raw.fs_info_sector()),
            backup_boot_sector: optional_sector(raw.backup_boot_sector()),
            ext_flags: raw.ext_flags(),
            volume_id: raw.volume_id(),
            volume_label: String::from_utf8_lossy(&label).trim_end().into(),
            cluster_count,
        })
    }

    #[must_use]
    #[inline]
    pub const fn bytes_per_sector(&self) -> u32 {
        self.bytes_per_sector
    }

    #[must_use]
    #[inline]
    pub const fn sectors_per_cluster(&self) -> u32 {
        self.sectors_per_cluster
    }

    #[must_use]
    #[inline]
    pub const fn reserved_sectors(&self) -> u32 {
        self.reserved_sectors
    }

    #[must_use]
    #[inline]
    pub const fn fat_count(&self) -> u8 {
        self.fat_count
    }

    #[must_use]
    #[inline]
    pub const fn sectors_per_fat(&self) -> u32 {
        self.sectors_per_fat
    }

    #[must_use]
    #[inline]
    pub const fn root_cluster(&self) -> Cluster {
        self.root_cluster
    }

    #[must_use]
    #[inline]
    pub const fn total_sectors(&self) -> u32 {
        self.total_sectors
    }

    #[must_use]
    #[inline]
    pub const fn fs_info_sector(&self) -> Option<u32> {
        self.fs_info_sector
    }

    #[must_use]
    #[inline]
    pub const fn backup_boot_sector(&self) -> Option<u32> {
        self.backup_boot_sector
    }

    #[must_use]
    #[inline]
    pub const fn volume_id(&self) -> u32 {
        self.volume_id
    }

    #[must_use]
    #[inline]
    pub fn volume_label(&self) -> &str {
        &self.volume_label
    }

    #[must_use]
    #[inline]
    /// FAT copy the volume reads from when mirroring is disabled.
    pub const fn active_fat(&self) -> u8 {
        if self.ext_flags & 0x80 != 0 && ((self.ext_flags & 0x0F) as u8) < self.fat_count {
            (self.ext_flags & 0x0F) as u8
        } else {
            0
        }
    }

    #[must_use]
    #[inline]
    /// Number of clusters in the data area.
    pub const fn cluster_count(&self) -> u32 {
        self.cluster_count
    }

    #[must_use]
    #[inline]
    /// Highest valid data cluster number.
    pub const fn max_cluster(&self) -> u32 {
        self.cluster_count + 1
    }

    #[must_use]
    #[inline]
    pub const fn cluster_size(&self) -> u32 {
        self.bytes_per_sector * self.sectors_per_cluster
    }

    #[must_use]
    #[inline]
    /// First sector of the given FAT copy.
    pub const fn fat_start(&self, mirror: u8) -> u64 {
        self.reserved_sectors as u64 + mirror as u64 * self.sectors_per_fat as u64
    }

    #[must_use]
    #[inline]
    pub const fn data_start(&self) -> u64 {
        self.fat_start(self.fat_count)
    }

    #[must_use]
    #[inline]
    /// First sector of a data cluster.
    pub const fn cluster_start(&self, cluster: Cluster) -> u64 {
        self.data_start()
            + (cluster.value() - Cluster::FIRST_DATA.value()) as u64
                * self.sectors_per_cluster as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryDevice;

    fn sample() -> ExtendedBootSector {
        ExtendedBootSector::new()
            .with_total_sectors(8192)
            .with_sectors_per_fat(8)
            .with_volume_label(*b"USB STICK  ")
            .with_volume_id(0x1234_5678)
    }

    #[test]
    fn test_parse_geometry() {
        let boot = BootSector::parse(sample().as_bytes()).unwrap();
        assert_eq!(boot.bytes_per_sector(), 512);
        assert_eq!(boot.cluster_size(), 4096);
        assert_eq!(boot.fat_start(0), 32);
        assert_eq!(boot.fat_start(1), 40);
        assert_eq!(boot.data_start(), 48);
        assert_eq!(boot.cluster_count(), (8192 - 48) / 8);
        assert_eq!(boot.root_cluster(), Cluster::new(2));
        assert_eq!(boot.cluster_start(Cluster::new(3)), 56);
        assert_eq!(boot.fs_info_sector(), Some(1));
        assert_eq!(boot.volume_label(), "USB STICK");
        assert_eq!(boot.volume_id(), 0x1234_5678);
        assert_eq!(boot.active_fat(), 0);
    }

    #[test]
    fn test_cluster_count_bounded_by_fat() {
        // One FAT sector only maps 128 entries.
        let raw = sample().with_sectors_per_fat(1);
        let boot = BootSector::parse(raw.as_bytes()).unwrap();
        assert_eq!(boot.cluster_count(), 126);
    }

    #[test]
    fn test_reject_invalid() {
        let mut bytes = [0u8; 512];
        sample().write_to(&mut bytes);
        bytes[511] = 0;
        assert_eq!(
            BootSector::parse(&bytes),
            Err(FatError::InvalidFilesystem("missing boot sector signature"))
        );

        let cases = [
            sample().with_bytes_per_sector(1000),
            sample().with_sectors_per_cluster(3),
            sample().with_sectors_per_cluster(128).with_bytes_per_sector(1024),
            sample().with_reserved_sectors(0),
            sample().with_fat_count(3),
            sample().with_sectors_per_fat(0),
            sample().with_root_cluster(1),
            sample().with_total_sectors(40),
            sample().with_fs_info_sector(40),
        ];
        for raw in cases {
            assert!(matches!(
                BootSector::parse(raw.as_bytes()),
                Err(FatError::InvalidFilesystem(_))
            ));
        }

        // FAT16 keeps a 16-bit FAT size.
        let mut bytes = [0u8; 512];
        sample().write_to(&mut bytes);
        bytes[22] = 0x20;
        assert_eq!(
            BootSector::parse(&bytes),
            Err(FatError::InvalidFilesystem("not a FAT32 volume"))
        );
    }

    #[test]
    fn test_read_checks_device() {
        let mut device = MemoryDevice::new(512, 8192);
        sample().write_to(device.as_bytes_mut());
        assert!(BootSector::read(&mut device).is_ok());

        let mut small = MemoryDevice::new(512, 4096);
        sample().write_to(small.as_bytes_mut());
        assert_eq!(
            BootSector::read(&mut small),
            Err(FatError::InvalidFilesystem("volume larger than the device"))
        );

        let mut large_blocks = MemoryDevice::new(1024, 8192);
        sample().write_to(large_blocks.as_bytes_mut());
        assert_eq!(
            BootSector::read(&mut large_blocks),
            Err(FatError::InvalidFilesystem(
                "sector size differs from the device block size"
            ))
        );
    }
}
