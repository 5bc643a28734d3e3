//! Formatted in-memory volumes shared by the FAT32 tests.
#![allow(dead_code)]

use storage::{
    MemoryDevice,
    fs::fat::{
        FatFs, MountOptions,
        date::{Date, DateTime, FixedClock, Time},
        format::{FormatOptions, format},
    },
};

pub const BLOCK_SIZE: usize = 512;
/// 8 MiB: 2040 clusters of 4 KiB after 32 reserved sectors and two 16-sector FATs.
pub const BLOCK_COUNT: usize = 16384;
pub const CLUSTER_SIZE: usize = 4096;
pub const FAT_START: usize = 32;
pub const SECTORS_PER_FAT: usize = 16;
pub const DATA_START: usize = 64;
pub const LABEL: &str = "USBDRIVE";

pub fn now() -> DateTime {
    DateTime::new(
        Date::new(2024, 2, 29).unwrap(),
        Time::new(23, 59, 58, 0).unwrap(),
    )
}

pub fn formatted() -> MemoryDevice {
    let mut device = MemoryDevice::new(BLOCK_SIZE, BLOCK_COUNT);
    format(&mut device, &FormatOptions::new().with_volume_label(LABEL)).unwrap();
    device
}

pub fn options() -> MountOptions {
    MountOptions::new().with_clock(FixedClock(now()))
}

pub fn mount<D: storage::BlockDevice>(device: D) -> FatFs<D> {
    FatFs::mount(device, options()).unwrap()
}

/// Bytes of a data cluster in the raw image.
pub fn cluster_bytes(device: &MemoryDevice, cluster: u32) -> &[u8] {
    let start = (DATA_START + (cluster as usize - 2) * 8) * BLOCK_SIZE;
    &device.as_bytes()[start..start + CLUSTER_SIZE]
}

/// Raw copy `mirror` of the FAT.
pub fn fat_bytes(device: &MemoryDevice, mirror: usize) -> &[u8] {
    let start = (FAT_START + mirror * SECTORS_PER_FAT) * BLOCK_SIZE;
    &device.as_bytes()[start..start + SECTORS_PER_FAT * BLOCK_SIZE]
}

/// Raw FAT entry of `cluster` in the first FAT.
pub fn fat_entry(device: &MemoryDevice, cluster: u32) -> u32 {
    let offset = cluster as usize * 4;
    let bytes = &fat_bytes(device, 0)[offset..offset + 4];
    u32::from_le_bytes(bytes.try_into().unwrap()) & 0x0FFF_FFFF
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
