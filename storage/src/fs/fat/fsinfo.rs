//! FAT32 FSInfo sector
//!
//! Caches the free cluster count and the next free cluster hint so that
//! mounting does not require a full FAT scan. Both values are advisory.
use msd_core::{layout::PackedLayout, static_assert};

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct FsInfoSector {
    lead_signature: u32,
    _reserved1: [u8; 480],
    struct_signature: u32,
    /// Last known free cluster count, `u32::MAX` when unknown.
    free_count: u32,
    /// Cluster where the search for a free cluster should start, `u32::MAX` when unknown.
    next_free: u32,
    _reserved2: [u8; 12],
    trail_signature: u32,
}
static_assert!(
    size_of::<FsInfoSector>() == 512,
    "FsInfoSector size is not 512 bytes"
);

// Safety: packed, made of integers and byte arrays only.
unsafe impl PackedLayout for FsInfoSector {}

impl FsInfoSector {
    pub const LEAD_SIGNATURE: u32 = 0x4161_5252;
    pub const STRUCT_SIGNATURE: u32 = 0x6141_7272;
    pub const TRAIL_SIGNATURE: u32 = 0xAA55_0000;
    const UNKNOWN: u32 = u32::MAX;

    #[must_use]
    pub const fn new(free_count: Option<u32>, next_free: Option<u32>) -> Self {
        Self {
            lead_signature: Self::LEAD_SIGNATURE.to_le(),
            _reserved1: [0; 480],
            struct_signature: Self::STRUCT_SIGNATURE.to_le(),
            free_count: match free_count {
                Some(count) => count.to_le(),
                None => Self::UNKNOWN,
            },
            next_free: match next_free {
                Some(cluster) => cluster.to_le(),
                None => Self::UNKNOWN,
            },
            _reserved2: [0; 12],
            trail_signature: Self::TRAIL_SIGNATURE.to_le(),
        }
    }

    #[must_use]
    #[inline]
    pub const fn is_valid(&self) -> bool {
        u32::from_le(self.lead_signature) == Self::LEAD_SIGNATURE
            && u32::from_le(self.struct_signature) == Self::STRUCT_SIGNATURE
            && u32::from_le(self.trail_signature) == Self::TRAIL_SIGNATURE
    }

    #[must_use]
    #[inline]
    pub const fn free_count(&self) -> Option<u32> {
        match u32::from_le(self.free_count) {
            Self::UNKNOWN => None,
            count => Some(count),
        }
    }

    #[must_use]
    #[inline]
    pub const fn next_free(&self) -> Option<u32> {
        match u32::from_le(self.next_free) {
            Self::UNKNOWN => None,
            cluster => Some(cluster),
        }
    }

    #[inline]
    pub const fn set_free_count(&mut self, count: Option<u32>) {
        self.free_count = match count {
            Some(count) => count.to_le(),
            None => Self::UNKNOWN,
        };
    }

    #[inline]
    pub const fn set_next_free(&mut self, cluster: Option<u32>) {
        self.next_free = match cluster {
            Some(cluster) => cluster.to_le(),
            None => Self::UNKNOWN,
        };
    }
}
