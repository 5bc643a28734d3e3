//! File Allocation Table
//!
//! FAT sectors are read on demand into an owned cache. Modified sectors stay in a
//! dirty set until [`Fat::flush`] writes them to every FAT copy. Nothing is
//! written behind the caller's back.
use super::{Cluster, FatError, FatResult, bs::BootSector};
use crate::BlockDevice;
use alloc::{boxed::Box, collections::BTreeSet, vec, vec::Vec};
use hashbrown::{HashMap, HashSet, hash_map::Entry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// FAT32 table entry
pub enum FatEntry {
    /// Free cluster
    Free,
    /// Used cluster, pointing to the next cluster in the chain
    Next(Cluster),
    /// Last cluster in the chain
    EndOfChain,
    /// Bad cluster
    Bad,
    /// Reserved cluster
    Reserved,
}

/// FAT32 entry encoding
pub(crate) mod fat32 {
    use super::{Cluster, FatEntry};

    /// Size of an entry in bytes.
    pub const ENTRY_SIZE: usize = 4;

    /// Decodes the entry at `offset` in a FAT sector. Only the low 28 bits are meaningful.
    pub fn read_entry(sector: &[u8], offset: usize) -> FatEntry {
        let value = u32::from_le_bytes([
            sector[offset],
            sector[offset + 1],
            sector[offset + 2],
            sector[offset + 3] & 0x0F,
        ]);

        match value {
            0 => FatEntry::Free,
            1 | 0x0FFF_FFF0..=0x0FFF_FFF6 => FatEntry::Reserved,
            0x0FFF_FFF7 => FatEntry::Bad,
            0x0FFF_FFF8..=0x0FFF_FFFF => FatEntry::EndOfChain,
            next => FatEntry::Next(Cluster::new(next)),
        }
    }

    /// Encodes `entry` at `offset` in a FAT sector, preserving the high 4 bits.
    pub fn write_entry(sector: &mut [u8], offset: usize, entry: FatEntry) {
        let value = match entry {
            FatEntry::Free => 0,
            FatEntry::Next(next) => next.value() & 0x0FFF_FFFF,
            FatEntry::EndOfChain => 0x0FFF_FFFF,
            FatEntry::Bad => 0x0FFF_FFF7,
            FatEntry::Reserved => 0x0FFF_FFF6,
        };
        let mut bytes = value.to_le_bytes();
        bytes[3] |= sector[offset + 3] & 0xF0;
        sector[offset..offset + ENTRY_SIZE].copy_from_slice(&bytes);
    }
}

/// Cached view of the FAT of a mounted volume.
pub struct Fat {
    bytes_per_sector: usize,
    sectors_per_fat: u32,
    /// First sector of the first FAT copy.
    fat_start: u64,
    fat_count: u8,
    /// Copy sectors are read from.
    active: u8,
    max_cluster: u32,
    cache: HashMap<u32, Box<[u8]>>,
    dirty: BTreeSet<u32>,
    /// Clean sectors beyond this count are evicted.
    cache_limit: usize,
    next_free: u32,
    free_count: Option<u32>,
}

impl Fat {
    #[must_use]
    /// Creates the FAT view of a volume.
    ///
    /// `free_count` and `next_free` come from the FSInfo sector and are ignored
    /// when out of range.
    pub fn new(
        boot: &BootSector,
        cache_limit: usize,
        free_count: Option<u32>,
        next_free: Option<u32>,
    ) -> Self {
        let max_cluster = boot.max_cluster();
        Self {
            bytes_per_sector: boot.bytes_per_sector() as usize,
            sectors_per_fat: boot.sectors_per_fat(),
            fat_start: boot.fat_start(0),
            fat_count: boot.fat_count(),
            active: boot.active_fat(),
            max_cluster,
            cache: HashMap::new(),
            dirty: BTreeSet::new(),
            cache_limit: cache_limit.max(1),
            next_free: next_free
                .filter(|&c| Cluster::new(c).is_data(max_cluster))
                .unwrap_or(Cluster::FIRST_DATA.value()),
            free_count: free_count.filter(|&count| count <= boot.cluster_count()),
        }
    }

    #[must_use]
    #[inline]
    pub const fn max_cluster(&self) -> u32 {
        self.max_cluster
    }

    #[must_use]
    #[inline]
    /// Cluster the next allocation starts searching from.
    pub const fn next_free_hint(&self) -> u32 {
        self.next_free
    }

    #[must_use]
    #[inline]
    /// Free cluster count, if known without a scan.
    pub const fn free_count_hint(&self) -> Option<u32> {
        self.free_count
    }

    #[must_use]
    #[inline]
    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    #[must_use]
    #[inline]
    pub fn cached_sectors(&self) -> usize {
        self.cache.len()
    }

    /// Returns the entry of `cluster`.
    pub fn entry<D: BlockDevice>(&mut self, device: &mut D, cluster: Cluster) -> FatResult<FatEntry> {
        let (sector, offset) = self.locate(cluster)?;
        let data = self.load(device, sector)?;
        Ok(fat32::read_entry(data, offset))
    }

    /// Updates the entry of `cluster` in the cache.
    pub fn set_entry<D: BlockDevice>(
        &mut self,
        device: &mut D,
        cluster: Cluster,
        entry: FatEntry,
    ) -> FatResult<()> {
        let (sector, offset) = self.locate(cluster)?;
        let data = self.load(device, sector)?;
        let old = fat32::read_entry(data, offset);
        fat32::write_entry(data, offset, entry);
        self.dirty.insert(sector);

        if let Some(count) = self.free_count.as_mut() {
            match (old, entry) {
                (FatEntry::Free, FatEntry::Free) => {}
                (FatEntry::Free, _) => *count = count.saturating_sub(1),
                (_, FatEntry::Free) => *count += 1,
                _ => {}
            }
        }
        Ok(())
    }

    /// Allocates a free cluster and marks it as the end of a chain.
    ///
    /// The search starts at the next free hint and wraps around the data area.
    pub fn allocate<D: BlockDevice>(&mut self, device: &mut D) -> FatResult<Cluster> {
        let first = Cluster::FIRST_DATA.value();
        let span = self.max_cluster - first + 1;
        let start = self.next_free - first;

        for i in 0..span {
            let value = first + (start + i) % span;
            let cluster = Cluster::new(value);
            if self.entry(device, cluster)? == FatEntry::Free {
                self.set_entry(device, cluster, FatEntry::EndOfChain)?;
                self.next_free = if value == self.max_cluster {
                    first
                } else {
                    value + 1
                };
                return Ok(cluster);
            }
        }

        self.free_count = Some(0);
        Err(FatError::DiskFull)
    }

    /// Allocates a cluster and links it after `last`.
    pub fn extend<D: BlockDevice>(&mut self, device: &mut D, last: Cluster) -> FatResult<Cluster> {
        let next = self.allocate(device)?;
        self.set_entry(device, last, FatEntry::Next(next))?;
        Ok(next)
    }

    /// Returns the clusters of the chain starting at `start`.
    ///
    /// A chain leaving the data area, looping or running into a free, bad or
    /// reserved entry is cut at that point with a warning.
    pub fn chain<D: BlockDevice>(&mut self, device: &mut D, start: Cluster) -> FatResult<Vec<Cluster>> {
        let mut clusters = Vec::new();
        if start.is_free() {
            return Ok(clusters);
        }

        let mut visited = HashSet::new();
        let mut current = start;
        loop {
            if !current.is_data(self.max_cluster) || !visited.insert(current) {
                log::warn!("Chain starting at cluster {start} leads to cluster {current}, truncating it");
                break;
            }
            clusters.push(current);
            match self.entry(device, current)? {
                FatEntry::Next(next) => current = next,
                FatEntry::EndOfChain => break,
                entry => {
                    log::warn!(
                        "Cluster {current} of the chain starting at {start} is marked {entry:?}, truncating it"
                    );
                    break;
                }
            }
        }
        Ok(clusters)
    }

    /// Frees the chain starting at `start` and returns the number of freed clusters.
    ///
    /// On a corrupted chain the clusters walked so far are freed
    /// and [`FatError::CorruptChain`] is returned.
    pub fn free<D: BlockDevice>(&mut self, device: &mut D, start: Cluster) -> FatResult<u32> {
        let mut freed = 0;
        let mut current = start;
        loop {
            if !current.is_data(self.max_cluster) {
                return Err(FatError::CorruptChain { cluster: current });
            }
            // Freed entries break loops: a revisit reads `Free`.
            match self.entry(device, current)? {
                FatEntry::Next(next) => {
                    self.set_entry(device, current, FatEntry::Free)?;
                    freed += 1;
                    current = next;
                }
                FatEntry::EndOfChain => {
                    self.set_entry(device, current, FatEntry::Free)?;
                    return Ok(freed + 1);
                }
                FatEntry::Free | FatEntry::Bad | FatEntry::Reserved => {
                    return Err(FatError::CorruptChain { cluster: current });
                }
            }
        }
    }

    /// Returns the number of free clusters, scanning the table if it is unknown.
    pub fn free_clusters<D: BlockDevice>(&mut self, device: &mut D) -> FatResult<u32> {
        if let Some(count) = self.free_count {
            return Ok(count);
        }
        let mut count = 0;
        for value in Cluster::FIRST_DATA.value()..=self.max_cluster {
            if self.entry(device, Cluster::new(value))? == FatEntry::Free {
                count += 1;
            }
        }
        log::debug!("Counted {count} free clusters");
        self.free_count = Some(count);
        Ok(count)
    }

    /// Writes every dirty sector, in ascending order, to all FAT copies.
    ///
    /// A failing copy does not stop the others. Sectors that could not be written
    /// everywhere stay dirty and the first failure is returned.
    pub fn flush<D: BlockDevice>(&mut self, device: &mut D) -> FatResult<()> {
        let mut first_error = None;
        let dirty = core::mem::take(&mut self.dirty);

        for sector in dirty {
            let Some(data) = self.cache.get(&sector) else {
                continue;
            };
            let mut failed = false;
            for mirror in 0..self.fat_count {
                let lba = self.fat_start
                    + u64::from(mirror) * u64::from(self.sectors_per_fat)
                    + u64::from(sector);
                if let Err(source) = device.write(data, lba) {
                    log::warn!("Failed to write sector {sector} of FAT copy {mirror}: {source}");
                    failed = true;
                    first_error.get_or_insert(FatError::MirrorWrite { mirror, source });
                }
            }
            if failed {
                self.dirty.insert(sector);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Returns the FAT sector index and the byte offset in it of a cluster's entry.
    fn locate(&self, cluster: Cluster) -> FatResult<(u32, usize)> {
        if !cluster.is_data(self.max_cluster) {
            return Err(FatError::CorruptChain { cluster });
        }
        let byte = cluster.value() as usize * fat32::ENTRY_SIZE;
        let sector = u32::try_from(byte / self.bytes_per_sector)
            .map_err(|_| FatError::CorruptChain { cluster })?;
        Ok((sector, byte % self.bytes_per_sector))
    }

    fn load<D: BlockDevice>(&mut self, device: &mut D, sector: u32) -> FatResult<&mut [u8]> {
        if !self.cache.contains_key(&sector) {
            self.evict();
        }
        let lba = self.fat_start
            + u64::from(self.active) * u64::from(self.sectors_per_fat)
            + u64::from(sector);
        let bytes_per_sector = self.bytes_per_sector;

        let data = match self.cache.entry(sector) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let mut data = vec![0; bytes_per_sector].into_boxed_slice();
                device.read(&mut data, lba)?;
                log::trace!("Cached FAT sector {sector}");
                entry.insert(data)
            }
        };
        Ok(&mut data[..])
    }

    /// Drops clean sectors until there is room for one more.
    fn evict(&mut self) {
        while self.cache.len() >= self.cache_limit {
            let victim = self
                .cache
                .keys()
                .copied()
                .find(|sector| !self.dirty.contains(sector));
            match victim {
                Some(sector) => {
                    self.cache.remove(&sector);
                }
                None => break,
            }
        }
    }
}
