//! Cluster chains hold the contents of files and directories.
use super::{Cluster, FatError, FatResult, bs::BootSector, fat::FatEntry, volume::Volume};
use crate::BlockDevice;
use alloc::vec::Vec;
use core::cmp::Ordering;

/// Ordered clusters of a file or directory, following the FAT links from its first cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterChain {
    clusters: Vec<Cluster>,
}

/// Position of a byte of a chain on the device.
struct Location {
    /// Device sector holding the byte.
    sector: u64,
    offset_in_sector: usize,
    /// Bytes from the position to the end of its cluster.
    left_in_cluster: usize,
}

impl ClusterChain {
    #[must_use]
    #[inline]
    pub const fn empty() -> Self {
        Self {
            clusters: Vec::new(),
        }
    }

    /// Follows the FAT from `start`. A start cluster of 0 gives an empty chain.
    pub(crate) fn load<D: BlockDevice>(volume: &mut Volume<D>, start: Cluster) -> FatResult<Self> {
        let clusters = volume.fat.chain(&mut volume.device, start)?;
        Ok(Self { clusters })
    }

    #[must_use]
    #[inline]
    /// First cluster, 0 for an empty chain.
    pub fn first(&self) -> Cluster {
        self.clusters.first().copied().unwrap_or(Cluster::new(0))
    }

    #[must_use]
    #[inline]
    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    #[must_use]
    #[inline]
    pub const fn len(&self) -> usize {
        self.clusters.len()
    }

    #[must_use]
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    #[must_use]
    #[inline]
    /// Number of bytes the chain can hold.
    pub fn capacity(&self, boot: &BootSector) -> u64 {
        self.clusters.len() as u64 * u64::from(boot.cluster_size())
    }

    #[expect(
        clippy::cast_possible_truncation,
        reason = "positions are below the chain capacity and offsets below the cluster size"
    )]
    fn locate(&self, boot: &BootSector, position: u64) -> Location {
        let cluster_size = u64::from(boot.cluster_size());
        let bytes_per_sector = u64::from(boot.bytes_per_sector());
        let cluster_index = (position / cluster_size) as usize;
        let in_cluster = position % cluster_size;

        Location {
            sector: boot.cluster_start(self.clusters[cluster_index]) + in_cluster / bytes_per_sector,
            offset_in_sector: (in_cluster % bytes_per_sector) as usize,
            left_in_cluster: (cluster_size - in_cluster) as usize,
        }
    }

    fn check_range(&self, boot: &BootSector, offset: u64, len: usize) -> FatResult<()> {
        let end = offset
            .checked_add(len as u64)
            .ok_or(FatError::OutOfRange)?;
        if end > self.capacity(boot) {
            return Err(FatError::OutOfRange);
        }
        Ok(())
    }

    /// Reads `dst.len()` bytes starting at byte `offset` of the chain.
    pub(crate) fn read<D: BlockDevice>(
        &self,
        volume: &mut Volume<D>,
        offset: u64,
        dst: &mut [u8],
    ) -> FatResult<()> {
        self.check_range(&volume.boot, offset, dst.len())?;
        let bytes_per_sector = volume.boot.bytes_per_sector() as usize;
        let mut sector_buf = Vec::new();

        let mut done = 0;
        while done < dst.len() {
            let location = self.locate(&volume.boot, offset + done as u64);
            let remaining = dst.len() - done;

            if location.offset_in_sector == 0 && remaining >= bytes_per_sector {
                // Whole sectors, up to the end of the cluster.
                let len = remaining.min(location.left_in_cluster) / bytes_per_sector * bytes_per_sector;
                volume
                    .device
                    .read(&mut dst[done..done + len], location.sector)?;
                done += len;
            } else {
                sector_buf.resize(bytes_per_sector, 0);
                volume.device.read(&mut sector_buf, location.sector)?;
                let len = (bytes_per_sector - location.offset_in_sector).min(remaining);
                let start = location.offset_in_sector;
                dst[done..done + len].copy_from_slice(&sector_buf[start..start + len]);
                done += len;
            }
        }
        Ok(())
    }

    /// Writes `src` starting at byte `offset` of the chain.
    ///
    /// Partially covered sectors are read first so that their other bytes are kept.
    pub(crate) fn write<D: BlockDevice>(
        &self,
        volume: &mut Volume<D>,
        offset: u64,
        src: &[u8],
    ) -> FatResult<()> {
        self.check_range(&volume.boot, offset, src.len())?;
        let bytes_per_sector = volume.boot.bytes_per_sector() as usize;
        let mut sector_buf = Vec::new();

        let mut done = 0;
        while done < src.len() {
            let location = self.locate(&volume.boot, offset + done as u64);
            let remaining = src.len() - done;

            if location.offset_in_sector == 0 && remaining >= bytes_per_sector {
                let len = remaining.min(location.left_in_cluster) / bytes_per_sector * bytes_per_sector;
                volume.device.write(&src[done..done + len], location.sector)?;
                done += len;
            } else {
                sector_buf.resize(bytes_per_sector, 0);
                volume.device.read(&mut sector_buf, location.sector)?;
                let len = (bytes_per_sector - location.offset_in_sector).min(remaining);
                let start = location.offset_in_sector;
                sector_buf[start..start + len].copy_from_slice(&src[done..done + len]);
                volume.device.write(&sector_buf, location.sector)?;
                done += len;
            }
        }
        Ok(())
    }

    /// Grows or shrinks the chain to the fewest clusters holding `bytes` bytes.
    ///
    /// When the volume fills up while growing, the clusters allocated so far stay
    /// in the chain and [`FatError::DiskFull`] is returned.
    pub(crate) fn set_length<D: BlockDevice>(
        &mut self,
        volume: &mut Volume<D>,
        bytes: u64,
    ) -> FatResult<()> {
        let cluster_size = u64::from(volume.boot.cluster_size());
        let needed =
            usize::try_from(bytes.div_ceil(cluster_size)).map_err(|_| FatError::OutOfRange)?;

        match needed.cmp(&self.clusters.len()) {
            Ordering::Greater => {
                while self.clusters.len() < needed {
                    let next = match self.clusters.last() {
                        Some(&last) => volume.fat.extend(&mut volume.device, last)?,
                        None => volume.fat.allocate(&mut volume.device)?,
                    };
                    self.clusters.push(next);
                }
            }
            Ordering::Less => {
                let tail = self.clusters[needed];
                if let Some(&last) = needed.checked_sub(1).and_then(|i| self.clusters.get(i)) {
                    volume
                        .fat
                        .set_entry(&mut volume.device, last, FatEntry::EndOfChain)?;
                }
                self.clusters.truncate(needed);
                match volume.fat.free(&mut volume.device, tail) {
                    Ok(_) => {}
                    Err(FatError::CorruptChain { cluster }) => {
                        log::warn!("Stopped freeing the chain after cluster {tail} at corrupt cluster {cluster}");
                    }
                    Err(err) => return Err(err),
                }
            }
            Ordering::Equal => {}
        }
        Ok(())
    }

    /// Frees every cluster of the chain.
    pub(crate) fn free<D: BlockDevice>(&mut self, volume: &mut Volume<D>) -> FatResult<()> {
        self.set_length(volume, 0)
    }
}
