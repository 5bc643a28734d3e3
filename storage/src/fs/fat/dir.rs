//! Directory tables: the entries stored in the cluster chain of a directory.
use super::{
    Cluster, FatError, FatResult,
    chain::ClusterChain,
    date::DateTime,
    dirent::{
        Attributes, DIR_ENTRY_SIZE, DirEntry, LongNameEntry, ShortName, decode_long_name,
        encode_long_name, validate_long_name,
    },
    volume::Volume,
};
use crate::BlockDevice;
use alloc::{collections::BTreeSet, string::String, vec, vec::Vec};
use msd_core::layout::PackedLayout;

/// Highest number of 32-byte slots in a directory.
const MAX_SLOTS: usize = 65536;

/// A live entry of a directory, with the name it is displayed under.
#[derive(Debug, Clone)]
pub struct DirRecord {
    /// Slot of the short entry.
    slot: usize,
    /// Long name slots right before the short entry, including a run that
    /// failed to decode.
    lfn_count: usize,
    name: String,
    entry: DirEntry,
}

impl DirRecord {
    #[must_use]
    #[inline]
    /// Long name, or the short name when there is no valid long name.
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    #[inline]
    pub const fn entry(&self) -> &DirEntry {
        &self.entry
    }

    #[must_use]
    #[inline]
    pub const fn slot(&self) -> usize {
        self.slot
    }

    #[must_use]
    #[inline]
    pub const fn lfn_count(&self) -> usize {
        self.lfn_count
    }
}

/// In-memory image of a directory.
///
/// Modified slots are kept in memory until [`DirectoryTable::write_back`] writes
/// the sectors holding them.
pub struct DirectoryTable {
    first_cluster: Cluster,
    is_root: bool,
    chain: ClusterChain,
    slots: Vec<u8>,
    records: Vec<DirRecord>,
    volume_label: Option<String>,
    /// Dirty sectors, as indices in the chain.
    dirty: BTreeSet<usize>,
    bytes_per_sector: usize,
}

impl DirectoryTable {
    /// Reads the directory starting at `first_cluster`.
    pub(crate) fn load<D: BlockDevice>(
        volume: &mut Volume<D>,
        first_cluster: Cluster,
        is_root: bool,
    ) -> FatResult<Self> {
        let chain = ClusterChain::load(volume, first_cluster)?;
        if chain.is_empty() {
            return Err(FatError::InvalidFilesystem("directory without clusters"));
        }
        let capacity =
            usize::try_from(chain.capacity(&volume.boot)).map_err(|_| FatError::OutOfRange)?;
        let mut slots = vec![0; capacity];
        chain.read(volume, 0, &mut slots)?;

        let mut table = Self {
            first_cluster,
            is_root,
            chain,
            slots,
            records: Vec::new(),
            volume_label: None,
            dirty: BTreeSet::new(),
            bytes_per_sector: volume.boot.bytes_per_sector() as usize,
        };
        table.parse();
        log::trace!(
            "Loaded directory at cluster {first_cluster}: {} entries",
            table.records.len()
        );
        Ok(table)
    }

    /// Writes the `.` and `..` entries of a new directory into its zeroed first cluster.
    ///
    /// `parent` is 0 when the parent is the root directory.
    pub(crate) fn create<D: BlockDevice>(
        volume: &mut Volume<D>,
        cluster: Cluster,
        parent: Cluster,
        now: DateTime,
    ) -> FatResult<()> {
        let attributes = Attributes::new(Attributes::DIRECTORY);
        let mut dot = DirEntry::new(ShortName::DOT, attributes, now);
        dot.set_first_cluster(cluster);
        let mut dotdot = DirEntry::new(ShortName::DOTDOT, attributes, now);
        dotdot.set_first_cluster(parent);

        let mut buf = [0; 2 * DIR_ENTRY_SIZE];
        dot.write_to(&mut buf);
        dotdot.write_to(&mut buf[DIR_ENTRY_SIZE..]);
        volume.init_cluster(cluster, &buf)
    }

    #[must_use]
    #[inline]
    pub const fn first_cluster(&self) -> Cluster {
        self.first_cluster
    }

    #[must_use]
    #[inline]
    pub const fn chain(&self) -> &ClusterChain {
        &self.chain
    }

    /// Live entries, without `.`, `..` and the volume label.
    pub fn records(&self) -> impl Iterator<Item = &DirRecord> {
        self.records.iter()
    }

    #[must_use]
    #[inline]
    pub fn volume_label(&self) -> Option<&str> {
        self.volume_label.as_deref()
    }

    /// Finds an entry by long or short name, ignoring case.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&DirRecord> {
        self.records.iter().find(|record| {
            names_match(&record.name, name) || names_match(&record.entry.display_name(), name)
        })
    }

    #[must_use]
    pub fn find_short(&self, short: &ShortName) -> Option<&DirRecord> {
        self.records
            .iter()
            .find(|record| record.entry.short_name() == *short)
    }

    #[must_use]
    /// Finds the subdirectory starting at `cluster`.
    pub fn find_by_cluster(&self, cluster: Cluster) -> Option<&DirRecord> {
        self.records.iter().find(|record| {
            record.entry.is_directory() && record.entry.first_cluster() == cluster
        })
    }

    #[must_use]
    /// First cluster of the parent directory from the `..` entry, 0 meaning the root.
    pub fn dotdot(&self) -> Option<Cluster> {
        let entry = DirEntry::read_from(self.slots.get(DIR_ENTRY_SIZE..)?)?;
        (!self.is_root && entry.short_name() == ShortName::DOTDOT).then(|| entry.first_cluster())
    }

    /// Points the `..` entry to `parent` (0 for the root directory).
    pub fn set_dotdot(&mut self, parent: Cluster) -> FatResult<()> {
        let mut entry = DirEntry::read_from(&self.slots[DIR_ENTRY_SIZE..])
            .filter(|entry| !self.is_root && entry.short_name() == ShortName::DOTDOT)
            .ok_or(FatError::InvalidFilesystem("directory without a '..' entry"))?;
        entry.set_first_cluster(parent);
        self.write_slot(1, entry.as_bytes());
        Ok(())
    }

    /// Checks that a new entry could be named `name`.
    pub fn check_available(&self, name: &str) -> FatResult<()> {
        validate_long_name(name)?;
        if self.find(name).is_some() {
            return Err(FatError::AlreadyExists);
        }
        Ok(())
    }

    /// Adds an entry named `name`, keeping the attributes, clusters, size and
    /// timestamps of `entry`. Its short name is generated.
    pub(crate) fn add_entry<D: BlockDevice>(
        &mut self,
        volume: &mut Volume<D>,
        name: &str,
        mut entry: DirEntry,
    ) -> FatResult<DirRecord> {
        self.check_available(name)?;
        let long_name = self.name_entries(name, &mut entry, None)?;
        let slot = self.place(volume, &long_name, &entry)?;
        self.parse();
        self.record_at(slot)
    }

    /// Marks the slots of an entry as deleted and returns it.
    pub fn remove_entry(&mut self, short: &ShortName) -> FatResult<DirRecord> {
        let record = self.find_short(short).cloned().ok_or(FatError::NotFound)?;
        self.clear_slots(&record);
        self.parse();
        Ok(record)
    }

    /// Rewrites the short entry with the same short name as `entry`.
    pub fn update_entry(&mut self, entry: &DirEntry) -> FatResult<()> {
        let short = entry.short_name();
        let record = self
            .records
            .iter_mut()
            .find(|record| record.entry.short_name() == short)
            .ok_or(FatError::NotFound)?;
        record.entry = *entry;
        let slot = record.slot;
        self.write_slot(slot, entry.as_bytes());
        Ok(())
    }

    /// Renames an entry, keeping its metadata.
    ///
    /// The slots are reused when the new name needs as many of them as the old one.
    pub(crate) fn rename_entry<D: BlockDevice>(
        &mut self,
        volume: &mut Volume<D>,
        short: &ShortName,
        new_name: &str,
    ) -> FatResult<DirRecord> {
        let record = self.find_short(short).cloned().ok_or(FatError::NotFound)?;
        validate_long_name(new_name)?;
        if self
            .find(new_name)
            .is_some_and(|other| other.slot != record.slot)
        {
            return Err(FatError::AlreadyExists);
        }

        let mut entry = record.entry;
        let long_name = self.name_entries(new_name, &mut entry, Some(*short))?;
        let slot = if long_name.len() == record.lfn_count {
            let start = record.slot - record.lfn_count;
            for (i, lfn) in long_name.iter().enumerate() {
                self.write_slot(start + i, lfn.as_bytes());
            }
            self.write_slot(record.slot, entry.as_bytes());
            record.slot
        } else {
            let slot = self.place(volume, &long_name, &entry)?;
            self.clear_slots(&record);
            slot
        };
        self.parse();
        self.record_at(slot)
    }

    /// Writes the sectors holding modified slots.
    pub(crate) fn write_back<D: BlockDevice>(&mut self, volume: &mut Volume<D>) -> FatResult<()> {
        while let Some(&sector) = self.dirty.first() {
            let start = sector * self.bytes_per_sector;
            let end = start + self.bytes_per_sector;
            self.chain
                .write(volume, start as u64, &self.slots[start..end])?;
            self.dirty.remove(&sector);
        }
        Ok(())
    }

    fn record_at(&self, slot: usize) -> FatResult<DirRecord> {
        self.records
            .iter()
            .find(|record| record.slot == slot)
            .cloned()
            .ok_or(FatError::NotFound)
    }

    /// Picks the short name of `entry` and returns the long name entries it needs.
    fn name_entries(
        &self,
        name: &str,
        entry: &mut DirEntry,
        current: Option<ShortName>,
    ) -> FatResult<Vec<LongNameEntry>> {
        let generated = ShortName::generate(name, |short| {
            Some(*short) != current && self.find_short(short).is_some()
        })?;
        entry.set_short_name(generated.short);
        entry.set_nt_flags(generated.nt_flags);

        if generated.needs_long_name {
            encode_long_name(name, generated.short.checksum())
        } else {
            Ok(Vec::new())
        }
    }

    fn slot_count(&self) -> usize {
        self.slots.len() / DIR_ENTRY_SIZE
    }

    fn first_byte(&self, slot: usize) -> u8 {
        self.slots[slot * DIR_ENTRY_SIZE]
    }

    /// Slot of the end marker, or the slot count when every slot was used once.
    fn end_slot(&self) -> usize {
        (0..self.slot_count())
            .find(|&slot| self.first_byte(slot) == DirEntry::END_OF_ENTRIES)
            .unwrap_or_else(|| self.slot_count())
    }

    /// First run of `count` free slots.
    fn find_free_run(&self, count: usize) -> Option<usize> {
        let end = self.end_slot();
        let mut run_start = 0;
        let mut run_len = 0;
        for slot in 0..self.slot_count() {
            if slot >= end || self.first_byte(slot) == DirEntry::DELETED_ENTRY {
                if run_len == 0 {
                    run_start = slot;
                }
                run_len += 1;
                if run_len == count {
                    return Some(run_start);
                }
            } else {
                run_len = 0;
            }
        }
        None
    }

    /// Appends zeroed clusters with room for at least `count` slots.
    fn grow<D: BlockDevice>(&mut self, volume: &mut Volume<D>, count: usize) -> FatResult<()> {
        let cluster_size = volume.boot.cluster_size() as usize;
        let extra = (count * DIR_ENTRY_SIZE).div_ceil(cluster_size);
        let new_len = self.slots.len() + extra * cluster_size;
        if new_len / DIR_ENTRY_SIZE > MAX_SLOTS {
            return Err(FatError::UsageError("directory is full"));
        }

        let old_clusters = self.chain.len();
        let grown = self.chain.set_length(volume, new_len as u64);
        for &cluster in &self.chain.clusters()[old_clusters..] {
            volume.init_cluster(cluster, &[])?;
        }
        self.slots.resize(self.chain.len() * cluster_size, 0);
        log::trace!(
            "Directory at cluster {} grew to {} clusters",
            self.first_cluster,
            self.chain.len()
        );
        grown
    }

    /// Writes a run of long name entries followed by `entry` and returns the short entry slot.
    fn place<D: BlockDevice>(
        &mut self,
        volume: &mut Volume<D>,
        long_name: &[LongNameEntry],
        entry: &DirEntry,
    ) -> FatResult<usize> {
        let count = long_name.len() + 1;
        let start = match self.find_free_run(count) {
            Some(start) => start,
            None => {
                self.grow(volume, count)?;
                self.find_free_run(count)
                    .ok_or(FatError::UsageError("directory is full"))?
            }
        };

        let end = self.end_slot();
        for (i, lfn) in long_name.iter().enumerate() {
            self.write_slot(start + i, lfn.as_bytes());
        }
        let slot = start + long_name.len();
        self.write_slot(slot, entry.as_bytes());

        // Slots past the end marker may hold stale data: keep a marker after the run.
        let next = slot + 1;
        if next > end
            && next < self.slot_count()
            && self.first_byte(next) != DirEntry::END_OF_ENTRIES
        {
            self.write_slot(next, &[0; DIR_ENTRY_SIZE]);
        }
        Ok(slot)
    }

    fn clear_slots(&mut self, record: &DirRecord) {
        for slot in record.slot - record.lfn_count..=record.slot {
            let mut raw = [0; DIR_ENTRY_SIZE];
            raw.copy_from_slice(&self.slots[slot * DIR_ENTRY_SIZE..][..DIR_ENTRY_SIZE]);
            raw[0] = DirEntry::DELETED_ENTRY;
            self.write_slot(slot, &raw);
        }
    }

    fn write_slot(&mut self, slot: usize, bytes: &[u8]) {
        let start = slot * DIR_ENTRY_SIZE;
        self.slots[start..start + DIR_ENTRY_SIZE].copy_from_slice(&bytes[..DIR_ENTRY_SIZE]);
        self.dirty.insert(start / self.bytes_per_sector);
    }

    /// Rebuilds the records from the slots.
    fn parse(&mut self) {
        self.records.clear();
        self.volume_label = None;
        let mut run: Vec<LongNameEntry> = Vec::new();

        for (slot, raw) in self.slots.chunks_exact(DIR_ENTRY_SIZE).enumerate() {
            let Some(entry) = DirEntry::read_from(raw) else {
                break;
            };
            if entry.is_end() {
                break;
            }
            if entry.is_deleted() {
                run.clear();
                continue;
            }
            if entry.is_long_name() {
                if let Some(lfn) = LongNameEntry::read_from(raw) {
                    if lfn.is_last() {
                        run.clear();
                    }
                    run.push(lfn);
                }
                continue;
            }
            if entry.is_volume_id() {
                if self.is_root {
                    let name = entry.short_name();
                    let label = String::from_utf8_lossy(name.raw());
                    self.volume_label = Some(label.trim_end().into());
                }
                run.clear();
                continue;
            }

            let short = entry.short_name();
            if short == ShortName::DOT || short == ShortName::DOTDOT {
                run.clear();
                continue;
            }

            let long_name = if run.is_empty() {
                None
            } else {
                let decoded = decode_long_name(&run, short.checksum());
                if decoded.is_none() {
                    log::debug!(
                        "Ignoring the long name of {}: bad sequence or checksum",
                        entry.display_name()
                    );
                }
                decoded
            };
            // A damaged run still belongs to this entry and is freed with it.
            let lfn_count = run.len();
            run.clear();

            self.records.push(DirRecord {
                slot,
                lfn_count,
                name: long_name.unwrap_or_else(|| entry.display_name()),
                entry,
            });
        }
    }
}

fn names_match(a: &str, b: &str) -> bool {
    a.chars()
        .flat_map(char::to_lowercase)
        .eq(b.chars().flat_map(char::to_lowercase))
}
