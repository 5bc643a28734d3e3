//! On-disk directory entries: 8.3 short entries and VFAT long name entries.
use super::{
    Cluster, FatError, FatResult,
    date::{Date, DateTime, Time},
};
use alloc::{format, string::String, vec::Vec};
use core::cmp::Ordering;
use msd_core::{layout::PackedLayout, static_assert};

/// Every directory slot, short or long, is 32 bytes.
pub const DIR_ENTRY_SIZE: usize = 32;

/// Longest file name, in UTF-16 code units
pub const MAX_LONG_NAME: usize = 255;

macro_rules! attribute_flags {
    ($($(#[$doc:meta])* $flag:ident = $bit:literal => $is:ident;)*) => {
        impl Attributes {
            $(
                $(#[$doc])*
                pub const $flag: u8 = $bit;
            )*
            $(
                #[must_use]
                #[inline]
                pub const fn $is(&self) -> bool {
                    self.0 & Self::$flag != 0
                }
            )*
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Attribute byte of a short entry.
pub struct Attributes(u8);

attribute_flags! {
    READ_ONLY = 0x01 => is_read_only;
    HIDDEN = 0x02 => is_hidden;
    SYSTEM = 0x04 => is_system;
    /// Marks the volume label entry of the root directory.
    VOLUME_ID = 0x08 => is_volume_id;
    DIRECTORY = 0x10 => is_directory;
    /// Set on every write, cleared by backup tools.
    ARCHIVE = 0x20 => is_archive;
}

impl Attributes {
    /// Value of the attribute byte in long name slots.
    pub const LONG_NAME: u8 = Self::READ_ONLY | Self::HIDDEN | Self::SYSTEM | Self::VOLUME_ID;
    const KIND_MASK: u8 = Self::LONG_NAME | Self::DIRECTORY | Self::ARCHIVE;

    #[must_use]
    #[inline]
    pub const fn new(bits: u8) -> Self {
        Self(bits)
    }

    #[must_use]
    #[inline]
    pub const fn bits(&self) -> u8 {
        self.0
    }

    #[must_use]
    #[inline]
    pub const fn is_long_name(&self) -> bool {
        self.0 & Self::KIND_MASK == Self::LONG_NAME
    }
}

/// FAT directory entry
#[derive(Default, Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct DirEntry {
    /// 8.3 name, padded with spaces
    name: [u8; 11],
    attr: u8,
    /// Windows NT case flags
    nt_flags: u8,
    /// Hundredths of a second (0-199) added to the creation time
    creation_hundredths: u8,
    creation_time: u16,
    creation_date: u16,
    last_access_date: u16,
    /// High word of first cluster number
    first_cluster_high: u16,
    write_time: u16,
    write_date: u16,
    /// Low word of first cluster number
    first_cluster_low: u16,
    file_size: u32,
}
static_assert!(
    size_of::<DirEntry>() == DIR_ENTRY_SIZE,
    "DirEntry size is not 32 bytes"
);

// Safety: packed, made of integers and byte arrays only.
unsafe impl PackedLayout for DirEntry {}

impl DirEntry {
    /// First name byte of a freed slot.
    pub const DELETED_ENTRY: u8 = 0xE5;
    /// First name byte of the slot after the last used one.
    pub const END_OF_ENTRIES: u8 = 0x00;
    /// Stands for a leading 0xE5 in a stored name
    pub const ESCAPED_E5: u8 = 0x05;
    /// The base name is displayed in lower case
    pub const LOWERCASE_BASE: u8 = 0x08;
    /// The extension is displayed in lower case
    pub const LOWERCASE_EXT: u8 = 0x10;

    #[must_use]
    /// Creates an entry with the given name and attributes, timestamped at `now`.
    pub fn new(name: ShortName, attributes: Attributes, now: DateTime) -> Self {
        let mut entry = Self {
            name: *name.raw(),
            attr: attributes.bits(),
            ..Self::default()
        };
        entry.set_created(now);
        entry.set_modified(now);
        entry.set_accessed(now.date());
        entry
    }

    #[must_use]
    #[inline]
    /// Returns true if this entry and all the following ones are unused
    pub const fn is_end(&self) -> bool {
        self.name[0] == Self::END_OF_ENTRIES
    }

    #[must_use]
    #[inline]
    pub const fn is_deleted(&self) -> bool {
        self.name[0] == Self::DELETED_ENTRY
    }

    #[must_use]
    #[inline]
    /// The slot holds a live entry.
    pub const fn is_valid(&self) -> bool {
        !self.is_end() && !self.is_deleted()
    }

    #[must_use]
    #[inline]
    pub const fn is_long_name(&self) -> bool {
        Attributes::new(self.attr).is_long_name()
    }

    #[must_use]
    #[inline]
    pub const fn is_directory(&self) -> bool {
        Attributes::new(self.attr).is_directory()
    }

    #[must_use]
    #[inline]
    pub const fn is_volume_id(&self) -> bool {
        Attributes::new(self.attr).is_volume_id()
    }

    #[inline]
    pub const fn mark_deleted(&mut self) {
        self.name[0] = Self::DELETED_ENTRY;
    }

    #[must_use]
    #[inline]
    pub const fn attributes(&self) -> Attributes {
        Attributes::new(self.attr)
    }

    #[inline]
    pub const fn set_attributes(&mut self, attributes: Attributes) {
        self.attr = attributes.0;
    }

    #[must_use]
    #[inline]
    pub const fn short_name(&self) -> ShortName {
        ShortName(self.name)
    }

    #[inline]
    pub const fn set_short_name(&mut self, name: ShortName) {
        self.name = name.0;
    }

    #[must_use]
    #[inline]
    pub const fn nt_flags(&self) -> u8 {
        self.nt_flags
    }

    #[inline]
    pub const fn set_nt_flags(&mut self, flags: u8) {
        self.nt_flags = flags & (Self::LOWERCASE_BASE | Self::LOWERCASE_EXT);
    }

    #[must_use]
    /// Name as displayed when there is no valid long name.
    pub fn display_name(&self) -> String {
        self.short_name().to_display(self.nt_flags)
    }

    #[must_use]
    #[inline]
    pub fn first_cluster(&self) -> Cluster {
        let high = u32::from(u16::from_le(self.first_cluster_high));
        let low = u32::from(u16::from_le(self.first_cluster_low));
        Cluster::new((high << 16) | low)
    }

    #[inline]
    #[expect(clippy::cast_possible_truncation, reason = "split into 16-bit halves")]
    pub const fn set_first_cluster(&mut self, cluster: Cluster) {
        self.first_cluster_high = ((cluster.value() >> 16) as u16).to_le();
        self.first_cluster_low = (cluster.value() as u16).to_le();
    }

    #[must_use]
    #[inline]
    pub const fn file_size(&self) -> u32 {
        u32::from_le(self.file_size)
    }

    #[inline]
    pub const fn set_file_size(&mut self, size: u32) {
        self.file_size = size.to_le();
    }

    #[must_use]
    pub const fn created(&self) -> DateTime {
        DateTime::new(
            Date::from_dos(u16::from_le(self.creation_date)),
            Time::from_dos(u16::from_le(self.creation_time), self.creation_hundredths),
        )
    }

    pub const fn set_created(&mut self, datetime: DateTime) {
        let (time, hundredths) = datetime.time().to_dos();
        self.creation_date = datetime.date().to_dos().to_le();
        self.creation_time = time.to_le();
        self.creation_hundredths = hundredths;
    }

    #[must_use]
    /// Last write time, with a two second resolution
    pub const fn modified(&self) -> DateTime {
        DateTime::new(
            Date::from_dos(u16::from_le(self.write_date)),
            Time::from_dos(u16::from_le(self.write_time), 0),
        )
    }

    pub const fn set_modified(&mut self, datetime: DateTime) {
        let (time, _) = datetime.time().to_dos();
        self.write_date = datetime.date().to_dos().to_le();
        self.write_time = time.to_le();
    }

    #[must_use]
    #[inline]
    pub const fn accessed(&self) -> Date {
        Date::from_dos(u16::from_le(self.last_access_date))
    }

    #[inline]
    pub const fn set_accessed(&mut self, date: Date) {
        self.last_access_date = date.to_dos().to_le();
    }
}

/// Raw 8.3 name: 8 bytes of base name and 3 bytes of extension, space padded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShortName([u8; 11]);

/// Short name picked for a new entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratedName {
    pub short: ShortName,
    pub nt_flags: u8,
    /// The name cannot be stored without long name entries.
    pub needs_long_name: bool,
}

impl ShortName {
    pub const DOT: Self = Self(*b".          ");
    pub const DOTDOT: Self = Self(*b"..         ");

    #[must_use]
    #[inline]
    pub const fn new(raw: [u8; 11]) -> Self {
        Self(raw)
    }

    #[must_use]
    #[inline]
    pub const fn raw(&self) -> &[u8; 11] {
        &self.0
    }

    #[must_use]
    #[inline]
    pub fn checksum(&self) -> u8 {
        short_name_checksum(&self.0)
    }

    #[must_use]
    /// Formats the name as `BASE.EXT`, honoring the NT lower case flags.
    pub fn to_display(&self, nt_flags: u8) -> String {
        let mut raw = self.0;
        if raw[0] == DirEntry::ESCAPED_E5 {
            raw[0] = DirEntry::DELETED_ENTRY;
        }
        let decode = |bytes: &[u8], lower: bool| {
            let part: String = bytes
                .iter()
                .map(|&b| {
                    let c = char::from(b);
                    if lower { c.to_ascii_lowercase() } else { c }
                })
                .collect();
            String::from(part.trim_end_matches(' '))
        };

        let mut name = decode(&raw[..8], nt_flags & DirEntry::LOWERCASE_BASE != 0);
        let ext = decode(&raw[8..], nt_flags & DirEntry::LOWERCASE_EXT != 0);
        if !ext.is_empty() {
            name.push('.');
            name.push_str(&ext);
        }
        name
    }

    #[must_use]
    /// Returns the short name and NT flags of a name that is already a valid 8.3 name.
    ///
    /// A part mixing upper and lower case letters cannot be expressed with NT flags.
    pub fn from_83(name: &str) -> Option<(Self, u8)> {
        let (base, ext) = match name.split_once('.') {
            Some((_, "")) => return None,
            Some((base, ext)) => (base, ext),
            None => (name, ""),
        };
        if base.is_empty() || base.len() > 8 || ext.len() > 3 || ext.contains('.') {
            return None;
        }
        let base_lower = uniform_case(base)?;
        let ext_lower = uniform_case(ext)?;

        let mut raw = [b' '; 11];
        for (dst, src) in raw.iter_mut().zip(base.bytes()) {
            *dst = src.to_ascii_uppercase();
        }
        for (dst, src) in raw[8..].iter_mut().zip(ext.bytes()) {
            *dst = src.to_ascii_uppercase();
        }

        let mut flags = 0;
        if base_lower {
            flags |= DirEntry::LOWERCASE_BASE;
        }
        if ext_lower {
            flags |= DirEntry::LOWERCASE_EXT;
        }
        Some((Self(raw), flags))
    }

    /// Picks the short name of a new entry.
    ///
    /// Names that are not valid 8.3 names get a `~N` numeric tail, with the
    /// lowest `N` for which `taken` returns false.
    pub fn generate(name: &str, mut taken: impl FnMut(&Self) -> bool) -> FatResult<GeneratedName> {
        if let Some((short, nt_flags)) = Self::from_83(name)
            && !taken(&short)
        {
            return Ok(GeneratedName {
                short,
                nt_flags,
                needs_long_name: false,
            });
        }

        let stripped = name.trim_start_matches('.');
        let (base, ext) = stripped.rsplit_once('.').unwrap_or((stripped, ""));
        let mut base = basis(base, 8);
        let ext = basis(ext, 3);
        if base.is_empty() {
            base.push(b'_');
        }

        for n in 1..=999_999u32 {
            let tail = format!("~{n}");
            let keep = base.len().min(8 - tail.len());

            let mut raw = [b' '; 11];
            raw[..keep].copy_from_slice(&base[..keep]);
            raw[keep..keep + tail.len()].copy_from_slice(tail.as_bytes());
            raw[8..8 + ext.len()].copy_from_slice(&ext);

            let short = Self(raw);
            if !taken(&short) {
                return Ok(GeneratedName {
                    short,
                    nt_flags: 0,
                    needs_long_name: true,
                });
            }
        }
        Err(FatError::AlreadyExists)
    }
}

const fn is_short_name_byte(b: u8) -> bool {
    matches!(
        b,
        b'A'..=b'Z'
            | b'0'..=b'9'
            | b'$'
            | b'%'
            | b'\''
            | b'-'
            | b'_'
            | b'@'
            | b'~'
            | b'`'
            | b'!'
            | b'('
            | b')'
            | b'{'
            | b'}'
            | b'^'
            | b'#'
            | b'&'
    )
}

/// `Some(lowercase)` when `part` only holds short name characters and its letters share one case.
fn uniform_case(part: &str) -> Option<bool> {
    let mut upper = false;
    let mut lower = false;
    for c in part.chars() {
        if c.is_ascii_lowercase() {
            lower = true;
        } else if c.is_ascii_uppercase() {
            upper = true;
        } else if !u8::try_from(c).is_ok_and(is_short_name_byte) {
            return None;
        }
    }
    (!(upper && lower)).then_some(lower)
}

/// Upper-cased short name part with spaces and dots removed and invalid characters replaced.
fn basis(part: &str, max: usize) -> Vec<u8> {
    part.chars()
        .filter(|&c| c != ' ' && c != '.')
        .map(|c| {
            u8::try_from(c.to_ascii_uppercase())
                .ok()
                .filter(|&b| is_short_name_byte(b))
                .unwrap_or(b'_')
        })
        .take(max)
        .collect()
}

/// Checks that `name` can be stored as a long file name.
pub fn validate_long_name(name: &str) -> FatResult<()> {
    let units = name.encode_utf16().count();
    let forbidden = |c: char| c < ' ' || "\"*/:<>?\\|".contains(c);
    if units == 0
        || units > MAX_LONG_NAME
        || name.trim_matches(['.', ' ']).is_empty()
        || name.chars().any(forbidden)
    {
        return Err(FatError::InvalidName);
    }
    Ok(())
}

/// VFAT long name slot, holding 13 UTF-16 units of the name.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct LongNameEntry {
    /// 1-based position in the name, [`Self::LAST_ENTRY`] on the final chunk
    ordinal: u8,
    units_head: [u8; 10],
    attr: u8,
    kind: u8,
    /// Checksum of the short name the run belongs to
    checksum: u8,
    units_mid: [u8; 12],
    cluster: u16,
    units_tail: [u8; 4],
}
static_assert!(
    size_of::<LongNameEntry>() == DIR_ENTRY_SIZE,
    "LongNameEntry size is not 32 bytes"
);

// Safety: packed, made of integers and byte arrays only.
unsafe impl PackedLayout for LongNameEntry {}

impl LongNameEntry {
    pub const LAST_ENTRY: u8 = 0x40;
    pub const CHARS_PER_ENTRY: usize = 13;

    #[must_use]
    pub const fn new(ordinal: u8, checksum: u8, is_last: bool) -> Self {
        Self {
            ordinal: if is_last {
                ordinal | Self::LAST_ENTRY
            } else {
                ordinal
            },
            units_head: [0; 10],
            attr: Attributes::LONG_NAME,
            kind: 0,
            checksum,
            units_mid: [0; 12],
            cluster: 0,
            units_tail: [0; 4],
        }
    }

    #[must_use]
    #[inline]
    pub const fn is_last(&self) -> bool {
        self.ordinal & Self::LAST_ENTRY != 0
    }

    #[must_use]
    #[inline]
    pub const fn ordinal(&self) -> u8 {
        self.ordinal & !Self::LAST_ENTRY
    }

    #[must_use]
    #[inline]
    pub const fn checksum(&self) -> u8 {
        self.checksum
    }

    /// Returns the UTF-16 unit stored at `index` (0 to 12).
    pub fn unit(&self, index: usize) -> FatResult<u16> {
        let (field, at): (&[u8], usize) = match index {
            0..5 => (self.units_head.as_slice(), index),
            5..11 => (self.units_mid.as_slice(), index - 5),
            11..13 => (self.units_tail.as_slice(), index - 11),
            _ => return Err(FatError::OutOfRange),
        };
        Ok(u16::from_le_bytes([field[2 * at], field[2 * at + 1]]))
    }

    pub fn set_unit(&mut self, index: usize, unit: u16) -> FatResult<()> {
        let (field, at): (&mut [u8], usize) = match index {
            0..5 => (self.units_head.as_mut_slice(), index),
            5..11 => (self.units_mid.as_mut_slice(), index - 5),
            11..13 => (self.units_tail.as_mut_slice(), index - 11),
            _ => return Err(FatError::OutOfRange),
        };
        field[2 * at..2 * at + 2].copy_from_slice(&unit.to_le_bytes());
        Ok(())
    }
}

/// Splits `name` into long name entries, in on-disk order (last chunk first).
pub fn encode_long_name(name: &str, checksum: u8) -> FatResult<Vec<LongNameEntry>> {
    let units: Vec<u16> = name.encode_utf16().collect();
    if units.is_empty() || units.len() > MAX_LONG_NAME {
        return Err(FatError::InvalidName);
    }

    let count = units.len().div_ceil(LongNameEntry::CHARS_PER_ENTRY);
    let mut entries = Vec::with_capacity(count);
    for index in (0..count).rev() {
        let ordinal = u8::try_from(index + 1).map_err(|_| FatError::InvalidName)?;
        let mut entry = LongNameEntry::new(ordinal, checksum, index + 1 == count);
        for slot in 0..LongNameEntry::CHARS_PER_ENTRY {
            let position = index * LongNameEntry::CHARS_PER_ENTRY + slot;
            let unit = match position.cmp(&units.len()) {
                Ordering::Less => units[position],
                Ordering::Equal => 0,
                Ordering::Greater => 0xFFFF,
            };
            entry.set_unit(slot, unit)?;
        }
        entries.push(entry);
    }
    Ok(entries)
}

#[must_use]
/// Reassembles a long name from its entries, in on-disk order.
///
/// Returns `None` if the run is malformed or does not belong to the short
/// entry whose checksum is `checksum`.
pub fn decode_long_name(entries: &[LongNameEntry], checksum: u8) -> Option<String> {
    let first = entries.first()?;
    if !first.is_last() || usize::from(first.ordinal()) != entries.len() {
        return None;
    }

    let mut units = Vec::with_capacity(entries.len() * LongNameEntry::CHARS_PER_ENTRY);
    for (i, entry) in entries.iter().rev().enumerate() {
        let is_first_on_disk = i + 1 == entries.len();
        if usize::from(entry.ordinal()) != i + 1
            || entry.checksum() != checksum
            || entry.is_last() != is_first_on_disk
        {
            return None;
        }
        for slot in 0..LongNameEntry::CHARS_PER_ENTRY {
            units.push(entry.unit(slot).ok()?);
        }
    }

    if let Some(end) = units.iter().position(|&unit| unit == 0) {
        units.truncate(end);
    }
    while units.last() == Some(&0xFFFF) {
        units.pop();
    }
    if units.is_empty() {
        return None;
    }
    char::decode_utf16(units.iter().copied())
        .collect::<Result<String, _>>()
        .ok()
}

/// Rotate-right-and-add checksum tying long name slots to their short entry.
fn short_name_checksum(name: &[u8; 11]) -> u8 {
    name.iter()
        .fold(0u8, |sum, &byte| sum.rotate_right(1).wrapping_add(byte))
}
