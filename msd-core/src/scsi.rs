//! SCSI sense reporting.
use num_enum::{FromPrimitive, IntoPrimitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
/// Sense key reported by a device after a failed command.
pub enum SenseKey {
    NoSense = 0x0,
    RecoveredError = 0x1,
    NotReady = 0x2,
    MediumError = 0x3,
    HardwareError = 0x4,
    IllegalRequest = 0x5,
    UnitAttention = 0x6,
    DataProtect = 0x7,
    BlankCheck = 0x8,
    VendorSpecific = 0x9,
    CopyAborted = 0xA,
    AbortedCommand = 0xB,
    #[num_enum(default)]
    Reserved = 0xC,
    VolumeOverflow = 0xD,
    Miscompare = 0xE,
    Completed = 0xF,
}

/// Decoded sense data: the reason a device rejected a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenseData {
    key: SenseKey,
    /// Additional sense code.
    asc: u8,
    /// Additional sense code qualifier.
    ascq: u8,
}

impl SenseData {
    /// Length of fixed-format sense data requested by `REQUEST SENSE`.
    pub const FIXED_FORMAT_LEN: usize = 18;

    #[must_use]
    #[inline]
    pub const fn new(key: SenseKey, asc: u8, ascq: u8) -> Self {
        Self { key, asc, ascq }
    }

    #[must_use]
    /// Parses fixed-format sense data (response codes `0x70` and `0x71`).
    ///
    /// Returns `None` if the buffer is too short or uses another format.
    pub fn from_fixed_format(data: &[u8]) -> Option<Self> {
        if data.len() < 14 {
            return None;
        }
        let response_code = data[0] & 0x7F;
        if response_code != 0x70 && response_code != 0x71 {
            return None;
        }
        Some(Self {
            key: SenseKey::from(data[2] & 0x0F),
            asc: data[12],
            ascq: data[13],
        })
    }

    #[must_use]
    #[inline]
    pub const fn key(&self) -> SenseKey {
        self.key
    }

    #[must_use]
    #[inline]
    pub const fn asc(&self) -> u8 {
        self.asc
    }

    #[must_use]
    #[inline]
    pub const fn ascq(&self) -> u8 {
        self.ascq
    }
}

impl core::fmt::Display for SenseData {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:?} (ASC {:#04x}, ASCQ {:#04x})",
            self.key, self.asc, self.ascq
        )
    }
}
