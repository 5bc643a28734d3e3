//! SCSI transparent command set
//!
//! Command descriptor block builders and response decoding.
use alloc::string::String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::IntoPrimitive)]
#[repr(u8)]
pub enum ScsiOpcode {
    TestUnitReady = 0x00,
    RequestSense = 0x03,
    Inquiry = 0x12,
    ReadCapacity10 = 0x25,
    Read10 = 0x28,
    Write10 = 0x2A,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Direction of the data phase, seen from the host.
pub enum DataDirection {
    None,
    In,
    Out,
}

/// A command descriptor block with its expected data phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScsiCommand {
    cdb: [u8; 16],
    cdb_len: u8,
    transfer_length: u32,
    direction: DataDirection,
}

impl ScsiCommand {
    /// Standard INQUIRY response length.
    pub const INQUIRY_LEN: u8 = 36;
    /// READ CAPACITY(10) response length.
    pub const READ_CAPACITY_LEN: u32 = 8;

    #[must_use]
    const fn new(
        opcode: ScsiOpcode,
        cdb_len: u8,
        transfer_length: u32,
        direction: DataDirection,
    ) -> Self {
        let mut cdb = [0; 16];
        cdb[0] = opcode as u8;
        Self {
            cdb,
            cdb_len,
            transfer_length,
            direction,
        }
    }

    #[must_use]
    #[inline]
    pub const fn inquiry() -> Self {
        let mut cmd = Self::new(
            ScsiOpcode::Inquiry,
            6,
            Self::INQUIRY_LEN as u32,
            DataDirection::In,
        );
        cmd.cdb[4] = Self::INQUIRY_LEN;
        cmd
    }

    #[must_use]
    #[inline]
    pub const fn test_unit_ready() -> Self {
        Self::new(ScsiOpcode::TestUnitReady, 6, 0, DataDirection::None)
    }

    #[must_use]
    #[inline]
    pub const fn request_sense() -> Self {
        let mut cmd = Self::new(
            ScsiOpcode::RequestSense,
            6,
            msd_core::scsi::SenseData::FIXED_FORMAT_LEN as u32,
            DataDirection::In,
        );
        cmd.cdb[4] = msd_core::scsi::SenseData::FIXED_FORMAT_LEN as u8;
        cmd
    }

    #[must_use]
    #[inline]
    pub const fn read_capacity10() -> Self {
        Self::new(
            ScsiOpcode::ReadCapacity10,
            10,
            Self::READ_CAPACITY_LEN,
            DataDirection::In,
        )
    }

    #[must_use]
    #[inline]
    /// Build a READ(10) of `count` blocks starting at `lba`.
    pub const fn read10(lba: u32, count: u16, block_size: u32) -> Self {
        let mut cmd = Self::new(
            ScsiOpcode::Read10,
            10,
            count as u32 * block_size,
            DataDirection::In,
        );
        cmd.set_lba_and_count(lba, count);
        cmd
    }

    #[must_use]
    #[inline]
    /// Build a WRITE(10) of `count` blocks starting at `lba`.
    pub const fn write10(lba: u32, count: u16, block_size: u32) -> Self {
        let mut cmd = Self::new(
            ScsiOpcode::Write10,
            10,
            count as u32 * block_size,
            DataDirection::Out,
        );
        cmd.set_lba_and_count(lba, count);
        cmd
    }

    const fn set_lba_and_count(&mut self, lba: u32, count: u16) {
        let lba = lba.to_be_bytes();
        let count = count.to_be_bytes();
        self.cdb[2] = lba[0];
        self.cdb[3] = lba[1];
        self.cdb[4] = lba[2];
        self.cdb[5] = lba[3];
        self.cdb[7] = count[0];
        self.cdb[8] = count[1];
    }

    #[must_use]
    #[inline]
    pub const fn opcode(&self) -> u8 {
        self.cdb[0]
    }

    #[must_use]
    #[inline]
    pub fn command_block(&self) -> &[u8] {
        &self.cdb[..usize::from(self.cdb_len)]
    }

    #[must_use]
    #[inline]
    pub const fn command_block_length(&self) -> u8 {
        self.cdb_len
    }

    #[must_use]
    #[inline]
    pub const fn transfer_length(&self) -> u32 {
        self.transfer_length
    }

    #[must_use]
    #[inline]
    pub const fn direction(&self) -> DataDirection {
        self.direction
    }
}

/// Decoded standard INQUIRY data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InquiryData {
    peripheral_qualifier: u8,
    device_type: u8,
    removable: bool,
    vendor: String,
    product: String,
    revision: String,
}

impl InquiryData {
    /// Peripheral device type of direct-access block devices.
    pub const DIRECT_ACCESS: u8 = 0x00;

    #[must_use]
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < usize::from(ScsiCommand::INQUIRY_LEN) {
            return None;
        }
        Some(Self {
            peripheral_qualifier: data[0] >> 5,
            device_type: data[0] & 0x1F,
            removable: data[1] & 0x80 != 0,
            vendor: ascii_field(&data[8..16]),
            product: ascii_field(&data[16..32]),
            revision: ascii_field(&data[32..36]),
        })
    }

    #[must_use]
    #[inline]
    pub const fn peripheral_qualifier(&self) -> u8 {
        self.peripheral_qualifier
    }

    #[must_use]
    #[inline]
    pub const fn device_type(&self) -> u8 {
        self.device_type
    }

    #[must_use]
    #[inline]
    pub const fn is_removable(&self) -> bool {
        self.removable
    }

    #[must_use]
    #[inline]
    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    #[must_use]
    #[inline]
    pub fn product(&self) -> &str {
        &self.product
    }

    #[must_use]
    #[inline]
    pub fn revision(&self) -> &str {
        &self.revision
    }
}

/// Space-padded ASCII identification field.
fn ascii_field(raw: &[u8]) -> String {
    raw.iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { char::from(b) } else { '?' })
        .collect::<String>()
        .trim_end()
        .into()
}

/// Decoded READ CAPACITY(10) data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    last_lba: u32,
    block_length: u32,
}

impl Capacity {
    #[must_use]
    pub fn parse(data: &[u8]) -> Option<Self> {
        let last_lba = u32::from_be_bytes(data.get(0..4)?.try_into().ok()?);
        let block_length = u32::from_be_bytes(data.get(4..8)?.try_into().ok()?);
        Some(Self {
            last_lba,
            block_length,
        })
    }

    #[must_use]
    #[inline]
    pub const fn last_lba(&self) -> u32 {
        self.last_lba
    }

    #[must_use]
    #[inline]
    pub const fn block_length(&self) -> u32 {
        self.block_length
    }

    #[must_use]
    #[inline]
    pub const fn block_count(&self) -> u64 {
        self.last_lba as u64 + 1
    }

    #[must_use]
    #[inline]
    /// The device reports `0xFFFF_FFFF` when its capacity needs READ CAPACITY(16).
    pub const fn exceeds_read_capacity10(&self) -> bool {
        self.last_lba == u32::MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_blocks() {
        let inquiry = ScsiCommand::inquiry();
        assert_eq!(inquiry.command_block(), &[0x12, 0, 0, 0, 36, 0]);
        assert_eq!(inquiry.transfer_length(), 36);
        assert_eq!(inquiry.direction(), DataDirection::In);

        let tur = ScsiCommand::test_unit_ready();
        assert_eq!(tur.command_block(), &[0; 6]);
        assert_eq!(tur.direction(), DataDirection::None);

        let sense = ScsiCommand::request_sense();
        assert_eq!(sense.command_block(), &[0x03, 0, 0, 0, 18, 0]);

        let capacity = ScsiCommand::read_capacity10();
        assert_eq!(capacity.command_block_length(), 10);
        assert_eq!(capacity.opcode(), 0x25);
        assert_eq!(capacity.transfer_length(), 8);
    }

    #[test]
    fn test_read_write_blocks() {
        let read = ScsiCommand::read10(0xDEAD_BEEF, 0x0102, 512);
        assert_eq!(
            read.command_block(),
            &[0x28, 0, 0xDE, 0xAD, 0xBE, 0xEF, 0, 0x01, 0x02, 0]
        );
        assert_eq!(read.transfer_length(), 0x0102 * 512);

        let write = ScsiCommand::write10(5, 1, 4096);
        assert_eq!(write.opcode(), u8::from(ScsiOpcode::Write10));
        assert_eq!(write.transfer_length(), 4096);
        assert_eq!(write.direction(), DataDirection::Out);
    }

    #[test]
    fn test_inquiry_parse() {
        let mut data = [0u8; 36];
        data[1] = 0x80;
        data[8..16].copy_from_slice(b"ACME    ");
        data[16..32].copy_from_slice(b"Flash Disk      ");
        data[32..36].copy_from_slice(b"1.00");

        let inquiry = InquiryData::parse(&data).unwrap();
        assert_eq!(inquiry.device_type(), InquiryData::DIRECT_ACCESS);
        assert!(inquiry.is_removable());
        assert_eq!(inquiry.vendor(), "ACME");
        assert_eq!(inquiry.product(), "Flash Disk");
        assert_eq!(inquiry.revision(), "1.00");

        assert!(InquiryData::parse(&data[..20]).is_none());
    }

    #[test]
    fn test_capacity_parse() {
        let data = [0, 0, 0x1F, 0xFF, 0, 0, 0x02, 0];
        let capacity = Capacity::parse(&data).unwrap();
        assert_eq!(capacity.last_lba(), 0x1FFF);
        assert_eq!(capacity.block_length(), 512);
        assert_eq!(capacity.block_count(), 0x2000);
        assert!(!capacity.exceeds_read_capacity10());

        let full = Capacity::parse(&[0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 0x10, 0]).unwrap();
        assert!(full.exceeds_read_capacity10());
        assert!(Capacity::parse(&data[..6]).is_none());
    }
}
