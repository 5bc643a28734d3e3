//! Command Block Wrapper and Command Status Wrapper.
use msd_core::{layout::PackedLayout, static_assert};
use num_enum::TryFromPrimitive;

use crate::command::{DataDirection, ScsiCommand};

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
/// Status reported in the CSW.
pub enum CommandStatus {
    Passed = 0,
    Failed = 1,
    PhaseError = 2,
}

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
/// Command Block Wrapper, sent on the bulk-out endpoint to start a command.
pub struct CommandBlockWrapper {
    /// Always `CommandBlockWrapper::SIGNATURE`.
    signature: u32,
    /// Echoed back by the device in the matching CSW.
    tag: u32,
    /// Number of bytes expected in the data phase.
    data_transfer_length: u32,
    /// Bit 7 set for device-to-host transfers.
    flags: u8,
    lun: u8,
    /// Valid bytes in `command_block` (1 to 16).
    command_block_length: u8,
    command_block: [u8; 16],
}
static_assert!(size_of::<CommandBlockWrapper>() == 31);

unsafe impl PackedLayout for CommandBlockWrapper {}

impl CommandBlockWrapper {
    /// "USBC"
    pub const SIGNATURE: u32 = 0x4342_5355;
    const FLAG_DATA_IN: u8 = 0x80;

    #[must_use]
    pub fn new(tag: u32, lun: u8, command: &ScsiCommand) -> Self {
        let flags = match command.direction() {
            DataDirection::In => Self::FLAG_DATA_IN,
            DataDirection::None | DataDirection::Out => 0,
        };
        let mut command_block = [0; 16];
        let cdb = command.command_block();
        command_block[..cdb.len()].copy_from_slice(cdb);

        Self {
            signature: Self::SIGNATURE.to_le(),
            tag: tag.to_le(),
            data_transfer_length: command.transfer_length().to_le(),
            flags,
            lun: lun & 0x0F,
            command_block_length: command.command_block_length(),
            command_block,
        }
    }

    #[must_use]
    #[inline]
    pub const fn tag(&self) -> u32 {
        u32::from_le(self.tag)
    }

    #[must_use]
    #[inline]
    pub const fn data_transfer_length(&self) -> u32 {
        u32::from_le(self.data_transfer_length)
    }

    #[must_use]
    #[inline]
    pub const fn is_data_in(&self) -> bool {
        self.flags & Self::FLAG_DATA_IN != 0
    }

    #[must_use]
    #[inline]
    pub const fn lun(&self) -> u8 {
        self.lun
    }

    #[must_use]
    #[inline]
    /// Returns the valid part of the command block.
    pub fn command_block(&self) -> &[u8] {
        let len = usize::from(self.command_block_length).min(16);
        &self.command_block[..len]
    }
}

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
/// Command Status Wrapper, received on the bulk-in endpoint after the data phase.
pub struct CommandStatusWrapper {
    signature: u32,
    tag: u32,
    /// Difference between the expected and the processed amount of data.
    data_residue: u32,
    status: u8,
}
static_assert!(size_of::<CommandStatusWrapper>() == 13);

unsafe impl PackedLayout for CommandStatusWrapper {}

impl CommandStatusWrapper {
    /// "USBS"
    pub const SIGNATURE: u32 = 0x5342_5355;

    #[must_use]
    pub const fn new(tag: u32, data_residue: u32, status: CommandStatus) -> Self {
        Self {
            signature: Self::SIGNATURE.to_le(),
            tag: tag.to_le(),
            data_residue: data_residue.to_le(),
            status: status as u8,
        }
    }

    #[must_use]
    #[inline]
    pub const fn signature(&self) -> u32 {
        u32::from_le(self.signature)
    }

    #[must_use]
    #[inline]
    pub const fn is_valid(&self) -> bool {
        self.signature() == Self::SIGNATURE
    }

    #[must_use]
    #[inline]
    pub const fn tag(&self) -> u32 {
        u32::from_le(self.tag)
    }

    #[must_use]
    #[inline]
    pub const fn data_residue(&self) -> u32 {
        u32::from_le(self.data_residue)
    }

    /// Returns the command status, or the raw byte if it is not a defined status.
    pub fn status(&self) -> Result<CommandStatus, u8> {
        CommandStatus::try_from(self.status).map_err(|e| e.number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cbw_layout() {
        let command = ScsiCommand::read10(0x0102_0304, 2, 512);
        let cbw = CommandBlockWrapper::new(7, 0, &command);
        let bytes = cbw.as_bytes();

        assert_eq!(bytes.len(), 31);
        assert_eq!(&bytes[0..4], b"USBC");
        assert_eq!(&bytes[4..8], &7u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &1024u32.to_le_bytes());
        assert_eq!(bytes[12], 0x80);
        assert_eq!(bytes[13], 0);
        assert_eq!(bytes[14], 10);
        assert_eq!(
            &bytes[15..25],
            &[0x28, 0, 0x01, 0x02, 0x03, 0x04, 0, 0, 2, 0]
        );
        assert!(bytes[25..].iter().all(|&b| b == 0));

        let parsed = CommandBlockWrapper::read_from(bytes).unwrap();
        assert_eq!(parsed.tag(), 7);
        assert_eq!(parsed.data_transfer_length(), 1024);
        assert!(parsed.is_data_in());
        assert_eq!(parsed.command_block()[0], 0x28);
    }

    #[test]
    fn test_cbw_write_direction() {
        let command = ScsiCommand::write10(9, 1, 512);
        let cbw = CommandBlockWrapper::new(1, 2, &command);
        assert!(!cbw.is_data_in());
        assert_eq!(cbw.lun(), 2);
        assert_eq!(cbw.command_block()[0], 0x2A);
    }

    #[test]
    fn test_csw_parse() {
        let mut raw = [0u8; 13];
        raw[0..4].copy_from_slice(b"USBS");
        raw[4..8].copy_from_slice(&42u32.to_le_bytes());
        raw[8..12].copy_from_slice(&16u32.to_le_bytes());
        raw[12] = 1;

        let csw = CommandStatusWrapper::read_from(&raw).unwrap();
        assert!(csw.is_valid());
        assert_eq!(csw.tag(), 42);
        assert_eq!(csw.data_residue(), 16);
        assert_eq!(csw.status(), Ok(CommandStatus::Failed));

        raw[12] = 9;
        let csw = CommandStatusWrapper::read_from(&raw).unwrap();
        assert_eq!(csw.status(), Err(9));

        raw[0] = b'X';
        assert!(!CommandStatusWrapper::read_from(&raw).unwrap().is_valid());
    }

    #[test]
    fn test_csw_round_trip() {
        let csw = CommandStatusWrapper::new(3, 0, CommandStatus::PhaseError);
        let parsed = CommandStatusWrapper::read_from(csw.as_bytes()).unwrap();
        assert_eq!(parsed.tag(), 3);
        assert_eq!(parsed.status(), Ok(CommandStatus::PhaseError));
    }
}
