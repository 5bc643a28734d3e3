//! SCSI direct-access block device.
use msd_core::{scsi::SenseKey, storage::check_request};

use crate::{
    BlockDevice, BlockDeviceError, BotResult,
    command::{Capacity, InquiryData, ScsiCommand},
    framer::{CommandFramer, DataPhase},
    transport::{BulkTransport, Session},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Configuration of a [`ScsiBlockDevice`].
pub struct BotConfig {
    /// Logical unit addressed by every command.
    lun: u8,
    /// How many times a command failing with a transport error is re-issued.
    transport_retries: u8,
    /// Largest number of blocks moved by a single READ(10)/WRITE(10).
    max_blocks_per_command: u16,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl BotConfig {
    #[must_use]
    #[inline]
    pub const fn new() -> Self {
        Self {
            lun: 0,
            transport_retries: 1,
            max_blocks_per_command: u16::MAX,
        }
    }

    #[must_use]
    #[inline]
    pub const fn with_lun(mut self, lun: u8) -> Self {
        self.lun = lun;
        self
    }

    #[must_use]
    #[inline]
    pub const fn with_transport_retries(mut self, retries: u8) -> Self {
        self.transport_retries = retries;
        self
    }

    #[must_use]
    #[inline]
    pub const fn with_max_blocks_per_command(mut self, blocks: u16) -> Self {
        self.max_blocks_per_command = blocks;
        self
    }

    #[must_use]
    #[inline]
    pub const fn lun(&self) -> u8 {
        self.lun
    }

    #[must_use]
    #[inline]
    pub const fn transport_retries(&self) -> u8 {
        self.transport_retries
    }

    #[must_use]
    #[inline]
    pub const fn max_blocks_per_command(&self) -> u16 {
        self.max_blocks_per_command
    }
}

/// A block device reached through SCSI commands over the Bulk-Only Transport.
///
/// Every `read`/`write` call maps to exactly one READ(10)/WRITE(10) command.
pub struct ScsiBlockDevice<T: BulkTransport> {
    framer: CommandFramer<T>,
    config: BotConfig,
    block_size: usize,
    block_count: u64,
    inquiry: InquiryData,
}

impl<T: BulkTransport> ScsiBlockDevice<T> {
    /// Identifies the device, waits for it to become ready and reads its capacity.
    pub fn open(session: Session<T>, config: BotConfig) -> BotResult<Self> {
        let mut framer = CommandFramer::new(session, config.lun());
        let retries = config.transport_retries();

        let mut raw = [0; ScsiCommand::INQUIRY_LEN as usize];
        let moved = with_retries(&mut framer, retries, |framer| {
            framer.transfer(&ScsiCommand::inquiry(), DataPhase::In(&mut raw))
        })?;
        let inquiry = InquiryData::parse(&raw[..moved]).ok_or(BlockDeviceError::Transport)?;
        if inquiry.peripheral_qualifier() != 0
            || inquiry.device_type() != InquiryData::DIRECT_ACCESS
        {
            log::warn!(
                "Unsupported peripheral (qualifier {}, type {:#04x})",
                inquiry.peripheral_qualifier(),
                inquiry.device_type()
            );
            return Err(BlockDeviceError::Unsupported);
        }

        wait_until_ready(&mut framer, retries)?;

        let mut raw = [0; ScsiCommand::READ_CAPACITY_LEN as usize];
        let moved = with_retries(&mut framer, retries, |framer| {
            framer.transfer(&ScsiCommand::read_capacity10(), DataPhase::In(&mut raw))
        })?;
        let capacity = Capacity::parse(&raw[..moved]).ok_or(BlockDeviceError::Transport)?;
        if capacity.exceeds_read_capacity10() {
            log::warn!("Device capacity requires READ CAPACITY(16)");
            return Err(BlockDeviceError::Unsupported);
        }
        if capacity.block_length() == 0 {
            log::warn!("Device reports a block length of zero");
            return Err(BlockDeviceError::Unsupported);
        }
        let block_size =
            usize::try_from(capacity.block_length()).map_err(|_| BlockDeviceError::Unsupported)?;

        log::info!(
            "Opened {} {} rev {}: {} blocks of {} bytes",
            inquiry.vendor(),
            inquiry.product(),
            inquiry.revision(),
            capacity.block_count(),
            block_size
        );

        Ok(Self {
            framer,
            config,
            block_size,
            block_count: capacity.block_count(),
            inquiry,
        })
    }

    #[must_use]
    #[inline]
    pub const fn inquiry(&self) -> &InquiryData {
        &self.inquiry
    }

    #[must_use]
    #[inline]
    pub const fn config(&self) -> &BotConfig {
        &self.config
    }

    #[must_use]
    #[inline]
    pub const fn session(&self) -> &Session<T> {
        self.framer.session()
    }

    #[must_use]
    #[inline]
    pub const fn session_mut(&mut self) -> &mut Session<T> {
        self.framer.session_mut()
    }

    #[must_use]
    #[inline]
    pub fn into_session(self) -> Session<T> {
        self.framer.into_session()
    }

    /// Validates a request and converts it to READ(10)/WRITE(10) parameters.
    ///
    /// Returns `None` for empty requests.
    fn command_range(&self, len: usize, offset: u64) -> BotResult<Option<(u32, u16)>> {
        let count = check_request(self.block_size, self.block_count, len, offset)?;
        if count == 0 {
            return Ok(None);
        }
        let lba = u32::try_from(offset).map_err(|_| BlockDeviceError::OutOfBounds)?;
        let count = u16::try_from(count)
            .ok()
            .filter(|&count| count <= self.config.max_blocks_per_command())
            .ok_or(BlockDeviceError::Unsupported)?;
        if u32::try_from(len).is_err() {
            return Err(BlockDeviceError::Unsupported);
        }
        Ok(Some((lba, count)))
    }

    fn block_size_u32(&self) -> u32 {
        // Comes from a u32 in READ CAPACITY(10).
        u32::try_from(self.block_size).unwrap_or(u32::MAX)
    }
}

impl<T: BulkTransport> BlockDevice for ScsiBlockDevice<T> {
    #[inline]
    fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read(&mut self, dst: &mut [u8], offset: u64) -> BotResult<()> {
        let Some((lba, count)) = self.command_range(dst.len(), offset)? else {
            return Ok(());
        };
        let command = ScsiCommand::read10(lba, count, self.block_size_u32());
        let len = dst.len();
        with_retries(&mut self.framer, self.config.transport_retries(), |framer| {
            let moved = framer.transfer(&command, DataPhase::In(&mut *dst))?;
            require_complete("READ(10)", lba, moved, len)
        })
    }

    fn write(&mut self, src: &[u8], offset: u64) -> BotResult<()> {
        let Some((lba, count)) = self.command_range(src.len(), offset)? else {
            return Ok(());
        };
        let command = ScsiCommand::write10(lba, count, self.block_size_u32());
        with_retries(&mut self.framer, self.config.transport_retries(), |framer| {
            let moved = framer.transfer(&command, DataPhase::Out(src))?;
            require_complete("WRITE(10)", lba, moved, src.len())
        })
    }
}

/// A block transfer that moved less than requested is a transport error,
/// never a truncated success.
fn require_complete(name: &str, lba: u32, moved: usize, expected: usize) -> BotResult<()> {
    if moved == expected {
        Ok(())
    } else {
        log::warn!("{name} at {lba} moved {moved} of {expected} bytes");
        Err(BlockDeviceError::Transport)
    }
}

/// Re-issues `op` after transport errors, at most `retries` times.
///
/// The framer has already run a reset recovery when it reports a transport error.
/// Rejections by the device are never retried.
fn with_retries<T, R, F>(framer: &mut CommandFramer<T>, retries: u8, mut op: F) -> BotResult<R>
where
    T: BulkTransport,
    F: FnMut(&mut CommandFramer<T>) -> BotResult<R>,
{
    let mut attempt = 0;
    loop {
        match op(framer) {
            Err(BlockDeviceError::Transport) if attempt < retries => {
                attempt += 1;
                log::warn!("Transport error, retrying command (attempt {attempt}/{retries})");
            }
            result => return result,
        }
    }
}

/// Issues TEST UNIT READY, giving the device one more chance after a unit attention
/// or a not-ready condition (typically right after insertion).
fn wait_until_ready<T: BulkTransport>(framer: &mut CommandFramer<T>, retries: u8) -> BotResult<()> {
    let test_unit_ready = |framer: &mut CommandFramer<T>| {
        with_retries(framer, retries, |framer| {
            framer.transfer(&ScsiCommand::test_unit_ready(), DataPhase::None)
        })
    };

    match test_unit_ready(framer) {
        Err(BlockDeviceError::Rejected(sense))
            if matches!(sense.key(), SenseKey::UnitAttention | SenseKey::NotReady) =>
        {
            log::debug!("Unit not ready yet: {sense}");
            test_unit_ready(framer).map(|_| ())
        }
        result => result.map(|_| ()),
    }
}
