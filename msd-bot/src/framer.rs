//! Bulk-Only command framing
//!
//! Every command is a three-stage exchange: a CBW on the bulk-out endpoint,
//! an optional data phase, and a CSW on the bulk-in endpoint.
use msd_core::{
    layout::PackedLayout,
    scsi::{SenseData, SenseKey},
};

use crate::{
    BlockDeviceError, BotResult,
    cbw::{CommandBlockWrapper, CommandStatus, CommandStatusWrapper},
    command::ScsiCommand,
    transport::{BulkTransport, Endpoint, Session, TransportFault},
};

const CBW_LEN: usize = 31;
const CSW_LEN: usize = 13;

/// Buffer for the data phase of a command.
pub enum DataPhase<'a> {
    None,
    In(&'a mut [u8]),
    Out(&'a [u8]),
}

/// Frames SCSI commands into Bulk-Only transactions.
///
/// The framer never retries a command. Transport failures and protocol
/// violations trigger a reset recovery before being reported as
/// [`BlockDeviceError::Transport`].
pub struct CommandFramer<T: BulkTransport> {
    session: Session<T>,
    lun: u8,
    /// Tag of the next CBW.
    next_tag: u32,
}

impl<T: BulkTransport> CommandFramer<T> {
    #[must_use]
    #[inline]
    pub const fn new(session: Session<T>, lun: u8) -> Self {
        Self {
            session,
            lun,
            next_tag: 1,
        }
    }

    #[must_use]
    #[inline]
    pub const fn session(&self) -> &Session<T> {
        &self.session
    }

    #[must_use]
    #[inline]
    pub const fn session_mut(&mut self) -> &mut Session<T> {
        &mut self.session
    }

    #[must_use]
    #[inline]
    pub fn into_session(self) -> Session<T> {
        self.session
    }

    /// Runs `command` and returns how many data bytes the device actually moved.
    ///
    /// The count is the smaller of what crossed the bus and what the CSW residue
    /// leaves of the announced length. Callers needing the whole buffer must
    /// compare it themselves.
    ///
    /// A `Failed` status is followed by exactly one REQUEST SENSE and reported as
    /// [`BlockDeviceError::Rejected`].
    pub fn transfer(&mut self, command: &ScsiCommand, data: DataPhase<'_>) -> BotResult<usize> {
        match self.exchange(command, data)? {
            (CommandStatus::Passed, residue, moved) => {
                let announced = command.transfer_length().saturating_sub(residue);
                if residue != 0 {
                    log::debug!(
                        "Opcode {:#04x} left a residue of {residue} bytes",
                        command.opcode()
                    );
                }
                Ok(moved.min(usize::try_from(announced).unwrap_or(usize::MAX)))
            }
            (CommandStatus::Failed, ..) => Err(BlockDeviceError::Rejected(self.request_sense()?)),
            (CommandStatus::PhaseError, ..) => {
                log::warn!("Phase error on opcode {:#04x}", command.opcode());
                Err(self.recover())
            }
        }
    }

    fn request_sense(&mut self) -> BotResult<SenseData> {
        let mut raw = [0; SenseData::FIXED_FORMAT_LEN];
        match self.exchange(&ScsiCommand::request_sense(), DataPhase::In(&mut raw))? {
            (CommandStatus::Passed, _, moved) => {
                let sense = SenseData::from_fixed_format(&raw[..moved]).unwrap_or_else(|| {
                    log::debug!("Unrecognized sense data format {:#04x}", raw[0]);
                    SenseData::new(SenseKey::NoSense, 0, 0)
                });
                log::debug!("Sense data: {sense}");
                Ok(sense)
            }
            (status, ..) => {
                log::warn!("REQUEST SENSE completed with {status:?}");
                Err(self.recover())
            }
        }
    }

    /// Runs the three stages and returns the status, the residue and the
    /// number of bytes moved in the data phase.
    fn exchange(
        &mut self,
        command: &ScsiCommand,
        data: DataPhase<'_>,
    ) -> BotResult<(CommandStatus, u32, usize)> {
        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1);

        let cbw = CommandBlockWrapper::new(tag, self.lun, command);
        log::trace!(
            "CBW tag={tag} opcode={:#04x} length={}",
            command.opcode(),
            command.transfer_length()
        );
        match self.session.transport_mut().send(cbw.as_bytes()) {
            Ok(CBW_LEN) => {}
            Ok(sent) => {
                log::warn!("Short CBW write ({sent} bytes)");
                return Err(self.recover());
            }
            Err(fault) => {
                log::warn!("CBW transfer failed: {fault}");
                return Err(self.recover());
            }
        }

        let moved = self.data_phase(data)?;

        let csw = self.read_status()?;
        if !csw.is_valid() || csw.tag() != tag {
            log::warn!(
                "Invalid CSW (signature={:#010x}, tag={}, expected tag={tag})",
                csw.signature(),
                csw.tag()
            );
            return Err(self.recover());
        }
        match csw.status() {
            Ok(status) => {
                log::trace!(
                    "CSW tag={tag} status={status:?} residue={}",
                    csw.data_residue()
                );
                Ok((status, csw.data_residue(), moved))
            }
            Err(raw) => {
                log::warn!("Undefined CSW status {raw:#04x}");
                Err(self.recover())
            }
        }
    }

    /// Moves the data stage and returns how many bytes crossed the bus.
    fn data_phase(&mut self, data: DataPhase<'_>) -> BotResult<usize> {
        let transport = self.session.transport_mut();
        let (result, endpoint) = match data {
            DataPhase::None => return Ok(0),
            DataPhase::In(buf) => (receive_once(transport, buf), Endpoint::BulkIn),
            DataPhase::Out(buf) => (send_all(transport, buf), Endpoint::BulkOut),
        };

        match result {
            Ok(moved) => Ok(moved),
            Err(TransportFault::Stall) => {
                // The status phase still follows a stalled data phase.
                log::debug!("{endpoint:?} stalled during data phase");
                if self.session.transport_mut().clear_stall(endpoint).is_err() {
                    return Err(self.recover());
                }
                Ok(0)
            }
            Err(TransportFault::Io) => {
                log::warn!("Data phase failed on {endpoint:?}");
                Err(self.recover())
            }
        }
    }

    fn read_status(&mut self) -> BotResult<CommandStatusWrapper> {
        let mut raw = [0; CSW_LEN];
        let mut retried = false;
        loop {
            match self.session.transport_mut().receive(&mut raw) {
                Ok(CSW_LEN) => break,
                Ok(received) => {
                    log::warn!("Short CSW ({received} bytes)");
                    return Err(self.recover());
                }
                Err(TransportFault::Stall) if !retried => {
                    retried = true;
                    if self
                        .session
                        .transport_mut()
                        .clear_stall(Endpoint::BulkIn)
                        .is_err()
                    {
                        return Err(self.recover());
                    }
                }
                Err(fault) => {
                    log::warn!("CSW transfer failed: {fault}");
                    return Err(self.recover());
                }
            }
        }
        CommandStatusWrapper::read_from(&raw).ok_or(BlockDeviceError::Transport)
    }

    /// Runs a reset recovery and returns the error to report.
    fn recover(&mut self) -> BlockDeviceError {
        if let Err(fault) = self.session.transport_mut().reset_recovery() {
            log::warn!("Reset recovery failed: {fault}");
        }
        BlockDeviceError::Transport
    }
}

/// A short count ends the data-in stage, so the CSW is never read into `buf`.
fn receive_once<T: BulkTransport>(
    transport: &mut T,
    buf: &mut [u8],
) -> Result<usize, TransportFault> {
    let len = buf.len();
    transport.receive(buf).map(|received| received.min(len))
}

fn send_all<T: BulkTransport>(transport: &mut T, buf: &[u8]) -> Result<usize, TransportFault> {
    let mut sent = 0;
    while sent < buf.len() {
        match transport.send(&buf[sent..])? {
            0 => return Err(TransportFault::Io),
            written => sent += written,
        }
    }
    Ok(sent)
}
