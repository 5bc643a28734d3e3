//! A scripted SCSI direct-access target behind a bulk-only transport.
#![allow(dead_code)]

use std::{cell::Cell, rc::Rc};

use msd_bot::{
    BulkTransport, Endpoint, TransportFault,
    cbw::{CommandBlockWrapper, CommandStatus, CommandStatusWrapper},
};
use msd_core::layout::PackedLayout;

pub const BLOCK_SIZE: usize = 512;

/// Faults injected into the next matching exchange.
#[derive(Debug, Default)]
pub struct Faults {
    /// Fail the next READ(10) with a medium error.
    pub medium_error_on_read: bool,
    /// Stall the bulk-in endpoint instead of sending the next CSW, `n` times.
    pub csw_stalls: usize,
    /// Answer the next command with a CSW carrying another tag.
    pub wrong_tag: bool,
    /// Report a phase error for the next command.
    pub phase_error: bool,
    /// Fail the next `n` CBW transfers.
    pub cbw_failures: usize,
    /// Stall the bulk-in endpoint during the next data-in phase.
    pub data_in_stall: bool,
    /// Answer the first TEST UNIT READY with a unit attention.
    pub unit_attention: bool,
    /// Send only half the data of the next `n` READ(10) commands, with a matching residue.
    pub short_reads: usize,
    /// Report this residue in the next CSW, whatever was transferred.
    pub residue: Option<u32>,
}

enum Phase {
    Command,
    DataIn { data: Vec<u8>, pos: usize },
    DataOut { lba: usize, buf: Vec<u8>, expected: usize },
    Status,
}

pub struct MockTarget {
    pub disk: Vec<u8>,
    pub faults: Faults,
    /// Opcodes of every CBW received, in order.
    pub opcodes: Vec<u8>,
    pub resets: usize,
    pub cleared: Vec<Endpoint>,
    pub released: Rc<Cell<bool>>,
    pub device_type: u8,
    pub last_lba_override: Option<u32>,
    phase: Phase,
    tag: u32,
    status: CommandStatus,
    sense: [u8; 3],
    residue: u32,
}

impl MockTarget {
    pub fn new(blocks: usize) -> Self {
        Self {
            disk: vec![0; blocks * BLOCK_SIZE],
            faults: Faults::default(),
            opcodes: Vec::new(),
            resets: 0,
            cleared: Vec::new(),
            released: Rc::new(Cell::new(false)),
            device_type: 0,
            last_lba_override: None,
            phase: Phase::Command,
            tag: 0,
            status: CommandStatus::Passed,
            sense: [0; 3],
            residue: 0,
        }
    }

    pub fn count(&self, opcode: u8) -> usize {
        self.opcodes.iter().filter(|&&op| op == opcode).count()
    }

    fn blocks(&self) -> usize {
        self.disk.len() / BLOCK_SIZE
    }

    fn fail(&mut self, key: u8, asc: u8, ascq: u8) {
        self.sense = [key, asc, ascq];
        self.status = CommandStatus::Failed;
    }

    fn start(&mut self, cbw: &CommandBlockWrapper) {
        let cb = cbw.command_block();
        self.opcodes.push(cb[0]);
        self.tag = cbw.tag();
        self.status = CommandStatus::Passed;
        self.residue = 0;
        let lba = u32::from_be_bytes([cb[2], cb[3], cb[4], cb[5]]) as usize;
        let count = cb
            .get(7..9)
            .map_or(0, |c| usize::from(u16::from_be_bytes([c[0], c[1]])));

        self.phase = match cb[0] {
            0x00 => {
                if self.faults.unit_attention {
                    self.faults.unit_attention = false;
                    self.fail(0x6, 0x28, 0x00);
                }
                Phase::Status
            }
            0x03 => {
                let mut sense = vec![0; 18];
                sense[0] = 0x70;
                sense[2] = self.sense[0];
                sense[7] = 10;
                sense[12] = self.sense[1];
                sense[13] = self.sense[2];
                self.sense = [0; 3];
                Phase::DataIn { data: sense, pos: 0 }
            }
            0x12 => {
                let mut data = vec![0; 36];
                data[0] = self.device_type;
                data[1] = 0x80;
                data[8..16].copy_from_slice(b"MOCK    ");
                data[16..32].copy_from_slice(b"RAM Disk        ");
                data[32..36].copy_from_slice(b"0001");
                Phase::DataIn { data, pos: 0 }
            }
            0x25 => {
                let last_lba = self
                    .last_lba_override
                    .unwrap_or(u32::try_from(self.blocks() - 1).unwrap());
                let mut data = last_lba.to_be_bytes().to_vec();
                data.extend_from_slice(&u32::try_from(BLOCK_SIZE).unwrap().to_be_bytes());
                Phase::DataIn { data, pos: 0 }
            }
            0x28 => {
                let len = count * BLOCK_SIZE;
                if self.faults.medium_error_on_read {
                    self.faults.medium_error_on_read = false;
                    self.fail(0x3, 0x11, 0x00);
                    Phase::DataIn { data: vec![0; len], pos: 0 }
                } else {
                    let start = lba * BLOCK_SIZE;
                    let mut sent = len;
                    if self.faults.short_reads > 0 {
                        self.faults.short_reads -= 1;
                        sent = len / 2;
                        self.residue = u32::try_from(len - sent).unwrap();
                    }
                    Phase::DataIn {
                        data: self.disk[start..start + sent].to_vec(),
                        pos: 0,
                    }
                }
            }
            0x2A => Phase::DataOut {
                lba,
                buf: Vec::new(),
                expected: count * BLOCK_SIZE,
            },
            _ => {
                self.fail(0x5, 0x20, 0x00);
                Phase::Status
            }
        };
    }
}

impl BulkTransport for MockTarget {
    fn send(&mut self, data: &[u8]) -> Result<usize, TransportFault> {
        match &mut self.phase {
            Phase::Command => {
                if self.faults.cbw_failures > 0 {
                    self.faults.cbw_failures -= 1;
                    return Err(TransportFault::Io);
                }
                let cbw = CommandBlockWrapper::read_from(data).ok_or(TransportFault::Io)?;
                assert_eq!(data.len(), 31);
                assert_eq!(&data[..4], b"USBC");
                self.start(&cbw);
                Ok(data.len())
            }
            Phase::DataOut { lba, buf, expected } => {
                buf.extend_from_slice(data);
                if buf.len() >= *expected {
                    let start = *lba * BLOCK_SIZE;
                    self.disk[start..start + *expected].copy_from_slice(&buf[..*expected]);
                    self.phase = Phase::Status;
                }
                Ok(data.len())
            }
            _ => Err(TransportFault::Stall),
        }
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, TransportFault> {
        match &mut self.phase {
            Phase::DataIn { data, pos } => {
                if self.faults.data_in_stall {
                    self.faults.data_in_stall = false;
                    self.phase = Phase::Status;
                    return Err(TransportFault::Stall);
                }
                let len = buf.len().min(data.len() - *pos);
                buf[..len].copy_from_slice(&data[*pos..*pos + len]);
                *pos += len;
                if *pos == data.len() {
                    self.phase = Phase::Status;
                }
                Ok(len)
            }
            Phase::Status => {
                if self.faults.csw_stalls > 0 {
                    self.faults.csw_stalls -= 1;
                    return Err(TransportFault::Stall);
                }
                let mut tag = self.tag;
                if self.faults.wrong_tag {
                    self.faults.wrong_tag = false;
                    tag = tag.wrapping_add(100);
                }
                let mut status = self.status;
                if self.faults.phase_error {
                    self.faults.phase_error = false;
                    status = CommandStatus::PhaseError;
                }
                let residue = self.faults.residue.take().unwrap_or(self.residue);
                let csw = CommandStatusWrapper::new(tag, residue, status);
                buf[..13].copy_from_slice(csw.as_bytes());
                self.phase = Phase::Command;
                Ok(13)
            }
            _ => Err(TransportFault::Io),
        }
    }

    fn clear_stall(&mut self, endpoint: Endpoint) -> Result<(), TransportFault> {
        self.cleared.push(endpoint);
        Ok(())
    }

    fn reset_recovery(&mut self) -> Result<(), TransportFault> {
        self.resets += 1;
        self.phase = Phase::Command;
        Ok(())
    }

    fn release(&mut self) {
        self.released.set(true);
    }
}
