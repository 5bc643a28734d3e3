//! SCSI block device access over the USB mass storage Bulk-Only Transport.
//!
//! The host-side USB binding (device handle, interface claim, raw bulk transfers)
//! is provided by the caller through [`BulkTransport`].
#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_op_in_unsafe_fn)]
#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

extern crate alloc;

pub use msd_core::{
    scsi::{SenseData, SenseKey},
    storage::{BlockDevice, BlockDeviceError},
};

pub mod cbw;
pub mod command;
pub mod device;
pub mod framer;
pub mod transport;

pub use device::{BotConfig, ScsiBlockDevice};
pub use transport::{BulkTransport, Endpoint, Session, TransportFault};

pub type BotResult<T> = Result<T, BlockDeviceError>;

/// USB mass storage interface subclass codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[repr(u8)]
pub enum InterfaceSubclass {
    ReducedBlockCommands = 0x01,
    Mmc5 = 0x02,
    Ufi = 0x04,
    ScsiTransparent = 0x06,
}

/// Opens the block device behind a mass storage interface.
///
/// Only the SCSI transparent command set is supported.
/// The transport is released if the device cannot be opened.
pub fn open_block_device<T: BulkTransport>(
    transport: T,
    subclass: u8,
    config: BotConfig,
) -> BotResult<ScsiBlockDevice<T>> {
    let session = Session::new(transport);
    match InterfaceSubclass::try_from(subclass) {
        Ok(InterfaceSubclass::ScsiTransparent) => ScsiBlockDevice::open(session, config),
        Ok(other) => {
            log::warn!("Unsupported mass storage subclass {other:?}");
            Err(BlockDeviceError::Unsupported)
        }
        Err(_) => {
            log::warn!("Unknown mass storage subclass {subclass:#04x}");
            Err(BlockDeviceError::Unsupported)
        }
    }
}
