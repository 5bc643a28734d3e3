use crate::scsi::SenseData;
use alloc::{vec, vec::Vec};
use thiserror::Error;

#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
/// An error that can occur when performing block device operations.
pub enum BlockDeviceError {
    /// The underlying transport failed or violated the protocol.
    #[error("Transport error")]
    Transport,
    /// The device completed the command with a failure status.
    #[error("Command rejected by device: {0}")]
    Rejected(SenseData),
    #[error("Out of bounds")]
    OutOfBounds,
    #[error("Unaligned access")]
    UnalignedAccess,
    #[error("Unsupported operation")]
    Unsupported,
}

/// A trait for block devices.
///
/// These are physical devices (such as USB sticks and card readers) that can perform
/// read and/or write operations in blocks.
/// Block size and block count never change once the device is open.
pub trait BlockDevice {
    /// Size of a block in bytes.
    fn block_size(&self) -> usize;

    /// Number of addressable blocks.
    fn block_count(&self) -> u64;

    /// Read blocks from the device into the given buffer.
    ///
    /// The `offset` parameter specifies the block offset from the start of the device.
    ///
    /// ## Errors
    ///
    /// This function returns an error if the read operation failed,
    /// if `dst.len()` isn't a multiple of the block size
    /// or if the range isn't within the device.
    fn read(&mut self, dst: &mut [u8], offset: u64) -> Result<(), BlockDeviceError>;

    /// Write blocks to the device from the given buffer.
    ///
    /// ## Errors
    ///
    /// This function returns an error if the write operation failed,
    /// if `src.len()` isn't a multiple of the block size
    /// or if the range isn't within the device.
    fn write(&mut self, src: &[u8], offset: u64) -> Result<(), BlockDeviceError>;
}

impl<T: BlockDevice + ?Sized> BlockDevice for &mut T {
    #[inline]
    fn block_size(&self) -> usize {
        (**self).block_size()
    }

    #[inline]
    fn block_count(&self) -> u64 {
        (**self).block_count()
    }

    #[inline]
    fn read(&mut self, dst: &mut [u8], offset: u64) -> Result<(), BlockDeviceError> {
        (**self).read(dst, offset)
    }

    #[inline]
    fn write(&mut self, src: &[u8], offset: u64) -> Result<(), BlockDeviceError> {
        (**self).write(src, offset)
    }
}

/// Checks a block request against the device geometry.
///
/// Returns the number of blocks covered by a buffer of `len` bytes.
pub const fn check_request(
    block_size: usize,
    block_count: u64,
    len: usize,
    offset: u64,
) -> Result<u64, BlockDeviceError> {
    if block_size == 0 || len % block_size != 0 {
        return Err(BlockDeviceError::UnalignedAccess);
    }
    let count = (len / block_size) as u64;
    match offset.checked_add(count) {
        Some(end) if end <= block_count => Ok(count),
        _ => Err(BlockDeviceError::OutOfBounds),
    }
}

/// A block device backed by memory.
///
/// Used to work on disk images and as a stand-in for real hardware.
#[derive(Debug, Clone)]
pub struct MemoryDevice {
    block_size: usize,
    data: Vec<u8>,
}

impl MemoryDevice {
    #[must_use]
    /// Creates a zero-filled device of `block_count` blocks.
    ///
    /// # Panics
    ///
    /// Panics if `block_size` is zero.
    pub fn new(block_size: usize, block_count: usize) -> Self {
        assert!(block_size > 0, "MemoryDevice block size must be non-zero");
        Self {
            block_size,
            data: vec![0; block_size * block_count],
        }
    }

    #[must_use]
    /// Wraps an existing image. Trailing bytes that do not fill a block are ignored.
    ///
    /// # Panics
    ///
    /// Panics if `block_size` is zero.
    pub fn from_image(block_size: usize, mut data: Vec<u8>) -> Self {
        assert!(block_size > 0, "MemoryDevice block size must be non-zero");
        data.truncate(data.len() - data.len() % block_size);
        Self { block_size, data }
    }

    #[must_use]
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[must_use]
    #[inline]
    pub fn into_image(self) -> Vec<u8> {
        self.data
    }

    fn byte_range(
        &self,
        len: usize,
        offset: u64,
    ) -> Result<core::ops::Range<usize>, BlockDeviceError> {
        check_request(self.block_size, self.block_count(), len, offset)?;
        let start =
            usize::try_from(offset).map_err(|_| BlockDeviceError::OutOfBounds)? * self.block_size;
        Ok(start..start + len)
    }
}

impl BlockDevice for MemoryDevice {
    #[inline]
    fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    fn block_count(&self) -> u64 {
        (self.data.len() / self.block_size) as u64
    }

    fn read(&mut self, dst: &mut [u8], offset: u64) -> Result<(), BlockDeviceError> {
        let range = self.byte_range(dst.len(), offset)?;
        dst.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write(&mut self, src: &[u8], offset: u64) -> Result<(), BlockDeviceError> {
        let range = self.byte_range(src.len(), offset)?;
        self.data[range].copy_from_slice(src);
        Ok(())
    }
}
