//! Boundary to the host USB stack.
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
/// Failure reported by the host USB stack for a bulk transfer.
pub enum TransportFault {
    /// The endpoint answered with a STALL handshake.
    #[error("Endpoint stalled")]
    Stall,
    #[error("Transfer failed")]
    Io,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    BulkIn,
    BulkOut,
}

/// Raw bulk-pipe access to one mass storage interface.
pub trait BulkTransport {
    /// Sends `data` on the bulk-out endpoint and returns how many bytes were accepted.
    fn send(&mut self, data: &[u8]) -> Result<usize, TransportFault>;

    /// Receives up to `buf.len()` bytes from the bulk-in endpoint.
    ///
    /// A short count ends the transfer.
    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, TransportFault>;

    /// Clears a HALT condition on the given endpoint.
    fn clear_stall(&mut self, endpoint: Endpoint) -> Result<(), TransportFault>;

    /// Bulk-Only Mass Storage Reset followed by clearing HALT on both endpoints.
    fn reset_recovery(&mut self) -> Result<(), TransportFault>;

    /// Releases the claimed interface.
    fn release(&mut self) {}
}

/// An open transport, released exactly once when the session ends.
pub struct Session<T: BulkTransport> {
    transport: T,
    released: bool,
}

impl<T: BulkTransport> Session<T> {
    #[must_use]
    #[inline]
    pub const fn new(transport: T) -> Self {
        Self {
            transport,
            released: false,
        }
    }

    #[must_use]
    #[inline]
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    #[must_use]
    #[inline]
    pub const fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Ends the session, releasing the transport.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.transport.release();
        }
    }
}

impl<T: BulkTransport> Drop for Session<T> {
    fn drop(&mut self) {
        self.release();
    }
}
