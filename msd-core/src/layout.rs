//! Raw on-wire and on-disk structure access.

/// A `repr(C, packed)` structure that mirrors a byte layout found on the wire or on disk.
///
/// Multi-byte fields of implementors are stored little-endian and converted by their accessors,
/// so the raw bytes can be copied in and out as-is.
///
/// ## Safety
///
/// The implementor must be `repr(C, packed)` (alignment of 1, no padding)
/// and every bit pattern must be a valid value of the type.
pub unsafe trait PackedLayout: Copy + Sized + 'static {
    /// Size of the structure in bytes.
    const SIZE: usize = size_of::<Self>();

    #[must_use]
    /// Reads the structure from the start of `bytes`.
    ///
    /// Returns `None` if `bytes` is too short.
    fn read_from(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        Some(unsafe { bytes.as_ptr().cast::<Self>().read_unaligned() })
    }

    #[must_use]
    /// Returns the raw bytes of the structure.
    fn as_bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts((&raw const *self).cast::<u8>(), Self::SIZE) }
    }

    /// Writes the structure to the start of `dst`.
    ///
    /// ## Panics
    ///
    /// Panics if `dst` is shorter than `Self::SIZE`.
    fn write_to(&self, dst: &mut [u8]) {
        dst[..Self::SIZE].copy_from_slice(self.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::PackedLayout;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(C, packed)]
    struct Header {
        magic: u16,
        length: u32,
        flags: u8,
    }

    unsafe impl PackedLayout for Header {}

    #[test]
    fn test_packed_layout() {
        let bytes = [0x55, 0xAA, 0x10, 0, 0, 0, 0x80, 0xFF];
        let header = Header::read_from(&bytes).unwrap();
        assert_eq!(u16::from_le({ header.magic }), 0xAA55);
        assert_eq!(u32::from_le({ header.length }), 16);
        assert_eq!(header.flags, 0x80);
        assert_eq!(header.as_bytes(), &bytes[..7]);

        let mut out = [0u8; 8];
        header.write_to(&mut out);
        assert_eq!(&out[..7], &bytes[..7]);

        assert!(Header::read_from(&bytes[..6]).is_none());
    }
}
