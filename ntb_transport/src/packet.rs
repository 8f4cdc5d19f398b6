//! Payload header written into the shared ring ahead of every payload.
//!
//! The header is 16 bytes, little-endian:
//!
//! ```text
//! Offset  Size  Field
//! 0       4     len      (payload bytes that follow)
//! 4       4     version  (per-queue packet sequence number)
//! 8       4     flags    (bit 0: link; 1 = payload, 0 = link-down sentinel)
//! 12      4     reserved
//! ```

use bitflags::bitflags;

/// Payload header size in bytes.
pub const HEADER_SIZE: usize = 16;

bitflags! {
    /// Header flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u32 {
        /// Set on every normal payload. Cleared on the link-down sentinel.
        const LINK = 1 << 0;
    }
}

/// Header preceding each payload in the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    /// Payload length in bytes.
    pub len: u32,
    /// Sender's TX sequence number at the time of writing.
    pub version: u32,
    pub flags: HeaderFlags,
}

impl PayloadHeader {
    /// Header for a normal payload.
    pub fn payload(len: u32, version: u32) -> Self {
        Self {
            len,
            version,
            flags: HeaderFlags::LINK,
        }
    }

    /// Header for the zero-length "peer is going down" sentinel.
    pub fn link_down(version: u32) -> Self {
        Self {
            len: 0,
            version,
            flags: HeaderFlags::empty(),
        }
    }

    /// True unless this is the link-down sentinel.
    #[inline]
    pub fn link(&self) -> bool {
        self.flags.contains(HeaderFlags::LINK)
    }

    /// True for the link-down sentinel.
    #[inline]
    pub fn is_link_down(&self) -> bool {
        !self.link()
    }

    /// Serialize the header.
    #[inline]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.len.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf
    }

    /// Deserialize a header.
    #[inline]
    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Self {
        let word = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Self {
            len: word(0),
            version: word(4),
            flags: HeaderFlags::from_bits_retain(word(8)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let hdr = PayloadHeader::payload(0x0102_0304, 7);
        let bytes = hdr.to_bytes();
        assert_eq!(&bytes[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[4..8], &[7, 0, 0, 0]);
        assert_eq!(&bytes[8..12], &[1, 0, 0, 0]);
        assert_eq!(&bytes[12..16], &[0, 0, 0, 0]);
        assert_eq!(PayloadHeader::from_bytes(&bytes), hdr);
    }

    #[test]
    fn test_link_down_sentinel() {
        let hdr = PayloadHeader::link_down(42);
        assert_eq!(hdr.len, 0);
        assert!(hdr.is_link_down());
        assert!(!hdr.link());

        let decoded = PayloadHeader::from_bytes(&hdr.to_bytes());
        assert!(decoded.is_link_down());
        assert_eq!(decoded.version, 42);
    }

    #[test]
    fn test_zero_len_payload_is_not_sentinel() {
        let hdr = PayloadHeader::payload(0, 3);
        assert!(hdr.link());
        assert!(!hdr.is_link_down());
    }
}
