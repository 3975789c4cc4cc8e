//! RTP framing for TS-over-RTP multicast output.
//!
//! Only the fixed 12-byte header is needed: payload type 33 (MP2T), no
//! padding, no extensions, no CSRC list. Sequence numbers increase by
//! one per datagram and the timestamp runs on the 90 kHz media clock.

use bytes::{BufMut, BytesMut};

/// RTP payload type for MPEG-2 transport streams.
pub const RTP_PAYLOAD_TYPE_MP2T: u8 = 33;

/// Size of the fixed RTP header in bytes.
pub const RTP_HEADER_SIZE: usize = 12;

/// Media clock rate for MP2T payloads.
pub const RTP_CLOCK_HZ: u64 = 90_000;

/// Per-channel RTP sending state.
#[derive(Debug, Clone)]
pub struct RtpHeader {
    /// Sequence number of the next datagram.
    pub sequence_number: u16,
    /// Timestamp of the next datagram (90 kHz).
    pub timestamp: u32,
    /// Synchronization source identifier.
    pub ssrc: u32,
}

impl RtpHeader {
    /// Creates sending state for one channel.
    pub fn new(ssrc: u32) -> Self {
        Self {
            sequence_number: 0,
            timestamp: 0,
            ssrc,
        }
    }

    /// Appends the 12-byte header for the current datagram.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.reserve(RTP_HEADER_SIZE);
        buf.put_u8(0x80); // version 2, no padding, no extension, no CSRC
        buf.put_u8(RTP_PAYLOAD_TYPE_MP2T); // marker clear
        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
    }

    /// Advances to the next datagram.
    pub fn advance(&mut self, timestamp: u32) {
        self.sequence_number = self.sequence_number.wrapping_add(1);
        self.timestamp = timestamp;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let mut header = RtpHeader::new(0x1234_5678);
        header.advance(90_000);
        let mut buf = BytesMut::new();
        header.write_to(&mut buf);
        assert_eq!(buf.len(), RTP_HEADER_SIZE);
        assert_eq!(buf[0], 0x80);
        assert_eq!(buf[1], RTP_PAYLOAD_TYPE_MP2T);
        assert_eq!(&buf[2..4], &1u16.to_be_bytes());
        assert_eq!(&buf[4..8], &90_000u32.to_be_bytes());
        assert_eq!(&buf[8..12], &0x1234_5678u32.to_be_bytes());
    }

    #[test]
    fn test_sequence_wraps() {
        let mut header = RtpHeader::new(1);
        header.sequence_number = u16::MAX;
        header.advance(0);
        assert_eq!(header.sequence_number, 0);
    }
}
