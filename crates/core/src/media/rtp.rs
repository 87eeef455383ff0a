//! RTP fixed header and packet buffer (RFC 3550 §5.1).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           Timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             SSRC                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The packetizer serializes the version, marker, payload type, and
//! timestamp fields at packetization time. Sequence number and SSRC are
//! left zero and patched per connection at send time, because the same
//! packetized payload is delivered to every connection in PLAY state and
//! each connection carries its own sequence/SSRC stream.
//!
//! Version is always 2. Padding, extension, and CSRC count are always 0.

/// Size of the fixed RTP header in bytes.
pub const RTP_HEADER_LEN: usize = 12;

/// Dynamic payload type conventionally used for H.264 (RFC 3551 §6).
pub const H264_PAYLOAD_TYPE: u8 = 96;

/// A single serialized RTP packet: 12-byte fixed header plus payload.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    buf: Vec<u8>,
}

impl RtpPacket {
    /// Create a packet with a serialized header and room for `payload_capacity`
    /// payload bytes. Sequence number and SSRC start zeroed.
    pub fn new(pt: u8, marker: bool, timestamp: u32, payload_capacity: usize) -> Self {
        let mut buf = Vec::with_capacity(RTP_HEADER_LEN + payload_capacity);
        buf.push(2 << 6);
        buf.push(((marker as u8) << 7) | (pt & 0x7f));
        buf.extend_from_slice(&[0, 0]); // sequence, patched at send time
        buf.extend_from_slice(&timestamp.to_be_bytes());
        buf.extend_from_slice(&[0, 0, 0, 0]); // SSRC, patched at send time
        Self { buf }
    }

    /// Overwrite the sequence number field.
    pub fn set_sequence(&mut self, sequence: u16) {
        self.buf[2..4].copy_from_slice(&sequence.to_be_bytes());
    }

    /// Overwrite the SSRC field.
    pub fn set_ssrc(&mut self, ssrc: u32) {
        self.buf[8..12].copy_from_slice(&ssrc.to_be_bytes());
    }

    pub fn push(&mut self, byte: u8) {
        self.buf.push(byte);
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn marker(&self) -> bool {
        self.buf[1] & 0x80 != 0
    }

    pub fn payload_type(&self) -> u8 {
        self.buf[1] & 0x7f
    }

    pub fn sequence(&self) -> u16 {
        u16::from_be_bytes([self.buf[2], self.buf[3]])
    }

    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]])
    }

    pub fn ssrc(&self) -> u32 {
        u32::from_be_bytes([self.buf[8], self.buf[9], self.buf[10], self.buf[11]])
    }

    /// Payload bytes following the fixed header.
    pub fn payload(&self) -> &[u8] {
        &self.buf[RTP_HEADER_LEN..]
    }

    /// The full packet as sent on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// A packet always carries the fixed header, so it is never empty.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Convert a capture timestamp in nanoseconds to the 90 kHz RTP clock
/// used for video (RFC 6184 §8.1).
pub fn rtp_timestamp_90khz(timestamp_ns: u64) -> u32 {
    (timestamp_ns * 9 / 100_000) as u32
}
