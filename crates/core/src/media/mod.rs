//! RTP packetization of encoded H.264 frames.
//!
//! Each encoded video frame is split into one or more RTP packets.
//! Every packet carries a 12-byte fixed header ([`rtp::RtpPacket`])
//! containing:
//!
//! - **Sequence number** (16-bit, wrapping) — per connection, patched at
//!   send time.
//! - **Timestamp** (32-bit) — 90 kHz media clock derived from the capture
//!   time in nanoseconds.
//! - **SSRC** (32-bit) — per connection, patched at send time.
//! - **Marker bit** — set on the last packet of an access unit (frame).
//!
//! [`h264::H264Packetizer`] implements the RFC 6184 payload formats:
//! single NAL unit packets, STAP-A aggregation for small NALs sharing a
//! timestamp, and FU-A fragmentation for NALs above the packet limit.

pub mod h264;
pub mod rtp;

pub use h264::H264Packetizer;
pub use rtp::RtpPacket;
