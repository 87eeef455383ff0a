//! Socket-level transports: the RTSP TCP listener/connection loops and
//! the per-connection UDP socket pairs used for non-interleaved RTP.

pub(crate) mod tcp;
pub mod udp;

pub use udp::UdpSocketPair;
