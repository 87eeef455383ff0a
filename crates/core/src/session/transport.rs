use std::net::SocketAddr;

use crate::transport::udp::UdpSocketPair;

/// Lower transport requested by the client (RFC 2326 §12.39).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowerTransport {
    /// RTP over UDP (`RTP/AVP` or `RTP/AVP/UDP`).
    Udp,
    /// RTP interleaved into the RTSP TCP stream (`RTP/AVP/TCP`).
    Tcp,
}

/// Parsed client `Transport` header from a SETUP request.
///
/// ## Wire format examples
///
/// ```text
/// Transport: RTP/AVP;unicast;client_port=8000-8001
/// Transport: RTP/AVP/TCP;unicast;interleaved=0-1
/// Transport: RTP/AVP;multicast;port=7000-7001
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
    pub lower: LowerTransport,
    pub multicast: bool,
    /// Interleaved channel pair for TCP transport.
    pub interleaved: Option<(u8, u8)>,
    /// Client's RTP/RTCP receive ports for UDP unicast.
    pub client_port: Option<(u16, u16)>,
}

impl TransportRequest {
    /// Parse a `Transport` header value. Returns `None` when the value is
    /// not an RTP/AVP transport specification at all.
    pub fn parse(header: &str) -> Option<Self> {
        let mut parts = header.split(';').map(str::trim);

        let spec = parts.next()?;
        if !spec.starts_with("RTP/AVP") {
            return None;
        }
        let lower = if spec.ends_with("/TCP") {
            LowerTransport::Tcp
        } else {
            LowerTransport::Udp
        };

        let mut multicast = false;
        let mut interleaved = None;
        let mut client_port = None;

        for part in parts {
            if part.eq_ignore_ascii_case("multicast") {
                multicast = true;
            } else if let Some(channels) = part.strip_prefix("interleaved=") {
                interleaved = parse_pair::<u8>(channels);
            } else if let Some(ports) = part.strip_prefix("client_port=") {
                client_port = parse_pair::<u16>(ports);
            }
        }

        Some(TransportRequest {
            lower,
            multicast,
            interleaved,
            client_port,
        })
    }
}

fn parse_pair<T: std::str::FromStr>(value: &str) -> Option<(T, T)> {
    let (first, second) = value.split_once('-')?;
    Some((first.trim().parse().ok()?, second.trim().parse().ok()?))
}

/// Negotiated transport stored on a connection after a successful SETUP.
#[derive(Debug)]
pub enum TransportDescriptor {
    /// RTP framed into the RTSP TCP stream on the given channel pair.
    TcpInterleaved { rtp_channel: u8, rtcp_channel: u8 },
    /// RTP over a dedicated UDP socket pair to the client's ports.
    UdpUnicast {
        /// Where RTP data packets are sent (client IP + RTP port).
        client_rtp_addr: SocketAddr,
        /// Client's RTCP port (unused until RTCP reports are implemented).
        client_rtcp_port: u16,
        sockets: UdpSocketPair,
    },
}

impl TransportDescriptor {
    pub fn is_interleaved(&self) -> bool {
        matches!(self, Self::TcpInterleaved { .. })
    }
}
