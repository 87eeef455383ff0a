use std::fmt;
use std::net::{IpAddr, SocketAddr, UdpSocket};

use crate::error::{Result, StreamError};

/// Pair of UDP sockets used for non-interleaved RTP delivery: one for
/// media data, one for the RTCP control channel.
///
/// Bound on the local interface matching the client's RTSP connection so
/// packets leave on the right network. Ports are allocated from the
/// configured range, data on the even port and control on the odd one
/// (RFC 3550 §11). Both sockets close when the pair drops, which is how
/// connection removal releases them.
pub struct UdpSocketPair {
    data: UdpSocket,
    control: UdpSocket,
    data_port: u16,
    control_port: u16,
}

impl UdpSocketPair {
    /// Bind a data/control pair on `local_ip` within `[start, end)`.
    ///
    /// Walks the range two ports at a time until a free pair is found.
    pub fn bind_in_range(local_ip: IpAddr, start: u16, end: u16) -> Result<Self> {
        let mut data_port = if start % 2 == 0 { start } else { start + 1 };

        while data_port + 1 < end {
            let control_port = data_port + 1;
            match (
                UdpSocket::bind((local_ip, data_port)),
                UdpSocket::bind((local_ip, control_port)),
            ) {
                (Ok(data), Ok(control)) => {
                    tracing::debug!(%local_ip, data_port, control_port, "UDP socket pair bound");
                    return Ok(Self {
                        data,
                        control,
                        data_port,
                        control_port,
                    });
                }
                _ => data_port += 2,
            }
        }

        tracing::warn!(%local_ip, start, end, "no free UDP port pair in range");
        Err(StreamError::PortRangeExhausted)
    }

    pub fn data_port(&self) -> u16 {
        self.data_port
    }

    pub fn control_port(&self) -> u16 {
        self.control_port
    }

    /// Send one RTP packet to the client's data port.
    pub fn send_data(&self, payload: &[u8], addr: SocketAddr) -> Result<usize> {
        Ok(self.data.send_to(payload, addr)?)
    }

    /// Send one RTCP packet to the client's control port.
    pub fn send_control(&self, payload: &[u8], addr: SocketAddr) -> Result<usize> {
        Ok(self.control.send_to(payload, addr)?)
    }
}

impl fmt::Debug for UdpSocketPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpSocketPair")
            .field("data_port", &self.data_port)
            .field("control_port", &self.control_port)
            .finish()
    }
}
