//! Per-client connection state and the shared connection registry.
//!
//! One [`RtspConnection`] exists per accepted TCP client, created on
//! accept and torn down on TEARDOWN, socket error, or keepalive timeout.
//! It owns the negotiated transport, the client's play state, and the
//! per-connection RTP sequence number and SSRC — every connection
//! receives its own independent sequence/SSRC stream even though all
//! connections share the same packetized payload.
//!
//! ## Lifecycle
//!
//! ```text
//! TCP accept      -> registered (no session yet)
//! SETUP           -> session id + transport assigned
//! PLAY            -> play = true, receives RTP
//! PAUSE           -> play = false
//! TEARDOWN        -> removed, sockets released
//! write error     -> removed (fan-out)
//! 70 s idle (UDP) -> removed (reaper)
//! ```

pub mod transport;

use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::RngExt;

use crate::media::rtp::RtpPacket;
use crate::protocol::response::RtspResponse;

pub use transport::{LowerTransport, TransportDescriptor, TransportRequest};

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Identifies one accepted TCP connection for the lifetime of the server.
pub type ConnectionId = u64;

/// State for a single RTSP client connection.
pub struct RtspConnection {
    pub id: ConnectionId,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    /// Write half shared between the RTSP responder and interleaved RTP
    /// delivery — both must serialize on the same stream.
    writer: Mutex<TcpStream>,
    /// Server-assigned SSRC for this connection's RTP stream (RFC 3550 §8.1).
    pub ssrc: u32,
    session_id: Mutex<Option<String>>,
    play: AtomicBool,
    /// RTP sequence number, randomly seeded, wrapping per packet.
    sequence: AtomicU16,
    last_keepalive: Mutex<Instant>,
    transport: Mutex<Option<TransportDescriptor>>,
}

impl RtspConnection {
    pub(crate) fn new(writer: TcpStream, peer_addr: SocketAddr, local_addr: SocketAddr) -> Self {
        let mut rng = rand::rng();
        Self {
            id: CONNECTION_COUNTER.fetch_add(1, Ordering::SeqCst),
            peer_addr,
            local_addr,
            writer: Mutex::new(writer),
            ssrc: rng.random::<u32>(),
            session_id: Mutex::new(None),
            play: AtomicBool::new(false),
            sequence: AtomicU16::new(rng.random::<u16>()),
            last_keepalive: Mutex::new(Instant::now()),
            transport: Mutex::new(None),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Local address of the accepted socket; UDP sockets for this client
    /// are bound on this interface.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    pub(crate) fn set_session_id(&self, id: &str) {
        *self.session_id.lock() = Some(id.to_string());
    }

    pub fn is_playing(&self) -> bool {
        self.play.load(Ordering::SeqCst)
    }

    pub fn set_playing(&self, playing: bool) {
        self.play.store(playing, Ordering::SeqCst);
    }

    /// Record that an RTSP message (of any kind) arrived.
    pub fn touch_keepalive(&self) {
        *self.last_keepalive.lock() = Instant::now();
    }

    /// Time since the last RTSP message.
    pub fn idle_for(&self) -> Duration {
        self.last_keepalive.lock().elapsed()
    }

    pub(crate) fn set_transport(&self, descriptor: TransportDescriptor) {
        tracing::debug!(connection = self.id, transport = ?descriptor, "transport configured");
        *self.transport.lock() = Some(descriptor);
    }

    /// Whether RTP is delivered inside the RTSP TCP stream. Interleaved
    /// connections are exempt from the keepalive reaper: a client busy
    /// receiving RTP has no reason to keep sending RTSP messages, so
    /// death is detected by socket write failure instead.
    pub fn is_interleaved(&self) -> bool {
        self.transport
            .lock()
            .as_ref()
            .is_some_and(TransportDescriptor::is_interleaved)
    }

    /// Take the next sequence number for this connection (wrapping).
    pub fn next_sequence(&self) -> u16 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// The sequence number the next packet will carry (for `RTP-Info`).
    pub fn peek_sequence(&self) -> u16 {
        self.sequence.load(Ordering::Relaxed)
    }

    pub(crate) fn send_response(&self, response: &RtspResponse) -> std::io::Result<()> {
        let mut writer = self.writer.lock();
        writer.write_all(response.serialize().as_bytes())?;
        writer.flush()
    }

    /// Deliver one RTP packet over the negotiated transport. The packet
    /// must already carry this connection's sequence number and SSRC.
    ///
    /// A connection without a negotiated transport silently drops the
    /// packet (it cannot be in PLAY state anyway).
    pub(crate) fn send_rtp(&self, packet: &RtpPacket) -> crate::error::Result<()> {
        let transport = self.transport.lock();
        match transport.as_ref() {
            Some(TransportDescriptor::TcpInterleaved { rtp_channel, .. }) => {
                // RFC 2326 §10.12: '$' + channel + 16-bit length + data
                let mut framed = Vec::with_capacity(4 + packet.len());
                framed.push(b'$');
                framed.push(*rtp_channel);
                framed.extend_from_slice(&(packet.len() as u16).to_be_bytes());
                framed.extend_from_slice(packet.as_bytes());

                let mut writer = self.writer.lock();
                writer.write_all(&framed)?;
                Ok(())
            }
            Some(TransportDescriptor::UdpUnicast {
                client_rtp_addr,
                sockets,
                ..
            }) => {
                sockets.send_data(packet.as_bytes(), *client_rtp_addr)?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Release the transport (closing any UDP sockets) and shut the TCP
    /// stream down so the connection's reader thread unblocks.
    pub(crate) fn close(&self) {
        self.play.store(false, Ordering::SeqCst);
        drop(self.transport.lock().take());
        let _ = self.writer.lock().shutdown(Shutdown::Both);
    }
}

/// Registry of live connections.
///
/// A single mutex guards the whole list: every read-modify-write
/// (add, remove, reap, state mutation during iteration) takes it once.
/// Fan-out copies the list first so a failing connection can be removed
/// without invalidating the iteration in progress.
#[derive(Clone)]
pub struct ConnectionTable {
    connections: Arc<Mutex<Vec<Arc<RtspConnection>>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn add(&self, connection: Arc<RtspConnection>) {
        let mut connections = self.connections.lock();
        connections.push(connection);
        tracing::debug!(total = connections.len(), "connection registered");
    }

    /// Remove a connection by id, returning it if it was present.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<RtspConnection>> {
        let mut connections = self.connections.lock();
        let position = connections.iter().position(|c| c.id == id)?;
        let removed = connections.swap_remove(position);
        tracing::debug!(connection = id, remaining = connections.len(), "connection removed");
        Some(removed)
    }

    pub fn find_by_session(&self, session_id: &str) -> Option<Arc<RtspConnection>> {
        self.connections
            .lock()
            .iter()
            .find(|c| c.session_id().as_deref() == Some(session_id))
            .cloned()
    }

    /// Copy of the current connection list, for lock-free iteration.
    pub fn snapshot(&self) -> Vec<Arc<RtspConnection>> {
        self.connections.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    /// Reap connections whose RTSP keepalive expired.
    ///
    /// Only non-interleaved connections are subject to the timeout;
    /// interleaved ones are removed on write failure during fan-out.
    /// Returns whether any remaining connection is in PLAY state.
    pub fn reap_idle(&self, timeout: Duration) -> bool {
        let mut reaped = Vec::new();
        let mut any_playing = false;

        {
            let mut connections = self.connections.lock();
            connections.retain(|connection| {
                if !connection.is_interleaved() && connection.idle_for() > timeout {
                    reaped.push(connection.clone());
                    false
                } else {
                    any_playing |= connection.is_playing();
                    true
                }
            });
        }

        for connection in reaped {
            tracing::info!(
                connection = connection.id,
                session = ?connection.session_id(),
                "connection timed out, removing"
            );
            connection.close();
        }

        any_playing
    }

    /// Fan one packetized frame out to every connection in PLAY state,
    /// patching each connection's sequence number and SSRC into the
    /// packets before sending.
    ///
    /// A write failure removes only the affected connection; delivery to
    /// the others continues.
    pub fn broadcast(&self, packets: &mut [RtpPacket]) {
        let targets = self.snapshot();

        for connection in targets {
            if !connection.is_playing() {
                continue;
            }

            let mut write_error = false;
            for packet in packets.iter_mut() {
                packet.set_sequence(connection.next_sequence());
                packet.set_ssrc(connection.ssrc);

                if let Err(e) = connection.send_rtp(packet) {
                    tracing::warn!(
                        connection = connection.id,
                        error = %e,
                        "RTP write failed, removing connection"
                    );
                    write_error = true;
                    break;
                }
            }

            if write_error {
                connection.set_playing(false);
                connection.close();
                self.remove(connection.id);
            }
        }
    }

    /// Close and drop every connection (server shutdown).
    pub fn clear(&self) {
        let connections = std::mem::take(&mut *self.connections.lock());
        for connection in connections {
            connection.close();
        }
    }
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    /// Connected stream pair for constructing connections under test.
    fn test_connection() -> (Arc<RtspConnection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server_side, peer) = listener.accept().unwrap();
        let local = server_side.local_addr().unwrap();
        (
            Arc::new(RtspConnection::new(server_side, peer, local)),
            client,
        )
    }

    #[test]
    fn sequence_increments_and_wraps() {
        let (conn, _client) = test_connection();
        let first = conn.next_sequence();
        let second = conn.next_sequence();
        assert_eq!(second, first.wrapping_add(1));
        assert_eq!(conn.peek_sequence(), first.wrapping_add(2));
    }

    #[test]
    fn connections_have_independent_ssrc_and_sequence() {
        let (a, _ca) = test_connection();
        let (b, _cb) = test_connection();
        assert_ne!(a.id, b.id);
        // random seeds collide with probability 2^-32; good enough here
        assert_ne!(a.ssrc, b.ssrc);

        a.next_sequence();
        a.next_sequence();
        let b_first = b.peek_sequence();
        assert_eq!(b.next_sequence(), b_first, "b's counter unaffected by a");
    }

    #[test]
    fn table_add_remove_find() {
        let table = ConnectionTable::new();
        let (conn, _client) = test_connection();
        conn.set_session_id("42");
        table.add(conn.clone());

        assert_eq!(table.len(), 1);
        assert!(table.find_by_session("42").is_some());
        assert!(table.find_by_session("43").is_none());

        assert!(table.remove(conn.id).is_some());
        assert!(table.remove(conn.id).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn reaper_skips_fresh_connections() {
        let table = ConnectionTable::new();
        let (conn, _client) = test_connection();
        table.add(conn);

        table.reap_idle(Duration::from_secs(70));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn reaper_removes_idle_udp_connection() {
        let table = ConnectionTable::new();
        let (conn, _client) = test_connection();
        table.add(conn);

        std::thread::sleep(Duration::from_millis(30));
        table.reap_idle(Duration::from_millis(10));
        assert!(table.is_empty());
    }

    #[test]
    fn keepalive_refresh_defers_reaping() {
        let table = ConnectionTable::new();
        let (conn, _client) = test_connection();
        table.add(conn.clone());

        std::thread::sleep(Duration::from_millis(30));
        conn.touch_keepalive();
        table.reap_idle(Duration::from_millis(25));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn reap_reports_playing_state() {
        let table = ConnectionTable::new();
        let (conn, _client) = test_connection();
        table.add(conn.clone());

        assert!(!table.reap_idle(Duration::from_secs(70)));
        conn.set_playing(true);
        assert!(table.reap_idle(Duration::from_secs(70)));
    }
}
