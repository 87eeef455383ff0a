//! Server orchestration.
//!
//! Two layers, both explicit objects owned by the embedding (no global
//! state):
//!
//! - [`RtspServer`] — the RTSP side: TCP listener, connection table,
//!   request dispatch, keepalive reaper, and RTP fan-out of already
//!   encoded frames.
//! - [`StreamServer`] — the full pipeline: owns an [`RtspServer`], the
//!   bounded frame queue, the encoder behind a FIFO-fair lock, and the
//!   background server loop that drains frames, encodes, and fans out.
//!
//! The capture layer's entire inbound surface is
//! [`StreamServer::enqueue_frame`]: fire-and-forget submission of one raw
//! frame, subject to backpressure drop.

use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{FairMutex, Mutex};

use crate::encoder::{
    EncodeInput, EncodedFrame, EncoderSettings, GpuTexture, PixelFormat, VideoEncoder,
};
use crate::error::{Result, StreamError};
use crate::media::H264Packetizer;
use crate::media::rtp::H264_PAYLOAD_TYPE;
use crate::pipeline::{BufferedFrame, EvictionPolicy, FrameQueue};
use crate::protocol::auth::{AuthScheme, Authenticator, Credentials};
use crate::protocol::MethodHandler;
use crate::session::ConnectionTable;
use crate::transport::tcp;

/// Frames in each group of pictures. Kept low so the stream recovers
/// quickly when packets are dropped.
const GOP_SIZE: u32 = 2;

/// Poll interval of the server loop when a hardware encoder has no
/// output ready.
const HARDWARE_POLL: Duration = Duration::from_millis(2);

/// Server-level configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Public host advertised in SDP `o=` and `c=` lines.
    /// When `None`, host is inferred from the request URI/local address.
    pub public_host: Option<String>,
    /// SDP origin username field (`o=<username> ...`).
    pub sdp_username: String,
    /// SDP origin session id field (`o=... <session-id> ...`).
    pub sdp_session_id: String,
    /// SDP origin session version field (`o=... ... <session-version> ...`).
    pub sdp_session_version: String,
    /// SDP session name (`s=`).
    pub sdp_session_name: String,
    /// When set, every request must carry valid credentials.
    pub credentials: Option<Credentials>,
    /// Challenge scheme advertised when credentials are configured.
    pub auth_scheme: AuthScheme,
    /// Authentication realm.
    pub realm: String,
    /// Idle cutoff for non-interleaved connections. A UDP client must
    /// send some RTSP message within this window or it is reaped.
    pub keepalive_timeout: Duration,
    /// Capacity of the frame queue between capture and encoder threads.
    pub queue_capacity: usize,
    /// Largest RTP payload emitted in a single packet.
    pub packet_limit: usize,
    /// Port range `[min, max)` for per-connection UDP socket pairs.
    pub udp_port_range: (u16, u16),
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            public_host: None,
            sdp_username: "-".to_string(),
            sdp_session_id: "0".to_string(),
            sdp_session_version: "0".to_string(),
            sdp_session_name: "Stream".to_string(),
            credentials: None,
            auth_scheme: AuthScheme::Digest,
            realm: "framecast".to_string(),
            keepalive_timeout: Duration::from_secs(70),
            queue_capacity: 3,
            packet_limit: crate::media::h264::DEFAULT_PACKET_LIMIT,
            udp_port_range: (50000, 51000),
        }
    }
}

/// SPS/PPS captured from the most recent key frame, served to DESCRIBE.
/// Both empty until the first key frame is encoded.
#[derive(Debug, Default)]
pub struct ParameterSets {
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
}

/// The RTSP side of the server: listener, sessions, and RTP fan-out.
///
/// Owns no encoder — it receives already encoded frames via
/// [`send_frame`](Self::send_frame) and delivers them to every connection
/// in PLAY state over its negotiated transport.
pub struct RtspServer {
    config: Arc<ServerConfig>,
    connections: ConnectionTable,
    running: Arc<AtomicBool>,
    auth: Option<Arc<Authenticator>>,
    parameter_sets: Arc<Mutex<ParameterSets>>,
    packetizer: H264Packetizer,
    local_port: AtomicU16,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    reader_threads: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl RtspServer {
    pub fn new(config: ServerConfig) -> Self {
        let auth = config.credentials.clone().map(|credentials| {
            Arc::new(Authenticator::new(
                credentials,
                &config.realm,
                config.auth_scheme,
            ))
        });
        let packetizer = H264Packetizer::with_packet_limit(H264_PAYLOAD_TYPE, config.packet_limit);

        Self {
            config: Arc::new(config),
            connections: ConnectionTable::new(),
            running: Arc::new(AtomicBool::new(false)),
            auth,
            parameter_sets: Arc::new(Mutex::new(ParameterSets::default())),
            packetizer,
            local_port: AtomicU16::new(0),
            accept_thread: Mutex::new(None),
            reader_threads: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Bind the listener and start accepting clients. `bind_addr` may use
    /// port 0 to let the OS pick; the effective port is available from
    /// [`port`](Self::port).
    pub fn start(&self, bind_addr: &str) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(StreamError::AlreadyRunning);
        }

        let listener = match self.bind(bind_addr) {
            Ok(listener) => listener,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let handler = MethodHandler::new(
            self.connections.clone(),
            self.config.clone(),
            self.auth.clone(),
            self.parameter_sets.clone(),
        );

        tracing::info!(addr = %bind_addr, port = self.port(), "RTSP server listening");

        let connections = self.connections.clone();
        let running = self.running.clone();
        let reader_threads = self.reader_threads.clone();
        let handle = thread::spawn(move || {
            tcp::accept_loop(listener, handler, connections, running, reader_threads);
        });
        *self.accept_thread.lock() = Some(handle);

        Ok(())
    }

    fn bind(&self, bind_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(bind_addr)?;
        listener.set_nonblocking(true)?;
        self.local_port
            .store(listener.local_addr()?.port(), Ordering::SeqCst);
        Ok(listener)
    }

    /// Stop accepting, join the accept and connection threads, and close
    /// every connection, releasing its sockets.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("RTSP server stopping");

        if let Some(handle) = self.accept_thread.lock().take() {
            let _ = handle.join();
        }

        // closing unblocks reader threads stuck in a long read
        self.connections.clear();
        let readers = std::mem::take(&mut *self.reader_threads.lock());
        for handle in readers {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The port the listener is bound to (0 before [`start`](Self::start)).
    pub fn port(&self) -> u16 {
        self.local_port.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    /// Run the keepalive reaper once. Returns whether any connection is
    /// in PLAY state — when none is, encoding can be skipped entirely.
    pub fn refresh_connections(&self) -> bool {
        self.connections.reap_idle(self.config.keepalive_timeout)
    }

    /// Capture SPS/PPS for DESCRIBE responses from a key frame.
    pub fn store_parameter_sets(&self, frame: &EncodedFrame) {
        if !frame.is_key_frame() {
            return;
        }
        let mut sets = self.parameter_sets.lock();
        if sets.sps != frame.sps || sets.pps != frame.pps {
            sets.sps.clone_from(&frame.sps);
            sets.pps.clone_from(&frame.pps);
            tracing::debug!(
                sps_bytes = sets.sps.len(),
                pps_bytes = sets.pps.len(),
                "parameter sets updated"
            );
        }
    }

    /// Packetize one encoded frame and fan it out to every playing
    /// connection. Write failures remove only the affected connection.
    pub fn send_frame(&self, timestamp_ns: u64, frame: &EncodedFrame) {
        if frame.is_empty() {
            return;
        }
        let mut packets = self.packetizer.packetize_frame(frame, timestamp_ns);
        if packets.is_empty() {
            return;
        }
        self.connections.broadcast(&mut packets);
    }
}

/// One raw frame submitted by the capture layer.
pub struct VideoFrame<'a> {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Capture time in nanoseconds since stream start.
    pub timestamp_ns: u64,
    pub data: FrameData<'a>,
}

/// Pixel storage of a submitted frame.
pub enum FrameData<'a> {
    /// CPU-readable pixels; deep-copied into the frame queue because the
    /// capture buffer is only valid for the current tick.
    Cpu(&'a [u8]),
    /// GPU-resident texture, encoded synchronously on the calling thread
    /// by a hardware encoder.
    Gpu(GpuTexture),
}

/// A server that takes raw images and encodes them into an H.264 video
/// stream delivered to clients over RTSP/RTP.
pub struct StreamServer {
    config: ServerConfig,
    rtsp: Arc<RtspServer>,
    queue: Arc<FrameQueue>,
    /// FIFO-fair lock: the capture thread (hardware path) and the server
    /// loop acquire the encoder in request order, so a settings change
    /// cannot starve either side.
    encoder: Arc<FairMutex<VideoEncoder>>,
    loop_thread: Option<JoinHandle<()>>,
    running: bool,
}

impl StreamServer {
    /// Whether streaming is available in this build. The software encoder
    /// is always compiled in, so embeddings can gate UI on this.
    pub fn is_supported() -> bool {
        true
    }

    /// Create a server with the default software encoder.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_encoder(config, VideoEncoder::software())
    }

    /// Create a server with a caller-selected encoder (e.g. a hardware
    /// backend).
    pub fn with_encoder(config: ServerConfig, encoder: VideoEncoder) -> Self {
        let rtsp = Arc::new(RtspServer::new(config.clone()));
        let queue = Arc::new(FrameQueue::new(
            config.queue_capacity,
            EvictionPolicy::DropOldest,
        ));
        Self {
            config,
            rtsp,
            queue,
            encoder: Arc::new(FairMutex::new(encoder)),
            loop_thread: None,
            running: false,
        }
    }

    /// Start listening and spawn the server loop. A new start creates
    /// fresh connection and queue state; nothing survives a stop/start
    /// cycle.
    pub fn start(&mut self, bind_addr: &str) -> Result<()> {
        if self.running {
            return Err(StreamError::AlreadyRunning);
        }

        self.rtsp = Arc::new(RtspServer::new(self.config.clone()));
        self.queue = Arc::new(FrameQueue::new(
            self.config.queue_capacity,
            EvictionPolicy::DropOldest,
        ));

        self.rtsp.start(bind_addr)?;

        let rtsp = self.rtsp.clone();
        let queue = self.queue.clone();
        let encoder = self.encoder.clone();
        self.loop_thread = Some(thread::spawn(move || {
            server_loop(rtsp, queue, encoder);
        }));

        self.running = true;
        Ok(())
    }

    /// Shut down: complete the queue (unblocking the server loop), join
    /// it, then stop the RTSP side and release all sockets.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;

        self.queue.complete();
        if let Some(handle) = self.loop_thread.take() {
            let _ = handle.join();
        }
        self.rtsp.stop();
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// The TCP port clients connect to (0 when not running).
    pub fn port(&self) -> u16 {
        if self.running { self.rtsp.port() } else { 0 }
    }

    /// Number of currently connected RTSP clients.
    pub fn client_count(&self) -> usize {
        self.rtsp.connections().len()
    }

    /// Submit one raw frame for encoding into the stream.
    ///
    /// Never blocks the caller beyond a bounded amount of work: a deep
    /// copy on the software path, or one synchronous encode call on the
    /// hardware path. When encoding cannot keep up, the oldest buffered
    /// frame is dropped silently.
    pub fn enqueue_frame(&self, frame: VideoFrame<'_>, frame_rate: u32, bit_rate: u32) {
        if !self.running {
            return;
        }

        let settings = EncoderSettings {
            width: frame.width,
            height: frame.height,
            frame_rate,
            bit_rate,
            gop_size: GOP_SIZE,
        };

        match frame.data {
            FrameData::Cpu(data) => {
                let displaced = self.queue.push(BufferedFrame {
                    settings,
                    format: frame.format,
                    data: data.to_vec(),
                    timestamp_ns: frame.timestamp_ns,
                });
                if let Some(old) = displaced {
                    tracing::trace!(
                        dropped_timestamp_ms = old.timestamp_ns / 1_000_000,
                        "encoder behind capture, dropped oldest buffered frame"
                    );
                }
            }
            FrameData::Gpu(texture) => {
                // direct-access path: pay the encode cost here, under the
                // lock shared with the server loop
                let mut encoder = self.encoder.lock();
                if !encoder.uses_direct_access() {
                    tracing::warn!("GPU frame submitted to a software encoder, dropped");
                    return;
                }
                if let Err(e) = encoder.update(settings) {
                    tracing::warn!(error = %e, "hardware encoder setup failed, frame dropped");
                    return;
                }
                let mut unused = EncodedFrame::new();
                if let Err(e) =
                    encoder.encode(EncodeInput::Texture(&texture), frame.timestamp_ns, &mut unused)
                {
                    tracing::warn!(error = %e, "hardware encode failed, frame dropped");
                }
            }
        }
    }
}

impl Drop for StreamServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Background thread: drains the pipeline, encodes, and fans packets out
/// to all playing connections. The keepalive reaper runs once per
/// iteration.
fn server_loop(rtsp: Arc<RtspServer>, queue: Arc<FrameQueue>, encoder: Arc<FairMutex<VideoEncoder>>) {
    let direct_access = encoder.lock().uses_direct_access();
    tracing::debug!(direct_access, "server loop started");

    if direct_access {
        hardware_loop(&rtsp, &queue, &encoder);
    } else {
        software_loop(&rtsp, &queue, &encoder);
    }

    tracing::debug!("server loop exited");
}

fn software_loop(rtsp: &RtspServer, queue: &FrameQueue, encoder: &FairMutex<VideoEncoder>) {
    let mut encoded = EncodedFrame::new();

    while let Some(frame) = queue.pop() {
        // skip the encode entirely when nobody is watching
        if !rtsp.refresh_connections() {
            continue;
        }

        let mut guard = encoder.lock();
        if frame.format != guard.pixel_format() {
            tracing::warn!(
                format = ?frame.format,
                expected = ?guard.pixel_format(),
                "frame pixel format does not match encoder, skipped"
            );
            continue;
        }
        if let Err(e) = guard.update(frame.settings) {
            tracing::warn!(error = %e, "encoder setup failed, frame skipped");
            continue;
        }

        match guard.encode(EncodeInput::Buffer(&frame.data), frame.timestamp_ns, &mut encoded) {
            Ok(true) => {
                drop(guard);
                rtsp.store_parameter_sets(&encoded);
                rtsp.send_frame(frame.timestamp_ns, &encoded);
            }
            Ok(false) => {
                tracing::debug!(
                    timestamp_ms = frame.timestamp_ns / 1_000_000,
                    "no encoder output for frame"
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, "encode failed, frame skipped");
            }
        }
    }
}

fn hardware_loop(rtsp: &RtspServer, queue: &FrameQueue, encoder: &FairMutex<VideoEncoder>) {
    let mut encoded = EncodedFrame::new();

    // the queue carries no frames on this path; completion is the stop signal
    while !queue.is_completed() {
        let any_playing = rtsp.refresh_connections();

        let consumed = {
            let mut guard = encoder.lock();
            match guard.consume(&mut encoded) {
                Ok(consumed) => consumed,
                Err(e) => {
                    tracing::warn!(error = %e, "hardware encoder drain failed");
                    None
                }
            }
        };

        match consumed {
            Some(timestamp_ns) if any_playing => {
                rtsp.store_parameter_sets(&encoded);
                rtsp.send_frame(timestamp_ns, &encoded);
            }
            Some(_) => {} // encoded but nobody playing; discard
            None => thread::sleep(HARDWARE_POLL),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_streaming_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.keepalive_timeout, Duration::from_secs(70));
        assert_eq!(config.queue_capacity, 3);
        assert_eq!(config.udp_port_range, (50000, 51000));
        assert!(config.credentials.is_none());
    }

    #[test]
    fn start_twice_is_rejected() {
        let mut server = StreamServer::new(ServerConfig::default());
        server.start("127.0.0.1:0").unwrap();
        assert!(matches!(
            server.start("127.0.0.1:0"),
            Err(StreamError::AlreadyRunning)
        ));
        server.stop();
    }

    #[test]
    fn stop_start_cycle_creates_fresh_state() {
        let mut server = StreamServer::new(ServerConfig::default());
        server.start("127.0.0.1:0").unwrap();
        let first_port = server.port();
        assert_ne!(first_port, 0);
        server.stop();
        assert_eq!(server.port(), 0);

        server.start("127.0.0.1:0").unwrap();
        assert!(server.is_running());
        assert_eq!(server.client_count(), 0);
        server.stop();
    }

    #[test]
    fn enqueue_when_stopped_is_a_noop() {
        let server = StreamServer::new(ServerConfig::default());
        let data = vec![0u8; PixelFormat::I420.buffer_size(64, 64)];
        server.enqueue_frame(
            VideoFrame {
                width: 64,
                height: 64,
                format: PixelFormat::I420,
                timestamp_ns: 0,
                data: FrameData::Cpu(&data),
            },
            30,
            1000,
        );
        assert_eq!(server.queue.len(), 0);
    }

    #[test]
    fn enqueue_applies_backpressure() {
        let mut server = StreamServer::new(ServerConfig::default());
        server.start("127.0.0.1:0").unwrap();

        // no client is playing, so the server loop discards frames as it
        // drains; push faster than it can possibly drain to observe the cap
        let data = vec![0u8; PixelFormat::I420.buffer_size(64, 64)];
        for i in 0..50u64 {
            server.enqueue_frame(
                VideoFrame {
                    width: 64,
                    height: 64,
                    format: PixelFormat::I420,
                    timestamp_ns: i * 33_000_000,
                    data: FrameData::Cpu(&data),
                },
                30,
                1000,
            );
            assert!(server.queue.len() <= server.config.queue_capacity);
        }

        server.stop();
    }

    #[test]
    fn is_supported_reports_software_encoder() {
        assert!(StreamServer::is_supported());
    }
}
