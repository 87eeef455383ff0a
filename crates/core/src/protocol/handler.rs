use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::protocol::auth::{AuthOutcome, Authenticator};
use crate::protocol::request::{Method, RtspRequest};
use crate::protocol::response::RtspResponse;
use crate::protocol::sdp;
use crate::server::{ParameterSets, ServerConfig};
use crate::session::{ConnectionTable, LowerTransport, RtspConnection, TransportDescriptor, TransportRequest};
use crate::transport::udp::UdpSocketPair;

/// What the connection loop should do after writing the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Keep serving requests on this connection.
    Continue,
    /// Close the connection (TEARDOWN of its own session, or rejected
    /// credentials).
    CloseConnection,
}

/// Dispatches parsed RTSP requests against connection/session state.
///
/// One logical handler is shared by every connection thread; all mutable
/// state lives behind the [`ConnectionTable`] and the shared parameter-set
/// cache.
#[derive(Clone)]
pub struct MethodHandler {
    connections: ConnectionTable,
    config: Arc<ServerConfig>,
    auth: Option<Arc<Authenticator>>,
    session_counter: Arc<AtomicU64>,
    parameter_sets: Arc<Mutex<ParameterSets>>,
}

impl MethodHandler {
    pub(crate) fn new(
        connections: ConnectionTable,
        config: Arc<ServerConfig>,
        auth: Option<Arc<Authenticator>>,
        parameter_sets: Arc<Mutex<ParameterSets>>,
    ) -> Self {
        MethodHandler {
            connections,
            config,
            auth,
            session_counter: Arc::new(AtomicU64::new(1)),
            parameter_sets,
        }
    }

    /// Handle one request on behalf of `connection`.
    pub fn handle(
        &self,
        connection: &Arc<RtspConnection>,
        request: &RtspRequest,
    ) -> (RtspResponse, HandleOutcome) {
        let cseq = request.cseq().unwrap_or("0");

        if let Some(auth) = &self.auth {
            match auth.check(request) {
                AuthOutcome::Authorized => {}
                AuthOutcome::Challenge => {
                    let response = RtspResponse::unauthorized()
                        .add_header("CSeq", cseq)
                        .add_header("WWW-Authenticate", &auth.challenge());
                    return (response, HandleOutcome::Continue);
                }
                AuthOutcome::Denied => {
                    tracing::warn!(peer = %connection.peer_addr(), "invalid credentials, closing connection");
                    let response = RtspResponse::unauthorized()
                        .add_header("CSeq", cseq)
                        .add_header("WWW-Authenticate", &auth.challenge());
                    return (response, HandleOutcome::CloseConnection);
                }
            }
        }

        // any message counts as a keepalive, not just GET_PARAMETER
        connection.touch_keepalive();

        match &request.method {
            Method::Options => (self.handle_options(cseq), HandleOutcome::Continue),
            Method::Describe => (self.handle_describe(cseq, connection, &request.uri), HandleOutcome::Continue),
            Method::Setup => (self.handle_setup(cseq, connection, request), HandleOutcome::Continue),
            Method::Play => (self.handle_play(cseq, request), HandleOutcome::Continue),
            Method::Pause => (self.handle_pause(cseq, request), HandleOutcome::Continue),
            Method::GetParameter => (self.handle_get_parameter(cseq, request), HandleOutcome::Continue),
            Method::Teardown => self.handle_teardown(cseq, connection, request),
            Method::Other(name) => {
                tracing::warn!(method = %name, %cseq, "unsupported RTSP method");
                (
                    RtspResponse::not_implemented().add_header("CSeq", cseq),
                    HandleOutcome::Continue,
                )
            }
        }
    }

    fn handle_options(&self, cseq: &str) -> RtspResponse {
        tracing::debug!(%cseq, "OPTIONS");
        RtspResponse::ok().add_header("CSeq", cseq).add_header(
            "Public",
            "OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN, GET_PARAMETER",
        )
    }

    /// Host advertised in the SDP origin/connection lines: configured
    /// public host, else the host of the request URI, else the local
    /// address of the accepted socket.
    fn advertised_host(&self, connection: &RtspConnection, uri: &str) -> String {
        if let Some(host) = &self.config.public_host {
            return host.clone();
        }

        if let Some(after_scheme) = uri
            .strip_prefix("rtsp://")
            .or_else(|| uri.strip_prefix("rtsps://"))
        {
            let host = after_scheme
                .split('/')
                .next()
                .and_then(|host_port| host_port.split(':').next())
                .unwrap_or("")
                .trim();
            if !host.is_empty() {
                return host.to_string();
            }
        }
        connection.local_addr().ip().to_string()
    }

    fn handle_describe(&self, cseq: &str, connection: &RtspConnection, uri: &str) -> RtspResponse {
        tracing::debug!(%cseq, uri, "DESCRIBE");

        let host = self.advertised_host(connection, uri);
        let body = {
            let sets = self.parameter_sets.lock();
            sdp::generate_sdp(
                &host,
                &self.config.sdp_username,
                &self.config.sdp_session_id,
                &self.config.sdp_session_version,
                &self.config.sdp_session_name,
                crate::media::rtp::H264_PAYLOAD_TYPE,
                &sets.sps,
                &sets.pps,
            )
        };

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Content-Type", "application/sdp")
            .add_header("Content-Base", uri)
            .with_body(body)
    }

    fn handle_setup(
        &self,
        cseq: &str,
        connection: &Arc<RtspConnection>,
        request: &RtspRequest,
    ) -> RtspResponse {
        let Some(header) = request.get_header("Transport") else {
            tracing::warn!(%cseq, "SETUP missing Transport header");
            return RtspResponse::bad_request().add_header("CSeq", cseq);
        };

        let Some(offer) = TransportRequest::parse(header) else {
            tracing::warn!(%cseq, header, "SETUP with unparseable transport");
            return RtspResponse::unsupported_transport().add_header("CSeq", cseq);
        };

        if offer.multicast {
            tracing::warn!(%cseq, "client requested multicast (not supported)");
            return RtspResponse::unsupported_transport()
                .add_header("CSeq", cseq)
                .add_header("Unsupported", "multicast delivery; use unicast UDP or TCP interleaved");
        }

        let (descriptor, transport_reply) = match offer.lower {
            LowerTransport::Tcp => {
                let (rtp_channel, rtcp_channel) = offer.interleaved.unwrap_or((0, 1));
                let reply = format!(
                    "RTP/AVP/TCP;unicast;interleaved={}-{};ssrc={:08X}",
                    rtp_channel, rtcp_channel, connection.ssrc
                );
                (
                    TransportDescriptor::TcpInterleaved {
                        rtp_channel,
                        rtcp_channel,
                    },
                    reply,
                )
            }
            LowerTransport::Udp => {
                let Some((client_rtp_port, client_rtcp_port)) = offer.client_port else {
                    tracing::warn!(%cseq, header, "UDP SETUP without client_port");
                    return RtspResponse::unsupported_transport().add_header("CSeq", cseq);
                };

                // Bind on the interface the client reached us through.
                let (port_min, port_max) = self.config.udp_port_range;
                let sockets = match UdpSocketPair::bind_in_range(
                    connection.local_addr().ip(),
                    port_min,
                    port_max,
                ) {
                    Ok(sockets) => sockets,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to allocate UDP port pair");
                        return RtspResponse::internal_error().add_header("CSeq", cseq);
                    }
                };

                let reply = format!(
                    "RTP/AVP;unicast;client_port={}-{};server_port={}-{};ssrc={:08X}",
                    client_rtp_port,
                    client_rtcp_port,
                    sockets.data_port(),
                    sockets.control_port(),
                    connection.ssrc
                );
                (
                    TransportDescriptor::UdpUnicast {
                        client_rtp_addr: SocketAddr::new(
                            connection.peer_addr().ip(),
                            client_rtp_port,
                        ),
                        client_rtcp_port,
                        sockets,
                    },
                    reply,
                )
            }
        };

        let session_id = format!("{:016X}", self.session_counter.fetch_add(1, Ordering::SeqCst));
        connection.set_session_id(&session_id);
        connection.set_transport(descriptor);

        tracing::info!(
            session = %session_id,
            peer = %connection.peer_addr(),
            transport = %transport_reply,
            "session created via SETUP"
        );

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Transport", &transport_reply)
            .add_header("Session", &session_id)
    }

    fn handle_play(&self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(session_id) = request.session_id() else {
            tracing::warn!(%cseq, "PLAY missing Session header");
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };

        match self.connections.find_by_session(session_id) {
            Some(connection) => {
                connection.set_playing(true);
                tracing::info!(session = %session_id, "session playing");

                let rtp_info = format!(
                    "url={};seq={}",
                    request.uri,
                    connection.peek_sequence()
                );

                RtspResponse::ok()
                    .add_header("CSeq", cseq)
                    .add_header("Session", session_id)
                    .add_header("Range", "npt=0.000-")
                    .add_header("RTP-Info", &rtp_info)
            }
            None => {
                tracing::warn!(session = %session_id, "PLAY for unknown session");
                RtspResponse::session_not_found().add_header("CSeq", cseq)
            }
        }
    }

    fn handle_pause(&self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(session_id) = request.session_id() else {
            tracing::warn!(%cseq, "PAUSE missing Session header");
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };

        match self.connections.find_by_session(session_id) {
            Some(connection) => {
                connection.set_playing(false);
                tracing::info!(session = %session_id, "session paused");
                RtspResponse::ok()
                    .add_header("CSeq", cseq)
                    .add_header("Session", session_id)
            }
            None => {
                tracing::warn!(session = %session_id, "PAUSE for unknown session");
                RtspResponse::session_not_found().add_header("CSeq", cseq)
            }
        }
    }

    /// GET_PARAMETER is used by clients (e.g. VLC) as a keepalive
    /// (RFC 2326 §10.8).
    fn handle_get_parameter(&self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        tracing::trace!(%cseq, "GET_PARAMETER keepalive");

        let mut response = RtspResponse::ok().add_header("CSeq", cseq);

        if let Some(session_id) = request.session_id()
            && self.connections.find_by_session(session_id).is_some()
        {
            response = response.add_header("Session", session_id);
        }

        response
    }

    /// TEARDOWN is idempotent: a session that is already gone still gets
    /// a 200 so retries and crossed wires converge on the same state.
    fn handle_teardown(
        &self,
        cseq: &str,
        connection: &Arc<RtspConnection>,
        request: &RtspRequest,
    ) -> (RtspResponse, HandleOutcome) {
        let Some(session_id) = request.session_id() else {
            tracing::warn!(%cseq, "TEARDOWN missing Session header");
            return (
                RtspResponse::session_not_found().add_header("CSeq", cseq),
                HandleOutcome::Continue,
            );
        };

        match self.connections.find_by_session(session_id) {
            Some(target) => {
                let _ = self.connections.remove(target.id);
                tracing::info!(session = %session_id, "session terminated via TEARDOWN");

                let outcome = if target.id == connection.id {
                    // let the connection loop close the stream after the
                    // response is written
                    HandleOutcome::CloseConnection
                } else {
                    target.close();
                    HandleOutcome::Continue
                };

                (RtspResponse::ok().add_header("CSeq", cseq), outcome)
            }
            None => {
                tracing::debug!(session = %session_id, "TEARDOWN for unknown session (already gone)");
                (RtspResponse::ok().add_header("CSeq", cseq), HandleOutcome::Continue)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    fn make_handler() -> (MethodHandler, ConnectionTable) {
        let table = ConnectionTable::new();
        let handler = MethodHandler::new(
            table.clone(),
            Arc::new(ServerConfig::default()),
            None,
            Arc::new(Mutex::new(ParameterSets::default())),
        );
        (handler, table)
    }

    fn make_connection() -> (Arc<RtspConnection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (stream, peer) = listener.accept().unwrap();
        let local = stream.local_addr().unwrap();
        (Arc::new(RtspConnection::new(stream, peer, local)), client)
    }

    fn parse(raw: &str) -> RtspRequest {
        RtspRequest::parse(raw).unwrap()
    }

    #[test]
    fn options_lists_methods() {
        let (handler, table) = make_handler();
        let (conn, _client) = make_connection();
        table.add(conn.clone());

        let req = parse("OPTIONS rtsp://localhost/stream RTSP/1.0\r\nCSeq: 1\r\n\r\n");
        let (resp, outcome) = handler.handle(&conn, &req);
        assert_eq!(resp.status_code, 200);
        assert_eq!(outcome, HandleOutcome::Continue);
        assert!(resp.serialize().contains("Public:"));
    }

    #[test]
    fn describe_contains_sdp_track() {
        let (handler, table) = make_handler();
        let (conn, _client) = make_connection();
        table.add(conn.clone());

        let req = parse("DESCRIBE rtsp://localhost/stream RTSP/1.0\r\nCSeq: 2\r\n\r\n");
        let (resp, _) = handler.handle(&conn, &req);
        assert_eq!(resp.status_code, 200);
        let body = resp.body.as_deref().unwrap();
        assert!(body.contains("m=video 0 RTP/AVP 96"));
        assert!(body.contains("a=control:trackID=0"));
        assert!(body.contains("sprop-parameter-sets=,;"), "empty until first key frame");
    }

    #[test]
    fn setup_interleaved_assigns_session() {
        let (handler, table) = make_handler();
        let (conn, _client) = make_connection();
        table.add(conn.clone());

        let req = parse(
            "SETUP rtsp://localhost/stream/trackID=0 RTSP/1.0\r\n\
             CSeq: 3\r\nTransport: RTP/AVP/TCP;unicast;interleaved=2-3\r\n\r\n",
        );
        let (resp, _) = handler.handle(&conn, &req);
        assert_eq!(resp.status_code, 200);
        assert!(conn.session_id().is_some());
        assert!(conn.is_interleaved());

        let serialized = resp.serialize();
        assert!(serialized.contains("interleaved=2-3"));
        assert!(serialized.contains("Session:"));
    }

    #[test]
    fn setup_multicast_rejected_without_session() {
        let (handler, table) = make_handler();
        let (conn, _client) = make_connection();
        table.add(conn.clone());

        let req = parse(
            "SETUP rtsp://localhost/stream RTSP/1.0\r\n\
             CSeq: 3\r\nTransport: RTP/AVP;multicast;port=7000-7001\r\n\r\n",
        );
        let (resp, _) = handler.handle(&conn, &req);
        assert_eq!(resp.status_code, 461);
        assert!(conn.session_id().is_none(), "461 must not create a session");
    }

    #[test]
    fn setup_missing_transport_is_bad_request() {
        let (handler, table) = make_handler();
        let (conn, _client) = make_connection();
        table.add(conn.clone());

        let req = parse("SETUP rtsp://localhost/stream RTSP/1.0\r\nCSeq: 3\r\n\r\n");
        let (resp, _) = handler.handle(&conn, &req);
        assert_eq!(resp.status_code, 400);
    }

    #[test]
    fn play_unknown_session_is_454_and_mutates_nothing() {
        let (handler, table) = make_handler();
        let (conn, _client) = make_connection();
        table.add(conn.clone());
        setup_interleaved(&handler, &conn);

        let req = parse("PLAY rtsp://localhost/stream RTSP/1.0\r\nCSeq: 5\r\nSession: FFFF\r\n\r\n");
        let (resp, _) = handler.handle(&conn, &req);
        assert_eq!(resp.status_code, 454);
        assert!(!conn.is_playing(), "unknown session must not flip play state");
    }

    #[test]
    fn play_after_setup_starts_streaming() {
        let (handler, table) = make_handler();
        let (conn, _client) = make_connection();
        table.add(conn.clone());
        setup_interleaved(&handler, &conn);

        let session = conn.session_id().unwrap();
        let req = parse(&format!(
            "PLAY rtsp://localhost/stream RTSP/1.0\r\nCSeq: 5\r\nSession: {}\r\n\r\n",
            session
        ));
        let (resp, _) = handler.handle(&conn, &req);
        assert_eq!(resp.status_code, 200);
        assert!(conn.is_playing());
        assert!(resp.serialize().contains("RTP-Info:"));
        assert!(resp.serialize().contains("Range: npt=0.000-"));
    }

    #[test]
    fn pause_unknown_session_is_454() {
        let (handler, table) = make_handler();
        let (conn, _client) = make_connection();
        table.add(conn.clone());

        let req = parse("PAUSE rtsp://localhost/stream RTSP/1.0\r\nCSeq: 6\r\nSession: FFFF\r\n\r\n");
        let (resp, _) = handler.handle(&conn, &req);
        assert_eq!(resp.status_code, 454);
    }

    #[test]
    fn pause_stops_delivery() {
        let (handler, table) = make_handler();
        let (conn, _client) = make_connection();
        table.add(conn.clone());
        setup_interleaved(&handler, &conn);
        conn.set_playing(true);

        let session = conn.session_id().unwrap();
        let req = parse(&format!(
            "PAUSE rtsp://localhost/stream RTSP/1.0\r\nCSeq: 6\r\nSession: {}\r\n\r\n",
            session
        ));
        let (resp, _) = handler.handle(&conn, &req);
        assert_eq!(resp.status_code, 200);
        assert!(!conn.is_playing());
    }

    #[test]
    fn teardown_is_idempotent() {
        let (handler, table) = make_handler();
        let (conn, _client) = make_connection();
        table.add(conn.clone());
        setup_interleaved(&handler, &conn);
        let session = conn.session_id().unwrap();

        let raw = format!(
            "TEARDOWN rtsp://localhost/stream RTSP/1.0\r\nCSeq: 7\r\nSession: {}\r\n\r\n",
            session
        );
        let (first, outcome) = handler.handle(&conn, &parse(&raw));
        assert_eq!(first.status_code, 200);
        assert_eq!(outcome, HandleOutcome::CloseConnection);
        assert!(table.is_empty());

        let (second, outcome) = handler.handle(&conn, &parse(&raw));
        assert_eq!(second.status_code, 200, "repeat TEARDOWN converges on 200");
        assert_eq!(outcome, HandleOutcome::Continue);
    }

    #[test]
    fn unknown_method_is_501() {
        let (handler, table) = make_handler();
        let (conn, _client) = make_connection();
        table.add(conn.clone());

        let req = parse("RECORD rtsp://localhost/stream RTSP/1.0\r\nCSeq: 8\r\n\r\n");
        let (resp, _) = handler.handle(&conn, &req);
        assert_eq!(resp.status_code, 501);
    }

    #[test]
    fn auth_challenge_then_denied_closes() {
        use crate::protocol::auth::{AuthScheme, Credentials};

        let table = ConnectionTable::new();
        let auth = Arc::new(Authenticator::new(
            Credentials::new("user", "pass"),
            "framecast",
            AuthScheme::Basic,
        ));
        let handler = MethodHandler::new(
            table.clone(),
            Arc::new(ServerConfig::default()),
            Some(auth),
            Arc::new(Mutex::new(ParameterSets::default())),
        );
        let (conn, _client) = make_connection();
        table.add(conn.clone());

        // no credentials: challenged, connection survives
        let req = parse("OPTIONS rtsp://localhost/stream RTSP/1.0\r\nCSeq: 1\r\n\r\n");
        let (resp, outcome) = handler.handle(&conn, &req);
        assert_eq!(resp.status_code, 401);
        assert_eq!(outcome, HandleOutcome::Continue);
        assert!(resp.serialize().contains("WWW-Authenticate:"));

        // wrong credentials: rejected and closed
        let req = parse(
            "OPTIONS rtsp://localhost/stream RTSP/1.0\r\nCSeq: 2\r\n\
             Authorization: Basic bm90OnJpZ2h0\r\n\r\n",
        );
        let (resp, outcome) = handler.handle(&conn, &req);
        assert_eq!(resp.status_code, 401);
        assert_eq!(outcome, HandleOutcome::CloseConnection);
    }

    fn setup_interleaved(handler: &MethodHandler, conn: &Arc<RtspConnection>) {
        let req = parse(
            "SETUP rtsp://localhost/stream/trackID=0 RTSP/1.0\r\n\
             CSeq: 3\r\nTransport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n",
        );
        let (resp, _) = handler.handle(conn, &req);
        assert_eq!(resp.status_code, 200);
    }
}
