use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::protocol::{HandleOutcome, MethodHandler, RtspRequest};
use crate::session::{ConnectionTable, RtspConnection};

/// Poll interval for the non-blocking accept loop and for idle reads on
/// connection threads, so that server shutdown is observed promptly.
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Non-blocking TCP accept loop.
///
/// Registers each accepted client in the connection table and spawns a
/// reader thread for it. Reader thread handles are collected so
/// [`crate::server::RtspServer::stop`] can join them.
pub(crate) fn accept_loop(
    listener: TcpListener,
    handler: MethodHandler,
    connections: ConnectionTable,
    running: Arc<AtomicBool>,
    reader_threads: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                if stream.set_read_timeout(Some(READ_TIMEOUT)).is_err() {
                    continue;
                }

                let Ok(local_addr) = stream.local_addr() else {
                    continue;
                };
                let Ok(writer) = stream.try_clone() else {
                    continue;
                };

                let connection = Arc::new(RtspConnection::new(writer, peer_addr, local_addr));
                connections.add(connection.clone());

                let h = handler.clone();
                let t = connections.clone();
                let r = running.clone();
                let handle = thread::spawn(move || {
                    connection_loop(stream, connection, h, t, r);
                });
                reader_threads.lock().push(handle);
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}

/// Per-connection request loop: reads RTSP messages (and discards
/// interleaved binary chunks the client sends, e.g. RTCP), dispatches
/// them, and writes responses.
fn connection_loop(
    stream: TcpStream,
    connection: Arc<RtspConnection>,
    handler: MethodHandler,
    connections: ConnectionTable,
    running: Arc<AtomicBool>,
) {
    let peer_addr = connection.peer_addr();
    tracing::info!(%peer_addr, "client connected");

    let mut reader = BufReader::new(stream);
    let reason = run(&mut reader, &connection, &handler, &running);

    // the reaper, fan-out, or TEARDOWN may have removed it already
    if connections.remove(connection.id).is_some() {
        connection.close();
    }

    tracing::info!(%peer_addr, reason, "client disconnected");
}

fn run(
    reader: &mut BufReader<TcpStream>,
    connection: &Arc<RtspConnection>,
    handler: &MethodHandler,
    running: &Arc<AtomicBool>,
) -> &'static str {
    loop {
        if !running.load(Ordering::SeqCst) {
            return "server shutting down";
        }

        // Peek at one byte to distinguish text requests from '$'-framed
        // interleaved data; a read timeout just re-checks the running flag.
        let mut first = [0u8; 1];
        match reader.read(&mut first) {
            Ok(0) => return "connection closed by client",
            Ok(_) => {}
            Err(e) if is_timeout(&e) => continue,
            Err(_) => return "read error",
        }

        if first[0] == b'$' {
            // RFC 2326 §10.12 embedded binary data: channel + length + payload.
            // Clients use this for RTCP receiver reports; consume and drop.
            let mut header = [0u8; 3];
            if read_exact_retry(reader, &mut header, running).is_err() {
                return "read error";
            }
            let length = u16::from_be_bytes([header[1], header[2]]) as usize;
            let mut payload = vec![0u8; length];
            if read_exact_retry(reader, &mut payload, running).is_err() {
                return "read error";
            }
            connection.touch_keepalive();
            continue;
        }

        // Text request: `first` already holds the leading byte of the
        // request line.
        let mut request_text = String::new();
        let mut line = vec![first[0]];
        if read_line_retry(reader, &mut line, running).is_err() {
            return "read error";
        }
        request_text.push_str(&String::from_utf8_lossy(&line));

        loop {
            let mut line = Vec::new();
            match read_line_retry(reader, &mut line, running) {
                Ok(0) => return "connection closed by client",
                Ok(_) => {}
                Err(_) => return "read error",
            }
            let text = String::from_utf8_lossy(&line);
            request_text.push_str(&text);
            if text == "\r\n" || text == "\n" {
                break;
            }
        }

        match RtspRequest::parse(&request_text) {
            Ok(request) => {
                // drain any request body; nothing uses one today
                let body_len = request.content_length();
                if body_len > 0 {
                    let mut body = vec![0u8; body_len];
                    if read_exact_retry(reader, &mut body, running).is_err() {
                        return "read error";
                    }
                }

                tracing::debug!(
                    peer = %connection.peer_addr(),
                    method = %request.method.as_str(),
                    uri = %request.uri,
                    "request"
                );

                let (response, outcome) = handler.handle(connection, &request);

                tracing::debug!(
                    peer = %connection.peer_addr(),
                    status = response.status_code,
                    "response"
                );

                if connection.send_response(&response).is_err() {
                    return "write error";
                }

                if outcome == HandleOutcome::CloseConnection {
                    return "connection closed by server";
                }
            }
            Err(e) => {
                tracing::warn!(peer = %connection.peer_addr(), error = %e, "parse error");
            }
        }
    }
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// `read_until('\n')` that rides out read timeouts, since a request can
/// straddle the timeout window. Bytes read before a timeout stay in `buf`.
fn read_line_retry(
    reader: &mut BufReader<TcpStream>,
    buf: &mut Vec<u8>,
    running: &Arc<AtomicBool>,
) -> std::io::Result<usize> {
    loop {
        match reader.read_until(b'\n', buf) {
            Err(e) if is_timeout(&e) => {
                if !running.load(Ordering::SeqCst) {
                    return Err(e);
                }
            }
            other => return other,
        }
    }
}

/// `read_exact` that rides out read timeouts without losing already-read
/// bytes.
fn read_exact_retry(
    reader: &mut BufReader<TcpStream>,
    buf: &mut [u8],
    running: &Arc<AtomicBool>,
) -> std::io::Result<()> {
    let mut filled = 0usize;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if is_timeout(&e) => {
                if !running.load(Ordering::SeqCst) {
                    return Err(e);
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
