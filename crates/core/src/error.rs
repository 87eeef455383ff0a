//! Error types for the streaming server library.

use std::fmt;

/// Errors that can occur in the streaming server library.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Protocol**: [`Parse`](Self::Parse) — malformed RTSP messages,
///   [`UnsupportedTransport`](Self::UnsupportedTransport) — failed SETUP
///   negotiation, [`SessionNotFound`](Self::SessionNotFound).
/// - **Transport**: [`Io`](Self::Io) — socket/network failures,
///   [`PortRangeExhausted`](Self::PortRangeExhausted) — no free UDP port pair.
/// - **Encoder**: [`EncoderSetup`](Self::EncoderSetup) — native context
///   creation failed (the encoder stays failed until reconfigured),
///   [`EncoderNotReady`](Self::EncoderNotReady),
///   [`InvalidFrame`](Self::InvalidFrame) — input buffer size mismatch,
///   [`EncoderKindMismatch`](Self::EncoderKindMismatch) — a CPU buffer was
///   handed to a hardware encoder or vice versa.
/// - **Server**: [`NotStarted`](Self::NotStarted),
///   [`AlreadyRunning`](Self::AlreadyRunning).
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse an RTSP request message (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// No connection with the given session ID exists.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Transport negotiation during SETUP failed (maps to RTSP 461).
    #[error("unsupported transport")]
    UnsupportedTransport,

    /// No free UDP port pair in the configured allocation range.
    #[error("UDP port range exhausted")]
    PortRangeExhausted,

    /// [`StreamServer::start`](crate::StreamServer::start) has not been called yet.
    #[error("server not started")]
    NotStarted,

    /// [`StreamServer::start`](crate::StreamServer::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,

    /// Creating the native encoder context failed.
    #[error("encoder setup failed: {0}")]
    EncoderSetup(String),

    /// The encoder is not initialized, or a previous setup failed and no
    /// settings change has been made since.
    #[error("encoder not ready")]
    EncoderNotReady,

    /// A pixel buffer did not match the size implied by the encoder settings.
    #[error("frame buffer is {actual} bytes, encoder expects {expected}")]
    InvalidFrame { expected: usize, actual: usize },

    /// Encode input kind does not match the encoder kind (buffer vs texture).
    #[error("encode input does not match encoder kind")]
    EncoderKindMismatch,
}

/// Specific kind of RTSP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
        }
    }
}

/// Convenience alias for `Result<T, StreamError>`.
pub type Result<T> = std::result::Result<T, StreamError>;
