//! RTSP protocol surface: request parsing, response building, method
//! dispatch, authentication, and SDP generation (RFC 2326).

pub mod auth;
pub mod handler;
pub mod request;
pub mod response;
pub mod sdp;

pub use auth::{AuthScheme, Authenticator, Credentials};
pub use handler::{HandleOutcome, MethodHandler};
pub use request::{Method, RtspRequest};
pub use response::RtspResponse;
