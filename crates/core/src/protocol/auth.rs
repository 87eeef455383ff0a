//! RTSP request authentication (RFC 2326 §16.2, RFC 2069).
//!
//! Supports the two schemes clients actually send: Basic (base64
//! `user:password`) and Digest (MD5 challenge/response over a server
//! nonce). When credentials are configured, the server challenges every
//! request carrying no `Authorization` header and tears the connection
//! down on an invalid one.

use std::fmt;

use base64::prelude::{BASE64_STANDARD, Engine as _};
use rand::RngExt;

use crate::protocol::request::RtspRequest;

/// Username/password pair a client must present.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Which challenge scheme the server advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Basic,
    Digest,
}

/// Result of validating one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Credentials present and correct.
    Authorized,
    /// No credentials — answer 401 with a challenge, keep the connection.
    Challenge,
    /// Wrong credentials — answer 401 and tear the connection down.
    Denied,
}

/// Server-side validator for one realm.
///
/// The nonce is generated once per server start; stale-nonce rotation is
/// not implemented (clients re-handshake on reconnect).
pub struct Authenticator {
    credentials: Credentials,
    realm: String,
    nonce: String,
    scheme: AuthScheme,
}

impl Authenticator {
    pub fn new(credentials: Credentials, realm: &str, scheme: AuthScheme) -> Self {
        let mut rng = rand::rng();
        let nonce = format!("{:08x}{:08x}", rng.random::<u32>(), rng.random::<u32>());
        Self {
            credentials,
            realm: realm.to_string(),
            nonce,
            scheme,
        }
    }

    /// The `WWW-Authenticate` header value sent with 401 responses.
    pub fn challenge(&self) -> String {
        match self.scheme {
            AuthScheme::Basic => format!("Basic realm=\"{}\"", self.realm),
            AuthScheme::Digest => {
                format!("Digest realm=\"{}\", nonce=\"{}\"", self.realm, self.nonce)
            }
        }
    }

    /// Validate the `Authorization` header of a request, if any.
    ///
    /// Either scheme is accepted regardless of which one the challenge
    /// advertised.
    pub fn check(&self, request: &RtspRequest) -> AuthOutcome {
        let Some(header) = request.get_header("Authorization") else {
            return AuthOutcome::Challenge;
        };

        let valid = if let Some(encoded) = header.strip_prefix("Basic ") {
            self.check_basic(encoded.trim())
        } else if let Some(params) = header.strip_prefix("Digest ") {
            self.check_digest(params, request.method.as_str())
        } else {
            false
        };

        if valid {
            AuthOutcome::Authorized
        } else {
            tracing::warn!(scheme = header.split(' ').next().unwrap_or(""), "authorization rejected");
            AuthOutcome::Denied
        }
    }

    fn check_basic(&self, encoded: &str) -> bool {
        let Ok(decoded) = BASE64_STANDARD.decode(encoded) else {
            return false;
        };
        let Ok(pair) = String::from_utf8(decoded) else {
            return false;
        };
        match pair.split_once(':') {
            Some((user, pass)) => {
                user == self.credentials.username && pass == self.credentials.password
            }
            None => false,
        }
    }

    /// RFC 2069 digest: `MD5(HA1:nonce:HA2)` with `HA1 =
    /// MD5(user:realm:password)` and `HA2 = MD5(method:uri)`.
    fn check_digest(&self, params: &str, method: &str) -> bool {
        let field = |name: &str| digest_param(params, name);

        let (Some(username), Some(realm), Some(nonce), Some(uri), Some(response)) = (
            field("username"),
            field("realm"),
            field("nonce"),
            field("uri"),
            field("response"),
        ) else {
            return false;
        };

        if username != self.credentials.username || realm != self.realm || nonce != self.nonce {
            return false;
        }

        let ha1 = md5_hex(&format!(
            "{}:{}:{}",
            self.credentials.username, self.realm, self.credentials.password
        ));
        let ha2 = md5_hex(&format!("{}:{}", method, uri));
        let expected = md5_hex(&format!("{}:{}:{}", ha1, self.nonce, ha2));

        expected.eq_ignore_ascii_case(&response)
    }
}

/// Extract one `name="value"` (or bare `name=value`) parameter from a
/// Digest header parameter list.
fn digest_param(params: &str, name: &str) -> Option<String> {
    params.split(',').find_map(|part| {
        let (key, value) = part.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case(name) {
            return None;
        }
        Some(value.trim().trim_matches('"').to_string())
    })
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticator(scheme: AuthScheme) -> Authenticator {
        Authenticator::new(Credentials::new("operator", "hunter2"), "framecast", scheme)
    }

    fn request_with_auth(auth_value: Option<&str>) -> RtspRequest {
        let mut raw = String::from("DESCRIBE rtsp://localhost/stream RTSP/1.0\r\nCSeq: 2\r\n");
        if let Some(value) = auth_value {
            raw.push_str(&format!("Authorization: {}\r\n", value));
        }
        raw.push_str("\r\n");
        RtspRequest::parse(&raw).unwrap()
    }

    #[test]
    fn missing_credentials_get_challenged() {
        let auth = authenticator(AuthScheme::Digest);
        assert_eq!(auth.check(&request_with_auth(None)), AuthOutcome::Challenge);
        assert!(auth.challenge().starts_with("Digest realm=\"framecast\""));
    }

    #[test]
    fn basic_round_trip() {
        let auth = authenticator(AuthScheme::Basic);
        let encoded = BASE64_STANDARD.encode("operator:hunter2");
        let req = request_with_auth(Some(&format!("Basic {}", encoded)));
        assert_eq!(auth.check(&req), AuthOutcome::Authorized);
    }

    #[test]
    fn basic_wrong_password_denied() {
        let auth = authenticator(AuthScheme::Basic);
        let encoded = BASE64_STANDARD.encode("operator:letmein");
        let req = request_with_auth(Some(&format!("Basic {}", encoded)));
        assert_eq!(auth.check(&req), AuthOutcome::Denied);
    }

    #[test]
    fn basic_malformed_base64_denied() {
        let auth = authenticator(AuthScheme::Basic);
        let req = request_with_auth(Some("Basic $$$not-base64$$$"));
        assert_eq!(auth.check(&req), AuthOutcome::Denied);
    }

    #[test]
    fn digest_round_trip() {
        let auth = authenticator(AuthScheme::Digest);
        let uri = "rtsp://localhost/stream";

        // compute the response exactly as a client would
        let ha1 = md5_hex("operator:framecast:hunter2");
        let ha2 = md5_hex(&format!("DESCRIBE:{}", uri));
        let response = md5_hex(&format!("{}:{}:{}", ha1, auth.nonce, ha2));

        let value = format!(
            "Digest username=\"operator\", realm=\"framecast\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
            auth.nonce, uri, response
        );
        let req = request_with_auth(Some(&value));
        assert_eq!(auth.check(&req), AuthOutcome::Authorized);
    }

    #[test]
    fn digest_stale_nonce_denied() {
        let auth = authenticator(AuthScheme::Digest);
        let uri = "rtsp://localhost/stream";
        let ha1 = md5_hex("operator:framecast:hunter2");
        let ha2 = md5_hex(&format!("DESCRIBE:{}", uri));
        let response = md5_hex(&format!("{}:deadbeef:{}", ha1, ha2));

        let value = format!(
            "Digest username=\"operator\", realm=\"framecast\", nonce=\"deadbeef\", uri=\"{}\", response=\"{}\"",
            uri, response
        );
        assert_eq!(auth.check(&request_with_auth(Some(&value))), AuthOutcome::Denied);
    }

    #[test]
    fn unknown_scheme_denied() {
        let auth = authenticator(AuthScheme::Basic);
        let req = request_with_auth(Some("Bearer some-token"));
        assert_eq!(auth.check(&req), AuthOutcome::Denied);
    }
}
