//! SDP (Session Description Protocol) generation (RFC 4566 / RFC 8866).
//!
//! Produces the SDP body returned by DESCRIBE responses. The format:
//!
//! ```text
//! v=0                                          ← protocol version
//! o=<user> <sess-id> <sess-ver> IN IP4 <addr>  ← origin
//! s=<session-name>                              ← session name
//! c=IN IP4 <addr>                               ← connection address
//! t=0 0                                         ← timing (live stream)
//! a=tool:framecast                              ← server software (§6)
//! a=sendonly                                    ← direction (§6)
//! m=video 0 RTP/AVP 96                          ← media description
//! a=control:trackID=0                           ← track control URL
//! a=rtpmap:96 H264/90000                        ← codec/clock rate
//! a=fmtp:96 profile-level-id=...; sprop-parameter-sets=...;
//! ```
//!
//! The `sprop-parameter-sets` carry the base64 SPS/PPS captured from the
//! last key frame; both are empty strings until the first key frame has
//! been encoded. `profile-level-id` is derived from SPS bytes 1–3 when an
//! SPS is available (RFC 6184 §8.1).

use base64::prelude::{BASE64_STANDARD, Engine as _};

/// Advertised profile before any SPS has been seen: Baseline, level 3.0.
const DEFAULT_PROFILE_LEVEL_ID: &str = "42A01E";

/// Generate an SDP session description for the single H.264 video track.
pub fn generate_sdp(
    ip: &str,
    username: &str,
    session_id: &str,
    session_version: &str,
    session_name: &str,
    payload_type: u8,
    sps: &[u8],
    pps: &[u8],
) -> String {
    let profile_level_id = if sps.len() >= 4 {
        format!("{:02X}{:02X}{:02X}", sps[1], sps[2], sps[3])
    } else {
        DEFAULT_PROFILE_LEVEL_ID.to_string()
    };

    let mut sdp: Vec<String> = Vec::new();

    sdp.push("v=0".to_string());
    sdp.push(format!(
        "o={} {} {} IN IP4 {}",
        username, session_id, session_version, ip
    ));
    sdp.push(format!("s={}", session_name));
    sdp.push(format!("c=IN IP4 {}", ip));
    sdp.push("t=0 0".to_string());
    sdp.push("a=tool:framecast".to_string());
    sdp.push("a=sendonly".to_string());
    sdp.push(format!("m=video 0 RTP/AVP {}", payload_type));
    sdp.push("a=control:trackID=0".to_string());
    sdp.push(format!("a=rtpmap:{} H264/90000", payload_type));
    sdp.push(format!(
        "a=fmtp:{} profile-level-id={}; sprop-parameter-sets={},{};",
        payload_type,
        profile_level_id,
        BASE64_STANDARD.encode(sps),
        BASE64_STANDARD.encode(pps)
    ));

    tracing::debug!("SDP: {}", sdp.join("\r\n"));

    format!("{}\r\n", sdp.join("\r\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_h264_sdp_with_parameter_sets() {
        let sps = [0x67, 0x42, 0xA0, 0x1E, 0x8D];
        let pps = [0x68, 0xCE, 0x38, 0x80];
        let sdp = generate_sdp("192.168.1.100", "-", "123", "0", "Live View", 96, &sps, &pps);

        assert!(sdp.contains("v=0\r\n"));
        assert!(sdp.contains("o=- 123 0 IN IP4 192.168.1.100\r\n"));
        assert!(sdp.contains("s=Live View\r\n"));
        assert!(sdp.contains("c=IN IP4 192.168.1.100\r\n"));
        assert!(sdp.contains("m=video 0 RTP/AVP 96\r\n"));
        assert!(sdp.contains("a=control:trackID=0\r\n"));
        assert!(sdp.contains("a=rtpmap:96 H264/90000\r\n"));
        assert!(sdp.contains("profile-level-id=42A01E"));
        assert!(sdp.contains(&format!(
            "sprop-parameter-sets={},{};",
            BASE64_STANDARD.encode(sps),
            BASE64_STANDARD.encode(pps)
        )));
        assert!(sdp.ends_with("\r\n"));

        // rtpmap must precede fmtp (RFC 6184 §8.2.1); media attributes
        // must follow the m= line
        let rtpmap_idx = sdp.find("a=rtpmap").unwrap();
        let fmtp_idx = sdp.find("a=fmtp").unwrap();
        let m_idx = sdp.find("m=video").unwrap();
        assert!(rtpmap_idx < fmtp_idx);
        assert!(m_idx < rtpmap_idx);
    }

    #[test]
    fn empty_parameter_sets_before_first_key_frame() {
        let sdp = generate_sdp("10.0.0.1", "-", "0", "0", "Stream", 96, &[], &[]);
        assert!(sdp.contains("profile-level-id=42A01E"));
        assert!(sdp.contains("sprop-parameter-sets=,;"));
    }
}
