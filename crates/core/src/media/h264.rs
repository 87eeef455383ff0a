use crate::encoder::EncodedFrame;
use crate::media::rtp::{RtpPacket, rtp_timestamp_90khz};

/// Largest RTP payload emitted in a single packet. NALs above this are
/// fragmented with FU-A.
pub const DEFAULT_PACKET_LIMIT: usize = 1400;

const STAP_A_TYPE: u8 = 24;
const FU_A_TYPE: u8 = 28;

/// H.264 RTP packetizer (RFC 6184).
///
/// Converts one encoded frame — up to three ordered NAL segments (SPS,
/// PPS, image) sharing a single presentation timestamp — into RTP
/// packets, using three packetization modes from RFC 6184:
///
/// - **Single NAL Unit** (§5.6): SPS/PPS segments fit in one packet and
///   are copied as-is after the RTP header.
///
/// - **STAP-A aggregation** (§5.7): encoders emit several NALs per image
///   segment, delimited by Annex B start codes. These are aggregated into
///   one packet, each NAL prefixed by its 16-bit big-endian size:
///
///   ```text
///   STAP-A indicator: [F|NRI|Type=24]          (1 byte)
///   Per NAL:          [size (2 bytes BE)][NAL]
///   ```
///
/// - **FU-A fragmentation** (§5.8): segments exceeding the packet limit
///   are split across packets. The first byte of the original NAL is
///   consumed into a 2-byte FU header preceding each fragment:
///
///   ```text
///   FU indicator:  [F|NRI|Type=28]     (1 byte)
///   FU header:     [S|E|R|NAL_Type]    (1 byte)
///   Fragment data: [...]               (payload slice, capped to limit)
///   ```
///
/// The RTP marker bit is set only on the last packet produced for the
/// image segment (the access unit boundary, RFC 6184 §5.1). Sequence
/// numbers and SSRC are left zero; the connection layer patches them per
/// client at send time.
#[derive(Debug)]
pub struct H264Packetizer {
    pt: u8,
    packet_limit: usize,
}

impl H264Packetizer {
    pub fn new(pt: u8) -> Self {
        Self::with_packet_limit(pt, DEFAULT_PACKET_LIMIT)
    }

    /// Create with an explicit single-packet payload limit.
    pub fn with_packet_limit(pt: u8, packet_limit: usize) -> Self {
        Self { pt, packet_limit }
    }

    pub fn payload_type(&self) -> u8 {
        self.pt
    }

    /// Packetize an encoded frame for delivery at the given capture time.
    pub fn packetize_frame(&self, frame: &EncodedFrame, timestamp_ns: u64) -> Vec<RtpPacket> {
        self.packetize(&frame.sps, &frame.pps, &frame.image, timestamp_ns)
    }

    /// Packetize the SPS, PPS, and image NAL segments of one frame.
    ///
    /// SPS/PPS are raw NAL bytes and empty on delta frames. The image
    /// segment is an Annex B stream possibly holding several NALs.
    pub fn packetize(
        &self,
        sps: &[u8],
        pps: &[u8],
        image: &[u8],
        timestamp_ns: u64,
    ) -> Vec<RtpPacket> {
        let ts = rtp_timestamp_90khz(timestamp_ns);
        let mut packets = Vec::new();

        for (index, segment) in [sps, pps, image].into_iter().enumerate() {
            if segment.is_empty() {
                continue;
            }

            // The image segment closes the access unit and carries the marker.
            let is_image = index == 2;

            if segment.len() > self.packet_limit {
                self.fragment(segment, is_image, ts, &mut packets);
            } else if is_image {
                packets.push(self.aggregate(segment, ts));
            } else {
                let mut packet = RtpPacket::new(self.pt, false, ts, segment.len());
                packet.extend_from_slice(segment);
                packets.push(packet);
            }
        }

        tracing::trace!(
            rtp_packets = packets.len(),
            sps_bytes = sps.len(),
            pps_bytes = pps.len(),
            image_bytes = image.len(),
            ts,
            "frame packetized"
        );

        packets
    }

    /// FU-A fragmentation (RFC 6184 §5.8).
    ///
    /// The NAL header byte is consumed into the FU indicator/header pair;
    /// the remaining payload is sliced into chunks of at most the packet
    /// limit. The marker bit goes on the final fragment of the image NAL.
    fn fragment(&self, nal: &[u8], is_image: bool, ts: u32, out: &mut Vec<RtpPacket>) {
        let nal_header = nal[0];
        let nri = nal_header & 0x60;
        let nal_type = nal_header & 0x1f;
        let fu_indicator = nri | FU_A_TYPE;

        let payload = &nal[1..];
        let mut offset = 0usize;
        let mut first = true;
        let mut fragments = 0usize;

        while offset < payload.len() {
            let remaining = payload.len() - offset;
            let chunk = remaining.min(self.packet_limit);
            let last = chunk == remaining;

            let fu_header = ((first as u8) << 7) | ((last as u8) << 6) | nal_type;
            let marker = is_image && last;

            let mut packet = RtpPacket::new(self.pt, marker, ts, 2 + chunk);
            packet.push(fu_indicator);
            packet.push(fu_header);
            packet.extend_from_slice(&payload[offset..offset + chunk]);
            out.push(packet);

            offset += chunk;
            first = false;
            fragments += 1;
        }

        tracing::trace!(nal_type, nal_size = nal.len(), fragments, "FU-A fragmented NAL unit");
    }

    /// STAP-A aggregation (RFC 6184 §5.7) of the image segment.
    ///
    /// The segment is scanned for Annex B start codes; each embedded NAL
    /// is emitted with a 16-bit size prefix. A segment without start codes
    /// aggregates as a single entry. The indicator NRI is the maximum of
    /// the aggregated NALs per RFC 6184 §5.7.
    fn aggregate(&self, segment: &[u8], ts: u32) -> RtpPacket {
        let embedded = extract_nal_units(segment);
        let units: Vec<&[u8]> = if embedded.is_empty() {
            vec![segment]
        } else {
            embedded
        };

        let nri = units
            .iter()
            .filter(|unit| !unit.is_empty())
            .map(|unit| unit[0] & 0x60)
            .max()
            .unwrap_or(0x20);

        let total: usize = units.iter().map(|unit| 2 + unit.len()).sum();
        let mut packet = RtpPacket::new(self.pt, true, ts, 1 + total);
        packet.push(nri | STAP_A_TYPE);

        for unit in &units {
            packet.extend_from_slice(&(unit.len() as u16).to_be_bytes());
            packet.extend_from_slice(unit);
        }

        tracing::trace!(
            nal_count = units.len(),
            packet_size = packet.len(),
            "STAP-A aggregated image segment"
        );

        packet
    }
}

/// Extract NAL units from an H.264 Annex B bitstream.
///
/// Scans for start codes (both 4-byte `00 00 00 01` and 3-byte
/// `00 00 01`) and returns the NAL data between them, excluding the
/// start codes themselves. The start code length is tracked per NAL so
/// boundaries between adjacent NALs are computed correctly when mixed
/// 3-byte and 4-byte start codes appear.
pub fn extract_nal_units(data: &[u8]) -> Vec<&[u8]> {
    // (nal data start index, start code length)
    let mut starts: Vec<(usize, usize)> = Vec::new();
    let mut i = 0usize;

    while i < data.len() {
        if data[i..].starts_with(&[0, 0, 0, 1]) {
            starts.push((i + 4, 4));
            i += 4;
        } else if data[i..].starts_with(&[0, 0, 1]) {
            starts.push((i + 3, 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut units = Vec::with_capacity(starts.len());
    for (k, &(start, _)) in starts.iter().enumerate() {
        let end = match starts.get(k + 1) {
            Some(&(next_start, next_sc_len)) => next_start - next_sc_len,
            None => data.len(),
        };
        if start < end {
            units.push(&data[start..end]);
        }
    }

    units
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::rtp::RTP_HEADER_LEN;

    fn make_packetizer() -> H264Packetizer {
        H264Packetizer::new(96)
    }

    // --- NAL extraction ---

    #[test]
    fn extract_single_nal_4byte_sc() {
        let data = [0, 0, 0, 1, 0x65, 0xAA, 0xBB];
        let nals = extract_nal_units(&data);
        assert_eq!(nals, vec![&[0x65, 0xAA, 0xBB][..]]);
    }

    #[test]
    fn extract_single_nal_3byte_sc() {
        let data = [0, 0, 1, 0x67, 0x42, 0x00];
        let nals = extract_nal_units(&data);
        assert_eq!(nals, vec![&[0x67, 0x42, 0x00][..]]);
    }

    #[test]
    fn extract_mixed_start_codes() {
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42];
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xCE]);
        let nals = extract_nal_units(&data);
        assert_eq!(nals, vec![&[0x67, 0x42][..], &[0x68, 0xCE][..]]);
    }

    #[test]
    fn extract_empty_and_no_start_code() {
        assert!(extract_nal_units(&[]).is_empty());
        assert!(extract_nal_units(&[0xFF, 0xFE]).is_empty());
    }

    // --- single NAL / STAP-A ---

    #[test]
    fn sps_pps_sent_as_single_nal_packets() {
        let p = make_packetizer();
        let sps = [0x67, 0x42, 0x00, 0x1e];
        let pps = [0x68, 0xce, 0x38, 0x80];
        let image = [0, 0, 0, 1, 0x65, 0x88];
        let packets = p.packetize(&sps, &pps, &image, 0);
        assert_eq!(packets.len(), 3);

        // raw copies, no marker on parameter sets
        assert_eq!(packets[0].payload(), &sps);
        assert!(!packets[0].marker());
        assert_eq!(packets[1].payload(), &pps);
        assert!(!packets[1].marker());
        assert!(packets[2].marker());
    }

    #[test]
    fn image_segment_aggregated_as_stap_a() {
        let p = make_packetizer();
        let image = [
            &[0u8, 0, 0, 1, 0x65, 0x88, 0x01][..],
            &[0, 0, 0, 1, 0x41, 0x9A][..],
        ]
        .concat();
        let packets = p.packetize(&[], &[], &image, 0);
        assert_eq!(packets.len(), 1);

        let payload = packets[0].payload();
        assert_eq!(payload[0] & 0x1f, STAP_A_TYPE);
        // first NAL: size 3, then bytes
        assert_eq!(&payload[1..3], &[0, 3]);
        assert_eq!(&payload[3..6], &[0x65, 0x88, 0x01]);
        // second NAL: size 2, then bytes
        assert_eq!(&payload[6..8], &[0, 2]);
        assert_eq!(&payload[8..10], &[0x41, 0x9A]);
        assert!(packets[0].marker());
    }

    #[test]
    fn stap_a_nri_is_max_of_aggregated_nals() {
        let p = make_packetizer();
        // NRI 3 (0x60) on the slice, NRI 0 on the filler NAL
        let image = [
            &[0u8, 0, 0, 1, 0x65, 0x88][..], // 0x65: NRI = 3
            &[0, 0, 0, 1, 0x0c, 0x00][..],   // 0x0c: NRI = 0
        ]
        .concat();
        let packets = p.packetize(&[], &[], &image, 0);
        assert_eq!(packets[0].payload()[0] & 0x60, 0x60);
    }

    #[test]
    fn image_without_start_codes_is_single_entry_stap() {
        let p = make_packetizer();
        let image = [0x65, 0xAA, 0xBB, 0xCC];
        let packets = p.packetize(&[], &[], &image, 0);
        assert_eq!(packets.len(), 1);

        let payload = packets[0].payload();
        assert_eq!(payload[0] & 0x1f, STAP_A_TYPE);
        assert_eq!(&payload[1..3], &[0, 4]);
        assert_eq!(&payload[3..], &image, "entry is a byte-for-byte copy");
    }

    #[test]
    fn empty_frame_produces_no_packets() {
        let p = make_packetizer();
        assert!(p.packetize(&[], &[], &[], 0).is_empty());
    }

    // --- FU-A ---

    #[test]
    fn large_nal_fragmented() {
        let p = H264Packetizer::with_packet_limit(96, 100);
        let mut image = vec![0x65];
        image.extend(vec![0xAA; 250]);
        let packets = p.packetize(&[], &[], &image, 0);
        assert_eq!(packets.len(), 3); // 250 payload bytes in chunks of 100

        for packet in &packets {
            assert_eq!(packet.payload()[0] & 0x1f, FU_A_TYPE);
            assert_eq!(packet.payload()[0] & 0x60, 0x60); // NRI preserved
        }
        assert_eq!(packets[0].payload()[1] & 0x80, 0x80); // start bit
        assert_eq!(packets[2].payload()[1] & 0x40, 0x40); // end bit
        assert!(!packets[0].marker());
        assert!(!packets[1].marker());
        assert!(packets[2].marker());
    }

    #[test]
    fn fu_a_reassembly_is_lossless() {
        let p = H264Packetizer::with_packet_limit(96, 64);
        let mut nal = vec![0x65];
        nal.extend((0..500).map(|i| (i % 251) as u8));
        let packets = p.packetize(&[], &[], &nal, 0);
        assert!(packets.len() > 1);

        // Reconstruct the NAL header from the FU indicator/header pair,
        // then concatenate fragment payloads.
        let indicator = packets[0].payload()[0];
        let fu_header = packets[0].payload()[1];
        let mut rebuilt = vec![(indicator & 0x60) | (fu_header & 0x1f)];
        for packet in &packets {
            rebuilt.extend_from_slice(&packet.payload()[2..]);
        }
        assert_eq!(rebuilt, nal);
    }

    #[test]
    fn marker_on_final_fragment_only() {
        let p = H264Packetizer::with_packet_limit(96, 50);
        let sps = [0x67, 0x42, 0x00, 0x1e];
        let mut image = vec![0x65];
        image.extend(vec![0x11; 120]);
        let packets = p.packetize(&sps, &[], &image, 0);

        let markers: Vec<bool> = packets.iter().map(|p| p.marker()).collect();
        assert_eq!(markers.iter().filter(|m| **m).count(), 1);
        assert!(markers.last().copied().unwrap());
    }

    #[test]
    fn fragmented_sps_carries_no_marker() {
        // A pathological oversized parameter set still fragments, but the
        // marker stays reserved for the image segment.
        let p = H264Packetizer::with_packet_limit(96, 32);
        let mut sps = vec![0x67];
        sps.extend(vec![0x00; 100]);
        let image = [0x65, 0x01];
        let packets = p.packetize(&sps, &[], &image, 0);
        let (image_packet, sps_packets) = packets.split_last().unwrap();
        assert!(sps_packets.iter().all(|p| !p.marker()));
        assert!(image_packet.marker());
    }

    // --- header fields ---

    #[test]
    fn timestamp_converted_to_90khz() {
        let p = make_packetizer();
        let packets = p.packetize(&[], &[], &[0x65, 0x01], 1_000_000_000);
        assert_eq!(packets[0].timestamp(), 90_000);
    }

    #[test]
    fn packets_have_fixed_header_and_zero_seq_ssrc() {
        let p = make_packetizer();
        let packets = p.packetize(&[], &[], &[0x65, 0x01], 0);
        let packet = &packets[0];
        assert!(packet.len() > RTP_HEADER_LEN);
        assert_eq!(packet.sequence(), 0);
        assert_eq!(packet.ssrc(), 0);
        assert_eq!(packet.payload_type(), 96);
    }
}
