//! OpenH264 context behind [`super::software::SoftwareEncoder`].
//!
//! Maps [`EncoderSettings`] onto an `openh264` encoder instance and splits
//! the emitted Annex B bitstream into the SPS/PPS/image segments of an
//! [`EncodedFrame`]. Parameter sets are populated only on key frames.

use ::openh264::OpenH264API;
use ::openh264::encoder::{BitRate, Encoder, EncoderConfig, FrameRate, FrameType};
use ::openh264::formats::YUVSource;

use super::{EncodedFrame, EncoderSettings};
use crate::error::{Result, StreamError};
use crate::media::h264::extract_nal_units;

const ANNEX_B_START_CODE: [u8; 4] = [0, 0, 0, 1];

pub(crate) struct OpenH264Context {
    encoder: Encoder,
    width: usize,
    height: usize,
}

/// Borrowed view of an I420 buffer as the plane-separated source the
/// codec consumes.
struct I420View<'a> {
    width: usize,
    height: usize,
    y: &'a [u8],
    u: &'a [u8],
    v: &'a [u8],
}

impl YUVSource for I420View<'_> {
    fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    fn strides(&self) -> (usize, usize, usize) {
        (self.width, self.width / 2, self.width / 2)
    }

    fn y(&self) -> &[u8] {
        self.y
    }

    fn u(&self) -> &[u8] {
        self.u
    }

    fn v(&self) -> &[u8] {
        self.v
    }
}

impl OpenH264Context {
    pub fn new(settings: &EncoderSettings) -> Result<Self> {
        let config = EncoderConfig::new()
            .max_frame_rate(FrameRate::from_hz(settings.frame_rate as f32))
            .bitrate(BitRate::from_bps(settings.bit_rate.saturating_mul(1000)));

        let encoder = Encoder::with_api_config(OpenH264API::from_source(), config)
            .map_err(|e| StreamError::EncoderSetup(e.to_string()))?;

        Ok(Self {
            encoder,
            width: settings.width as usize,
            height: settings.height as usize,
        })
    }

    /// Encode one I420 frame. Returns `Ok(false)` on a transient codec
    /// failure; the caller skips the frame.
    pub fn encode(&mut self, image: &[u8], frame: &mut EncodedFrame) -> Result<bool> {
        let y_len = self.width * self.height;
        let chroma_len = y_len / 4;

        let source = I420View {
            width: self.width,
            height: self.height,
            y: &image[..y_len],
            u: &image[y_len..y_len + chroma_len],
            v: &image[y_len + chroma_len..],
        };

        let bitstream = match self.encoder.encode(&source) {
            Ok(bitstream) => bitstream,
            Err(e) => {
                tracing::warn!(error = %e, "openh264 encode failed");
                return Ok(false);
            }
        };

        let key_frame = matches!(bitstream.frame_type(), FrameType::IDR | FrameType::I);
        let annex_b = bitstream.to_vec();
        if annex_b.is_empty() {
            return Ok(false);
        }

        self.split_segments(&annex_b, key_frame, frame);
        Ok(true)
    }

    /// Distribute the Annex B output over the frame's segments: SPS and
    /// PPS as raw NALs, everything else re-joined with start codes into
    /// the image segment.
    fn split_segments(&self, annex_b: &[u8], key_frame: bool, frame: &mut EncodedFrame) {
        frame.clear();

        for nal in extract_nal_units(annex_b) {
            match nal[0] & 0x1f {
                7 if key_frame => {
                    frame.sps.extend_from_slice(nal);
                    tracing::trace!(bytes = nal.len(), "SPS captured from bitstream");
                }
                8 if key_frame => {
                    frame.pps.extend_from_slice(nal);
                    tracing::trace!(bytes = nal.len(), "PPS captured from bitstream");
                }
                _ => {
                    frame.image.extend_from_slice(&ANNEX_B_START_CODE);
                    frame.image.extend_from_slice(nal);
                }
            }
        }
    }
}
