//! H.264 encoder abstraction.
//!
//! Two encoder kinds exist behind the [`VideoEncoder`] variant type:
//!
//! - **Software** ([`software::SoftwareEncoder`]): consumes CPU pixel
//!   buffers and encodes synchronously on the caller's thread. Used on the
//!   buffered path, where a background thread drains the frame queue.
//! - **Hardware** ([`hardware::HardwareEncoder`]): submits GPU texture
//!   handles to a [`hardware::HardwareBackend`] and drains encoded output
//!   with [`VideoEncoder::consume`]. Used on the direct-access path, where
//!   the capture thread pays the encode cost synchronously.
//!
//! Both share one lifecycle: `NotInitialized → Initialized` on the first
//! [`VideoEncoder::update`], re-initialization whenever the settings tuple
//! changes, and `Failed` when context creation fails — rejecting frames
//! until the settings change again.

pub mod hardware;
mod openh264;
pub mod software;

use crate::error::{Result, StreamError};

pub use hardware::{GpuTexture, HardwareBackend, HardwareEncoder};
pub use software::SoftwareEncoder;

/// The configuration of an encoder instance.
///
/// Compared by full-field equality to decide whether the native encoder
/// context must be discarded and recreated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderSettings {
    /// Output video width in pixels.
    pub width: u32,
    /// Output video height in pixels.
    pub height: u32,
    /// Output frame rate in Hz.
    pub frame_rate: u32,
    /// Target bit rate in kilobits per second.
    pub bit_rate: u32,
    /// Frames per group of pictures: one key frame followed by delta
    /// frames. Smaller values recover faster after packet loss.
    pub gop_size: u32,
}

/// Pixel layout of raw frames handed to the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Planar YUV 4:2:0 — full Y plane, then U, then V.
    I420,
    /// Biplanar YUV 4:2:0 — full Y plane, then interleaved UV.
    Nv12,
}

impl PixelFormat {
    /// Expected buffer size in bytes for a frame of the given dimensions.
    pub fn buffer_size(&self, width: u32, height: u32) -> usize {
        // both layouts are 12 bits per pixel
        (width as usize * height as usize) * 3 / 2
    }
}

/// Lifecycle status of an encoder instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderStatus {
    /// No setup has happened yet.
    NotInitialized,
    /// The native context exists and accepts frames.
    Initialized,
    /// Context creation failed; frames are rejected until the settings
    /// change triggers a new setup attempt.
    Failed,
}

/// One encoded frame: SPS, PPS, and image NAL segments.
///
/// The buffers are reused across frames to avoid per-frame allocation —
/// [`clear`](Self::clear) resets lengths without releasing capacity.
/// SPS/PPS are raw NAL bytes and non-empty only on key frames; the image
/// segment is an Annex B stream that may hold several NALs.
#[derive(Debug, Default)]
pub struct EncodedFrame {
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
    pub image: Vec<u8>,
}

impl EncodedFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset all segments, keeping allocated capacity.
    pub fn clear(&mut self) {
        self.sps.clear();
        self.pps.clear();
        self.image.clear();
    }

    /// Key frames carry fresh parameter sets.
    pub fn is_key_frame(&self) -> bool {
        !self.sps.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.sps.is_empty() && self.pps.is_empty() && self.image.is_empty()
    }
}

/// Input to a [`VideoEncoder::encode`] call.
pub enum EncodeInput<'a> {
    /// CPU-readable pixel buffer (software path).
    Buffer(&'a [u8]),
    /// GPU-resident texture handle (hardware path).
    Texture(&'a GpuTexture),
}

/// An H.264 encoder, tagged by kind at construction.
///
/// The kind is fixed for the lifetime of the value; callers dispatch
/// through the uniform `update`/`encode`/`consume` surface without
/// downcasting.
pub enum VideoEncoder {
    Software(SoftwareEncoder),
    Hardware(HardwareEncoder),
}

impl VideoEncoder {
    /// A software encoder backed by the bundled OpenH264 codec.
    pub fn software() -> Self {
        Self::Software(SoftwareEncoder::new())
    }

    /// A hardware encoder driving the given GPU backend.
    pub fn hardware(backend: Box<dyn HardwareBackend>) -> Self {
        Self::Hardware(HardwareEncoder::new(backend))
    }

    pub fn status(&self) -> EncoderStatus {
        match self {
            Self::Software(encoder) => encoder.status(),
            Self::Hardware(encoder) => encoder.status(),
        }
    }

    /// Pixel format this encoder consumes.
    pub fn pixel_format(&self) -> PixelFormat {
        match self {
            Self::Software(encoder) => encoder.pixel_format(),
            Self::Hardware(encoder) => encoder.pixel_format(),
        }
    }

    /// Hardware encoders are fed directly from the capture thread; software
    /// encoders go through the buffered frame queue.
    pub fn uses_direct_access(&self) -> bool {
        matches!(self, Self::Hardware(_))
    }

    /// Lazily set up the encoder, or re-initialize it when the settings
    /// tuple changed since the last call.
    pub fn update(&mut self, settings: EncoderSettings) -> Result<()> {
        match self {
            Self::Software(encoder) => encoder.update(settings),
            Self::Hardware(encoder) => encoder.update(settings),
        }
    }

    /// Encode one frame.
    ///
    /// Software encoders fill `frame` and return `Ok(true)` on success or
    /// `Ok(false)` on a transient encode failure (the frame is skipped,
    /// the encoder survives). Hardware encoders queue the texture and
    /// always return `Ok(false)`; output arrives via [`consume`](Self::consume).
    pub fn encode(
        &mut self,
        input: EncodeInput<'_>,
        timestamp_ns: u64,
        frame: &mut EncodedFrame,
    ) -> Result<bool> {
        match (self, input) {
            (Self::Software(encoder), EncodeInput::Buffer(data)) => {
                encoder.encode(data, timestamp_ns, frame)
            }
            (Self::Hardware(encoder), EncodeInput::Texture(texture)) => {
                encoder.encode(texture, timestamp_ns)?;
                Ok(false)
            }
            _ => Err(StreamError::EncoderKindMismatch),
        }
    }

    /// Drain one encoded frame from a hardware backend, returning its
    /// capture timestamp. Software encoders produce output synchronously
    /// from [`encode`](Self::encode) and always return `Ok(None)` here.
    pub fn consume(&mut self, frame: &mut EncodedFrame) -> Result<Option<u64>> {
        match self {
            Self::Software(_) => Ok(None),
            Self::Hardware(encoder) => encoder.consume(frame),
        }
    }
}
