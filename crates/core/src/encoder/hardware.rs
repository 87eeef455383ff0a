use super::{EncodedFrame, EncoderSettings, EncoderStatus, PixelFormat};
use crate::error::{Result, StreamError};

/// Opaque handle to a GPU-resident texture provided by the render layer.
///
/// The core never dereferences the handle; it is forwarded verbatim to
/// the [`HardwareBackend`] that knows how to address it.
#[derive(Debug, Clone, Copy)]
pub struct GpuTexture {
    pub handle: u64,
    pub width: u32,
    pub height: u32,
}

/// A GPU encoder implementation (NVENC, VideoToolbox, ...).
///
/// This is the statically-linked capability seam for platform encoders:
/// an embedding that has one constructs a [`super::VideoEncoder::hardware`]
/// around its backend, instead of the core probing for implementations at
/// runtime. Backends are driven synchronously from the capture thread
/// under the server's encoder lock.
pub trait HardwareBackend: Send {
    /// Pixel format of the textures this backend encodes.
    fn pixel_format(&self) -> PixelFormat;

    /// Create (or recreate) the native encoder context for `settings`.
    fn setup(&mut self, settings: &EncoderSettings) -> Result<()>;

    /// Submit a texture for encoding at the given capture time.
    fn encode(&mut self, texture: &GpuTexture, timestamp_ns: u64) -> Result<()>;

    /// Drain the next encoded frame, if one is ready, returning its
    /// capture timestamp.
    fn consume(&mut self, frame: &mut EncodedFrame) -> Result<Option<u64>>;
}

/// Direct-access H.264 encoder over a [`HardwareBackend`].
///
/// Carries the same lazy-setup/settings-diff lifecycle as the software
/// encoder; the backend owns the native context and is told to recreate
/// it when the settings tuple changes.
pub struct HardwareEncoder {
    backend: Box<dyn HardwareBackend>,
    settings: Option<EncoderSettings>,
    status: EncoderStatus,
}

impl HardwareEncoder {
    pub fn new(backend: Box<dyn HardwareBackend>) -> Self {
        Self {
            backend,
            settings: None,
            status: EncoderStatus::NotInitialized,
        }
    }

    pub fn status(&self) -> EncoderStatus {
        self.status
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.backend.pixel_format()
    }

    /// Set up the backend, or re-initialize it when `settings` differ from
    /// the active configuration. Unchanged settings are a no-op.
    pub fn update(&mut self, settings: EncoderSettings) -> Result<()> {
        if self.settings == Some(settings) {
            return match self.status {
                EncoderStatus::Initialized => Ok(()),
                _ => Err(StreamError::EncoderNotReady),
            };
        }

        self.settings = Some(settings);

        match self.backend.setup(&settings) {
            Ok(()) => {
                self.status = EncoderStatus::Initialized;
                tracing::debug!(?settings, "hardware encoder initialized");
                Ok(())
            }
            Err(e) => {
                self.status = EncoderStatus::Failed;
                tracing::error!(error = %e, "hardware encoder setup failed");
                Err(e)
            }
        }
    }

    /// Queue a texture for encoding. Runs on the capture thread.
    pub fn encode(&mut self, texture: &GpuTexture, timestamp_ns: u64) -> Result<()> {
        if self.status != EncoderStatus::Initialized {
            return Err(StreamError::EncoderNotReady);
        }
        self.backend.encode(texture, timestamp_ns)
    }

    /// Drain one encoded frame from the backend.
    pub fn consume(&mut self, frame: &mut EncodedFrame) -> Result<Option<u64>> {
        if self.status != EncoderStatus::Initialized {
            return Ok(None);
        }
        self.backend.consume(frame)
    }
}
