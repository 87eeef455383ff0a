use super::openh264::OpenH264Context;
use super::{EncodedFrame, EncoderSettings, EncoderStatus, PixelFormat};
use crate::error::{Result, StreamError};

/// Software H.264 encoder over the bundled OpenH264 codec.
///
/// The native context is created lazily on the first [`update`](Self::update)
/// and recreated whenever the settings tuple changes. A failed context
/// creation leaves the encoder in [`EncoderStatus::Failed`]; frames are
/// rejected until a settings change triggers another setup attempt.
///
/// Encoding is synchronous and runs on whichever thread calls
/// [`encode`](Self::encode) — in the server that is the background thread
/// draining the frame queue, never the capture thread.
pub struct SoftwareEncoder {
    settings: Option<EncoderSettings>,
    context: Option<OpenH264Context>,
    status: EncoderStatus,
}

impl SoftwareEncoder {
    pub fn new() -> Self {
        Self {
            settings: None,
            context: None,
            status: EncoderStatus::NotInitialized,
        }
    }

    pub fn status(&self) -> EncoderStatus {
        self.status
    }

    pub fn pixel_format(&self) -> PixelFormat {
        PixelFormat::I420
    }

    /// Set up the encoder, or re-initialize it when `settings` differ from
    /// the active configuration. Unchanged settings are a no-op.
    pub fn update(&mut self, settings: EncoderSettings) -> Result<()> {
        if self.settings == Some(settings) {
            return match self.status {
                EncoderStatus::Initialized => Ok(()),
                _ => Err(StreamError::EncoderNotReady),
            };
        }

        if self.context.take().is_some() {
            tracing::debug!(?settings, "encoder settings changed, recreating context");
        }
        self.settings = Some(settings);

        match OpenH264Context::new(&settings) {
            Ok(context) => {
                self.context = Some(context);
                self.status = EncoderStatus::Initialized;
                tracing::debug!(
                    width = settings.width,
                    height = settings.height,
                    frame_rate = settings.frame_rate,
                    bit_rate_kbps = settings.bit_rate,
                    "software encoder initialized"
                );
                Ok(())
            }
            Err(e) => {
                self.status = EncoderStatus::Failed;
                tracing::error!(error = %e, "software encoder setup failed");
                Err(e)
            }
        }
    }

    /// Encode one I420 frame into `frame`.
    ///
    /// Returns `Ok(false)` on a transient encode failure — the frame is
    /// skipped and the encoder remains usable.
    pub fn encode(
        &mut self,
        image: &[u8],
        timestamp_ns: u64,
        frame: &mut EncodedFrame,
    ) -> Result<bool> {
        let Some(settings) = self.settings else {
            return Err(StreamError::EncoderNotReady);
        };

        let expected = PixelFormat::I420.buffer_size(settings.width, settings.height);
        if image.len() != expected {
            return Err(StreamError::InvalidFrame {
                expected,
                actual: image.len(),
            });
        }

        let Some(context) = self.context.as_mut() else {
            return Err(StreamError::EncoderNotReady);
        };

        let encoded = context.encode(image, frame)?;
        if !encoded {
            tracing::warn!(
                timestamp_ms = timestamp_ns / 1_000_000,
                "transient encode failure, frame skipped"
            );
        }
        Ok(encoded)
    }
}

impl Default for SoftwareEncoder {
    fn default() -> Self {
        Self::new()
    }
}
