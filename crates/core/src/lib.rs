pub mod encoder;
pub mod error;
pub mod media;
pub mod pipeline;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

pub use encoder::{
    EncodeInput, EncodedFrame, EncoderSettings, EncoderStatus, GpuTexture, HardwareBackend,
    PixelFormat, VideoEncoder,
};
pub use error::{Result, StreamError};
pub use protocol::{AuthScheme, Credentials};
pub use server::{FrameData, RtspServer, ServerConfig, StreamServer, VideoFrame};
