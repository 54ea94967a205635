pub mod backend;
pub mod config;
pub mod context;
pub mod encoder;
pub mod frame;
pub mod packet;
pub mod pool;
pub mod scaler;
pub mod sink;
pub mod task_queue;
pub mod texture;
pub mod writer;

pub use config::{AudioConfig, BitrateMode, ContextConfig, VideoConfig};
pub use context::{Context, ContextState};
pub use encoder::{AudioCodec, VideoCodec};
pub use frame::PixelFormat;
pub use sink::{MemorySink, Output, Sink};
pub use texture::{TextureHandle, TextureReader};
pub use writer::{ContainerFormat, Writer};

/// Initializes the media backend and probes codecs. Optional: the first
/// [`Context`] does the same. Calling it at startup moves the probe cost out
/// of the first capture.
pub fn init() -> anyhow::Result<()> {
    let status = backend::ensure_initialized();
    if cfg!(feature = "ffmpeg") && !status.ffmpeg {
        anyhow::bail!("ffmpeg backend failed to initialize");
    }
    Ok(())
}
