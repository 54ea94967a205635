use bytes::Bytes;

use crate::{
    backend,
    config::{AudioConfig, VideoConfig},
    frame::I420Image,
    packet::PacketBatch,
};

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod pcm;
pub mod raw;

pub use pcm::PcmEncoder;
pub use raw::RawVideoEncoder;

/// FFmpeg encoders the backend probe looks for.
pub const FFMPEG_ENCODER_NAMES: &[&str] = &[
    "libx264",
    "libvpx",
    "libvpx-vp9",
    "libvorbis",
    "libopus",
    "aac",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VideoCodec {
    H264,
    Vp8,
    Vp9,
    Vp9Lossless,
    /// Uncompressed planar I420, built in.
    RawI420,
}

impl VideoCodec {
    /// Matroska-style codec identifier written into track headers.
    pub fn codec_id(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "V_MPEG4/ISO/AVC",
            VideoCodec::Vp8 => "V_VP8",
            VideoCodec::Vp9 | VideoCodec::Vp9Lossless => "V_VP9",
            VideoCodec::RawI420 => "V_UNCOMPRESSED",
        }
    }

    pub fn ffmpeg_encoder_name(&self) -> Option<&'static str> {
        match self {
            VideoCodec::H264 => Some("libx264"),
            VideoCodec::Vp8 => Some("libvpx"),
            VideoCodec::Vp9 | VideoCodec::Vp9Lossless => Some("libvpx-vp9"),
            VideoCodec::RawI420 => None,
        }
    }

    pub fn is_available(&self) -> bool {
        match self.ffmpeg_encoder_name() {
            Some(name) => backend::ensure_initialized().has_encoder(name),
            None => true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AudioCodec {
    Vorbis,
    Opus,
    Aac,
    /// 16-bit little-endian PCM, built in.
    PcmS16,
}

impl AudioCodec {
    pub fn codec_id(&self) -> &'static str {
        match self {
            AudioCodec::Vorbis => "A_VORBIS",
            AudioCodec::Opus => "A_OPUS",
            AudioCodec::Aac => "A_AAC",
            AudioCodec::PcmS16 => "A_PCM/INT/LIT",
        }
    }

    pub fn ffmpeg_encoder_name(&self) -> Option<&'static str> {
        match self {
            AudioCodec::Vorbis => Some("libvorbis"),
            AudioCodec::Opus => Some("libopus"),
            AudioCodec::Aac => Some("aac"),
            AudioCodec::PcmS16 => None,
        }
    }

    pub fn is_available(&self) -> bool {
        match self.ffmpeg_encoder_name() {
            Some(name) => backend::ensure_initialized().has_encoder(name),
            None => true,
        }
    }
}

/// What a writer needs to know to tag a track for this encoder's output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncoderInfo {
    pub codec_id: &'static str,
    pub codec_private: Bytes,
}

pub trait VideoEncoder: Send {
    fn info(&self) -> &EncoderInfo;

    /// Encodes one frame into `out`. `Ok(false)` means the codec is holding
    /// the frame (look-ahead) and produced nothing yet.
    fn encode(
        &mut self,
        out: &mut PacketBatch,
        image: &I420Image,
        timestamp: f64,
    ) -> anyhow::Result<bool>;

    /// Emits whatever the codec still holds. `Ok(false)` when nothing remained.
    fn flush(&mut self, out: &mut PacketBatch) -> anyhow::Result<bool>;
}

pub trait AudioEncoder: Send {
    fn info(&self) -> &EncoderInfo;

    /// `samples` are interleaved, `num_channels` per frame.
    fn encode(
        &mut self,
        out: &mut PacketBatch,
        samples: &[f32],
        timestamp: f64,
    ) -> anyhow::Result<bool>;

    fn flush(&mut self, out: &mut PacketBatch) -> anyhow::Result<bool>;
}

/// Builds encoders for a session. Called once per media kind at context
/// construction; an error disables that kind.
pub trait EncoderFactory: Send + Sync {
    fn video(&self, config: &VideoConfig) -> anyhow::Result<Box<dyn VideoEncoder>>;
    fn audio(&self, config: &AudioConfig) -> anyhow::Result<Box<dyn AudioEncoder>>;
}

/// Selects the encoder implementation from the configured codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEncoderFactory;

impl EncoderFactory for DefaultEncoderFactory {
    fn video(&self, config: &VideoConfig) -> anyhow::Result<Box<dyn VideoEncoder>> {
        match config.codec {
            VideoCodec::RawI420 => Ok(Box::new(RawVideoEncoder::new(config))),
            codec => {
                if !codec.is_available() {
                    anyhow::bail!("video codec {:?} is not available", codec);
                }
                external_video(config)
            }
        }
    }

    fn audio(&self, config: &AudioConfig) -> anyhow::Result<Box<dyn AudioEncoder>> {
        match config.codec {
            AudioCodec::PcmS16 => Ok(Box::new(PcmEncoder::new(config))),
            codec => {
                if !codec.is_available() {
                    anyhow::bail!("audio codec {:?} is not available", codec);
                }
                external_audio(config)
            }
        }
    }
}

#[cfg(feature = "ffmpeg")]
fn external_video(config: &VideoConfig) -> anyhow::Result<Box<dyn VideoEncoder>> {
    Ok(Box::new(ffmpeg::FfmpegVideoEncoder::new(config)?))
}

#[cfg(not(feature = "ffmpeg"))]
fn external_video(config: &VideoConfig) -> anyhow::Result<Box<dyn VideoEncoder>> {
    anyhow::bail!("video codec {:?} requires the ffmpeg feature", config.codec)
}

#[cfg(feature = "ffmpeg")]
fn external_audio(config: &AudioConfig) -> anyhow::Result<Box<dyn AudioEncoder>> {
    Ok(Box::new(ffmpeg::FfmpegAudioEncoder::new(config)?))
}

#[cfg(not(feature = "ffmpeg"))]
fn external_audio(config: &AudioConfig) -> anyhow::Result<Box<dyn AudioEncoder>> {
    anyhow::bail!("audio codec {:?} requires the ffmpeg feature", config.codec)
}
