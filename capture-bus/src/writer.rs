use std::sync::Arc;

use bytes::Bytes;

use crate::{
    encoder::{AudioCodec, EncoderInfo, VideoCodec},
    config::{AudioConfig, VideoConfig},
    packet::{EncodedPacket, TrackKind},
    sink::{Output, file_sink},
};

pub mod channel;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod framed;

pub use channel::ChannelWriter;
pub use framed::FramedWriter;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoTrackInfo {
    pub codec: VideoCodec,
    pub codec_id: &'static str,
    pub codec_private: Bytes,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
}

impl VideoTrackInfo {
    pub fn new(config: &VideoConfig, info: &EncoderInfo) -> Self {
        Self {
            codec: config.codec,
            codec_id: info.codec_id,
            codec_private: info.codec_private.clone(),
            width: config.width,
            height: config.height,
            framerate: config.target_framerate,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioTrackInfo {
    pub codec: AudioCodec,
    pub codec_id: &'static str,
    pub codec_private: Bytes,
    pub sample_rate: u32,
    pub num_channels: u32,
}

impl AudioTrackInfo {
    pub fn new(config: &AudioConfig, info: &EncoderInfo) -> Self {
        Self {
            codec: config.codec,
            codec_id: info.codec_id,
            codec_private: info.codec_private.clone(),
            sample_rate: config.sample_rate,
            num_channels: config.num_channels,
        }
    }
}

/// Container muxer.
///
/// Every method takes `&self`: one encoder's packets fan out to several
/// writers from the track workers, so implementations serialize internally
/// with their own lock. Tracks are attached once, before any packet. A
/// packet for a track that was never attached, or with an empty payload, is
/// ignored.
pub trait Writer: Send + Sync {
    fn attach_video_track(&self, track: &VideoTrackInfo) -> anyhow::Result<()>;
    fn attach_audio_track(&self, track: &AudioTrackInfo) -> anyhow::Result<()>;
    fn add_video_packet(&self, packet: &EncodedPacket) -> anyhow::Result<()>;
    fn add_audio_packet(&self, packet: &EncodedPacket) -> anyhow::Result<()>;
    /// Writes trailing structures and closes the output. Runs once; later
    /// calls do nothing.
    fn finalize(&self) -> anyhow::Result<()>;

    fn add_packet(&self, kind: TrackKind, packet: &EncodedPacket) -> anyhow::Result<()> {
        match kind {
            TrackKind::Video => self.add_video_packet(packet),
            TrackKind::Audio => self.add_audio_packet(packet),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContainerFormat {
    /// Built-in length-prefixed packet container.
    Framed,
    WebM,
    Mp4,
}

impl ContainerFormat {
    /// Whether the format can be written to an arbitrary byte sink, and so
    /// can fan out to several sinks at once.
    pub fn supports_sinks(&self) -> bool {
        matches!(self, ContainerFormat::Framed)
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ContainerFormat::Framed => "fcap",
            ContainerFormat::WebM => "webm",
            ContainerFormat::Mp4 => "mp4",
        }
    }
}

pub fn create_writer(format: ContainerFormat, output: Output) -> anyhow::Result<Arc<dyn Writer>> {
    match (format, output) {
        (ContainerFormat::Framed, Output::Path(path)) => {
            Ok(Arc::new(FramedWriter::new(file_sink(&path)?)?))
        }
        (ContainerFormat::Framed, Output::Sink(sink)) => Ok(Arc::new(FramedWriter::new(sink)?)),
        (format, Output::Path(path)) => external_writer(format, &path),
        (format, Output::Sink(_)) => {
            anyhow::bail!("{:?} output can only be written to a file path", format)
        }
    }
}

#[cfg(feature = "ffmpeg")]
fn external_writer(format: ContainerFormat, path: &std::path::Path) -> anyhow::Result<Arc<dyn Writer>> {
    crate::backend::ensure_initialized();
    Ok(Arc::new(ffmpeg::FfmpegWriter::new(path, format)?))
}

#[cfg(not(feature = "ffmpeg"))]
fn external_writer(format: ContainerFormat, path: &std::path::Path) -> anyhow::Result<Arc<dyn Writer>> {
    anyhow::bail!(
        "{:?} output {} requires the ffmpeg feature",
        format,
        path.display()
    )
}
