use std::time::Duration;

use crate::{encoder::AudioCodec, encoder::VideoCodec, writer::ContainerFormat};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum BitrateMode {
    Cbr,
    #[default]
    Vbr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VideoConfig {
    pub enabled: bool,
    pub width: u32,
    pub height: u32,
    pub target_framerate: u32,
    pub bitrate_mode: BitrateMode,
    // bps
    pub target_bitrate: u32,
    pub codec: VideoCodec,
    // frames between forced keyframes, FFmpeg codecs only
    pub keyframe_interval: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            width: 1280,
            height: 720,
            target_framerate: 30,
            bitrate_mode: BitrateMode::Vbr,
            target_bitrate: 8_192_000,
            codec: VideoCodec::RawI420,
            keyframe_interval: 60,
        }
    }
}

impl VideoConfig {
    pub fn frame_duration(&self) -> f64 {
        1.0 / self.target_framerate.max(1) as f64
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AudioConfig {
    pub enabled: bool,
    pub sample_rate: u32,
    pub num_channels: u32,
    pub bitrate_mode: BitrateMode,
    // bps
    pub target_bitrate: u32,
    pub codec: AudioCodec,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_rate: 48_000,
            num_channels: 2,
            bitrate_mode: BitrateMode::Vbr,
            target_bitrate: 128_000,
            codec: AudioCodec::PcmS16,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ContextConfig {
    pub video: VideoConfig,
    pub audio: AudioConfig,
    pub container: ContainerFormat,
    /// Buffers per track. Fixed for the session.
    pub pool_size: usize,
    /// `None` blocks the producer until a buffer frees up.
    pub acquire_timeout: Option<Duration>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            video: VideoConfig::default(),
            audio: AudioConfig::default(),
            container: ContainerFormat::Framed,
            pool_size: 4,
            acquire_timeout: None,
        }
    }
}

impl ContextConfig {
    pub fn audio_only(sample_rate: u32, num_channels: u32) -> Self {
        Self {
            video: VideoConfig {
                enabled: false,
                ..Default::default()
            },
            audio: AudioConfig {
                sample_rate,
                num_channels,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pool_size == 0 {
            anyhow::bail!("pool_size must be at least 1");
        }
        if self.video.enabled {
            if self.video.width == 0 || self.video.height == 0 {
                anyhow::bail!(
                    "invalid video size {}x{}",
                    self.video.width,
                    self.video.height
                );
            }
            if self.video.target_framerate == 0 {
                anyhow::bail!("video target_framerate must be positive");
            }
        }
        if self.audio.enabled && (self.audio.sample_rate == 0 || self.audio.num_channels == 0) {
            anyhow::bail!(
                "invalid audio format {} Hz x {} channels",
                self.audio.sample_rate,
                self.audio.num_channels
            );
        }
        Ok(())
    }
}
