use std::{path::PathBuf, time::Duration};

use anyhow::Context as _;
use capture_bus::{
    AudioCodec, AudioConfig, BitrateMode, ContainerFormat, ContextConfig, VideoCodec, VideoConfig,
};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BitrateModeName {
    Cbr,
    #[default]
    Vbr,
}

impl From<BitrateModeName> for BitrateMode {
    fn from(mode: BitrateModeName) -> Self {
        match mode {
            BitrateModeName::Cbr => BitrateMode::Cbr,
            BitrateModeName::Vbr => BitrateMode::Vbr,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum VideoCodecName {
    H264,
    Vp8,
    Vp9,
    Vp9Lossless,
    #[default]
    RawI420,
}

impl From<VideoCodecName> for VideoCodec {
    fn from(codec: VideoCodecName) -> Self {
        match codec {
            VideoCodecName::H264 => VideoCodec::H264,
            VideoCodecName::Vp8 => VideoCodec::Vp8,
            VideoCodecName::Vp9 => VideoCodec::Vp9,
            VideoCodecName::Vp9Lossless => VideoCodec::Vp9Lossless,
            VideoCodecName::RawI420 => VideoCodec::RawI420,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AudioCodecName {
    Vorbis,
    Opus,
    Aac,
    #[default]
    PcmS16,
}

impl From<AudioCodecName> for AudioCodec {
    fn from(codec: AudioCodecName) -> Self {
        match codec {
            AudioCodecName::Vorbis => AudioCodec::Vorbis,
            AudioCodecName::Opus => AudioCodec::Opus,
            AudioCodecName::Aac => AudioCodec::Aac,
            AudioCodecName::PcmS16 => AudioCodec::PcmS16,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContainerName {
    #[default]
    Framed,
    Webm,
    Mp4,
}

impl From<ContainerName> for ContainerFormat {
    fn from(container: ContainerName) -> Self {
        match container {
            ContainerName::Framed => ContainerFormat::Framed,
            ContainerName::Webm => ContainerFormat::WebM,
            ContainerName::Mp4 => ContainerFormat::Mp4,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct VideoSection {
    pub enabled: bool,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub bitrate_mode: BitrateModeName,
    // bps
    pub bitrate: u32,
    pub codec: VideoCodecName,
    pub keyframe_interval: u32,
}

impl Default for VideoSection {
    fn default() -> Self {
        let core = VideoConfig::default();
        Self {
            enabled: core.enabled,
            width: core.width,
            height: core.height,
            framerate: core.target_framerate,
            bitrate_mode: BitrateModeName::default(),
            bitrate: core.target_bitrate,
            codec: VideoCodecName::default(),
            keyframe_interval: core.keyframe_interval,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AudioSection {
    pub enabled: bool,
    pub sample_rate: u32,
    pub channels: u32,
    pub bitrate_mode: BitrateModeName,
    // bps
    pub bitrate: u32,
    pub codec: AudioCodecName,
}

impl Default for AudioSection {
    fn default() -> Self {
        let core = AudioConfig::default();
        Self {
            enabled: core.enabled,
            sample_rate: core.sample_rate,
            channels: core.num_channels,
            bitrate_mode: BitrateModeName::default(),
            bitrate: core.target_bitrate,
            codec: AudioCodecName::default(),
        }
    }
}

/// Recording session settings as stored on disk. Every field is optional in
/// the JSON document.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RecorderConfig {
    pub video: VideoSection,
    pub audio: AudioSection,
    pub container: ContainerName,
    pub output: PathBuf,
    /// Extra files receiving the same stream. Framed container only.
    pub mirror_outputs: Vec<PathBuf>,
    pub pool_size: usize,
    pub acquire_timeout_ms: Option<u64>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            video: VideoSection::default(),
            audio: AudioSection::default(),
            container: ContainerName::default(),
            output: PathBuf::from("capture.fcap"),
            mirror_outputs: Vec::new(),
            pool_size: ContextConfig::default().pool_size,
            acquire_timeout_ms: None,
        }
    }
}

impl RecorderConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("parse recorder config")
    }

    pub fn from_file(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("in {}", path.display()))
    }

    pub fn to_context_config(&self) -> ContextConfig {
        ContextConfig {
            video: VideoConfig {
                enabled: self.video.enabled,
                width: self.video.width,
                height: self.video.height,
                target_framerate: self.video.framerate,
                bitrate_mode: self.video.bitrate_mode.into(),
                target_bitrate: self.video.bitrate,
                codec: self.video.codec.into(),
                keyframe_interval: self.video.keyframe_interval,
            },
            audio: AudioConfig {
                enabled: self.audio.enabled,
                sample_rate: self.audio.sample_rate,
                num_channels: self.audio.channels,
                bitrate_mode: self.audio.bitrate_mode.into(),
                target_bitrate: self.audio.bitrate,
                codec: self.audio.codec.into(),
            },
            container: self.container.into(),
            pool_size: self.pool_size,
            acquire_timeout: self.acquire_timeout_ms.map(Duration::from_millis),
        }
    }
}
