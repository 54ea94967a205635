use bytes::Bytes;

use crate::{
    config::VideoConfig,
    encoder::{EncoderInfo, VideoEncoder},
    frame::I420Image,
    packet::{EncodedPacket, PacketBatch, to_hnsec},
};

/// Stores every frame as an uncompressed I420 keyframe.
pub struct RawVideoEncoder {
    info: EncoderInfo,
    width: u32,
    height: u32,
    frame_duration: i64,
}

impl RawVideoEncoder {
    pub fn new(config: &VideoConfig) -> Self {
        Self {
            info: EncoderInfo {
                codec_id: config.codec.codec_id(),
                codec_private: Bytes::from_static(b"I420"),
            },
            width: config.width,
            height: config.height,
            frame_duration: to_hnsec(config.frame_duration()),
        }
    }
}

impl VideoEncoder for RawVideoEncoder {
    fn info(&self) -> &EncoderInfo {
        &self.info
    }

    fn encode(
        &mut self,
        out: &mut PacketBatch,
        image: &I420Image,
        timestamp: f64,
    ) -> anyhow::Result<bool> {
        if image.width() != self.width || image.height() != self.height {
            anyhow::bail!(
                "frame is {}x{}, encoder configured for {}x{}",
                image.width(),
                image.height(),
                self.width,
                self.height
            );
        }
        out.push(EncodedPacket::new(
            Bytes::copy_from_slice(image.data()),
            to_hnsec(timestamp),
            self.frame_duration,
            true,
        ));
        Ok(true)
    }

    fn flush(&mut self, _out: &mut PacketBatch) -> anyhow::Result<bool> {
        Ok(false)
    }
}
