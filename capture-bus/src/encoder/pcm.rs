use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    config::AudioConfig,
    encoder::{AudioEncoder, EncoderInfo},
    packet::{EncodedPacket, HNSEC_PER_SEC, PacketBatch, to_hnsec},
};

/// Samples per channel in one emitted packet.
pub const PCM_FRAME_SAMPLES: usize = 1024;

/// 16-bit little-endian PCM in fixed-size packets.
///
/// Input that does not fill a packet is held until more arrives or until
/// `flush`, which emits the short tail. Timestamps advance by sample count
/// from the last anchor. A block whose timestamp runs ahead of that clock by
/// more than one packet closes the pending packet and becomes the new anchor,
/// so gaps in capture stay gaps in the output.
pub struct PcmEncoder {
    info: EncoderInfo,
    sample_rate: u32,
    channels: usize,
    pending: Vec<i16>,
    anchor: Option<i64>,
    emitted: u64,
}

impl PcmEncoder {
    pub fn new(config: &AudioConfig) -> Self {
        log::debug!(
            "pcm encoder: {} Hz x {}, bitrate settings ({:?} {} bps) ignored",
            config.sample_rate,
            config.num_channels,
            config.bitrate_mode,
            config.target_bitrate
        );
        Self {
            info: EncoderInfo {
                codec_id: config.codec.codec_id(),
                codec_private: Bytes::new(),
            },
            sample_rate: config.sample_rate.max(1),
            channels: config.num_channels.max(1) as usize,
            pending: Vec::with_capacity(PCM_FRAME_SAMPLES * config.num_channels.max(1) as usize),
            anchor: None,
            emitted: 0,
        }
    }

    fn packet_ticks(&self) -> i64 {
        PCM_FRAME_SAMPLES as i64 * HNSEC_PER_SEC / self.sample_rate as i64
    }

    /// Places the block starting at `timestamp` on the sample clock.
    fn sync(&mut self, out: &mut PacketBatch, timestamp: i64) -> bool {
        if self.anchor.is_none() {
            self.anchor = Some(timestamp);
            return false;
        }
        let pending = (self.pending.len() / self.channels) as u64;
        let clock = self.ticks_at(self.emitted + pending);
        if timestamp - clock <= self.packet_ticks() {
            return false;
        }
        let produced = pending > 0;
        if produced {
            self.emit(out, pending as usize);
        }
        log::debug!("pcm clock re-anchored from {} to {} after a gap", clock, timestamp);
        self.anchor = Some(timestamp);
        self.emitted = 0;
        produced
    }

    fn ticks_at(&self, sample: u64) -> i64 {
        let offset = sample as i128 * HNSEC_PER_SEC as i128 / self.sample_rate as i128;
        self.anchor.unwrap_or(0) + offset as i64
    }

    fn emit(&mut self, out: &mut PacketBatch, frames: usize) {
        let count = frames * self.channels;
        let mut data = BytesMut::with_capacity(count * 2);
        for sample in self.pending.drain(..count) {
            data.put_i16_le(sample);
        }
        let start = self.ticks_at(self.emitted);
        let end = self.ticks_at(self.emitted + frames as u64);
        self.emitted += frames as u64;
        out.push(EncodedPacket::new(data.freeze(), start, end - start, true));
    }
}

impl AudioEncoder for PcmEncoder {
    fn info(&self) -> &EncoderInfo {
        &self.info
    }

    fn encode(
        &mut self,
        out: &mut PacketBatch,
        samples: &[f32],
        timestamp: f64,
    ) -> anyhow::Result<bool> {
        if samples.len() % self.channels != 0 {
            anyhow::bail!(
                "{} samples is not a whole number of {}-channel frames",
                samples.len(),
                self.channels
            );
        }
        let mut produced = self.sync(out, to_hnsec(timestamp.max(0.0)));
        self.pending.extend(
            samples
                .iter()
                .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16),
        );

        while self.pending.len() >= PCM_FRAME_SAMPLES * self.channels {
            self.emit(out, PCM_FRAME_SAMPLES);
            produced = true;
        }
        Ok(produced)
    }

    fn flush(&mut self, out: &mut PacketBatch) -> anyhow::Result<bool> {
        if self.pending.is_empty() {
            return Ok(false);
        }
        let frames = self.pending.len() / self.channels;
        self.emit(out, frames);
        Ok(true)
    }
}
