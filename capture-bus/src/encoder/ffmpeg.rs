//! Encoders backed by FFmpeg (libx264, libvpx, libvorbis, libopus, aac).

use bytes::Bytes;
use ffmpeg_next::{
    ChannelLayout, Dictionary, Rational, Rescale, codec,
    format::{Pixel, Sample, sample},
    picture,
};

use crate::{
    config::{AudioConfig, BitrateMode, VideoConfig},
    encoder::{AudioCodec, AudioEncoder, EncoderInfo, VideoCodec, VideoEncoder},
    frame::I420Image,
    packet::{EncodedPacket, HNSEC_PER_SEC, PacketBatch, to_hnsec},
};

const HNSEC_TIME_BASE: Rational = Rational(1, HNSEC_PER_SEC as i32);

enum EncoderType {
    Video(codec::encoder::Video),
    Audio(codec::encoder::Audio),
}

impl EncoderType {
    fn context(&self) -> &codec::Context {
        match self {
            EncoderType::Video(encoder) => encoder,
            EncoderType::Audio(encoder) => encoder,
        }
    }

    fn send_eof(&mut self) -> anyhow::Result<()> {
        match self {
            EncoderType::Video(encoder) => encoder.send_eof()?,
            EncoderType::Audio(encoder) => encoder.send_eof()?,
        }
        Ok(())
    }

    fn receive_packet(&mut self) -> anyhow::Result<Option<codec::packet::Packet>> {
        let mut packet = codec::packet::Packet::empty();
        let result = match self {
            EncoderType::Video(encoder) => encoder.receive_packet(&mut packet),
            EncoderType::Audio(encoder) => encoder.receive_packet(&mut packet),
        };
        match result {
            Ok(()) => Ok(Some(packet)),
            Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                Ok(None)
            }
            Err(ffmpeg_next::Error::Eof) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Moves every ready packet into `out`, rescaled to 100 ns ticks.
    fn drain(
        &mut self,
        out: &mut PacketBatch,
        time_base: Rational,
        default_duration: i64,
    ) -> anyhow::Result<bool> {
        let mut produced = false;
        while let Some(mut packet) = self.receive_packet()? {
            packet.rescale_ts(time_base, HNSEC_TIME_BASE);
            let Some(data) = packet.data() else {
                continue;
            };
            let duration = if packet.duration() > 0 {
                packet.duration()
            } else {
                default_duration
            };
            out.push(EncodedPacket::new(
                Bytes::copy_from_slice(data),
                packet.pts().unwrap_or(0),
                duration,
                packet.is_key(),
            ));
            produced = true;
        }
        Ok(produced)
    }

    fn codec_private(&self) -> Bytes {
        unsafe {
            let ctx = self.context().as_ptr();
            if (*ctx).extradata.is_null() || (*ctx).extradata_size <= 0 {
                return Bytes::new();
            }
            Bytes::copy_from_slice(std::slice::from_raw_parts(
                (*ctx).extradata,
                (*ctx).extradata_size as usize,
            ))
        }
    }

    fn time_base(&self) -> Rational {
        unsafe { (*self.context().as_ptr()).time_base.into() }
    }
}

unsafe impl Send for EncoderType {}

fn find_encoder(name: &str) -> anyhow::Result<ffmpeg_next::Codec> {
    ffmpeg_next::encoder::find_by_name(name).ok_or(anyhow::anyhow!("codec not found: {}", name))
}

pub struct FfmpegVideoEncoder {
    inner: EncoderType,
    info: EncoderInfo,
    time_base: Rational,
    frame_index: u64,
    keyframe_interval: u64,
    frame_duration: i64,
    frame: ffmpeg_next::frame::Video,
}

impl FfmpegVideoEncoder {
    pub fn new(config: &VideoConfig) -> anyhow::Result<Self> {
        let name = config
            .codec
            .ffmpeg_encoder_name()
            .ok_or(anyhow::anyhow!("{:?} is not an ffmpeg codec", config.codec))?;
        let context = codec::Context::new_with_codec(find_encoder(name)?);
        let mut encoder = context.encoder().video()?;
        encoder.set_width(config.width);
        encoder.set_height(config.height);
        encoder.set_format(Pixel::YUV420P);
        encoder.set_frame_rate(Some(Rational(config.target_framerate as i32, 1)));
        encoder.set_time_base(HNSEC_TIME_BASE);
        encoder.set_gop(config.keyframe_interval);
        encoder.set_flags(codec::Flags::GLOBAL_HEADER);
        encoder.set_bit_rate(config.target_bitrate as usize);
        if config.bitrate_mode == BitrateMode::Cbr {
            encoder.set_max_bit_rate(config.target_bitrate as usize);
        }

        let mut opts = Dictionary::new();
        match config.codec {
            VideoCodec::H264 => {
                opts.set("preset", "ultrafast");
                opts.set("tune", "zerolatency");
                if config.bitrate_mode == BitrateMode::Cbr {
                    opts.set("nal-hrd", "cbr");
                }
            }
            VideoCodec::Vp8 | VideoCodec::Vp9 => {
                opts.set("deadline", "realtime");
                opts.set("cpu-used", "8");
            }
            VideoCodec::Vp9Lossless => {
                opts.set("lossless", "1");
                opts.set("deadline", "realtime");
            }
            VideoCodec::RawI420 => {}
        }

        let encoder = encoder.open_with(opts)?;
        log::info!("video encoder opened: {} {}x{}", name, config.width, config.height);
        let inner = EncoderType::Video(encoder);
        let time_base = inner.time_base();
        let info = EncoderInfo {
            codec_id: config.codec.codec_id(),
            codec_private: inner.codec_private(),
        };

        Ok(Self {
            inner,
            info,
            time_base,
            frame_index: 0,
            keyframe_interval: config.keyframe_interval.max(1) as u64,
            frame_duration: to_hnsec(config.frame_duration()),
            frame: ffmpeg_next::frame::Video::new(Pixel::YUV420P, config.width, config.height),
        })
    }

    fn fill_frame(&mut self, image: &I420Image) {
        let planes: [(&[u8], usize, usize); 3] = [
            (image.y(), image.width() as usize, image.height() as usize),
            (image.u(), image.chroma_width(), image.chroma_height()),
            (image.v(), image.chroma_width(), image.chroma_height()),
        ];
        for (index, (plane, width, height)) in planes.into_iter().enumerate() {
            let stride = self.frame.stride(index);
            let dst = self.frame.data_mut(index);
            for row in 0..height {
                dst[row * stride..row * stride + width]
                    .copy_from_slice(&plane[row * width..(row + 1) * width]);
            }
        }
    }
}

impl VideoEncoder for FfmpegVideoEncoder {
    fn info(&self) -> &EncoderInfo {
        &self.info
    }

    fn encode(
        &mut self,
        out: &mut PacketBatch,
        image: &I420Image,
        timestamp: f64,
    ) -> anyhow::Result<bool> {
        self.fill_frame(image);
        let pts = to_hnsec(timestamp).rescale(HNSEC_TIME_BASE, self.time_base);
        self.frame.set_pts(Some(pts));
        if self.frame_index % self.keyframe_interval == 0 {
            self.frame.set_kind(picture::Type::I);
        } else {
            self.frame.set_kind(picture::Type::None);
        }
        self.frame_index += 1;

        if let EncoderType::Video(encoder) = &mut self.inner {
            encoder.send_frame(&self.frame)?;
        }
        self.inner.drain(out, self.time_base, self.frame_duration)
    }

    fn flush(&mut self, out: &mut PacketBatch) -> anyhow::Result<bool> {
        self.inner.send_eof()?;
        self.inner.drain(out, self.time_base, self.frame_duration)
    }
}

pub struct FfmpegAudioEncoder {
    inner: EncoderType,
    info: EncoderInfo,
    time_base: Rational,
    format: Sample,
    layout: ChannelLayout,
    sample_rate: u32,
    channels: usize,
    frame_samples: usize,
    pending: Vec<f32>,
    // first sample of the current run, in 1/sample_rate units
    anchor: Option<i64>,
    // samples per channel handed to the codec since the anchor
    sent: i64,
}

impl FfmpegAudioEncoder {
    pub fn new(config: &AudioConfig) -> anyhow::Result<Self> {
        let name = config
            .codec
            .ffmpeg_encoder_name()
            .ok_or(anyhow::anyhow!("{:?} is not an ffmpeg codec", config.codec))?;
        let format = match config.codec {
            AudioCodec::Opus => Sample::F32(sample::Type::Packed),
            _ => Sample::F32(sample::Type::Planar),
        };
        let layout = ChannelLayout::default(config.num_channels as i32);

        let context = codec::Context::new_with_codec(find_encoder(name)?);
        let mut encoder = context.encoder().audio()?;
        encoder.set_rate(config.sample_rate as i32);
        encoder.set_channel_layout(layout);
        encoder.set_format(format);
        encoder.set_time_base(Rational(1, config.sample_rate as i32));
        encoder.set_flags(codec::Flags::GLOBAL_HEADER);
        encoder.set_bit_rate(config.target_bitrate as usize);
        let mut opts = Dictionary::new();
        if config.codec == AudioCodec::Opus {
            let vbr = match config.bitrate_mode {
                BitrateMode::Cbr => "off",
                BitrateMode::Vbr => "on",
            };
            opts.set("vbr", vbr);
        }
        let encoder = encoder.open_with(opts)?;
        let frame_samples = match encoder.frame_size() {
            0 => 1024,
            n => n as usize,
        };
        log::info!(
            "audio encoder opened: {} {} Hz x {}, frame size {}",
            name,
            config.sample_rate,
            config.num_channels,
            frame_samples
        );

        let inner = EncoderType::Audio(encoder);
        let time_base = inner.time_base();
        let info = EncoderInfo {
            codec_id: config.codec.codec_id(),
            codec_private: inner.codec_private(),
        };
        Ok(Self {
            inner,
            info,
            time_base,
            format,
            layout,
            sample_rate: config.sample_rate,
            channels: config.num_channels.max(1) as usize,
            frame_samples,
            pending: Vec::new(),
            anchor: None,
            sent: 0,
        })
    }

    fn send_frame(&mut self, frames: usize) -> anyhow::Result<()> {
        let mut frame = ffmpeg_next::frame::Audio::new(self.format, frames, self.layout);
        frame.set_rate(self.sample_rate);
        let samples: Vec<f32> = self.pending.drain(..frames * self.channels).collect();
        if self.format.is_planar() {
            for ch in 0..self.channels {
                let plane = frame.plane_mut::<f32>(ch);
                for (i, value) in plane.iter_mut().enumerate().take(frames) {
                    *value = samples[i * self.channels + ch];
                }
            }
        } else {
            let data = frame.data_mut(0);
            for (i, value) in samples.iter().enumerate() {
                data[i * 4..i * 4 + 4].copy_from_slice(&value.to_ne_bytes());
            }
        }
        frame.set_pts(Some(self.anchor.unwrap_or(0) + self.sent));
        self.sent += frames as i64;

        if let EncoderType::Audio(encoder) = &mut self.inner {
            encoder.send_frame(&frame)?;
        }
        Ok(())
    }

    /// Re-anchors the sample clock when the caller's timestamp runs more
    /// than one codec frame ahead of it. Pending samples are padded with
    /// silence so the codec only ever sees full frames before the gap.
    fn sync(&mut self, timestamp: i64) -> anyhow::Result<()> {
        let at = (timestamp as i128 * self.sample_rate as i128 / HNSEC_PER_SEC as i128) as i64;
        let Some(anchor) = self.anchor else {
            self.anchor = Some(at);
            return Ok(());
        };
        let pending = (self.pending.len() / self.channels) as i64;
        let clock = anchor + self.sent + pending;
        if at - clock <= self.frame_samples as i64 {
            return Ok(());
        }
        if pending > 0 {
            self.pending.resize(self.frame_samples * self.channels, 0.0);
            self.send_frame(self.frame_samples)?;
        }
        log::debug!("audio clock re-anchored from sample {} to {}", clock, at);
        self.anchor = Some(at);
        self.sent = 0;
        Ok(())
    }

    fn frame_duration(&self) -> i64 {
        self.frame_samples as i64 * HNSEC_PER_SEC / self.sample_rate.max(1) as i64
    }
}

impl AudioEncoder for FfmpegAudioEncoder {
    fn info(&self) -> &EncoderInfo {
        &self.info
    }

    fn encode(
        &mut self,
        out: &mut PacketBatch,
        samples: &[f32],
        timestamp: f64,
    ) -> anyhow::Result<bool> {
        self.sync(to_hnsec(timestamp.max(0.0)))?;
        self.pending.extend_from_slice(samples);
        while self.pending.len() >= self.frame_samples * self.channels {
            self.send_frame(self.frame_samples)?;
        }
        self.inner.drain(out, self.time_base, self.frame_duration())
    }

    fn flush(&mut self, out: &mut PacketBatch) -> anyhow::Result<bool> {
        let tail = self.pending.len() / self.channels;
        if tail > 0 {
            self.send_frame(tail)?;
        }
        self.inner.send_eof()?;
        self.inner.drain(out, self.time_base, self.frame_duration())
    }
}
