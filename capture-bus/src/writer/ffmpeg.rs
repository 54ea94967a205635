use std::{
    path::Path,
    sync::{Mutex, MutexGuard, PoisonError},
};

use ffmpeg_next::{Rational, codec, ffi, media};

use crate::{
    encoder::{AudioCodec, VideoCodec},
    packet::{EncodedPacket, HNSEC_PER_SEC, TrackKind},
    writer::{AudioTrackInfo, ContainerFormat, VideoTrackInfo, Writer},
};

const HNSEC_TIME_BASE: Rational = Rational(1, HNSEC_PER_SEC as i32);
// FF_COMPLIANCE_NORMAL
const COMPLIANCE_NORMAL: i32 = 0;

fn video_codec_id(codec: VideoCodec) -> codec::Id {
    match codec {
        VideoCodec::H264 => codec::Id::H264,
        VideoCodec::Vp8 => codec::Id::VP8,
        VideoCodec::Vp9 | VideoCodec::Vp9Lossless => codec::Id::VP9,
        VideoCodec::RawI420 => codec::Id::RAWVIDEO,
    }
}

fn audio_codec_id(codec: AudioCodec) -> codec::Id {
    match codec {
        AudioCodec::Vorbis => codec::Id::VORBIS,
        AudioCodec::Opus => codec::Id::OPUS,
        AudioCodec::Aac => codec::Id::AAC,
        AudioCodec::PcmS16 => codec::Id::PCM_S16LE,
    }
}

fn set_extradata(params: &mut codec::Parameters, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    unsafe {
        let par = params.as_mut_ptr();
        let size = data.len() + ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize;
        let buf = ffi::av_mallocz(size) as *mut u8;
        if buf.is_null() {
            return;
        }
        std::ptr::copy_nonoverlapping(data.as_ptr(), buf, data.len());
        (*par).extradata = buf;
        (*par).extradata_size = data.len() as i32;
    }
}

fn video_parameters(track: &VideoTrackInfo) -> codec::Parameters {
    let mut params = codec::Parameters::new();
    unsafe {
        let par = params.as_mut_ptr();
        (*par).codec_type = media::Type::Video.into();
        (*par).codec_id = video_codec_id(track.codec).into();
        (*par).width = track.width as i32;
        (*par).height = track.height as i32;
        (*par).format = ffi::AVPixelFormat::AV_PIX_FMT_YUV420P as i32;
    }
    set_extradata(&mut params, &track.codec_private);
    params
}

fn audio_parameters(track: &AudioTrackInfo) -> codec::Parameters {
    let mut params = codec::Parameters::new();
    unsafe {
        let par = params.as_mut_ptr();
        (*par).codec_type = media::Type::Audio.into();
        (*par).codec_id = audio_codec_id(track.codec).into();
        (*par).sample_rate = track.sample_rate as i32;
        ffi::av_channel_layout_default(&mut (*par).ch_layout, track.num_channels as i32);
    }
    set_extradata(&mut params, &track.codec_private);
    params
}

struct MuxState {
    inner: ffmpeg_next::format::context::Output,
    video: Option<usize>,
    audio: Option<usize>,
    have_written_header: bool,
    have_written_trailer: bool,
}

impl MuxState {
    fn write_packet(&mut self, stream_index: usize, packet: &EncodedPacket) -> anyhow::Result<()> {
        if !self.have_written_header {
            self.inner.write_header()?;
            self.have_written_header = true;
        }
        let out_time_base = self
            .inner
            .stream(stream_index)
            .ok_or(anyhow::anyhow!("stream {} not found", stream_index))?
            .time_base();

        let mut p = codec::packet::Packet::copy(&packet.data);
        p.set_stream(stream_index);
        p.set_pts(Some(packet.timestamp));
        p.set_dts(Some(packet.timestamp));
        p.set_duration(packet.duration);
        p.set_position(-1);
        if packet.is_key {
            p.set_flags(codec::packet::Flags::KEY);
        }
        p.rescale_ts(HNSEC_TIME_BASE, out_time_base);
        p.write_interleaved(&mut self.inner)?;
        Ok(())
    }

    /// Fails unless the muxer can store `id`, so a bad pairing is refused at
    /// attach time instead of at the first packet.
    fn check_codec(&self, id: codec::Id) -> anyhow::Result<()> {
        let supported = unsafe {
            ffi::avformat_query_codec((*self.inner.as_ptr()).oformat, id.into(), COMPLIANCE_NORMAL)
        };
        if supported != 1 {
            anyhow::bail!("{} container cannot store {:?}", self.inner.format().name(), id);
        }
        Ok(())
    }

    fn add_stream(&mut self, params: codec::Parameters) -> anyhow::Result<usize> {
        if self.have_written_header {
            anyhow::bail!("cannot add a stream after the header is written");
        }
        self.check_codec(params.id())?;
        let mut stream = self.inner.add_stream(ffmpeg_next::encoder::find(params.id()))?;
        stream.set_parameters(params);
        stream.set_time_base(HNSEC_TIME_BASE);
        Ok(stream.index())
    }
}

/// WebM or MP4 file writer backed by libavformat.
pub struct FfmpegWriter {
    state: Mutex<MuxState>,
}

// The output context is only touched behind the mutex.
unsafe impl Send for FfmpegWriter {}
unsafe impl Sync for FfmpegWriter {}

impl FfmpegWriter {
    pub fn new(path: &Path, format: ContainerFormat) -> anyhow::Result<Self> {
        let name = match format {
            ContainerFormat::WebM => "webm",
            ContainerFormat::Mp4 => "mp4",
            ContainerFormat::Framed => anyhow::bail!("framed output is not muxed by ffmpeg"),
        };
        let inner = ffmpeg_next::format::output_as(path, name)
            .map_err(|e| anyhow::anyhow!("open {} output {}: {}", name, path.display(), e))?;
        Ok(Self {
            state: Mutex::new(MuxState {
                inner,
                video: None,
                audio: None,
                have_written_header: false,
                have_written_trailer: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MuxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add_packet_inner(&self, kind: TrackKind, packet: &EncodedPacket) -> anyhow::Result<()> {
        if packet.data.is_empty() {
            return Ok(());
        }
        let mut state = self.lock();
        if state.have_written_trailer {
            anyhow::bail!("writer already finalized");
        }
        let index = match kind {
            TrackKind::Video => state.video,
            TrackKind::Audio => state.audio,
        };
        match index {
            Some(index) => state.write_packet(index, packet),
            None => Ok(()),
        }
    }
}

impl Writer for FfmpegWriter {
    fn attach_video_track(&self, track: &VideoTrackInfo) -> anyhow::Result<()> {
        let mut state = self.lock();
        if state.video.is_some() {
            anyhow::bail!("video track already attached");
        }
        let index = state.add_stream(video_parameters(track))?;
        state.video = Some(index);
        Ok(())
    }

    fn attach_audio_track(&self, track: &AudioTrackInfo) -> anyhow::Result<()> {
        let mut state = self.lock();
        if state.audio.is_some() {
            anyhow::bail!("audio track already attached");
        }
        let index = state.add_stream(audio_parameters(track))?;
        state.audio = Some(index);
        Ok(())
    }

    fn add_video_packet(&self, packet: &EncodedPacket) -> anyhow::Result<()> {
        self.add_packet_inner(TrackKind::Video, packet)
    }

    fn add_audio_packet(&self, packet: &EncodedPacket) -> anyhow::Result<()> {
        self.add_packet_inner(TrackKind::Audio, packet)
    }

    fn finalize(&self) -> anyhow::Result<()> {
        let mut state = self.lock();
        if state.have_written_trailer {
            return Ok(());
        }
        state.have_written_trailer = true;
        // a file with no packets still gets a valid header
        if !state.have_written_header {
            state.inner.write_header()?;
            state.have_written_header = true;
        }
        state.inner.write_trailer()?;
        Ok(())
    }
}
