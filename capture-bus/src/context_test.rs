use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use super::*;
use crate::{
    config::{AudioConfig, VideoConfig},
    encoder::{EncoderInfo, pcm::PCM_FRAME_SAMPLES},
    frame::I420Image,
    packet::{EncodedPacket, HNSEC_PER_SEC, to_hnsec},
    sink::MemorySink,
    writer::framed::{AUDIO_TRACK_NUMBER, VIDEO_TRACK_NUMBER, read_framed},
};

const WIDTH: u32 = 16;
const HEIGHT: u32 = 16;

fn small_config() -> ContextConfig {
    ContextConfig {
        video: VideoConfig {
            width: WIDTH,
            height: HEIGHT,
            ..Default::default()
        },
        audio: AudioConfig {
            sample_rate: 48_000,
            num_channels: 1,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn rgba_frame(shade: u8) -> Vec<u8> {
    vec![shade; PixelFormat::Rgba8.frame_size(WIDTH, HEIGHT)]
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Packet(TrackKind, i64),
    Finalize,
}

#[derive(Default)]
struct RecordingWriter {
    events: Mutex<Vec<Event>>,
}

impl RecordingWriter {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn timestamps(&self, kind: TrackKind) -> Vec<i64> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Packet(k, ts) if k == kind => Some(ts),
                _ => None,
            })
            .collect()
    }
}

impl Writer for RecordingWriter {
    fn attach_video_track(&self, _track: &VideoTrackInfo) -> anyhow::Result<()> {
        Ok(())
    }

    fn attach_audio_track(&self, _track: &AudioTrackInfo) -> anyhow::Result<()> {
        Ok(())
    }

    fn add_video_packet(&self, packet: &EncodedPacket) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(Event::Packet(TrackKind::Video, packet.timestamp));
        Ok(())
    }

    fn add_audio_packet(&self, packet: &EncodedPacket) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(Event::Packet(TrackKind::Audio, packet.timestamp));
        Ok(())
    }

    fn finalize(&self) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(Event::Finalize);
        Ok(())
    }
}

struct SlowVideoEncoder {
    info: EncoderInfo,
    delay: Duration,
}

impl VideoEncoder for SlowVideoEncoder {
    fn info(&self) -> &EncoderInfo {
        &self.info
    }

    fn encode(
        &mut self,
        out: &mut PacketBatch,
        _image: &I420Image,
        timestamp: f64,
    ) -> anyhow::Result<bool> {
        thread::sleep(self.delay);
        out.push(EncodedPacket::new(vec![0u8; 4], to_hnsec(timestamp), 1, true));
        Ok(true)
    }

    fn flush(&mut self, _out: &mut PacketBatch) -> anyhow::Result<bool> {
        Ok(false)
    }
}

struct FailingVideoEncoder {
    info: EncoderInfo,
    calls: Arc<AtomicUsize>,
}

impl VideoEncoder for FailingVideoEncoder {
    fn info(&self) -> &EncoderInfo {
        &self.info
    }

    fn encode(
        &mut self,
        _out: &mut PacketBatch,
        _image: &I420Image,
        _timestamp: f64,
    ) -> anyhow::Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("encoder rejected frame")
    }

    fn flush(&mut self, _out: &mut PacketBatch) -> anyhow::Result<bool> {
        anyhow::bail!("encoder rejected flush")
    }
}

fn fake_encoder_info() -> EncoderInfo {
    EncoderInfo {
        codec_id: "V_TEST",
        codec_private: bytes::Bytes::new(),
    }
}

/// Video encoder construction fails, or is replaced by a slow or failing
/// one; audio always comes from the default factory.
enum TestFactory {
    NoVideo,
    SlowVideo(Duration),
    FailingVideo(Arc<AtomicUsize>),
}

impl EncoderFactory for TestFactory {
    fn video(&self, _config: &VideoConfig) -> anyhow::Result<Box<dyn VideoEncoder>> {
        match self {
            TestFactory::NoVideo => anyhow::bail!("video backend unavailable"),
            TestFactory::SlowVideo(delay) => Ok(Box::new(SlowVideoEncoder {
                info: fake_encoder_info(),
                delay: *delay,
            })),
            TestFactory::FailingVideo(calls) => Ok(Box::new(FailingVideoEncoder {
                info: fake_encoder_info(),
                calls: calls.clone(),
            })),
        }
    }

    fn audio(&self, config: &AudioConfig) -> anyhow::Result<Box<dyn AudioEncoder>> {
        DefaultEncoderFactory.audio(config)
    }
}

#[test]
fn test_buffers_are_conserved() -> anyhow::Result<()> {
    let mut context = Context::new(small_config(), None, MemorySink::new().into())?;
    let frame = rgba_frame(128);
    let block = vec![0.25f32; 800];
    for i in 0..40 {
        let ts = i as f64 / 30.0;
        assert!(context.add_video_frame_from_pixels(&frame, PixelFormat::Rgba8, ts));
        assert!(context.add_audio_frame(&block, ts));
    }
    context.release();

    let video = context.video_pool_stats().expect("video pool");
    let audio = context.audio_pool_stats().expect("audio pool");
    assert_eq!(video.available, video.capacity);
    assert_eq!(video.in_use, 0);
    assert_eq!(video.acquisitions, 40);
    assert_eq!(audio.available, audio.capacity);
    assert_eq!(audio.acquisitions, 40);
    Ok(())
}

#[test]
fn test_buffers_are_conserved_when_encoding_fails() -> anyhow::Result<()> {
    let config = ContextConfig {
        pool_size: 4,
        ..small_config()
    };
    let calls = Arc::new(AtomicUsize::new(0));
    let factory = TestFactory::FailingVideo(calls.clone());
    let mut context = Context::with_factory(config, &factory, None, MemorySink::new().into())?;
    let recorder = Arc::new(RecordingWriter::default());
    context.attach_writer(recorder.clone())?;

    let frame = rgba_frame(0);
    let block = vec![0.0f32; 1024];
    for i in 0..10 {
        let ts = i as f64 / 30.0;
        assert!(context.add_video_frame_from_pixels(&frame, PixelFormat::Rgba8, ts));
        assert!(context.add_audio_frame(&block, ts));
    }
    context.release();

    // every frame reached the encoder despite the earlier failures
    assert_eq!(calls.load(Ordering::SeqCst), 10);
    let video = context.video_pool_stats().expect("video pool");
    assert_eq!(video.capacity, 4);
    assert_eq!(video.available, video.capacity);
    assert_eq!(video.in_use, 0);
    assert_eq!(video.acquisitions, 10);

    // the audio track is unaffected
    assert!(recorder.timestamps(TrackKind::Video).is_empty());
    assert!(!recorder.timestamps(TrackKind::Audio).is_empty());
    assert_eq!(recorder.events().last(), Some(&Event::Finalize));
    Ok(())
}

#[test]
fn test_audio_gap_keeps_caller_timestamps() -> anyhow::Result<()> {
    let mut context = Context::new(ContextConfig::audio_only(1024, 1), None, MemorySink::new().into())?;
    let recorder = Arc::new(RecordingWriter::default());
    context.attach_writer(recorder.clone())?;

    let block = vec![0.1f32; PCM_FRAME_SAMPLES];
    assert!(context.add_audio_frame(&block, 0.0));
    assert!(context.add_audio_frame(&block, 5.0));
    assert!(context.add_audio_frame(&block, 6.0));
    context.release();

    assert_eq!(
        recorder.timestamps(TrackKind::Audio),
        vec![0, 5 * HNSEC_PER_SEC, 6 * HNSEC_PER_SEC]
    );
    Ok(())
}

#[test]
fn test_packets_keep_submission_order() -> anyhow::Result<()> {
    let mut context = Context::new(small_config(), None, MemorySink::new().into())?;
    let recorder = Arc::new(RecordingWriter::default());
    context.attach_writer(recorder.clone())?;

    let frame = rgba_frame(10);
    let block = vec![0.0f32; 1600];
    for i in 0..60 {
        let ts = i as f64 / 30.0;
        assert!(context.add_video_frame_from_pixels(&frame, PixelFormat::Rgba8, ts));
        assert!(context.add_audio_frame(&block, ts));
    }
    context.release();

    let video = recorder.timestamps(TrackKind::Video);
    assert_eq!(video.len(), 60);
    let expected: Vec<i64> = (0..60).map(|i| to_hnsec(i as f64 / 30.0)).collect();
    assert_eq!(video, expected);

    let audio = recorder.timestamps(TrackKind::Audio);
    assert!(!audio.is_empty());
    assert!(audio.windows(2).all(|w| w[0] <= w[1]));
    Ok(())
}

#[test]
fn test_full_pool_blocks_producer() -> anyhow::Result<()> {
    let config = ContextConfig {
        pool_size: 2,
        ..small_config()
    };
    let factory = TestFactory::SlowVideo(Duration::from_millis(20));
    let mut context = Context::with_factory(config, &factory, None, MemorySink::new().into())?;
    let recorder = Arc::new(RecordingWriter::default());
    context.attach_writer(recorder.clone())?;

    let frame = rgba_frame(0);
    for i in 0..6 {
        assert!(context.add_video_frame_from_pixels(&frame, PixelFormat::Rgba8, i as f64));
    }
    let stats = context.video_pool_stats().expect("video pool");
    assert!(stats.waits > 0);
    assert!(stats.in_use <= 2);

    context.release();
    assert_eq!(recorder.timestamps(TrackKind::Video).len(), 6);
    Ok(())
}

#[test]
fn test_acquire_timeout_drops_frame() -> anyhow::Result<()> {
    let config = ContextConfig {
        pool_size: 1,
        acquire_timeout: Some(Duration::from_millis(1)),
        ..small_config()
    };
    let factory = TestFactory::SlowVideo(Duration::from_millis(200));
    let mut context = Context::with_factory(config, &factory, None, MemorySink::new().into())?;

    let frame = rgba_frame(0);
    assert!(context.add_video_frame_from_pixels(&frame, PixelFormat::Rgba8, 0.0));
    assert!(!context.add_video_frame_from_pixels(&frame, PixelFormat::Rgba8, 0.1));
    context.release();
    Ok(())
}

#[test]
fn test_unavailable_video_degrades_to_audio_only() -> anyhow::Result<()> {
    let sink = MemorySink::new();
    let mut context = Context::with_factory(small_config(), &TestFactory::NoVideo, None, sink.clone().into())?;
    assert!(!context.is_video_enabled());
    assert!(context.is_audio_enabled());
    assert!(context.video_pool_stats().is_none());

    let frame = rgba_frame(0);
    let block = vec![0.0f32; 480];
    for i in 0..10 {
        let ts = i as f64 * 0.01;
        assert!(!context.add_video_frame_from_pixels(&frame, PixelFormat::Rgba8, ts));
        assert!(context.add_audio_frame(&block, ts));
    }
    context.release();

    let file = read_framed(&sink.contents())?;
    assert_eq!(file.tracks.len(), 1);
    assert!(file.track(TrackKind::Audio).is_some());
    Ok(())
}

#[test]
fn test_no_usable_kind_fails_construction() {
    let config = ContextConfig {
        audio: AudioConfig {
            enabled: false,
            ..Default::default()
        },
        ..small_config()
    };
    let result = Context::with_factory(config, &TestFactory::NoVideo, None, MemorySink::new().into());
    assert!(result.is_err());
}

#[test]
fn test_release_drains_before_finalize() -> anyhow::Result<()> {
    let factory = TestFactory::SlowVideo(Duration::from_millis(5));
    let mut context = Context::with_factory(small_config(), &factory, None, MemorySink::new().into())?;
    let recorder = Arc::new(RecordingWriter::default());
    context.attach_writer(recorder.clone())?;

    let frame = rgba_frame(0);
    for i in 0..4 {
        assert!(context.add_video_frame_from_pixels(&frame, PixelFormat::Rgba8, i as f64));
    }
    context.release();
    assert_eq!(context.state(), ContextState::Closed);

    let events = recorder.events();
    assert_eq!(events.len(), 5);
    assert_eq!(events.last(), Some(&Event::Finalize));

    // inert after release
    assert!(!context.add_video_frame_from_pixels(&frame, PixelFormat::Rgba8, 5.0));
    assert!(!context.add_audio_frame(&[0.0; 16], 5.0));
    assert!(context.attach_output_sink(MemorySink::new().boxed()).is_err());
    context.release();
    assert_eq!(context.state(), ContextState::Closed);
    assert_eq!(recorder.events().len(), 5);
    Ok(())
}

#[test]
fn test_drop_finalizes_output() -> anyhow::Result<()> {
    let sink = MemorySink::new();
    {
        let context = Context::new(ContextConfig::audio_only(48_000, 2), None, sink.clone().into())?;
        assert!(context.add_audio_frame(&vec![0.5f32; 4096], 0.0));
    }
    let file = read_framed(&sink.contents())?;
    assert!(file.finalized);
    assert_eq!(file.packets.len(), 2);
    Ok(())
}

#[test]
fn test_ten_seconds_of_mono_silence() -> anyhow::Result<()> {
    let sink = MemorySink::new();
    let mut context = Context::new(ContextConfig::audio_only(48_000, 1), None, sink.clone().into())?;
    assert!(!context.is_video_enabled());

    let second = vec![0.0f32; 48_000];
    for i in 0..10 {
        assert!(context.add_audio_frame(&second, i as f64));
    }
    context.release();

    let file = read_framed(&sink.contents())?;
    assert!(file.finalized);
    assert_eq!(file.tracks.len(), 1);
    let track = file.track(TrackKind::Audio).expect("audio track");
    assert_eq!(track.number, AUDIO_TRACK_NUMBER);
    assert_eq!(track.params, [48_000, 1, 0]);

    let packets: Vec<_> = file.packets_for(AUDIO_TRACK_NUMBER).collect();
    assert_eq!(packets.len(), (480_000usize).div_ceil(PCM_FRAME_SAMPLES));
    let first = packets.first().expect("first packet");
    let last = packets.last().expect("last packet");
    assert_eq!(first.timestamp, 0);

    let ten_seconds = 10 * HNSEC_PER_SEC;
    let packet_duration = PCM_FRAME_SAMPLES as i64 * HNSEC_PER_SEC / 48_000;
    let end = last.timestamp + last.duration;
    assert!(end >= ten_seconds);
    assert!(end <= ten_seconds + packet_duration);

    assert_eq!(file.index.len(), 1);
    assert_eq!(file.index[0].packets, packets.len() as u64);
    assert_eq!(file.index[0].end, end);
    Ok(())
}

/// Fails the test if a packet reaches it before the matching `add_*` call
/// has started.
struct CausalWriter {
    video_started: Arc<AtomicUsize>,
    audio_started: Arc<AtomicUsize>,
    video_seen: AtomicUsize,
    violation: AtomicBool,
}

impl Writer for CausalWriter {
    fn attach_video_track(&self, _track: &VideoTrackInfo) -> anyhow::Result<()> {
        Ok(())
    }

    fn attach_audio_track(&self, _track: &AudioTrackInfo) -> anyhow::Result<()> {
        Ok(())
    }

    fn add_video_packet(&self, _packet: &EncodedPacket) -> anyhow::Result<()> {
        let seen = self.video_seen.fetch_add(1, Ordering::SeqCst) + 1;
        if seen > self.video_started.load(Ordering::SeqCst) {
            self.violation.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn add_audio_packet(&self, packet: &EncodedPacket) -> anyhow::Result<()> {
        // each audio call carries 1/30 s of samples
        let started = self.audio_started.load(Ordering::SeqCst) as i64;
        if packet.end() > started * HNSEC_PER_SEC / 30 + 1 {
            self.violation.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn finalize(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[test]
fn test_packets_never_precede_their_submission() -> anyhow::Result<()> {
    let mut context = Context::new(small_config(), None, MemorySink::new().into())?;
    let video_started = Arc::new(AtomicUsize::new(0));
    let audio_started = Arc::new(AtomicUsize::new(0));
    let hook = Arc::new(CausalWriter {
        video_started: video_started.clone(),
        audio_started: audio_started.clone(),
        video_seen: AtomicUsize::new(0),
        violation: AtomicBool::new(false),
    });
    context.attach_writer(hook.clone())?;

    let frame = rgba_frame(200);
    let block = vec![0.1f32; 1600];
    for i in 0..30 {
        let ts = i as f64 / 30.0;
        video_started.fetch_add(1, Ordering::SeqCst);
        assert!(context.add_video_frame_from_pixels(&frame, PixelFormat::Rgba8, ts));
        audio_started.fetch_add(1, Ordering::SeqCst);
        assert!(context.add_audio_frame(&block, ts));
    }
    context.release();

    assert!(!hook.violation.load(Ordering::SeqCst));
    assert_eq!(hook.video_seen.load(Ordering::SeqCst), 30);
    Ok(())
}

struct FakeTextureReader;

impl TextureReader for FakeTextureReader {
    fn read_texture(
        &self,
        dst: &mut [u8],
        texture: TextureHandle,
        _width: u32,
        _height: u32,
        _format: PixelFormat,
    ) -> anyhow::Result<()> {
        if texture.0 == 0 {
            anyhow::bail!("texture lost");
        }
        dst.fill(texture.0 as u8);
        Ok(())
    }
}

#[test]
fn test_texture_readback() -> anyhow::Result<()> {
    let sink = MemorySink::new();
    let reader: Arc<dyn TextureReader> = Arc::new(FakeTextureReader);
    let mut context = Context::new(small_config(), Some(reader), sink.clone().into())?;

    assert!(!context.add_video_frame_from_texture(TextureHandle(0), PixelFormat::Bgra8, 0.0));
    let stats = context.video_pool_stats().expect("video pool");
    assert_eq!(stats.available, stats.capacity);

    assert!(context.add_video_frame_from_texture(TextureHandle(7), PixelFormat::Bgra8, 0.0));
    context.release();

    let file = read_framed(&sink.contents())?;
    assert_eq!(file.packets_for(VIDEO_TRACK_NUMBER).count(), 1);
    Ok(())
}

#[test]
fn test_texture_without_reader_fails() -> anyhow::Result<()> {
    let context = Context::new(small_config(), None, MemorySink::new().into())?;
    assert!(!context.add_video_frame_from_texture(TextureHandle(1), PixelFormat::Rgba8, 0.0));
    Ok(())
}

#[test]
fn test_rejects_bad_payloads() -> anyhow::Result<()> {
    let config = ContextConfig {
        audio: AudioConfig {
            num_channels: 2,
            ..Default::default()
        },
        ..small_config()
    };
    let context = Context::new(config, None, MemorySink::new().into())?;
    assert!(!context.add_video_frame_from_pixels(&[0u8; 10], PixelFormat::Rgba8, 0.0));
    assert!(!context.add_audio_frame(&[], 0.0));
    assert!(!context.add_audio_frame(&[0.0; 3], 0.0));
    assert!(context.add_audio_frame(&[0.0; 4], 0.0));
    Ok(())
}

#[test]
fn test_negative_timestamps_are_derived() -> anyhow::Result<()> {
    let mut context = Context::new(small_config(), None, MemorySink::new().into())?;
    let recorder = Arc::new(RecordingWriter::default());
    context.attach_writer(recorder.clone())?;

    let frame = rgba_frame(1);
    for _ in 0..3 {
        assert!(context.add_video_frame_from_pixels(&frame, PixelFormat::Rgba8, -1.0));
    }
    context.release();

    let expected: Vec<i64> = (0..3).map(|i| to_hnsec(i as f64 / 30.0)).collect();
    assert_eq!(recorder.timestamps(TrackKind::Video), expected);
    Ok(())
}

#[test]
fn test_sink_attached_mid_session() -> anyhow::Result<()> {
    let primary = MemorySink::new();
    let mirror = MemorySink::new();
    let mut context = Context::new(small_config(), None, primary.clone().into())?;

    let frame = rgba_frame(50);
    for i in 0..5 {
        assert!(context.add_video_frame_from_pixels(&frame, PixelFormat::Rgba8, i as f64 / 30.0));
    }
    context.attach_output_sink(mirror.boxed())?;
    for i in 5..10 {
        assert!(context.add_video_frame_from_pixels(&frame, PixelFormat::Rgba8, i as f64 / 30.0));
    }
    context.release();

    let primary = read_framed(&primary.contents())?;
    let mirror = read_framed(&mirror.contents())?;
    assert!(mirror.finalized);
    assert_eq!(mirror.tracks, primary.tracks);
    let primary_video = primary.packets_for(VIDEO_TRACK_NUMBER).count();
    let mirror_video = mirror.packets_for(VIDEO_TRACK_NUMBER).count();
    assert_eq!(primary_video, 10);
    assert!((5..=10).contains(&mirror_video));
    Ok(())
}
