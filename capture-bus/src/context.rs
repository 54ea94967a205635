//! Capture session.
//!
//! A [`Context`] owns one [`TaskQueue`] per enabled media kind. The worker
//! thread of each queue owns that kind's encoder and scratch state; the
//! producer only touches the buffer pools. Frames are copied into pooled
//! buffers on the caller thread and everything after that (conversion,
//! encoding, writing) happens on the worker.

use std::sync::{
    Arc, PoisonError, RwLock,
    atomic::{AtomicU64, Ordering},
};

use anyhow::Context as _;

use crate::{
    backend,
    config::ContextConfig,
    encoder::{AudioEncoder, DefaultEncoderFactory, EncoderFactory, VideoEncoder},
    frame::PixelFormat,
    packet::{PacketBatch, TrackKind},
    pool::{BufferPool, PoolStats, Pooled},
    scaler::Scaler,
    sink::{Output, Sink},
    task_queue::TaskQueue,
    texture::{TextureHandle, TextureReader},
    writer::{AudioTrackInfo, VideoTrackInfo, Writer, create_writer},
};

type WriterList = Arc<RwLock<Vec<Arc<dyn Writer>>>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextState {
    Open,
    Closing,
    Closed,
}

fn snapshot(writers: &WriterList) -> Vec<Arc<dyn Writer>> {
    writers
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

fn fan_out(writers: &WriterList, kind: TrackKind, batch: &PacketBatch) {
    let writers = snapshot(writers);
    for packet in batch.iter() {
        for writer in &writers {
            if let Err(e) = writer.add_packet(kind, packet) {
                log::error!("write {} packet at {}: {:#}", kind.as_str(), packet.timestamp, e);
            }
        }
    }
}

struct VideoTrackState {
    encoder: Box<dyn VideoEncoder>,
    scaler: Scaler,
    batch: PacketBatch,
    writers: WriterList,
    width: u32,
    height: u32,
}

impl VideoTrackState {
    fn encode(&mut self, pixels: &[u8], format: PixelFormat, timestamp: f64) {
        let image = match self.scaler.run(pixels, format, self.width, self.height) {
            Ok(image) => image,
            Err(e) => {
                log::error!("convert video frame at {:.3}s: {:#}", timestamp, e);
                return;
            }
        };
        match self.encoder.encode(&mut self.batch, image, timestamp) {
            Ok(true) => fan_out(&self.writers, TrackKind::Video, &self.batch),
            Ok(false) => {}
            Err(e) => log::error!("encode video frame at {:.3}s: {:#}", timestamp, e),
        }
        self.batch.clear();
    }

    fn flush(&mut self) {
        match self.encoder.flush(&mut self.batch) {
            Ok(true) => fan_out(&self.writers, TrackKind::Video, &self.batch),
            Ok(false) => {}
            Err(e) => log::error!("flush video encoder: {:#}", e),
        }
        self.batch.clear();
    }
}

struct AudioTrackState {
    encoder: Box<dyn AudioEncoder>,
    batch: PacketBatch,
    writers: WriterList,
}

impl AudioTrackState {
    fn encode(&mut self, samples: &[f32], timestamp: f64) {
        match self.encoder.encode(&mut self.batch, samples, timestamp) {
            Ok(true) => fan_out(&self.writers, TrackKind::Audio, &self.batch),
            Ok(false) => {}
            Err(e) => log::error!("encode audio block at {:.3}s: {:#}", timestamp, e),
        }
        self.batch.clear();
    }

    fn flush(&mut self) {
        match self.encoder.flush(&mut self.batch) {
            Ok(true) => fan_out(&self.writers, TrackKind::Audio, &self.batch),
            Ok(false) => {}
            Err(e) => log::error!("flush audio encoder: {:#}", e),
        }
        self.batch.clear();
    }
}

struct VideoTrack {
    queue: TaskQueue<VideoTrackState>,
    pool: BufferPool<Vec<u8>>,
    info: VideoTrackInfo,
    frames: AtomicU64,
}

struct AudioTrack {
    queue: TaskQueue<AudioTrackState>,
    pool: BufferPool<Vec<f32>>,
    info: AudioTrackInfo,
    samples: AtomicU64,
}

pub struct Context {
    config: ContextConfig,
    state: ContextState,
    texture_reader: Option<Arc<dyn TextureReader>>,
    video: Option<VideoTrack>,
    audio: Option<AudioTrack>,
    writers: WriterList,
}

impl Context {
    pub fn new(
        config: ContextConfig,
        texture_reader: Option<Arc<dyn TextureReader>>,
        output: Output,
    ) -> anyhow::Result<Self> {
        Self::with_factory(config, &DefaultEncoderFactory, texture_reader, output)
    }

    /// Builds the encoders through `factory`. A kind whose encoder cannot be
    /// built, or whose track the output refuses, is disabled for the session;
    /// construction fails only when neither kind is left.
    pub fn with_factory(
        mut config: ContextConfig,
        factory: &dyn EncoderFactory,
        texture_reader: Option<Arc<dyn TextureReader>>,
        output: Output,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        backend::ensure_initialized();

        let mut video_encoder = None;
        if config.video.enabled {
            match factory.video(&config.video) {
                Ok(encoder) => video_encoder = Some(encoder),
                Err(e) => {
                    log::warn!("video disabled, encoder unavailable: {:#}", e);
                    config.video.enabled = false;
                }
            }
        }
        let mut audio_encoder = None;
        if config.audio.enabled {
            match factory.audio(&config.audio) {
                Ok(encoder) => audio_encoder = Some(encoder),
                Err(e) => {
                    log::warn!("audio disabled, encoder unavailable: {:#}", e);
                    config.audio.enabled = false;
                }
            }
        }
        if video_encoder.is_none() && audio_encoder.is_none() {
            anyhow::bail!("no usable video or audio encoder");
        }

        let description = output.describe();
        let writer = create_writer(config.container, output)
            .with_context(|| format!("create {:?} writer for {}", config.container, description))?;

        let video_info = video_encoder
            .as_ref()
            .map(|e| VideoTrackInfo::new(&config.video, e.info()));
        if let Some(info) = &video_info {
            if let Err(e) = writer.attach_video_track(info) {
                log::warn!("video disabled, writer refused track: {:#}", e);
                config.video.enabled = false;
                video_encoder = None;
            }
        }
        let audio_info = audio_encoder
            .as_ref()
            .map(|e| AudioTrackInfo::new(&config.audio, e.info()));
        if let Some(info) = &audio_info {
            if let Err(e) = writer.attach_audio_track(info) {
                log::warn!("audio disabled, writer refused track: {:#}", e);
                config.audio.enabled = false;
                audio_encoder = None;
            }
        }
        if video_encoder.is_none() && audio_encoder.is_none() {
            anyhow::bail!("writer for {} accepted neither track", description);
        }

        let writers: WriterList = Arc::new(RwLock::new(vec![writer]));

        let video = match (video_encoder, video_info) {
            (Some(encoder), Some(info)) => {
                let state = VideoTrackState {
                    encoder,
                    scaler: Scaler::new(config.video.width, config.video.height),
                    batch: PacketBatch::new(),
                    writers: writers.clone(),
                    width: config.video.width,
                    height: config.video.height,
                };
                Some(VideoTrack {
                    queue: TaskQueue::new("framecap-video", state)?,
                    pool: BufferPool::new(config.pool_size, Vec::new),
                    info,
                    frames: AtomicU64::new(0),
                })
            }
            _ => None,
        };
        let audio = match (audio_encoder, audio_info) {
            (Some(encoder), Some(info)) => {
                let state = AudioTrackState {
                    encoder,
                    batch: PacketBatch::new(),
                    writers: writers.clone(),
                };
                Some(AudioTrack {
                    queue: TaskQueue::new("framecap-audio", state)?,
                    pool: BufferPool::new(config.pool_size, Vec::new),
                    info,
                    samples: AtomicU64::new(0),
                })
            }
            _ => None,
        };

        log::info!(
            "capture context open: video={} audio={} container={:?} output={}",
            config.video.enabled,
            config.audio.enabled,
            config.container,
            description
        );

        Ok(Self {
            config,
            state: ContextState::Open,
            texture_reader,
            video,
            audio,
            writers,
        })
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn is_video_enabled(&self) -> bool {
        self.config.video.enabled
    }

    pub fn is_audio_enabled(&self) -> bool {
        self.config.audio.enabled
    }

    pub fn video_pool_stats(&self) -> Option<PoolStats> {
        self.video.as_ref().map(|t| t.pool.stats())
    }

    pub fn audio_pool_stats(&self) -> Option<PoolStats> {
        self.audio.as_ref().map(|t| t.pool.stats())
    }

    fn video_track(&self) -> Option<&VideoTrack> {
        if self.state != ContextState::Open {
            return None;
        }
        self.video.as_ref()
    }

    fn audio_track(&self) -> Option<&AudioTrack> {
        if self.state != ContextState::Open {
            return None;
        }
        self.audio.as_ref()
    }

    fn acquire<T>(&self, kind: TrackKind, pool: &BufferPool<T>) -> Option<Pooled<T>> {
        match self.config.acquire_timeout {
            None => Some(pool.acquire()),
            Some(timeout) => {
                let buffer = pool.acquire_timeout(timeout);
                if buffer.is_none() {
                    log::warn!("no free {} buffer after {:?}, frame dropped", kind.as_str(), timeout);
                }
                buffer
            }
        }
    }

    /// Reads the texture back into a pooled buffer on the calling thread, then
    /// queues it like [`Context::add_video_frame_from_pixels`].
    pub fn add_video_frame_from_texture(
        &self,
        texture: TextureHandle,
        format: PixelFormat,
        timestamp: f64,
    ) -> bool {
        let Some(track) = self.video_track() else {
            return false;
        };
        let Some(reader) = self.texture_reader.as_ref() else {
            log::warn!("texture frame submitted without a texture reader");
            return false;
        };
        let (width, height) = (self.config.video.width, self.config.video.height);
        let Some(mut buffer) = self.acquire(TrackKind::Video, &track.pool) else {
            return false;
        };
        buffer.resize(format.frame_size(width, height), 0);
        if let Err(e) = reader.read_texture(&mut buffer, texture, width, height, format) {
            log::error!("read texture {:?}: {:#}", texture, e);
            return false;
        }
        self.submit_video(track, buffer, format, timestamp)
    }

    /// Copies a tightly packed frame of the configured size and queues it for
    /// encoding. `true` means queued; encode errors surface only in the log.
    /// A negative `timestamp` is derived from the frame count.
    pub fn add_video_frame_from_pixels(
        &self,
        pixels: &[u8],
        format: PixelFormat,
        timestamp: f64,
    ) -> bool {
        let Some(track) = self.video_track() else {
            return false;
        };
        let expected = format.frame_size(self.config.video.width, self.config.video.height);
        if pixels.len() < expected {
            log::warn!(
                "{} frame needs {} bytes, got {}",
                format,
                expected,
                pixels.len()
            );
            return false;
        }
        let Some(mut buffer) = self.acquire(TrackKind::Video, &track.pool) else {
            return false;
        };
        buffer.clear();
        buffer.extend_from_slice(&pixels[..expected]);
        self.submit_video(track, buffer, format, timestamp)
    }

    fn submit_video(
        &self,
        track: &VideoTrack,
        buffer: Pooled<Vec<u8>>,
        format: PixelFormat,
        timestamp: f64,
    ) -> bool {
        let index = track.frames.fetch_add(1, Ordering::Relaxed);
        let timestamp = if timestamp < 0.0 {
            index as f64 / self.config.video.target_framerate as f64
        } else {
            timestamp
        };
        let result = track.queue.submit(move |state: &mut VideoTrackState| {
            state.encode(&buffer, format, timestamp);
        });
        match result {
            Ok(()) => true,
            Err(e) => {
                log::error!("queue video frame: {:#}", e);
                false
            }
        }
    }

    /// Queues a block of interleaved samples. The block must hold whole
    /// frames (a multiple of the channel count). A negative `timestamp` is
    /// derived from the samples submitted so far.
    pub fn add_audio_frame(&self, samples: &[f32], timestamp: f64) -> bool {
        let Some(track) = self.audio_track() else {
            return false;
        };
        let channels = self.config.audio.num_channels as usize;
        if samples.is_empty() || samples.len() % channels != 0 {
            log::warn!(
                "audio block of {} samples is not whole {}-channel frames",
                samples.len(),
                channels
            );
            return false;
        }
        let Some(mut buffer) = self.acquire(TrackKind::Audio, &track.pool) else {
            return false;
        };
        buffer.clear();
        buffer.extend_from_slice(samples);

        let submitted = track.samples.fetch_add(samples.len() as u64, Ordering::Relaxed);
        let timestamp = if timestamp < 0.0 {
            submitted as f64 / (self.config.audio.sample_rate as f64 * channels as f64)
        } else {
            timestamp
        };
        let result = track.queue.submit(move |state: &mut AudioTrackState| {
            state.encode(&buffer, timestamp);
        });
        match result {
            Ok(()) => true,
            Err(e) => {
                log::error!("queue audio block: {:#}", e);
                false
            }
        }
    }

    /// Adds another sink receiving the same packets. Only container formats
    /// that can write to an arbitrary sink support this.
    pub fn attach_output_sink(&self, sink: Sink) -> anyhow::Result<()> {
        if self.state != ContextState::Open {
            anyhow::bail!("context is closed");
        }
        if !self.config.container.supports_sinks() {
            anyhow::bail!("{:?} output cannot fan out to extra sinks", self.config.container);
        }
        let writer = create_writer(self.config.container, Output::Sink(sink))?;
        self.attach_writer(writer)
    }

    /// Registers `writer` for the enabled tracks. It receives every packet
    /// produced from now until release.
    pub fn attach_writer(&self, writer: Arc<dyn Writer>) -> anyhow::Result<()> {
        if self.state != ContextState::Open {
            anyhow::bail!("context is closed");
        }
        if let Some(track) = &self.video {
            writer.attach_video_track(&track.info)?;
        }
        if let Some(track) = &self.audio {
            writer.attach_audio_track(&track.info)?;
        }
        self.writers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(writer);
        log::info!("writer attached");
        Ok(())
    }

    /// Flushes the encoders, waits for every queued frame, then finalizes
    /// every writer. Runs once; the context is inert afterwards.
    pub fn release(&mut self) {
        if self.state != ContextState::Open {
            return;
        }
        self.state = ContextState::Closing;
        log::info!("capture context closing");

        if let Some(track) = &self.video {
            if let Err(e) = track.queue.submit(|state: &mut VideoTrackState| state.flush()) {
                log::error!("queue video flush: {:#}", e);
            }
        }
        if let Some(track) = &self.audio {
            if let Err(e) = track.queue.submit(|state: &mut AudioTrackState| state.flush()) {
                log::error!("queue audio flush: {:#}", e);
            }
        }
        if let Some(track) = self.video.as_mut() {
            drop(track.queue.drain_and_wait());
        }
        if let Some(track) = self.audio.as_mut() {
            drop(track.queue.drain_and_wait());
        }

        let writers = std::mem::take(&mut *self.writers.write().unwrap_or_else(PoisonError::into_inner));
        for writer in writers {
            if let Err(e) = writer.finalize() {
                log::error!("finalize writer: {:#}", e);
            }
        }
        self.state = ContextState::Closed;
        log::info!("capture context closed");
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
#[path = "context_test.rs"]
mod context_test;
