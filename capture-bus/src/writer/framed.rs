//! Built-in packet container.
//!
//! Layout, little-endian throughout:
//!
//! ```text
//! "FCAP" version:u8
//! 'T' track:u8 kind:u8 codec_id_len:u16 codec_id p0:u32 p1:u32 p2:u32 private_len:u32 private
//! 'P' track:u8 flags:u8 timestamp:i64 duration:i64 len:u32 data
//! 'I' count:u8 { track:u8 packets:u64 first:i64 end:i64 }*
//! "FEND"
//! ```
//!
//! Track records precede every packet record. For video `p0..p2` are width,
//! height and framerate; for audio sample rate, channel count and zero.
//! Timestamps are 100 ns ticks. The index and end marker are only present
//! once the writer has been finalized.

use std::{
    io::Write,
    sync::{Mutex, MutexGuard, PoisonError},
};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    packet::{EncodedPacket, TrackKind},
    sink::Sink,
    writer::{AudioTrackInfo, VideoTrackInfo, Writer},
};

const MAGIC: &[u8; 4] = b"FCAP";
const END_MAGIC: &[u8; 4] = b"FEND";
const VERSION: u8 = 1;
const TAG_TRACK: u8 = b'T';
const TAG_PACKET: u8 = b'P';
const TAG_INDEX: u8 = b'I';
const FLAG_KEY: u8 = 0x01;

pub const VIDEO_TRACK_NUMBER: u8 = 1;
pub const AUDIO_TRACK_NUMBER: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TrackStats {
    number: u8,
    packets: u64,
    first: Option<i64>,
    end: i64,
}

impl TrackStats {
    fn new(number: u8) -> Self {
        Self {
            number,
            packets: 0,
            first: None,
            end: 0,
        }
    }
}

struct FramedState {
    sink: Sink,
    video: Option<TrackStats>,
    audio: Option<TrackStats>,
    packets_written: bool,
    finalized: bool,
}

impl FramedState {
    fn write(&mut self, record: &[u8]) -> anyhow::Result<()> {
        self.sink.write_all(record)?;
        Ok(())
    }

    fn check_attach(&self, kind: TrackKind, existing: bool) -> anyhow::Result<()> {
        if self.finalized {
            anyhow::bail!("writer already finalized");
        }
        if existing {
            anyhow::bail!("{} track already attached", kind.as_str());
        }
        if self.packets_written {
            anyhow::bail!("cannot attach {} track after packets", kind.as_str());
        }
        Ok(())
    }
}

pub struct FramedWriter {
    state: Mutex<FramedState>,
}

impl FramedWriter {
    pub fn new(mut sink: Sink) -> anyhow::Result<Self> {
        sink.write_all(MAGIC)?;
        sink.write_all(&[VERSION])?;
        Ok(Self {
            state: Mutex::new(FramedState {
                sink,
                video: None,
                audio: None,
                packets_written: false,
                finalized: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, FramedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add_packet_inner(&self, kind: TrackKind, packet: &EncodedPacket) -> anyhow::Result<()> {
        if packet.data.is_empty() {
            return Ok(());
        }
        let mut state = self.lock();
        if state.finalized {
            anyhow::bail!("writer already finalized");
        }
        let number = match kind {
            TrackKind::Video => state.video.as_ref(),
            TrackKind::Audio => state.audio.as_ref(),
        }
        .map(|track| track.number);
        let Some(number) = number else {
            return Ok(());
        };

        let mut record = BytesMut::with_capacity(packet.size() + 23);
        record.put_u8(TAG_PACKET);
        record.put_u8(number);
        record.put_u8(if packet.is_key { FLAG_KEY } else { 0 });
        record.put_i64_le(packet.timestamp);
        record.put_i64_le(packet.duration);
        record.put_u32_le(packet.size() as u32);
        record.put_slice(&packet.data);
        state.packets_written = true;
        state.write(&record)?;

        // only packets that reached the sink count towards the index
        let track = match kind {
            TrackKind::Video => state.video.as_mut(),
            TrackKind::Audio => state.audio.as_mut(),
        };
        if let Some(track) = track {
            track.packets += 1;
            track.first.get_or_insert(packet.timestamp);
            track.end = track.end.max(packet.end());
        }
        Ok(())
    }
}

fn track_record(
    number: u8,
    kind: TrackKind,
    codec_id: &str,
    params: [u32; 3],
    codec_private: &[u8],
) -> BytesMut {
    let mut record = BytesMut::new();
    record.put_u8(TAG_TRACK);
    record.put_u8(number);
    record.put_u8(match kind {
        TrackKind::Video => 0,
        TrackKind::Audio => 1,
    });
    record.put_u16_le(codec_id.len() as u16);
    record.put_slice(codec_id.as_bytes());
    for p in params {
        record.put_u32_le(p);
    }
    record.put_u32_le(codec_private.len() as u32);
    record.put_slice(codec_private);
    record
}

impl Writer for FramedWriter {
    fn attach_video_track(&self, track: &VideoTrackInfo) -> anyhow::Result<()> {
        let mut state = self.lock();
        state.check_attach(TrackKind::Video, state.video.is_some())?;
        let record = track_record(
            VIDEO_TRACK_NUMBER,
            TrackKind::Video,
            track.codec_id,
            [track.width, track.height, track.framerate],
            &track.codec_private,
        );
        state.write(&record)?;
        state.video = Some(TrackStats::new(VIDEO_TRACK_NUMBER));
        Ok(())
    }

    fn attach_audio_track(&self, track: &AudioTrackInfo) -> anyhow::Result<()> {
        let mut state = self.lock();
        state.check_attach(TrackKind::Audio, state.audio.is_some())?;
        let record = track_record(
            AUDIO_TRACK_NUMBER,
            TrackKind::Audio,
            track.codec_id,
            [track.sample_rate, track.num_channels, 0],
            &track.codec_private,
        );
        state.write(&record)?;
        state.audio = Some(TrackStats::new(AUDIO_TRACK_NUMBER));
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
        if state.finalized {
            return Ok(());
        }
        state.finalized = true;

        let tracks: Vec<TrackStats> = state.video.iter().chain(state.audio.iter()).copied().collect();
        let mut record = BytesMut::new();
        record.put_u8(TAG_INDEX);
        record.put_u8(tracks.len() as u8);
        for track in &tracks {
            record.put_u8(track.number);
            record.put_u64_le(track.packets);
            record.put_i64_le(track.first.unwrap_or(0));
            record.put_i64_le(track.end);
        }
        record.put_slice(END_MAGIC);
        state.write(&record)?;
        state.sink.flush()?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedTrack {
    pub number: u8,
    pub kind: TrackKind,
    pub codec_id: String,
    pub params: [u32; 3],
    pub codec_private: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedPacket {
    pub track: u8,
    pub is_key: bool,
    pub timestamp: i64,
    pub duration: i64,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub track: u8,
    pub packets: u64,
    pub first: i64,
    pub end: i64,
}

#[derive(Debug, Clone, Default)]
pub struct FramedFile {
    pub tracks: Vec<FramedTrack>,
    pub packets: Vec<FramedPacket>,
    /// Empty unless the file was finalized.
    pub index: Vec<IndexEntry>,
    pub finalized: bool,
}

impl FramedFile {
    pub fn track(&self, kind: TrackKind) -> Option<&FramedTrack> {
        self.tracks.iter().find(|t| t.kind == kind)
    }

    pub fn packets_for(&self, track: u8) -> impl Iterator<Item = &FramedPacket> {
        self.packets.iter().filter(move |p| p.track == track)
    }
}

fn need(buf: &Bytes, n: usize, what: &str) -> anyhow::Result<()> {
    if buf.remaining() < n {
        anyhow::bail!("truncated {}: need {} bytes, have {}", what, n, buf.remaining());
    }
    Ok(())
}

/// Parses a framed container. Unfinalized (truncated after a whole record)
/// files parse with `finalized == false`.
pub fn read_framed(data: &[u8]) -> anyhow::Result<FramedFile> {
    let mut buf = Bytes::copy_from_slice(data);
    need(&buf, 5, "header")?;
    if &buf[..4] != MAGIC {
        anyhow::bail!("not a framed container");
    }
    buf.advance(4);
    let version = buf.get_u8();
    if version != VERSION {
        anyhow::bail!("unsupported framed version {}", version);
    }

    let mut file = FramedFile::default();
    while buf.has_remaining() {
        match buf.get_u8() {
            TAG_TRACK => {
                need(&buf, 4, "track")?;
                let number = buf.get_u8();
                let kind = match buf.get_u8() {
                    0 => TrackKind::Video,
                    1 => TrackKind::Audio,
                    other => anyhow::bail!("unknown track kind {}", other),
                };
                let id_len = buf.get_u16_le() as usize;
                need(&buf, id_len + 16, "track")?;
                let codec_id = String::from_utf8(buf.split_to(id_len).to_vec())?;
                let params = [buf.get_u32_le(), buf.get_u32_le(), buf.get_u32_le()];
                let private_len = buf.get_u32_le() as usize;
                need(&buf, private_len, "codec private")?;
                let codec_private = buf.split_to(private_len);
                file.tracks.push(FramedTrack {
                    number,
                    kind,
                    codec_id,
                    params,
                    codec_private,
                });
            }
            TAG_PACKET => {
                need(&buf, 22, "packet")?;
                let track = buf.get_u8();
                let flags = buf.get_u8();
                let timestamp = buf.get_i64_le();
                let duration = buf.get_i64_le();
                let len = buf.get_u32_le() as usize;
                need(&buf, len, "packet data")?;
                file.packets.push(FramedPacket {
                    track,
                    is_key: flags & FLAG_KEY != 0,
                    timestamp,
                    duration,
                    data: buf.split_to(len),
                });
            }
            TAG_INDEX => {
                need(&buf, 1, "index")?;
                let count = buf.get_u8() as usize;
                need(&buf, count * 25 + END_MAGIC.len(), "index")?;
                for _ in 0..count {
                    file.index.push(IndexEntry {
                        track: buf.get_u8(),
                        packets: buf.get_u64_le(),
                        first: buf.get_i64_le(),
                        end: buf.get_i64_le(),
                    });
                }
                if &buf[..4] != END_MAGIC {
                    anyhow::bail!("missing end marker");
                }
                buf.advance(4);
                file.finalized = true;
            }
            tag => anyhow::bail!("unknown record tag {:#04x}", tag),
        }
    }
    Ok(file)
}

#[cfg(test)]
#[path = "framed_test.rs"]
mod framed_test;
