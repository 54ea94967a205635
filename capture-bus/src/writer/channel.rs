use std::{
    pin::Pin,
    sync::{Mutex, MutexGuard, PoisonError},
};

use futures::{Stream, StreamExt, future};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

use crate::{
    packet::{EncodedPacket, PacketCmd, PacketReceiver, PacketSender, TrackKind},
    writer::{AudioTrackInfo, VideoTrackInfo, Writer},
};

pub type PacketStream = Pin<Box<dyn Stream<Item = (TrackKind, EncodedPacket)> + Send>>;

#[derive(Default)]
struct ChannelState {
    video: Option<VideoTrackInfo>,
    audio: Option<AudioTrackInfo>,
    finalized: bool,
}

/// Writer that republishes packets to in-process subscribers instead of a
/// container. Subscribers that fall behind by more than `capacity` packets
/// lose the oldest ones.
pub struct ChannelWriter {
    tx: PacketSender,
    state: Mutex<ChannelState>,
}

impl ChannelWriter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            state: Mutex::new(ChannelState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> PacketReceiver {
        self.tx.subscribe()
    }

    /// Packets published after this call, ending once the writer is
    /// finalized.
    pub fn stream(&self) -> PacketStream {
        let stream = BroadcastStream::new(self.subscribe())
            .filter_map(|r| async move {
                match r {
                    Ok(PacketCmd::Data(kind, packet)) => Some(Some((kind, packet))),
                    Ok(PacketCmd::EOF) => Some(None),
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        log::warn!("packet subscriber lagged, skipped {} packets", n);
                        None
                    }
                }
            })
            .take_while(|item| future::ready(item.is_some()))
            .filter_map(future::ready);
        Box::pin(stream)
    }

    pub fn video_track(&self) -> Option<VideoTrackInfo> {
        self.lock().video.clone()
    }

    pub fn audio_track(&self) -> Option<AudioTrackInfo> {
        self.lock().audio.clone()
    }

    fn publish(&self, kind: TrackKind, packet: &EncodedPacket) -> anyhow::Result<()> {
        if packet.data.is_empty() {
            return Ok(());
        }
        let state = self.lock();
        if state.finalized {
            anyhow::bail!("writer already finalized");
        }
        let attached = match kind {
            TrackKind::Video => state.video.is_some(),
            TrackKind::Audio => state.audio.is_some(),
        };
        if attached {
            // no subscribers is not an error
            let _ = self.tx.send(PacketCmd::Data(kind, packet.clone()));
        }
        Ok(())
    }
}

impl Writer for ChannelWriter {
    fn attach_video_track(&self, track: &VideoTrackInfo) -> anyhow::Result<()> {
        let mut state = self.lock();
        if state.video.is_some() {
            anyhow::bail!("video track already attached");
        }
        state.video = Some(track.clone());
        Ok(())
    }

    fn attach_audio_track(&self, track: &AudioTrackInfo) -> anyhow::Result<()> {
        let mut state = self.lock();
        if state.audio.is_some() {
            anyhow::bail!("audio track already attached");
        }
        state.audio = Some(track.clone());
        Ok(())
    }

    fn add_video_packet(&self, packet: &EncodedPacket) -> anyhow::Result<()> {
        self.publish(TrackKind::Video, packet)
    }

    fn add_audio_packet(&self, packet: &EncodedPacket) -> anyhow::Result<()> {
        self.publish(TrackKind::Audio, packet)
    }

    fn finalize(&self) -> anyhow::Result<()> {
        let mut state = self.lock();
        if !state.finalized {
            state.finalized = true;
            let _ = self.tx.send(PacketCmd::EOF);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures::StreamExt;

    use super::*;
    use crate::{config::AudioConfig, encoder::EncoderInfo};

    fn audio_track() -> AudioTrackInfo {
        AudioTrackInfo::new(
            &AudioConfig::default(),
            &EncoderInfo {
                codec_id: "A_PCM/INT/LIT",
                codec_private: Bytes::new(),
            },
        )
    }

    #[tokio::test]
    async fn test_stream_yields_packets_until_finalize() -> anyhow::Result<()> {
        let writer = ChannelWriter::new(16);
        writer.attach_audio_track(&audio_track())?;
        let stream = writer.stream();

        for i in 0..3i64 {
            writer.add_audio_packet(&EncodedPacket::new(vec![i as u8], i * 10, 10, true))?;
        }
        // never attached, dropped
        writer.add_video_packet(&EncodedPacket::new(vec![1u8], 0, 10, true))?;
        writer.finalize()?;

        let packets: Vec<_> = stream.collect().await;
        assert_eq!(packets.len(), 3);
        assert!(packets.iter().all(|(kind, _)| *kind == TrackKind::Audio));
        let timestamps: Vec<i64> = packets.iter().map(|(_, p)| p.timestamp).collect();
        assert_eq!(timestamps, vec![0, 10, 20]);
        Ok(())
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_oldest() -> anyhow::Result<()> {
        let writer = ChannelWriter::new(2);
        writer.attach_audio_track(&audio_track())?;
        let stream = writer.stream();

        for i in 0..5i64 {
            writer.add_audio_packet(&EncodedPacket::new(vec![1u8], i, 1, true))?;
        }
        writer.finalize()?;

        let packets: Vec<_> = stream.collect().await;
        assert!(packets.len() < 5);
        Ok(())
    }

    #[test]
    fn test_publish_without_subscribers() -> anyhow::Result<()> {
        let writer = ChannelWriter::new(4);
        writer.attach_audio_track(&audio_track())?;
        writer.add_audio_packet(&EncodedPacket::new(vec![1u8], 0, 1, true))?;
        assert!(writer.attach_audio_track(&audio_track()).is_err());
        assert_eq!(writer.audio_track(), Some(audio_track()));
        writer.finalize()?;
        writer.finalize()?;
        Ok(())
    }
}
