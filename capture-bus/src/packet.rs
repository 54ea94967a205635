use bytes::Bytes;

/// Packet timestamps and durations are expressed in 100 ns ticks.
pub const HNSEC_PER_SEC: i64 = 10_000_000;

pub fn to_hnsec(seconds: f64) -> i64 {
    (seconds * HNSEC_PER_SEC as f64).round() as i64
}

pub fn hnsec_to_seconds(ticks: i64) -> f64 {
    ticks as f64 / HNSEC_PER_SEC as f64
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Video,
    Audio,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Video => "video",
            TrackKind::Audio => "audio",
        }
    }
}

/// One unit of codec output.
#[derive(Clone, Debug)]
pub struct EncodedPacket {
    pub data: Bytes,
    pub timestamp: i64,
    pub duration: i64,
    pub is_key: bool,
}

impl EncodedPacket {
    pub fn new(data: impl Into<Bytes>, timestamp: i64, duration: i64, is_key: bool) -> Self {
        Self {
            data: data.into(),
            timestamp,
            duration,
            is_key,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn end(&self) -> i64 {
        self.timestamp.saturating_add(self.duration)
    }
}

/// Accumulator an encoder appends to; cleared after every fan-out.
#[derive(Debug, Default)]
pub struct PacketBatch {
    packets: Vec<EncodedPacket>,
}

impl PacketBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, packet: EncodedPacket) {
        self.packets.push(packet);
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EncodedPacket> {
        self.packets.iter()
    }

    pub fn clear(&mut self) {
        self.packets.clear();
    }
}

pub type PacketSender = tokio::sync::broadcast::Sender<PacketCmd>;
pub type PacketReceiver = tokio::sync::broadcast::Receiver<PacketCmd>;

#[derive(Clone, Debug)]
pub enum PacketCmd {
    Data(TrackKind, EncodedPacket),
    EOF,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hnsec_conversion() {
        assert_eq!(to_hnsec(1.0), HNSEC_PER_SEC);
        assert_eq!(to_hnsec(1.0 / 30.0), 333_333);
        assert_eq!(hnsec_to_seconds(to_hnsec(2.5)), 2.5);
    }

    #[test]
    fn test_end_saturates() {
        let packet = EncodedPacket::new(vec![0u8], to_hnsec(f64::MAX), 333_333, true);
        assert_eq!(packet.timestamp, i64::MAX);
        assert_eq!(packet.end(), i64::MAX);
    }

    #[test]
    fn test_batch_clear() {
        let mut batch = PacketBatch::new();
        batch.push(EncodedPacket::new(vec![1u8, 2, 3], 0, 10, true));
        batch.push(EncodedPacket::new(vec![4u8], 10, 10, false));
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.iter().map(|p| p.size()).sum::<usize>(), 4);
        batch.clear();
        assert!(batch.is_empty());
    }
}
