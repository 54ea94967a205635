//! Process-wide media backend state.
//!
//! Backend initialization and codec probing are expensive and their outcome
//! does not change while the process runs, so both happen once and the
//! result is cached. Nothing is torn down: the backend stays initialized
//! for the life of the process.

use std::sync::OnceLock;

#[derive(Debug, Clone)]
pub struct BackendStatus {
    /// FFmpeg was compiled in and initialized successfully.
    pub ffmpeg: bool,
    /// Encoder names found by the probe.
    pub encoders: Vec<&'static str>,
}

impl BackendStatus {
    pub fn has_encoder(&self, name: &str) -> bool {
        self.encoders.contains(&name)
    }
}

static STATUS: OnceLock<BackendStatus> = OnceLock::new();

/// Initializes the backend on first call; later calls return the cached status.
pub fn ensure_initialized() -> &'static BackendStatus {
    STATUS.get_or_init(|| {
        let status = probe();
        log::info!(
            "media backend ready: ffmpeg={}, encoders={:?}",
            status.ffmpeg,
            status.encoders
        );
        status
    })
}

#[cfg(feature = "ffmpeg")]
fn probe() -> BackendStatus {
    if let Err(e) = ffmpeg_next::init() {
        log::warn!("ffmpeg init failed, only built-in codecs available: {}", e);
        return BackendStatus {
            ffmpeg: false,
            encoders: Vec::new(),
        };
    }
    let encoders = crate::encoder::FFMPEG_ENCODER_NAMES
        .iter()
        .copied()
        .filter(|name| ffmpeg_next::encoder::find_by_name(name).is_some())
        .collect();
    BackendStatus {
        ffmpeg: true,
        encoders,
    }
}

#[cfg(not(feature = "ffmpeg"))]
fn probe() -> BackendStatus {
    BackendStatus {
        ffmpeg: false,
        encoders: Vec::new(),
    }
}
