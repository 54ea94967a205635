pub mod config;
pub mod recorder;

pub use config::RecorderConfig;
pub use recorder::Recorder;

/// Sets up `env_logger` from `RUST_LOG`, defaulting to info for the capture
/// crates. Safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("capture_bus", log::LevelFilter::Debug)
        .filter_module("framecap", log::LevelFilter::Debug)
        .try_init();
}
