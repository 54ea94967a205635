use std::{path::PathBuf, sync::Arc};

use anyhow::Context as _;
use capture_bus::{
    Context, ContextState, Output, PixelFormat, TextureHandle, TextureReader, sink::file_sink,
};

use crate::config::RecorderConfig;

/// One recording session described by a [`RecorderConfig`]: the primary
/// output plus any mirror files.
pub struct Recorder {
    context: Context,
    outputs: Vec<PathBuf>,
}

impl Recorder {
    pub fn open(
        config: &RecorderConfig,
        texture_reader: Option<Arc<dyn TextureReader>>,
    ) -> anyhow::Result<Self> {
        let context_config = config.to_context_config();
        if !config.mirror_outputs.is_empty() && !context_config.container.supports_sinks() {
            anyhow::bail!(
                "mirror outputs need the framed container, not {:?}",
                context_config.container
            );
        }
        let context = Context::new(
            context_config,
            texture_reader,
            Output::path(&config.output),
        )?;

        let mut outputs = vec![config.output.clone()];
        for mirror in &config.mirror_outputs {
            let sink = file_sink(mirror)?;
            context
                .attach_output_sink(sink)
                .with_context(|| format!("mirror output {}", mirror.display()))?;
            outputs.push(mirror.clone());
        }
        log::info!("recording to {:?}", outputs);

        Ok(Self { context, outputs })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn outputs(&self) -> &[PathBuf] {
        &self.outputs
    }

    pub fn add_video_frame(&self, pixels: &[u8], format: PixelFormat, timestamp: f64) -> bool {
        self.context
            .add_video_frame_from_pixels(pixels, format, timestamp)
    }

    pub fn add_video_texture(
        &self,
        texture: TextureHandle,
        format: PixelFormat,
        timestamp: f64,
    ) -> bool {
        self.context
            .add_video_frame_from_texture(texture, format, timestamp)
    }

    pub fn add_audio_frame(&self, samples: &[f32], timestamp: f64) -> bool {
        self.context.add_audio_frame(samples, timestamp)
    }

    /// Drains pending frames and closes every output.
    pub fn finish(mut self) -> Vec<PathBuf> {
        self.context.release();
        debug_assert_eq!(self.context.state(), ContextState::Closed);
        std::mem::take(&mut self.outputs)
    }
}
