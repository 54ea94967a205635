use crate::frame::PixelFormat;

/// Opaque GPU texture handle owned by the host's graphics layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u64);

/// GPU readback, implemented by the host renderer.
///
/// Called synchronously on the producer thread. `dst` is sized to
/// `format.frame_size(width, height)` and must be filled completely.
pub trait TextureReader: Send + Sync {
    fn read_texture(
        &self,
        dst: &mut [u8],
        texture: TextureHandle,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> anyhow::Result<()>;
}
