use crate::frame::{I420Image, PixelFormat, chroma_len};

/// Converts producer pixels into the planar I420 layout encoders expect.
/// Keeps one scratch image so steady-state conversion does not allocate.
///
/// With the `ffmpeg` feature, packed RGB and NV12 input goes through
/// swscale; float RGBA and I420 always take the native path.
pub struct Scaler {
    image: I420Image,
    #[cfg(feature = "ffmpeg")]
    sws: Option<sws::SwsConverter>,
}

impl Scaler {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image: I420Image::new(width, height),
            #[cfg(feature = "ffmpeg")]
            sws: None,
        }
    }

    #[cfg(feature = "ffmpeg")]
    fn run_sws(
        &mut self,
        src: &[u8],
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> anyhow::Result<bool> {
        let reusable = self
            .sws
            .as_ref()
            .is_some_and(|sws| sws.matches(format, width, height));
        if !reusable {
            self.sws = sws::SwsConverter::get(format, width, height)?;
        }
        match self.sws.as_mut() {
            Some(sws) => {
                sws.run(src, &mut self.image)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    #[cfg(not(feature = "ffmpeg"))]
    fn run_sws(
        &mut self,
        _src: &[u8],
        _format: PixelFormat,
        _width: u32,
        _height: u32,
    ) -> anyhow::Result<bool> {
        Ok(false)
    }

    pub fn run(
        &mut self,
        src: &[u8],
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> anyhow::Result<&I420Image> {
        let expected = format.frame_size(width, height);
        if src.len() < expected {
            anyhow::bail!(
                "{} frame {}x{} needs {} bytes, got {}",
                format,
                width,
                height,
                expected,
                src.len()
            );
        }
        if self.image.width() != width || self.image.height() != height {
            self.image.resize(width, height);
        }
        if self.run_sws(src, format, width, height)? {
            return Ok(&self.image);
        }

        match format {
            PixelFormat::I420 => {
                let (y, u, v) = self.image.planes_mut();
                let luma = y.len();
                let chroma = u.len();
                y.copy_from_slice(&src[..luma]);
                u.copy_from_slice(&src[luma..luma + chroma]);
                v.copy_from_slice(&src[luma + chroma..luma + 2 * chroma]);
            }
            PixelFormat::Nv12 => {
                let (y, u, v) = self.image.planes_mut();
                let luma = y.len();
                y.copy_from_slice(&src[..luma]);
                let uv = &src[luma..luma + 2 * chroma_len(width, height)];
                for (i, pair) in uv.chunks_exact(2).enumerate() {
                    u[i] = pair[0];
                    v[i] = pair[1];
                }
            }
            _ => rgb_to_i420(&mut self.image, src, format, width, height),
        }
        Ok(&self.image)
    }
}

fn rgb_at(src: &[u8], format: PixelFormat, index: usize) -> (i32, i32, i32) {
    match format {
        PixelFormat::Rgba8 => {
            let p = &src[index * 4..index * 4 + 3];
            (p[0] as i32, p[1] as i32, p[2] as i32)
        }
        PixelFormat::Bgra8 => {
            let p = &src[index * 4..index * 4 + 3];
            (p[2] as i32, p[1] as i32, p[0] as i32)
        }
        PixelFormat::Rgb8 => {
            let p = &src[index * 3..index * 3 + 3];
            (p[0] as i32, p[1] as i32, p[2] as i32)
        }
        PixelFormat::Rgba32F => {
            let channel = |c: usize| {
                let at = index * 16 + c * 4;
                let bytes = [src[at], src[at + 1], src[at + 2], src[at + 3]];
                (f32::from_ne_bytes(bytes).clamp(0.0, 1.0) * 255.0).round() as i32
            };
            (channel(0), channel(1), channel(2))
        }
        PixelFormat::I420 | PixelFormat::Nv12 => (0, 0, 0),
    }
}

// BT.601 limited range, integer approximation.
fn luma(r: i32, g: i32, b: i32) -> u8 {
    (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16).clamp(0, 255) as u8
}

fn chroma(r: i32, g: i32, b: i32) -> (u8, u8) {
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (u.clamp(0, 255) as u8, v.clamp(0, 255) as u8)
}

fn rgb_to_i420(image: &mut I420Image, src: &[u8], format: PixelFormat, width: u32, height: u32) {
    let (w, h) = (width as usize, height as usize);
    let cw = w.div_ceil(2);
    let (y_plane, u_plane, v_plane) = image.planes_mut();

    for j in 0..h {
        for i in 0..w {
            let (r, g, b) = rgb_at(src, format, j * w + i);
            y_plane[j * w + i] = luma(r, g, b);
        }
    }

    for cj in 0..h.div_ceil(2) {
        for ci in 0..cw {
            let (mut r, mut g, mut b, mut n) = (0, 0, 0, 0);
            for j in (cj * 2)..(cj * 2 + 2).min(h) {
                for i in (ci * 2)..(ci * 2 + 2).min(w) {
                    let (pr, pg, pb) = rgb_at(src, format, j * w + i);
                    r += pr;
                    g += pg;
                    b += pb;
                    n += 1;
                }
            }
            let (u, v) = chroma(r / n, g / n, b / n);
            u_plane[cj * cw + ci] = u;
            v_plane[cj * cw + ci] = v;
        }
    }
}

#[cfg(feature = "ffmpeg")]
mod sws {
    use ffmpeg_next::{format::Pixel, frame, software::scaling};

    use crate::frame::{I420Image, PixelFormat};

    fn source_pixel(format: PixelFormat) -> Option<Pixel> {
        match format {
            PixelFormat::Rgba8 => Some(Pixel::RGBA),
            PixelFormat::Bgra8 => Some(Pixel::BGRA),
            PixelFormat::Rgb8 => Some(Pixel::RGB24),
            PixelFormat::Nv12 => Some(Pixel::NV12),
            PixelFormat::Rgba32F | PixelFormat::I420 => None,
        }
    }

    /// swscale context for one source format and size, with its frames.
    pub struct SwsConverter {
        context: scaling::Context,
        format: PixelFormat,
        width: u32,
        height: u32,
        src: frame::Video,
        dst: frame::Video,
    }

    // Only used from the worker thread that owns the scaler.
    unsafe impl Send for SwsConverter {}

    impl SwsConverter {
        pub fn get(format: PixelFormat, width: u32, height: u32) -> anyhow::Result<Option<Self>> {
            let Some(pixel) = source_pixel(format) else {
                return Ok(None);
            };
            let context = scaling::Context::get(
                pixel,
                width,
                height,
                Pixel::YUV420P,
                width,
                height,
                scaling::Flags::BILINEAR,
            )?;
            log::debug!("swscale {} -> yuv420p at {}x{}", format, width, height);
            Ok(Some(Self {
                context,
                format,
                width,
                height,
                src: frame::Video::new(pixel, width, height),
                dst: frame::Video::new(Pixel::YUV420P, width, height),
            }))
        }

        pub fn matches(&self, format: PixelFormat, width: u32, height: u32) -> bool {
            self.format == format && self.width == width && self.height == height
        }

        pub fn run(&mut self, src: &[u8], image: &mut I420Image) -> anyhow::Result<()> {
            let (w, h) = (self.width as usize, self.height as usize);
            let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
            // (bytes per row, rows) of each tightly packed source plane
            let planes = match self.format.pixel_size() {
                Some(size) => vec![(w * size, h)],
                None => vec![(w, h), (cw * 2, ch)],
            };
            let mut offset = 0;
            for (index, (row, rows)) in planes.into_iter().enumerate() {
                let stride = self.src.stride(index);
                let dst = self.src.data_mut(index);
                for r in 0..rows {
                    dst[r * stride..r * stride + row]
                        .copy_from_slice(&src[offset + r * row..offset + (r + 1) * row]);
                }
                offset += row * rows;
            }

            self.context.run(&self.src, &mut self.dst)?;

            let (y, u, v) = image.planes_mut();
            for (index, (plane, row, rows)) in [(y, w, h), (u, cw, ch), (v, cw, ch)]
                .into_iter()
                .enumerate()
            {
                let stride = self.dst.stride(index);
                let data = self.dst.data(index);
                for r in 0..rows {
                    plane[r * row..(r + 1) * row]
                        .copy_from_slice(&data[r * stride..r * stride + row]);
                }
            }
            Ok(())
        }
    }
}
