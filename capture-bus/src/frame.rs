use std::fmt::{Display, Formatter};

/// Pixel layouts accepted from the producer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgba8,
    Bgra8,
    Rgb8,
    /// Linear float RGBA, 16 bytes per pixel, values in [0, 1].
    Rgba32F,
    I420,
    Nv12,
}

impl PixelFormat {
    /// Bytes per pixel for packed formats, `None` for planar ones.
    pub fn pixel_size(&self) -> Option<usize> {
        match self {
            PixelFormat::Rgba8 | PixelFormat::Bgra8 => Some(4),
            PixelFormat::Rgb8 => Some(3),
            PixelFormat::Rgba32F => Some(16),
            PixelFormat::I420 | PixelFormat::Nv12 => None,
        }
    }

    /// Size in bytes of one tightly packed frame.
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self.pixel_size() {
            Some(size) => w * h * size,
            None => w * h + 2 * chroma_len(width, height),
        }
    }
}

impl Display for PixelFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        let name = match self {
            PixelFormat::Rgba8 => "rgba8",
            PixelFormat::Bgra8 => "bgra8",
            PixelFormat::Rgb8 => "rgb8",
            PixelFormat::Rgba32F => "rgba32f",
            PixelFormat::I420 => "i420",
            PixelFormat::Nv12 => "nv12",
        };
        f.write_str(name)
    }
}

pub(crate) fn chroma_len(width: u32, height: u32) -> usize {
    (width as usize).div_ceil(2) * (height as usize).div_ceil(2)
}

/// Planar 4:2:0 image, the layout every video encoder consumes.
#[derive(Clone, Debug, Default)]
pub struct I420Image {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl I420Image {
    pub fn new(width: u32, height: u32) -> Self {
        let mut image = Self::default();
        image.resize(width, height);
        image
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        let len = PixelFormat::I420.frame_size(width, height);
        self.data.resize(len, 0);
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn chroma_width(&self) -> usize {
        (self.width as usize).div_ceil(2)
    }

    pub fn chroma_height(&self) -> usize {
        (self.height as usize).div_ceil(2)
    }

    /// Y, U and V planes back to back.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn y(&self) -> &[u8] {
        &self.data[..self.luma_len()]
    }

    pub fn u(&self) -> &[u8] {
        let start = self.luma_len();
        &self.data[start..start + self.chroma_len()]
    }

    pub fn v(&self) -> &[u8] {
        let start = self.luma_len() + self.chroma_len();
        &self.data[start..start + self.chroma_len()]
    }

    pub fn planes_mut(&mut self) -> (&mut [u8], &mut [u8], &mut [u8]) {
        let luma = self.luma_len();
        let chroma = self.chroma_len();
        let (y, rest) = self.data.split_at_mut(luma);
        let (u, v) = rest.split_at_mut(chroma);
        (y, u, &mut v[..chroma])
    }

    fn luma_len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    fn chroma_len(&self) -> usize {
        chroma_len(self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_sizes() {
        assert_eq!(PixelFormat::Rgba8.frame_size(4, 2), 32);
        assert_eq!(PixelFormat::Rgb8.frame_size(4, 2), 24);
        assert_eq!(PixelFormat::Rgba32F.frame_size(2, 2), 64);
        assert_eq!(PixelFormat::I420.frame_size(4, 4), 24);
        // odd dimensions round the chroma planes up
        assert_eq!(PixelFormat::I420.frame_size(3, 3), 9 + 2 * 4);
        assert_eq!(PixelFormat::Nv12.frame_size(4, 4), 24);
    }

    #[test]
    fn test_i420_planes() {
        let mut image = I420Image::new(4, 2);
        assert_eq!(image.y().len(), 8);
        assert_eq!(image.u().len(), 2);
        assert_eq!(image.v().len(), 2);
        let (y, u, v) = image.planes_mut();
        y.fill(1);
        u.fill(2);
        v.fill(3);
        assert_eq!(image.data(), &[1, 1, 1, 1, 1, 1, 1, 1, 2, 2, 3, 3]);
    }
}
