//! Frame buffer shared by the still-image and live-camera paths.
//!
use image::{ImageBuffer, Rgb, RgbImage};

/// Fallback width when the source reports no usable dimensions.
pub const DEFAULT_WIDTH: u32 = 640;
/// Fallback height when the source reports no usable dimensions.
pub const DEFAULT_HEIGHT: u32 = 480;

/// Reusable RGB8 raster holding the currently-normalized visual frame.
///
/// One buffer serves every classification request; `normalize` fully
/// overwrites it each time, so the classifier never sees a stale or torn
/// frame. The backing vector keeps its capacity across calls.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Redraw the buffer from `frame`, sized to the source's native
    /// dimensions.
    ///
    /// `native` is what the source claims its intrinsic size is; zero or
    /// missing dimensions fall back to 640x480, mirroring a camera whose
    /// metadata has not arrived yet. The whole source frame is drawn scaled
    /// to fill the buffer. Sampling is nearest-neighbor; the classifier
    /// resamples to its own input size anyway.
    pub fn normalize(&mut self, frame: &RgbImage, native: Option<(u32, u32)>) {
        let (width, height) = match native {
            Some((w, h)) if w > 0 && h > 0 => (w, h),
            _ => (DEFAULT_WIDTH, DEFAULT_HEIGHT),
        };
        self.width = width;
        self.height = height;
        self.pixels.clear();

        let (src_width, src_height) = frame.dimensions();
        if (src_width, src_height) == (width, height) {
            self.pixels.extend_from_slice(frame.as_raw());
            return;
        }

        let len = width as usize * height as usize * 3;
        if src_width == 0 || src_height == 0 {
            self.pixels.resize(len, 0);
            return;
        }

        self.pixels.reserve(len);
        for y in 0..height {
            let src_y = (y as u64 * src_height as u64 / height as u64) as u32;
            for x in 0..width {
                let src_x = (x as u64 * src_width as u64 / width as u64) as u32;
                let pixel = frame.get_pixel(src_x, src_y);
                self.pixels.extend_from_slice(&pixel.0);
            }
        }
    }

    /// Borrow the buffer contents as an image without copying.
    pub fn as_view(&self) -> ImageBuffer<Rgb<u8>, &[u8]> {
        ImageBuffer::from_raw(self.width, self.height, self.pixels.as_slice())
            .expect("frame buffer dimensions out of sync with pixel data")
    }
}
