use image::{DynamicImage, GrayImage};
use std::fmt;
use thiserror::Error;

/// The errors raised while creating frames and pyramids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("a frame needs a positive size, got {width} x {height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("a {width} x {height} frame with {padding} padding elements needs {expected} bytes, got {actual}")]
    BufferSize {
        width: u32,
        height: u32,
        padding: u32,
        expected: usize,
        actual: usize,
    },
    #[error("a pyramid needs at least one layer")]
    NoLayers,
}

/// A single channel 8 bit frame (`Y8`).
///
/// Rows may be followed by padding elements, so the stride of a row is `width + padding`.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    padding: u32,
    data: Vec<u8>,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("padding", &self.padding)
            .finish()
    }
}

impl Frame {
    /// Creates a black frame without padding.
    pub fn new(width: u32, height: u32) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::InvalidDimensions { width, height });
        }
        Ok(Self {
            width,
            height,
            padding: 0,
            data: vec![0; width as usize * height as usize],
        })
    }

    /// Wraps an existing buffer holding `height` rows of `width + padding` elements.
    ///
    /// The padding of the last row may be omitted.
    pub fn from_raw(width: u32, height: u32, padding: u32, data: Vec<u8>) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::InvalidDimensions { width, height });
        }
        let stride = width as usize + padding as usize;
        let expected = stride * (height as usize - 1) + width as usize;
        if data.len() < expected {
            return Err(FrameError::BufferSize {
                width,
                height,
                padding,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            padding,
            data,
        })
    }

    /// Creates a frame without padding by evaluating `f(x, y)` for every pixel.
    pub fn from_fn(
        width: u32,
        height: u32,
        mut f: impl FnMut(u32, u32) -> u8,
    ) -> Result<Self, FrameError> {
        let mut frame = Self::new(width, height)?;
        for y in 0..height {
            for (x, pixel) in frame.row_mut(y).iter_mut().enumerate() {
                *pixel = f(x as u32, y);
            }
        }
        Ok(frame)
    }

    pub fn from_gray_image(image: &GrayImage) -> Result<Self, FrameError> {
        Self::from_raw(image.width(), image.height(), 0, image.as_raw().clone())
    }

    /// Converts any image into a grayscale frame.
    pub fn from_dynamic(image: &DynamicImage) -> Result<Self, FrameError> {
        Self::from_gray_image(&image.to_luma8())
    }

    /// Copies the frame into an image without padding.
    pub fn to_gray_image(&self) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| {
            image::Luma([self.pixel(x, y)])
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// The number of padding elements at the end of each row.
    pub fn padding(&self) -> u32 {
        self.padding
    }

    /// The number of elements between the starts of two consecutive rows.
    pub fn stride(&self) -> usize {
        self.width as usize + self.padding as usize
    }

    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride();
        &self.data[start..start + self.width as usize]
    }

    pub fn row_mut(&mut self, y: u32) -> &mut [u8] {
        let start = y as usize * self.stride();
        let width = self.width as usize;
        &mut self.data[start..start + width]
    }

    pub fn pixel(&self, x: u32, y: u32) -> u8 {
        self.data[y as usize * self.stride() + x as usize]
    }

    /// Returns whether a sub-pixel position keeps `border` pixels of distance to every frame edge.
    pub fn is_inside(&self, x: f64, y: f64, border: f64) -> bool {
        x >= border
            && y >= border
            && x <= f64::from(self.width) - 1.0 - border
            && y <= f64::from(self.height) - 1.0 - border
    }

    /// Bilinear interpolation at a sub-pixel position, `None` outside of the frame.
    ///
    /// Pixel centers lie at integer coordinates.
    pub fn interpolate(&self, x: f64, y: f64) -> Option<f32> {
        if !self.is_inside(x, y, 0.0) {
            return None;
        }
        Some(self.interpolate_unchecked(x as f32, y as f32))
    }

    /// Bilinear interpolation for positions already known to lie inside the frame.
    pub(crate) fn interpolate_unchecked(&self, x: f32, y: f32) -> f32 {
        let left = (x.floor() as u32).min(self.width - 1);
        let top = (y.floor() as u32).min(self.height - 1);
        let right = (left + 1).min(self.width - 1);
        let bottom = (top + 1).min(self.height - 1);
        let fx = x - left as f32;
        let fy = y - top as f32;

        let stride = self.stride();
        let top_row = &self.data[top as usize * stride..];
        let bottom_row = &self.data[bottom as usize * stride..];
        let upper = f32::from(top_row[left as usize]) * (1.0 - fx) + f32::from(top_row[right as usize]) * fx;
        let lower =
            f32::from(bottom_row[left as usize]) * (1.0 - fx) + f32::from(bottom_row[right as usize]) * fx;
        upper * (1.0 - fy) + lower * fy
    }
}
