use crate::{Frame, FrameError};
use derive_more::Deref;
use log::*;

/// The smallest width or height of a pyramid layer.
pub const MINIMAL_LAYER_SIZE: u32 = 16;

/// A stack of frames, each half the size of the previous one.
///
/// Layer `0` is the finest layer holding the original resolution.
#[derive(Debug, Clone, Deref)]
pub struct FramePyramid(Vec<Frame>);

impl FramePyramid {
    /// Builds a pyramid with up to `layers` layers.
    ///
    /// Fewer layers are created when a coarser layer would fall below [`MINIMAL_LAYER_SIZE`].
    pub fn new(frame: &Frame, layers: usize) -> Result<Self, FrameError> {
        if layers == 0 {
            return Err(FrameError::NoLayers);
        }
        let mut pyramid = Vec::with_capacity(layers);
        pyramid.push(frame.clone());
        while pyramid.len() < layers {
            let Some(coarser) = pyramid.last().and_then(half_size) else {
                break;
            };
            pyramid.push(coarser);
        }
        if pyramid.len() < layers {
            trace!(
                "a {} x {} frame only supports {} of {} pyramid layers",
                frame.width(),
                frame.height(),
                pyramid.len(),
                layers
            );
        }
        Ok(Self(pyramid))
    }

    /// The number of layers needed to track an offset of `maximal_offset` pixels with a search
    /// radius of `coarsest_layer_radius` pixels in the coarsest layer.
    pub fn ideal_layers(
        width: u32,
        height: u32,
        maximal_offset: u32,
        coarsest_layer_radius: u32,
    ) -> usize {
        let mut layers = 1;
        let mut radius = coarsest_layer_radius.max(1);
        let (mut width, mut height) = (width, height);
        while radius < maximal_offset
            && width / 2 >= MINIMAL_LAYER_SIZE
            && height / 2 >= MINIMAL_LAYER_SIZE
        {
            layers += 1;
            radius *= 2;
            width /= 2;
            height /= 2;
        }
        layers
    }

    pub fn finest(&self) -> &Frame {
        &self.0[0]
    }

    pub fn coarsest(&self) -> &Frame {
        &self.0[self.0.len() - 1]
    }

    pub fn finest_width(&self) -> u32 {
        self.finest().width()
    }

    pub fn finest_height(&self) -> u32 {
        self.finest().height()
    }

    /// Converts a position of the finest layer into the coordinates of `layer`.
    pub fn to_layer(x: f64, y: f64, layer: usize) -> (f64, f64) {
        let scale = f64::from(1u32 << layer);
        ((x + 0.5) / scale - 0.5, (y + 0.5) / scale - 0.5)
    }

    /// Converts a position of `layer` into the coordinates of the finest layer.
    pub fn from_layer(x: f64, y: f64, layer: usize) -> (f64, f64) {
        let scale = f64::from(1u32 << layer);
        ((x + 0.5) * scale - 0.5, (y + 0.5) * scale - 0.5)
    }
}

/// Averages 2 x 2 blocks, dropping the last row and column of odd sized frames.
///
/// Returns `None` when the result would be smaller than [`MINIMAL_LAYER_SIZE`].
pub fn half_size(frame: &Frame) -> Option<Frame> {
    let width = frame.width() / 2;
    let height = frame.height() / 2;
    if width < MINIMAL_LAYER_SIZE || height < MINIMAL_LAYER_SIZE {
        return None;
    }
    let mut half = Frame::new(width, height).ok()?;
    for y in 0..height {
        let top = frame.row(2 * y);
        let bottom = frame.row(2 * y + 1);
        for (x, out) in half.row_mut(y).iter_mut().enumerate() {
            let sum = u16::from(top[2 * x])
                + u16::from(top[2 * x + 1])
                + u16::from(bottom[2 * x])
                + u16::from(bottom[2 * x + 1]);
            *out = ((sum + 2) / 4) as u8;
        }
    }
    Some(half)
}
