use crate::{Frame, FramePyramid};
use cv_core::nalgebra::Point2;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// The search radius in every layer but the coarsest one.
const REFINEMENT_RADIUS: i32 = 2;

/// Tracks points from one frame pyramid into the next with zero-mean SSD patch matching.
///
/// Every point is searched in the coarsest layer within `coarsest_layer_radius` pixels around its
/// prediction, then refined within two pixels in each finer layer and finally with
/// `sub_pixel_iterations` sub-pixel steps, so that the precision is `0.5^sub_pixel_iterations`
/// pixels. A point is only accepted if tracking it back into the previous pyramid ends within
/// `bidirectional_tolerance` pixels of its start.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PatchTracker {
    /// The edge length of the square patch, one of 5, 7, 15 or 31.
    pub patch_size: u32,
    pub sub_pixel_iterations: u32,
    pub coarsest_layer_radius: u32,
    /// The maximal distance between a point and its tracked position, in pixels.
    pub maximal_offset: f64,
    /// The maximal zero-mean SSD per patch pixel.
    pub maximal_sqr_patch_error: f32,
    pub bidirectional_tolerance: f64,
}

impl Default for PatchTracker {
    fn default() -> Self {
        Self {
            patch_size: 7,
            sub_pixel_iterations: 2,
            coarsest_layer_radius: 4,
            maximal_offset: 64.0,
            maximal_sqr_patch_error: 400.0,
            bidirectional_tolerance: 0.9,
        }
    }
}

/// The patch sizes a [`PatchTracker`] supports.
pub const PATCH_SIZES: [u32; 4] = [5, 7, 15, 31];

impl PatchTracker {
    pub fn is_valid(&self) -> bool {
        PATCH_SIZES.contains(&self.patch_size)
            && self.coarsest_layer_radius >= 1
            && self.maximal_offset > 0.0
            && self.maximal_sqr_patch_error > 0.0
            && self.bidirectional_tolerance > 0.0
    }

    /// Tracks `points` from `previous` into `current`.
    ///
    /// `predictions` optionally holds a rough position of every point in `current`, otherwise
    /// the previous positions are used. The result holds a position for every point which could be
    /// tracked reliably.
    pub fn track(
        &self,
        previous: &FramePyramid,
        current: &FramePyramid,
        points: &[Point2<f64>],
        predictions: Option<&[Point2<f64>]>,
    ) -> Vec<Option<Point2<f64>>> {
        let layers = previous.len().min(current.len());
        let track_one = |(ix, point): (usize, &Point2<f64>)| {
            let prediction = predictions.and_then(|p| p.get(ix)).unwrap_or(point);
            let forward = self.track_point(previous, current, layers, point, prediction)?;
            if (forward - point).norm() > self.maximal_offset {
                return None;
            }
            let backward = self.track_point(current, previous, layers, &forward, point)?;
            if (backward - point).norm() > self.bidirectional_tolerance {
                return None;
            }
            Some(forward)
        };

        #[cfg(not(feature = "rayon"))]
        {
            points.iter().enumerate().map(track_one).collect()
        }
        #[cfg(feature = "rayon")]
        {
            points.par_iter().enumerate().map(track_one).collect()
        }
    }

    /// Tracks a single point without the bidirectional check.
    fn track_point(
        &self,
        source: &FramePyramid,
        target: &FramePyramid,
        layers: usize,
        point: &Point2<f64>,
        prediction: &Point2<f64>,
    ) -> Option<Point2<f64>> {
        let half = f64::from(self.patch_size / 2);

        // Start in the coarsest layer which still holds the patch.
        let mut start_layer = layers - 1;
        loop {
            let (x, y) = FramePyramid::to_layer(point.x, point.y, start_layer);
            if source[start_layer].is_inside(x, y, half + 1.0) {
                break;
            }
            if start_layer == 0 {
                return None;
            }
            start_layer -= 1;
        }

        let (mut x, mut y) = FramePyramid::to_layer(prediction.x, prediction.y, start_layer);
        let mut best_error = f32::INFINITY;
        for layer in (0..=start_layer).rev() {
            let (px, py) = FramePyramid::to_layer(point.x, point.y, layer);
            let patch = Patch::new(&source[layer], px, py, self.patch_size)?;
            if layer != start_layer {
                x = 2.0 * x + 0.5;
                y = 2.0 * y + 0.5;
            }
            let radius = if layer == start_layer {
                self.coarsest_layer_radius as i32
            } else {
                REFINEMENT_RADIUS
            };
            let (bx, by, error) = patch.search(&target[layer], x, y, radius, 1.0)?;
            x = bx;
            y = by;
            best_error = error;
        }

        let patch = Patch::new(&source[0], point.x, point.y, self.patch_size)?;
        let mut step = 0.5;
        for _ in 0..self.sub_pixel_iterations {
            if let Some((bx, by, error)) = patch.search(&target[0], x, y, 1, step) {
                if error <= best_error {
                    x = bx;
                    y = by;
                    best_error = error;
                }
            }
            step *= 0.5;
        }

        let pixels = (self.patch_size * self.patch_size) as f32;
        (best_error / pixels <= self.maximal_sqr_patch_error).then(|| Point2::new(x, y))
    }
}

/// The zero-mean intensities of a patch.
struct Patch {
    size: u32,
    values: Vec<f32>,
}

impl Patch {
    fn new(frame: &Frame, x: f64, y: f64, size: u32) -> Option<Self> {
        let half = f64::from(size / 2);
        if !frame.is_inside(x, y, half) {
            return None;
        }
        let mut values = Self::sample(frame, x as f32, y as f32, size);
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        for value in &mut values {
            *value -= mean;
        }
        Some(Self { size, values })
    }

    fn sample(frame: &Frame, x: f32, y: f32, size: u32) -> Vec<f32> {
        let half = (size / 2) as f32;
        let mut values = Vec::with_capacity((size * size) as usize);
        for row in 0..size {
            for column in 0..size {
                values.push(frame.interpolate_unchecked(
                    x - half + column as f32,
                    y - half + row as f32,
                ));
            }
        }
        values
    }

    /// The zero-mean SSD against the patch centered at `(x, y)` in `frame`.
    fn error(&self, frame: &Frame, x: f64, y: f64) -> Option<f32> {
        let half = f64::from(self.size / 2);
        if !frame.is_inside(x, y, half) {
            return None;
        }
        let values = Self::sample(frame, x as f32, y as f32, self.size);
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        Some(
            self.values
                .iter()
                .zip(&values)
                .map(|(a, b)| {
                    let d = a - (b - mean);
                    d * d
                })
                .sum(),
        )
    }

    /// Finds the best offset within `radius` steps of `step` pixels around `(x, y)`.
    fn search(&self, frame: &Frame, x: f64, y: f64, radius: i32, step: f64) -> Option<(f64, f64, f32)> {
        let mut best: Option<(f64, f64, f32)> = None;
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                let cx = x + f64::from(dx) * step;
                let cy = y + f64::from(dy) * step;
                if let Some(error) = self.error(frame, cx, cy) {
                    // Ties keep the candidate closest to the prediction.
                    let closer = best.map_or(true, |(_, _, best_error)| {
                        error < best_error
                            || (error == best_error && dx == 0 && dy == 0)
                    });
                    if closer {
                        best = Some((cx, cy, error));
                    }
                }
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_xoshiro::Xoshiro256PlusPlus;

    /// Smooth random blobs shifted by `(shift_x, shift_y)`.
    fn blobs(width: u32, height: u32, shift_x: f64, shift_y: f64) -> Frame {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(3);
        let blobs: Vec<(f64, f64, f64, f64)> = (0..400)
            .map(|_| {
                (
                    rng.gen_range(-10.0..f64::from(width) + 10.0),
                    rng.gen_range(-10.0..f64::from(height) + 10.0),
                    rng.gen_range(2.0..6.0),
                    rng.gen_range(-90.0..90.0),
                )
            })
            .collect();
        Frame::from_fn(width, height, |x, y| {
            let x = f64::from(x) - shift_x;
            let y = f64::from(y) - shift_y;
            let value: f64 = blobs
                .iter()
                .filter(|(bx, by, r, _)| (bx - x).abs() < 3.0 * r && (by - y).abs() < 3.0 * r)
                .map(|(bx, by, r, a)| a * (-((bx - x).powi(2) + (by - y).powi(2)) / (r * r)).exp())
                .sum();
            (128.0 + value).clamp(0.0, 255.0) as u8
        })
        .unwrap()
    }

    #[test]
    fn tracks_a_shifted_frame() {
        let previous = FramePyramid::new(&blobs(160, 120, 0.0, 0.0), 3).unwrap();
        let current = FramePyramid::new(&blobs(160, 120, 6.25, -3.5), 3).unwrap();
        let points: Vec<_> = (0..5)
            .flat_map(|i| (0..4).map(move |j| Point2::new(30.0 + 25.0 * f64::from(i), 30.0 + 20.0 * f64::from(j))))
            .collect();
        let tracker = PatchTracker {
            patch_size: 15,
            sub_pixel_iterations: 3,
            ..PatchTracker::default()
        };
        let tracked = tracker.track(&previous, &current, &points, None);
        let valid: Vec<_> = points
            .iter()
            .zip(&tracked)
            .filter_map(|(point, tracked)| Some((point, (*tracked)?)))
            .collect();
        assert!(valid.len() >= 15, "only {} points tracked", valid.len());
        for (point, tracked) in valid {
            assert!((tracked.x - point.x - 6.25).abs() < 0.5);
            assert!((tracked.y - point.y + 3.5).abs() < 0.5);
        }
    }

    #[test]
    fn unrelated_frames_are_rejected() {
        let previous = FramePyramid::new(&blobs(160, 120, 0.0, 0.0), 3).unwrap();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(9);
        let noise = Frame::from_fn(160, 120, |_, _| rng.gen()).unwrap();
        let current = FramePyramid::new(&noise, 3).unwrap();
        let points = [Point2::new(50.0, 50.0), Point2::new(100.0, 60.0), Point2::new(80.0, 80.0)];
        let tracked = PatchTracker::default().track(&previous, &current, &points, None);
        assert!(tracked.iter().all(Option::is_none));
    }

    #[test]
    fn points_at_the_border_are_dropped() {
        let frame = FramePyramid::new(&blobs(64, 64, 0.0, 0.0), 2).unwrap();
        let tracked = PatchTracker::default().track(&frame, &frame, &[Point2::new(1.0, 1.0)], None);
        assert_eq!(tracked, vec![None]);
    }
}
