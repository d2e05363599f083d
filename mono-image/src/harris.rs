use crate::Frame;
use cv_core::nalgebra::Point2;
use cv_core::ImagePoint;
use float_ord::FloatOrd;

/// The weight of the squared trace in the Harris vote `det - k * trace^2`.
const HARRIS_K: f32 = 3.0 / 64.0;

/// A Harris corner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HarrisCorner {
    /// The sub-pixel position of the corner in the finest layer.
    pub point: Point2<f64>,
    /// The fourth root of the Harris vote, comparable with the detector threshold.
    pub strength: f64,
}

impl ImagePoint for HarrisCorner {
    fn image_point(&self) -> Point2<f64> {
        self.point
    }
}

/// Detects Harris corners on 8 bit frames.
///
/// Gradients come from a Sobel filter scaled by `1/8`, the structure tensor is summed over a
/// 3 x 3 window and corners are the local maxima of `det - 3/64 * trace^2`. A corner is reported if
/// its vote exceeds `threshold^4`, so that its `strength` exceeds `threshold`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HarrisDetector {
    pub threshold: f64,
    /// Refine the corner positions with a parabola through the neighboring votes.
    pub sub_pixel: bool,
}

impl HarrisDetector {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            sub_pixel: true,
        }
    }

    /// Detects corners in the entire frame, strongest first.
    pub fn detect(&self, frame: &Frame) -> Vec<HarrisCorner> {
        self.detect_in(frame, 0, 0, frame.width(), frame.height())
    }

    /// Detects corners inside a sub-region of the frame, strongest first.
    ///
    /// Corners closer than three pixels to the frame border are never reported.
    pub fn detect_in(
        &self,
        frame: &Frame,
        left: u32,
        top: u32,
        width: u32,
        height: u32,
    ) -> Vec<HarrisCorner> {
        if frame.width() < 10 || frame.height() < 7 {
            return vec![];
        }
        let right = left.saturating_add(width).min(frame.width());
        let bottom = top.saturating_add(height).min(frame.height());

        // Votes need a two pixel border, the maximum suppression one more.
        let vote_left = left.saturating_sub(1).max(2);
        let vote_top = top.saturating_sub(1).max(2);
        let vote_right = (right + 1).min(frame.width() - 2);
        let vote_bottom = (bottom + 1).min(frame.height() - 2);
        if vote_right < vote_left + 3 || vote_bottom < vote_top + 3 {
            return vec![];
        }

        let votes = Votes::new(frame, vote_left, vote_top, vote_right, vote_bottom);
        let threshold = self.threshold.max(0.0).powi(4) as f32;

        let mut corners = vec![];
        for y in (vote_top + 1).max(top)..(vote_bottom - 1).min(bottom) {
            for x in (vote_left + 1).max(left)..(vote_right - 1).min(right) {
                let vote = votes.get(x, y);
                if vote <= threshold || !votes.is_maximum(x, y, vote) {
                    continue;
                }
                let (dx, dy) = if self.sub_pixel {
                    (
                        parabola_peak(votes.get(x - 1, y), vote, votes.get(x + 1, y)),
                        parabola_peak(votes.get(x, y - 1), vote, votes.get(x, y + 1)),
                    )
                } else {
                    (0.0, 0.0)
                };
                corners.push(HarrisCorner {
                    point: Point2::new(f64::from(x) + dx, f64::from(y) + dy),
                    strength: f64::from(vote).powf(0.25),
                });
            }
        }
        corners.sort_unstable_by_key(|corner| std::cmp::Reverse(FloatOrd(corner.strength)));
        corners
    }
}

/// Harris votes of a rectangular block of pixels.
struct Votes {
    left: u32,
    top: u32,
    width: usize,
    votes: Vec<f32>,
}

impl Votes {
    fn new(frame: &Frame, left: u32, top: u32, right: u32, bottom: u32) -> Self {
        // Gradients for the block extended by the 3 x 3 window.
        let gradient_left = left - 1;
        let gradient_top = top - 1;
        let gradient_width = (right - left + 2) as usize;
        let gradient_height = (bottom - top + 2) as usize;
        let mut gradients = Vec::with_capacity(gradient_width * gradient_height);
        for y in gradient_top..gradient_top + gradient_height as u32 {
            let above = frame.row(y - 1);
            let center = frame.row(y);
            let below = frame.row(y + 1);
            for x in gradient_left..gradient_left + gradient_width as u32 {
                let x = x as usize;
                let p = |row: &[u8], x: usize| i32::from(row[x]);
                let gx = (p(above, x + 1) + 2 * p(center, x + 1) + p(below, x + 1))
                    - (p(above, x - 1) + 2 * p(center, x - 1) + p(below, x - 1));
                let gy = (p(below, x - 1) + 2 * p(below, x) + p(below, x + 1))
                    - (p(above, x - 1) + 2 * p(above, x) + p(above, x + 1));
                gradients.push((gx as f32 * 0.125, gy as f32 * 0.125));
            }
        }

        let width = (right - left) as usize;
        let height = (bottom - top) as usize;
        let mut votes = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                let (mut xx, mut yy, mut xy) = (0.0f32, 0.0f32, 0.0f32);
                for wy in y..y + 3 {
                    for &(gx, gy) in &gradients[wy * gradient_width + x..wy * gradient_width + x + 3] {
                        xx += gx * gx;
                        yy += gy * gy;
                        xy += gx * gy;
                    }
                }
                let trace = xx + yy;
                votes.push(xx * yy - xy * xy - HARRIS_K * trace * trace);
            }
        }
        Self {
            left,
            top,
            width,
            votes,
        }
    }

    fn get(&self, x: u32, y: u32) -> f32 {
        self.votes[(y - self.top) as usize * self.width + (x - self.left) as usize]
    }

    /// Strict maximum against the already visited neighbors, non-strict against the others.
    fn is_maximum(&self, x: u32, y: u32, vote: f32) -> bool {
        vote > self.get(x - 1, y - 1)
            && vote > self.get(x, y - 1)
            && vote > self.get(x + 1, y - 1)
            && vote > self.get(x - 1, y)
            && vote >= self.get(x + 1, y)
            && vote >= self.get(x - 1, y + 1)
            && vote >= self.get(x, y + 1)
            && vote >= self.get(x + 1, y + 1)
    }
}

fn parabola_peak(previous: f32, center: f32, next: f32) -> f64 {
    let curvature = previous - 2.0 * center + next;
    if curvature >= 0.0 {
        return 0.0;
    }
    f64::from(0.5 * (previous - next) / curvature).clamp(-0.5, 0.5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn square(size: u32, left: u32, top: u32, side: u32) -> Frame {
        Frame::from_fn(size, size, |x, y| {
            if (left..left + side).contains(&x) && (top..top + side).contains(&y) {
                220
            } else {
                30
            }
        })
        .unwrap()
    }

    #[test]
    fn finds_the_corners_of_a_square() {
        let frame = square(64, 20, 24, 20);
        let corners = HarrisDetector::new(20.0).detect(&frame);
        let expected = [(19.5, 23.5), (39.5, 23.5), (19.5, 43.5), (39.5, 43.5)];
        let near = |corner: &HarrisCorner, (x, y): (f64, f64), distance: f64| {
            (corner.point.x - x).abs() < distance && (corner.point.y - y).abs() < distance
        };
        for &position in &expected {
            assert!(corners.iter().any(|corner| near(corner, position, 1.0)));
        }
        assert!(corners
            .iter()
            .all(|corner| expected.iter().any(|&position| near(corner, position, 2.5))));
        assert!(corners.windows(2).all(|w| w[0].strength >= w[1].strength));
    }

    #[test]
    fn sub_region_limits_the_search() {
        let frame = square(64, 20, 24, 20);
        let corners = HarrisDetector::new(20.0).detect_in(&frame, 0, 0, 32, 32);
        assert!(!corners.is_empty());
        assert_abs_diff_eq!(corners[0].point.x, 19.5, epsilon = 1.0);
        assert_abs_diff_eq!(corners[0].point.y, 23.5, epsilon = 1.0);
        assert!(corners.iter().all(|corner| corner.point.x < 32.0 && corner.point.y < 32.0));
    }

    #[test]
    fn uniform_frames_have_no_corners() {
        let frame = Frame::from_fn(32, 32, |_, _| 128).unwrap();
        assert!(HarrisDetector::new(1.0).detect(&frame).is_empty());
        let tiny = Frame::from_fn(8, 8, |x, _| (x * 30) as u8).unwrap();
        assert!(HarrisDetector::new(1.0).detect(&tiny).is_empty());
    }
}
