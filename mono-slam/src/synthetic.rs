//! Synthetic camera sequences with known ground truth.
//!
//! A [`TexturedPlane`] is a plane at `z = -depth` covered with square cells of random gray values.
//! Every cell corner is a strong corner for the detector, which makes the plane a good target for
//! end-to-end runs of the tracker.

use cv_core::nalgebra::{IsometryMatrix3, Point2, Rotation3, Translation3, Vector3};
use mono_core::AnyCamera;
use mono_image::{Frame, FrameError};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

const BACKGROUND: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TexturedPlane {
    /// The distance of the plane from the world origin along `-z`.
    pub depth: f64,
    /// The side length of one texture cell in world units.
    pub cell_size: f64,
    pub seed: u64,
}

impl TexturedPlane {
    pub fn new(depth: f64, cell_size: f64, seed: u64) -> Self {
        Self {
            depth,
            cell_size,
            seed,
        }
    }

    /// The gray value of the plane at world coordinates `x` and `y`.
    pub fn intensity(&self, x: f64, y: f64) -> u8 {
        let i = (x / self.cell_size).floor() as i64;
        let j = (y / self.cell_size).floor() as i64;
        let mut hash = self.seed ^ 0x9e37_79b9_7f4a_7c15;
        for value in [i as u64, j as u64] {
            hash ^= value.wrapping_mul(0xbf58_476d_1ce4_e5b9);
            hash = (hash ^ (hash >> 31)).wrapping_mul(0x94d0_49bb_1331_11eb);
        }
        20 + (hash % 216) as u8
    }

    /// Renders the plane as seen by a standard camera with the pose `world_t_camera`.
    ///
    /// Every pixel averages four samples.
    pub fn render(
        &self,
        camera: &dyn AnyCamera,
        world_t_camera: &IsometryMatrix3<f64>,
    ) -> Result<Frame, FrameError> {
        let origin = world_t_camera.translation.vector;
        let plane_z = -self.depth;
        let sample = |x: f64, y: f64| -> f64 {
            let direction = world_t_camera.rotation * camera.vector(Point2::new(x, y)).into_inner();
            if direction.z.abs() <= f64::EPSILON {
                return f64::from(BACKGROUND);
            }
            let t = (plane_z - origin.z) / direction.z;
            if t <= 0.0 {
                return f64::from(BACKGROUND);
            }
            let hit = origin + direction * t;
            f64::from(self.intensity(hit.x, hit.y))
        };
        Frame::from_fn(camera.width(), camera.height(), |x, y| {
            let (x, y) = (f64::from(x), f64::from(y));
            let sum = sample(x - 0.25, y - 0.25)
                + sample(x + 0.25, y - 0.25)
                + sample(x - 0.25, y + 0.25)
                + sample(x + 0.25, y + 0.25);
            (sum * 0.25).round() as u8
        })
    }
}

/// A frame of uniform random noise.
pub fn noise_frame(width: u32, height: u32, seed: u64) -> Result<Frame, FrameError> {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    Frame::from_fn(width, height, |_, _| rng.gen())
}

/// Standard camera poses starting at `start` and moving by `step` per frame with a slight sway
/// perpendicular to the motion.
pub fn smooth_trajectory(count: usize, start: Vector3<f64>, step: Vector3<f64>) -> Vec<IsometryMatrix3<f64>> {
    let sway = Vector3::new(-step.y, step.x, 0.0);
    (0..count)
        .map(|ix| {
            let t = ix as f64;
            let position = start + step * t + sway * (t * 0.2).sin();
            let rotation = Rotation3::from_euler_angles(0.01 * (t * 0.15).sin(), 0.01 * (t * 0.1).cos(), 0.0);
            IsometryMatrix3::from_parts(Translation3::from(position), rotation)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mono_core::PinholeCamera;

    #[test]
    fn the_plane_fills_the_view() {
        let camera = PinholeCamera::new(160, 120, 200.0);
        let plane = TexturedPlane::new(3.0, 0.1, 1);
        let frame = plane
            .render(&camera, &IsometryMatrix3::identity())
            .expect("frame");
        assert_eq!((frame.width(), frame.height()), (160, 120));
        let dark = (0..120)
            .flat_map(|y| frame.row(y).iter().copied())
            .filter(|&value| value < 20)
            .count();
        assert_eq!(dark, 0);
    }

    #[test]
    fn looking_away_from_the_plane_shows_the_background() {
        let camera = PinholeCamera::new(160, 120, 200.0);
        let plane = TexturedPlane::new(3.0, 0.1, 1);
        let away = IsometryMatrix3::from_parts(
            Translation3::identity(),
            Rotation3::from_euler_angles(std::f64::consts::PI, 0.0, 0.0),
        );
        let frame = plane.render(&camera, &away).expect("frame");
        assert!((0..120).all(|y| frame.row(y).iter().all(|&value| value == BACKGROUND)));
    }

    #[test]
    fn trajectories_start_at_the_start() {
        let poses = smooth_trajectory(10, Vector3::new(0.5, 0.0, 0.0), Vector3::new(0.05, 0.0, 0.0));
        assert_eq!(poses.len(), 10);
        assert!((poses[0].translation.vector - Vector3::new(0.5, 0.0, 0.0)).norm() < 1e-12);
        assert!(poses[9].translation.vector.x > poses[0].translation.vector.x + 0.4);
    }
}
