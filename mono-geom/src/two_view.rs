//! Relative pose and structure from two views.
//!
//! Motion hypotheses come from two sources: the essential matrix estimated with [`EightPoint`] inside
//! [`Arrsac`], and the decompositions of a homography for scenes that are (nearly) planar, where the
//! essential matrix is degenerate. Every hypothesis is scored by triangulating all correspondences,
//! so the winner is the motion that places the most points in front of both cameras with a small
//! reprojection error.

use crate::homography::{decompose, homography_ransac, normalized};
use crate::statistics::median;
use crate::triangulation::{sqr_projection_error, triangulate_observations, viewing_angle};
use arrsac::Arrsac;
use cv_core::nalgebra::{Point2, Point3};
use cv_core::sample_consensus::Consensus;
use cv_core::{CameraToCamera, FeatureMatch, Pose, WorldToCamera};
use eight_point::EightPoint;
use log::{debug, trace};
use mono_core::AnyCamera;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

/// The reconstruction of two views.
#[derive(Debug, Clone, PartialEq)]
pub struct TwoViewResult {
    /// Transforms points of the first flipped camera into the second flipped camera.
    ///
    /// The translation has unit length.
    pub second_t_first: CameraToCamera,
    /// Indices of the correspondences which could be triangulated.
    pub inliers: Vec<usize>,
    /// The triangulated points of [`TwoViewResult::inliers`] in the first flipped camera frame.
    pub object_points: Vec<Point3<f64>>,
    /// The median angle between the two viewing rays of the inliers in radians.
    pub median_viewing_angle: f64,
}

/// Estimates the relative motion between two frames of the same camera.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TwoViewEstimator {
    maximal_sqr_error: f64,
    minimal_inliers: usize,
    homography_iterations: usize,
}

impl TwoViewEstimator {
    /// Creates a `TwoViewEstimator` with default values.
    ///
    /// Same as calling [`Default::default`].
    pub fn new() -> Self {
        Default::default()
    }

    /// Maximal squared pixel error of a triangulated inlier in both views.
    ///
    /// Default is `3.5 * 3.5`.
    #[must_use]
    pub fn maximal_sqr_error(self, maximal_sqr_error: f64) -> Self {
        Self {
            maximal_sqr_error,
            ..self
        }
    }

    /// Minimal number of inliers of an accepted reconstruction.
    ///
    /// Default is `20`.
    #[must_use]
    pub fn minimal_inliers(self, minimal_inliers: usize) -> Self {
        Self {
            minimal_inliers,
            ..self
        }
    }

    /// Number of RANSAC iterations of the homography hypothesis.
    ///
    /// Default is `100`.
    #[must_use]
    pub fn homography_iterations(self, homography_iterations: usize) -> Self {
        Self {
            homography_iterations,
            ..self
        }
    }

    /// Reconstructs the two views from pixel correspondences `first[i] <-> second[i]`.
    pub fn estimate(
        &self,
        camera: &dyn AnyCamera,
        first: &[Point2<f64>],
        second: &[Point2<f64>],
        rng: &mut impl Rng,
    ) -> Option<TwoViewResult> {
        let count = first.len().min(second.len());
        if count < self.minimal_inliers.max(8) {
            return None;
        }

        let mut candidates = vec![];

        let matches: Vec<FeatureMatch> = first
            .iter()
            .zip(second)
            .map(|(a, b)| FeatureMatch(camera.vector_if(*a), camera.vector_if(*b)))
            .collect();
        let angular_error = self.maximal_sqr_error.sqrt() / camera.focal_length();
        let mut arrsac = Arrsac::new(
            0.5 * angular_error * angular_error,
            Xoshiro256PlusPlus::seed_from_u64(rng.gen()),
        );
        if let Some(essential) = arrsac.model(&EightPoint::new(), matches.iter().copied()) {
            candidates.push(essential);
        }

        let pairs: Vec<_> = matches
            .iter()
            .filter_map(|FeatureMatch(a, b)| Some((normalized(a)?, normalized(b)?)))
            .collect();
        let normalized_sqr_error = angular_error * angular_error;
        if let Some((homography, inliers)) = homography_ransac(
            &pairs,
            self.homography_iterations,
            normalized_sqr_error,
            rng,
        ) {
            if inliers.len() >= self.minimal_inliers {
                candidates.extend(decompose(&homography));
            }
        }

        trace!("two view estimation scores {} motion hypotheses", candidates.len());

        let mut best: Option<(TwoViewResult, f64)> = None;
        for candidate in candidates {
            if let Some((result, sqr_error)) = self.score(camera, first, second, candidate) {
                let better = best.as_ref().map_or(true, |(best, best_error)| {
                    result.inliers.len() > best.inliers.len()
                        || (result.inliers.len() == best.inliers.len() && sqr_error < *best_error)
                });
                if better {
                    best = Some((result, sqr_error));
                }
            }
        }

        let (result, _) = best?;
        if result.inliers.len() < self.minimal_inliers {
            debug!(
                "two view reconstruction has only {} of {} required inliers",
                result.inliers.len(),
                self.minimal_inliers
            );
            return None;
        }
        Some(result)
    }

    /// Triangulates every correspondence with a motion hypothesis.
    fn score(
        &self,
        camera: &dyn AnyCamera,
        first: &[Point2<f64>],
        second: &[Point2<f64>],
        second_t_first: CameraToCamera,
    ) -> Option<(TwoViewResult, f64)> {
        let translation = second_t_first.isometry().translation.vector;
        let norm = translation.norm();
        if norm <= f64::EPSILON {
            return None;
        }
        let second_t_first = CameraToCamera::from_parts(
            translation / norm,
            second_t_first.isometry().rotation,
        );

        let first_pose = WorldToCamera::identity();
        let second_pose = WorldToCamera(second_t_first.isometry());
        let first_center = Point3::origin();
        let second_center = second_pose.isometry().inverse() * Point3::origin();

        let mut inliers = vec![];
        let mut object_points = vec![];
        let mut angles = vec![];
        let mut total_sqr_error = 0.0;
        for (ix, (a, b)) in first.iter().zip(second).enumerate() {
            let point = match triangulate_observations([
                (first_pose, camera.vector_if(*a)),
                (second_pose, camera.vector_if(*b)),
            ]) {
                Some(point) => point,
                None => continue,
            };
            if point.z <= f64::EPSILON || (second_pose.isometry() * point).z <= f64::EPSILON {
                continue;
            }
            let error_a = sqr_projection_error(camera, &first_pose, &point, a);
            let error_b = sqr_projection_error(camera, &second_pose, &point, b);
            if error_a > self.maximal_sqr_error || error_b > self.maximal_sqr_error {
                continue;
            }
            inliers.push(ix);
            object_points.push(point);
            angles.push(viewing_angle(&first_center, &second_center, &point));
            total_sqr_error += error_a + error_b;
        }

        let median_viewing_angle = median(&mut angles)?;
        Some((
            TwoViewResult {
                second_t_first,
                inliers,
                object_points,
                median_viewing_angle,
            },
            total_sqr_error,
        ))
    }
}

impl Default for TwoViewEstimator {
    fn default() -> Self {
        Self {
            maximal_sqr_error: 3.5 * 3.5,
            minimal_inliers: 20,
            homography_iterations: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use cv_core::nalgebra::{IsometryMatrix3, Rotation3, Translation3, Vector3};
    use mono_core::PinholeCamera;

    fn views(
        camera: &PinholeCamera,
        motion: &IsometryMatrix3<f64>,
        points: &[Point3<f64>],
    ) -> (Vec<Point2<f64>>, Vec<Point2<f64>>) {
        points
            .iter()
            .map(|point| {
                (
                    camera.project_if(point),
                    camera.project_if(&(motion * point)),
                )
            })
            .unzip()
    }

    fn check_motion(result: &TwoViewResult, motion: &IsometryMatrix3<f64>) {
        let isometry = result.second_t_first.isometry();
        assert_relative_eq!(
            isometry.rotation.matrix(),
            motion.rotation.matrix(),
            epsilon = 1e-3
        );
        assert_relative_eq!(
            isometry.translation.vector,
            motion.translation.vector.normalize(),
            epsilon = 1e-2
        );
    }

    #[test]
    fn general_scene() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
        let camera = PinholeCamera::new(640, 480, 500.0);
        let motion = IsometryMatrix3::from_parts(
            Translation3::new(-0.5, 0.05, 0.1),
            Rotation3::new(Vector3::new(0.01, 0.08, 0.0)),
        );
        let points: Vec<_> = (0..120)
            .map(|_| {
                Point3::new(
                    rng.gen_range(-2.0..2.0),
                    rng.gen_range(-1.5..1.5),
                    rng.gen_range(3.0..9.0),
                )
            })
            .collect();
        let (first, second) = views(&camera, &motion, &points);

        let result = TwoViewEstimator::new()
            .estimate(&camera, &first, &second, &mut rng)
            .unwrap();
        assert!(result.inliers.len() >= 115);
        check_motion(&result, &motion);
        assert!(result.median_viewing_angle > 1f64.to_radians());
    }

    #[test]
    fn planar_scene() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(8);
        let camera = PinholeCamera::new(640, 480, 500.0);
        let motion = IsometryMatrix3::from_parts(
            Translation3::new(0.4, -0.05, 0.0),
            Rotation3::new(Vector3::new(0.0, -0.05, 0.01)),
        );
        let points: Vec<_> = (0..100)
            .map(|_| Point3::new(rng.gen_range(-2.0..2.0), rng.gen_range(-1.5..1.5), 5.0))
            .collect();
        let (first, second) = views(&camera, &motion, &points);

        let result = TwoViewEstimator::new()
            .estimate(&camera, &first, &second, &mut rng)
            .unwrap();
        assert_eq!(result.inliers.len(), 100);
        // A plane may be explained by two motions, both must reproject exactly.
        let second_pose = WorldToCamera(result.second_t_first.isometry());
        for (&ix, point) in result.inliers.iter().zip(&result.object_points) {
            assert!(sqr_projection_error(&camera, &WorldToCamera::identity(), point, &first[ix]) < 1e-4);
            assert!(sqr_projection_error(&camera, &second_pose, point, &second[ix]) < 1e-4);
        }
    }

    #[test]
    fn not_enough_correspondences() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0);
        let camera = PinholeCamera::new(640, 480, 500.0);
        let points = vec![Point2::new(10.0, 10.0); 10];
        assert!(TwoViewEstimator::new()
            .estimate(&camera, &points, &points, &mut rng)
            .is_none());
    }
}
