use crate::triangulation::sqr_projection_error;
use cv_core::nalgebra::{Point2, Point3};
use cv_core::sample_consensus::Estimator;
use cv_core::{FeatureWorldMatch, WorldToCamera};
use lambda_twist::LambdaTwist;
use log::trace;
use mono_core::{is_object_point_in_front_if, world_point, AnyCamera};
use rand::{seq::index::sample, Rng};

/// The outcome of a successful [`PoseRansac::estimate`].
#[derive(Debug, Clone, PartialEq)]
pub struct PoseRansacResult {
    /// The camera pose as `flippedCamera_T_world`.
    pub flipped_camera_t_world: WorldToCamera,
    /// Indices of the correspondences agreeing with the pose.
    pub inliers: Vec<usize>,
    /// The summed squared pixel error of the inliers.
    pub sqr_error: f64,
}

/// Estimates a camera pose from 2D/3D correspondences with P3P in a RANSAC loop.
///
/// Each iteration draws three distinct correspondences, solves them with [`LambdaTwist`], and scores
/// every candidate by counting correspondences that lie in front of the camera and project within
/// `maximal_sqr_error` pixels. The candidate with the most inliers wins, ties go to the smaller error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseRansac {
    iterations: usize,
    maximal_sqr_error: f64,
    minimal_valid_correspondences: usize,
}

impl PoseRansac {
    /// Creates a `PoseRansac` with default values.
    ///
    /// Same as calling [`Default::default`].
    pub fn new() -> Self {
        Default::default()
    }

    /// Number of random minimal samples.
    ///
    /// Default is `50`.
    #[must_use]
    pub fn iterations(self, iterations: usize) -> Self {
        Self { iterations, ..self }
    }

    /// Maximal squared pixel error of an inlier.
    ///
    /// Default is `3.5 * 3.5`.
    #[must_use]
    pub fn maximal_sqr_error(self, maximal_sqr_error: f64) -> Self {
        Self {
            maximal_sqr_error,
            ..self
        }
    }

    /// Minimal number of inliers a pose needs to be accepted.
    ///
    /// Default is `5`.
    #[must_use]
    pub fn minimal_valid_correspondences(self, minimal_valid_correspondences: usize) -> Self {
        Self {
            minimal_valid_correspondences: minimal_valid_correspondences.max(3),
            ..self
        }
    }

    /// Estimates the pose.
    ///
    /// `object_points` and `image_points` are paired by index. `None` is returned when fewer than three
    /// correspondences are given or no candidate reaches the minimal number of inliers.
    pub fn estimate(
        &self,
        camera: &dyn AnyCamera,
        object_points: &[Point3<f64>],
        image_points: &[Point2<f64>],
        rng: &mut impl Rng,
    ) -> Option<PoseRansacResult> {
        let count = object_points.len().min(image_points.len());
        if count < 3 || count < self.minimal_valid_correspondences {
            return None;
        }

        let solver = LambdaTwist::new();
        let mut best: Option<PoseRansacResult> = None;
        let mut inliers = Vec::with_capacity(count);

        for _ in 0..self.iterations {
            let samples: Vec<FeatureWorldMatch> = sample(rng, count, 3)
                .into_iter()
                .map(|ix| {
                    FeatureWorldMatch(
                        camera.vector_if(image_points[ix]),
                        world_point(&object_points[ix]),
                    )
                })
                .collect();

            for candidate in solver.estimate(samples.iter().copied()) {
                inliers.clear();
                let mut sqr_error = 0.0;
                for (ix, (object_point, image_point)) in
                    object_points.iter().zip(image_points).enumerate()
                {
                    if !is_object_point_in_front_if(&candidate, object_point) {
                        continue;
                    }
                    let error = sqr_projection_error(camera, &candidate, object_point, image_point);
                    if error <= self.maximal_sqr_error {
                        inliers.push(ix);
                        sqr_error += error;
                    }
                }

                let better = match &best {
                    None => true,
                    Some(best) => {
                        inliers.len() > best.inliers.len()
                            || (inliers.len() == best.inliers.len() && sqr_error < best.sqr_error)
                    }
                };
                if better && inliers.len() >= self.minimal_valid_correspondences {
                    best = Some(PoseRansacResult {
                        flipped_camera_t_world: candidate,
                        inliers: inliers.clone(),
                        sqr_error,
                    });
                }
            }

            if best
                .as_ref()
                .map_or(false, |best| best.inliers.len() == count)
            {
                break;
            }
        }

        if let Some(best) = &best {
            trace!(
                "pose ransac found {} of {} inliers with squared error {}",
                best.inliers.len(),
                count,
                best.sqr_error
            );
        }
        best
    }
}

impl Default for PoseRansac {
    fn default() -> Self {
        Self {
            iterations: 50,
            maximal_sqr_error: 3.5 * 3.5,
            minimal_valid_correspondences: 5,
        }
    }
}
