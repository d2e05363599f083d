use crate::LocalizationPrecision;
use crate::PoseQualityCalculator;
use cv_core::nalgebra::{Point2, Point3};
use cv_core::WorldToCamera;
use log::trace;
use mono_core::{AnyCamera, PoseQuality};
use mono_geom::PoseRansac;
use mono_optimize::{optimize_pose, sqr_errors, RobustEstimator};
use rand::Rng;

pub(crate) const POSE_ITERATIONS: usize = 20;
pub(crate) const POSE_RANSAC_ITERATIONS: usize = 50;

/// A camera pose together with the correspondences agreeing with it.
#[derive(Debug, Clone)]
pub(crate) struct PoseEstimate {
    pub(crate) flipped_camera_t_world: WorldToCamera,
    pub(crate) sqr_errors: Vec<f64>,
    pub(crate) inliers: Vec<bool>,
    pub(crate) number_inliers: usize,
    pub(crate) quality: PoseQuality,
}

/// Determines a camera pose from 2D/3D correspondences.
///
/// With an `initial` pose the pose is optimized with a Huber estimator. Without one, or if the
/// optimized pose keeps fewer than `minimal_inliers` inliers, P3P RANSAC determines the pose which
/// is then refined the same way.
#[allow(clippy::too_many_arguments)]
pub(crate) fn estimate_pose(
    camera: &dyn AnyCamera,
    initial: Option<&WorldToCamera>,
    object_points: &[Point3<f64>],
    image_points: &[Point2<f64>],
    precisions: &[LocalizationPrecision],
    sqr_maximal_error: f64,
    minimal_inliers: usize,
    rng: &mut impl Rng,
) -> Option<PoseEstimate> {
    if object_points.len() < minimal_inliers.max(3) {
        return None;
    }
    let count_inliers = |pose: &WorldToCamera| {
        sqr_errors(camera, pose, object_points, image_points)
            .into_iter()
            .filter(|&error| error <= sqr_maximal_error)
            .count()
    };

    let optimized = initial
        .and_then(|initial| {
            optimize_pose(
                camera,
                initial,
                object_points,
                image_points,
                RobustEstimator::Huber,
                sqr_maximal_error,
                POSE_ITERATIONS,
            )
        })
        .map(|optimization| optimization.flipped_camera_t_world)
        .filter(|pose| count_inliers(pose) >= minimal_inliers);

    let flipped_camera_t_world = match optimized {
        Some(pose) => pose,
        None => {
            let ransac = PoseRansac::new()
                .iterations(POSE_RANSAC_ITERATIONS)
                .maximal_sqr_error(sqr_maximal_error)
                .minimal_valid_correspondences(minimal_inliers)
                .estimate(camera, object_points, image_points, rng)?;
            let (inlier_object_points, inlier_image_points): (Vec<_>, Vec<_>) = ransac
                .inliers
                .iter()
                .map(|&ix| (object_points[ix], image_points[ix]))
                .unzip();
            optimize_pose(
                camera,
                &ransac.flipped_camera_t_world,
                &inlier_object_points,
                &inlier_image_points,
                RobustEstimator::Huber,
                sqr_maximal_error,
                POSE_ITERATIONS,
            )
            .map_or(ransac.flipped_camera_t_world, |optimization| {
                optimization.flipped_camera_t_world
            })
        }
    };

    let sqr_errors = sqr_errors(camera, &flipped_camera_t_world, object_points, image_points);
    let inliers: Vec<bool> = sqr_errors
        .iter()
        .map(|&error| error <= sqr_maximal_error)
        .collect();
    let number_inliers = inliers.iter().filter(|&&inlier| inlier).count();
    if number_inliers < minimal_inliers {
        trace!(
            "only {} of {} correspondences agree with the pose, but needed {}",
            number_inliers,
            object_points.len(),
            minimal_inliers
        );
        return None;
    }

    let quality: PoseQualityCalculator = precisions
        .iter()
        .zip(&inliers)
        .filter(|(_, &inlier)| inlier)
        .map(|(&precision, _)| precision)
        .collect();
    let quality = quality.quality();
    if quality == PoseQuality::Invalid {
        return None;
    }

    Some(PoseEstimate {
        flipped_camera_t_world,
        sqr_errors,
        inliers,
        number_inliers,
        quality,
    })
}
