//! Multi-view triangulation.
//!
//! The triangulator follows the Linear-Eigen method by Hartley and Sturm in the paper
//! ["Triangulation"](https://users.cecs.anu.edu.au/~hartley/Papers/triangulation/triangulation.pdf).
//! Each observation contributes the constraint that the transformed point is parallel to the
//! observed bearing, which gives a 4x4 symmetric system whose null space is the homogeneous point.

use cv_core::nalgebra::{zero, Matrix3x4, Matrix4, Point2, Point3, UnitVector3, Vector3};
use cv_core::{Pose, WorldToCamera};
use float_ord::FloatOrd;
use mono_core::{is_object_point_in_front_if, AnyCamera};
use rand::{seq::index::sample, Rng};

/// Triangulates a world point from bearings observed by cameras with known `flippedCamera_T_world` poses.
///
/// At least two observations are required. `None` is returned if the system is degenerate or the
/// point would lie at infinity.
pub fn triangulate_observations(
    observations: impl IntoIterator<Item = (WorldToCamera, UnitVector3<f64>)>,
) -> Option<Point3<f64>> {
    let mut count = 0usize;
    let mut a: Matrix4<f64> = zero();
    for (pose, bearing) in observations {
        let bearing = bearing.into_inner();
        let rot = pose.0.rotation.matrix();
        let trans = pose.0.translation.vector;
        let pose = Matrix3x4::<f64>::from_columns(&[
            rot.column(0),
            rot.column(1),
            rot.column(2),
            trans.column(0),
        ]);
        let term = pose - bearing * bearing.transpose() * pose;
        a += term.transpose() * term;
        count += 1;
    }
    if count < 2 {
        return None;
    }

    let se = a.try_symmetric_eigen(1e-12, 1000)?;

    se.eigenvalues
        .iter()
        .enumerate()
        .min_by_key(|&(_, &n)| FloatOrd(n))
        .map(|(ix, _)| se.eigenvectors.column(ix).into_owned())
        .and_then(Point3::from_homogeneous)
        .filter(|point| point.iter().all(|n| n.is_finite()))
}

/// Triangulates a world point from image points, checking that it lies in front of every camera.
pub fn triangulate_image_points(
    camera: &dyn AnyCamera,
    observations: &[(WorldToCamera, Point2<f64>)],
) -> Option<Point3<f64>> {
    let point = triangulate_observations(
        observations
            .iter()
            .map(|(pose, image_point)| (*pose, camera.vector_if(*image_point))),
    )?;
    observations
        .iter()
        .all(|(pose, _)| is_object_point_in_front_if(pose, &point))
        .then(|| point)
}

/// Triangulates a world point from observations which may contain outliers.
///
/// Every iteration triangulates two random observations and counts the observations that see the
/// point in front of the camera within `maximal_sqr_error` pixels. The winning point is
/// re-triangulated from all of its inliers. Returns the point and the indices of the inliers, which
/// are never fewer than two.
pub fn triangulate_ransac(
    camera: &dyn AnyCamera,
    observations: &[(WorldToCamera, Point2<f64>)],
    iterations: usize,
    maximal_sqr_error: f64,
    rng: &mut impl Rng,
) -> Option<(Point3<f64>, Vec<usize>)> {
    if observations.len() < 2 {
        return None;
    }
    let inliers_of = |point: &Point3<f64>| -> (Vec<usize>, f64) {
        let mut inliers = vec![];
        let mut sqr_error = 0.0;
        for (ix, (pose, image_point)) in observations.iter().enumerate() {
            if !is_object_point_in_front_if(pose, point) {
                continue;
            }
            let error = sqr_projection_error(camera, pose, point, image_point);
            if error <= maximal_sqr_error {
                inliers.push(ix);
                sqr_error += error;
            }
        }
        (inliers, sqr_error)
    };

    let mut best: Option<(Point3<f64>, Vec<usize>, f64)> = None;
    for _ in 0..iterations.max(1) {
        let pair = sample(rng, observations.len(), 2);
        let candidate = match triangulate_image_points(
            camera,
            &[observations[pair.index(0)], observations[pair.index(1)]],
        ) {
            Some(candidate) => candidate,
            None => continue,
        };
        let (inliers, sqr_error) = inliers_of(&candidate);
        let better = best.as_ref().map_or(true, |(_, best_inliers, best_error)| {
            inliers.len() > best_inliers.len()
                || (inliers.len() == best_inliers.len() && sqr_error < *best_error)
        });
        if better && inliers.len() >= 2 {
            let done = inliers.len() == observations.len();
            best = Some((candidate, inliers, sqr_error));
            if done {
                break;
            }
        }
    }

    let (point, inliers, _) = best?;
    let subset: Vec<_> = inliers.iter().map(|&ix| observations[ix]).collect();
    match triangulate_image_points(camera, &subset) {
        Some(refined) => {
            let (refined_inliers, _) = inliers_of(&refined);
            if refined_inliers.len() >= inliers.len() {
                return Some((refined, refined_inliers));
            }
            Some((point, inliers))
        }
        None => Some((point, inliers)),
    }
}

/// The squared projection error of a world point in pixels.
pub fn sqr_projection_error(
    camera: &dyn AnyCamera,
    flipped_camera_t_world: &WorldToCamera,
    world_point: &Point3<f64>,
    image_point: &Point2<f64>,
) -> f64 {
    (camera.project_to_image_if(flipped_camera_t_world, world_point) - image_point).norm_squared()
}

/// The center of a camera in world coordinates given its `flippedCamera_T_world` pose.
pub fn camera_center(flipped_camera_t_world: &WorldToCamera) -> Point3<f64> {
    flipped_camera_t_world.isometry().inverse() * Point3::origin()
}

/// The angle in radians between the rays from two camera centers towards a world point.
pub fn viewing_angle(
    center_a: &Point3<f64>,
    center_b: &Point3<f64>,
    world_point: &Point3<f64>,
) -> f64 {
    let a: Vector3<f64> = center_a - world_point;
    let b: Vector3<f64> = center_b - world_point;
    let norms = a.norm() * b.norm();
    if norms <= f64::EPSILON {
        return 0.0;
    }
    (a.dot(&b) / norms).clamp(-1.0, 1.0).acos()
}

/// The angle in radians between two bearings.
pub fn bearing_angle(a: &UnitVector3<f64>, b: &UnitVector3<f64>) -> f64 {
    a.dot(b).clamp(-1.0, 1.0).acos()
}
