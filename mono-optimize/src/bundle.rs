//! Bundle adjustment of keyframe poses and object points.
//!
//! Each iteration linearizes all observations, eliminates the 3x3 point blocks of the normal
//! equations with the Schur complement, solves the reduced camera system with a Cholesky
//! decomposition, and back-substitutes the point updates. Steps are damped Levenberg-Marquardt
//! style and only accepted if they lower the robust error.
//!
//! Optional [`GravityConstraints`] add one rotation residual per pose, weighted relative to the
//! number of observations of the pose.

use crate::{left_update, GravityConstraints, RobustEstimator};
use cv_core::nalgebra::{
    DMatrix, DVector, Matrix2x6, Matrix3, Matrix6, Matrix6x3, Point2, Point3, Vector2, Vector3,
    Vector6,
};
use cv_core::WorldToCamera;
use float_ord::FloatOrd;
use log::{debug, trace};
use mono_core::AnyCamera;

const BEHIND_CAMERA_SQR_ERROR: f64 = 1e6;

/// One observation of an object point in a keyframe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BundleObservation {
    /// Index into the poses.
    pub pose: usize,
    /// Index into the object points.
    pub point: usize,
    pub image_point: Point2<f64>,
}

/// The outcome of a bundle adjustment run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BundleReport {
    /// Average squared pixel error of all observations before the optimization.
    pub initial_sqr_error: f64,
    /// Average squared pixel error of all observations after the optimization.
    pub final_sqr_error: f64,
    /// Number of accepted steps.
    pub iterations: usize,
    /// The largest angle between measured and expected gravity after the optimization, in radians.
    pub gravity_alignment: Option<f64>,
}

/// Jointly refines `flippedCamera_T_world` poses and object points.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleAdjustment {
    iterations: usize,
    fixed_poses: usize,
    estimator: RobustEstimator,
    sqr_sigma: f64,
    gravity: Option<GravityConstraints>,
}

impl BundleAdjustment {
    /// Creates a `BundleAdjustment` with default values.
    ///
    /// Same as calling [`Default::default`].
    pub fn new() -> Self {
        Default::default()
    }

    /// Maximal number of Levenberg-Marquardt steps, including rejected ones.
    ///
    /// Default is `20`.
    #[must_use]
    pub fn iterations(self, iterations: usize) -> Self {
        Self { iterations, ..self }
    }

    /// Number of leading poses which are held fixed.
    ///
    /// Default is `1`, which pins the coordinate system to the first keyframe.
    #[must_use]
    pub fn fixed_poses(self, fixed_poses: usize) -> Self {
        Self {
            fixed_poses,
            ..self
        }
    }

    /// Default is [`RobustEstimator::Square`].
    #[must_use]
    pub fn estimator(self, estimator: RobustEstimator, sqr_sigma: f64) -> Self {
        Self {
            estimator,
            sqr_sigma,
            ..self
        }
    }

    /// Keeps the rotation of every pose close to its measured gravity.
    ///
    /// The constraints need one gravity vector per pose.
    #[must_use]
    pub fn gravity_constraints(self, constraints: GravityConstraints) -> Self {
        Self {
            gravity: Some(constraints),
            ..self
        }
    }

    /// Optimizes the poses and points in place.
    ///
    /// The average squared pixel error after the optimization is never larger than before. If no step
    /// lowers it, the inputs stay untouched. With gravity constraints the combined cost takes the
    /// place of the pixel error. `None` is returned for empty or malformed input.
    pub fn optimize(
        &self,
        camera: &dyn AnyCamera,
        poses: &mut [WorldToCamera],
        points: &mut [Point3<f64>],
        observations: &[BundleObservation],
    ) -> Option<BundleReport> {
        if observations.is_empty()
            || observations
                .iter()
                .any(|o| o.pose >= poses.len() || o.point >= points.len())
        {
            return None;
        }
        if let Some(gravity) = &self.gravity {
            if gravity.len() != poses.len() {
                return None;
            }
        }

        let initial_poses = poses.to_vec();
        let initial_points = points.to_vec();
        let initial_sqr_error = average_sqr_error(camera, poses, points, observations);

        let fixed = self.fixed_poses.min(poses.len());
        let variable = poses.len() - fixed;

        // Observations grouped by point for the Schur complement.
        let mut point_observations = vec![vec![]; points.len()];
        for (ix, observation) in observations.iter().enumerate() {
            point_observations[observation.point].push(ix);
        }

        let mut pose_observations = vec![0usize; poses.len()];
        for observation in observations {
            pose_observations[observation.pose] += 1;
        }
        let focal = camera.focal_length();
        let gravity_weights: Vec<f64> = match &self.gravity {
            Some(gravity) => pose_observations
                .iter()
                .map(|&count| gravity.weight_factor() * count as f64 * focal * focal)
                .collect(),
            None => vec![0.0; poses.len()],
        };

        let initial_cost = self.robust_cost(camera, poses, points, observations, &gravity_weights);
        let mut cost = initial_cost;
        let mut lambda = 1e-4;
        let mut accepted = 0;

        for iteration in 0..self.iterations {
            let system = self.linearize(
                camera,
                poses,
                points,
                observations,
                &gravity_weights,
                fixed,
                variable,
            );
            let step = match solve(
                &system,
                &point_observations,
                observations,
                fixed,
                variable,
                lambda,
            ) {
                Some(step) => step,
                None => {
                    lambda *= 10.0;
                    continue;
                }
            };

            let mut trial_poses = poses.to_vec();
            for (k, pose) in trial_poses.iter_mut().enumerate().skip(fixed) {
                let delta = step.poses.fixed_rows::<6>(6 * (k - fixed)).into_owned();
                pose.0 = left_update(&delta, &pose.0);
            }
            let trial_points: Vec<Point3<f64>> = points
                .iter()
                .zip(&step.points)
                .map(|(point, delta)| point + delta)
                .collect();

            let trial_cost = self.robust_cost(
                camera,
                &trial_poses,
                &trial_points,
                observations,
                &gravity_weights,
            );
            trace!(
                "bundle adjustment iteration {} with lambda {:e}: cost {} -> {}",
                iteration,
                lambda,
                cost,
                trial_cost
            );
            if trial_cost < cost {
                let converged = (cost - trial_cost) <= 1e-12 * cost;
                poses.copy_from_slice(&trial_poses);
                points.copy_from_slice(&trial_points);
                cost = trial_cost;
                lambda = (lambda * 0.1).max(1e-7);
                accepted += 1;
                if converged {
                    break;
                }
            } else {
                lambda *= 10.0;
                if lambda > 1e12 {
                    break;
                }
            }
        }

        let mut final_sqr_error = average_sqr_error(camera, poses, points, observations);
        let regressed = match self.gravity {
            Some(_) => cost > initial_cost,
            None => final_sqr_error > initial_sqr_error,
        };
        if regressed {
            poses.copy_from_slice(&initial_poses);
            points.copy_from_slice(&initial_points);
            final_sqr_error = initial_sqr_error;
            accepted = 0;
        }
        let gravity_alignment = self.gravity.as_ref().and_then(|gravity| {
            poses
                .iter()
                .enumerate()
                .filter_map(|(ix, pose)| gravity.alignment_angle_if(pose, ix))
                .map(FloatOrd)
                .max()
                .map(|FloatOrd(angle)| angle)
        });

        debug!(
            "bundle adjustment of {} poses and {} points: {} -> {} after {} steps",
            poses.len(),
            points.len(),
            initial_sqr_error,
            final_sqr_error,
            accepted
        );

        Some(BundleReport {
            initial_sqr_error,
            final_sqr_error,
            iterations: accepted,
            gravity_alignment,
        })
    }

    fn robust_cost(
        &self,
        camera: &dyn AnyCamera,
        poses: &[WorldToCamera],
        points: &[Point3<f64>],
        observations: &[BundleObservation],
        gravity_weights: &[f64],
    ) -> f64 {
        let reprojection: f64 = observations
            .iter()
            .map(|observation| {
                let error = sqr_error(camera, poses, points, observation);
                self.estimator.error(error, self.sqr_sigma)
            })
            .sum();
        let gravity: f64 = match &self.gravity {
            Some(gravity) => poses
                .iter()
                .zip(gravity_weights)
                .enumerate()
                .filter_map(|(ix, (pose, weight))| {
                    Some(gravity.residual_if(pose, ix)?.norm_squared() * weight)
                })
                .sum(),
            None => 0.0,
        };
        reprojection + gravity
    }

    fn linearize(
        &self,
        camera: &dyn AnyCamera,
        poses: &[WorldToCamera],
        points: &[Point3<f64>],
        observations: &[BundleObservation],
        gravity_weights: &[f64],
        fixed: usize,
        variable: usize,
    ) -> NormalEquations {
        let mut system = NormalEquations {
            pose_pose: DMatrix::zeros(6 * variable, 6 * variable),
            pose_gradient: DVector::zeros(6 * variable),
            point_point: vec![Matrix3::zeros(); points.len()],
            point_gradient: vec![Vector3::zeros(); points.len()],
            pose_point: vec![None; observations.len()],
        };

        for (ix, observation) in observations.iter().enumerate() {
            let pose = &poses[observation.pose];
            let camera_point = pose.0 * points[observation.point];
            if camera_point.z <= f64::EPSILON {
                continue;
            }
            let residual: Vector2<f64> = camera.project_if(&camera_point) - observation.image_point;
            let weight = self
                .estimator
                .weight(residual.norm_squared(), self.sqr_sigma);
            if weight <= 0.0 {
                continue;
            }

            let projection = camera.point_jacobian_if(&camera_point);
            let point_jacobian = projection * pose.0.rotation.matrix();
            system.point_point[observation.point] +=
                point_jacobian.transpose() * point_jacobian * weight;
            system.point_gradient[observation.point] +=
                point_jacobian.transpose() * residual * weight;

            if observation.pose >= fixed {
                let k = observation.pose - fixed;
                let mut pose_jacobian = Matrix2x6::zeros();
                pose_jacobian
                    .fixed_columns_mut::<3>(0)
                    .copy_from(&projection);
                pose_jacobian
                    .fixed_columns_mut::<3>(3)
                    .copy_from(&(-projection * camera_point.coords.cross_matrix()));

                let block: Matrix6<f64> = pose_jacobian.transpose() * pose_jacobian * weight;
                add_block(&mut system.pose_pose, 6 * k, 6 * k, &block);
                let gradient: Vector6<f64> = pose_jacobian.transpose() * residual * weight;
                for r in 0..6 {
                    system.pose_gradient[6 * k + r] += gradient[r];
                }
                system.pose_point[ix] = Some(pose_jacobian.transpose() * point_jacobian * weight);
            }
        }

        if let Some(gravity) = &self.gravity {
            for (ix, pose) in poses.iter().enumerate().skip(fixed) {
                let weight = gravity_weights[ix];
                let residual = match gravity.residual_if(pose, ix) {
                    Some(residual) if weight > 0.0 => residual,
                    _ => continue,
                };
                let jacobian = gravity.jacobian_if(pose);
                let k = ix - fixed;
                let block: Matrix6<f64> = jacobian.transpose() * jacobian * weight;
                add_block(&mut system.pose_pose, 6 * k, 6 * k, &block);
                let gradient: Vector6<f64> = jacobian.transpose() * residual * weight;
                for r in 0..6 {
                    system.pose_gradient[6 * k + r] += gradient[r];
                }
            }
        }

        system
    }
}

impl Default for BundleAdjustment {
    fn default() -> Self {
        Self {
            iterations: 20,
            fixed_poses: 1,
            estimator: RobustEstimator::Square,
            sqr_sigma: 3.5 * 3.5,
            gravity: None,
        }
    }
}

/// The blocks of `J^T W J` and `J^T W r`.
struct NormalEquations {
    pose_pose: DMatrix<f64>,
    pose_gradient: DVector<f64>,
    point_point: Vec<Matrix3<f64>>,
    point_gradient: Vec<Vector3<f64>>,
    /// The 6x3 pose/point block of every observation of a variable pose.
    pose_point: Vec<Option<Matrix6x3<f64>>>,
}

struct Step {
    poses: DVector<f64>,
    points: Vec<Vector3<f64>>,
}

fn add_block<const R: usize, const C: usize>(
    matrix: &mut DMatrix<f64>,
    row: usize,
    column: usize,
    block: &cv_core::nalgebra::SMatrix<f64, R, C>,
) {
    for r in 0..R {
        for c in 0..C {
            matrix[(row + r, column + c)] += block[(r, c)];
        }
    }
}

fn damped<const D: usize>(
    matrix: &cv_core::nalgebra::SMatrix<f64, D, D>,
    lambda: f64,
) -> cv_core::nalgebra::SMatrix<f64, D, D> {
    let mut damped = *matrix;
    for i in 0..D {
        damped[(i, i)] = damped[(i, i)] * (1.0 + lambda) + 1e-9;
    }
    damped
}

fn solve(
    system: &NormalEquations,
    point_observations: &[Vec<usize>],
    observations: &[BundleObservation],
    fixed: usize,
    variable: usize,
    lambda: f64,
) -> Option<Step> {
    let mut reduced = system.pose_pose.clone();
    for i in 0..reduced.nrows() {
        reduced[(i, i)] = reduced[(i, i)] * (1.0 + lambda) + 1e-9;
    }
    let mut rhs = -system.pose_gradient.clone();

    let inverses: Vec<Option<Matrix3<f64>>> = system
        .point_point
        .iter()
        .map(|block| damped(block, lambda).try_inverse())
        .collect();

    for (j, indices) in point_observations.iter().enumerate() {
        let inverse = match inverses[j] {
            Some(inverse) => inverse,
            None => continue,
        };
        for &a in indices {
            let block_a = match system.pose_point[a] {
                Some(block) => block,
                None => continue,
            };
            let ka = observations[a].pose - fixed;
            let weighted: Matrix6x3<f64> = block_a * inverse;
            let correction: Vector6<f64> = weighted * system.point_gradient[j];
            for r in 0..6 {
                rhs[6 * ka + r] += correction[r];
            }
            for &b in indices {
                if let Some(block_b) = system.pose_point[b] {
                    let kb = observations[b].pose - fixed;
                    let product: Matrix6<f64> = weighted * block_b.transpose();
                    add_block(&mut reduced, 6 * ka, 6 * kb, &(-product));
                }
            }
        }
    }

    let poses = if variable == 0 {
        DVector::zeros(0)
    } else {
        reduced.cholesky()?.solve(&rhs)
    };
    if !poses.iter().all(|v| v.is_finite()) {
        return None;
    }

    let points = point_observations
        .iter()
        .enumerate()
        .map(|(j, indices)| {
            let inverse = match inverses[j] {
                Some(inverse) => inverse,
                None => return Vector3::zeros(),
            };
            let mut right = -system.point_gradient[j];
            for &a in indices {
                if let Some(block) = system.pose_point[a] {
                    let k = observations[a].pose - fixed;
                    let delta = poses.fixed_rows::<6>(6 * k);
                    right -= block.transpose() * delta;
                }
            }
            inverse * right
        })
        .collect();

    Some(Step { poses, points })
}

fn sqr_error(
    camera: &dyn AnyCamera,
    poses: &[WorldToCamera],
    points: &[Point3<f64>],
    observation: &BundleObservation,
) -> f64 {
    let camera_point = poses[observation.pose].0 * points[observation.point];
    if camera_point.z <= f64::EPSILON {
        return BEHIND_CAMERA_SQR_ERROR;
    }
    (camera.project_if(&camera_point) - observation.image_point)
        .norm_squared()
        .min(BEHIND_CAMERA_SQR_ERROR)
}

/// The average squared pixel error of all observations.
pub fn average_sqr_error(
    camera: &dyn AnyCamera,
    poses: &[WorldToCamera],
    points: &[Point3<f64>],
    observations: &[BundleObservation],
) -> f64 {
    let sum: f64 = observations
        .iter()
        .map(|observation| sqr_error(camera, poses, points, observation))
        .sum();
    sum / observations.len().max(1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use cv_core::nalgebra::{IsometryMatrix3, Rotation3, Translation3, UnitVector3};
    use mono_core::PinholeCamera;
    use rand::{Rng, SeedableRng};
    use rand_xoshiro::Xoshiro256PlusPlus;

    struct Scene {
        camera: PinholeCamera,
        poses: Vec<WorldToCamera>,
        points: Vec<Point3<f64>>,
        observations: Vec<BundleObservation>,
    }

    fn scene(rng: &mut Xoshiro256PlusPlus) -> Scene {
        let camera = PinholeCamera::new(640, 480, 500.0);
        let poses: Vec<_> = (0..5)
            .map(|i| {
                let i = f64::from(i);
                WorldToCamera(IsometryMatrix3::from_parts(
                    Translation3::new(-0.25 * i, 0.03 * i, 0.02 * i),
                    Rotation3::new(Vector3::new(0.01 * i, 0.04 * i, 0.0)),
                ))
            })
            .collect();
        let points: Vec<_> = (0..80)
            .map(|_| {
                Point3::new(
                    rng.gen_range(-2.0..3.0),
                    rng.gen_range(-1.5..1.5),
                    rng.gen_range(4.0..9.0),
                )
            })
            .collect();
        let mut observations = vec![];
        for (pose_ix, pose) in poses.iter().enumerate() {
            for (point_ix, point) in points.iter().enumerate() {
                observations.push(BundleObservation {
                    pose: pose_ix,
                    point: point_ix,
                    image_point: camera.project_to_image_if(pose, point),
                });
            }
        }
        Scene {
            camera,
            poses,
            points,
            observations,
        }
    }

    fn perturb(scene: &mut Scene, rng: &mut Xoshiro256PlusPlus) {
        for pose in scene.poses.iter_mut().skip(1) {
            let delta = Vector6::from_fn(|i, _| {
                let range = if i < 3 { 0.02 } else { 0.005 };
                rng.gen_range(-range..range)
            });
            pose.0 = left_update(&delta, &pose.0);
        }
        for point in &mut scene.points {
            point.coords += Vector3::from_fn(|_, _| rng.gen_range(-0.05..0.05));
        }
    }

    #[test]
    fn reduces_error_of_perturbed_scene() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(5);
        let mut scene = scene(&mut rng);
        let truth = scene.poses[1];
        perturb(&mut scene, &mut rng);

        let report = BundleAdjustment::new()
            .iterations(30)
            .optimize(
                &scene.camera,
                &mut scene.poses,
                &mut scene.points,
                &scene.observations,
            )
            .unwrap();
        assert!(report.initial_sqr_error > 1.0);
        assert!(report.final_sqr_error < 1e-3);

        // The first pose is fixed, so only the scale of the reconstruction is free.
        let optimized = scene.poses[1].0.translation.vector;
        assert_relative_eq!(
            optimized.normalize(),
            truth.0.translation.vector.normalize(),
            epsilon = 1e-2
        );
    }

    #[test]
    fn never_increases_error_and_is_idempotent() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(9);
        let mut scene = scene(&mut rng);
        perturb(&mut scene, &mut rng);
        for observation in scene.observations.iter_mut().step_by(7) {
            observation.image_point.x += rng.gen_range(-2.0..2.0);
            observation.image_point.y += rng.gen_range(-2.0..2.0);
        }

        let adjustment = BundleAdjustment::new().iterations(40);
        let first = adjustment
            .optimize(
                &scene.camera,
                &mut scene.poses,
                &mut scene.points,
                &scene.observations,
            )
            .unwrap();
        assert!(first.final_sqr_error <= first.initial_sqr_error);

        let poses = scene.poses.clone();
        let second = adjustment
            .optimize(
                &scene.camera,
                &mut scene.poses,
                &mut scene.points,
                &scene.observations,
            )
            .unwrap();
        assert!(second.final_sqr_error <= second.initial_sqr_error);
        assert!((second.final_sqr_error - first.final_sqr_error).abs() < 1e-6);
        for (a, b) in poses.iter().zip(&scene.poses) {
            assert_relative_eq!(a.0.to_homogeneous(), b.0.to_homogeneous(), epsilon = 1e-4);
        }
    }

    #[test]
    fn gravity_keeps_the_poses_upright() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(21);
        let mut scene = scene(&mut rng);
        let world_gravity = -Vector3::y_axis();
        let gravities = scene
            .poses
            .iter()
            .map(|pose| {
                let flipped = pose.0.rotation * world_gravity.into_inner();
                UnitVector3::new_normalize(mono_core::flip_rotation() * flipped)
            })
            .collect();
        let constraints = GravityConstraints::new(gravities, world_gravity, 1.0);
        perturb(&mut scene, &mut rng);
        for observation in &mut scene.observations {
            observation.image_point.x += rng.gen_range(-0.5..0.5);
            observation.image_point.y += rng.gen_range(-0.5..0.5);
        }
        let initial_alignment = scene
            .poses
            .iter()
            .enumerate()
            .map(|(ix, pose)| constraints.alignment_angle_if(pose, ix).unwrap())
            .fold(0.0, f64::max);

        let report = BundleAdjustment::new()
            .iterations(30)
            .gravity_constraints(constraints.clone())
            .optimize(
                &scene.camera,
                &mut scene.poses,
                &mut scene.points,
                &scene.observations,
            )
            .unwrap();
        let alignment = report.gravity_alignment.unwrap();
        assert!(alignment < initial_alignment);
        assert!(alignment < 1e-3);
        assert!(report.final_sqr_error < 1.0);
        for (ix, pose) in scene.poses.iter().enumerate() {
            assert!(constraints.alignment_angle_if(pose, ix).unwrap() <= alignment + 1e-12);
        }
    }

    #[test]
    fn gravity_needs_one_vector_per_pose() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(2);
        let mut scene = scene(&mut rng);
        let constraints = GravityConstraints::new(vec![-Vector3::y_axis()], -Vector3::y_axis(), 1.0);
        assert!(BundleAdjustment::new()
            .gravity_constraints(constraints)
            .optimize(
                &scene.camera,
                &mut scene.poses,
                &mut scene.points,
                &scene.observations
            )
            .is_none());
    }

    #[test]
    fn malformed_observations_are_rejected() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        let mut scene = scene(&mut rng);
        scene.observations[0].point = 1000;
        assert!(BundleAdjustment::new()
            .optimize(
                &scene.camera,
                &mut scene.poses,
                &mut scene.points,
                &scene.observations
            )
            .is_none());
    }
}
