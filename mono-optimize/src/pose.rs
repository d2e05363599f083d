use crate::{left_update, robust::weighted, RobustEstimator};
use cv_core::nalgebra::{
    storage::Owned, DVector, Dynamic, IsometryMatrix3, OMatrix, Point2, Point3, Vector6, U6,
};
use cv_core::WorldToCamera;
use levenberg_marquardt::{differentiate_numerically, LeastSquaresProblem, LevenbergMarquardt};
use log::trace;
use mono_core::AnyCamera;

/// Squared pixel error charged for a point behind the camera.
const BEHIND_CAMERA_SQR_ERROR: f64 = 1e6;

/// The result of [`optimize_pose`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseOptimization {
    pub flipped_camera_t_world: WorldToCamera,
    /// The average squared pixel error before the optimization.
    pub initial_sqr_error: f64,
    /// The average squared pixel error after the optimization.
    pub final_sqr_error: f64,
}

/// Returns the squared pixel error of every correspondence.
///
/// Points behind the camera receive an infinite error.
pub fn sqr_errors(
    camera: &dyn AnyCamera,
    flipped_camera_t_world: &WorldToCamera,
    object_points: &[Point3<f64>],
    image_points: &[Point2<f64>],
) -> Vec<f64> {
    object_points
        .iter()
        .zip(image_points)
        .map(|(object_point, image_point)| {
            let camera_point = flipped_camera_t_world.0 * object_point;
            if camera_point.z <= f64::EPSILON {
                f64::INFINITY
            } else {
                (camera.project_if(&camera_point) - image_point).norm_squared()
            }
        })
        .collect()
}

fn average(errors: &[f64]) -> f64 {
    let finite = errors.iter().map(|&e| e.min(BEHIND_CAMERA_SQR_ERROR));
    finite.sum::<f64>() / errors.len().max(1) as f64
}

#[derive(Clone)]
struct PoseProblem<'a> {
    camera: &'a dyn AnyCamera,
    reference: IsometryMatrix3<f64>,
    object_points: &'a [Point3<f64>],
    image_points: &'a [Point2<f64>],
    weights: Vec<f64>,
    delta: Vector6<f64>,
}

impl PoseProblem<'_> {
    fn pose(&self) -> IsometryMatrix3<f64> {
        left_update(&self.delta, &self.reference)
    }
}

impl LeastSquaresProblem<f64, Dynamic, U6> for PoseProblem<'_> {
    type ResidualStorage = Owned<f64, Dynamic>;
    type JacobianStorage = Owned<f64, Dynamic, U6>;
    type ParameterStorage = Owned<f64, U6>;

    fn set_params(&mut self, delta: &Vector6<f64>) {
        self.delta = *delta;
    }

    fn params(&self) -> Vector6<f64> {
        self.delta
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let pose = self.pose();
        let mut residuals = DVector::zeros(2 * self.object_points.len());
        for (ix, ((object_point, image_point), &weight)) in self
            .object_points
            .iter()
            .zip(self.image_points)
            .zip(&self.weights)
            .enumerate()
        {
            let camera_point = pose * object_point;
            let difference = if camera_point.z <= f64::EPSILON {
                let penalty = (0.5 * BEHIND_CAMERA_SQR_ERROR).sqrt();
                cv_core::nalgebra::Vector2::new(penalty, penalty)
            } else {
                self.camera.project_if(&camera_point) - image_point
            };
            residuals[2 * ix] = weighted(difference.x, weight);
            residuals[2 * ix + 1] = weighted(difference.y, weight);
        }
        Some(residuals)
    }

    fn jacobian(&self) -> Option<OMatrix<f64, Dynamic, U6>> {
        let mut problem = self.clone();
        differentiate_numerically(&mut problem)
    }
}

/// Refines a camera pose from 2D/3D correspondences.
///
/// Robust estimators run three rounds, each re-weighting the correspondences based on the current
/// errors before running at most `iterations` Levenberg-Marquardt steps. `sqr_sigma` is the squared
/// pixel error from which the estimator limits the influence of a correspondence. A round is only
/// kept if it lowers the robust error, so the returned pose is never worse than the initial pose.
pub fn optimize_pose(
    camera: &dyn AnyCamera,
    initial: &WorldToCamera,
    object_points: &[Point3<f64>],
    image_points: &[Point2<f64>],
    estimator: RobustEstimator,
    sqr_sigma: f64,
    iterations: usize,
) -> Option<PoseOptimization> {
    let count = object_points.len().min(image_points.len());
    if count < 3 {
        return None;
    }
    let object_points = &object_points[..count];
    let image_points = &image_points[..count];

    let robust_error = |errors: &[f64]| -> f64 {
        errors
            .iter()
            .map(|&error| estimator.error(error.min(BEHIND_CAMERA_SQR_ERROR), sqr_sigma))
            .sum()
    };

    let initial_errors = sqr_errors(camera, initial, object_points, image_points);
    let initial_sqr_error = average(&initial_errors);
    let mut current = *initial;
    let mut current_sqr_error = initial_sqr_error;
    let mut current_robust_error = robust_error(&initial_errors);

    let rounds = if estimator.is_robust() { 3 } else { 1 };
    for _ in 0..rounds {
        let errors = sqr_errors(camera, &current, object_points, image_points);
        let weights = errors
            .iter()
            .map(|&error| estimator.weight(error, sqr_sigma))
            .collect();
        let problem = PoseProblem {
            camera,
            reference: current.0,
            object_points,
            image_points,
            weights,
            delta: Vector6::zeros(),
        };
        let (problem, report) = LevenbergMarquardt::new()
            .with_patience(iterations.max(1))
            .minimize(problem);
        trace!(
            "pose optimization terminated with {:?} after {} evaluations",
            report.termination,
            report.number_of_evaluations
        );

        let candidate = WorldToCamera(problem.pose());
        let candidate_errors = sqr_errors(camera, &candidate, object_points, image_points);
        let candidate_robust_error = robust_error(&candidate_errors);
        if !candidate_robust_error.is_finite() || candidate_robust_error > current_robust_error {
            break;
        }
        current = candidate;
        current_sqr_error = average(&candidate_errors);
        current_robust_error = candidate_robust_error;
    }

    Some(PoseOptimization {
        flipped_camera_t_world: current,
        initial_sqr_error,
        final_sqr_error: current_sqr_error,
    })
}
