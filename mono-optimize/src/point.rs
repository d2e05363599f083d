use crate::{robust::weighted, RobustEstimator};
use cv_core::nalgebra::{
    storage::Owned, Const, DVector, Dynamic, OMatrix, Point2, Point3, Vector3, U3,
};
use cv_core::WorldToCamera;
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use mono_core::AnyCamera;

/// The result of [`optimize_point`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointOptimization {
    pub point: Point3<f64>,
    /// The average squared pixel error before the optimization.
    pub initial_sqr_error: f64,
    /// The average squared pixel error after the optimization.
    pub final_sqr_error: f64,
}

#[derive(Clone)]
struct PointProblem<'a> {
    camera: &'a dyn AnyCamera,
    observations: &'a [(WorldToCamera, Point2<f64>)],
    weights: Vec<f64>,
    point: Vector3<f64>,
}

impl LeastSquaresProblem<f64, Dynamic, U3> for PointProblem<'_> {
    type ResidualStorage = Owned<f64, Dynamic>;
    type JacobianStorage = Owned<f64, Dynamic, U3>;
    type ParameterStorage = Owned<f64, U3>;

    fn set_params(&mut self, point: &Vector3<f64>) {
        self.point = *point;
    }

    fn params(&self) -> Vector3<f64> {
        self.point
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let point = Point3::from(self.point);
        let mut residuals = DVector::zeros(2 * self.observations.len());
        for (ix, ((pose, image_point), &weight)) in
            self.observations.iter().zip(&self.weights).enumerate()
        {
            let camera_point = pose.0 * point;
            if camera_point.z <= f64::EPSILON {
                return None;
            }
            let difference = self.camera.project_if(&camera_point) - image_point;
            residuals[2 * ix] = weighted(difference.x, weight);
            residuals[2 * ix + 1] = weighted(difference.y, weight);
        }
        Some(residuals)
    }

    fn jacobian(&self) -> Option<OMatrix<f64, Dynamic, U3>> {
        let point = Point3::from(self.point);
        let rows = Dynamic::new(2 * self.observations.len());
        let mut jacobian = OMatrix::<f64, Dynamic, U3>::zeros_generic(rows, Const::<3>);
        for (ix, ((pose, _), &weight)) in self.observations.iter().zip(&self.weights).enumerate() {
            let camera_point = pose.0 * point;
            if camera_point.z <= f64::EPSILON {
                return None;
            }
            let block = self.camera.point_jacobian_if(&camera_point) * pose.0.rotation.matrix()
                * weight.sqrt();
            jacobian.fixed_rows_mut::<2>(2 * ix).copy_from(&block);
        }
        Some(jacobian)
    }
}

fn average_sqr_error(
    camera: &dyn AnyCamera,
    observations: &[(WorldToCamera, Point2<f64>)],
    point: &Point3<f64>,
) -> Option<f64> {
    let mut sum = 0.0;
    for (pose, image_point) in observations {
        let camera_point = pose.0 * point;
        if camera_point.z <= f64::EPSILON {
            return None;
        }
        sum += (camera.project_if(&camera_point) - image_point).norm_squared();
    }
    Some(sum / observations.len().max(1) as f64)
}

/// Refines an object point observed by cameras with fixed `flippedCamera_T_world` poses.
///
/// Needs at least two observations and an initial point in front of every camera. `None` is returned
/// when the optimization leaves the valid region or does not lower the error.
pub fn optimize_point(
    camera: &dyn AnyCamera,
    observations: &[(WorldToCamera, Point2<f64>)],
    initial: &Point3<f64>,
    estimator: RobustEstimator,
    sqr_sigma: f64,
    iterations: usize,
) -> Option<PointOptimization> {
    if observations.len() < 2 {
        return None;
    }
    let initial_sqr_error = average_sqr_error(camera, observations, initial)?;

    let weights = observations
        .iter()
        .map(|(pose, image_point)| {
            let error = (camera.project_to_image_if(pose, initial) - image_point).norm_squared();
            estimator.weight(error, sqr_sigma)
        })
        .collect();
    let problem = PointProblem {
        camera,
        observations,
        weights,
        point: initial.coords,
    };
    let (problem, _report) = LevenbergMarquardt::new()
        .with_patience(iterations.max(1))
        .minimize(problem);

    let point = Point3::from(problem.point);
    let final_sqr_error = average_sqr_error(camera, observations, &point)?;
    if !final_sqr_error.is_finite() || (!estimator.is_robust() && final_sqr_error > initial_sqr_error)
    {
        return None;
    }
    Some(PointOptimization {
        point,
        initial_sqr_error,
        final_sqr_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use cv_core::nalgebra::{IsometryMatrix3, Rotation3, Translation3};
    use levenberg_marquardt::differentiate_numerically;
    use mono_core::PinholeCamera;

    fn observations(camera: &PinholeCamera, point: &Point3<f64>) -> Vec<(WorldToCamera, Point2<f64>)> {
        (0..6)
            .map(|i| {
                let i = f64::from(i);
                let pose = WorldToCamera(IsometryMatrix3::from_parts(
                    Translation3::new(-0.3 * i, 0.02 * i, 0.05 * i),
                    Rotation3::new(Vector3::new(0.0, 0.03 * i, 0.01 * i)),
                ));
                (pose, camera.project_to_image_if(&pose, point))
            })
            .collect()
    }

    #[test]
    fn analytic_jacobian_matches_numeric() {
        let camera = PinholeCamera::new(640, 480, 450.0);
        let point = Point3::new(0.3, -0.4, 5.0);
        let observations = observations(&camera, &point);
        let mut problem = PointProblem {
            camera: &camera,
            observations: &observations,
            weights: vec![1.0, 0.5, 1.0, 0.25, 1.0, 1.0],
            point: Vector3::new(0.35, -0.38, 4.8),
        };
        let numeric = differentiate_numerically(&mut problem).unwrap();
        let analytic = problem.jacobian().unwrap();
        assert_relative_eq!(numeric, analytic, epsilon = 1e-4, max_relative = 1e-3);
    }

    #[test]
    fn moves_point_onto_observations() {
        let camera = PinholeCamera::new(640, 480, 450.0);
        let point = Point3::new(0.3, -0.4, 5.0);
        let observations = observations(&camera, &point);
        let result = optimize_point(
            &camera,
            &observations,
            &Point3::new(0.4, -0.3, 5.5),
            RobustEstimator::Huber,
            9.0,
            20,
        )
        .unwrap();
        assert!(result.final_sqr_error < 1e-8);
        assert_relative_eq!(result.point, point, epsilon = 1e-5);
    }

    #[test]
    fn point_behind_cameras_is_rejected() {
        let camera = PinholeCamera::new(640, 480, 450.0);
        let observations = observations(&camera, &Point3::new(0.0, 0.0, 5.0));
        assert!(optimize_point(
            &camera,
            &observations,
            &Point3::new(0.0, 0.0, -5.0),
            RobustEstimator::Square,
            9.0,
            20
        )
        .is_none());
    }
}
