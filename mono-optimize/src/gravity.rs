//! Gravity constraints for the rotation of camera poses.
//!
//! A pose `flippedCamera_T_world` is aligned with gravity when the world gravity rotated into the
//! flipped camera equals the gravity measured by the camera. The residual is the difference of both
//! unit vectors, close to the alignment angle for small deviations.

use cv_core::nalgebra::{Matrix3x6, UnitVector3, Vector3};
use cv_core::WorldToCamera;
use mono_core::flip_rotation;

/// Gravity measurements of a set of cameras.
#[derive(Debug, Clone, PartialEq)]
pub struct GravityConstraints {
    /// One gravity vector per camera in the standard camera frame.
    camera_gravities: Vec<UnitVector3<f64>>,
    world_gravity: UnitVector3<f64>,
    weight_factor: f64,
}

impl GravityConstraints {
    /// `weight_factor` scales the gravity residual of a pose relative to all its reprojection
    /// residuals, `0` disables the constraint.
    pub fn new(
        camera_gravities: Vec<UnitVector3<f64>>,
        world_gravity: UnitVector3<f64>,
        weight_factor: f64,
    ) -> Self {
        Self {
            camera_gravities,
            world_gravity,
            weight_factor: weight_factor.max(0.0),
        }
    }

    /// Takes the world gravity from a reference camera whose pose is trusted.
    pub fn from_reference(
        camera_gravities: Vec<UnitVector3<f64>>,
        reference: &WorldToCamera,
        reference_index: usize,
        weight_factor: f64,
    ) -> Option<Self> {
        let camera_gravity = camera_gravities.get(reference_index)?;
        let world_gravity = UnitVector3::new_normalize(
            reference.0.rotation.inverse() * (flip_rotation() * camera_gravity.into_inner()),
        );
        Some(Self::new(camera_gravities, world_gravity, weight_factor))
    }

    pub fn len(&self) -> usize {
        self.camera_gravities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.camera_gravities.is_empty()
    }

    pub fn weight_factor(&self) -> f64 {
        self.weight_factor
    }

    pub fn world_gravity(&self) -> &UnitVector3<f64> {
        &self.world_gravity
    }

    /// The measured gravity of a camera expressed in its flipped frame.
    pub fn camera_gravity_in_flipped_camera(&self, camera: usize) -> Option<Vector3<f64>> {
        self.camera_gravities
            .get(camera)
            .map(|gravity| flip_rotation() * gravity.into_inner())
    }

    /// `R * g_world - g_camera` in the flipped camera frame.
    pub fn residual_if(&self, pose: &WorldToCamera, camera: usize) -> Option<Vector3<f64>> {
        let measured = self.camera_gravity_in_flipped_camera(camera)?;
        Some(pose.0.rotation * self.world_gravity.into_inner() - measured)
    }

    /// The derivative of [`residual_if`](Self::residual_if) with respect to a left multiplied
    /// `(translation, scaled axis)` update of the pose.
    pub fn jacobian_if(&self, pose: &WorldToCamera) -> Matrix3x6<f64> {
        let rotated = pose.0.rotation * self.world_gravity.into_inner();
        let mut jacobian = Matrix3x6::zeros();
        jacobian
            .fixed_columns_mut::<3>(3)
            .copy_from(&(-rotated.cross_matrix()));
        jacobian
    }

    /// The angle between the measured and the expected gravity of a camera, in radians.
    pub fn alignment_angle_if(&self, pose: &WorldToCamera, camera: usize) -> Option<f64> {
        let measured = self.camera_gravity_in_flipped_camera(camera)?;
        let expected = pose.0.rotation * self.world_gravity.into_inner();
        Some(measured.dot(&expected).clamp(-1.0, 1.0).acos())
    }
}
