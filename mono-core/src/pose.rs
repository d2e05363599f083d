use crate::{MapVersion, INVALID_MAP_VERSION};
use cv_core::nalgebra::{IsometryMatrix3, Matrix3, Rotation3, Translation3, Vector3};
use cv_core::{Pose, WorldToCamera};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// The rotation converting between the standard and the flipped camera coordinate system.
///
/// This is a rotation of 180 degrees around the `x` axis and is its own inverse.
pub fn flip_rotation() -> Rotation3<f64> {
    Rotation3::from_matrix_unchecked(Matrix3::from_diagonal(&Vector3::new(1.0, -1.0, -1.0)))
}

/// The flip as a rigid transform.
pub fn flip_isometry() -> IsometryMatrix3<f64> {
    IsometryMatrix3::from_parts(Translation3::identity(), flip_rotation())
}

/// Converts a `world_T_camera` transform into the `flippedCamera_T_world` transform.
pub fn flipped_from_standard(world_t_camera: &IsometryMatrix3<f64>) -> WorldToCamera {
    WorldToCamera((world_t_camera * flip_isometry()).inverse())
}

/// Converts a `flippedCamera_T_world` transform back into the `world_T_camera` transform.
pub fn standard_from_flipped(flipped_camera_t_world: &WorldToCamera) -> IsometryMatrix3<f64> {
    flipped_camera_t_world.isometry().inverse() * flip_isometry()
}

/// Returns whether a transform holds finite values and an orthonormal rotation.
pub fn is_valid_transform(transform: &IsometryMatrix3<f64>) -> bool {
    let rotation = transform.rotation.matrix();
    if !rotation.iter().all(|v| v.is_finite())
        || !transform.translation.vector.iter().all(|v| v.is_finite())
    {
        return false;
    }
    let orthogonality = (rotation * rotation.transpose() - Matrix3::identity()).abs().max();
    orthogonality < 1e-6 && (rotation.determinant() - 1.0).abs() < 1e-6
}

/// The quality of a camera pose.
///
/// `Low` and `Medium` come from correspondence based estimation, `High` is only assigned
/// to poses that took part in a bundle adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub enum PoseQuality {
    Invalid,
    Low,
    Medium,
    High,
}

impl PoseQuality {
    pub fn name(self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// The motion of the camera between two frames, estimated from optical flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub enum EstimatedMotion {
    Unknown,
    Stationary,
    Translational,
}

impl EstimatedMotion {
    /// The ratio of `min(width, height)` the mean flow must reach for a translational motion.
    pub const TRANSLATIONAL_FLOW_RATIO: f64 = 0.005;

    pub fn name(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Stationary => "stationary",
            Self::Translational => "translational",
        }
    }

    /// Classifies the motion based on the mean optical flow in pixels.
    pub fn from_mean_flow(mean_flow: f64, width: u32, height: u32) -> Self {
        if !mean_flow.is_finite() || mean_flow < 0.0 {
            return Self::Unknown;
        }
        let threshold = f64::from(width.min(height)) * Self::TRANSLATIONAL_FLOW_RATIO;
        if mean_flow >= threshold {
            Self::Translational
        } else {
            Self::Stationary
        }
    }
}

/// An immutable camera pose.
///
/// The pose holds both the standard `world_T_camera` and the flipped `flippedCamera_T_world`
/// transform so that neither has to be recomputed in the hot paths.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraPose {
    world_t_camera: IsometryMatrix3<f64>,
    flipped_camera_t_world: WorldToCamera,
    quality: PoseQuality,
    motion: EstimatedMotion,
    map_version: MapVersion,
}

impl CameraPose {
    /// Creates a pose from the standard `world_T_camera` transform.
    ///
    /// The quality is forced to [`PoseQuality::Invalid`] when the transform is not a valid rigid motion.
    pub fn new(
        world_t_camera: IsometryMatrix3<f64>,
        quality: PoseQuality,
        motion: EstimatedMotion,
    ) -> Self {
        let quality = if is_valid_transform(&world_t_camera) {
            quality
        } else {
            PoseQuality::Invalid
        };
        Self {
            world_t_camera,
            flipped_camera_t_world: flipped_from_standard(&world_t_camera),
            quality,
            motion,
            map_version: INVALID_MAP_VERSION,
        }
    }

    /// Creates a pose from the flipped `flippedCamera_T_world` transform.
    pub fn from_flipped(
        flipped_camera_t_world: WorldToCamera,
        quality: PoseQuality,
        motion: EstimatedMotion,
    ) -> Self {
        let world_t_camera = standard_from_flipped(&flipped_camera_t_world);
        let quality = if is_valid_transform(&world_t_camera) {
            quality
        } else {
            PoseQuality::Invalid
        };
        Self {
            world_t_camera,
            flipped_camera_t_world,
            quality,
            motion,
            map_version: INVALID_MAP_VERSION,
        }
    }

    /// A pose which does not hold a transform.
    pub fn invalid() -> Self {
        Self {
            world_t_camera: IsometryMatrix3::identity(),
            flipped_camera_t_world: WorldToCamera::identity(),
            quality: PoseQuality::Invalid,
            motion: EstimatedMotion::Unknown,
            map_version: INVALID_MAP_VERSION,
        }
    }

    /// Returns a copy of this pose tagged with a map version.
    #[must_use]
    pub fn with_map_version(self, map_version: MapVersion) -> Self {
        Self {
            map_version,
            ..self
        }
    }

    /// Returns a copy of this pose with another quality.
    #[must_use]
    pub fn with_quality(self, quality: PoseQuality) -> Self {
        if self.quality == PoseQuality::Invalid {
            return self;
        }
        Self { quality, ..self }
    }

    /// Returns a copy of this pose with another motion estimate.
    #[must_use]
    pub fn with_motion(self, motion: EstimatedMotion) -> Self {
        Self { motion, ..self }
    }

    pub fn is_valid(&self) -> bool {
        self.quality != PoseQuality::Invalid
    }

    pub fn world_t_camera(&self) -> &IsometryMatrix3<f64> {
        &self.world_t_camera
    }

    pub fn flipped_camera_t_world(&self) -> &WorldToCamera {
        &self.flipped_camera_t_world
    }

    /// The position of the camera center in world coordinates.
    pub fn translation(&self) -> Vector3<f64> {
        self.world_t_camera.translation.vector
    }

    pub fn quality(&self) -> PoseQuality {
        self.quality
    }

    pub fn motion(&self) -> EstimatedMotion {
        self.motion
    }

    pub fn map_version(&self) -> MapVersion {
        self.map_version
    }
}
