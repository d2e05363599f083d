use crate::flip_rotation;
use cv_core::nalgebra::{Matrix2x3, Matrix3, Point2, Point3, UnitVector3, Vector2, Vector3};
use cv_core::{Pose, WorldPoint, WorldToCamera};
use std::fmt::Debug;
use std::sync::Arc;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// The camera profile consumed by the tracker.
///
/// The methods with an `_if` suffix operate in the flipped camera coordinate system
/// (looking towards `+z`, `y` down). The other methods use the standard system
/// (looking towards `-z`, `y` up). A camera is chosen once and never changes while tracking.
pub trait AnyCamera: Debug + Send + Sync {
    /// A short human readable name of the camera model.
    fn name(&self) -> &str;

    /// Width of the camera image in pixels.
    fn width(&self) -> u32;

    /// Height of the camera image in pixels.
    fn height(&self) -> u32;

    /// Returns whether the camera profile can be used.
    fn is_valid(&self) -> bool;

    /// The bearing through an image point in flipped camera coordinates.
    fn vector_if(&self, image_point: Point2<f64>) -> UnitVector3<f64>;

    /// Projects a point given in flipped camera coordinates into the image.
    ///
    /// The point should lie in front of the camera (`z > 0`).
    fn project_if(&self, camera_point: &Point3<f64>) -> Point2<f64>;

    /// The 2x3 Jacobian of [`AnyCamera::project_if`] in respect to the camera point.
    fn point_jacobian_if(&self, camera_point: &Point3<f64>) -> Matrix2x3<f64>;

    /// The mean focal length in pixels, used to convert pixel tolerances into angles.
    fn focal_length(&self) -> f64;

    /// Creates an owned copy of the camera profile.
    fn clone_camera(&self) -> Arc<dyn AnyCamera>;

    /// The bearing through an image point in standard camera coordinates.
    fn vector(&self, image_point: Point2<f64>) -> UnitVector3<f64> {
        UnitVector3::new_unchecked(flip_rotation() * self.vector_if(image_point).into_inner())
    }

    /// Projects a point given in standard camera coordinates into the image.
    fn project(&self, camera_point: &Point3<f64>) -> Point2<f64> {
        self.project_if(&(flip_rotation() * camera_point))
    }

    /// Projects a world point with a `flippedCamera_T_world` transform.
    fn project_to_image_if(
        &self,
        flipped_camera_t_world: &WorldToCamera,
        world_point: &Point3<f64>,
    ) -> Point2<f64> {
        self.project_if(&(flipped_camera_t_world.isometry() * world_point))
    }

    /// Returns whether an image point lies inside the image with an additional border.
    fn is_inside(&self, image_point: &Point2<f64>, border: f64) -> bool {
        image_point.x >= border
            && image_point.y >= border
            && image_point.x < f64::from(self.width()) - border
            && image_point.y < f64::from(self.height()) - border
    }
}

/// Returns whether a world point lies in front of a camera given its `flippedCamera_T_world`.
pub fn is_object_point_in_front_if(
    flipped_camera_t_world: &WorldToCamera,
    world_point: &Point3<f64>,
) -> bool {
    (flipped_camera_t_world.isometry() * world_point).z > f64::EPSILON
}

/// Converts a world point into the homogeneous representation used by the solvers.
pub fn world_point(point: &Point3<f64>) -> WorldPoint {
    WorldPoint(point.to_homogeneous())
}

/// A pinhole camera without distortion.
///
/// The intrinsics follow the usual matrix layout:
///
/// ```text
/// [ fx  s   cx ]
/// [ 0   fy  cy ]
/// [ 0   0   1  ]
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct PinholeCamera {
    pub width: u32,
    pub height: u32,
    pub focals: Vector2<f64>,
    pub principal_point: Point2<f64>,
    pub skew: f64,
}

impl PinholeCamera {
    /// Creates a camera with a square pixel focal length and the principal point at the image center.
    pub fn new(width: u32, height: u32, focal: f64) -> Self {
        Self {
            width,
            height,
            focals: Vector2::new(focal, focal),
            principal_point: Point2::new(f64::from(width) * 0.5, f64::from(height) * 0.5),
            skew: 0.0,
        }
    }

    /// Creates a camera from the horizontal field of view in radians.
    pub fn from_fov_x(width: u32, height: u32, fov_x: f64) -> Self {
        let focal = f64::from(width) * 0.5 / (fov_x * 0.5).tan();
        Self::new(width, height, focal)
    }

    #[must_use]
    pub fn focals(self, focals: Vector2<f64>) -> Self {
        Self { focals, ..self }
    }

    #[must_use]
    pub fn principal_point(self, principal_point: Point2<f64>) -> Self {
        Self {
            principal_point,
            ..self
        }
    }

    #[must_use]
    pub fn skew(self, skew: f64) -> Self {
        Self { skew, ..self }
    }

    /// The intrinsic camera matrix.
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.focals.x,
            self.skew,
            self.principal_point.x,
            0.0,
            self.focals.y,
            self.principal_point.y,
            0.0,
            0.0,
            1.0,
        )
    }
}

impl AnyCamera for PinholeCamera {
    fn name(&self) -> &str {
        "pinhole"
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn is_valid(&self) -> bool {
        self.width != 0
            && self.height != 0
            && self.focals.iter().all(|&f| f.is_finite() && f > 0.0)
            && self.principal_point.iter().all(|p| p.is_finite())
            && self.skew.is_finite()
    }

    fn vector_if(&self, image_point: Point2<f64>) -> UnitVector3<f64> {
        let y = (image_point.y - self.principal_point.y) / self.focals.y;
        let x = (image_point.x - self.principal_point.x - self.skew * y) / self.focals.x;
        UnitVector3::new_normalize(Vector3::new(x, y, 1.0))
    }

    fn project_if(&self, camera_point: &Point3<f64>) -> Point2<f64> {
        let x = camera_point.x / camera_point.z;
        let y = camera_point.y / camera_point.z;
        Point2::new(
            self.focals.x * x + self.skew * y + self.principal_point.x,
            self.focals.y * y + self.principal_point.y,
        )
    }

    fn point_jacobian_if(&self, camera_point: &Point3<f64>) -> Matrix2x3<f64> {
        let inv_z = 1.0 / camera_point.z;
        let x = camera_point.x * inv_z;
        let y = camera_point.y * inv_z;
        let (fx, fy, s) = (self.focals.x, self.focals.y, self.skew);
        Matrix2x3::new(
            fx * inv_z,
            s * inv_z,
            -(fx * x + s * y) * inv_z,
            0.0,
            fy * inv_z,
            -fy * y * inv_z,
        )
    }

    fn focal_length(&self) -> f64 {
        0.5 * (self.focals.x + self.focals.y)
    }

    fn clone_camera(&self) -> Arc<dyn AnyCamera> {
        Arc::new(*self)
    }
}
