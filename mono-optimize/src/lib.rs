//! Non-linear optimization of camera poses and object points.
//!
//! The single pose and single point optimizers are expressed as
//! [`LeastSquaresProblem`](levenberg_marquardt::LeastSquaresProblem)s and solved by the
//! `levenberg-marquardt` crate. Bundle adjustment has too many parameters for a dense solver, so it
//! runs its own Levenberg-Marquardt loop that eliminates the points with the Schur complement.

mod bundle;
mod gravity;
mod point;
mod pose;
mod robust;

pub use bundle::*;
pub use gravity::*;
pub use point::*;
pub use pose::*;
pub use robust::*;

use cv_core::nalgebra::{IsometryMatrix3, Rotation3, Translation3, Vector3, Vector6};

/// Applies a left multiplied tangent space update `exp(delta) * pose`.
///
/// The first three entries of `delta` are the translation, the last three the scaled rotation axis.
pub(crate) fn left_update(delta: &Vector6<f64>, pose: &IsometryMatrix3<f64>) -> IsometryMatrix3<f64> {
    let translation = Vector3::new(delta[0], delta[1], delta[2]);
    let rotation = Rotation3::from_scaled_axis(Vector3::new(delta[3], delta[4], delta[5]));
    IsometryMatrix3::from_parts(Translation3::from(translation), rotation) * pose
}
