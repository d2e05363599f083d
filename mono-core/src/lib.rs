//! # Mono Core
//!
//! Shared camera and pose types for the monocular tracking crates.
//!
//! Every crate in this workspace that touches cameras or poses depends on this crate so that
//! all of them agree on one set of types. The heavy lifting types (isometries, bearings and
//! homogeneous points) come from [`cv_core`], which is re-exported together with `nalgebra`.
//!
//! ## Coordinate conventions
//!
//! Two camera coordinate systems are in use, and both are stored side by side in a [`CameraPose`]:
//!
//! * The *standard* camera looks towards the negative `z` axis with the `y` axis pointing up.
//!   A `world_T_camera` transform maps standard camera points into world points.
//! * The *flipped* camera looks towards the positive `z` axis with the `y` axis pointing down.
//!   A `flippedCamera_T_world` transform maps world points into flipped camera points. This is the
//!   convention of [`cv_core::WorldToCamera`] and of every solver in the `rust-cv` ecosystem.
//!
//! The flip itself is a rotation of 180 degrees around the `x` axis:
//!
//! ```text
//!     standard            flipped
//!
//!        y                  +----- x
//!        |                 /|
//!        |                / |
//!        +----- x        z  y
//!       /
//!      z  (camera looks along -z)   (camera looks along +z)
//! ```
//!
//! so that `flippedCamera_T_world = (world_T_camera * flip)^-1`.
//!
//! Algorithms that project points (pose estimation, triangulation, bundle adjustment) work with the
//! flipped transform, while the public tracker output is the standard `world_T_camera`.
//!
//! ## Indices
//!
//! Frame indices and object point ids are 32 bit unsigned integers. The all-ones value is reserved as
//! the invalid sentinel, see [`INVALID_INDEX`] and [`INVALID_MAP_VERSION`].

mod camera;
mod pose;

pub use camera::*;
pub use cv_core;
pub use cv_core::nalgebra;
pub use pose::*;

/// Index of a frame or id of an object point.
pub type Index32 = u32;

/// The invalid frame index or object point id.
pub const INVALID_INDEX: Index32 = Index32::MAX;

/// Identifies the bundle adjustment epoch that produced a pose or a map point.
pub type MapVersion = u32;

/// The invalid map version.
pub const INVALID_MAP_VERSION: MapVersion = MapVersion::MAX;
