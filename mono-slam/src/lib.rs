//! # Mono SLAM
//!
//! A monocular keyframe based SLAM tracker. [`TrackerMono`] consumes grayscale frames of one moving
//! camera and returns a 6-DOF pose per frame while it builds a sparse map of 3D object points.
//!
//! The work is split into two halves:
//!
//! * The *foreground* runs inside [`TrackerMono::handle_frame`]: it tracks the image points of the
//!   previous frame, determines the camera pose from the localized points it sees and tops up the
//!   point tracks with new Harris corners.
//! * The *background* initializes the map from two views, triangulates point tracks, keeps a
//!   keyframe bundle adjustment running, repairs inaccurate points, maintains point descriptors
//!   and relocalizes the camera after tracking has been lost.
//!
//! With [`BackgroundMode::Threaded`] the background runs on its own thread, and the map update at
//! the end of the foreground runs on a frame thread so that `handle_frame` returns as soon as the
//! pose is known. With [`BackgroundMode::Inline`] both happen before `handle_frame` returns and
//! exactly one background iteration runs per frame, which makes a run fully deterministic for a
//! given [`Configuration::random_seed`].
//!
//! ```no_run
//! use mono_core::PinholeCamera;
//! use mono_image::Frame;
//! use mono_slam::{Configuration, TrackerMono};
//! use cv_core::nalgebra::Vector3;
//!
//! let camera = PinholeCamera::new(640, 480, 500.0);
//! let mut tracker = TrackerMono::new();
//! tracker.configure(Configuration::default()).unwrap();
//! let frame = Frame::new(640, 480).unwrap();
//! let pose = tracker.handle_frame(&camera, &frame, &Vector3::zeros(), None).unwrap();
//! assert!(!pose.is_valid());
//! ```

mod camera_poses;
mod correspondences;
mod debug;
mod error;
pub mod export;
mod gravities;
pub mod lock;
mod object_point;
mod occupancy;
mod point_track;
mod pose_quality;
mod pyramid_manager;
mod settings;
mod statistics;
pub mod synthetic;
mod tracker;

pub use camera_poses::*;
pub use correspondences::*;
pub use debug::*;
pub use error::*;
pub use gravities::*;
pub use lock::{LockDiagnostics, LockKind, LockProfiler, NoProfiler};
pub use object_point::*;
pub use occupancy::*;
pub use point_track::*;
pub use pose_quality::*;
pub use pyramid_manager::*;
pub use settings::*;
pub use statistics::*;
pub use tracker::{MapPoint, TrackerMono, TrackerState};
