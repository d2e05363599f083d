//! Geometry algorithms used by the monocular tracker.
//!
//! The solvers in this crate are pure functions over correspondences. They never panic on
//! degenerate input and report "no solution" as `None`.

pub mod homography;
pub mod pose_ransac;
pub mod statistics;
pub mod triangulation;
pub mod two_view;

pub use pose_ransac::{PoseRansac, PoseRansacResult};
pub use two_view::{TwoViewEstimator, TwoViewResult};
