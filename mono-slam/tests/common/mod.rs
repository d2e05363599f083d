#![allow(dead_code)]

use cv_core::nalgebra::{IsometryMatrix3, Vector3};
use mono_core::PinholeCamera;
use mono_image::Frame;
use mono_slam::synthetic::{noise_frame, smooth_trajectory, TexturedPlane};
use mono_slam::{BackgroundMode, Configuration, TrackerMono};
use std::ops::Range;

pub const WIDTH: u32 = 320;
pub const HEIGHT: u32 = 240;
pub const FOCAL: f64 = 400.0;
pub const DEPTH: f64 = 3.0;

/// A textured plane filmed by a camera translating parallel to it.
pub struct Sequence {
    pub camera: PinholeCamera,
    pub plane: TexturedPlane,
    pub world_t_cameras: Vec<IsometryMatrix3<f64>>,
    /// These frames show noise instead of the plane.
    pub occluded: Range<usize>,
}

impl Sequence {
    pub fn new(count: usize, step: f64) -> Self {
        Self {
            camera: PinholeCamera::new(WIDTH, HEIGHT, FOCAL),
            plane: TexturedPlane::new(DEPTH, 0.06, 7),
            world_t_cameras: smooth_trajectory(count, Vector3::zeros(), Vector3::new(step, 0.0, 0.0)),
            occluded: 0..0,
        }
    }

    pub fn occluded(self, occluded: Range<usize>) -> Self {
        Self { occluded, ..self }
    }

    pub fn len(&self) -> usize {
        self.world_t_cameras.len()
    }

    pub fn frame(&self, ix: usize) -> Frame {
        if self.occluded.contains(&ix) {
            noise_frame(WIDTH, HEIGHT, ix as u64).unwrap()
        } else {
            self.plane
                .render(&self.camera, &self.world_t_cameras[ix])
                .unwrap()
        }
    }

    /// The distance between every estimated camera center and its ground truth.
    ///
    /// Both paths are expressed relative to the first estimated frame and the estimated one is
    /// scaled to fit the ground truth best.
    pub fn translation_errors(
        &self,
        estimated: &[(usize, IsometryMatrix3<f64>)],
    ) -> Vec<(usize, f64)> {
        let (reference, estimated_reference) = match estimated.first() {
            Some(&first) => first,
            None => return vec![],
        };
        let truth_reference = self.world_t_cameras[reference];
        let relative: Vec<(usize, Vector3<f64>, Vector3<f64>)> = estimated
            .iter()
            .map(|(ix, world_t_camera)| {
                let estimated = estimated_reference.rotation.inverse()
                    * (world_t_camera.translation.vector - estimated_reference.translation.vector);
                let truth = truth_reference.rotation.inverse()
                    * (self.world_t_cameras[*ix].translation.vector
                        - truth_reference.translation.vector);
                (*ix, estimated, truth)
            })
            .collect();
        let numerator: f64 = relative.iter().map(|(_, e, t)| e.dot(t)).sum();
        let denominator: f64 = relative.iter().map(|(_, e, _)| e.norm_squared()).sum();
        let scale = if denominator > f64::EPSILON {
            numerator / denominator
        } else {
            1.0
        };
        relative
            .into_iter()
            .map(|(ix, estimated, truth)| (ix, (estimated * scale - truth).norm()))
            .collect()
    }
}

pub fn inline_configuration() -> Configuration {
    Configuration {
        background_mode: BackgroundMode::Inline,
        ..Default::default()
    }
}

pub fn tracker(configuration: Configuration) -> TrackerMono {
    let _ = pretty_env_logger::try_init();
    let mut tracker = TrackerMono::new();
    tracker.configure(configuration).unwrap();
    tracker
}

/// The valid poses of all frames as the tracker knows them after the run.
pub fn valid_poses(tracker: &TrackerMono, count: usize) -> Vec<(usize, IsometryMatrix3<f64>)> {
    (0..count)
        .filter_map(|ix| {
            let pose = tracker.pose(ix as u32)?;
            pose.is_valid().then(|| (ix, *pose.world_t_camera()))
        })
        .collect()
}
