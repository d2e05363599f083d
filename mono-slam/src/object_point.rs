//! Localized object points, the 3D map of the tracker.

use crate::{CameraPoses, PointTrack};
use cv_core::nalgebra::{Matrix3, Point2, Point3};
use cv_core::{Pose, WorldToCamera};
use mono_core::{is_object_point_in_front_if, AnyCamera, Index32, MapVersion};
use mono_image::Descriptor;
use mono_optimize::{optimize_point, RobustEstimator};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};

/// The localized object points keyed by object point id.
pub type LocalizedObjectPointMap = BTreeMap<Index32, LocalizedObjectPoint>;

/// How precisely the position of an object point is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LocalizationPrecision {
    Invalid,
    /// The position exists but its precision could not be determined yet.
    Unknown,
    Low,
    Medium,
    High,
}

impl LocalizationPrecision {
    pub fn name(self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Unknown => "unknown",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// The outcome of re-optimizing the position of an object point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptimizationResult {
    NotEnoughObservations,
    /// The optimized position does not explain all observations.
    Inaccurate,
    Succeeded(Point3<f64>),
}

/// The maximal ratio between the two largest axes of the uncertainty ellipsoid of a high precision point.
const HIGH_PRECISION_AXIS_RATIO: f64 = 7.0;
const MEDIUM_PRECISION_AXIS_RATIO: f64 = HIGH_PRECISION_AXIS_RATIO * 2.0;
/// A point seen by at most this many cameras is never better than [`LocalizationPrecision::Low`].
const LOW_PRECISION_POSES: usize = 5;
/// The maximal number of descriptors of a point.
const MAXIMAL_DESCRIPTORS: usize = 10;
/// The number of frames between the first and the second descriptor, doubling afterwards.
const DESCRIPTOR_INTERVAL: Index32 = 30;

/// An object point with a 3D position and its observations in individual frames.
#[derive(Debug, Clone)]
pub struct LocalizedObjectPoint {
    position: Point3<f64>,
    precision: LocalizationPrecision,
    bundle_adjusted: bool,
    observations: BTreeMap<Index32, Point2<f64>>,
    descriptors: Vec<Descriptor>,
    last_descriptor_frame_index: Index32,
}

impl LocalizedObjectPoint {
    /// Localizes a point track, taking over all of its observations.
    pub fn from_track(
        track: &PointTrack,
        position: Point3<f64>,
        precision: LocalizationPrecision,
        bundle_adjusted: bool,
    ) -> Self {
        Self {
            position,
            precision,
            bundle_adjusted,
            observations: track.observations().collect(),
            descriptors: vec![],
            last_descriptor_frame_index: 0,
        }
    }

    pub fn position(&self) -> &Point3<f64> {
        &self.position
    }

    pub fn set_position(&mut self, position: Point3<f64>, bundle_adjusted: bool) {
        self.position = position;
        self.bundle_adjusted = bundle_adjusted;
    }

    pub fn is_bundle_adjusted(&self) -> bool {
        self.bundle_adjusted
    }

    pub fn precision(&self) -> LocalizationPrecision {
        self.precision
    }

    pub fn set_precision(&mut self, precision: LocalizationPrecision) {
        self.precision = precision;
    }

    pub fn add_observation(&mut self, frame_index: Index32, image_point: Point2<f64>) {
        self.observations.insert(frame_index, image_point);
    }

    /// Merges the observations of a track, existing observations are kept.
    pub fn add_observations(&mut self, track: &PointTrack) {
        for (frame_index, image_point) in track.observations() {
            self.observations.entry(frame_index).or_insert(image_point);
        }
    }

    pub fn remove_observation(&mut self, frame_index: Index32) {
        self.observations.remove(&frame_index);
    }

    pub fn observation(&self, frame_index: Index32) -> Option<Point2<f64>> {
        self.observations.get(&frame_index).copied()
    }

    pub fn has_observation(&self, frame_index: Index32) -> bool {
        self.observations.contains_key(&frame_index)
    }

    /// The most recent observation as `(frame index, image point)`.
    pub fn last_observation(&self) -> Option<(Index32, Point2<f64>)> {
        self.observations
            .iter()
            .next_back()
            .map(|(&frame, &point)| (frame, point))
    }

    pub fn last_observation_frame_index(&self) -> Option<Index32> {
        self.observations.keys().next_back().copied()
    }

    pub fn observations(&self) -> impl DoubleEndedIterator<Item = (Index32, Point2<f64>)> + '_ {
        self.observations.iter().map(|(&frame, &point)| (frame, point))
    }

    pub fn number_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    pub fn add_descriptor(&mut self, frame_index: Index32, descriptor: Descriptor) {
        self.descriptors.push(descriptor);
        self.last_descriptor_frame_index = frame_index;
    }

    /// Whether a new descriptor should be computed in `frame_index`.
    ///
    /// Only points with at least medium precision are described. The `n`-th descriptor follows the
    /// previous one after `30 * 2^(n - 1)` frames and a point holds at most ten descriptors.
    pub fn need_descriptor(&self, frame_index: Index32) -> bool {
        if self.precision < LocalizationPrecision::Medium {
            return false;
        }
        if self.descriptors.is_empty() {
            return true;
        }
        if self.descriptors.len() >= MAXIMAL_DESCRIPTORS {
            return false;
        }
        let interval = DESCRIPTOR_INTERVAL << (self.descriptors.len() - 1);
        frame_index >= self.last_descriptor_frame_index.saturating_add(interval)
    }

    /// The `flippedCamera_T_world` poses and image points of every observation with a pose of `map_version`.
    pub fn posed_observations(
        &self,
        camera_poses: &CameraPoses,
        map_version: Option<MapVersion>,
    ) -> Vec<(WorldToCamera, Point2<f64>)> {
        let frames: Vec<Index32> = self.observations.keys().copied().collect();
        camera_poses
            .poses(&frames)
            .into_iter()
            .zip(self.observations.values())
            .filter_map(|(pose, &image_point)| {
                let pose = pose?;
                if map_version.map_or(false, |version| pose.map_version() != version) {
                    return None;
                }
                Some((*pose.flipped_camera_t_world(), image_point))
            })
            .collect()
    }

    /// Optimizes the position of this point against every observation with a pose of `map_version`.
    ///
    /// The point must lie in front of every camera before and after the optimization, and the
    /// optimized point must project within `maximal_projection_error` pixels in every observation.
    #[allow(clippy::too_many_arguments)]
    pub fn optimized_position(
        &self,
        camera: &dyn AnyCamera,
        camera_poses: &CameraPoses,
        map_version: MapVersion,
        minimal_observations: usize,
        maximal_projection_error: f64,
        estimator: RobustEstimator,
        iterations: usize,
    ) -> OptimizationResult {
        let observations = self.posed_observations(camera_poses, Some(map_version));
        if observations.len() < minimal_observations.max(2) {
            return OptimizationResult::NotEnoughObservations;
        }
        if observations
            .iter()
            .any(|(pose, _)| !is_object_point_in_front_if(pose, &self.position))
        {
            return OptimizationResult::Inaccurate;
        }

        let sqr_maximal_error = maximal_projection_error * maximal_projection_error;
        let optimized = match optimize_point(
            camera,
            &observations,
            &self.position,
            estimator,
            sqr_maximal_error,
            iterations,
        ) {
            Some(optimized) => optimized.point,
            None => return OptimizationResult::Inaccurate,
        };

        let explains_all = observations.iter().all(|(pose, image_point)| {
            is_object_point_in_front_if(pose, &optimized)
                && (camera.project_to_image_if(pose, &optimized) - image_point).norm_squared()
                    <= sqr_maximal_error
        });
        if explains_all {
            OptimizationResult::Succeeded(optimized)
        } else {
            OptimizationResult::Inaccurate
        }
    }

    /// Re-determines the precision from the observations with a pose of `map_version`.
    ///
    /// High precision points are left untouched. Returns whether the precision is valid.
    pub fn update_precision(
        &mut self,
        camera: &dyn AnyCamera,
        camera_poses: &CameraPoses,
        map_version: MapVersion,
    ) -> bool {
        if self.precision == LocalizationPrecision::High {
            return true;
        }
        let poses: Vec<WorldToCamera> = self
            .posed_observations(camera_poses, Some(map_version))
            .into_iter()
            .map(|(pose, _)| pose)
            .collect();
        self.precision = match determine_precision(camera, &poses, &self.position) {
            LocalizationPrecision::Invalid => LocalizationPrecision::Unknown,
            precision => precision,
        };
        self.precision != LocalizationPrecision::Unknown
    }
}

/// Determines the precision of a point from the shape of its uncertainty ellipsoid.
///
/// The information matrix is the sum of `J^T J` over the 2x3 projection Jacobians of all cameras.
/// The ratio between the two largest eigenvalues of its inverse measures how elongated the
/// uncertainty is along the viewing rays.
pub fn determine_precision(
    camera: &dyn AnyCamera,
    flipped_cameras_t_world: &[WorldToCamera],
    point: &Point3<f64>,
) -> LocalizationPrecision {
    if flipped_cameras_t_world.len() < 2 {
        return LocalizationPrecision::Invalid;
    }
    if flipped_cameras_t_world.len() <= LOW_PRECISION_POSES {
        return LocalizationPrecision::Low;
    }

    let mut information = Matrix3::zeros();
    for pose in flipped_cameras_t_world {
        let camera_point = pose.isometry() * point;
        if camera_point.z <= f64::EPSILON {
            continue;
        }
        let jacobian = camera.point_jacobian_if(&camera_point) * pose.0.rotation.matrix();
        information += jacobian.transpose() * jacobian;
    }

    let maximal = information.amax();
    if maximal > f64::EPSILON {
        information /= maximal;
    }
    let covariance = match information.try_inverse() {
        Some(covariance) => covariance,
        None => return LocalizationPrecision::Unknown,
    };

    let mut eigenvalues: Vec<f64> = covariance.symmetric_eigenvalues().iter().copied().collect();
    eigenvalues.sort_by(|a, b| b.total_cmp(a));
    if eigenvalues[2] <= f64::EPSILON || eigenvalues[1].abs() <= f64::EPSILON {
        return LocalizationPrecision::Unknown;
    }

    let sqr_ratio = eigenvalues[0] / eigenvalues[1];
    if sqr_ratio <= HIGH_PRECISION_AXIS_RATIO * HIGH_PRECISION_AXIS_RATIO {
        LocalizationPrecision::High
    } else if sqr_ratio <= MEDIUM_PRECISION_AXIS_RATIO * MEDIUM_PRECISION_AXIS_RATIO {
        LocalizationPrecision::Medium
    } else {
        LocalizationPrecision::Low
    }
}

/// The number of points observed in a frame and how many of them are bundle adjusted.
pub fn bundle_adjustment_quality(
    map: &LocalizedObjectPointMap,
    frame_index: Index32,
) -> (usize, usize) {
    map.values()
        .filter(|point| point.has_observation(frame_index))
        .fold((0, 0), |(observed, adjusted), point| {
            (observed + 1, adjusted + usize::from(point.is_bundle_adjusted()))
        })
}

/// A set of object point ids, filled by one thread and drained by another.
#[derive(Debug, Default)]
pub struct ObjectPointIdSet {
    ids: Mutex<HashSet<Index32>>,
}

impl ObjectPointIdSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, ids: impl IntoIterator<Item = Index32>) {
        self.ids.lock().extend(ids);
    }

    /// Removes and returns all ids.
    pub fn take(&self) -> HashSet<Index32> {
        std::mem::take(&mut *self.ids.lock())
    }

    pub fn clear(&self) {
        self.ids.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_core::nalgebra::{IsometryMatrix3, Rotation3, Translation3, Vector3};
    use mono_core::{flipped_from_standard, CameraPose, EstimatedMotion, PinholeCamera, PoseQuality};

    fn camera() -> PinholeCamera {
        PinholeCamera::new(640, 480, 500.0)
    }

    /// Standard cameras at `z = 0` along the `x` axis looking towards `-z`.
    fn poses_along_x(positions: &[f64]) -> Vec<WorldToCamera> {
        positions
            .iter()
            .map(|&x| {
                flipped_from_standard(&IsometryMatrix3::from_parts(
                    Translation3::new(x, 0.0, 0.0),
                    Rotation3::identity(),
                ))
            })
            .collect()
    }

    fn observed_point(
        camera_poses: &CameraPoses,
        positions: &[f64],
        point: &Point3<f64>,
    ) -> LocalizedObjectPoint {
        let camera = camera();
        let poses = poses_along_x(positions);
        let first = camera_poses.frame_index().wrapping_add(1);
        let mut track = None::<PointTrack>;
        for pose in &poses {
            let frame = camera_poses.next_frame();
            camera_poses.set_pose(
                frame,
                CameraPose::from_flipped(*pose, PoseQuality::Low, EstimatedMotion::Translational),
                1,
            );
            let image_point = camera.project_to_image_if(pose, point);
            match &mut track {
                Some(track) => assert!(track.add_observation(frame, image_point)),
                None => track = Some(PointTrack::new(0, first, image_point)),
            }
        }
        LocalizedObjectPoint::from_track(
            &track.unwrap(),
            *point,
            LocalizationPrecision::Unknown,
            false,
        )
    }

    #[test]
    fn precision_grows_with_the_baseline() {
        let camera = camera();
        let point = Point3::new(0.0, 0.0, -5.0);

        assert_eq!(
            determine_precision(&camera, &poses_along_x(&[0.0]), &point),
            LocalizationPrecision::Invalid
        );
        assert_eq!(
            determine_precision(&camera, &poses_along_x(&[0.0, 1.0, 2.0]), &point),
            LocalizationPrecision::Low
        );

        let narrow: Vec<f64> = (0..8).map(|i| f64::from(i) * 0.001).collect();
        assert_eq!(
            determine_precision(&camera, &poses_along_x(&narrow), &point),
            LocalizationPrecision::Low
        );
        let wide: Vec<f64> = (0..8).map(|i| f64::from(i) - 3.5).collect();
        assert_eq!(
            determine_precision(&camera, &poses_along_x(&wide), &point),
            LocalizationPrecision::High
        );
    }

    #[test]
    fn descriptor_cadence_doubles() {
        let track = PointTrack::new(0, 0, Point2::new(10.0, 10.0));
        let mut point =
            LocalizedObjectPoint::from_track(&track, Point3::origin(), LocalizationPrecision::Low, false);
        assert!(!point.need_descriptor(0));

        point.set_precision(LocalizationPrecision::Medium);
        assert!(point.need_descriptor(0));
        point.add_descriptor(100, Descriptor::zeros());
        assert!(!point.need_descriptor(129));
        assert!(point.need_descriptor(130));
        point.add_descriptor(130, Descriptor::zeros());
        assert!(!point.need_descriptor(189));
        assert!(point.need_descriptor(190));
        for frame in 0..8 {
            point.add_descriptor(1000 + frame, Descriptor::zeros());
        }
        assert!(!point.need_descriptor(u32::MAX));
    }

    #[test]
    fn optimization_moves_a_perturbed_point_back() {
        let camera_poses = CameraPoses::new();
        let truth = Point3::new(0.3, -0.2, -4.0);
        let positions: Vec<f64> = (0..12).map(|i| f64::from(i) * 0.1).collect();
        let mut point = observed_point(&camera_poses, &positions, &truth);

        assert_eq!(
            point.optimized_position(&camera(), &camera_poses, 1, 20, 3.5, RobustEstimator::Huber, 10),
            OptimizationResult::NotEnoughObservations
        );

        point.set_position(truth + Vector3::new(0.02, 0.02, 0.1), false);
        match point.optimized_position(&camera(), &camera_poses, 1, 10, 3.5, RobustEstimator::Huber, 10)
        {
            OptimizationResult::Succeeded(optimized) => assert!((optimized - truth).norm() < 1e-3),
            other => panic!("unexpected {:?}", other),
        }

        point.set_position(Point3::new(0.0, 0.0, 4.0), false);
        assert_eq!(
            point.optimized_position(&camera(), &camera_poses, 1, 10, 3.5, RobustEstimator::Huber, 10),
            OptimizationResult::Inaccurate
        );
    }

    #[test]
    fn precision_update_uses_posed_observations() {
        let camera_poses = CameraPoses::new();
        let positions: Vec<f64> = (0..8).map(|i| f64::from(i) - 3.5).collect();
        let mut point = observed_point(&camera_poses, &positions, &Point3::new(0.0, 0.0, -5.0));
        assert!(point.update_precision(&camera(), &camera_poses, 1));
        assert_eq!(point.precision(), LocalizationPrecision::High);
        assert_eq!(point.last_observation_frame_index(), Some(7));
    }

    #[test]
    fn precision_ignores_poses_of_other_map_versions() {
        let camera_poses = CameraPoses::new();
        let positions: Vec<f64> = (0..8).map(|i| f64::from(i) - 3.5).collect();
        let mut point = observed_point(&camera_poses, &positions, &Point3::new(0.0, 0.0, -5.0));
        for frame in 0..2 {
            let pose = camera_poses.pose(frame).unwrap();
            camera_poses.set_pose(frame, pose, 2);
        }

        assert!(!point.update_precision(&camera(), &camera_poses, 3));
        assert_eq!(point.precision(), LocalizationPrecision::Unknown);
        assert!(point.update_precision(&camera(), &camera_poses, 2));
        assert_eq!(point.precision(), LocalizationPrecision::Low);

        for frame in 2..8 {
            let pose = camera_poses.pose(frame).unwrap();
            camera_poses.set_pose(frame, pose, 2);
        }
        assert!(point.update_precision(&camera(), &camera_poses, 2));
        assert_eq!(point.precision(), LocalizationPrecision::High);
    }

    #[test]
    fn id_sets_drain() {
        let set = ObjectPointIdSet::new();
        set.add([1, 2, 2, 3]);
        assert_eq!(set.len(), 3);
        let taken = set.take();
        assert_eq!(taken.len(), 3);
        assert!(set.is_empty());
    }
}
