//! The maintenance duties of the background worker.

use super::{MapState, Shared, TrackerState};
use crate::lock::LockProfiler;
use crate::object_point::OptimizationResult;
use crate::{determine_precision, LocalizationPrecision, LocalizedObjectPoint, Stage};
use cv_core::nalgebra::{IsometryMatrix3, Point2, Point3, Translation3};
use cv_core::{CameraToCamera, WorldToCamera};
use log::{debug, info, trace};
use mono_core::{
    flip_isometry, is_object_point_in_front_if, CameraPose, EstimatedMotion, Index32, PoseQuality,
    INVALID_INDEX,
};
use mono_geom::statistics::{percentile, percentile_usize};
use mono_geom::triangulation::{camera_center, sqr_projection_error, triangulate_ransac, viewing_angle};
use mono_geom::TwoViewEstimator;
use mono_optimize::{optimize_point, RobustEstimator};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::collections::HashSet;
use std::sync::atomic::Ordering;

/// The minimal number of tracks observed in the latest frame before an initialization is tried.
const MINIMAL_INITIAL_TRACKS: usize = 30;
/// An inaccurate point needs this many observations before it is moved.
const INACCURATE_MINIMAL_OBSERVATIONS: usize = 10;
pub(crate) const POINT_ITERATIONS: usize = 20;
const LOCALIZATION_RANSAC_ITERATIONS: usize = 20;
/// Only the most recent observations of a track are used to localize it.
const MAXIMAL_LOCALIZATION_OBSERVATIONS: usize = 100;
const MAXIMAL_LOCALIZATION_OUTLIERS: usize = 2;

/// The state of the background worker which survives between iterations.
pub(crate) struct Background {
    latest_frame_index: Index32,
    rng: Xoshiro256PlusPlus,
}

impl Background {
    pub(crate) fn new(seed: u64) -> Self {
        Self {
            latest_frame_index: INVALID_INDEX,
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
        }
    }

    /// Runs every duty once for the latest frame.
    ///
    /// Returns `false` without doing anything if no new frame has been handled since the last run.
    pub(crate) fn run_once<P: LockProfiler>(&mut self, shared: &Shared<P>) -> bool {
        let pyramid = match shared.pyramids.newer_than(self.latest_frame_index) {
            Some(pyramid) => pyramid,
            None => return false,
        };
        let latest = pyramid.frame_index();
        self.latest_frame_index = latest;

        if shared.determine_initial_requested() {
            {
                let _scoped = shared.performance.scoped(Stage::DetermineInitialObjectPoints);
                shared.determine_initial_object_points(latest, &mut self.rng);
            }
            // The foreground raises the flag again while it still needs object points.
            shared.task_determine_initial.store(false, Ordering::Release);
            return true;
        }

        if shared.camera_poses.has_pose(latest) {
            let ids = shared.inaccurate.take();
            if !ids.is_empty() {
                let _scoped = shared.performance.scoped(Stage::OptimizeInaccurateObjectPoints);
                shared.update_inaccurate_object_points(latest, ids);
            }
        } else if shared.state() == TrackerState::Tracking {
            let relocalized = {
                let _scoped = shared.performance.scoped(Stage::Relocalize);
                shared.relocalize(latest, &pyramid, &mut self.rng)
            };
            if relocalized {
                return true;
            }
        }

        if shared.should_stop() {
            return true;
        }
        {
            let _scoped = shared.performance.scoped(Stage::BundleAdjustment);
            shared.bundle_adjustment(latest);
        }

        if shared.should_stop() {
            return true;
        }
        {
            let _scoped = shared.performance.scoped(Stage::LocalizeUnlocalizedObjectPoints);
            shared.localize_unlocalized_object_points(latest, &mut self.rng);
        }
        {
            let _scoped = shared.performance.scoped(Stage::DescribeObjectPoints);
            shared.describe_object_points(latest, &pyramid);
        }
        true
    }
}

impl<P: LockProfiler> Shared<P> {
    /// Reconstructs the first object points from two frames of the longest point tracks.
    ///
    /// On success the map is replaced, the map version incremented, and both frames get a pose.
    pub(crate) fn determine_initial_object_points(
        &self,
        latest: Index32,
        rng: &mut impl Rng,
    ) -> bool {
        let camera = &*self.camera;
        let configuration = &self.configuration;

        let map = self
            .map
            .read("Shared::determine_initial_object_points(), select tracks");
        let observed: Vec<_> = map
            .tracks
            .values()
            .filter(|track| track.last_frame_index() == latest)
            .collect();
        if observed.len() < MINIMAL_INITIAL_TRACKS {
            trace!(
                "only {} tracks in frame {}, but needed {} for the initial object points",
                observed.len(),
                latest,
                MINIMAL_INITIAL_TRACKS
            );
            return false;
        }

        let mut lengths: Vec<usize> = observed
            .iter()
            .map(|track| track.len_until(latest))
            .collect();
        let track_length = match percentile_usize(&mut lengths, 0.95) {
            Some(length) if length >= configuration.initial_minimal_track_length => length,
            length => {
                trace!(
                    "tracks of {:?} frames are too short for the initial object points",
                    length
                );
                return false;
            }
        };
        let span = (track_length / 2).max(2) as Index32;
        let first = (latest + 1).saturating_sub(span);

        let mut ids = vec![];
        let mut first_points = vec![];
        let mut latest_points = vec![];
        for track in observed {
            if let Some(first_point) = track.image_point(first) {
                ids.push(track.id());
                first_points.push(first_point);
                latest_points.push(track.last_image_point());
            }
        }
        map.unlock();

        if ids.len() < configuration.minimal_number_correspondences {
            trace!(
                "only {} tracks span frames {} to {}, but needed {}",
                ids.len(),
                first,
                latest,
                configuration.minimal_number_correspondences
            );
            return false;
        }

        let result = match TwoViewEstimator::new()
            .maximal_sqr_error(configuration.maximal_sqr_projection_error())
            .minimal_inliers(configuration.minimal_number_correspondences)
            .homography_iterations(configuration.initial_stereo_iterations)
            .estimate(camera, &first_points, &latest_points, rng)
        {
            Some(result) => result,
            None => {
                debug!("no initial reconstruction between frames {} and {}", first, latest);
                return false;
            }
        };

        // Both centers in the first flipped camera frame.
        let first_center = Point3::origin();
        let second_center = result.second_t_first.0.inverse() * Point3::origin();
        let mut angles: Vec<f64> = result
            .object_points
            .iter()
            .map(|point| viewing_angle(&first_center, &second_center, point))
            .collect();
        let angle = percentile(&mut angles, 0.75).unwrap_or(0.0);
        if angle < configuration.initial_minimal_viewing_angle.to_radians() {
            debug!(
                "rejecting the initial reconstruction between frames {} and {} with a viewing angle of {:.2} degrees",
                first,
                latest,
                angle.to_degrees()
            );
            return false;
        }

        let scale = configuration.initial_baseline;
        let flip = flip_isometry();
        let second_t_first = CameraToCamera(IsometryMatrix3::from_parts(
            Translation3::from(result.second_t_first.0.translation.vector * scale),
            result.second_t_first.0.rotation,
        ));
        let flipped_first_t_world = WorldToCamera(flip);
        let flipped_second_t_world = WorldToCamera(second_t_first.0 * flip);

        let mut map = self
            .map
            .write("Shared::determine_initial_object_points(), commit");
        self.reset_localized_object_points(&mut map);
        map.map_version += 1;
        let map_version = map.map_version;
        for (&ix, point) in result.inliers.iter().zip(&result.object_points) {
            let id = ids[ix];
            if let Some(track) = map.tracks.remove(&id) {
                let world_point = flip * (*point * scale);
                map.localized.insert(
                    id,
                    LocalizedObjectPoint::from_track(
                        &track,
                        world_point,
                        LocalizationPrecision::Unknown,
                        true,
                    ),
                );
                map.bundle_adjusted_ids.insert(id);
            }
        }
        map.key_frames = vec![first, latest];
        map.bundle_adjustment_sqr_baseline = scale * scale;
        let number_points = map.localized.len();

        for (frame_index, flipped_camera_t_world) in
            [(first, flipped_first_t_world), (latest, flipped_second_t_world)]
        {
            self.camera_poses.set_pose(
                frame_index,
                CameraPose::from_flipped(
                    flipped_camera_t_world,
                    PoseQuality::Low,
                    EstimatedMotion::Translational,
                ),
                map_version,
            );
        }
        map.unlock();

        self.correspondences_outdated.store(true, Ordering::Release);
        info!(
            "initialized {} object points between frames {} and {} with a viewing angle of {:.2} degrees",
            number_points,
            first,
            latest,
            angle.to_degrees()
        );
        true
    }

    /// Forgets every localized point and pose, the point tracks stay.
    pub(crate) fn reset_localized_object_points(&self, map: &mut MapState) {
        if !map.localized.is_empty() {
            info!("resetting the map with {} object points", map.localized.len());
        }
        map.localized.clear();
        map.key_frames.clear();
        map.bundle_adjustment_sqr_baseline = f64::MIN;
        map.bundle_adjusted_ids.clear();
        map.redirects.clear();
        self.inaccurate.clear();
        self.camera_poses.remove_poses();
    }

    /// Moves the points which did not agree with a camera pose, or erases them.
    ///
    /// Points without enough observations yet are checked again later.
    pub(crate) fn update_inaccurate_object_points(&self, latest: Index32, ids: HashSet<Index32>) {
        let mut ids: Vec<Index32> = ids.into_iter().collect();
        ids.sort_unstable();

        let map = self.map.read("Shared::update_inaccurate_object_points(), copy");
        let map_version = map.map_version;
        let points: Vec<(Index32, LocalizedObjectPoint)> = ids
            .into_iter()
            .filter_map(|id| map.localized.get(&id).map(|point| (id, point.clone())))
            .collect();
        map.unlock();

        let mut retry = vec![];
        let mut results = vec![];
        for (id, point) in points {
            if !point.has_observation(latest) {
                retry.push(id);
                continue;
            }
            match point.optimized_position(
                &*self.camera,
                &self.camera_poses,
                map_version,
                INACCURATE_MINIMAL_OBSERVATIONS,
                self.configuration.maximal_projection_error,
                RobustEstimator::Huber,
                POINT_ITERATIONS,
            ) {
                OptimizationResult::NotEnoughObservations => retry.push(id),
                result => results.push((id, result)),
            }
        }

        let mut map = self.map.write("Shared::update_inaccurate_object_points(), commit");
        if map.map_version != map_version {
            return;
        }
        let (mut moved, mut erased) = (0, 0);
        for (id, result) in results {
            match result {
                OptimizationResult::Succeeded(position) => {
                    if let Some(point) = map.localized.get_mut(&id) {
                        point.set_position(position, false);
                        moved += 1;
                    }
                }
                _ => {
                    if map.localized.remove(&id).is_some() {
                        map.bundle_adjusted_ids.remove(&id);
                        erased += 1;
                    }
                }
            }
        }
        map.unlock();
        self.inaccurate.add(retry);

        if moved + erased > 0 {
            self.correspondences_outdated.store(true, Ordering::Release);
            debug!(
                "moved {} and erased {} inaccurate object points in frame {}",
                moved, erased, latest
            );
        }
    }

    /// Triangulates the point tracks observed in the latest frame.
    ///
    /// Returns the number of tracks which became localized object points.
    pub(crate) fn localize_unlocalized_object_points(
        &self,
        latest: Index32,
        rng: &mut impl Rng,
    ) -> usize {
        let camera = &*self.camera;
        let configuration = &self.configuration;
        let pose = match self.camera_poses.pose(latest) {
            Some(pose) if pose.motion() == EstimatedMotion::Translational => pose,
            _ => return 0,
        };
        let map_version = pose.map_version();
        let sqr_maximal_error = configuration.maximal_sqr_projection_error();
        let minimal_angle = configuration.localization_minimal_viewing_angle.to_radians();
        let minimal_observations = configuration.localization_minimal_observations.max(2);

        let map = self
            .map
            .read("Shared::localize_unlocalized_object_points(), select tracks");
        if map.map_version != map_version {
            return 0;
        }
        // The observations of each track with a pose of the current map version, newest first.
        let candidates: Vec<(Index32, Vec<(WorldToCamera, Point2<f64>)>)> = map
            .tracks
            .iter()
            .filter(|(_, track)| {
                track.last_frame_index() == latest && track.len() >= minimal_observations
            })
            .filter_map(|(&id, track)| {
                let observations: Vec<(Index32, Point2<f64>)> = track
                    .observations()
                    .rev()
                    .take(MAXIMAL_LOCALIZATION_OBSERVATIONS)
                    .collect();
                let frames: Vec<Index32> = observations.iter().map(|&(frame, _)| frame).collect();
                let posed: Vec<(WorldToCamera, Point2<f64>)> = self
                    .camera_poses
                    .poses(&frames)
                    .into_iter()
                    .zip(&observations)
                    .filter_map(|(pose, &(_, image_point))| {
                        let pose = pose.filter(|pose| pose.map_version() == map_version)?;
                        Some((*pose.flipped_camera_t_world(), image_point))
                    })
                    .collect();
                (posed.len() >= minimal_observations).then(|| (id, posed))
            })
            .collect();
        map.unlock();

        let mut localized = vec![];
        for (id, observations) in candidates {
            let (point, inliers) = match triangulate_ransac(
                camera,
                &observations,
                LOCALIZATION_RANSAC_ITERATIONS,
                sqr_maximal_error,
                rng,
            ) {
                Some(triangulated) => triangulated,
                None => continue,
            };
            if observations.len() - inliers.len() > MAXIMAL_LOCALIZATION_OUTLIERS {
                continue;
            }
            let point = optimize_point(
                camera,
                &observations,
                &point,
                RobustEstimator::Huber,
                sqr_maximal_error,
                POINT_ITERATIONS,
            )
            .map_or(point, |optimization| optimization.point);

            let in_front = observations
                .iter()
                .all(|(pose, _)| is_object_point_in_front_if(pose, &point));
            let accurate = inliers.iter().all(|&ix| {
                let (pose, image_point) = &observations[ix];
                sqr_projection_error(camera, pose, &point, image_point) <= sqr_maximal_error
            });
            if !in_front || !accurate {
                continue;
            }

            let newest = camera_center(&observations[0].0);
            let angle = observations[1..]
                .iter()
                .map(|(pose, _)| viewing_angle(&newest, &camera_center(pose), &point))
                .fold(0.0, f64::max);
            if angle < minimal_angle {
                continue;
            }

            let poses: Vec<WorldToCamera> = inliers.iter().map(|&ix| observations[ix].0).collect();
            let precision = determine_precision(camera, &poses, &point);
            if precision == LocalizationPrecision::Invalid {
                continue;
            }
            localized.push((id, point, precision));
        }
        if localized.is_empty() {
            return 0;
        }

        let mut map = self
            .map
            .write("Shared::localize_unlocalized_object_points(), commit");
        if self.determine_initial_requested() || map.map_version != map_version {
            return 0;
        }
        let mut count = 0;
        for (id, point, precision) in localized {
            if let Some(track) = map.tracks.remove(&id) {
                map.localized.insert(
                    id,
                    LocalizedObjectPoint::from_track(&track, point, precision, false),
                );
                count += 1;
            }
        }
        let total = map.localized.len();
        map.unlock();

        if count > 0 {
            self.correspondences_outdated.store(true, Ordering::Release);
        }
        debug!(
            "localized {} point tracks in frame {}, {} object points in total",
            count, latest, total
        );
        count
    }
}
