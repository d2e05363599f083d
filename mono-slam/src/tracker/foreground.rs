use super::pose::estimate_pose;
use super::{MapState, Shared, TrackerState};
use crate::lock::LockProfiler;
use crate::{
    Configuration, DebugData, FrameStatistics, LocalizationPrecision, OccupancyArray, PointTrack,
    PoseCorrespondences, SlamError, Stage, TrackingCorrespondences,
};
use cv_core::nalgebra::{IsometryMatrix3, Point2, Translation3, UnitQuaternion, Vector3};
use log::{debug, info, trace, warn};
use mono_core::{
    flipped_from_standard, is_object_point_in_front_if, AnyCamera, CameraPose, EstimatedMotion,
    Index32, PoseQuality, INVALID_INDEX,
};
use mono_image::descriptor::{best_distance, compute_descriptor, matching_threshold};
use mono_image::{Descriptor, Frame, FramePyramid, HarrisDetector, PatchTracker};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

/// The neighborhood of every occupancy bin, in bins per direction.
const OCCUPANCY_NEIGHBORHOOD: u32 = 3;
/// Below this coverage the Harris threshold is lowered to find more corners.
const HARRIS_COVERAGE: f32 = 0.4;

/// A tracked frame whose results are not part of the map yet.
pub(crate) struct PendingFrame {
    pub(crate) frame_index: Index32,
    pyramid: Arc<FramePyramid>,
    pose: Option<CameraPose>,
    statistics: FrameStatistics,
}

/// The tracking state, owned by one thread at a time.
pub(crate) struct Foreground {
    patch_tracker: PatchTracker,
    layers: usize,
    previous: Option<Arc<FramePyramid>>,
    current: Option<Arc<FramePyramid>>,
    any_world_q_previous: Option<UnitQuaternion<f64>>,
    /// The points of the previous frame, tracked into the current frame.
    tracking: TrackingCorrespondences,
    /// The inliers of the current pose.
    pose_correspondences: PoseCorrespondences,
    occupancy: OccupancyArray,
    harris_threshold: u32,
    /// The first frame of a series without pose.
    failed_frame_index: Index32,
    rng: Xoshiro256PlusPlus,
    frame_statistics: Vec<FrameStatistics>,
    debug: Option<DebugData>,
}

impl Foreground {
    pub(crate) fn new(configuration: &Configuration, camera: &dyn AnyCamera) -> Self {
        let layers = FramePyramid::ideal_layers(
            camera.width(),
            camera.height(),
            configuration.tracking_maximal_offset,
            configuration.tracking_coarsest_layer_radius,
        );
        debug!(
            "tracking with {} pyramid layers and {} x {} patches",
            layers, configuration.tracking_patch_size, configuration.tracking_patch_size
        );
        Self {
            patch_tracker: configuration.patch_tracker(),
            layers,
            previous: None,
            current: None,
            any_world_q_previous: None,
            tracking: TrackingCorrespondences::default(),
            pose_correspondences: PoseCorrespondences::default(),
            occupancy: OccupancyArray::new(
                camera.width(),
                camera.height(),
                configuration.occupancy_bins,
                OCCUPANCY_NEIGHBORHOOD,
                configuration.occupancy_minimal_coverage,
            ),
            harris_threshold: configuration.harris_threshold_initial,
            failed_frame_index: INVALID_INDEX,
            rng: Xoshiro256PlusPlus::seed_from_u64(configuration.random_seed),
            frame_statistics: vec![],
            debug: configuration.debug_data_enabled.then(DebugData::default),
        }
    }

    pub(crate) fn frame_statistics(&self) -> &[FrameStatistics] {
        &self.frame_statistics
    }

    pub(crate) fn debug_data(&self) -> Option<&DebugData> {
        self.debug.as_ref()
    }

    /// Tracks one frame and returns its pose together with the work left for
    /// [`finish_frame`](Self::finish_frame).
    ///
    /// Nothing is touched if the pyramid of the frame cannot be created.
    pub(crate) fn handle_frame<P: LockProfiler>(
        &mut self,
        shared: &Shared<P>,
        frame: &Frame,
        camera_gravity: &Vector3<f64>,
        any_world_q_camera: Option<&UnitQuaternion<f64>>,
    ) -> Result<(CameraPose, PendingFrame), SlamError> {
        let started = Instant::now();
        let pyramid = Arc::new(FramePyramid::new(frame, self.layers)?);
        let _scoped = shared.performance.scoped(Stage::HandleFrame);
        let configuration = &shared.configuration;

        if shared.state() == TrackerState::Unknown {
            shared.set_state(TrackerState::Initializing);
        }

        let frame_index = shared.camera_poses.next_frame();
        shared.gravities.set_gravity(frame_index, camera_gravity);

        self.previous = self.current.replace(pyramid.clone());
        let previous_q_current = match (&self.any_world_q_previous, any_world_q_camera) {
            (Some(any_world_q_previous), Some(any_world_q_camera)) => {
                Some(any_world_q_previous.inverse() * any_world_q_camera)
            }
            _ => None,
        };

        let mut statistics = FrameStatistics::new(frame_index);
        let mut reported = CameraPose::invalid();
        if let Some(pose) = self.track_image_points_and_determine_pose(
            shared,
            frame_index,
            previous_q_current.as_ref(),
            &mut statistics,
        ) {
            let map_version = self.tracking.map_version();
            if shared.state() == TrackerState::Initializing
                && pose.quality() >= PoseQuality::Medium
                && self.pose_correspondences.len() >= configuration.tracking_switch_correspondences
            {
                info!(
                    "switching to tracking in frame {} with {} correspondences",
                    frame_index,
                    self.pose_correspondences.len()
                );
                shared.set_state(TrackerState::Tracking);
            }
            if shared.camera_poses.set_pose(frame_index, pose, map_version) {
                reported = pose.with_map_version(map_version);
            }
        }

        self.any_world_q_previous = any_world_q_camera.copied();
        statistics.duration = started.elapsed();
        let pending = PendingFrame {
            frame_index,
            pyramid,
            pose: reported.is_valid().then(|| reported),
            statistics,
        };
        Ok((reported, pending))
    }

    /// Updates the map with the results of a handled frame, the second half of every frame.
    pub(crate) fn finish_frame<P: LockProfiler>(
        &mut self,
        shared: &Shared<P>,
        pending: PendingFrame,
    ) {
        let PendingFrame {
            frame_index,
            pyramid,
            pose,
            mut statistics,
        } = pending;
        let started = Instant::now();
        statistics.new_point_tracks =
            self.post_handle_frame(shared, frame_index, &pyramid, pose.as_ref());
        statistics.duration += started.elapsed();
        if shared.configuration.frame_statistics_enabled {
            self.frame_statistics.push(statistics);
        }
    }

    fn track_image_points_and_determine_pose<P: LockProfiler>(
        &mut self,
        shared: &Shared<P>,
        frame_index: Index32,
        previous_q_current: Option<&UnitQuaternion<f64>>,
        statistics: &mut FrameStatistics,
    ) -> Option<CameraPose> {
        let (previous, current) = match (&self.previous, &self.current) {
            (Some(previous), Some(current)) => (previous.clone(), current.clone()),
            _ => return None,
        };
        let camera = &*shared.camera;
        let configuration = &shared.configuration;

        if shared.correspondences_outdated.swap(false, Ordering::AcqRel)
            && self.tracking.frame_index() != INVALID_INDEX
        {
            let map = shared
                .map
                .read("Foreground::track_image_points(), refresh correspondences");
            let tracked_frame_index = self.tracking.frame_index();
            self.tracking.update(
                tracked_frame_index,
                map.map_version,
                &map.localized,
                &map.tracks,
                LocalizationPrecision::Unknown,
            );
        }

        let prior = shared
            .camera_poses
            .pose(frame_index.wrapping_sub(1))
            .filter(|pose| pose.map_version() == self.tracking.map_version());

        {
            let _scoped = shared.performance.scoped(Stage::TrackImagePoints);
            let predictions =
                previous_q_current.map(|q| self.tracking.predicted_image_points(camera, q));
            self.tracking.track(
                &self.patch_tracker,
                &previous,
                &current,
                predictions.as_deref(),
            );
        }
        statistics.tracking_possible = self.tracking.len();
        statistics.tracking_actual = self.tracking.number_valid();
        statistics.map_version = self.tracking.map_version();
        if let Some(debug) = &mut self.debug {
            debug.update_tracks(frame_index, &self.tracking);
        }

        if shared.determine_initial_requested() {
            self.pose_correspondences.clear();
            return None;
        }

        self.pose_correspondences.reset(&self.tracking);
        if self.pose_correspondences.len() >= configuration.minimal_number_correspondences {
            let _scoped = shared.performance.scoped(Stage::DetermineCameraPose);
            if let Some(pose) = self.determine_pose(shared, prior, previous_q_current, statistics) {
                if self.failed_frame_index != INVALID_INDEX
                    && shared.state() == TrackerState::Tracking
                {
                    info!("tracking again in frame {}", frame_index);
                }
                self.failed_frame_index = INVALID_INDEX;
                return Some(pose);
            }
        } else if !self.pose_correspondences.is_empty() {
            trace!(
                "only found {} correspondences, but needed {}; rejecting pose",
                self.pose_correspondences.len(),
                configuration.minimal_number_correspondences
            );
        }

        match shared.state() {
            TrackerState::Initializing => {
                if self.pose_correspondences.is_empty() && self.failed_frame_index == INVALID_INDEX
                {
                    // Give the background worker one frame to publish fresh object points.
                    self.failed_frame_index = frame_index;
                } else {
                    if !self.pose_correspondences.is_empty() {
                        warn!(
                            "lost the initial object points in frame {} with {} correspondences left",
                            frame_index,
                            self.pose_correspondences.len()
                        );
                    }
                    shared.task_determine_initial.store(true, Ordering::Release);
                    self.failed_frame_index = INVALID_INDEX;
                }
            }
            TrackerState::Tracking => {
                if self.failed_frame_index == INVALID_INDEX {
                    info!("lost tracking in frame {}", frame_index);
                    self.failed_frame_index = frame_index;
                }
            }
            TrackerState::Unknown => {}
        }
        self.pose_correspondences.clear();
        None
    }

    /// Determines the pose from the pose correspondences and keeps only its inliers.
    ///
    /// A pose of the previous frame, rotated by the external orientation if known, is the initial
    /// guess for the optimization.
    fn determine_pose<P: LockProfiler>(
        &mut self,
        shared: &Shared<P>,
        prior: Option<CameraPose>,
        previous_q_current: Option<&UnitQuaternion<f64>>,
        statistics: &mut FrameStatistics,
    ) -> Option<CameraPose> {
        let camera = &*shared.camera;
        let configuration = &shared.configuration;
        let initial = prior.map(|prior| {
            let world_t_camera = match previous_q_current {
                Some(q) => {
                    prior.world_t_camera()
                        * IsometryMatrix3::from_parts(Translation3::identity(), q.to_rotation_matrix())
                }
                None => *prior.world_t_camera(),
            };
            flipped_from_standard(&world_t_camera)
        });

        let correspondences = &self.pose_correspondences;
        let estimate = estimate_pose(
            camera,
            initial.as_ref(),
            &correspondences.object_points,
            &correspondences.image_points,
            &correspondences.precisions,
            configuration.maximal_sqr_projection_error(),
            configuration.minimal_number_correspondences,
            &mut self.rng,
        )?;
        let motion = EstimatedMotion::from_mean_flow(
            self.tracking.mean_flow().unwrap_or(0.0),
            camera.width(),
            camera.height(),
        );
        let pose = CameraPose::from_flipped(estimate.flipped_camera_t_world, estimate.quality, motion);
        if !pose.is_valid() {
            return None;
        }

        let mut kept = PoseCorrespondences::default();
        let mut outliers = vec![];
        let mut error_sum = 0.0;
        for ix in 0..correspondences.len() {
            let id = correspondences.object_point_ids[ix];
            if estimate.inliers[ix] {
                error_sum += estimate.sqr_errors[ix].sqrt();
                kept.push(
                    id,
                    correspondences.object_points[ix],
                    correspondences.image_points[ix],
                    correspondences.precisions[ix],
                );
            } else {
                outliers.push(id);
            }
        }

        if let Some(debug) = &mut self.debug {
            debug.pose_precise_ids.clear();
            debug.pose_imprecise_ids.clear();
            for (&id, &precision) in kept.object_point_ids.iter().zip(&kept.precisions) {
                if precision >= LocalizationPrecision::Medium {
                    debug.pose_precise_ids.insert(id);
                } else {
                    debug.pose_imprecise_ids.insert(id);
                }
            }
            debug.inaccurate_ids = outliers.iter().copied().collect();
        }

        statistics.pose_correspondences = estimate.number_inliers;
        statistics.projection_error = Some(error_sum / estimate.number_inliers as f64);
        statistics.world_t_camera = Some(*pose.world_t_camera());
        statistics.quality = estimate.quality;

        trace!(
            "pose with {} inliers, {} outliers, {} quality and {} motion",
            estimate.number_inliers,
            outliers.len(),
            estimate.quality.name(),
            motion.name()
        );
        shared.inaccurate.add(outliers);
        self.pose_correspondences = kept;
        Some(pose)
    }

    /// Updates the map with the tracking results and prepares the correspondences of the next frame.
    ///
    /// Returns the number of new point tracks.
    fn post_handle_frame<P: LockProfiler>(
        &mut self,
        shared: &Shared<P>,
        frame_index: Index32,
        pyramid: &Arc<FramePyramid>,
        pose: Option<&CameraPose>,
    ) -> usize {
        self.occupancy.remove_points();

        let mut map = shared
            .map
            .write("Foreground::post_handle_frame(), process tracking results");
        self.process_tracking_results(&mut map, frame_index);
        map.unlock();

        let new_point_tracks = self.detect_new_image_points(shared, frame_index, pyramid, pose);
        shared.pyramids.update_latest(frame_index, pyramid.clone());

        let map = shared
            .map
            .read("Foreground::post_handle_frame(), update correspondences");
        self.tracking.update(
            frame_index,
            map.map_version,
            &map.localized,
            &map.tracks,
            LocalizationPrecision::Unknown,
        );
        if let Some(debug) = &mut self.debug {
            debug.update_points(&map.localized);
        }
        new_point_tracks
    }

    fn process_tracking_results(&mut self, map: &mut MapState, frame_index: Index32) {
        let mut removed = 0;
        for (id, _, current, _, _) in self.tracking.iter() {
            let id = match map.resolve(id) {
                Some(id) => id,
                None => continue,
            };
            match current {
                Some(image_point) => {
                    self.occupancy.add_point(&image_point);
                    if let Some(point) = map.localized.get_mut(&id) {
                        point.add_observation(frame_index, image_point);
                    } else if let Some(track) = map.tracks.get_mut(&id) {
                        track.add_observation(frame_index, image_point);
                    }
                }
                None => {
                    if let Some(point) = map.localized.get(&id) {
                        if point.precision() < LocalizationPrecision::Low {
                            map.localized.remove(&id);
                            removed += 1;
                        }
                    } else if map.tracks.remove(&id).is_some() {
                        removed += 1;
                    }
                }
            }
        }
        map.redirects.clear();
        trace!("removed {} lost points in frame {}", removed, frame_index);
    }

    fn detect_new_image_points<P: LockProfiler>(
        &mut self,
        shared: &Shared<P>,
        frame_index: Index32,
        pyramid: &FramePyramid,
        pose: Option<&CameraPose>,
    ) -> usize {
        let configuration = &shared.configuration;
        if !self.occupancy.need_more_points()
            && self.occupancy.number_points() >= configuration.tracking_number_feature_points
        {
            return 0;
        }
        let _scoped = shared.performance.scoped(Stage::DetectNewImagePoints);

        let mut corners: Vec<Point2<f64>> = HarrisDetector::new(f64::from(self.harris_threshold))
            .detect(pyramid.finest())
            .into_iter()
            .map(|corner| corner.point)
            .collect();
        let number_corners = corners.len();

        if let Some(pose) = pose {
            let _scoped = shared
                .performance
                .scoped(Stage::MatchCornersToLocalizedObjectPoints);
            self.match_corners(shared, frame_index, pyramid, pose, &mut corners);
        }

        let mut map = shared.map.write("Foreground::detect_new_image_points()");
        let mut new_point_tracks = 0;
        for corner in corners {
            if self.occupancy.add_point_if_empty(&corner) {
                let id = map.next_object_point_id;
                map.next_object_point_id += 1;
                map.tracks.insert(id, PointTrack::new(id, frame_index, corner));
                new_point_tracks += 1;
            }
        }
        map.unlock();

        let coverage = self.occupancy.coverage();
        self.harris_threshold = if coverage < HARRIS_COVERAGE {
            self.harris_threshold
                .saturating_sub(1)
                .max(configuration.harris_threshold_minimum)
        } else {
            (self.harris_threshold + 1).min(configuration.harris_threshold_maximum)
        };
        trace!(
            "added {} of {} corners as new point tracks, coverage {:.1}%, harris threshold {}",
            new_point_tracks,
            number_corners,
            coverage * 100.0,
            self.harris_threshold
        );
        new_point_tracks
    }

    /// Matches corners against localized points projected into the current frame.
    ///
    /// Matched corners observe their localized point and are removed from `corners`.
    fn match_corners<P: LockProfiler>(
        &mut self,
        shared: &Shared<P>,
        frame_index: Index32,
        pyramid: &FramePyramid,
        pose: &CameraPose,
        corners: &mut Vec<Point2<f64>>,
    ) {
        let camera = &*shared.camera;
        let configuration = &shared.configuration;
        let sqr_maximal_error = configuration.maximal_sqr_projection_error();
        let threshold = matching_threshold(configuration.descriptor_hamming_threshold);
        let flipped_camera_t_world = pose.flipped_camera_t_world();

        let mut descriptors: Vec<Option<Option<Descriptor>>> = vec![None; corners.len()];
        let mut taken = vec![false; corners.len()];
        let mut matched = 0;

        let mut map = shared.map.write("Foreground::match_corners()");
        for point in map.localized.values_mut() {
            if point.precision() < LocalizationPrecision::Low
                || point.descriptors().is_empty()
                || point.last_observation_frame_index() == Some(frame_index)
                || !is_object_point_in_front_if(flipped_camera_t_world, point.position())
            {
                continue;
            }
            let projected = camera.project_to_image_if(flipped_camera_t_world, point.position());
            if !camera.is_inside(&projected, 0.0) {
                continue;
            }

            let mut best: Option<(usize, u32)> = None;
            for (ix, corner) in corners.iter().enumerate() {
                if taken[ix] || (corner - projected).norm_squared() > sqr_maximal_error {
                    continue;
                }
                let descriptor = match descriptors[ix]
                    .get_or_insert_with(|| compute_descriptor(pyramid, corner))
                {
                    Some(descriptor) => descriptor,
                    None => continue,
                };
                if let Some(distance) = best_distance(descriptor, point.descriptors()) {
                    if distance < threshold && best.map_or(true, |(_, best)| distance < best) {
                        best = Some((ix, distance));
                    }
                }
            }

            if let Some((ix, _)) = best {
                taken[ix] = true;
                point.add_observation(frame_index, corners[ix]);
                self.occupancy.add_point(&corners[ix]);
                matched += 1;
            }
        }
        map.unlock();

        let mut taken = taken.into_iter();
        corners.retain(|_| !taken.next().unwrap_or(false));
        trace!("matched {} corners to localized object points", matched);
    }
}
