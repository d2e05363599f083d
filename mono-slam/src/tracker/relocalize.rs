//! Relocalization with binary descriptors after tracking has been lost.

use super::pose::estimate_pose;
use super::Shared;
use crate::lock::LockProfiler;
use crate::LocalizationPrecision;
use cv_core::nalgebra::{Point2, Point3};
use log::{debug, info, trace};
use mono_core::{CameraPose, EstimatedMotion, Index32, MapVersion};
use mono_image::descriptor::{
    best_distance, compute_descriptor, compute_descriptors, matching_threshold,
};
use mono_image::{Descriptor, FramePyramid};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

/// A localized point which can be matched by its descriptors.
struct Described {
    id: Index32,
    position: Point3<f64>,
    precision: LocalizationPrecision,
    last_frame_index: Index32,
    descriptors: Vec<Descriptor>,
}

impl<P: LockProfiler> Shared<P> {
    /// Determines the pose of the latest frame by matching its point tracks against the map.
    ///
    /// Matched tracks are merged into their localized points, and the poses of the neighboring
    /// frames are determined afterwards.
    pub(crate) fn relocalize(
        &self,
        latest: Index32,
        pyramid: &FramePyramid,
        rng: &mut impl Rng,
    ) -> bool {
        let camera = &*self.camera;
        let configuration = &self.configuration;

        let map = self.map.read("Shared::relocalize(), copy");
        let map_version = map.map_version;
        let tracks: Vec<(Index32, Index32, Point2<f64>)> = map
            .tracks
            .iter()
            .filter(|(_, track)| track.last_frame_index() == latest)
            .map(|(&id, track)| (id, track.first_frame_index(), track.last_image_point()))
            .collect();
        if tracks.len() < configuration.relocalization_minimal_tracks {
            trace!(
                "only {} tracks in frame {} for relocalization, needed {}",
                tracks.len(),
                latest,
                configuration.relocalization_minimal_tracks
            );
            return false;
        }
        let described: Vec<Described> = map
            .localized
            .iter()
            .filter(|(_, point)| !point.descriptors().is_empty())
            .filter_map(|(&id, point)| {
                Some(Described {
                    id,
                    position: *point.position(),
                    precision: point.precision(),
                    last_frame_index: point.last_observation_frame_index()?,
                    descriptors: point.descriptors().to_vec(),
                })
            })
            .collect();
        map.unlock();
        if described.len() < configuration.relocalization_minimal_localized_points {
            trace!(
                "only {} described object points for relocalization, needed {}",
                described.len(),
                configuration.relocalization_minimal_localized_points
            );
            return false;
        }

        let image_points: Vec<Point2<f64>> = tracks.iter().map(|&(_, _, point)| point).collect();
        let track_descriptors = compute_descriptors(pyramid, &image_points);
        let threshold = matching_threshold(configuration.descriptor_hamming_threshold);

        // The best localized point of every track, `track index -> (described index, distance)`.
        let mut matches: BTreeMap<usize, (usize, u32)> = BTreeMap::new();
        for (point_ix, point) in described.iter().enumerate() {
            let best = track_descriptors
                .iter()
                .enumerate()
                .filter_map(|(track_ix, descriptor)| {
                    let distance = best_distance(descriptor.as_ref()?, &point.descriptors)?;
                    (distance < threshold).then(|| (track_ix, distance))
                })
                .min_by_key(|&(_, distance)| distance);
            if let Some((track_ix, distance)) = best {
                let better = matches
                    .get(&track_ix)
                    .map_or(true, |&(_, existing)| distance < existing);
                if better {
                    matches.insert(track_ix, (point_ix, distance));
                }
            }
        }
        if matches.len() < configuration.minimal_number_correspondences {
            trace!("only {} descriptor matches in frame {}", matches.len(), latest);
            return false;
        }

        let pairs: Vec<(usize, usize)> = matches
            .iter()
            .map(|(&track_ix, &(point_ix, _))| (track_ix, point_ix))
            .collect();
        let object_points: Vec<Point3<f64>> =
            pairs.iter().map(|&(_, point_ix)| described[point_ix].position).collect();
        let match_points: Vec<Point2<f64>> =
            pairs.iter().map(|&(track_ix, _)| image_points[track_ix]).collect();
        let precisions: Vec<LocalizationPrecision> =
            pairs.iter().map(|&(_, point_ix)| described[point_ix].precision).collect();
        let estimate = match estimate_pose(
            camera,
            None,
            &object_points,
            &match_points,
            &precisions,
            configuration.maximal_sqr_projection_error(),
            configuration.minimal_number_correspondences,
            rng,
        ) {
            Some(estimate) => estimate,
            None => {
                debug!(
                    "no pose for {} descriptor matches in frame {}",
                    pairs.len(),
                    latest
                );
                return false;
            }
        };

        // A track can only continue a point which was lost before the track started.
        let merges: Vec<(Index32, Index32)> = pairs
            .iter()
            .zip(&estimate.inliers)
            .filter(|&(_, &inlier)| inlier)
            .filter_map(|(&(track_ix, point_ix), _)| {
                let (track_id, first_frame_index, _) = tracks[track_ix];
                let point = &described[point_ix];
                (point.last_frame_index < first_frame_index).then(|| (track_id, point.id))
            })
            .collect();
        if merges.len() < configuration.minimal_number_correspondences {
            trace!(
                "only {} of {} pose inliers can be merged in frame {}",
                merges.len(),
                estimate.number_inliers,
                latest
            );
            return false;
        }

        let mut guard = self.map.write("Shared::relocalize(), merge");
        if self.determine_initial_requested() || guard.map_version != map_version {
            return false;
        }
        let map = &mut *guard;
        let mut merged = 0;
        for &(track_id, localized_id) in &merges {
            let track = match map.tracks.remove(&track_id) {
                Some(track) => track,
                None => continue,
            };
            if let Some(point) = map.localized.get_mut(&localized_id) {
                point.add_observations(&track);
                map.redirects.insert(track_id, localized_id);
                merged += 1;
            } else {
                map.tracks.insert(track_id, track);
            }
        }
        self.camera_poses.set_pose(
            latest,
            CameraPose::from_flipped(
                estimate.flipped_camera_t_world,
                estimate.quality,
                EstimatedMotion::Unknown,
            ),
            map_version,
        );
        guard.unlock();

        self.correspondences_outdated.store(true, Ordering::Release);
        info!(
            "relocalized frame {} with {} inliers and {} quality, merged {} tracks",
            latest,
            estimate.number_inliers,
            estimate.quality.name(),
            merged
        );

        let determined = self.determine_camera_poses(latest, map_version, rng);
        if determined > 0 {
            debug!("determined {} poses around frame {}", determined, latest);
        }
        true
    }

    /// Determines the missing poses before and after `frame_index`, walking away from it until a
    /// frame has a pose or no pose can be found.
    ///
    /// Frames the foreground has not finished yet are left alone.
    pub(crate) fn determine_camera_poses(
        &self,
        frame_index: Index32,
        map_version: MapVersion,
        rng: &mut impl Rng,
    ) -> usize {
        let mut determined = 0;

        let mut neighbor = frame_index;
        for frame in (0..frame_index).rev() {
            if self.camera_poses.has_pose(frame) {
                break;
            }
            match self.determine_camera_pose(frame, neighbor, map_version, rng) {
                Some(pose) => {
                    self.camera_poses.set_pose(frame, pose, map_version);
                    neighbor = frame;
                    determined += 1;
                }
                None => break,
            }
        }

        let handled = self
            .pyramids
            .latest_frame_index()
            .min(self.camera_poses.frame_index());
        neighbor = frame_index;
        for frame in frame_index.saturating_add(1)..=handled {
            if self.camera_poses.has_pose(frame) {
                neighbor = frame;
                continue;
            }
            match self.determine_camera_pose(frame, neighbor, map_version, rng) {
                Some(pose) => {
                    self.camera_poses.set_pose(frame, pose, map_version);
                    neighbor = frame;
                    determined += 1;
                }
                None => break,
            }
        }
        determined
    }

    /// Determines the pose of a past frame from the localized points observed in it.
    ///
    /// The pose of `neighbor` is the initial guess if it belongs to `map_version`.
    pub(crate) fn determine_camera_pose(
        &self,
        frame_index: Index32,
        neighbor: Index32,
        map_version: MapVersion,
        rng: &mut impl Rng,
    ) -> Option<CameraPose> {
        let configuration = &self.configuration;
        let prior = self
            .camera_poses
            .pose(neighbor)
            .filter(|pose| pose.map_version() == map_version);

        let map = self.map.read("Shared::determine_camera_pose()");
        if map.map_version != map_version {
            return None;
        }
        let mut object_points = vec![];
        let mut image_points = vec![];
        let mut precisions = vec![];
        for point in map.localized.values() {
            if point.precision() < LocalizationPrecision::Unknown {
                continue;
            }
            if let Some(image_point) = point.observation(frame_index) {
                object_points.push(*point.position());
                image_points.push(image_point);
                precisions.push(point.precision());
            }
        }
        map.unlock();

        let estimate = estimate_pose(
            &*self.camera,
            prior.as_ref().map(|pose| pose.flipped_camera_t_world()),
            &object_points,
            &image_points,
            &precisions,
            configuration.maximal_sqr_projection_error(),
            configuration.minimal_number_correspondences,
            rng,
        )?;
        Some(CameraPose::from_flipped(
            estimate.flipped_camera_t_world,
            estimate.quality,
            EstimatedMotion::Unknown,
        ))
    }

    /// Adds descriptors to the points observed in the latest frame which need one.
    pub(crate) fn describe_object_points(&self, latest: Index32, pyramid: &FramePyramid) -> usize {
        let map = self.map.read("Shared::describe_object_points(), select points");
        let candidates: Vec<(Index32, Point2<f64>)> = map
            .localized
            .iter()
            .filter(|(_, point)| point.need_descriptor(latest))
            .filter_map(|(&id, point)| match point.last_observation() {
                Some((frame_index, image_point)) if frame_index == latest => Some((id, image_point)),
                _ => None,
            })
            .collect();
        map.unlock();
        if candidates.is_empty() {
            return 0;
        }

        let descriptors: Vec<(Index32, Descriptor)> = candidates
            .into_iter()
            .filter_map(|(id, image_point)| Some((id, compute_descriptor(pyramid, &image_point)?)))
            .collect();

        let mut map = self.map.write("Shared::describe_object_points(), commit");
        let mut described = 0;
        for (id, descriptor) in descriptors {
            if let Some(point) = map.localized.get_mut(&id) {
                point.add_descriptor(latest, descriptor);
                described += 1;
            }
        }
        map.unlock();
        trace!("described {} object points in frame {}", described, latest);
        described
    }
}
