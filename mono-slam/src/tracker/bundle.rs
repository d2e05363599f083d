//! Keyframe selection and bundle adjustment.
//!
//! Bundle adjustment runs on a copy of the keyframe poses and the object points visible in at
//! least two keyframes. The map lock is released while the optimization runs and the result is
//! only committed if the map has not been replaced in the meantime.

use super::background::POINT_ITERATIONS;
use super::{MapState, Shared};
use crate::bundle_adjustment_quality;
use crate::lock::LockProfiler;
use cv_core::nalgebra::{Point2, Point3};
use cv_core::WorldToCamera;
use float_ord::FloatOrd;
use itertools::Itertools;
use log::{debug, trace};
use mono_core::{
    is_object_point_in_front_if, AnyCamera, CameraPose, EstimatedMotion, Index32, PoseQuality,
};
use mono_geom::triangulation::{camera_center, sqr_projection_error};
use mono_optimize::{
    optimize_point, BundleAdjustment, BundleObservation, GravityConstraints, RobustEstimator,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::Ordering;

/// A frame needs this many localized points to become a keyframe.
const MINIMAL_KEY_FRAME_POINTS: usize = 20;
const MINIMAL_BUNDLE_POINTS: usize = 10;
/// Points further away from the first keyframe are pulled back to this distance.
const MAXIMAL_POINT_DISTANCE: f64 = 10000.0;
/// The camera has to move this much more than the keyframe baseline to trigger an adjustment.
const BASELINE_FACTOR: f64 = 1.225;
const MINIMAL_ADJUSTED_RATIO: f64 = 0.5;
/// New keyframes are chosen among the frames whose point count is this close to the best one.
const CANDIDATE_BRACKET: f64 = 0.1;

/// The keyframes and object points of one bundle adjustment.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Topology {
    /// Ascending frame indices.
    pub(crate) key_frames: Vec<Index32>,
    pub(crate) point_ids: Vec<Index32>,
    /// The observations of every point as `(index into key_frames, image point)`.
    pub(crate) observations: Vec<Vec<(usize, Point2<f64>)>>,
}

impl<P: LockProfiler> Shared<P> {
    /// Whether the map around the latest frame should be bundle adjusted.
    pub(crate) fn is_bundle_adjustment_needed(
        &self,
        map: &MapState,
        latest: Index32,
        pose: &CameraPose,
    ) -> bool {
        let camera = &*self.camera;
        let sqr_maximal_error = self.configuration.maximal_sqr_projection_error();

        let errors: Vec<f64> = map
            .localized
            .values()
            .filter_map(|point| {
                let image_point = point.observation(latest)?;
                Some(sqr_projection_error(
                    camera,
                    pose.flipped_camera_t_world(),
                    point.position(),
                    &image_point,
                ))
            })
            .collect();
        if !errors.is_empty() {
            let average = errors.iter().sum::<f64>() / errors.len() as f64;
            if average >= sqr_maximal_error {
                trace!("average squared error {:.2} in frame {}", average, latest);
                return true;
            }
        }

        let (observed, adjusted) = bundle_adjustment_quality(&map.localized, latest);
        if observed > 0 && (adjusted as f64) < observed as f64 * MINIMAL_ADJUSTED_RATIO {
            trace!(
                "only {} of {} points in frame {} are bundle adjusted",
                adjusted,
                observed,
                latest
            );
            return true;
        }

        let center = pose.translation();
        let sqr_distance = self
            .camera_poses
            .poses(&map.key_frames)
            .into_iter()
            .flatten()
            .map(|key_frame| FloatOrd((key_frame.translation() - center).norm_squared()))
            .min()
            .map_or(f64::INFINITY, |FloatOrd(distance)| distance);
        sqr_distance >= map.bundle_adjustment_sqr_baseline * BASELINE_FACTOR * BASELINE_FACTOR
    }

    /// Selects the keyframes and points of the next bundle adjustment.
    ///
    /// The keyframes of the previous adjustment are kept as far as possible and extended by the
    /// frames furthest away from them. `None` is returned if not enough keyframes or points remain.
    pub(crate) fn determine_bundle_adjustment_topology(
        &self,
        map: &MapState,
        latest: Index32,
    ) -> Option<Topology> {
        let configuration = &self.configuration;
        let frames = self
            .camera_poses
            .valid_pose_frame_indices(latest, configuration.maximal_frame_history);
        let centers: BTreeMap<Index32, Point3<f64>> = frames
            .iter()
            .zip(self.camera_poses.poses(&frames))
            .filter_map(|(&frame_index, pose)| {
                let pose = pose.filter(|pose| pose.map_version() == map.map_version)?;
                Some((frame_index, Point3::from(pose.translation())))
            })
            .collect();

        let mut point_counts: BTreeMap<Index32, usize> = BTreeMap::new();
        for point in map.localized.values() {
            for (frame_index, _) in point.observations() {
                if centers.contains_key(&frame_index) {
                    *point_counts.entry(frame_index).or_default() += 1;
                }
            }
        }
        let count_of = |frame_index: &Index32| point_counts.get(frame_index).copied().unwrap_or(0);

        let mut key_frames: Vec<Index32> = map
            .key_frames
            .iter()
            .copied()
            .filter(|frame_index| centers.contains_key(frame_index))
            .collect();
        let maximal_new = configuration.maximal_number_new_key_frames;
        while !key_frames.is_empty()
            && key_frames.len() + maximal_new > configuration.maximal_number_key_frames
        {
            key_frames.remove(0);
        }
        if key_frames.is_empty() {
            let (frame_index, count) = point_counts
                .iter()
                .max_by_key(|&(_, &count)| count)
                .map(|(&frame_index, &count)| (frame_index, count))?;
            if count < MINIMAL_KEY_FRAME_POINTS {
                return None;
            }
            key_frames.push(frame_index);
        }

        for _ in 0..maximal_new {
            let candidates: Vec<(Index32, usize, f64)> = centers
                .iter()
                .filter(|(frame_index, _)| {
                    !key_frames.contains(frame_index)
                        && count_of(frame_index) >= MINIMAL_KEY_FRAME_POINTS
                })
                .map(|(&frame_index, center)| {
                    let distance = key_frames
                        .iter()
                        .map(|key_frame| FloatOrd((centers[key_frame] - *center).norm()))
                        .min()
                        .map_or(0.0, |FloatOrd(distance)| distance);
                    (frame_index, count_of(&frame_index), distance)
                })
                .collect();
            let best_count = match candidates.iter().map(|&(_, count, _)| count).max() {
                Some(count) => count,
                None => break,
            };
            let bracket = best_count as f64 * (1.0 - CANDIDATE_BRACKET);
            let furthest = |minimal_count: f64| {
                candidates
                    .iter()
                    .filter(|&&(_, count, _)| count as f64 >= minimal_count)
                    .max_by_key(|&&(_, _, distance)| FloatOrd(distance))
                    .copied()
            };
            let best = furthest(bracket);
            let largest = furthest(0.0);
            let chosen = match (best, largest) {
                (Some(best), Some(largest)) if best.2 * 2.0 < largest.2 => largest,
                (Some(best), _) => best,
                _ => break,
            };
            if chosen.2 <= f64::EPSILON {
                break;
            }
            key_frames.push(chosen.0);
            key_frames.sort_unstable();
        }

        if key_frames.len() < configuration.minimal_number_key_frames.max(2) {
            trace!(
                "only {} keyframes, but needed {}",
                key_frames.len(),
                configuration.minimal_number_key_frames
            );
            return None;
        }

        let mut topology = Topology {
            key_frames,
            ..Default::default()
        };
        for (&id, point) in &map.localized {
            let observations: Vec<(usize, Point2<f64>)> = topology
                .key_frames
                .iter()
                .enumerate()
                .filter_map(|(ix, &frame_index)| Some((ix, point.observation(frame_index)?)))
                .collect();
            if observations.len() >= 2 {
                topology.point_ids.push(id);
                topology.observations.push(observations);
            }
        }
        if topology.point_ids.len() < MINIMAL_BUNDLE_POINTS {
            trace!(
                "only {} points in {} keyframes",
                topology.point_ids.len(),
                topology.key_frames.len()
            );
            return None;
        }
        Some(topology)
    }

    /// Bundle adjusts keyframe poses and object points if needed.
    ///
    /// Points which were not part of the previous adjustment only join if the current keyframe
    /// poses explain them, the others are optimized afterwards against the adjusted keyframes and
    /// removed if that fails. Adjusted points which no longer fit their observations are kept but
    /// lose their membership in the adjusted set. A successful adjustment increments the map
    /// version.
    pub(crate) fn bundle_adjustment(&self, latest: Index32) -> bool {
        let camera = &*self.camera;
        let configuration = &self.configuration;
        let sqr_maximal_error = configuration.maximal_sqr_projection_error();
        let pose = match self.camera_poses.pose(latest) {
            Some(pose) if pose.motion() == EstimatedMotion::Translational => pose,
            _ => return false,
        };

        let map = self.map.read("Shared::bundle_adjustment(), copy");
        let map_version = map.map_version;
        if map_version != pose.map_version()
            || !self.is_bundle_adjustment_needed(&map, latest, &pose)
        {
            return false;
        }
        let topology = match self.determine_bundle_adjustment_topology(&map, latest) {
            Some(topology) => topology,
            None => return false,
        };
        let mut points: Vec<Point3<f64>> = topology
            .point_ids
            .iter()
            .filter_map(|id| map.localized.get(id).map(|point| *point.position()))
            .collect();
        let is_new: Vec<bool> = topology
            .point_ids
            .iter()
            .map(|id| !map.bundle_adjusted_ids.contains(id))
            .collect();
        map.unlock();

        let mut poses: Vec<WorldToCamera> = self
            .camera_poses
            .poses(&topology.key_frames)
            .into_iter()
            .flatten()
            .map(|pose| *pose.flipped_camera_t_world())
            .collect();
        if poses.len() != topology.key_frames.len() || points.len() != topology.point_ids.len() {
            return false;
        }

        // New points only join the adjustment if the keyframes already explain them.
        let (joining, excluded): (Vec<usize>, Vec<usize>) = (0..points.len()).partition(|&ix| {
            !is_new[ix]
                || explains(
                    camera,
                    &poses,
                    &points[ix],
                    &topology.observations[ix],
                    sqr_maximal_error,
                )
        });
        if joining.len() < MINIMAL_BUNDLE_POINTS {
            trace!("only {} consistent points for bundle adjustment", joining.len());
            return false;
        }

        let mut adjusted: Vec<Point3<f64>> = joining.iter().map(|&ix| points[ix]).collect();
        let observations: Vec<BundleObservation> = joining
            .iter()
            .enumerate()
            .flat_map(|(point, &ix)| {
                topology.observations[ix]
                    .iter()
                    .map(move |&(pose, image_point)| BundleObservation {
                        pose,
                        point,
                        image_point,
                    })
            })
            .collect();

        let mut adjustment = BundleAdjustment::new()
            .iterations(configuration.bundle_adjustment_iterations)
            .fixed_poses(1)
            .estimator(RobustEstimator::Square, sqr_maximal_error);
        if let Some(constraints) = self.gravity_constraints(&topology.key_frames, &poses) {
            adjustment = adjustment.gravity_constraints(constraints);
        }
        let report = match adjustment.optimize(camera, &mut poses, &mut adjusted, &observations) {
            Some(report) => report,
            None => return false,
        };

        let mut bundle_adjusted_ids: BTreeSet<Index32> = BTreeSet::new();
        for (&ix, point) in joining.iter().zip(&adjusted) {
            points[ix] = *point;
            if explains(
                camera,
                &poses,
                point,
                &topology.observations[ix],
                sqr_maximal_error,
            ) {
                bundle_adjusted_ids.insert(topology.point_ids[ix]);
            }
        }

        // The excluded points are refined against the adjusted keyframes which stay fixed.
        let mut inaccurate: BTreeSet<Index32> = BTreeSet::new();
        for &ix in &excluded {
            let observations = &topology.observations[ix];
            let posed: Vec<(WorldToCamera, Point2<f64>)> = observations
                .iter()
                .map(|&(pose_ix, image_point)| (poses[pose_ix], image_point))
                .collect();
            match optimize_point(
                camera,
                &posed,
                &points[ix],
                RobustEstimator::Square,
                sqr_maximal_error,
                POINT_ITERATIONS,
            ) {
                Some(optimization)
                    if explains(
                        camera,
                        &poses,
                        &optimization.point,
                        observations,
                        sqr_maximal_error,
                    ) =>
                {
                    points[ix] = optimization.point;
                    bundle_adjusted_ids.insert(topology.point_ids[ix]);
                }
                _ => {
                    inaccurate.insert(topology.point_ids[ix]);
                }
            }
        }

        let origin = camera_center(&poses[0]);
        for point in &mut points {
            let offset = *point - origin;
            let distance = offset.norm();
            if distance > MAXIMAL_POINT_DISTANCE {
                *point = origin + offset * (MAXIMAL_POINT_DISTANCE / distance);
            }
        }
        let sqr_baseline = poses
            .iter()
            .map(camera_center)
            .tuple_combinations()
            .map(|(a, b)| FloatOrd((a - b).norm_squared()))
            .max()
            .map_or(0.0, |FloatOrd(distance)| distance);

        let mut map = self.map.write("Shared::bundle_adjustment(), commit");
        if self.determine_initial_requested() || map.map_version != map_version {
            debug!("dropping a bundle adjustment of an outdated map");
            return false;
        }
        map.map_version += 1;
        let new_version = map.map_version;
        for (&frame_index, &flipped_camera_t_world) in topology.key_frames.iter().zip(&poses) {
            let motion = self
                .camera_poses
                .pose(frame_index)
                .map_or(EstimatedMotion::Translational, |pose| pose.motion());
            self.camera_poses.set_pose(
                frame_index,
                CameraPose::from_flipped(flipped_camera_t_world, PoseQuality::High, motion),
                new_version,
            );
        }
        for (id, position) in topology.point_ids.iter().zip(&points) {
            if inaccurate.contains(id) {
                continue;
            }
            if let Some(point) = map.localized.get_mut(id) {
                point.set_position(*position, true);
                point.update_precision(camera, &self.camera_poses, new_version);
            }
        }
        for id in &inaccurate {
            map.localized.remove(id);
        }
        let imprecise = topology.point_ids.len() - inaccurate.len() - bundle_adjusted_ids.len();
        map.bundle_adjusted_ids = bundle_adjusted_ids;
        map.key_frames = topology.key_frames.clone();
        map.bundle_adjustment_sqr_baseline = sqr_baseline;
        map.unlock();

        self.correspondences_outdated.store(true, Ordering::Release);
        debug!(
            "bundle adjusted {} of {} points in keyframes {:?}, squared error {:.3} -> {:.3}, {} refined afterwards, {} imprecise, {} removed, map version {}",
            joining.len(),
            topology.point_ids.len(),
            topology.key_frames,
            report.initial_sqr_error,
            report.final_sqr_error,
            excluded.len() - inaccurate.len(),
            imprecise,
            inaccurate.len(),
            new_version
        );
        if let Some(angle) = report.gravity_alignment {
            debug!("largest keyframe gravity deviation {:.3} degrees", angle.to_degrees());
        }
        true
    }

    /// The gravity constraints of the keyframes, `None` unless every keyframe has a gravity.
    ///
    /// The first keyframe stays fixed during the adjustment and defines the world gravity.
    pub(crate) fn gravity_constraints(
        &self,
        key_frames: &[Index32],
        poses: &[WorldToCamera],
    ) -> Option<GravityConstraints> {
        let weight_factor = self.configuration.gravity_weight_factor;
        if weight_factor <= 0.0 || key_frames.len() != poses.len() {
            return None;
        }
        let gravities = key_frames
            .iter()
            .map(|&frame_index| self.gravities.gravity(frame_index))
            .collect::<Option<Vec<_>>>()?;
        GravityConstraints::from_reference(gravities, poses.first()?, 0, weight_factor)
    }
}

/// Whether a point lies in front of its keyframes and projects close to every observation.
fn explains(
    camera: &dyn AnyCamera,
    poses: &[WorldToCamera],
    point: &Point3<f64>,
    observations: &[(usize, Point2<f64>)],
    sqr_maximal_error: f64,
) -> bool {
    observations.iter().all(|(ix, image_point)| {
        is_object_point_in_front_if(&poses[*ix], point)
            && sqr_projection_error(camera, &poses[*ix], point, image_point) <= sqr_maximal_error
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::NoProfiler;
    use crate::{Configuration, LocalizationPrecision, LocalizedObjectPoint, PointTrack};
    use cv_core::nalgebra::{IsometryMatrix3, Rotation3, Translation3, Vector2, Vector3};
    use mono_core::{flipped_from_standard, AnyCamera, PinholeCamera};
    use mono_optimize::average_sqr_error;
    use rand::{Rng, SeedableRng};
    use rand_xoshiro::Xoshiro256PlusPlus;
    use std::sync::Arc;

    struct Scene {
        shared: Shared<NoProfiler>,
        poses: Vec<WorldToCamera>,
        points: Vec<Point3<f64>>,
    }

    /// The points with these ids start far enough off to stay out of the adjustment.
    const DISPLACED: std::ops::Range<usize> = 30..40;

    /// Six translating frames observing 40 localized points whose positions are off.
    fn scene() -> Scene {
        let configuration = Configuration {
            minimal_number_key_frames: 3,
            maximal_number_new_key_frames: 1,
            ..Default::default()
        };
        let shared = Shared::new(
            configuration,
            Arc::new(PinholeCamera::new(640, 480, 500.0)),
            Arc::new(NoProfiler),
        );
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(11);
        let points: Vec<Point3<f64>> = (0..40)
            .map(|_| {
                Point3::new(
                    rng.gen_range(-1.0..1.0),
                    rng.gen_range(-0.8..0.8),
                    rng.gen_range(-5.0..-3.0),
                )
            })
            .collect();
        let poses: Vec<WorldToCamera> = (0..6)
            .map(|ix| {
                flipped_from_standard(&IsometryMatrix3::from_parts(
                    Translation3::new(ix as f64 * 0.2, 0.0, 0.0),
                    Rotation3::identity(),
                ))
            })
            .collect();

        let mut map = shared.map.write("test");
        map.map_version = 1;
        for &pose in &poses {
            let frame_index = shared.camera_poses.next_frame();
            shared.camera_poses.set_pose(
                frame_index,
                CameraPose::from_flipped(pose, PoseQuality::Low, EstimatedMotion::Translational),
                1,
            );
        }
        for (id, point) in points.iter().enumerate() {
            let mut track = PointTrack::new(
                id as Index32,
                0,
                shared.camera.project_to_image_if(&poses[0], point),
            );
            for (frame_index, pose) in poses.iter().enumerate().skip(1) {
                track.add_observation(
                    frame_index as Index32,
                    shared.camera.project_to_image_if(pose, point),
                );
            }
            // About 0.6 pixels for the consistent points, more than 10 pixels for the displaced ones.
            let offset = if DISPLACED.contains(&id) {
                Vector3::new(0.08, -0.08, 0.0)
            } else {
                Vector3::new(
                    rng.gen_range(-0.004..0.004),
                    rng.gen_range(-0.004..0.004),
                    rng.gen_range(-0.004..0.004),
                )
            };
            map.localized.insert(
                id as Index32,
                LocalizedObjectPoint::from_track(
                    &track,
                    *point + offset,
                    LocalizationPrecision::Low,
                    false,
                ),
            );
        }
        map.key_frames = vec![0, 5];
        map.bundle_adjustment_sqr_baseline = 1.0;
        map.unlock();

        Scene {
            shared,
            poses,
            points,
        }
    }

    /// Moves the observation of a point in the last frame by 20 pixels along `y`.
    fn corrupt_last_observation(shared: &Shared<NoProfiler>, id: Index32) {
        let mut map = shared.map.write("test");
        let point = map.localized.get_mut(&id).expect("point");
        let image_point = point.observation(5).expect("observation");
        point.add_observation(5, image_point + Vector2::new(0.0, 20.0));
    }

    fn observations(topology: &Topology) -> Vec<BundleObservation> {
        topology
            .observations
            .iter()
            .enumerate()
            .flat_map(|(point, observations)| {
                observations
                    .iter()
                    .map(move |&(pose, image_point)| BundleObservation {
                        pose,
                        point,
                        image_point,
                    })
            })
            .collect()
    }

    #[test]
    fn topology_extends_the_previous_keyframes() {
        let scene = scene();
        let map = scene.shared.map.read("test");
        let topology = scene
            .shared
            .determine_bundle_adjustment_topology(&map, 5)
            .expect("topology");
        assert_eq!(topology.key_frames.len(), 3);
        assert_eq!(topology.key_frames[0], 0);
        assert_eq!(topology.key_frames[2], 5);
        assert!(matches!(topology.key_frames[1], 2 | 3));
        assert_eq!(topology.point_ids.len(), 40);
        assert!(topology.observations.iter().all(|observations| observations.len() == 3));
    }

    #[test]
    fn unadjusted_points_need_an_adjustment() {
        let scene = scene();
        let pose = scene.shared.camera_poses.pose(5).expect("pose");
        let map = scene.shared.map.read("test");
        assert!(scene.shared.is_bundle_adjustment_needed(&map, 5, &pose));
    }

    #[test]
    fn bundle_adjustment_commits_a_new_map_version() {
        let scene = scene();
        let shared = &scene.shared;
        let (topology, initial) = {
            let map = shared.map.read("test");
            let topology = shared
                .determine_bundle_adjustment_topology(&map, 5)
                .expect("topology");
            let poses: Vec<WorldToCamera> = topology
                .key_frames
                .iter()
                .map(|&frame_index| scene.poses[frame_index as usize])
                .collect();
            let points: Vec<Point3<f64>> = topology
                .point_ids
                .iter()
                .map(|id| *map.localized[id].position())
                .collect();
            let initial =
                average_sqr_error(&*shared.camera, &poses, &points, &observations(&topology));
            (topology, initial)
        };

        assert!(shared.bundle_adjustment(5));

        let map = shared.map.read("test");
        assert_eq!(map.map_version, 2);
        assert_eq!(map.key_frames, topology.key_frames);
        assert_eq!(map.bundle_adjusted_ids.len(), map.localized.len());
        assert!(map.localized.values().all(|point| point.is_bundle_adjusted()));
        assert!(map.bundle_adjustment_sqr_baseline > 0.8);
        for &frame_index in &topology.key_frames {
            let pose = shared.camera_poses.pose(frame_index).expect("keyframe pose");
            assert_eq!(pose.quality(), PoseQuality::High);
            assert_eq!(pose.map_version(), 2);
        }

        let poses: Vec<WorldToCamera> = topology
            .key_frames
            .iter()
            .map(|&frame_index| {
                *shared
                    .camera_poses
                    .pose(frame_index)
                    .expect("keyframe pose")
                    .flipped_camera_t_world()
            })
            .collect();
        let points: Vec<Point3<f64>> = topology
            .point_ids
            .iter()
            .map(|id| *map.localized[id].position())
            .collect();
        let adjusted =
            average_sqr_error(&*shared.camera, &poses, &points, &observations(&topology));
        assert!(adjusted <= initial);
        assert!(adjusted < 1e-2);
        assert_eq!(points.len(), scene.points.len());
        assert!(shared.correspondences_outdated.load(Ordering::Acquire));
    }

    fn key_frame_poses(shared: &Shared<NoProfiler>, key_frames: &[Index32]) -> Vec<WorldToCamera> {
        key_frames
            .iter()
            .map(|&frame_index| {
                *shared
                    .camera_poses
                    .pose(frame_index)
                    .expect("keyframe pose")
                    .flipped_camera_t_world()
            })
            .collect()
    }

    #[test]
    fn displaced_points_are_refined_after_the_adjustment() {
        let scene = scene();
        let shared = &scene.shared;
        assert!(shared.bundle_adjustment(5));

        let map = shared.map.read("test");
        let poses = key_frame_poses(shared, &map.key_frames);
        for id in DISPLACED.map(|id| id as Index32) {
            assert!(map.bundle_adjusted_ids.contains(&id));
            let point = &map.localized[&id];
            assert!(point.is_bundle_adjusted());
            for (pose, &frame_index) in poses.iter().zip(&map.key_frames) {
                let image_point = point.observation(frame_index).expect("observation");
                assert!(
                    sqr_projection_error(&*shared.camera, pose, point.position(), &image_point)
                        < 1e-2
                );
            }
        }
    }

    #[test]
    fn unexplained_displaced_points_are_removed() {
        let scene = scene();
        let shared = &scene.shared;
        corrupt_last_observation(shared, 35);
        assert!(shared.bundle_adjustment(5));

        let map = shared.map.read("test");
        assert!(!map.localized.contains_key(&35));
        assert!(!map.bundle_adjusted_ids.contains(&35));
        assert_eq!(map.localized.len(), 39);
        assert_eq!(map.bundle_adjusted_ids.len(), 39);
    }

    #[test]
    fn imprecise_adjusted_points_are_kept() {
        let scene = scene();
        let shared = &scene.shared;
        corrupt_last_observation(shared, 3);
        shared.map.write("test").bundle_adjusted_ids = [3].into_iter().collect();
        assert!(shared.bundle_adjustment(5));

        let map = shared.map.read("test");
        assert_eq!(map.localized.len(), 40);
        assert!(map.localized[&3].is_bundle_adjusted());
        assert!(!map.bundle_adjusted_ids.contains(&3));
        assert_eq!(map.bundle_adjusted_ids.len(), 39);
    }

    #[test]
    fn gravity_needs_every_keyframe() {
        let scene = scene();
        let shared = &scene.shared;
        let key_frames = [0, 3, 5];
        let poses = key_frame_poses(shared, &key_frames);
        for frame_index in [0, 5] {
            shared
                .gravities
                .set_gravity(frame_index, &Vector3::new(0.0, -1.0, 0.0));
        }
        assert!(shared.gravity_constraints(&key_frames, &poses).is_none());
        shared.gravities.set_gravity(3, &Vector3::new(0.0, -1.0, 0.0));
        assert!(shared.gravity_constraints(&key_frames, &poses).is_some());

        let weightless = Shared::new(
            Configuration {
                gravity_weight_factor: 0.0,
                ..Default::default()
            },
            shared.camera.clone(),
            Arc::new(NoProfiler),
        );
        for frame_index in key_frames {
            weightless
                .gravities
                .set_gravity(frame_index, &Vector3::new(0.0, -1.0, 0.0));
        }
        assert!(weightless.gravity_constraints(&key_frames, &poses).is_none());
    }

    #[test]
    fn gravity_keeps_keyframes_upright() {
        let scene = scene();
        let shared = &scene.shared;
        for frame_index in 0..6 {
            shared
                .gravities
                .set_gravity(frame_index, &Vector3::new(0.0, -1.0, 0.0));
        }
        let rolled = flipped_from_standard(&IsometryMatrix3::from_parts(
            Translation3::new(1.0, 0.0, 0.0),
            Rotation3::from_euler_angles(0.0, 0.0, 0.005),
        ));
        shared.camera_poses.set_pose(
            5,
            CameraPose::from_flipped(rolled, PoseQuality::Low, EstimatedMotion::Translational),
            1,
        );

        assert!(shared.bundle_adjustment(5));

        let key_frames = shared.map.read("test").key_frames.clone();
        let poses = key_frame_poses(shared, &key_frames);
        let constraints = shared
            .gravity_constraints(&key_frames, &poses)
            .expect("gravity of every keyframe");
        for ix in 0..poses.len() {
            let angle = constraints.alignment_angle_if(&poses[ix], ix).expect("gravity");
            assert!(angle < 1e-3, "keyframe {} deviates by {} radians", ix, angle);
        }
    }

    #[test]
    fn stationary_frames_are_not_adjusted() {
        let scene = scene();
        let shared = &scene.shared;
        let pose = shared
            .camera_poses
            .pose(5)
            .expect("pose")
            .with_motion(EstimatedMotion::Stationary);
        shared.camera_poses.set_pose(5, pose, 1);
        assert!(!shared.bundle_adjustment(5));
        assert_eq!(shared.map.read("test").map_version, 1);
    }
}
