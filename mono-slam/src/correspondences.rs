//! The per-frame working sets of the foreground thread.

use crate::{LocalizationPrecision, LocalizedObjectPointMap, PointTrackMap};
use cv_core::nalgebra::{Point2, Point3, UnitQuaternion};
use mono_core::{flip_rotation, AnyCamera, Index32, MapVersion, INVALID_INDEX, INVALID_MAP_VERSION};
use mono_image::{FramePyramid, PatchTracker};

/// The points observed in the previous frame and where they were tracked to in the current frame.
#[derive(Debug, Clone)]
pub struct TrackingCorrespondences {
    frame_index: Index32,
    map_version: MapVersion,
    object_point_ids: Vec<Index32>,
    previous_image_points: Vec<Point2<f64>>,
    current_image_points: Vec<Option<Point2<f64>>>,
    object_points: Vec<Option<Point3<f64>>>,
    precisions: Vec<LocalizationPrecision>,
}

impl Default for TrackingCorrespondences {
    fn default() -> Self {
        Self {
            frame_index: INVALID_INDEX,
            map_version: INVALID_MAP_VERSION,
            object_point_ids: vec![],
            previous_image_points: vec![],
            current_image_points: vec![],
            object_points: vec![],
            precisions: vec![],
        }
    }
}

impl TrackingCorrespondences {
    /// Gathers every point observed in `frame_index`.
    ///
    /// Localized points contribute their position when their precision reaches `minimal_precision`,
    /// all other points are only tracked.
    pub fn update(
        &mut self,
        frame_index: Index32,
        map_version: MapVersion,
        localized: &LocalizedObjectPointMap,
        tracks: &PointTrackMap,
        minimal_precision: LocalizationPrecision,
    ) {
        self.clear();
        self.frame_index = frame_index;
        self.map_version = map_version;

        let mut entries: Vec<(Index32, Point2<f64>, Option<Point3<f64>>, LocalizationPrecision)> =
            localized
                .iter()
                .filter_map(|(&id, point)| {
                    let image_point = point.observation(frame_index)?;
                    let position = (point.precision() >= minimal_precision).then(|| *point.position());
                    Some((id, image_point, position, point.precision()))
                })
                .chain(tracks.iter().filter_map(|(&id, track)| {
                    (track.last_frame_index() == frame_index).then(|| {
                        (id, track.last_image_point(), None, LocalizationPrecision::Invalid)
                    })
                }))
                .collect();
        // Localized points and tracks interleave by id.
        entries.sort_unstable_by_key(|entry| entry.0);

        for (id, image_point, position, precision) in entries {
            self.object_point_ids.push(id);
            self.previous_image_points.push(image_point);
            self.object_points.push(position);
            self.precisions.push(precision);
        }
        self.current_image_points = vec![None; self.object_point_ids.len()];
    }

    /// Tracks the points into the current pyramid.
    pub fn track(
        &mut self,
        tracker: &PatchTracker,
        previous: &FramePyramid,
        current: &FramePyramid,
        predictions: Option<&[Point2<f64>]>,
    ) {
        self.current_image_points =
            tracker.track(previous, current, &self.previous_image_points, predictions);
    }

    /// Predicts where the previous points appear after the camera rotated by `previous_q_current`.
    ///
    /// The rotation maps standard current camera vectors into the previous standard camera.
    pub fn predicted_image_points(
        &self,
        camera: &dyn AnyCamera,
        previous_q_current: &UnitQuaternion<f64>,
    ) -> Vec<Point2<f64>> {
        let flip = flip_rotation();
        let current_r_previous = flip * previous_q_current.inverse().to_rotation_matrix() * flip;
        self.previous_image_points
            .iter()
            .map(|point| {
                let ray = current_r_previous * camera.vector_if(*point).into_inner();
                if ray.z > f64::EPSILON {
                    camera.project_if(&Point3::from(ray))
                } else {
                    *point
                }
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.frame_index = INVALID_INDEX;
        self.map_version = INVALID_MAP_VERSION;
        self.object_point_ids.clear();
        self.previous_image_points.clear();
        self.current_image_points.clear();
        self.object_points.clear();
        self.precisions.clear();
    }

    /// The frame the previous image points belong to.
    pub fn frame_index(&self) -> Index32 {
        self.frame_index
    }

    /// The map version of the object point positions.
    pub fn map_version(&self) -> MapVersion {
        self.map_version
    }

    pub fn len(&self) -> usize {
        self.object_point_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.object_point_ids.is_empty()
    }

    pub fn object_point_ids(&self) -> &[Index32] {
        &self.object_point_ids
    }

    pub fn previous_image_points(&self) -> &[Point2<f64>] {
        &self.previous_image_points
    }

    /// The tracked position of every point, `None` if tracking failed.
    pub fn current_image_points(&self) -> &[Option<Point2<f64>>] {
        &self.current_image_points
    }

    pub fn number_valid(&self) -> usize {
        self.current_image_points.iter().flatten().count()
    }

    /// The correspondences as `(id, previous, current, object point, precision)`.
    pub fn iter(
        &self,
    ) -> impl Iterator<Item = (Index32, Point2<f64>, Option<Point2<f64>>, Option<Point3<f64>>, LocalizationPrecision)> + '_
    {
        (0..self.len()).map(move |ix| {
            (
                self.object_point_ids[ix],
                self.previous_image_points[ix],
                self.current_image_points.get(ix).copied().flatten(),
                self.object_points[ix],
                self.precisions[ix],
            )
        })
    }

    /// The mean distance in pixels between the previous and the tracked image points.
    pub fn mean_flow(&self) -> Option<f64> {
        let (sum, count) = self
            .previous_image_points
            .iter()
            .zip(&self.current_image_points)
            .filter_map(|(previous, current)| Some((current.as_ref()? - previous).norm()))
            .fold((0.0, 0usize), |(sum, count), flow| (sum + flow, count + 1));
        (count != 0).then(|| sum / count as f64)
    }
}

/// The 2D/3D correspondences of the current frame used for its pose.
#[derive(Debug, Clone, Default)]
pub struct PoseCorrespondences {
    pub object_point_ids: Vec<Index32>,
    pub object_points: Vec<Point3<f64>>,
    pub image_points: Vec<Point2<f64>>,
    pub precisions: Vec<LocalizationPrecision>,
}

impl PoseCorrespondences {
    /// Keeps every successfully tracked point with a position.
    pub fn reset(&mut self, tracking: &TrackingCorrespondences) {
        self.clear();
        for (id, _, current, object_point, precision) in tracking.iter() {
            if let (Some(current), Some(object_point)) = (current, object_point) {
                self.push(id, object_point, current, precision);
            }
        }
    }

    pub fn push(
        &mut self,
        id: Index32,
        object_point: Point3<f64>,
        image_point: Point2<f64>,
        precision: LocalizationPrecision,
    ) {
        self.object_point_ids.push(id);
        self.object_points.push(object_point);
        self.image_points.push(image_point);
        self.precisions.push(precision);
    }

    pub fn clear(&mut self) {
        self.object_point_ids.clear();
        self.object_points.clear();
        self.image_points.clear();
        self.precisions.clear();
    }

    pub fn len(&self) -> usize {
        self.object_point_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.object_point_ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LocalizedObjectPoint, PointTrack};
    use approx::assert_abs_diff_eq;
    use cv_core::nalgebra::{Vector2, Vector3};
    use mono_core::PinholeCamera;

    fn maps() -> (LocalizedObjectPointMap, PointTrackMap) {
        let mut tracks = PointTrackMap::new();
        let mut track = PointTrack::new(1, 4, Point2::new(10.0, 10.0));
        track.add_observation(5, Point2::new(11.0, 10.0));
        tracks.insert(1, track);
        tracks.insert(2, PointTrack::new(2, 3, Point2::new(50.0, 50.0)));

        let mut localized = LocalizedObjectPointMap::new();
        let track = PointTrack::new(3, 5, Point2::new(20.0, 30.0));
        localized.insert(
            3,
            LocalizedObjectPoint::from_track(&track, Point3::new(0.0, 0.0, 2.0), LocalizationPrecision::Low, false),
        );
        let track = PointTrack::new(4, 5, Point2::new(60.0, 30.0));
        localized.insert(
            4,
            LocalizedObjectPoint::from_track(&track, Point3::new(1.0, 0.0, 2.0), LocalizationPrecision::Unknown, false),
        );
        (localized, tracks)
    }

    #[test]
    fn update_collects_points_of_the_frame() {
        let (localized, tracks) = maps();
        let mut tracking = TrackingCorrespondences::default();
        tracking.update(5, 2, &localized, &tracks, LocalizationPrecision::Low);
        assert_eq!(tracking.len(), 3);
        assert_eq!(tracking.map_version(), 2);

        let with_position: Vec<Index32> = tracking
            .iter()
            .filter(|(_, _, _, object_point, _)| object_point.is_some())
            .map(|(id, ..)| id)
            .collect();
        assert_eq!(with_position, vec![3]);

        let mut pose = PoseCorrespondences::default();
        pose.reset(&tracking);
        assert!(pose.is_empty());
    }

    #[test]
    fn mean_flow_ignores_lost_points() {
        let (localized, tracks) = maps();
        let mut tracking = TrackingCorrespondences::default();
        tracking.update(5, 1, &localized, &tracks, LocalizationPrecision::Unknown);
        tracking.current_image_points = tracking
            .previous_image_points
            .iter()
            .enumerate()
            .map(|(ix, point)| (ix != 0).then(|| point + Vector2::new(3.0, 4.0)))
            .collect();
        assert_abs_diff_eq!(tracking.mean_flow().unwrap(), 5.0, epsilon = 1e-12);
        assert_eq!(tracking.number_valid(), 2);

        let mut pose = PoseCorrespondences::default();
        pose.reset(&tracking);
        assert_eq!(pose.len(), tracking.iter().filter(|c| c.2.is_some() && c.3.is_some()).count());
    }

    #[test]
    fn rotation_prediction() {
        let camera = PinholeCamera::new(640, 480, 500.0);
        let mut tracking = TrackingCorrespondences::default();
        let (localized, tracks) = maps();
        tracking.update(5, 1, &localized, &tracks, LocalizationPrecision::Low);

        let identity = tracking.predicted_image_points(&camera, &UnitQuaternion::identity());
        for (predicted, previous) in identity.iter().zip(tracking.previous_image_points()) {
            assert_abs_diff_eq!(predicted, previous, epsilon = 1e-9);
        }

        // Turning the camera to the left moves the content to the right.
        let left = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 0.05);
        let predicted = tracking.predicted_image_points(&camera, &left);
        for (predicted, previous) in predicted.iter().zip(tracking.previous_image_points()) {
            assert!(predicted.x > previous.x + 20.0);
        }
    }
}
