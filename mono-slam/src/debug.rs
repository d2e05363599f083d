use crate::{LocalizationPrecision, LocalizedObjectPointMap, TrackingCorrespondences};
use cv_core::nalgebra::{Point2, Point3};
use mono_core::Index32;
use std::collections::{BTreeMap, BTreeSet};

/// The maximal number of image points kept per debug track.
const MAXIMAL_TRACK_LENGTH: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DebugPoint {
    pub position: Point3<f64>,
    pub precision: LocalizationPrecision,
    pub bundle_adjusted: bool,
}

/// A snapshot of the tracker for visualizations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DebugData {
    /// The recent image points of every tracked object point and the frame of the last one.
    pub tracks: BTreeMap<Index32, (Index32, Vec<Point2<f64>>)>,
    pub points: BTreeMap<Index32, DebugPoint>,
    /// The pose inliers with at least medium precision.
    pub pose_precise_ids: BTreeSet<Index32>,
    /// The pose inliers with less than medium precision.
    pub pose_imprecise_ids: BTreeSet<Index32>,
    /// The pose outliers.
    pub inaccurate_ids: BTreeSet<Index32>,
}

impl DebugData {
    /// Extends the tracks with the points tracked into `frame_index`.
    ///
    /// Tracks not continued in this frame are dropped.
    pub fn update_tracks(&mut self, frame_index: Index32, tracking: &TrackingCorrespondences) {
        let mut tracks = BTreeMap::new();
        for (id, previous, current, _, _) in tracking.iter() {
            let current = match current {
                Some(current) => current,
                None => continue,
            };
            let mut points = match self.tracks.remove(&id) {
                Some((last, points)) if last + 1 == frame_index => points,
                _ => vec![previous],
            };
            points.push(current);
            if points.len() > MAXIMAL_TRACK_LENGTH {
                points.drain(..points.len() - MAXIMAL_TRACK_LENGTH);
            }
            tracks.insert(id, (frame_index, points));
        }
        self.tracks = tracks;
    }

    pub fn update_points(&mut self, map: &LocalizedObjectPointMap) {
        self.points = map
            .iter()
            .map(|(&id, point)| {
                (
                    id,
                    DebugPoint {
                        position: *point.position(),
                        precision: point.precision(),
                        bundle_adjusted: point.is_bundle_adjusted(),
                    },
                )
            })
            .collect();
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
