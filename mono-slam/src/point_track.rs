use cv_core::nalgebra::Point2;
use mono_core::Index32;
use std::collections::BTreeMap;

/// The tracks of all object points which are not localized yet, keyed by object point id.
pub type PointTrackMap = BTreeMap<Index32, PointTrack>;

/// The image points of an object point in consecutive frames.
///
/// A track never has gaps, a point which is lost and found again starts a new track.
#[derive(Debug, Clone, PartialEq)]
pub struct PointTrack {
    id: Index32,
    first_frame_index: Index32,
    image_points: Vec<Point2<f64>>,
}

impl PointTrack {
    pub fn new(id: Index32, frame_index: Index32, image_point: Point2<f64>) -> Self {
        Self {
            id,
            first_frame_index: frame_index,
            image_points: vec![image_point],
        }
    }

    pub fn id(&self) -> Index32 {
        self.id
    }

    pub fn first_frame_index(&self) -> Index32 {
        self.first_frame_index
    }

    pub fn last_frame_index(&self) -> Index32 {
        self.first_frame_index + self.image_points.len() as Index32 - 1
    }

    /// The number of observations.
    pub fn len(&self) -> usize {
        self.image_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_points.is_empty()
    }

    /// Appends the observation of the frame following the last one.
    pub fn add_observation(&mut self, frame_index: Index32, image_point: Point2<f64>) -> bool {
        if frame_index != self.last_frame_index() + 1 {
            return false;
        }
        self.image_points.push(image_point);
        true
    }

    pub fn image_point(&self, frame_index: Index32) -> Option<Point2<f64>> {
        let offset = frame_index.checked_sub(self.first_frame_index)?;
        self.image_points.get(offset as usize).copied()
    }

    pub fn last_image_point(&self) -> Point2<f64> {
        self.image_points[self.image_points.len() - 1]
    }

    /// The number of observations up to and including `frame_index`.
    pub fn len_until(&self, frame_index: Index32) -> usize {
        if frame_index < self.first_frame_index {
            return 0;
        }
        ((frame_index - self.first_frame_index) as usize + 1).min(self.len())
    }

    /// The observations as `(frame index, image point)` in ascending frame order.
    pub fn observations(&self) -> impl DoubleEndedIterator<Item = (Index32, Point2<f64>)> + '_ {
        self.image_points
            .iter()
            .enumerate()
            .map(move |(offset, &point)| (self.first_frame_index + offset as Index32, point))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_stay_contiguous() {
        let mut track = PointTrack::new(4, 10, Point2::new(1.0, 1.0));
        assert!(track.add_observation(11, Point2::new(2.0, 1.0)));
        assert!(!track.add_observation(13, Point2::new(3.0, 1.0)));
        assert!(track.add_observation(12, Point2::new(3.0, 1.0)));

        assert_eq!(track.len(), 3);
        assert_eq!(track.last_frame_index(), 12);
        assert_eq!(track.image_point(11), Some(Point2::new(2.0, 1.0)));
        assert_eq!(track.image_point(9), None);
        assert_eq!(track.image_point(13), None);
        assert_eq!(track.len_until(11), 2);
        assert_eq!(track.len_until(40), 3);
        assert_eq!(track.len_until(3), 0);
        let frames: Vec<_> = track.observations().map(|(frame, _)| frame).collect();
        assert_eq!(frames, vec![10, 11, 12]);
    }
}
