use cv_core::nalgebra::{Point3, Vector3};
use mono_core::{CameraPose, Index32, MapVersion, INVALID_INDEX, INVALID_MAP_VERSION};
use parking_lot::RwLock;

#[derive(Debug)]
struct Inner {
    poses: Vec<Option<CameraPose>>,
    frame_index: Index32,
    last_valid_pose_frame_index: Index32,
}

/// The camera poses of all handled frames, indexed by frame.
///
/// The container is shared between the foreground and the background thread and locks itself.
/// The frame counter starts invalid and is advanced with [`CameraPoses::next_frame`]; a pose can only
/// be set for the current or an earlier frame.
#[derive(Debug)]
pub struct CameraPoses {
    inner: RwLock<Inner>,
}

impl Default for CameraPoses {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Inner {
                poses: vec![],
                frame_index: INVALID_INDEX,
                last_valid_pose_frame_index: INVALID_INDEX,
            }),
        }
    }
}

impl CameraPoses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the frame counter by one and returns the new frame index.
    pub fn next_frame(&self) -> Index32 {
        let mut inner = self.inner.write();
        inner.frame_index = inner.frame_index.wrapping_add(1);
        let frame_index = inner.frame_index;
        inner.poses.push(None);
        frame_index
    }

    /// The current frame index, [`INVALID_INDEX`] before the first frame.
    pub fn frame_index(&self) -> Index32 {
        self.inner.read().frame_index
    }

    /// Stores the pose of a frame tagged with `map_version`.
    ///
    /// Returns `false` without touching the container for invalid poses, an invalid map version or a
    /// frame which has not been started yet.
    pub fn set_pose(&self, frame_index: Index32, pose: CameraPose, map_version: MapVersion) -> bool {
        if !pose.is_valid() || map_version == INVALID_MAP_VERSION {
            return false;
        }
        let mut inner = self.inner.write();
        if inner.frame_index == INVALID_INDEX || frame_index > inner.frame_index {
            return false;
        }
        inner.poses[frame_index as usize] = Some(pose.with_map_version(map_version));
        if inner.last_valid_pose_frame_index == INVALID_INDEX
            || frame_index > inner.last_valid_pose_frame_index
        {
            inner.last_valid_pose_frame_index = frame_index;
        }
        true
    }

    pub fn pose(&self, frame_index: Index32) -> Option<CameraPose> {
        self.inner
            .read()
            .poses
            .get(frame_index as usize)
            .copied()
            .flatten()
    }

    pub fn has_pose(&self, frame_index: Index32) -> bool {
        self.pose(frame_index).is_some()
    }

    /// The pose of the current frame.
    pub fn current_pose(&self) -> Option<CameraPose> {
        let inner = self.inner.read();
        inner.poses.last().copied().flatten()
    }

    pub fn last_valid_pose_frame_index(&self) -> Index32 {
        self.inner.read().last_valid_pose_frame_index
    }

    /// The ascending frame indices with a pose in `[last - count + 1, last]`.
    pub fn valid_pose_frame_indices(&self, last_frame_index: Index32, count: usize) -> Vec<Index32> {
        if count == 0 || last_frame_index == INVALID_INDEX {
            return vec![];
        }
        let inner = self.inner.read();
        let first = last_frame_index.saturating_sub(count as Index32 - 1) as usize;
        let last = (last_frame_index as usize).min(inner.poses.len().saturating_sub(1));
        if inner.poses.is_empty() || first > last {
            return vec![];
        }
        (first..=last)
            .filter(|&index| inner.poses[index].is_some())
            .map(|index| index as Index32)
            .collect()
    }

    /// The poses of many frames at once, taken under one lock.
    pub fn poses(&self, frame_indices: &[Index32]) -> Vec<Option<CameraPose>> {
        let inner = self.inner.read();
        frame_indices
            .iter()
            .map(|&index| inner.poses.get(index as usize).copied().flatten())
            .collect()
    }

    /// Every stored pose together with its frame index.
    pub fn all_poses(&self) -> Vec<(Index32, CameraPose)> {
        let inner = self.inner.read();
        inner
            .poses
            .iter()
            .enumerate()
            .filter_map(|(index, pose)| Some((index as Index32, (*pose)?)))
            .collect()
    }

    /// The bounding box of all camera centers.
    pub fn bounding_box(&self) -> Option<(Point3<f64>, Point3<f64>)> {
        let inner = self.inner.read();
        inner
            .poses
            .iter()
            .flatten()
            .map(|pose| Point3::from(pose.translation()))
            .fold(None, |bounds, center| match bounds {
                None => Some((center, center)),
                Some((lower, upper)) => Some((lower.inf(&center), upper.sup(&center))),
            })
    }

    /// The extent of [`CameraPoses::bounding_box`].
    pub fn bounding_box_diagonal(&self) -> Vector3<f64> {
        self.bounding_box()
            .map_or_else(Vector3::zeros, |(lower, upper)| upper - lower)
    }

    /// Removes every pose but keeps the frame counter.
    pub fn remove_poses(&self) {
        let mut inner = self.inner.write();
        for pose in &mut inner.poses {
            *pose = None;
        }
        inner.last_valid_pose_frame_index = INVALID_INDEX;
    }

    /// The number of frames handled so far.
    pub fn len(&self) -> usize {
        self.inner.read().poses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_core::nalgebra::{IsometryMatrix3, Rotation3, Translation3};
    use mono_core::{EstimatedMotion, PoseQuality};

    fn pose_at(x: f64) -> CameraPose {
        CameraPose::new(
            IsometryMatrix3::from_parts(Translation3::new(x, 0.0, 1.0), Rotation3::identity()),
            PoseQuality::Low,
            EstimatedMotion::Translational,
        )
    }

    #[test]
    fn poses_need_a_started_frame() {
        let poses = CameraPoses::new();
        assert_eq!(poses.frame_index(), INVALID_INDEX);
        assert!(!poses.set_pose(0, pose_at(0.0), 1));

        assert_eq!(poses.next_frame(), 0);
        assert_eq!(poses.next_frame(), 1);
        assert!(!poses.set_pose(2, pose_at(0.0), 1));
        assert!(!poses.set_pose(1, pose_at(0.0), INVALID_MAP_VERSION));
        assert!(!poses.set_pose(1, CameraPose::invalid(), 1));
        assert!(poses.set_pose(1, pose_at(0.5), 3));

        assert_eq!(poses.pose(1).unwrap().map_version(), 3);
        assert_eq!(poses.current_pose(), poses.pose(1));
        assert!(!poses.has_pose(0));
        assert_eq!(poses.last_valid_pose_frame_index(), 1);
    }

    #[test]
    fn window_and_bounding_box() {
        let poses = CameraPoses::new();
        for frame in 0..10 {
            poses.next_frame();
            if frame % 3 != 0 {
                assert!(poses.set_pose(frame, pose_at(f64::from(frame)), 1));
            }
        }
        assert_eq!(poses.valid_pose_frame_indices(8, 5), vec![4, 5, 7, 8]);
        assert_eq!(poses.valid_pose_frame_indices(2, 100), vec![1, 2]);
        assert!(poses.valid_pose_frame_indices(8, 0).is_empty());

        let (lower, upper) = poses.bounding_box().unwrap();
        assert_eq!(lower.x, 1.0);
        assert_eq!(upper.x, 8.0);
        assert_eq!(poses.bounding_box_diagonal(), Vector3::new(7.0, 0.0, 0.0));
    }

    #[test]
    fn removing_poses_keeps_the_counter() {
        let poses = CameraPoses::new();
        poses.next_frame();
        poses.set_pose(0, pose_at(0.0), 1);
        poses.remove_poses();
        assert_eq!(poses.frame_index(), 0);
        assert!(poses.all_poses().is_empty());
        assert_eq!(poses.last_valid_pose_frame_index(), INVALID_INDEX);
        assert_eq!(poses.next_frame(), 1);
    }
}
