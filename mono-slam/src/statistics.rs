use cv_core::nalgebra::IsometryMatrix3;
use mono_core::{Index32, MapVersion, PoseQuality, INVALID_MAP_VERSION};
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::time::{Duration, Instant};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// What happened while tracking one frame.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct FrameStatistics {
    pub frame_index: Index32,
    /// The number of points which could have been tracked from the previous frame.
    pub tracking_possible: usize,
    /// The number of points which were tracked successfully.
    pub tracking_actual: usize,
    /// The number of 2D/3D correspondences the pose was determined with.
    pub pose_correspondences: usize,
    /// The average projection error of the pose in pixels, `None` without pose.
    pub projection_error: Option<f64>,
    pub world_t_camera: Option<IsometryMatrix3<f64>>,
    pub quality: PoseQuality,
    pub map_version: MapVersion,
    pub new_point_tracks: usize,
    pub duration: Duration,
}

impl FrameStatistics {
    pub fn new(frame_index: Index32) -> Self {
        Self {
            frame_index,
            tracking_possible: 0,
            tracking_actual: 0,
            pose_correspondences: 0,
            projection_error: None,
            world_t_camera: None,
            quality: PoseQuality::Invalid,
            map_version: INVALID_MAP_VERSION,
            new_point_tracks: 0,
            duration: Duration::ZERO,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.world_t_camera.is_some()
    }
}

const STAGES: usize = 11;

/// The timed operations of the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    HandleFrame,
    TrackImagePoints,
    DetermineCameraPose,
    DetectNewImagePoints,
    MatchCornersToLocalizedObjectPoints,
    OptimizeInaccurateObjectPoints,
    DetermineInitialObjectPoints,
    LocalizeUnlocalizedObjectPoints,
    BundleAdjustment,
    Relocalize,
    DescribeObjectPoints,
}

impl Stage {
    const ALL: [Stage; STAGES] = [
        Stage::HandleFrame,
        Stage::TrackImagePoints,
        Stage::DetermineCameraPose,
        Stage::DetectNewImagePoints,
        Stage::MatchCornersToLocalizedObjectPoints,
        Stage::OptimizeInaccurateObjectPoints,
        Stage::DetermineInitialObjectPoints,
        Stage::LocalizeUnlocalizedObjectPoints,
        Stage::BundleAdjustment,
        Stage::Relocalize,
        Stage::DescribeObjectPoints,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::HandleFrame => "handle frame",
            Stage::TrackImagePoints => "track image points",
            Stage::DetermineCameraPose => "determine camera pose",
            Stage::DetectNewImagePoints => "detect new image points",
            Stage::MatchCornersToLocalizedObjectPoints => "match corners to localized points",
            Stage::OptimizeInaccurateObjectPoints => "optimize inaccurate points",
            Stage::DetermineInitialObjectPoints => "determine initial points",
            Stage::LocalizeUnlocalizedObjectPoints => "localize unlocalized points",
            Stage::BundleAdjustment => "bundle adjustment",
            Stage::Relocalize => "relocalize",
            Stage::DescribeObjectPoints => "describe points",
        }
    }
}

/// The accumulated run times of one [`Stage`].
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct StageStatistic {
    pub measurements: usize,
    pub total: Duration,
    pub maximal: Duration,
}

impl StageStatistic {
    pub fn average(&self) -> Duration {
        if self.measurements == 0 {
            Duration::ZERO
        } else {
            self.total / self.measurements as u32
        }
    }
}

/// Run time measurements shared by the foreground and the background thread.
#[derive(Debug, Default)]
pub struct PerformanceStatistics {
    stages: Mutex<[StageStatistic; STAGES]>,
}

impl PerformanceStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Measures until the returned guard is dropped.
    pub fn scoped(&self, stage: Stage) -> ScopedStatistic<'_> {
        ScopedStatistic {
            statistics: self,
            stage,
            start: Instant::now(),
        }
    }

    pub fn add(&self, stage: Stage, duration: Duration) {
        let mut stages = self.stages.lock();
        let statistic = &mut stages[stage as usize];
        statistic.measurements += 1;
        statistic.total += duration;
        statistic.maximal = statistic.maximal.max(duration);
    }

    pub fn stage(&self, stage: Stage) -> StageStatistic {
        self.stages.lock()[stage as usize]
    }

    /// One line per measured stage.
    pub fn report(&self) -> String {
        let stages = *self.stages.lock();
        let mut report = String::new();
        for stage in Stage::ALL {
            let statistic = stages[stage as usize];
            if statistic.measurements == 0 {
                continue;
            }
            let _ = writeln!(
                report,
                "{}: {} runs, {:.2?} average, {:.2?} maximum",
                stage.name(),
                statistic.measurements,
                statistic.average(),
                statistic.maximal
            );
        }
        report
    }
}

/// Adds the time since its creation to a [`Stage`] when dropped.
pub struct ScopedStatistic<'a> {
    statistics: &'a PerformanceStatistics,
    stage: Stage,
    start: Instant,
}

impl<'a> Drop for ScopedStatistic<'a> {
    fn drop(&mut self) {
        self.statistics.add(self.stage, self.start.elapsed());
    }
}
