//! The monocular tracker.
//!
//! [`TrackerMono`] runs on up to three threads. The caller's thread hands frames to
//! [`TrackerMono::handle_frame`], which tracks the image points from the previous frame and
//! determines the camera pose. Updating the map with the tracking results and detecting new points
//! happens on a frame thread while the caller continues, the next frame waits for it. A background
//! worker initializes the map, triangulates point tracks, runs bundle adjustment and relocalizes
//! the camera once tracking has been lost. With [`BackgroundMode::Inline`] everything runs on the
//! caller's thread. All threads meet in [`Shared`], where the map is guarded by one reader-writer
//! [`Mutex`].

mod background;
mod bundle;
mod foreground;
mod pose;
mod relocalize;

use crate::lock::{LockProfiler, Mutex, NoProfiler};
use crate::{
    BackgroundMode, CameraPoses, Configuration, DebugData, FramePyramidManager, FrameStatistics,
    Gravities, LocalizationPrecision, LocalizedObjectPointMap, ObjectPointIdSet,
    PerformanceStatistics, PointTrackMap, SlamError,
};
use background::Background;
use crossbeam_channel::{Receiver, RecvTimeoutError, SendError, Sender};
use cv_core::nalgebra::{Point3, UnitQuaternion, UnitVector3, Vector3};
use foreground::{Foreground, PendingFrame};
use log::{debug, info, warn};
use mono_core::{AnyCamera, CameraPose, Index32, MapVersion, INVALID_INDEX};
use mono_image::Frame;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// The tracking state reported by [`TrackerMono::state`].
///
/// A lost camera is not a state of its own, the tracker stays in [`TrackerState::Tracking`] and
/// reports invalid poses until it is relocalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TrackerState {
    Unknown,
    Initializing,
    Tracking,
}

impl TrackerState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Initializing => "initializing",
            Self::Tracking => "tracking",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Initializing,
            2 => Self::Tracking,
            _ => Self::Unknown,
        }
    }
}

/// A localized object point as reported by [`TrackerMono::object_points`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapPoint {
    pub id: Index32,
    pub position: Point3<f64>,
    pub precision: LocalizationPrecision,
    pub bundle_adjusted: bool,
}

/// Everything guarded by the map lock.
#[derive(Debug)]
pub(crate) struct MapState {
    pub(crate) localized: LocalizedObjectPointMap,
    pub(crate) tracks: PointTrackMap,
    /// Incremented whenever the positions of the localized points change as a whole.
    pub(crate) map_version: MapVersion,
    /// The frames of the latest bundle adjustment, ascending.
    pub(crate) key_frames: Vec<Index32>,
    /// The largest squared distance between two keyframes of the latest bundle adjustment.
    pub(crate) bundle_adjustment_sqr_baseline: f64,
    pub(crate) bundle_adjusted_ids: BTreeSet<Index32>,
    /// Tracks merged into localized points during relocalization, `track id -> localized id`.
    pub(crate) redirects: BTreeMap<Index32, Index32>,
    pub(crate) next_object_point_id: Index32,
}

impl MapState {
    fn new() -> Self {
        Self {
            localized: LocalizedObjectPointMap::new(),
            tracks: PointTrackMap::new(),
            map_version: 0,
            key_frames: vec![],
            bundle_adjustment_sqr_baseline: f64::MIN,
            bundle_adjusted_ids: BTreeSet::new(),
            redirects: BTreeMap::new(),
            next_object_point_id: 0,
        }
    }

    /// Resolves an id of the tracking correspondences, following relocalization merges.
    pub(crate) fn resolve(&self, id: Index32) -> Option<Index32> {
        if self.localized.contains_key(&id) || self.tracks.contains_key(&id) {
            Some(id)
        } else {
            self.redirects.get(&id).copied()
        }
    }
}

/// The state both threads work on.
pub(crate) struct Shared<P: LockProfiler> {
    pub(crate) configuration: Configuration,
    pub(crate) camera: Arc<dyn AnyCamera>,
    pub(crate) map: Mutex<MapState, P>,
    pub(crate) camera_poses: CameraPoses,
    pub(crate) gravities: Gravities,
    pub(crate) pyramids: FramePyramidManager,
    /// Localized points which did not agree with a camera pose.
    pub(crate) inaccurate: ObjectPointIdSet,
    pub(crate) task_determine_initial: AtomicBool,
    /// Set when the background worker changed the points observed in the latest frame.
    pub(crate) correspondences_outdated: AtomicBool,
    state: AtomicU8,
    stop: AtomicBool,
    pub(crate) performance: PerformanceStatistics,
}

impl<P: LockProfiler> Shared<P> {
    pub(crate) fn new(
        configuration: Configuration,
        camera: Arc<dyn AnyCamera>,
        profiler: Arc<P>,
    ) -> Self {
        Self {
            configuration,
            camera,
            map: Mutex::with_profiler(MapState::new(), profiler),
            camera_poses: CameraPoses::new(),
            gravities: Gravities::new(),
            pyramids: FramePyramidManager::new(),
            inaccurate: ObjectPointIdSet::new(),
            task_determine_initial: AtomicBool::new(false),
            correspondences_outdated: AtomicBool::new(false),
            state: AtomicU8::new(TrackerState::Unknown as u8),
            stop: AtomicBool::new(false),
            performance: PerformanceStatistics::new(),
        }
    }

    pub(crate) fn state(&self) -> TrackerState {
        TrackerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: TrackerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) fn determine_initial_requested(&self) -> bool {
        self.task_determine_initial.load(Ordering::Acquire)
    }
}

enum Worker {
    /// The maintenance duties run at the end of every frame.
    Inline(Background),
    Threaded {
        sender: Option<Sender<Index32>>,
        handle: Option<JoinHandle<()>>,
    },
}

impl Worker {
    fn spawn<P: LockProfiler>(shared: Arc<Shared<P>>) -> Result<Self, SlamError> {
        let seed = shared.configuration.random_seed.wrapping_add(1);
        if shared.configuration.background_mode == BackgroundMode::Inline {
            return Ok(Worker::Inline(Background::new(seed)));
        }

        // One pending notification is enough, the worker always picks the latest pyramid.
        let (sender, receiver) = crossbeam_channel::bounded::<Index32>(1);
        let handle = thread::Builder::new()
            .name("mono-slam background".to_string())
            .spawn(move || {
                debug!("background thread started");
                let mut background = Background::new(seed);
                while !shared.should_stop() {
                    match receiver.recv_timeout(Duration::from_millis(1)) {
                        Ok(_) | Err(RecvTimeoutError::Timeout) => {
                            background.run_once(&shared);
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("background thread stopped");
            })
            .map_err(SlamError::BackgroundThread)?;
        Ok(Worker::Threaded {
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    fn frame_handled<P: LockProfiler>(&mut self, shared: &Shared<P>, frame_index: Index32) {
        match self {
            Worker::Inline(background) => {
                background.run_once(shared);
            }
            Worker::Threaded {
                sender: Some(sender),
                ..
            } => {
                // A full channel already wakes the worker up.
                let _ = sender.try_send(frame_index);
            }
            Worker::Threaded { sender: None, .. } => {}
        }
    }

    fn join(&mut self) {
        if let Worker::Threaded { sender, handle } = self {
            sender.take();
            if let Some(handle) = handle.take() {
                if handle.join().is_err() {
                    warn!("the background thread panicked");
                }
            }
        }
    }
}

/// Where the second half of every frame runs.
enum FrameWorker {
    /// The map is updated before `handle_frame` returns.
    Inline,
    /// A thread updates the map while the caller prepares the next frame, which waits for it.
    Threaded {
        jobs: Option<Sender<(Foreground, PendingFrame)>>,
        finished: Receiver<Foreground>,
        handle: Option<JoinHandle<()>>,
    },
}

impl FrameWorker {
    fn spawn<P: LockProfiler>(shared: Arc<Shared<P>>) -> Result<Self, SlamError> {
        // At most one frame is in flight.
        let (jobs, receiver) = crossbeam_channel::bounded::<(Foreground, PendingFrame)>(1);
        let (sender, finished) = crossbeam_channel::bounded::<Foreground>(1);
        let handle = thread::Builder::new()
            .name("mono-slam frames".to_string())
            .spawn(move || {
                for (mut foreground, pending) in receiver {
                    foreground.finish_frame(&shared, pending);
                    if sender.send(foreground).is_err() {
                        break;
                    }
                }
            })
            .map_err(SlamError::BackgroundThread)?;
        Ok(FrameWorker::Threaded {
            jobs: Some(jobs),
            finished,
            handle: Some(handle),
        })
    }

    fn join(&mut self) {
        if let FrameWorker::Threaded { jobs, handle, .. } = self {
            jobs.take();
            if let Some(handle) = handle.take() {
                if handle.join().is_err() {
                    warn!("the frame thread panicked");
                }
            }
        }
    }
}

/// Everything created with the first frame.
struct Session<P: LockProfiler> {
    shared: Arc<Shared<P>>,
    /// `None` while the frame thread owns it.
    foreground: Option<Foreground>,
    /// The frame whose maintenance duties wait for its map update.
    unfinished: Option<Index32>,
    frames: FrameWorker,
    worker: Worker,
}

impl<P: LockProfiler> Session<P> {
    fn start(
        configuration: Configuration,
        camera: &dyn AnyCamera,
        profiler: Arc<P>,
        threaded_frames: bool,
    ) -> Result<Self, SlamError> {
        let shared = Arc::new(Shared::new(configuration, camera.clone_camera(), profiler));
        let frames = if threaded_frames {
            FrameWorker::spawn(shared.clone())?
        } else {
            FrameWorker::Inline
        };
        let worker = Worker::spawn(shared.clone())?;
        Ok(Self {
            foreground: Some(Foreground::new(&configuration, &*shared.camera)),
            shared,
            unfinished: None,
            frames,
            worker,
        })
    }

    /// Waits for the frame in flight and hands it to the maintenance duties.
    fn finish_frame(&mut self) -> Result<&mut Foreground, SlamError> {
        if self.foreground.is_none() {
            if let FrameWorker::Threaded { finished, .. } = &self.frames {
                self.foreground = finished.recv().ok();
            }
        }
        if let Some(frame_index) = self.unfinished.take() {
            self.worker.frame_handled(&self.shared, frame_index);
        }
        self.foreground.as_mut().ok_or(SlamError::FrameThreadStopped)
    }

    fn handle_frame(
        &mut self,
        frame: &Frame,
        camera_gravity: &Vector3<f64>,
        any_world_q_camera: Option<&UnitQuaternion<f64>>,
    ) -> Result<CameraPose, SlamError> {
        let shared = self.shared.clone();
        let (pose, pending) = self.finish_frame()?.handle_frame(
            &shared,
            frame,
            camera_gravity,
            any_world_q_camera,
        )?;
        let frame_index = pending.frame_index;

        if let FrameWorker::Threaded {
            jobs: Some(jobs), ..
        } = &self.frames
        {
            if let Some(foreground) = self.foreground.take() {
                match jobs.send((foreground, pending)) {
                    Ok(()) => {
                        self.unfinished = Some(frame_index);
                        return Ok(pose);
                    }
                    Err(SendError((mut foreground, pending))) => {
                        warn!("the frame thread is gone, finishing frame {} inline", frame_index);
                        foreground.finish_frame(&shared, pending);
                        self.foreground = Some(foreground);
                    }
                }
                self.worker.frame_handled(&shared, frame_index);
                return Ok(pose);
            }
            return Err(SlamError::FrameThreadStopped);
        }

        if let Some(foreground) = self.foreground.as_mut() {
            foreground.finish_frame(&shared, pending);
        }
        self.worker.frame_handled(&shared, frame_index);
        Ok(pose)
    }
}

impl<P: LockProfiler> Drop for Session<P> {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.frames.join();
        self.worker.join();
    }
}

/// A monocular SLAM tracker for a moving camera observing a static scene.
///
/// The tracker needs to be configured once with [`TrackerMono::configure`]. Afterwards every camera
/// frame is passed to [`TrackerMono::handle_frame`] in order. The first frame defines the camera
/// profile for the whole session.
///
/// `P` selects the lock instrumentation, [`NoProfiler`] compiles it away.
pub struct TrackerMono<P: LockProfiler = NoProfiler> {
    profiler: Arc<P>,
    configuration: Option<Configuration>,
    session: Option<Session<P>>,
}

impl TrackerMono<NoProfiler> {
    pub fn new() -> Self {
        Self::with_profiler(Arc::new(NoProfiler))
    }
}

impl Default for TrackerMono<NoProfiler> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: LockProfiler> TrackerMono<P> {
    /// Creates a tracker reporting every lock acquisition of the map to `profiler`.
    pub fn with_profiler(profiler: Arc<P>) -> Self {
        Self {
            profiler,
            configuration: None,
            session: None,
        }
    }

    /// Sets the configuration, which is possible exactly once.
    ///
    /// An invalid configuration is rejected and the tracker stays unconfigured. A second call
    /// always fails and keeps the first configuration.
    pub fn configure(&mut self, configuration: Configuration) -> Result<(), SlamError> {
        if self.configuration.is_some() {
            return Err(SlamError::AlreadyConfigured);
        }
        configuration.validate()?;
        debug!("configured the tracker: {:?}", configuration);
        self.configuration = Some(configuration);
        Ok(())
    }

    pub fn configuration(&self) -> Option<&Configuration> {
        self.configuration.as_ref()
    }

    /// Tracks the camera in a new frame.
    ///
    /// `camera_gravity` is the gravity vector in the standard camera frame, a zero vector if unknown.
    /// `any_world_q_camera` is an optional camera orientation in an arbitrary but fixed world, e.g.
    /// from an IMU, used to predict the image motion between consecutive frames.
    ///
    /// Returns the camera pose of the frame, which is invalid if the pose could not be determined.
    /// Errors are only returned for calls which cannot be processed; they leave the tracker untouched.
    pub fn handle_frame(
        &mut self,
        camera: &dyn AnyCamera,
        frame: &Frame,
        camera_gravity: &Vector3<f64>,
        any_world_q_camera: Option<&UnitQuaternion<f64>>,
    ) -> Result<CameraPose, SlamError> {
        let configuration = self.configuration.ok_or(SlamError::NotConfigured)?;
        if !camera.is_valid() {
            return Err(SlamError::InvalidCamera);
        }
        let session_camera: &dyn AnyCamera = match &self.session {
            Some(session) => &*session.shared.camera,
            None => camera,
        };
        if frame.width() != session_camera.width() || frame.height() != session_camera.height() {
            return Err(SlamError::InvalidFrame {
                width: frame.width(),
                height: frame.height(),
                camera_width: session_camera.width(),
                camera_height: session_camera.height(),
            });
        }

        if self.session.is_none() {
            info!(
                "starting a session with a {} x {} {} camera",
                camera.width(),
                camera.height(),
                camera.name()
            );
            self.session = Some(Session::start(
                configuration,
                camera,
                self.profiler.clone(),
                configuration.background_mode == BackgroundMode::Threaded,
            )?);
        }

        match &mut self.session {
            Some(session) => session.handle_frame(frame, camera_gravity, any_world_q_camera),
            None => Err(SlamError::NotConfigured),
        }
    }

    pub fn state(&self) -> TrackerState {
        self.session
            .as_ref()
            .map_or(TrackerState::Unknown, |session| session.shared.state())
    }

    /// The index of the latest handled frame, [`INVALID_INDEX`] before the first frame.
    pub fn frame_index(&self) -> Index32 {
        self.session
            .as_ref()
            .map_or(INVALID_INDEX, |session| session.shared.camera_poses.frame_index())
    }

    /// The current pose of a frame, it may have been refined since the frame was handled.
    pub fn pose(&self, frame_index: Index32) -> Option<CameraPose> {
        self.session
            .as_ref()
            .and_then(|session| session.shared.camera_poses.pose(frame_index))
    }

    pub fn camera_poses(&self) -> Option<&CameraPoses> {
        self.session
            .as_ref()
            .map(|session| &session.shared.camera_poses)
    }

    pub fn map_version(&self) -> Option<MapVersion> {
        let session = self.session.as_ref()?;
        let map = session.shared.map.read("TrackerMono::map_version()");
        Some(map.map_version)
    }

    /// A snapshot of all localized object points.
    pub fn object_points(&self) -> Vec<MapPoint> {
        let session = match &self.session {
            Some(session) => session,
            None => return vec![],
        };
        let map = session.shared.map.read("TrackerMono::object_points()");
        map.localized
            .iter()
            .map(|(&id, point)| MapPoint {
                id,
                position: *point.position(),
                precision: point.precision(),
                bundle_adjusted: point.is_bundle_adjusted(),
            })
            .collect()
    }

    /// The number of point tracks which are not localized yet.
    pub fn number_point_tracks(&self) -> usize {
        self.session.as_ref().map_or(0, |session| {
            session
                .shared
                .map
                .read("TrackerMono::number_point_tracks()")
                .tracks
                .len()
        })
    }

    /// The most recent gravity vector handed to the tracker, in the standard camera frame.
    pub fn latest_gravity(&self) -> Option<(Index32, UnitVector3<f64>)> {
        self.session
            .as_ref()
            .and_then(|session| session.shared.gravities.latest())
    }

    /// Per-frame statistics, empty unless enabled in the configuration.
    ///
    /// Waits until the latest frame is part of the map.
    pub fn frame_statistics(&mut self) -> &[FrameStatistics] {
        match self.session.as_mut().map(Session::finish_frame) {
            Some(Ok(foreground)) => foreground.frame_statistics(),
            _ => &[],
        }
    }

    /// A summary of the run times of all stages.
    pub fn performance_report(&self) -> String {
        self.session
            .as_ref()
            .map(|session| session.shared.performance.report())
            .unwrap_or_default()
    }

    /// The debug snapshot of the latest frame, `None` unless enabled in the configuration.
    pub fn debug_data(&mut self) -> Option<&DebugData> {
        self.session
            .as_mut()
            .and_then(|session| session.finish_frame().ok())
            .and_then(|foreground| foreground.debug_data())
    }

    pub fn profiler(&self) -> &Arc<P> {
        &self.profiler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{smooth_trajectory, TexturedPlane};
    use cv_core::nalgebra::IsometryMatrix3;
    use mono_core::PinholeCamera;

    /// Tracks a textured plane, finishing every frame on the frame thread if `threaded_frames`.
    fn run(threaded_frames: bool) -> Vec<CameraPose> {
        let camera = PinholeCamera::new(320, 240, 400.0);
        let plane = TexturedPlane::new(3.0, 0.06, 7);
        let configuration = Configuration {
            background_mode: BackgroundMode::Inline,
            frame_statistics_enabled: true,
            ..Default::default()
        };
        let mut tracker = TrackerMono::new();
        tracker.configure(configuration).unwrap();
        tracker.session = Some(
            Session::start(configuration, &camera, tracker.profiler.clone(), threaded_frames)
                .unwrap(),
        );

        let trajectory = smooth_trajectory(24, Vector3::zeros(), Vector3::new(0.04, 0.0, 0.0));
        let poses: Vec<CameraPose> = trajectory
            .iter()
            .map(|world_t_camera| {
                let frame = plane.render(&camera, world_t_camera).unwrap();
                tracker
                    .handle_frame(&camera, &frame, &Vector3::zeros(), None)
                    .unwrap()
            })
            .collect();
        assert_eq!(tracker.frame_statistics().len(), poses.len());
        poses
    }

    #[test]
    fn the_frame_thread_reproduces_inline_poses() {
        let inline = run(false);
        let threaded = run(true);
        assert!(inline.iter().filter(|pose| pose.is_valid()).count() >= 4);
        assert_eq!(inline.len(), threaded.len());
        for (ix, (a, b)) in inline.iter().zip(&threaded).enumerate() {
            assert_eq!(a.is_valid(), b.is_valid(), "frame {}", ix);
            assert_eq!(a.quality(), b.quality(), "frame {}", ix);
            assert_eq!(
                a.world_t_camera().to_homogeneous(),
                b.world_t_camera().to_homogeneous(),
                "frame {}",
                ix
            );
        }
    }

    #[test]
    fn dropping_a_session_joins_the_frame_thread() {
        let camera = PinholeCamera::new(320, 240, 400.0);
        let configuration = Configuration {
            background_mode: BackgroundMode::Threaded,
            ..Default::default()
        };
        let mut tracker = TrackerMono::new();
        tracker.configure(configuration).unwrap();
        let frame = TexturedPlane::new(3.0, 0.06, 7)
            .render(&camera, &IsometryMatrix3::identity())
            .unwrap();
        for _ in 0..3 {
            tracker
                .handle_frame(&camera, &frame, &Vector3::zeros(), None)
                .unwrap();
        }
        assert!(matches!(
            tracker.session.as_ref().map(|session| &session.frames),
            Some(FrameWorker::Threaded { .. })
        ));
        assert_eq!(tracker.frame_index(), 2);
        drop(tracker);
    }
}
