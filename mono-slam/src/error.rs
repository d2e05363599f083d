use mono_image::FrameError;
use thiserror::Error;

/// The errors `TrackerMono` reports to its caller.
///
/// Tracking failures are not errors, a frame without a pose is reported as an invalid pose.
#[derive(Debug, Error)]
pub enum SlamError {
    #[error("the tracker has been configured already")]
    AlreadyConfigured,
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("the tracker needs to be configured before handling frames")]
    NotConfigured,
    #[error("the camera profile is invalid")]
    InvalidCamera,
    #[error("a {width} x {height} frame does not match the {camera_width} x {camera_height} camera")]
    InvalidFrame {
        width: u32,
        height: u32,
        camera_width: u32,
        camera_height: u32,
    },
    #[error("failed to create the frame pyramid: {0}")]
    PyramidConstruction(#[from] FrameError),
    #[error("failed to start the background thread: {0}")]
    BackgroundThread(#[source] std::io::Error),
    #[error("the frame thread stopped while a frame was in flight")]
    FrameThreadStopped,
}
