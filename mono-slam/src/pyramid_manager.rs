use mono_core::{Index32, INVALID_INDEX};
use mono_image::FramePyramid;
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::Arc;

/// A pyramid handed out by the [`FramePyramidManager`].
///
/// The pyramid stays alive as long as the handle exists, even if the manager has been given a newer one.
#[derive(Debug, Clone)]
pub struct ScopedPyramid {
    frame_index: Index32,
    pyramid: Arc<FramePyramid>,
}

impl ScopedPyramid {
    pub fn frame_index(&self) -> Index32 {
        self.frame_index
    }

    pub fn shared(&self) -> &Arc<FramePyramid> {
        &self.pyramid
    }
}

impl Deref for ScopedPyramid {
    type Target = FramePyramid;

    fn deref(&self) -> &FramePyramid {
        &self.pyramid
    }
}

/// Publishes the pyramid of the most recent frame from the foreground to the background thread.
#[derive(Debug, Default)]
pub struct FramePyramidManager {
    latest: Mutex<Option<ScopedPyramid>>,
}

impl FramePyramidManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the latest pyramid, older pyramids are freed once their last handle is dropped.
    pub fn update_latest(&self, frame_index: Index32, pyramid: Arc<FramePyramid>) {
        *self.latest.lock() = Some(ScopedPyramid {
            frame_index,
            pyramid,
        });
    }

    pub fn latest(&self) -> Option<ScopedPyramid> {
        self.latest.lock().clone()
    }

    /// The latest pyramid if it belongs to a frame after `frame_index`.
    pub fn newer_than(&self, frame_index: Index32) -> Option<ScopedPyramid> {
        self.latest
            .lock()
            .as_ref()
            .filter(|latest| frame_index == INVALID_INDEX || latest.frame_index > frame_index)
            .cloned()
    }

    pub fn latest_frame_index(&self) -> Index32 {
        self.latest
            .lock()
            .as_ref()
            .map_or(INVALID_INDEX, |latest| latest.frame_index)
    }

    pub fn clear(&self) {
        *self.latest.lock() = None;
    }
}
