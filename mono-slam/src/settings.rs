#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

use crate::SlamError;
use mono_image::{PatchTracker, PATCH_SIZES};

/// Where the maintenance duties of the tracker run.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BackgroundMode {
    /// A dedicated thread loops over the duties while frames arrive.
    Threaded,
    /// Exactly one iteration of the duties runs at the end of every handled frame.
    Inline,
}

/// The settings for the monocular tracker.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Configuration {
    /// The number of live feature points the tracker tries to keep.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_tracking_number_feature_points")
    )]
    pub tracking_number_feature_points: usize,
    /// The edge length of the tracking patches, one of 5, 7, 15 or 31.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_tracking_patch_size")
    )]
    pub tracking_patch_size: u32,
    /// The number of sub-pixel refinements, the precision is `0.5^iterations` pixels.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_tracking_sub_pixel_iterations")
    )]
    pub tracking_sub_pixel_iterations: u32,
    /// The maximal distance a point may move between two frames, in pixels.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_tracking_maximal_offset")
    )]
    pub tracking_maximal_offset: u32,
    /// The search radius in the coarsest pyramid layer, in pixels.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_tracking_coarsest_layer_radius")
    )]
    pub tracking_coarsest_layer_radius: u32,
    /// The maximal zero-mean SSD per patch pixel of a tracked point.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_tracking_maximal_sqr_patch_error")
    )]
    pub tracking_maximal_sqr_patch_error: f32,
    /// The maximal distance between a point and its backwards tracked position, in pixels.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_tracking_bidirectional_tolerance")
    )]
    pub tracking_bidirectional_tolerance: f64,
    /// The maximal projection error of an inlier, in pixels.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_maximal_projection_error")
    )]
    pub maximal_projection_error: f64,
    /// The minimal number of 2D/3D correspondences needed for a pose.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_minimal_number_correspondences")
    )]
    pub minimal_number_correspondences: usize,
    /// The number of pose correspondences which finish the initialization.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_tracking_switch_correspondences")
    )]
    pub tracking_switch_correspondences: usize,
    /// The maximal number of keyframes in a bundle adjustment.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_maximal_number_key_frames")
    )]
    pub maximal_number_key_frames: usize,
    /// The minimal number of keyframes in a bundle adjustment.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_minimal_number_key_frames")
    )]
    pub minimal_number_key_frames: usize,
    /// The number of keyframes a single bundle adjustment may add.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_maximal_number_new_key_frames")
    )]
    pub maximal_number_new_key_frames: usize,
    /// How many frames back keyframes are chosen once the keyframe set is full.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_maximal_frame_history")
    )]
    pub maximal_frame_history: usize,
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_bundle_adjustment_iterations")
    )]
    pub bundle_adjustment_iterations: usize,
    /// Scales the gravity term of a keyframe against its reprojection errors, `0` ignores gravity.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_gravity_weight_factor")
    )]
    pub gravity_weight_factor: f64,
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_harris_threshold_minimum")
    )]
    pub harris_threshold_minimum: u32,
    /// The Harris threshold of the first frame, between the minimum and the maximum.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_harris_threshold_initial")
    )]
    pub harris_threshold_initial: u32,
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_harris_threshold_maximum")
    )]
    pub harris_threshold_maximum: u32,
    /// The number of occupancy bins the frame is split into.
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_occupancy_bins"))]
    pub occupancy_bins: u32,
    /// The coverage of the frame from which no new points are detected.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_occupancy_minimal_coverage")
    )]
    pub occupancy_minimal_coverage: f32,
    /// The P95 track length needed before the first reconstruction is tried.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_initial_minimal_track_length")
    )]
    pub initial_minimal_track_length: usize,
    /// The P75 viewing angle of the first reconstruction, in degrees.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_initial_minimal_viewing_angle")
    )]
    pub initial_minimal_viewing_angle: f64,
    /// The distance between the two cameras of the first reconstruction, defining the map scale.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_initial_baseline")
    )]
    pub initial_baseline: f64,
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_initial_stereo_iterations")
    )]
    pub initial_stereo_iterations: usize,
    /// The number of observations an unlocalized track needs before it is triangulated.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_localization_minimal_observations")
    )]
    pub localization_minimal_observations: usize,
    /// The minimal viewing angle of a new localized point, in degrees.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_localization_minimal_viewing_angle")
    )]
    pub localization_minimal_viewing_angle: f64,
    /// The number of visible point tracks needed to relocalize.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_relocalization_minimal_tracks")
    )]
    pub relocalization_minimal_tracks: usize,
    /// The number of described localized points needed to relocalize.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_relocalization_minimal_localized_points")
    )]
    pub relocalization_minimal_localized_points: usize,
    /// The Hamming distance below which two descriptors match, in percent of the descriptor bits.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_descriptor_hamming_threshold")
    )]
    pub descriptor_hamming_threshold: u32,
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_background_mode")
    )]
    pub background_mode: BackgroundMode,
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_frame_statistics_enabled")
    )]
    pub frame_statistics_enabled: bool,
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_debug_data_enabled")
    )]
    pub debug_data_enabled: bool,
    /// Seeds the random generators of both threads.
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_random_seed"))]
    pub random_seed: u64,
}

impl Configuration {
    /// Checks every option, the error names the first offending one.
    pub fn validate(&self) -> Result<(), SlamError> {
        let fail = |reason: String| Err(SlamError::InvalidConfiguration(reason));
        if self.tracking_number_feature_points == 0 {
            return fail("tracking_number_feature_points must be positive".into());
        }
        if !PATCH_SIZES.contains(&self.tracking_patch_size) {
            return fail(format!(
                "tracking_patch_size must be one of {:?}, got {}",
                PATCH_SIZES, self.tracking_patch_size
            ));
        }
        if self.tracking_sub_pixel_iterations > 8 {
            return fail("tracking_sub_pixel_iterations must not exceed 8".into());
        }
        if self.tracking_coarsest_layer_radius < 2
            || self.tracking_maximal_offset < self.tracking_coarsest_layer_radius
        {
            return fail(format!(
                "tracking_coarsest_layer_radius {} must be at least 2 and not exceed tracking_maximal_offset {}",
                self.tracking_coarsest_layer_radius, self.tracking_maximal_offset
            ));
        }
        if !(self.tracking_maximal_sqr_patch_error > 0.0)
            || !(self.tracking_bidirectional_tolerance > 0.0)
        {
            return fail("the patch error and the bidirectional tolerance must be positive".into());
        }
        if !(self.maximal_projection_error > 0.0) || !self.maximal_projection_error.is_finite() {
            return fail("maximal_projection_error must be positive".into());
        }
        if self.minimal_number_correspondences < 5
            || self.tracking_switch_correspondences < self.minimal_number_correspondences
        {
            return fail(format!(
                "minimal_number_correspondences {} must be at least 5 and not exceed tracking_switch_correspondences {}",
                self.minimal_number_correspondences, self.tracking_switch_correspondences
            ));
        }
        if self.minimal_number_key_frames < 2
            || self.minimal_number_key_frames > self.maximal_number_key_frames
            || self.maximal_number_new_key_frames == 0
        {
            return fail(format!(
                "keyframe bounds are inconsistent: minimum {}, maximum {}, new {}",
                self.minimal_number_key_frames,
                self.maximal_number_key_frames,
                self.maximal_number_new_key_frames
            ));
        }
        if self.maximal_frame_history < self.maximal_number_key_frames {
            return fail("maximal_frame_history must cover maximal_number_key_frames".into());
        }
        if self.bundle_adjustment_iterations == 0 {
            return fail("bundle_adjustment_iterations must be positive".into());
        }
        if !(self.gravity_weight_factor >= 0.0) || !self.gravity_weight_factor.is_finite() {
            return fail(format!(
                "gravity_weight_factor must be finite and not negative, got {}",
                self.gravity_weight_factor
            ));
        }
        if self.harris_threshold_minimum > self.harris_threshold_initial
            || self.harris_threshold_initial > self.harris_threshold_maximum
        {
            return fail(format!(
                "harris thresholds must be ordered, got {} <= {} <= {}",
                self.harris_threshold_minimum,
                self.harris_threshold_initial,
                self.harris_threshold_maximum
            ));
        }
        if self.occupancy_bins == 0 || !(0.0..=1.0).contains(&self.occupancy_minimal_coverage) {
            return fail("occupancy_bins must be positive and the coverage within [0, 1]".into());
        }
        if self.initial_minimal_track_length < 2
            || !(self.initial_baseline > 0.0)
            || !(self.initial_minimal_viewing_angle >= 0.0)
            || self.initial_stereo_iterations == 0
        {
            return fail("initialization options are out of range".into());
        }
        if self.localization_minimal_observations < 2
            || !(self.localization_minimal_viewing_angle >= 0.0)
        {
            return fail("localization options are out of range".into());
        }
        if self.descriptor_hamming_threshold == 0 || self.descriptor_hamming_threshold > 100 {
            return fail(format!(
                "descriptor_hamming_threshold must be a percentage, got {}",
                self.descriptor_hamming_threshold
            ));
        }
        Ok(())
    }

    /// The patch tracker described by the tracking options.
    pub fn patch_tracker(&self) -> PatchTracker {
        PatchTracker {
            patch_size: self.tracking_patch_size,
            sub_pixel_iterations: self.tracking_sub_pixel_iterations,
            coarsest_layer_radius: self.tracking_coarsest_layer_radius,
            maximal_offset: f64::from(self.tracking_maximal_offset),
            maximal_sqr_patch_error: self.tracking_maximal_sqr_patch_error,
            bidirectional_tolerance: self.tracking_bidirectional_tolerance,
        }
    }

    pub fn maximal_sqr_projection_error(&self) -> f64 {
        self.maximal_projection_error * self.maximal_projection_error
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            tracking_number_feature_points: default_tracking_number_feature_points(),
            tracking_patch_size: default_tracking_patch_size(),
            tracking_sub_pixel_iterations: default_tracking_sub_pixel_iterations(),
            tracking_maximal_offset: default_tracking_maximal_offset(),
            tracking_coarsest_layer_radius: default_tracking_coarsest_layer_radius(),
            tracking_maximal_sqr_patch_error: default_tracking_maximal_sqr_patch_error(),
            tracking_bidirectional_tolerance: default_tracking_bidirectional_tolerance(),
            maximal_projection_error: default_maximal_projection_error(),
            minimal_number_correspondences: default_minimal_number_correspondences(),
            tracking_switch_correspondences: default_tracking_switch_correspondences(),
            maximal_number_key_frames: default_maximal_number_key_frames(),
            minimal_number_key_frames: default_minimal_number_key_frames(),
            maximal_number_new_key_frames: default_maximal_number_new_key_frames(),
            maximal_frame_history: default_maximal_frame_history(),
            bundle_adjustment_iterations: default_bundle_adjustment_iterations(),
            gravity_weight_factor: default_gravity_weight_factor(),
            harris_threshold_minimum: default_harris_threshold_minimum(),
            harris_threshold_initial: default_harris_threshold_initial(),
            harris_threshold_maximum: default_harris_threshold_maximum(),
            occupancy_bins: default_occupancy_bins(),
            occupancy_minimal_coverage: default_occupancy_minimal_coverage(),
            initial_minimal_track_length: default_initial_minimal_track_length(),
            initial_minimal_viewing_angle: default_initial_minimal_viewing_angle(),
            initial_baseline: default_initial_baseline(),
            initial_stereo_iterations: default_initial_stereo_iterations(),
            localization_minimal_observations: default_localization_minimal_observations(),
            localization_minimal_viewing_angle: default_localization_minimal_viewing_angle(),
            relocalization_minimal_tracks: default_relocalization_minimal_tracks(),
            relocalization_minimal_localized_points:
                default_relocalization_minimal_localized_points(),
            descriptor_hamming_threshold: default_descriptor_hamming_threshold(),
            background_mode: default_background_mode(),
            frame_statistics_enabled: default_frame_statistics_enabled(),
            debug_data_enabled: default_debug_data_enabled(),
            random_seed: default_random_seed(),
        }
    }
}

fn default_tracking_number_feature_points() -> usize {
    150
}

fn default_tracking_patch_size() -> u32 {
    7
}

fn default_tracking_sub_pixel_iterations() -> u32 {
    2
}

fn default_tracking_maximal_offset() -> u32 {
    64
}

fn default_tracking_coarsest_layer_radius() -> u32 {
    4
}

fn default_tracking_maximal_sqr_patch_error() -> f32 {
    400.0
}

fn default_tracking_bidirectional_tolerance() -> f64 {
    0.9
}

fn default_maximal_projection_error() -> f64 {
    3.5
}

fn default_minimal_number_correspondences() -> usize {
    20
}

fn default_tracking_switch_correspondences() -> usize {
    40
}

fn default_maximal_number_key_frames() -> usize {
    15
}

fn default_minimal_number_key_frames() -> usize {
    3
}

fn default_maximal_number_new_key_frames() -> usize {
    1
}

fn default_maximal_frame_history() -> usize {
    300
}

fn default_bundle_adjustment_iterations() -> usize {
    20
}

fn default_gravity_weight_factor() -> f64 {
    1.0
}

fn default_harris_threshold_minimum() -> u32 {
    8
}

fn default_harris_threshold_initial() -> u32 {
    19
}

fn default_harris_threshold_maximum() -> u32 {
    30
}

fn default_occupancy_bins() -> u32 {
    100
}

fn default_occupancy_minimal_coverage() -> f32 {
    0.8
}

fn default_initial_minimal_track_length() -> usize {
    10
}

fn default_initial_minimal_viewing_angle() -> f64 {
    1.5
}

fn default_initial_baseline() -> f64 {
    0.01
}

fn default_initial_stereo_iterations() -> usize {
    100
}

fn default_localization_minimal_observations() -> usize {
    10
}

fn default_localization_minimal_viewing_angle() -> f64 {
    1.5
}

fn default_relocalization_minimal_tracks() -> usize {
    10
}

fn default_relocalization_minimal_localized_points() -> usize {
    40
}

fn default_descriptor_hamming_threshold() -> u32 {
    35
}

fn default_background_mode() -> BackgroundMode {
    BackgroundMode::Threaded
}

fn default_frame_statistics_enabled() -> bool {
    true
}

fn default_debug_data_enabled() -> bool {
    false
}

fn default_random_seed() -> u64 {
    0
}
