mod common;

use common::{inline_configuration, tracker, Sequence, HEIGHT, WIDTH};
use cv_core::nalgebra::{UnitQuaternion, Vector3};
use mono_core::{PinholeCamera, INVALID_INDEX};
use mono_image::Frame;
use mono_slam::{Configuration, SlamError, TrackerMono, TrackerState};
use std::thread;
use std::time::Duration;

#[test]
fn the_first_configuration_stays() {
    let mut tracker = TrackerMono::new();
    let first = Configuration {
        tracking_patch_size: 15,
        ..inline_configuration()
    };
    tracker.configure(first).unwrap();

    let second = Configuration {
        tracking_patch_size: 5,
        ..inline_configuration()
    };
    assert!(matches!(
        tracker.configure(second),
        Err(SlamError::AlreadyConfigured)
    ));
    assert_eq!(tracker.configuration(), Some(&first));
}

#[test]
fn invalid_configurations_are_rejected() {
    let mut tracker = TrackerMono::new();
    let invalid = Configuration {
        tracking_patch_size: 8,
        ..Default::default()
    };
    assert!(matches!(
        tracker.configure(invalid),
        Err(SlamError::InvalidConfiguration(_))
    ));
    assert!(tracker.configuration().is_none());
    tracker.configure(inline_configuration()).unwrap();
}

#[test]
fn frames_before_configure_are_rejected() {
    let sequence = Sequence::new(2, 0.04);
    let mut tracker = TrackerMono::new();
    let result = tracker.handle_frame(&sequence.camera, &sequence.frame(0), &Vector3::zeros(), None);
    assert!(matches!(result, Err(SlamError::NotConfigured)));
    assert_eq!(tracker.frame_index(), INVALID_INDEX);
    assert_eq!(tracker.state(), TrackerState::Unknown);
    assert!(tracker.camera_poses().is_none());
}

#[test]
fn invalid_frames_and_cameras_do_not_advance() {
    let sequence = Sequence::new(3, 0.04);
    let mut tracker = tracker(inline_configuration());

    let small = Frame::new(WIDTH / 2, HEIGHT / 2).unwrap();
    assert!(matches!(
        tracker.handle_frame(&sequence.camera, &small, &Vector3::zeros(), None),
        Err(SlamError::InvalidFrame { .. })
    ));
    let broken = PinholeCamera::new(WIDTH, HEIGHT, 0.0);
    assert!(matches!(
        tracker.handle_frame(&broken, &sequence.frame(0), &Vector3::zeros(), None),
        Err(SlamError::InvalidCamera)
    ));
    assert_eq!(tracker.frame_index(), INVALID_INDEX);

    tracker
        .handle_frame(&sequence.camera, &sequence.frame(0), &Vector3::zeros(), None)
        .unwrap();
    assert_eq!(tracker.frame_index(), 0);
    assert_eq!(tracker.state(), TrackerState::Initializing);

    // The first frame fixed the camera profile.
    let other = PinholeCamera::new(WIDTH / 2, HEIGHT / 2, 200.0);
    assert!(matches!(
        tracker.handle_frame(&other, &small, &Vector3::zeros(), None),
        Err(SlamError::InvalidFrame { .. })
    ));
    assert_eq!(tracker.frame_index(), 0);
}

#[test]
fn frame_indices_advance_by_one() {
    let sequence = Sequence::new(12, 0.04).occluded(6..8);
    let mut tracker = tracker(inline_configuration());
    let orientation = UnitQuaternion::identity();
    for ix in 0..sequence.len() {
        let pose = tracker
            .handle_frame(
                &sequence.camera,
                &sequence.frame(ix),
                &Vector3::new(0.0, -9.81, 0.0),
                Some(&orientation),
            )
            .unwrap();
        assert_eq!(tracker.frame_index(), ix as u32);
        if pose.is_valid() {
            assert_eq!(tracker.pose(ix as u32).map(|pose| pose.is_valid()), Some(true));
        }
    }
    let (frame_index, gravity) = tracker.latest_gravity().unwrap();
    assert_eq!(frame_index, 11);
    assert!((gravity.into_inner() - Vector3::new(0.0, -1.0, 0.0)).norm() < 1e-9);
}

#[test]
fn the_background_thread_runs_and_stops() {
    let sequence = Sequence::new(12, 0.04);
    let mut tracker = tracker(Configuration::default());
    for ix in 0..sequence.len() {
        tracker
            .handle_frame(&sequence.camera, &sequence.frame(ix), &Vector3::zeros(), None)
            .unwrap();
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(tracker.frame_index(), 11);
    assert_ne!(tracker.state(), TrackerState::Unknown);
    assert!(tracker.number_point_tracks() + tracker.object_points().len() > 0);
    assert!(tracker
        .performance_report()
        .contains("determine initial points"));
    drop(tracker);
}
