mod common;

use common::{inline_configuration, tracker, Sequence};
use cv_core::nalgebra::Vector3;
use mono_slam::{Configuration, TrackerState};

#[test]
fn tracking_recovers_after_an_occlusion() {
    let sequence = Sequence::new(26, 0.06).occluded(15..20);
    let mut tracker = tracker(Configuration {
        initial_minimal_track_length: 5,
        relocalization_minimal_localized_points: 20,
        ..inline_configuration()
    });

    let mut reported = vec![];
    for ix in 0..sequence.len() {
        let pose = tracker
            .handle_frame(&sequence.camera, &sequence.frame(ix), &Vector3::zeros(), None)
            .unwrap();
        reported.push(pose.is_valid());
        if ix == 14 {
            assert_eq!(tracker.state(), TrackerState::Tracking);
            assert!(pose.is_valid(), "no pose right before the occlusion");
        }
    }

    for ix in 15..20 {
        assert!(!reported[ix], "frame {} shows noise but has a pose", ix);
    }
    let recovered = (20..23).find(|&ix| reported[ix]);
    assert!(
        recovered.is_some(),
        "no pose within three frames after the occlusion: {:?}",
        &reported[20..]
    );
    assert_eq!(tracker.state(), TrackerState::Tracking);
    assert!(reported[sequence.len() - 1]);
}
