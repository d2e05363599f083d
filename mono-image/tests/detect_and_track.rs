use mono_image::{descriptor, Frame, FramePyramid, HarrisDetector, PatchTracker};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

/// Gaussian blobs on a gray background, shifted horizontally by `shift` pixels.
fn textured(width: u32, height: u32, shift: f64, padding: u32) -> Frame {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
    let blobs: Vec<(f64, f64, f64)> = (0..900)
        .map(|_| {
            (
                rng.gen_range(-10.0..f64::from(width) + 10.0),
                rng.gen_range(-10.0..f64::from(height) + 10.0),
                rng.gen_range(-90.0..90.0),
            )
        })
        .collect();
    let stride = (width + padding) as usize;
    let mut values = vec![128.0f64; stride * height as usize];
    for &(bx, by, amplitude) in &blobs {
        let bx = bx + shift;
        for y in (by as i64 - 9).max(0)..(by as i64 + 9).min(i64::from(height)) {
            for x in (bx as i64 - 9).max(0)..(bx as i64 + 9).min(i64::from(width)) {
                let d = (x as f64 - bx).powi(2) + (y as f64 - by).powi(2);
                values[y as usize * stride + x as usize] += amplitude * (-d / 9.0).exp();
            }
        }
    }
    let data = values
        .into_iter()
        .map(|value| value.clamp(0.0, 255.0) as u8)
        .collect();
    Frame::from_raw(width, height, padding, data).unwrap()
}

#[test]
fn corners_are_tracked_and_matched_across_frames() {
    let _ = pretty_env_logger::try_init();
    let shift = 4.75;
    let layers = FramePyramid::ideal_layers(320, 240, 32, 4);
    assert_eq!(layers, 4);
    let previous = FramePyramid::new(&textured(320, 240, 0.0, 13), layers).unwrap();
    let current = FramePyramid::new(&textured(320, 240, shift, 0), layers).unwrap();

    let corners = HarrisDetector::new(20.0).detect(previous.finest());
    assert!(corners.len() > 50, "only {} corners", corners.len());
    let points: Vec<_> = corners
        .iter()
        .map(|corner| corner.point)
        .filter(|point| point.x > 30.0 && point.x < 280.0 && point.y > 30.0 && point.y < 210.0)
        .take(100)
        .collect();

    let tracked = PatchTracker::default().track(&previous, &current, &points, None);
    let pairs: Vec<_> = points
        .iter()
        .zip(&tracked)
        .filter_map(|(point, tracked)| Some((*point, (*tracked)?)))
        .collect();
    assert!(pairs.len() * 10 >= points.len() * 8, "{} of {} tracked", pairs.len(), points.len());
    let mean_error = pairs
        .iter()
        .map(|(point, tracked)| ((tracked.x - point.x - shift).powi(2) + (tracked.y - point.y).powi(2)).sqrt())
        .sum::<f64>()
        / pairs.len() as f64;
    assert!(mean_error < 0.35, "mean error {}", mean_error);

    let threshold = descriptor::matching_threshold(35);
    let mut matched = 0;
    let mut compared = 0;
    for (point, tracked) in &pairs {
        let (Some(a), Some(b)) = (
            descriptor::compute_descriptor(&previous, point),
            descriptor::compute_descriptor(&current, tracked),
        ) else {
            continue;
        };
        compared += 1;
        if descriptor::distance(&a, &b) < threshold {
            matched += 1;
        }
    }
    assert!(compared > 20);
    assert!(matched * 10 >= compared * 9, "{} of {} matched", matched, compared);
}
