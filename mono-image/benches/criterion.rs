use criterion::{criterion_group, criterion_main, Criterion};
use mono_image::{descriptor, Frame, FramePyramid, HarrisDetector, PatchTracker};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

fn textured(width: u32, height: u32, shift: f64) -> Frame {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(0);
    let blobs: Vec<(f64, f64, f64)> = (0..2000)
        .map(|_| {
            (
                rng.gen_range(0.0..f64::from(width)),
                rng.gen_range(0.0..f64::from(height)),
                rng.gen_range(-80.0..80.0),
            )
        })
        .collect();
    let mut values = vec![128.0f64; (width * height) as usize];
    for &(bx, by, amplitude) in &blobs {
        let bx = bx + shift;
        for y in (by as i64 - 8).max(0)..(by as i64 + 8).min(i64::from(height)) {
            for x in (bx as i64 - 8).max(0)..(bx as i64 + 8).min(i64::from(width)) {
                let d = (x as f64 - bx).powi(2) + (y as f64 - by).powi(2);
                values[(y * i64::from(width) + x) as usize] += amplitude * (-d / 10.0).exp();
            }
        }
    }
    Frame::from_fn(width, height, |x, y| {
        values[(y * width + x) as usize].clamp(0.0, 255.0) as u8
    })
    .unwrap()
}

fn harris(c: &mut Criterion) {
    let frame = textured(640, 480, 0.0);
    let detector = HarrisDetector::new(20.0);
    c.bench_function("harris_640x480", |b| b.iter(|| detector.detect(&frame)));
    c.bench_function("harris_sub_region", |b| {
        b.iter(|| detector.detect_in(&frame, 100, 100, 80, 60))
    });
}

fn tracking(c: &mut Criterion) {
    let layers = FramePyramid::ideal_layers(640, 480, 64, 4);
    let previous = FramePyramid::new(&textured(640, 480, 0.0), layers).unwrap();
    let current = FramePyramid::new(&textured(640, 480, 3.5), layers).unwrap();
    let corners = HarrisDetector::new(20.0).detect(previous.finest());
    let points: Vec<_> = corners.iter().take(200).map(|corner| corner.point).collect();
    let tracker = PatchTracker::default();
    c.bench_function("track_200_points", |b| {
        b.iter(|| tracker.track(&previous, &current, &points, None))
    });
    c.bench_function("descriptors_200_points", |b| {
        b.iter(|| descriptor::compute_descriptors(&previous, &points))
    });
}

criterion_group!(
    name = image;
    config = Criterion::default().sample_size(10);
    targets = harris, tracking
);

criterion_main!(image);
