//! A FREAK style binary descriptor.
//!
//! The sampling pattern consists of 43 receptive fields on concentric rings around the point.
//! Each field averages the intensities of a small disc whose size grows with the ring radius, and
//! every descriptor bit compares two fields. The pattern is rotated by the intensity centroid
//! orientation of the point so that descriptors of rotated views still match.

use crate::FramePyramid;
use bitarray::{BitArray, Hamming};
use cv_core::nalgebra::{Point2, Vector2};
use rand::seq::index::sample;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use space::Metric;
use std::sync::OnceLock;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// The number of bytes of a descriptor.
pub const DESCRIPTOR_BYTES: usize = 32;

/// The number of bits of a descriptor.
pub const DESCRIPTOR_BITS: u32 = DESCRIPTOR_BYTES as u32 * 8;

/// A 256 bit binary descriptor.
pub type Descriptor = BitArray<DESCRIPTOR_BYTES>;

const RINGS: usize = 7;
const FIELDS_PER_RING: usize = 6;
const FIELDS: usize = RINGS * FIELDS_PER_RING + 1;
/// The radius of the outermost ring in pixels.
const PATTERN_RADIUS: f32 = 14.0;
/// The radius of the disc used to determine the orientation.
const ORIENTATION_RADIUS: i32 = 10;

#[derive(Debug, Clone, Copy)]
struct Field {
    offset: Vector2<f32>,
    sigma: f32,
}

struct Pattern {
    fields: [Field; FIELDS],
    pairs: Vec<(u8, u8)>,
}

fn pattern() -> &'static Pattern {
    static PATTERN: OnceLock<Pattern> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let mut fields = [Field {
            offset: Vector2::zeros(),
            sigma: 0.5,
        }; FIELDS];
        for ring in 0..RINGS {
            // Rings shrink geometrically towards the center, neighboring rings are rotated.
            let radius = PATTERN_RADIUS * 0.7f32.powi((RINGS - 1 - ring) as i32);
            let sigma = (radius * 0.25).max(0.5);
            for n in 0..FIELDS_PER_RING {
                let angle = std::f32::consts::TAU * (n as f32 + 0.5 * (ring % 2) as f32)
                    / FIELDS_PER_RING as f32;
                fields[1 + ring * FIELDS_PER_RING + n] = Field {
                    offset: Vector2::new(angle.cos(), angle.sin()) * radius,
                    sigma,
                };
            }
        }

        let all_pairs: Vec<(u8, u8)> = (0..FIELDS as u8)
            .flat_map(|a| (a + 1..FIELDS as u8).map(move |b| (a, b)))
            .collect();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0x4652_4541_4b32);
        let mut pairs: Vec<(u8, u8)> = sample(&mut rng, all_pairs.len(), DESCRIPTOR_BITS as usize)
            .into_iter()
            .map(|ix| all_pairs[ix])
            .collect();
        pairs.sort_unstable();
        Pattern { fields, pairs }
    })
}

/// The Hamming distance between two descriptors.
pub fn distance(a: &Descriptor, b: &Descriptor) -> u32 {
    Hamming.distance(a, b)
}

/// The smallest distance between `descriptor` and any of `candidates`.
pub fn best_distance<'a>(
    descriptor: &Descriptor,
    candidates: impl IntoIterator<Item = &'a Descriptor>,
) -> Option<u32> {
    candidates
        .into_iter()
        .map(|candidate| distance(descriptor, candidate))
        .min()
}

/// The distance below which two descriptors match, given as a percentage of the bits.
pub fn matching_threshold(percent: u32) -> u32 {
    DESCRIPTOR_BITS * percent.min(100) / 100
}

/// The minimal distance of a point to the frame border so that a descriptor can be computed.
pub fn descriptor_border() -> f64 {
    f64::from(PATTERN_RADIUS * 1.25 + 2.0)
}

/// Computes the descriptor of a point in the finest layer of `pyramid`.
///
/// Returns `None` if the sampling pattern leaves the frame.
pub fn compute_descriptor(pyramid: &FramePyramid, point: &Point2<f64>) -> Option<Descriptor> {
    let frame = pyramid.finest();
    if !frame.is_inside(point.x, point.y, descriptor_border()) {
        return None;
    }
    let (x, y) = (point.x as f32, point.y as f32);

    // Intensity centroid orientation.
    let (mut mx, mut my) = (0.0f32, 0.0f32);
    for dy in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
        for dx in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
            if dx * dx + dy * dy > ORIENTATION_RADIUS * ORIENTATION_RADIUS {
                continue;
            }
            let value = frame.interpolate_unchecked(x + dx as f32, y + dy as f32);
            mx += dx as f32 * value;
            my += dy as f32 * value;
        }
    }
    let angle = my.atan2(mx);
    let (sin, cos) = angle.sin_cos();

    let pattern = pattern();
    let mut intensities = [0.0f32; FIELDS];
    for (intensity, field) in intensities.iter_mut().zip(&pattern.fields) {
        let cx = x + cos * field.offset.x - sin * field.offset.y;
        let cy = y + sin * field.offset.x + cos * field.offset.y;
        // Nine samples spread over the field approximate a smoothed intensity.
        let mut sum = 0.0;
        for sy in -1..=1 {
            for sx in -1..=1 {
                sum += frame.interpolate_unchecked(
                    cx + sx as f32 * field.sigma,
                    cy + sy as f32 * field.sigma,
                );
            }
        }
        *intensity = sum / 9.0;
    }

    let mut descriptor = Descriptor::zeros();
    let bytes = descriptor.bytes_mut();
    for (bit, &(a, b)) in pattern.pairs.iter().enumerate() {
        if intensities[a as usize] < intensities[b as usize] {
            bytes[bit / 8] |= 1 << (bit % 8);
        }
    }
    Some(descriptor)
}

/// Computes the descriptors of many points, see [`compute_descriptor`].
pub fn compute_descriptors(pyramid: &FramePyramid, points: &[Point2<f64>]) -> Vec<Option<Descriptor>> {
    #[cfg(not(feature = "rayon"))]
    {
        points
            .iter()
            .map(|point| compute_descriptor(pyramid, point))
            .collect()
    }
    #[cfg(feature = "rayon")]
    {
        points
            .par_iter()
            .map(|point| compute_descriptor(pyramid, point))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Frame;
    use rand::Rng;

    fn textured(shift: f64) -> FramePyramid {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(21);
        let blobs: Vec<(f64, f64, f64)> = (0..300)
            .map(|_| (rng.gen_range(0.0..128.0), rng.gen_range(0.0..128.0), rng.gen_range(-80.0..80.0)))
            .collect();
        let frame = Frame::from_fn(128, 128, |x, y| {
            let x = f64::from(x) - shift;
            let y = f64::from(y);
            let value: f64 = blobs
                .iter()
                .map(|(bx, by, a)| a * (-((bx - x).powi(2) + (by - y).powi(2)) / 12.0).exp())
                .sum();
            (128.0 + value).clamp(0.0, 255.0) as u8
        })
        .unwrap();
        FramePyramid::new(&frame, 1).unwrap()
    }

    #[test]
    fn pattern_uses_distinct_pairs() {
        let pattern = pattern();
        assert_eq!(pattern.pairs.len(), DESCRIPTOR_BITS as usize);
        assert!(pattern.pairs.windows(2).all(|w| w[0] < w[1]));
        assert!(pattern.pairs.iter().all(|&(a, b)| a < b && (b as usize) < FIELDS));
    }

    #[test]
    fn shifted_views_match_and_other_points_do_not() {
        let first = textured(0.0);
        let second = textured(0.5);
        let threshold = matching_threshold(35);
        assert_eq!(threshold, 89);

        let a = compute_descriptor(&first, &Point2::new(60.0, 64.0)).unwrap();
        let b = compute_descriptor(&second, &Point2::new(60.5, 64.0)).unwrap();
        let other = compute_descriptor(&second, &Point2::new(40.0, 30.0)).unwrap();
        assert!(distance(&a, &b) < threshold / 2);
        assert!(distance(&a, &other) > distance(&a, &b));
        assert_eq!(best_distance(&a, [&other, &b]), Some(distance(&a, &b)));
    }

    #[test]
    fn border_points_have_no_descriptor() {
        let pyramid = textured(0.0);
        assert!(compute_descriptor(&pyramid, &Point2::new(5.0, 64.0)).is_none());
        let descriptors = compute_descriptors(&pyramid, &[Point2::new(64.0, 64.0), Point2::new(127.0, 2.0)]);
        assert!(descriptors[0].is_some());
        assert!(descriptors[1].is_none());
    }
}
