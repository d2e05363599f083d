//! Order statistics over floating point values.

use float_ord::FloatOrd;

/// Returns the `ratio` percentile of the values, with `ratio` in `[0, 1]`.
///
/// The values are reordered in place. The element at index `floor(n * ratio)` (clamped to the last
/// element) of the sorted sequence is returned, so the 0.5 percentile of an even sized slice is the
/// upper median.
pub fn percentile(values: &mut [f64], ratio: f64) -> Option<f64> {
    if values.is_empty() || !(0.0..=1.0).contains(&ratio) {
        return None;
    }
    let index = ((values.len() as f64 * ratio) as usize).min(values.len() - 1);
    let (_, &mut value, _) = values.select_nth_unstable_by_key(index, |&v| FloatOrd(v));
    Some(value)
}

/// The median of the values, reordering them in place.
pub fn median(values: &mut [f64]) -> Option<f64> {
    percentile(values, 0.5)
}

/// The percentile of integer values such as track lengths.
pub fn percentile_usize(values: &mut [usize], ratio: f64) -> Option<usize> {
    if values.is_empty() || !(0.0..=1.0).contains(&ratio) {
        return None;
    }
    let index = ((values.len() as f64 * ratio) as usize).min(values.len() - 1);
    let (_, &mut value, _) = values.select_nth_unstable(index);
    Some(value)
}
