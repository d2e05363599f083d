use cv_core::nalgebra::Point2;

/// A grid over the frame counting the feature points inside every bin.
///
/// A bin counts as covered if it or one of the bins in its `neighborhood x neighborhood` window holds
/// a point. New points are only accepted in bins whose window is empty, which spreads the points
/// over the frame.
#[derive(Debug, Clone, PartialEq)]
pub struct OccupancyArray {
    width: f64,
    height: f64,
    horizontal_bins: u32,
    vertical_bins: u32,
    neighborhood: u32,
    minimal_coverage: f32,
    counts: Vec<u32>,
}

impl OccupancyArray {
    /// Creates an empty grid with `neighborhood` times the ideal number of bins per direction.
    ///
    /// `neighborhood` must be odd.
    pub fn new(
        width: u32,
        height: u32,
        number_bins: u32,
        neighborhood: u32,
        minimal_coverage: f32,
    ) -> Self {
        let (horizontal, vertical) = ideal_bins(width, height, number_bins);
        let neighborhood = neighborhood.max(1) | 1;
        let horizontal_bins = horizontal * neighborhood;
        let vertical_bins = vertical * neighborhood;
        log::debug!(
            "using {}x{} occupancy bins with a {}x{} neighborhood and {:.1}% minimal coverage",
            horizontal_bins,
            vertical_bins,
            neighborhood,
            neighborhood,
            minimal_coverage * 100.0
        );
        Self {
            width: f64::from(width),
            height: f64::from(height),
            horizontal_bins,
            vertical_bins,
            neighborhood,
            minimal_coverage,
            counts: vec![0; (horizontal_bins * vertical_bins) as usize],
        }
    }

    pub fn matches(&self, width: u32, height: u32) -> bool {
        self.width == f64::from(width) && self.height == f64::from(height)
    }

    pub fn bins(&self) -> (u32, u32) {
        (self.horizontal_bins, self.vertical_bins)
    }

    fn bin(&self, point: &Point2<f64>) -> Option<(u32, u32)> {
        if !(point.x >= 0.0 && point.y >= 0.0 && point.x < self.width && point.y < self.height) {
            return None;
        }
        let x = (point.x * f64::from(self.horizontal_bins) / self.width) as u32;
        let y = (point.y * f64::from(self.vertical_bins) / self.height) as u32;
        Some((
            x.min(self.horizontal_bins - 1),
            y.min(self.vertical_bins - 1),
        ))
    }

    fn window_is_empty(&self, x: u32, y: u32) -> bool {
        let radius = self.neighborhood / 2;
        let (x0, x1) = (x.saturating_sub(radius), (x + radius).min(self.horizontal_bins - 1));
        let (y0, y1) = (y.saturating_sub(radius), (y + radius).min(self.vertical_bins - 1));
        (y0..=y1).all(|y| (x0..=x1).all(|x| self.counts[(y * self.horizontal_bins + x) as usize] == 0))
    }

    /// Counts a point regardless of its neighbors, points outside the frame are ignored.
    pub fn add_point(&mut self, point: &Point2<f64>) -> bool {
        match self.bin(point) {
            Some((x, y)) => {
                self.counts[(y * self.horizontal_bins + x) as usize] += 1;
                true
            }
            None => false,
        }
    }

    /// Counts a point only if no point lies in the neighborhood of its bin.
    pub fn add_point_if_empty(&mut self, point: &Point2<f64>) -> bool {
        match self.bin(point) {
            Some((x, y)) if self.window_is_empty(x, y) => {
                self.counts[(y * self.horizontal_bins + x) as usize] += 1;
                true
            }
            _ => false,
        }
    }

    /// Removes all points, the grid layout is kept.
    pub fn remove_points(&mut self) {
        self.counts.iter_mut().for_each(|count| *count = 0);
    }

    /// The share of bins which are covered by a point in their neighborhood, in `[0, 1]`.
    pub fn coverage(&self) -> f32 {
        let covered = (0..self.vertical_bins)
            .flat_map(|y| (0..self.horizontal_bins).map(move |x| (x, y)))
            .filter(|&(x, y)| !self.window_is_empty(x, y))
            .count();
        covered as f32 / self.counts.len() as f32
    }

    pub fn need_more_points(&self) -> bool {
        self.coverage() < self.minimal_coverage
    }

    /// The number of points added since the last [`OccupancyArray::remove_points`].
    pub fn number_points(&self) -> usize {
        self.counts.iter().map(|&count| count as usize).sum()
    }
}

/// Splits a frame into about `number_bins` bins of roughly square shape.
pub fn ideal_bins(width: u32, height: u32, number_bins: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (1, 1);
    }
    let aspect = f64::from(width) / f64::from(height);
    let horizontal = (f64::from(number_bins.max(1)) * aspect).sqrt().round().max(1.0) as u32;
    let vertical = (f64::from(number_bins.max(1)) / f64::from(horizontal))
        .round()
        .max(1.0) as u32;
    (horizontal.min(width), vertical.min(height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ideal_bins_follow_the_aspect_ratio() {
        assert_eq!(ideal_bins(640, 480, 100), (12, 8));
        assert_eq!(ideal_bins(100, 100, 16), (4, 4));
        assert_eq!(ideal_bins(3, 1000, 100), (1, 100));
    }

    #[test]
    fn neighborhoods_block_new_points() {
        let mut occupancy = OccupancyArray::new(120, 120, 16, 3, 0.8);
        assert_eq!(occupancy.bins(), (12, 12));
        assert!(occupancy.add_point_if_empty(&Point2::new(15.0, 15.0)));
        // One bin to the right is inside the window.
        assert!(!occupancy.add_point_if_empty(&Point2::new(25.0, 15.0)));
        assert!(occupancy.add_point_if_empty(&Point2::new(35.0, 15.0)));
        assert!(occupancy.add_point(&Point2::new(25.0, 15.0)));
        assert!(!occupancy.add_point(&Point2::new(-1.0, 15.0)));
        assert_eq!(occupancy.number_points(), 3);

        occupancy.remove_points();
        assert_eq!(occupancy.number_points(), 0);
        assert_eq!(occupancy.coverage(), 0.0);
    }

    #[test]
    fn coverage_counts_covered_windows() {
        let mut occupancy = OccupancyArray::new(90, 90, 9, 3, 0.5);
        // A single point in the center bin covers its 3x3 window of 81 bins.
        occupancy.add_point(&Point2::new(45.0, 45.0));
        assert!((occupancy.coverage() - 9.0 / 81.0).abs() < 1e-6);
        assert!(occupancy.need_more_points());

        for y in 0..3 {
            for x in 0..3 {
                for (dx, dy) in [(0.0, 0.0), (15.0, 0.0), (0.0, 15.0), (15.0, 15.0)] {
                    occupancy.add_point(&Point2::new(
                        5.0 + 30.0 * f64::from(x) + dx,
                        5.0 + 30.0 * f64::from(y) + dy,
                    ));
                }
            }
        }
        assert_eq!(occupancy.coverage(), 1.0);
        assert!(!occupancy.need_more_points());
    }
}
