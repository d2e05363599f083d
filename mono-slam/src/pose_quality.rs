use crate::LocalizationPrecision;
use mono_core::PoseQuality;

/// Rates a pose by the precision of the object points it was determined with.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoseQualityCalculator {
    invalid: usize,
    unknown: usize,
    low: usize,
    medium: usize,
    high: usize,
}

impl PoseQualityCalculator {
    /// The number of at least medium precision points which give a medium quality pose.
    pub const MEDIUM_PRECISE_POINTS: usize = 20;
    /// The number of points with any known position which give a medium quality pose.
    pub const MEDIUM_POINTS: usize = 50;
    /// The number of points which give a low quality pose.
    pub const LOW_POINTS: usize = 20;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, precision: LocalizationPrecision) {
        match precision {
            LocalizationPrecision::Invalid => self.invalid += 1,
            LocalizationPrecision::Unknown => self.unknown += 1,
            LocalizationPrecision::Low => self.low += 1,
            LocalizationPrecision::Medium => self.medium += 1,
            LocalizationPrecision::High => self.high += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.invalid + self.unknown + self.low + self.medium + self.high
    }

    /// Never [`PoseQuality::High`], which is reserved for bundle adjusted poses.
    pub fn quality(&self) -> PoseQuality {
        let precise = self.medium + self.high;
        let known = self.unknown + self.low + precise;
        if precise >= Self::MEDIUM_PRECISE_POINTS || known >= Self::MEDIUM_POINTS {
            PoseQuality::Medium
        } else if self.total() >= Self::LOW_POINTS {
            PoseQuality::Low
        } else {
            PoseQuality::Invalid
        }
    }
}

impl FromIterator<LocalizationPrecision> for PoseQualityCalculator {
    fn from_iter<I: IntoIterator<Item = LocalizationPrecision>>(iter: I) -> Self {
        let mut calculator = Self::new();
        for precision in iter {
            calculator.add(precision);
        }
        calculator
    }
}
