/// The robust estimator used to down-weight large residuals.
///
/// All functions take squared residuals and a squared threshold `sqr_sigma` at which the
/// estimator starts limiting the influence of a residual.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RobustEstimator {
    /// Plain least squares.
    Square,
    Huber,
    Tukey,
    Cauchy,
}

impl RobustEstimator {
    /// The weight of a residual in an iteratively re-weighted least squares step.
    pub fn weight(self, sqr_residual: f64, sqr_sigma: f64) -> f64 {
        match self {
            Self::Square => 1.0,
            Self::Huber => {
                if sqr_residual <= sqr_sigma {
                    1.0
                } else {
                    (sqr_sigma / sqr_residual).sqrt()
                }
            }
            Self::Tukey => {
                if sqr_residual >= sqr_sigma {
                    0.0
                } else {
                    let t = 1.0 - sqr_residual / sqr_sigma;
                    t * t
                }
            }
            Self::Cauchy => 1.0 / (1.0 + sqr_residual / sqr_sigma),
        }
    }

    /// The robust error of a residual.
    pub fn error(self, sqr_residual: f64, sqr_sigma: f64) -> f64 {
        match self {
            Self::Square => sqr_residual,
            Self::Huber => {
                if sqr_residual <= sqr_sigma {
                    sqr_residual
                } else {
                    2.0 * (sqr_sigma * sqr_residual).sqrt() - sqr_sigma
                }
            }
            Self::Tukey => {
                if sqr_residual >= sqr_sigma {
                    sqr_sigma / 3.0
                } else {
                    let t = 1.0 - sqr_residual / sqr_sigma;
                    sqr_sigma / 3.0 * (1.0 - t * t * t)
                }
            }
            Self::Cauchy => sqr_sigma * (sqr_residual / sqr_sigma).ln_1p(),
        }
    }

    pub fn is_robust(self) -> bool {
        self != Self::Square
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Square => "square",
            Self::Huber => "huber",
            Self::Tukey => "tukey",
            Self::Cauchy => "cauchy",
        }
    }
}

/// Scales a residual so that its square equals the weighted squared residual.
pub(crate) fn weighted(residual: f64, weight: f64) -> f64 {
    residual * weight.sqrt()
}
