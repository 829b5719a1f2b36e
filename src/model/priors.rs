//! Prior families for parameters and densities for latent nodes and
//! observed fields.

use std::fmt;

use super::expr::Expr;
use super::likelihood::{
    log_gamma_density, log_half_normal_density, log_normal_density, log_uniform_density,
};

/// Prior over a model parameter with fixed hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Prior {
    Normal { mean: f64, sd: f64 },
    Uniform { lower: f64, upper: f64 },
    /// Shape/rate parameterisation.
    Gamma { shape: f64, rate: f64 },
    HalfNormal { sd: f64 },
}

impl Prior {
    #[must_use]
    pub const fn normal(mean: f64, sd: f64) -> Self {
        Self::Normal { mean, sd }
    }

    /// Normal prior given its precision `1 / sd^2`, the BUGS/JAGS convention.
    #[must_use]
    pub fn normal_precision(mean: f64, precision: f64) -> Self {
        Self::Normal {
            mean,
            sd: precision.sqrt().recip(),
        }
    }

    #[must_use]
    pub const fn uniform(lower: f64, upper: f64) -> Self {
        Self::Uniform { lower, upper }
    }

    #[must_use]
    pub const fn gamma(shape: f64, rate: f64) -> Self {
        Self::Gamma { shape, rate }
    }

    #[must_use]
    pub const fn half_normal(sd: f64) -> Self {
        Self::HalfNormal { sd }
    }

    #[must_use]
    pub fn log_density(self, value: f64) -> f64 {
        match self {
            Self::Normal { mean, sd } => log_normal_density(value, mean, sd),
            Self::Uniform { lower, upper } => log_uniform_density(value, lower, upper),
            Self::Gamma { shape, rate } => log_gamma_density(value, shape, rate),
            Self::HalfNormal { sd } => log_half_normal_density(value, sd),
        }
    }

    /// Why the hyperparameters are unusable, if they are.
    #[must_use]
    pub fn defect(self) -> Option<&'static str> {
        let finite_positive = |value: f64| value.is_finite() && value > 0.0;
        match self {
            Self::Normal { mean, sd } => {
                if !mean.is_finite() {
                    Some("normal mean must be finite")
                } else if !finite_positive(sd) {
                    Some("normal standard deviation must be finite and positive")
                } else {
                    None
                }
            }
            Self::Uniform { lower, upper } => {
                if !(lower.is_finite() && upper.is_finite()) {
                    Some("uniform bounds must be finite")
                } else if lower >= upper {
                    Some("uniform lower bound must be below the upper bound")
                } else {
                    None
                }
            }
            Self::Gamma { shape, rate } => {
                if finite_positive(shape) && finite_positive(rate) {
                    None
                } else {
                    Some("gamma shape and rate must be finite and positive")
                }
            }
            Self::HalfNormal { sd } => {
                if finite_positive(sd) {
                    None
                } else {
                    Some("half-normal scale must be finite and positive")
                }
            }
        }
    }

    /// A central point of the support used to start chains.
    #[must_use]
    pub fn center(self) -> f64 {
        match self {
            Self::Normal { mean, .. } => mean,
            Self::Uniform { lower, upper } => 0.5 * (lower + upper),
            Self::Gamma { shape, rate } => (shape / rate).clamp(1.0e-3, 1.0e3),
            Self::HalfNormal { sd } => sd * std::f64::consts::FRAC_2_SQRT_PI / std::f64::consts::SQRT_2,
        }
    }

    /// Rough width of the prior, used to size initial proposals.
    #[must_use]
    pub fn spread(self) -> f64 {
        match self {
            Self::Normal { sd, .. } | Self::HalfNormal { sd } => sd,
            Self::Uniform { lower, upper } => (upper - lower) / 12.0_f64.sqrt(),
            Self::Gamma { shape, rate } => shape.sqrt() / rate,
        }
    }

    #[must_use]
    pub fn in_support(self, value: f64) -> bool {
        match self {
            Self::Normal { .. } => value.is_finite(),
            Self::Uniform { lower, upper } => (lower..=upper).contains(&value),
            Self::Gamma { .. } => value > 0.0 && value.is_finite(),
            Self::HalfNormal { .. } => value >= 0.0 && value.is_finite(),
        }
    }
}

impl fmt::Display for Prior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal { mean, sd } => write!(f, "normal({mean}, {sd})"),
            Self::Uniform { lower, upper } => write!(f, "uniform({lower}, {upper})"),
            Self::Gamma { shape, rate } => write!(f, "gamma({shape}, {rate})"),
            Self::HalfNormal { sd } => write!(f, "half_normal({sd})"),
        }
    }
}

/// Distribution of a latent node or an observed field, with hyperparameters
/// given as expressions evaluated per row.
#[derive(Debug, Clone, PartialEq)]
pub enum Density {
    Normal { location: Expr, scale: Expr },
    /// `location` is the logit of the success probability.
    BernoulliLogit { logit: Expr },
}

impl Density {
    #[must_use]
    pub fn normal(location: impl Into<Expr>, scale: impl Into<Expr>) -> Self {
        Self::Normal {
            location: location.into(),
            scale: scale.into(),
        }
    }

    #[must_use]
    pub fn bernoulli_logit(logit: impl Into<Expr>) -> Self {
        Self::BernoulliLogit {
            logit: logit.into(),
        }
    }

    #[must_use]
    pub const fn family(&self) -> &'static str {
        match self {
            Self::Normal { .. } => "normal",
            Self::BernoulliLogit { .. } => "bernoulli_logit",
        }
    }

    #[must_use]
    pub const fn is_discrete(&self) -> bool {
        matches!(self, Self::BernoulliLogit { .. })
    }

    #[must_use]
    pub fn expressions(&self) -> Vec<&Expr> {
        match self {
            Self::Normal { location, scale } => vec![location, scale],
            Self::BernoulliLogit { logit } => vec![logit],
        }
    }
}

impl fmt::Display for Density {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal { location, scale } => write!(f, "normal({location}, {scale})"),
            Self::BernoulliLogit { logit } => write!(f, "bernoulli_logit({logit})"),
        }
    }
}
