//! Algebraic expression trees over parameters, latent nodes and data fields.

use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};

/// Expression evaluated once per observation row (or grid point).
///
/// Names are resolved when the expression is added to a
/// [`ModelBuilder`](super::ModelBuilder); evaluation is pure arithmetic.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(f64),
    /// Scalar parameter, latent node, deterministic node or data field.
    Symbol(String),
    /// One component of a vector parameter.
    Element(String, usize),
    /// Data field at row `i - lag`. Rows before the start of the series read
    /// the first row.
    Lagged(String, usize),
    /// Dot product of the design row with a coefficient vector parameter.
    LinearPredictor(String),
    Sum(Vec<Expr>),
    Product(Vec<Expr>),
    Power(Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),
}

impl Expr {
    #[must_use]
    pub const fn constant(value: f64) -> Self {
        Self::Const(value)
    }

    #[must_use]
    pub fn sym(name: impl Into<String>) -> Self {
        Self::Symbol(name.into())
    }

    #[must_use]
    pub fn element(name: impl Into<String>, index: usize) -> Self {
        Self::Element(name.into(), index)
    }

    #[must_use]
    pub fn lag(field: impl Into<String>, lag: usize) -> Self {
        Self::Lagged(field.into(), lag)
    }

    #[must_use]
    pub fn linear_predictor(coefficients: impl Into<String>) -> Self {
        Self::LinearPredictor(coefficients.into())
    }

    #[must_use]
    pub fn pow(self, exponent: impl Into<Self>) -> Self {
        Self::Power(Box::new(self), Box::new(exponent.into()))
    }

    #[must_use]
    pub fn powi(self, exponent: i32) -> Self {
        self.pow(f64::from(exponent))
    }

    #[must_use]
    pub fn sqrt(self) -> Self {
        self.pow(0.5)
    }

    #[must_use]
    pub fn recip(self) -> Self {
        self.pow(-1.0)
    }

    /// Visit every node of the tree, parents before children.
    pub fn walk(&self, visit: &mut impl FnMut(&Self)) {
        visit(self);
        match self {
            Self::Sum(terms) | Self::Product(terms) => {
                for term in terms {
                    term.walk(visit);
                }
            }
            Self::Power(base, exponent) => {
                base.walk(visit);
                exponent.walk(visit);
            }
            Self::Neg(inner) => inner.walk(visit),
            Self::Const(_)
            | Self::Symbol(_)
            | Self::Element(..)
            | Self::Lagged(..)
            | Self::LinearPredictor(_) => {}
        }
    }

    /// Largest lag referenced anywhere in the tree.
    #[must_use]
    pub fn max_lag(&self) -> usize {
        let mut max = 0;
        self.walk(&mut |node| {
            if let Self::Lagged(_, lag) = node {
                max = max.max(*lag);
            }
        });
        max
    }
}

impl From<f64> for Expr {
    fn from(value: f64) -> Self {
        Self::Const(value)
    }
}

impl From<&str> for Expr {
    fn from(name: &str) -> Self {
        Self::Symbol(name.to_string())
    }
}

impl From<String> for Expr {
    fn from(name: String) -> Self {
        Self::Symbol(name)
    }
}

impl<R: Into<Self>> Add<R> for Expr {
    type Output = Self;

    fn add(self, rhs: R) -> Self {
        match (self, rhs.into()) {
            (Self::Sum(mut terms), Self::Sum(more)) => {
                terms.extend(more);
                Self::Sum(terms)
            }
            (Self::Sum(mut terms), other) => {
                terms.push(other);
                Self::Sum(terms)
            }
            (lhs, rhs) => Self::Sum(vec![lhs, rhs]),
        }
    }
}

impl<R: Into<Self>> Sub<R> for Expr {
    type Output = Self;

    fn sub(self, rhs: R) -> Self {
        self + (-rhs.into())
    }
}

impl<R: Into<Self>> Mul<R> for Expr {
    type Output = Self;

    fn mul(self, rhs: R) -> Self {
        match (self, rhs.into()) {
            (Self::Product(mut factors), Self::Product(more)) => {
                factors.extend(more);
                Self::Product(factors)
            }
            (Self::Product(mut factors), other) => {
                factors.push(other);
                Self::Product(factors)
            }
            (lhs, rhs) => Self::Product(vec![lhs, rhs]),
        }
    }
}

impl<R: Into<Self>> Div<R> for Expr {
    type Output = Self;

    fn div(self, rhs: R) -> Self {
        self * rhs.into().recip()
    }
}

impl Neg for Expr {
    type Output = Self;

    fn neg(self) -> Self {
        match self {
            Self::Const(value) => Self::Const(-value),
            Self::Neg(inner) => *inner,
            other => Self::Neg(Box::new(other)),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Const(value) => write!(f, "{value}"),
            Self::Symbol(name) => write!(f, "{name}"),
            Self::Element(name, index) => write!(f, "{name}[{index}]"),
            Self::Lagged(name, lag) => write!(f, "lag({name}, {lag})"),
            Self::LinearPredictor(name) => write!(f, "X * {name}"),
            Self::Sum(terms) => write_joined(f, terms, " + "),
            Self::Product(factors) => write_joined(f, factors, " * "),
            Self::Power(base, exponent) => write!(f, "pow({base}, {exponent})"),
            Self::Neg(inner) => write!(f, "-{inner}"),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, items: &[Expr], separator: &str) -> fmt::Result {
    f.write_str("(")?;
    for (position, item) in items.iter().enumerate() {
        if position > 0 {
            f.write_str(separator)?;
        }
        write!(f, "{item}")?;
    }
    f.write_str(")")
}
