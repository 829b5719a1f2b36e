//! Resolved, index-based form of model expressions.
//!
//! [`Expr`] trees refer to names; before sampling or prediction they are
//! resolved once against the parameter layout and a [`FieldTable`] (the
//! dataset or a prediction grid) into [`Node`] trees that evaluate with
//! plain indexing.

use std::collections::BTreeMap;

use rand::RngExt;
use rand::rngs::StdRng;
use thiserror::Error;

use super::expr::Expr;
use super::likelihood::{bernoulli_logit_log_mass, log_normal_density, logistic};
use super::priors::Density;
use super::{Generated, ModelSpec};
use crate::input::FieldTable;
use crate::utils::sample_standard_normal;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EvalError {
    #[error("field `{name}` is not available")]
    MissingField { name: String },
    #[error("symbol `{name}` cannot be resolved here")]
    Unresolved { name: String },
    #[error("`{parameter}` has {expected} coefficients; the design has {found} columns")]
    DesignWidth {
        parameter: String,
        expected: usize,
        found: usize,
    },
    #[error("latent nodes have {expected} rows; the evaluation table has {found}")]
    LatentRows { expected: usize, found: usize },
    #[error("a predictive quantity needs a random source")]
    MissingRandomSource,
}

/// Expression node with every name replaced by an index.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Const(f64),
    /// Offset into the flattened parameter vector.
    Param(usize),
    /// Latent node index; read at the current row.
    Latent(usize),
    /// Deterministic node index; read from the per-row buffer.
    Derived(usize),
    Field { field: usize, lag: usize },
    /// Design row times `params[offset..offset + K]`.
    Dot { offset: usize },
    Sum(Vec<Node>),
    Product(Vec<Node>),
    Power(Box<Node>, Box<Node>),
    PowI(Box<Node>, i32),
    Neg(Box<Node>),
}

/// Values visible while evaluating one row.
#[derive(Debug, Clone, Copy)]
pub struct RowScope<'a> {
    pub params: &'a [f64],
    /// Latent values, latent-major: latent `l` at row `i` is
    /// `latents[l * latent_rows + i]`.
    pub latents: &'a [f64],
    pub latent_rows: usize,
    pub derived: &'a [f64],
    pub fields: &'a FieldTable,
    pub row: usize,
}

impl Node {
    #[must_use]
    pub fn eval(&self, scope: &RowScope<'_>) -> f64 {
        match self {
            Self::Const(value) => *value,
            Self::Param(offset) => scope.params[*offset],
            Self::Latent(index) => scope.latents[index * scope.latent_rows + scope.row],
            Self::Derived(index) => scope.derived[*index],
            Self::Field { field, lag } => scope.fields.value(scope.row.saturating_sub(*lag), *field),
            Self::Dot { offset } => scope
                .fields
                .design_fields()
                .iter()
                .enumerate()
                .fold(0.0, |acc, (position, field)| {
                    scope
                        .fields
                        .value(scope.row, *field)
                        .mul_add(scope.params[offset + position], acc)
                }),
            Self::Sum(terms) => terms.iter().map(|term| term.eval(scope)).sum(),
            Self::Product(factors) => factors.iter().map(|factor| factor.eval(scope)).product(),
            Self::Power(base, exponent) => base.eval(scope).powf(exponent.eval(scope)),
            Self::PowI(base, exponent) => base.eval(scope).powi(*exponent),
            Self::Neg(inner) => -inner.eval(scope),
        }
    }
}

/// Density with resolved hyperparameters.
#[derive(Debug, Clone, PartialEq)]
pub enum DensityNode {
    Normal { location: Node, scale: Node },
    BernoulliLogit { logit: Node },
}

impl DensityNode {
    #[must_use]
    pub fn log_density(&self, value: f64, scope: &RowScope<'_>) -> f64 {
        match self {
            Self::Normal { location, scale } => {
                log_normal_density(value, location.eval(scope), scale.eval(scope))
            }
            Self::BernoulliLogit { logit } => bernoulli_logit_log_mass(value, logit.eval(scope)),
        }
    }

    pub fn sample(&self, scope: &RowScope<'_>, rng: &mut StdRng) -> f64 {
        match self {
            Self::Normal { location, scale } => {
                scale
                    .eval(scope)
                    .mul_add(sample_standard_normal(rng), location.eval(scope))
            }
            Self::BernoulliLogit { logit } => {
                if rng.random::<f64>() < logistic(logit.eval(scope)) {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

/// Name lookup for one model against one field table.
#[derive(Debug)]
pub struct Resolver<'a> {
    params: BTreeMap<&'a str, usize>,
    latents: BTreeMap<&'a str, usize>,
    derived: BTreeMap<&'a str, usize>,
    fields: &'a FieldTable,
}

impl<'a> Resolver<'a> {
    #[must_use]
    pub fn new(model: &'a ModelSpec, fields: &'a FieldTable) -> Self {
        Self {
            params: model
                .parameter_offsets()
                .into_iter()
                .map(|(name, offset, _)| (name, offset))
                .collect(),
            latents: model
                .latents()
                .iter()
                .enumerate()
                .map(|(index, latent)| (latent.name.as_str(), index))
                .collect(),
            derived: model
                .deterministic()
                .iter()
                .enumerate()
                .map(|(index, decl)| (decl.name.as_str(), index))
                .collect(),
            fields,
        }
    }

    /// # Errors
    ///
    /// Returns `EvalError` if a name is not available in this table.
    pub fn resolve(&self, expr: &Expr) -> Result<Node, EvalError> {
        Ok(match expr {
            Expr::Const(value) => Node::Const(*value),
            Expr::Symbol(name) => {
                if let Some(offset) = self.params.get(name.as_str()) {
                    Node::Param(*offset)
                } else if let Some(index) = self.latents.get(name.as_str()) {
                    Node::Latent(*index)
                } else if let Some(index) = self.derived.get(name.as_str()) {
                    Node::Derived(*index)
                } else {
                    Node::Field {
                        field: self.field(name)?,
                        lag: 0,
                    }
                }
            }
            Expr::Element(name, index) => {
                let offset = self.parameter(name)?;
                Node::Param(offset + index)
            }
            Expr::Lagged(name, lag) => Node::Field {
                field: self.field(name)?,
                lag: *lag,
            },
            Expr::LinearPredictor(name) => Node::Dot {
                offset: self.parameter(name)?,
            },
            Expr::Sum(terms) => Node::Sum(self.resolve_all(terms)?),
            Expr::Product(factors) => Node::Product(self.resolve_all(factors)?),
            Expr::Power(base, exponent) => {
                let base = Box::new(self.resolve(base)?);
                match exponent.as_ref() {
                    Expr::Const(value) if value.fract() == 0.0 && value.abs() <= 64.0 => {
                        // exact conversion: integral and small
                        #[allow(clippy::cast_possible_truncation)]
                        let exponent = *value as i32;
                        Node::PowI(base, exponent)
                    }
                    other => Node::Power(base, Box::new(self.resolve(other)?)),
                }
            }
            Expr::Neg(inner) => Node::Neg(Box::new(self.resolve(inner)?)),
        })
    }

    /// # Errors
    ///
    /// Returns `EvalError` if a hyperparameter expression cannot be resolved.
    pub fn resolve_density(&self, density: &Density) -> Result<DensityNode, EvalError> {
        Ok(match density {
            Density::Normal { location, scale } => DensityNode::Normal {
                location: self.resolve(location)?,
                scale: self.resolve(scale)?,
            },
            Density::BernoulliLogit { logit } => DensityNode::BernoulliLogit {
                logit: self.resolve(logit)?,
            },
        })
    }

    /// # Errors
    ///
    /// Returns `EvalError::MissingField` if `name` is not in the table.
    pub fn field(&self, name: &str) -> Result<usize, EvalError> {
        self.fields
            .index_of(name)
            .ok_or_else(|| EvalError::MissingField {
                name: name.to_string(),
            })
    }

    fn parameter(&self, name: &str) -> Result<usize, EvalError> {
        self.params
            .get(name)
            .copied()
            .ok_or_else(|| EvalError::Unresolved {
                name: name.to_string(),
            })
    }

    fn resolve_all(&self, exprs: &[Expr]) -> Result<Vec<Node>, EvalError> {
        exprs.iter().map(|expr| self.resolve(expr)).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Measurement {
    latent: usize,
    field: usize,
    error: usize,
}

/// Per-row joint log density of latent nodes and observed fields.
#[derive(Debug, Clone)]
pub struct RowProgram {
    derived: Vec<Node>,
    scalar_derived: Vec<usize>,
    latent_priors: Vec<DensityNode>,
    measurements: Vec<Measurement>,
    likelihoods: Vec<(usize, DensityNode)>,
    start_row: usize,
}

impl RowProgram {
    /// # Errors
    ///
    /// Returns `EvalError` if the model does not resolve against `fields`.
    pub fn compile(model: &ModelSpec, fields: &FieldTable) -> Result<Self, EvalError> {
        let resolver = Resolver::new(model, fields);
        let derived = model
            .deterministic()
            .iter()
            .map(|decl| resolver.resolve(&decl.expr))
            .collect::<Result<_, _>>()?;
        let latent_priors = model
            .latents()
            .iter()
            .map(|latent| resolver.resolve_density(&latent.density))
            .collect::<Result<_, _>>()?;
        let measurements = model
            .latents()
            .iter()
            .enumerate()
            .map(|(latent, decl)| {
                Ok(Measurement {
                    latent,
                    field: resolver.field(&decl.paired_field)?,
                    error: resolver.field(&decl.error_field)?,
                })
            })
            .collect::<Result<_, EvalError>>()?;
        let likelihoods = model
            .likelihoods()
            .iter()
            .map(|likelihood| {
                Ok((
                    resolver.field(&likelihood.field)?,
                    resolver.resolve_density(&likelihood.density)?,
                ))
            })
            .collect::<Result<_, EvalError>>()?;

        Ok(Self {
            derived,
            scalar_derived: model.derived_scalars().map(|(index, _)| index).collect(),
            latent_priors,
            measurements,
            likelihoods,
            start_row: model.start_row(),
        })
    }

    #[must_use]
    pub fn latent_count(&self) -> usize {
        self.latent_priors.len()
    }

    #[must_use]
    pub fn scalar_derived_count(&self) -> usize {
        self.scalar_derived.len()
    }

    /// Log density contributed by one row: latent priors, implied
    /// measurement likelihoods and, from the start row on, the observed
    /// likelihoods.
    pub fn row_log_density(
        &self,
        params: &[f64],
        latents: &[f64],
        fields: &FieldTable,
        row: usize,
        derived: &mut Vec<f64>,
    ) -> f64 {
        self.fill_derived(params, latents, fields, row, derived);
        let scope = RowScope {
            params,
            latents,
            latent_rows: fields.nrows(),
            derived,
            fields,
            row,
        };

        let mut total = 0.0;
        for (latent, prior) in self.latent_priors.iter().enumerate() {
            total += prior.log_density(latents[latent * fields.nrows() + row], &scope);
        }
        for measurement in &self.measurements {
            total += log_normal_density(
                fields.value(row, measurement.field),
                latents[measurement.latent * fields.nrows() + row],
                fields.value(row, measurement.error),
            );
        }
        if row >= self.start_row {
            for (field, density) in &self.likelihoods {
                total += density.log_density(fields.value(row, *field), &scope);
            }
        }
        total
    }

    /// Sum of [`row_log_density`](Self::row_log_density) over every row.
    pub fn log_density(
        &self,
        params: &[f64],
        latents: &[f64],
        fields: &FieldTable,
        derived: &mut Vec<f64>,
    ) -> f64 {
        (0..fields.nrows())
            .map(|row| self.row_log_density(params, latents, fields, row, derived))
            .sum()
    }

    /// Values of the row-independent deterministic nodes.
    pub fn scalar_derived(
        &self,
        params: &[f64],
        latents: &[f64],
        fields: &FieldTable,
        derived: &mut Vec<f64>,
        out: &mut Vec<f64>,
    ) {
        out.clear();
        if self.scalar_derived.is_empty() {
            return;
        }
        self.fill_derived(params, latents, fields, 0, derived);
        out.extend(self.scalar_derived.iter().map(|index| derived[*index]));
    }

    fn fill_derived(
        &self,
        params: &[f64],
        latents: &[f64],
        fields: &FieldTable,
        row: usize,
        derived: &mut Vec<f64>,
    ) {
        derived.clear();
        for node in &self.derived {
            let value = node.eval(&RowScope {
                params,
                latents,
                latent_rows: fields.nrows(),
                derived,
                fields,
                row,
            });
            derived.push(value);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum QuantityNode {
    Expression(Node),
    Predictive(DensityNode),
}

/// Generated quantities resolved against a prediction table.
///
/// Only deterministic nodes reachable from a generated quantity are
/// resolved, so a grid does not need the fields used by the likelihood.
#[derive(Debug, Clone)]
pub struct GeneratedProgram {
    derived: Vec<Option<Node>>,
    quantities: Vec<QuantityNode>,
    latent_rows: Option<usize>,
}

impl GeneratedProgram {
    /// `latent_rows` is the number of observations the latent nodes were
    /// sampled for.
    ///
    /// # Errors
    ///
    /// Returns `EvalError` if a quantity does not resolve against `fields`.
    pub fn compile(
        model: &ModelSpec,
        fields: &FieldTable,
        latent_rows: usize,
    ) -> Result<Self, EvalError> {
        let resolver = Resolver::new(model, fields);
        let reachable = reachable_derived(model);

        let derived = model
            .deterministic()
            .iter()
            .zip(&reachable)
            .map(|(decl, needed)| {
                if *needed {
                    resolver.resolve(&decl.expr).map(Some)
                } else {
                    Ok(None)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        let quantities = model
            .generated()
            .iter()
            .map(|decl| match &decl.generated {
                Generated::Expression(expr) => resolver.resolve(expr).map(QuantityNode::Expression),
                Generated::Predictive(density) => resolver
                    .resolve_density(density)
                    .map(QuantityNode::Predictive),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut uses_latents = false;
        let mut visit = |node: &Node| uses_latents |= references_latent(node);
        for node in derived.iter().flatten() {
            visit(node);
        }
        for quantity in &quantities {
            match quantity {
                QuantityNode::Expression(node) => visit(node),
                QuantityNode::Predictive(DensityNode::Normal { location, scale }) => {
                    visit(location);
                    visit(scale);
                }
                QuantityNode::Predictive(DensityNode::BernoulliLogit { logit }) => visit(logit),
            }
        }

        if uses_latents && fields.nrows() != latent_rows {
            return Err(EvalError::LatentRows {
                expected: latent_rows,
                found: fields.nrows(),
            });
        }
        Ok(Self {
            derived,
            quantities,
            latent_rows: uses_latents.then_some(latent_rows),
        })
    }

    #[must_use]
    pub fn quantity_count(&self) -> usize {
        self.quantities.len()
    }

    #[must_use]
    pub fn is_stochastic(&self) -> bool {
        self.quantities
            .iter()
            .any(|quantity| matches!(quantity, QuantityNode::Predictive(_)))
    }

    /// Evaluate every quantity at every row of `fields` for one draw.
    /// `out` is filled quantity-major (`out[q * rows + row]`).
    ///
    /// # Errors
    ///
    /// Returns `EvalError::MissingRandomSource` when a predictive quantity is
    /// evaluated without `rng`.
    pub fn evaluate(
        &self,
        params: &[f64],
        latents: &[f64],
        fields: &FieldTable,
        mut rng: Option<&mut StdRng>,
        out: &mut Vec<f64>,
    ) -> Result<(), EvalError> {
        if self.is_stochastic() && rng.is_none() {
            return Err(EvalError::MissingRandomSource);
        }
        let rows = fields.nrows();
        out.clear();
        out.resize(self.quantities.len() * rows, 0.0);
        let mut derived = vec![0.0; self.derived.len()];

        for row in 0..rows {
            for (index, node) in self.derived.iter().enumerate() {
                if let Some(node) = node {
                    derived[index] = node.eval(&self.scope(params, latents, &derived, fields, row));
                }
            }
            let scope = self.scope(params, latents, &derived, fields, row);
            for (quantity, node) in self.quantities.iter().enumerate() {
                out[quantity * rows + row] = match (node, rng.as_deref_mut()) {
                    (QuantityNode::Expression(node), _) => node.eval(&scope),
                    (QuantityNode::Predictive(density), Some(rng)) => density.sample(&scope, rng),
                    (QuantityNode::Predictive(_), None) => {
                        return Err(EvalError::MissingRandomSource);
                    }
                };
            }
        }
        Ok(())
    }

    fn scope<'a>(
        &self,
        params: &'a [f64],
        latents: &'a [f64],
        derived: &'a [f64],
        fields: &'a FieldTable,
        row: usize,
    ) -> RowScope<'a> {
        RowScope {
            params,
            latents,
            latent_rows: self.latent_rows.unwrap_or(0),
            derived,
            fields,
            row,
        }
    }
}

fn references_latent(node: &Node) -> bool {
    match node {
        Node::Latent(_) => true,
        Node::Sum(children) | Node::Product(children) => children.iter().any(references_latent),
        Node::Power(base, exponent) => references_latent(base) || references_latent(exponent),
        Node::PowI(inner, _) | Node::Neg(inner) => references_latent(inner),
        Node::Const(_) | Node::Param(_) | Node::Derived(_) | Node::Field { .. } | Node::Dot { .. } => {
            false
        }
    }
}

/// Deterministic nodes needed by at least one generated quantity.
fn reachable_derived(model: &ModelSpec) -> Vec<bool> {
    let index: BTreeMap<&str, usize> = model
        .deterministic()
        .iter()
        .enumerate()
        .map(|(position, decl)| (decl.name.as_str(), position))
        .collect();
    let mut reachable = vec![false; index.len()];
    let mut pending: Vec<&Expr> = model
        .generated()
        .iter()
        .flat_map(super::GeneratedDecl::expressions)
        .collect();

    while let Some(expr) = pending.pop() {
        expr.walk(&mut |node| {
            if let Expr::Symbol(name) = node
                && let Some(position) = index.get(name.as_str())
                && !reachable[*position]
            {
                reachable[*position] = true;
                pending.push(&model.deterministic()[*position].expr);
            }
        });
    }
    reachable
}
