/////////////////////////////////////////////////////////////////////////////////////////////\
//
// Model specification: builder, declarations and validation.
//
// Created on: 15 Oct 2026
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # Model specification
//!
//! A [`ModelSpec`] declares, in order:
//!
//! - parameters with fixed-hyperparameter priors (scalar or vector-valued),
//! - latent "true value" nodes, each paired with a noisy observed field whose
//!   measurement likelihood `field[i] ~ Normal(latent[i], err_field[i])` is
//!   implied,
//! - deterministic nodes (named intermediate expressions),
//! - likelihoods linking observed fields to expressions,
//! - generated quantities evaluated against a prediction grid.
//!
//! Expressions may only reference names declared before them, plus dataset
//! fields. Problems are reported eagerly by [`ModelBuilder`] and the
//! dependency graph is checked for cycles by [`ModelBuilder::build`], so an
//! invalid model never reaches an inference backend.
//!
//! # Examples
//!
//! ```
//! use bayes_regression::{Dataset, DesignOptions, Density, Expr, ModelBuilder, Prior, RawColumns};
//!
//! let raw = RawColumns::new("y", vec![1.9, 5.1, 8.0])
//!     .with_predictor("x", vec![0.0, 1.0, 2.0]);
//! let dataset = Dataset::build(&raw, &DesignOptions::default()).expect("valid data");
//!
//! let mut builder = ModelBuilder::for_dataset(&dataset);
//! builder
//!     .add_vector_parameter("beta", 2, Prior::normal(0.0, 100.0))
//!     .expect("beta")
//!     .add_parameter("sigma", Prior::uniform(0.0, 10.0))
//!     .expect("sigma")
//!     .set_likelihood("y", Density::normal(Expr::linear_predictor("beta"), "sigma"))
//!     .expect("likelihood");
//! let model = builder.build().expect("valid model");
//!
//! assert_eq!(model.parameter_count(), 3);
//! ```

use std::collections::BTreeMap;

use thiserror::Error;

use crate::input::{DataSchema, Dataset};

pub mod eval;
pub mod expr;
pub mod graph;
pub mod likelihood;
pub mod priors;

pub use expr::Expr;
pub use graph::DependencyGraph;
pub use priors::{Density, Prior};

/// Errors returned while declaring a model.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("undeclared symbol `{name}` in {context}")]
    UndeclaredSymbol { name: String, context: String },
    #[error("name `{name}` is already declared")]
    DuplicateName { name: String },
    #[error("dependency cycle: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },
    #[error("`{name}` cannot be used in {context}: {reason}")]
    InvalidReference {
        name: String,
        context: String,
        reason: &'static str,
    },
    #[error("index {index} is out of range for `{name}` of length {len}")]
    ElementOutOfRange {
        name: String,
        index: usize,
        len: usize,
    },
    #[error("coefficient vector `{parameter}` has length {len}; the design has {columns} columns")]
    DesignWidthMismatch {
        parameter: String,
        len: usize,
        columns: usize,
    },
    #[error("field `{field}` has no measurement-error column to pair with a latent node")]
    MissingMeasurementError { field: String },
    #[error("latent node `{name}` must have a continuous density")]
    DiscreteLatent { name: String },
    #[error("vector parameter `{name}` must have at least one component")]
    EmptyVectorParameter { name: String },
    #[error("model declares no likelihood")]
    NoLikelihood,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterDecl {
    pub name: String,
    /// `None` for scalars.
    pub len: Option<usize>,
    pub prior: Prior,
}

impl ParameterDecl {
    #[must_use]
    pub fn width(&self) -> usize {
        self.len.unwrap_or(1)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LatentDecl {
    pub name: String,
    pub density: Density,
    pub paired_field: String,
    pub error_field: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeterministicDecl {
    pub name: String,
    pub expr: Expr,
    /// Depends on parameters only, so it has one value per draw.
    pub row_independent: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LikelihoodDecl {
    pub field: String,
    pub density: Density,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Generated {
    /// Pure function of a posterior draw.
    Expression(Expr),
    /// Draw from the density at each posterior draw (posterior predictive).
    Predictive(Density),
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedDecl {
    pub name: String,
    pub generated: Generated,
}

impl GeneratedDecl {
    #[must_use]
    pub const fn is_stochastic(&self) -> bool {
        matches!(self.generated, Generated::Predictive(_))
    }

    #[must_use]
    pub fn expressions(&self) -> Vec<&Expr> {
        match &self.generated {
            Generated::Expression(expr) => vec![expr],
            Generated::Predictive(density) => density.expressions(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SymbolKind {
    Parameter,
    VectorParameter(usize),
    Latent,
    Deterministic { row_independent: bool },
    Field,
    Generated,
}

/// Validated, immutable model specification.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    parameters: Vec<ParameterDecl>,
    latents: Vec<LatentDecl>,
    deterministic: Vec<DeterministicDecl>,
    likelihoods: Vec<LikelihoodDecl>,
    generated: Vec<GeneratedDecl>,
    schema: DataSchema,
    start_row: usize,
}

impl ModelSpec {
    #[must_use]
    pub fn parameters(&self) -> &[ParameterDecl] {
        &self.parameters
    }

    #[must_use]
    pub fn latents(&self) -> &[LatentDecl] {
        &self.latents
    }

    #[must_use]
    pub fn deterministic(&self) -> &[DeterministicDecl] {
        &self.deterministic
    }

    #[must_use]
    pub fn likelihoods(&self) -> &[LikelihoodDecl] {
        &self.likelihoods
    }

    #[must_use]
    pub fn generated(&self) -> &[GeneratedDecl] {
        &self.generated
    }

    #[must_use]
    pub const fn schema(&self) -> &DataSchema {
        &self.schema
    }

    /// First row contributing to observed-field likelihoods (the largest lag
    /// referenced by the model).
    #[must_use]
    pub const fn start_row(&self) -> usize {
        self.start_row
    }

    /// Flattened parameter width (vector parameters count each component).
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.parameters.iter().map(ParameterDecl::width).sum()
    }

    /// `(name, offset, width)` of every parameter in the flattened vector.
    #[must_use]
    pub fn parameter_offsets(&self) -> Vec<(&str, usize, usize)> {
        let mut offset = 0;
        self.parameters
            .iter()
            .map(|parameter| {
                let entry = (parameter.name.as_str(), offset, parameter.width());
                offset += parameter.width();
                entry
            })
            .collect()
    }

    /// Deterministic nodes with one value per draw, monitored alongside
    /// parameters.
    pub fn derived_scalars(&self) -> impl Iterator<Item = (usize, &DeterministicDecl)> {
        self.deterministic
            .iter()
            .enumerate()
            .filter(|(_, decl)| decl.row_independent)
    }
}

/// Incremental, validating constructor for [`ModelSpec`].
#[derive(Debug, Clone)]
pub struct ModelBuilder {
    schema: DataSchema,
    symbols: BTreeMap<String, SymbolKind>,
    observed: BTreeMap<String, ()>,
    parameters: Vec<ParameterDecl>,
    latents: Vec<LatentDecl>,
    deterministic: Vec<DeterministicDecl>,
    likelihoods: Vec<LikelihoodDecl>,
    generated: Vec<GeneratedDecl>,
}

impl ModelBuilder {
    #[must_use]
    pub fn new(schema: DataSchema) -> Self {
        let symbols = schema
            .fields
            .iter()
            .map(|field| (field.clone(), SymbolKind::Field))
            .collect();
        Self {
            schema,
            symbols,
            observed: BTreeMap::new(),
            parameters: Vec::new(),
            latents: Vec::new(),
            deterministic: Vec::new(),
            likelihoods: Vec::new(),
            generated: Vec::new(),
        }
    }

    #[must_use]
    pub fn for_dataset(dataset: &Dataset) -> Self {
        Self::new(dataset.schema())
    }

    /// # Errors
    ///
    /// Returns `ModelError::DuplicateName` if `name` is already declared.
    pub fn add_parameter(
        &mut self,
        name: impl Into<String>,
        prior: Prior,
    ) -> Result<&mut Self, ModelError> {
        let name = name.into();
        self.declare(&name, SymbolKind::Parameter)?;
        self.parameters.push(ParameterDecl {
            name,
            len: None,
            prior,
        });
        Ok(self)
    }

    /// Vector parameter whose `len` components share one prior.
    ///
    /// # Errors
    ///
    /// Returns `ModelError::DuplicateName` on collision and
    /// `EmptyVectorParameter` if `len == 0`.
    pub fn add_vector_parameter(
        &mut self,
        name: impl Into<String>,
        len: usize,
        prior: Prior,
    ) -> Result<&mut Self, ModelError> {
        let name = name.into();
        if len == 0 {
            return Err(ModelError::EmptyVectorParameter { name });
        }
        self.declare(&name, SymbolKind::VectorParameter(len))?;
        self.parameters.push(ParameterDecl {
            name,
            len: Some(len),
            prior,
        });
        Ok(self)
    }

    /// Latent true value of the noisy field `paired_field`, with `density` as
    /// its prior. The measurement likelihood of the field is implied.
    ///
    /// # Errors
    ///
    /// Returns `ModelError` if the density references unknown names, the
    /// field is unknown, already observed or has no measurement error.
    pub fn add_latent(
        &mut self,
        name: impl Into<String>,
        density: Density,
        paired_field: &str,
    ) -> Result<&mut Self, ModelError> {
        let name = name.into();
        if density.is_discrete() {
            return Err(ModelError::DiscreteLatent { name });
        }
        let context = format!("prior of latent `{name}`");
        for expr in density.expressions() {
            self.check_expr(expr, &context)?;
        }
        self.check_observable(paired_field, &context)?;
        let error_field = self
            .schema
            .measurement_errors
            .get(paired_field)
            .cloned()
            .ok_or_else(|| ModelError::MissingMeasurementError {
                field: paired_field.to_string(),
            })?;
        self.declare(&name, SymbolKind::Latent)?;
        self.observed.insert(paired_field.to_string(), ());
        self.latents.push(LatentDecl {
            name,
            density,
            paired_field: paired_field.to_string(),
            error_field,
        });
        Ok(self)
    }

    /// Named intermediate expression.
    ///
    /// # Errors
    ///
    /// Returns `ModelError` on a name collision or an invalid reference.
    pub fn add_deterministic(
        &mut self,
        name: impl Into<String>,
        expr: Expr,
    ) -> Result<&mut Self, ModelError> {
        let name = name.into();
        self.check_expr(&expr, &format!("deterministic node `{name}`"))?;
        let row_independent = self.is_row_independent(&expr);
        self.declare(&name, SymbolKind::Deterministic { row_independent })?;
        self.deterministic.push(DeterministicDecl {
            name,
            expr,
            row_independent,
        });
        Ok(self)
    }

    /// Likelihood of an observed data field.
    ///
    /// # Errors
    ///
    /// Returns `ModelError` if the field is unknown or already observed, or
    /// the density references invalid names.
    pub fn set_likelihood(
        &mut self,
        observed_field: &str,
        density: Density,
    ) -> Result<&mut Self, ModelError> {
        let context = format!("likelihood of `{observed_field}`");
        self.check_observable(observed_field, &context)?;
        for expr in density.expressions() {
            self.check_expr(expr, &context)?;
        }
        self.observed.insert(observed_field.to_string(), ());
        self.likelihoods.push(LikelihoodDecl {
            field: observed_field.to_string(),
            density,
        });
        Ok(self)
    }

    /// Deterministic quantity evaluated at each posterior draw.
    ///
    /// # Errors
    ///
    /// Returns `ModelError` on a name collision or an invalid reference.
    pub fn add_generated_quantity(
        &mut self,
        name: impl Into<String>,
        expr: Expr,
    ) -> Result<&mut Self, ModelError> {
        self.push_generated(name.into(), Generated::Expression(expr))
    }

    /// Posterior-predictive quantity: a fresh draw from `density` at each
    /// posterior draw.
    ///
    /// # Errors
    ///
    /// Returns `ModelError` on a name collision or an invalid reference.
    pub fn add_predictive_quantity(
        &mut self,
        name: impl Into<String>,
        density: Density,
    ) -> Result<&mut Self, ModelError> {
        self.push_generated(name.into(), Generated::Predictive(density))
    }

    /// Finish the specification.
    ///
    /// # Errors
    ///
    /// Returns `ModelError::NoLikelihood` if nothing is observed and
    /// `ModelError::CyclicDependency` if the dependency graph has a cycle.
    pub fn build(&self) -> Result<ModelSpec, ModelError> {
        if self.likelihoods.is_empty() && self.latents.is_empty() {
            return Err(ModelError::NoLikelihood);
        }
        if let Some(cycle) = self.dependency_graph().find_cycle() {
            return Err(ModelError::CyclicDependency { cycle });
        }

        let latent_lags = self
            .latents
            .iter()
            .flat_map(|latent| latent.density.expressions());
        let likelihood_lags = self
            .likelihoods
            .iter()
            .flat_map(|likelihood| likelihood.density.expressions());
        let start_row = latent_lags
            .chain(likelihood_lags)
            .chain(self.deterministic.iter().map(|decl| &decl.expr))
            .map(Expr::max_lag)
            .max()
            .unwrap_or(0);

        Ok(ModelSpec {
            parameters: self.parameters.clone(),
            latents: self.latents.clone(),
            deterministic: self.deterministic.clone(),
            likelihoods: self.likelihoods.clone(),
            generated: self.generated.clone(),
            schema: self.schema.clone(),
            start_row,
        })
    }

    /// Graph from each declared node to what it depends on. An observed
    /// field depends on its likelihood (or paired latent), so a lag-0
    /// reference to an observed field is a dependency on that likelihood.
    #[must_use]
    pub fn dependency_graph(&self) -> DependencyGraph {
        let mut graph = DependencyGraph::default();
        for parameter in &self.parameters {
            graph.add_node(&parameter.name);
        }
        for latent in &self.latents {
            add_expression_edges(&mut graph, &latent.name, latent.density.expressions());
            graph.add_edge(&latent.paired_field, &latent.name);
            graph.add_edge(&latent.paired_field, &latent.error_field);
        }
        for decl in &self.deterministic {
            add_expression_edges(&mut graph, &decl.name, vec![&decl.expr]);
        }
        for likelihood in &self.likelihoods {
            add_expression_edges(&mut graph, &likelihood.field, likelihood.density.expressions());
        }
        for decl in &self.generated {
            add_expression_edges(&mut graph, &decl.name, decl.expressions());
        }
        graph
    }

    fn push_generated(
        &mut self,
        name: String,
        generated: Generated,
    ) -> Result<&mut Self, ModelError> {
        let decl = GeneratedDecl { name, generated };
        let context = format!("generated quantity `{}`", decl.name);
        for expr in decl.expressions() {
            self.check_expr(expr, &context)?;
        }
        self.declare(&decl.name, SymbolKind::Generated)?;
        self.generated.push(decl);
        Ok(self)
    }

    fn declare(&mut self, name: &str, kind: SymbolKind) -> Result<(), ModelError> {
        if self.symbols.contains_key(name) {
            return Err(ModelError::DuplicateName {
                name: name.to_string(),
            });
        }
        self.symbols.insert(name.to_string(), kind);
        Ok(())
    }

    fn check_observable(&self, field: &str, context: &str) -> Result<(), ModelError> {
        match self.symbols.get(field) {
            None => Err(ModelError::UndeclaredSymbol {
                name: field.to_string(),
                context: context.to_string(),
            }),
            Some(SymbolKind::Field) => {
                if self.observed.contains_key(field) {
                    Err(ModelError::DuplicateName {
                        name: field.to_string(),
                    })
                } else {
                    Ok(())
                }
            }
            Some(_) => Err(ModelError::InvalidReference {
                name: field.to_string(),
                context: context.to_string(),
                reason: "only data fields can be observed",
            }),
        }
    }

    fn check_expr(&self, expr: &Expr, context: &str) -> Result<(), ModelError> {
        let mut result = Ok(());
        expr.walk(&mut |node| {
            if result.is_ok() {
                result = self.check_node(node, context);
            }
        });
        result
    }

    fn check_node(&self, node: &Expr, context: &str) -> Result<(), ModelError> {
        let (name, kind) = match node {
            Expr::Symbol(name)
            | Expr::Element(name, _)
            | Expr::Lagged(name, _)
            | Expr::LinearPredictor(name) => {
                let kind = self.symbols.get(name).copied().ok_or_else(|| {
                    ModelError::UndeclaredSymbol {
                        name: name.clone(),
                        context: context.to_string(),
                    }
                })?;
                (name, kind)
            }
            Expr::Const(_) | Expr::Sum(_) | Expr::Product(_) | Expr::Power(..) | Expr::Neg(_) => {
                return Ok(());
            }
        };
        let invalid = |reason| ModelError::InvalidReference {
            name: name.clone(),
            context: context.to_string(),
            reason,
        };

        match (node, kind) {
            (_, SymbolKind::Generated) => Err(invalid("generated quantities cannot be referenced")),
            (Expr::Symbol(_), SymbolKind::VectorParameter(_)) => Err(invalid(
                "vector parameters need an element index or a linear predictor",
            )),
            (Expr::Symbol(_), _) => Ok(()),
            (Expr::Element(_, index), SymbolKind::VectorParameter(len)) => {
                if *index < len {
                    Ok(())
                } else {
                    Err(ModelError::ElementOutOfRange {
                        name: name.clone(),
                        index: *index,
                        len,
                    })
                }
            }
            (Expr::Element(..), _) => Err(invalid("not a vector parameter")),
            (Expr::Lagged(..), SymbolKind::Field) => Ok(()),
            (Expr::Lagged(..), _) => Err(invalid("only data fields can be lagged")),
            (Expr::LinearPredictor(_), SymbolKind::VectorParameter(len)) => {
                if len == self.schema.design_width {
                    Ok(())
                } else {
                    Err(ModelError::DesignWidthMismatch {
                        parameter: name.clone(),
                        len,
                        columns: self.schema.design_width,
                    })
                }
            }
            (Expr::LinearPredictor(_), _) => Err(invalid("not a vector parameter")),
            _ => Ok(()),
        }
    }

    fn is_row_independent(&self, expr: &Expr) -> bool {
        let mut independent = true;
        expr.walk(&mut |node| match node {
            Expr::Symbol(name) => {
                independent &= matches!(
                    self.symbols.get(name),
                    Some(
                        SymbolKind::Parameter
                            | SymbolKind::Deterministic {
                                row_independent: true
                            }
                    )
                );
            }
            Expr::Lagged(..) | Expr::LinearPredictor(_) => independent = false,
            _ => {}
        });
        independent
    }
}

fn add_expression_edges(graph: &mut DependencyGraph, node: &str, exprs: Vec<&Expr>) {
    graph.add_node(node);
    for expr in exprs {
        expr.walk(&mut |leaf| match leaf {
            Expr::Symbol(name)
            | Expr::Lagged(name, 0)
            | Expr::Element(name, _)
            | Expr::LinearPredictor(name) => graph.add_edge(node, name),
            _ => {}
        });
    }
}
