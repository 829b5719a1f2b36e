/////////////////////////////////////////////////////////////////////////////////////////////\
//
// JAGS backend: model text, data dump, and CODA output parsing.
//
// Created on: 15 Oct 2026
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # JAGS backend
//!
//! [`render_jags`] writes a [`ModelSpec`] as JAGS model text. Observations
//! are indexed by `i in 1:N`, grid points by `j in 1:M`. Grid columns carry
//! a `_grid` suffix and the design matrices are `X` and `X_grid`. Normal
//! densities are written with precisions.
//!
//! [`JagsEngine`] runs that text through the `jags` command-line program,
//! one process per chain in its own working directory, and reads the draws
//! back from the CODA files it writes.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fmt::{self, Write};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use faer::Mat;

use super::ProposalStats;
use super::engine::{
    CancelToken, ChainRequest, CompiledModel, EngineError, RawChain, SamplerEngine,
    monitored_layout,
};
use crate::input::{Dataset, FieldTable, PredictionGrid};
use crate::model::{Density, Expr, Generated, ModelSpec, Prior};
use crate::posterior::ParameterLayout;

const MODEL_FILE: &str = "model.bug";
const DATA_FILE: &str = "data.R";
const INITS_FILE: &str = "inits.R";
const SCRIPT_FILE: &str = "script.cmd";
const LOG_FILE: &str = "jags.log";
const CODA_STEM: &str = "out";
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Largest seed JAGS accepts for `.RNG.seed`.
const MAX_SEED: u64 = 2_147_483_647;

static WORKDIR_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Copy)]
enum Index {
    /// Inside `for (i in 1:N)`.
    Row,
    /// Inside `for (i in s:N)`, where every lag stays in range.
    Tail,
    /// Inside `for (j in 1:M)`.
    Grid,
}

impl Index {
    const fn variable(self) -> char {
        match self {
            Self::Row | Self::Tail => 'i',
            Self::Grid => 'j',
        }
    }
}

struct Names<'a> {
    model: &'a ModelSpec,
    row_scoped: BTreeSet<&'a str>,
    vectors: BTreeSet<&'a str>,
}

impl Names<'_> {
    fn render(&self, expr: &Expr, index: Index) -> String {
        match expr {
            Expr::Const(value) => format_number(*value),
            Expr::Symbol(name) | Expr::Lagged(name, 0) => self.symbol(name, index),
            Expr::Element(name, position) => format!("{}[{}]", identifier(name), position + 1),
            Expr::Lagged(name, lag) => {
                let base = match index {
                    Index::Grid => format!("{}_grid", identifier(name)),
                    Index::Row | Index::Tail => identifier(name),
                };
                let variable = index.variable();
                match index {
                    Index::Tail => format!("{base}[{variable}-{lag}]"),
                    // rows before the start read the first row
                    Index::Row | Index::Grid => format!("{base}[max({variable}-{lag}, 1)]"),
                }
            }
            Expr::LinearPredictor(name) => match index {
                Index::Row | Index::Tail => format!("inprod(X[i,], {}[])", identifier(name)),
                Index::Grid => format!("inprod(X_grid[j,], {}[])", identifier(name)),
            },
            Expr::Sum(terms) => {
                let rendered: Vec<String> =
                    terms.iter().map(|term| self.render(term, index)).collect();
                format!("({})", rendered.join(" + "))
            }
            Expr::Product(factors) => {
                let rendered: Vec<String> = factors
                    .iter()
                    .map(|factor| self.render(factor, index))
                    .collect();
                rendered.join(" * ")
            }
            Expr::Power(base, exponent) => match exponent.as_ref() {
                Expr::Const(value) if (*value - 0.5).abs() < f64::EPSILON => {
                    format!("sqrt({})", self.render(base, index))
                }
                _ => format!(
                    "pow({}, {})",
                    self.render(base, index),
                    self.render(exponent, index)
                ),
            },
            Expr::Neg(inner) => format!("-({})", self.render(inner, index)),
        }
    }

    fn symbol(&self, name: &str, index: Index) -> String {
        let base = identifier(name);
        let is_field = self.model.schema().has_field(name);
        let variable = index.variable();
        match (index, is_field) {
            (Index::Grid, true) => format!("{base}_grid[j]"),
            (_, true) => format!("{base}[i]"),
            _ if self.row_scoped.contains(name) => format!("{base}[{variable}]"),
            _ if self.vectors.contains(name) => format!("{base}[]"),
            _ => base,
        }
    }

    fn density(&self, density: &Density, index: Index) -> String {
        match density {
            Density::Normal { location, scale } => format!(
                "dnorm({}, pow({}, -2))",
                self.render(location, index),
                self.render(scale, index)
            ),
            Density::BernoulliLogit { logit } => {
                format!("dbern(ilogit({}))", self.render(logit, index))
            }
        }
    }

    fn likelihoods(&self, text: &mut String, index: Index) -> fmt::Result {
        for likelihood in self.model.likelihoods() {
            writeln!(
                text,
                "    {}[i] ~ {}",
                identifier(&likelihood.field),
                self.density(&likelihood.density, index)
            )?;
        }
        Ok(())
    }
}

/// JAGS model block for `model`, generated quantities included.
///
/// # Errors
///
/// Propagates formatter errors.
pub fn render_jags(model: &ModelSpec) -> Result<String, fmt::Error> {
    render_model(model, true)
}

fn render_model(model: &ModelSpec, with_generated: bool) -> Result<String, fmt::Error> {
    let mut row_scoped: BTreeSet<&str> = model
        .latents()
        .iter()
        .map(|latent| latent.name.as_str())
        .collect();
    row_scoped.extend(
        model
            .deterministic()
            .iter()
            .filter(|decl| !decl.row_independent)
            .map(|decl| decl.name.as_str()),
    );
    let names = Names {
        model,
        row_scoped,
        vectors: model
            .parameters()
            .iter()
            .filter(|parameter| parameter.len.is_some())
            .map(|parameter| parameter.name.as_str())
            .collect(),
    };

    let mut text = String::from("model {\n");
    for parameter in model.parameters() {
        let name = identifier(&parameter.name);
        let prior = render_prior(parameter.prior);
        match parameter.len {
            Some(len) => writeln!(text, "  for (k in 1:{len}) {{\n    {name}[k] ~ {prior}\n  }}")?,
            None => writeln!(text, "  {name} ~ {prior}")?,
        }
    }
    for decl in model.derived_scalars().map(|(_, decl)| decl) {
        writeln!(
            text,
            "  {} <- {}",
            identifier(&decl.name),
            names.render(&decl.expr, Index::Row)
        )?;
    }

    text.push_str("  for (i in 1:N) {\n");
    for decl in model.deterministic().iter().filter(|decl| !decl.row_independent) {
        writeln!(
            text,
            "    {}[i] <- {}",
            identifier(&decl.name),
            names.render(&decl.expr, Index::Row)
        )?;
    }
    for latent in model.latents() {
        let name = identifier(&latent.name);
        writeln!(text, "    {name}[i] ~ {}", names.density(&latent.density, Index::Row))?;
        writeln!(
            text,
            "    {}[i] ~ dnorm({name}[i], pow({}[i], -2))",
            identifier(&latent.paired_field),
            identifier(&latent.error_field)
        )?;
    }
    if model.start_row() == 0 {
        names.likelihoods(&mut text, Index::Row)?;
    }
    text.push_str("  }\n");

    if model.start_row() > 0 {
        writeln!(text, "  for (i in {}:N) {{", model.start_row() + 1)?;
        names.likelihoods(&mut text, Index::Tail)?;
        text.push_str("  }\n");
    }

    if with_generated && !model.generated().is_empty() {
        text.push_str("  for (j in 1:M) {\n");
        for decl in model.generated() {
            let name = identifier(&decl.name);
            match &decl.generated {
                Generated::Expression(expr) => {
                    writeln!(text, "    {name}[j] <- {}", names.render(expr, Index::Grid))?;
                }
                Generated::Predictive(density) => {
                    writeln!(text, "    {name}[j] ~ {}", names.density(density, Index::Grid))?;
                }
            }
        }
        text.push_str("  }\n");
    }
    text.push_str("}\n");
    Ok(text)
}

fn render_prior(prior: Prior) -> String {
    match prior {
        Prior::Normal { mean, sd } => format!(
            "dnorm({}, {})",
            format_number(mean),
            format_number((sd * sd).recip())
        ),
        Prior::Uniform { lower, upper } => {
            format!("dunif({}, {})", format_number(lower), format_number(upper))
        }
        Prior::Gamma { shape, rate } => {
            format!("dgamma({}, {})", format_number(shape), format_number(rate))
        }
        Prior::HalfNormal { sd } => format!("dnorm(0, {}) T(0,)", format_number((sd * sd).recip())),
    }
}

/// R dump of everything the model text reads: `N`, every dataset field and
/// the design matrix `X`, plus `M`, the `_grid` fields and `X_grid` when a
/// grid is given.
fn render_data(dataset: &Dataset, grid: Option<&PredictionGrid>) -> Result<String, fmt::Error> {
    let mut text = String::new();
    writeln!(text, "\"N\" <- {}", dataset.n_obs())?;
    dump_fields(&mut text, dataset.fields(), "")?;
    dump_matrix(&mut text, "X", &dataset.design_matrix())?;
    if let Some(grid) = grid {
        writeln!(text, "\"M\" <- {}", grid.len())?;
        dump_fields(&mut text, grid.fields(), "_grid")?;
        dump_matrix(&mut text, "X_grid", &grid.design_matrix())?;
    }
    Ok(text)
}

fn dump_fields(text: &mut String, fields: &FieldTable, suffix: &str) -> fmt::Result {
    for name in fields.names() {
        let values = fields.column(name).unwrap_or_default();
        writeln!(text, "\"{}{suffix}\" <- c({})", identifier(name), join_values(&values))?;
    }
    Ok(())
}

/// Matrices are dumped column-major, as R stores them.
fn dump_matrix(text: &mut String, name: &str, matrix: &Mat<f64>) -> fmt::Result {
    if matrix.ncols() == 0 {
        return Ok(());
    }
    let values: Vec<f64> = (0..matrix.ncols())
        .flat_map(|j| (0..matrix.nrows()).map(move |i| matrix[(i, j)]))
        .collect();
    writeln!(
        text,
        "\"{name}\" <- structure(c({}), .Dim = c({}, {}))",
        join_values(&values),
        matrix.nrows(),
        matrix.ncols()
    )
}

fn join_values(values: &[f64]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// JAGS names allow letters, digits, `.` and `_`.
fn identifier(name: &str) -> String {
    name.replace('^', "_pow")
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric() || character == '.' || character == '_' {
                character
            } else {
                '_'
            }
        })
        .collect()
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1.0e6 {
        format!("{value:.1}")
    } else if value != 0.0 && (value.abs() < 1.0e-3 || value.abs() >= 1.0e6) {
        format!("{value:e}")
    } else {
        format!("{value}")
    }
}

/// Engine registered as `"jags"`, driving the JAGS command-line program.
#[derive(Debug, Clone)]
pub struct JagsEngine {
    program: PathBuf,
    args: Vec<OsString>,
}

impl Default for JagsEngine {
    fn default() -> Self {
        Self::new("jags")
    }
}

impl JagsEngine {
    /// `program` is a path or a name looked up on `PATH`.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Arguments passed before the script path, for wrapper programs.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl SamplerEngine for JagsEngine {
    fn name(&self) -> &str {
        "jags"
    }

    fn compile(
        &self,
        model: &ModelSpec,
        dataset: &Dataset,
    ) -> Result<Box<dyn CompiledModel>, EngineError> {
        let program = locate(&self.program).ok_or_else(|| EngineError::Unavailable {
            reason: format!("`{}` not found", self.program.display()),
        })?;
        for parameter in model.parameters() {
            if let Some(defect) = parameter.prior.defect() {
                return Err(EngineError::Rejected {
                    reason: format!("prior of `{}`: {defect}", parameter.name),
                });
            }
        }

        let grid = dataset
            .prediction_grid()
            .filter(|_| !model.generated().is_empty());
        let rendering_failed = |err: fmt::Error| EngineError::Rejected {
            reason: format!("cannot render model: {err}"),
        };
        let model_text = render_model(model, grid.is_some()).map_err(rendering_failed)?;
        let data_text = render_data(dataset, grid).map_err(rendering_failed)?;
        let layout = monitored_layout(model, dataset.n_obs(), grid.map(PredictionGrid::len));
        log::debug!(
            "rendered JAGS model ({} lines) monitoring {} nodes",
            model_text.lines().count(),
            layout.len()
        );

        Ok(Box::new(CompiledJags {
            program,
            args: self.args.clone(),
            model_text,
            data_text,
            layout,
        }))
    }
}

#[derive(Debug)]
struct CompiledJags {
    program: PathBuf,
    args: Vec<OsString>,
    model_text: String,
    data_text: String,
    layout: Vec<ParameterLayout>,
}

impl CompiledJags {
    fn script(&self, request: &ChainRequest) -> Result<String, fmt::Error> {
        let mut script = String::new();
        writeln!(script, "model in \"{MODEL_FILE}\"")?;
        writeln!(script, "data in \"{DATA_FILE}\"")?;
        writeln!(script, "compile, nchains(1)")?;
        writeln!(script, "parameters in \"{INITS_FILE}\"")?;
        writeln!(script, "initialize")?;
        if request.warmup > 0 {
            writeln!(script, "update {}", request.warmup)?;
        }
        for entry in &self.layout {
            writeln!(script, "monitor set {}", identifier(&entry.name))?;
        }
        writeln!(script, "update {}", request.iterations - request.warmup)?;
        writeln!(script, "coda *, stem(\"{CODA_STEM}\")")?;
        writeln!(script, "exit")?;
        Ok(script)
    }

    fn wait(&self, dir: &Path, cancel: &CancelToken) -> Result<ExitStatus, EngineError> {
        let log = File::create(dir.join(LOG_FILE)).map_err(|err| io_failure(LOG_FILE, &err))?;
        let log_err = log.try_clone().map_err(|err| io_failure(LOG_FILE, &err))?;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(SCRIPT_FILE)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            .spawn()
            .map_err(|err| EngineError::Unavailable {
                reason: format!("cannot start `{}`: {err}", self.program.display()),
            })?;

        loop {
            if let Some(status) = child
                .try_wait()
                .map_err(|err| io_failure("jags process", &err))?
            {
                return Ok(status);
            }
            if cancel.is_cancelled() {
                if let Err(err) = child.kill().and_then(|()| child.wait().map(drop)) {
                    log::debug!("could not stop cancelled JAGS process: {err}");
                }
                return Err(EngineError::Cancelled);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl CompiledModel for CompiledJags {
    fn layout(&self) -> &[ParameterLayout] {
        &self.layout
    }

    fn sample_chain(
        &self,
        request: &ChainRequest,
        cancel: &CancelToken,
    ) -> Result<RawChain, EngineError> {
        let workdir = WorkDir::create(request.chain)?;
        let script = self.script(request).map_err(|err| EngineError::Rejected {
            reason: format!("cannot render script: {err}"),
        })?;
        workdir.write(MODEL_FILE, &self.model_text)?;
        workdir.write(DATA_FILE, &self.data_text)?;
        workdir.write(
            INITS_FILE,
            &format!(
                "\".RNG.name\" <- \"base::Mersenne-Twister\"\n\".RNG.seed\" <- {}\n",
                request.seed % MAX_SEED
            ),
        )?;
        workdir.write(SCRIPT_FILE, &script)?;

        let status = self.wait(&workdir.path, cancel)?;
        if !status.success() {
            let output = workdir.read(LOG_FILE).unwrap_or_default();
            return Err(process_failure(status, &output));
        }

        let index = workdir.read(&format!("{CODA_STEM}CODAindex.txt"))?;
        let chain = workdir.read(&format!("{CODA_STEM}CODAchain1.txt"))?;
        let draws = read_coda(&index, &chain, &self.layout, request)?;
        Ok(RawChain {
            draws,
            stats: ProposalStats::default(),
        })
    }
}

/// Failed run: model errors reject the model, anything else counts as a
/// divergence of this chain.
fn process_failure(status: ExitStatus, output: &str) -> EngineError {
    let tail: Vec<&str> = output.lines().rev().take(5).collect();
    let reason = format!(
        "jags exited with {status}: {}",
        tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
    );
    if output.contains("Compilation error") || output.contains("syntax error") {
        EngineError::Rejected { reason }
    } else {
        EngineError::Diverged {
            iteration: 0,
            reason,
        }
    }
}

/// Rebuild retained draws from a CODA index (`name first last` per line)
/// and a chain file (`iteration value` per line).
fn read_coda(
    index: &str,
    chain: &str,
    layout: &[ParameterLayout],
    request: &ChainRequest,
) -> Result<Vec<Vec<f64>>, EngineError> {
    let values = chain
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            line.split_whitespace()
                .nth(1)
                .and_then(|value| value.parse::<f64>().ok())
                .ok_or_else(|| coda_error(format!("malformed chain line `{line}`")))
        })
        .collect::<Result<Vec<f64>, EngineError>>()?;

    let width = layout.iter().map(ParameterLayout::end).max().unwrap_or(0);
    let sampled = request.iterations - request.warmup;
    let mut draws = vec![vec![f64::NAN; width]; request.retained_draws()];
    let mut filled = vec![false; width];

    for line in index.lines().filter(|line| !line.trim().is_empty()) {
        let mut parts = line.split_whitespace();
        let (Some(node), Some(first), Some(last)) = (
            parts.next(),
            parts.next().and_then(|value| value.parse::<usize>().ok()),
            parts.next().and_then(|value| value.parse::<usize>().ok()),
        ) else {
            return Err(coda_error(format!("malformed index line `{line}`")));
        };
        let column = node_column(node, layout)?;
        if first == 0 || last < first || last > values.len() || last - first + 1 != sampled {
            return Err(coda_error(format!(
                "`{node}` covers lines {first}..={last}; expected {sampled} iterations"
            )));
        }
        for (position, value) in values[first - 1..last].iter().enumerate() {
            if position % request.thin == 0 {
                draws[position / request.thin][column] = *value;
            }
        }
        filled[column] = true;
    }

    if let Some(column) = filled.iter().position(|done| !done) {
        let node = layout
            .iter()
            .find(|entry| (entry.offset..entry.end()).contains(&column))
            .map_or_else(|| column.to_string(), |entry| entry.component_label(column - entry.offset));
        return Err(coda_error(format!("`{node}` is missing from the CODA output")));
    }
    Ok(draws)
}

/// Column of a CODA node name such as `sigma` or `beta[2]` (1-based).
fn node_column(node: &str, layout: &[ParameterLayout]) -> Result<usize, EngineError> {
    let (base, position) = match node.split_once('[') {
        Some((base, rest)) => {
            let position = rest
                .strip_suffix(']')
                .and_then(|value| value.parse::<usize>().ok())
                .filter(|value| *value > 0)
                .ok_or_else(|| coda_error(format!("unsupported node `{node}`")))?;
            (base, position - 1)
        }
        None => (node, 0),
    };
    layout
        .iter()
        .find(|entry| identifier(&entry.name) == base)
        .filter(|entry| position < entry.len)
        .map(|entry| entry.offset + position)
        .ok_or_else(|| coda_error(format!("unexpected node `{node}`")))
}

fn coda_error(reason: String) -> EngineError {
    EngineError::Diverged {
        iteration: 0,
        reason: format!("CODA output: {reason}"),
    }
}

fn io_failure(what: &str, err: &std::io::Error) -> EngineError {
    EngineError::Unavailable {
        reason: format!("{what}: {err}"),
    }
}

/// Resolve `program` as a path, or by name on `PATH`.
fn locate(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return program.is_file().then(|| program.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Per-chain scratch directory, removed on drop.
struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    fn create(chain: usize) -> Result<Self, EngineError> {
        let path = std::env::temp_dir().join(format!(
            "bayes_regression-jags-{}-{chain}-{}",
            std::process::id(),
            WORKDIR_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::create_dir_all(&path).map_err(|err| io_failure("working directory", &err))?;
        Ok(Self { path })
    }

    fn write(&self, name: &str, contents: &str) -> Result<(), EngineError> {
        fs::write(self.path.join(name), contents).map_err(|err| io_failure(name, &err))
    }

    fn read(&self, name: &str) -> Result<String, EngineError> {
        fs::read_to_string(self.path.join(name)).map_err(|err| EngineError::Diverged {
            iteration: 0,
            reason: format!("cannot read {name}: {err}"),
        })
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_dir_all(&self.path) {
            log::debug!("could not remove {}: {err}", self.path.display());
        }
    }
}
