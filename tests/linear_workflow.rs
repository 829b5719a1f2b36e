use approx::assert_relative_eq;
use bayes_regression::utils::sample_standard_normal;
use bayes_regression::{
    BackendRegistry, Dataset, DesignOptions, Density, Expr, McmcConfig, ModelBuilder, ModelSpec,
    PredictionGrid, Predictor, Prior, RawColumns, StoreError, convergence, render_summary_table,
    run, summarize, summarize_all,
};
use rand::SeedableRng;
use rand::rngs::StdRng;

fn idx_to_f64(idx: usize) -> f64 {
    f64::from(u32::try_from(idx).unwrap_or(u32::MAX))
}

fn linear_data(n: usize, noise: f64, seed: u64) -> Dataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let x: Vec<f64> = (0..n)
        .map(|i| 4.0 * idx_to_f64(i) / idx_to_f64(n - 1) - 2.0)
        .collect();
    let y: Vec<f64> = x
        .iter()
        .map(|x| 2.0 + 3.0 * x + noise * sample_standard_normal(&mut rng))
        .collect();
    let raw = RawColumns::new("y", y).with_predictor("x", x);
    Dataset::build(&raw, &DesignOptions::default()).expect("valid data")
}

fn linear_model(dataset: &Dataset) -> ModelSpec {
    let mut builder = ModelBuilder::for_dataset(dataset);
    builder
        .add_vector_parameter("beta", 2, Prior::normal(0.0, 100.0))
        .expect("beta")
        .add_parameter("sigma", Prior::uniform(0.0, 10.0))
        .expect("sigma")
        .add_deterministic("precision", Expr::sym("sigma").powi(-2))
        .expect("precision")
        .set_likelihood("y", Density::normal(Expr::linear_predictor("beta"), "sigma"))
        .expect("likelihood")
        .add_generated_quantity("mu", Expr::linear_predictor("beta"))
        .expect("mu")
        .add_predictive_quantity(
            "ynew",
            Density::normal(Expr::linear_predictor("beta"), "sigma"),
        )
        .expect("ynew");
    builder.build().expect("valid model")
}

fn config() -> McmcConfig {
    McmcConfig {
        chains: 3,
        iterations: 5_000,
        warmup: 1_000,
        thin: 2,
        seed: 2024,
        ..McmcConfig::default()
    }
}

#[test]
fn linear_regression_recovers_coefficients() {
    let dataset = linear_data(500, 1.0, 7);
    let model = linear_model(&dataset);
    let fit = run(&BackendRegistry::with_defaults(), &model, &dataset, &config())
        .expect("sampling succeeds");

    assert!(fit.dropped_chains.is_empty());
    assert_eq!(fit.store.chain_ids(), [0, 1, 2]);
    assert_eq!(fit.store.draws_per_chain(), 2_000);
    assert_eq!(fit.store.total_draws(), 6_000);

    let beta = summarize(&fit.store, "beta", 0.95).expect("beta summary");
    assert_eq!(beta[0].label, "beta[0]");
    assert!((beta[0].mean - 2.0).abs() < 0.3, "intercept {}", beta[0].mean);
    assert!((beta[1].mean - 3.0).abs() < 0.3, "slope {}", beta[1].mean);
    for summary in &beta {
        assert!(summary.contains(summary.mean));
    }

    let sigma = summarize(&fit.store, "sigma", 0.95).expect("sigma summary");
    assert!((sigma[0].mean - 1.0).abs() < 0.15, "sigma {}", sigma[0].mean);

    let precision = summarize(&fit.store, "precision", 0.95).expect("derived summary");
    assert!(precision[0].mean > 0.5 && precision[0].mean < 2.0);

    let diagnostics = convergence(&fit.store).expect("diagnostics");
    let rhat = diagnostics.max_split_rhat().expect("enough draws");
    assert!(rhat < 1.1, "split R-hat {rhat}");

    let table = render_summary_table(
        &summarize_all(&fit.store, 0.95).expect("all summaries"),
        0.95,
    );
    assert!(table.contains("beta[1]"));
    assert!(table.contains("precision"));
}

#[test]
fn runs_are_reproducible_for_a_fixed_seed() {
    let dataset = linear_data(60, 0.5, 3);
    let model = linear_model(&dataset);
    let config = McmcConfig {
        chains: 2,
        iterations: 300,
        warmup: 100,
        ..config()
    };
    let registry = BackendRegistry::with_defaults();
    let first = run(&registry, &model, &dataset, &config).expect("first run");
    let second = run(&registry, &model, &dataset, &config).expect("second run");

    let a = first.store.extract("beta").expect("beta");
    let b = second.store.extract("beta").expect("beta");
    assert_eq!(a.nrows(), b.nrows());
    for i in 0..a.nrows() {
        for j in 0..a.ncols() {
            assert_eq!(a[(i, j)].to_bits(), b[(i, j)].to_bits());
        }
    }

    let chain0 = first.store.extract_chain("beta", 0).expect("chain 0");
    let chain1 = first.store.extract_chain("beta", 1).expect("chain 1");
    assert!((0..chain0.nrows()).any(|i| chain0[(i, 0)].to_bits() != chain1[(i, 0)].to_bits()));
    assert!(matches!(
        first.store.extract_chain("beta", 5),
        Err(StoreError::ChainOutOfRange { chain: 5, .. })
    ));
}

#[test]
fn predictions_on_grid_follow_the_fitted_line() {
    let dataset = linear_data(200, 0.5, 11);
    let model = linear_model(&dataset);
    let config = McmcConfig {
        chains: 2,
        iterations: 2_000,
        warmup: 1_000,
        ..config()
    };
    let fit = run(&BackendRegistry::with_defaults(), &model, &dataset, &config)
        .expect("sampling succeeds");
    let grid = dataset.grid_over("x", 9).expect("grid");
    let predictor = Predictor::new(&fit.store, &model);

    let mut rng = StdRng::seed_from_u64(1);
    let quantities = predictor.evaluate(&grid, Some(&mut rng)).expect("evaluate");
    assert_eq!(quantities.len(), 2);
    let mu = &quantities[0];
    assert_eq!(mu.name, "mu");
    assert_eq!(mu.draw_count(), fit.store.total_draws());
    assert_eq!(mu.grid_len(), 9);

    let points = grid.column("x").expect("grid x");
    assert_relative_eq!(points[0], -2.0);
    assert_relative_eq!(points[8], 2.0);
    let bands = mu.bands(0.95).expect("mu bands");
    for (x, band) in points.iter().zip(&bands) {
        assert!((band.mean - (2.0 + 3.0 * x)).abs() < 0.3, "x = {x}");
        assert!(band.lower < band.mean && band.mean < band.upper);
    }

    let ynew = quantities[1].bands(0.95).expect("ynew bands");
    for (line, predictive) in bands.iter().zip(&ynew) {
        assert!(predictive.upper - predictive.lower > line.upper - line.lower);
    }

    let mut rng = StdRng::seed_from_u64(1);
    let again = predictor
        .evaluate_quantity("mu", &grid, Some(&mut rng))
        .expect("again");
    assert_eq!(again.at(4), mu.at(4));

    let observed = PredictionGrid::observed(&dataset);
    let in_sample = predictor
        .evaluate_quantity("mu", &observed, Some(&mut rng))
        .expect("in-sample");
    assert_eq!(in_sample.grid_len(), 200);
}

#[test]
fn polynomial_design_fits_curvature() {
    let mut rng = StdRng::seed_from_u64(21);
    let x: Vec<f64> = (0..150).map(|i| idx_to_f64(i) / 50.0 - 1.5).collect();
    let y: Vec<f64> = x
        .iter()
        .map(|x| 1.0 - 2.0 * x + 1.5 * x * x + 0.2 * sample_standard_normal(&mut rng))
        .collect();
    let raw = RawColumns::new("y", y).with_predictor("x", x);
    let options = DesignOptions {
        polynomial_degree: 2,
        ..DesignOptions::default()
    };
    let dataset = Dataset::build(&raw, &options).expect("valid data");
    assert_eq!(dataset.design_names(), ["intercept", "x", "x^2"]);

    let mut builder = ModelBuilder::for_dataset(&dataset);
    builder
        .add_vector_parameter("beta", 3, Prior::normal(0.0, 100.0))
        .expect("beta")
        .add_parameter("sigma", Prior::uniform(0.0, 10.0))
        .expect("sigma")
        .set_likelihood("y", Density::normal(Expr::linear_predictor("beta"), "sigma"))
        .expect("likelihood");
    let model = builder.build().expect("model");
    let fit = run(&BackendRegistry::with_defaults(), &model, &dataset, &config())
        .expect("sampling succeeds");
    let beta = summarize(&fit.store, "beta", 0.9).expect("beta");
    assert!((beta[2].mean - 1.5).abs() < 0.2, "curvature {}", beta[2].mean);
}
