use bayes_regression::utils::sample_standard_normal;
use bayes_regression::{
    BackendRegistry, Dataset, DesignOptions, Density, Expr, McmcConfig, ModelBuilder,
    ModelError, PredictionGrid, Predictor, Prior, RawColumns, render_jags, run, summarize,
};
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};

fn idx_to_f64(idx: usize) -> f64 {
    f64::from(u32::try_from(idx).unwrap_or(u32::MAX))
}

fn config(seed: u64) -> McmcConfig {
    McmcConfig {
        chains: 3,
        iterations: 3_000,
        warmup: 1_000,
        thin: 2,
        seed,
        ..McmcConfig::default()
    }
}

#[test]
fn errors_in_variables_shrinks_noisy_observation_toward_the_line() {
    let n = 50;
    let mut rng = StdRng::seed_from_u64(17);
    let x_true: Vec<f64> = (0..n).map(|_| sample_standard_normal(&mut rng)).collect();
    let mut x_observed: Vec<f64> = x_true
        .iter()
        .map(|x| x + 0.3 * sample_standard_normal(&mut rng))
        .collect();
    x_observed[0] = x_true[0] + 2.0;
    let y: Vec<f64> = x_true
        .iter()
        .enumerate()
        .map(|(i, x)| 1.0 + 2.0 * x + 0.2 * (1.3 * idx_to_f64(i)).sin())
        .collect();

    let raw = RawColumns::new("y", y)
        .with_predictor("x", x_observed.clone())
        .with_measurement_error("x", vec![0.3; n]);
    let dataset = Dataset::build(&raw, &DesignOptions::default()).expect("valid data");

    let mut builder = ModelBuilder::for_dataset(&dataset);
    builder
        .add_parameter("alpha", Prior::normal(0.0, 100.0))
        .expect("alpha")
        .add_parameter("beta", Prior::normal(0.0, 100.0))
        .expect("beta")
        .add_parameter("sigma", Prior::uniform(0.0, 10.0))
        .expect("sigma")
        .add_latent("xtrue", Density::normal(0.0, 10.0), "x")
        .expect("latent")
        .set_likelihood(
            "y",
            Density::normal(Expr::sym("alpha") + Expr::sym("beta") * "xtrue", "sigma"),
        )
        .expect("likelihood");
    let model = builder.build().expect("model");

    let fit = run(&BackendRegistry::with_defaults(), &model, &dataset, &config(5))
        .expect("sampling succeeds");
    assert_eq!(fit.store.layout("xtrue").expect("latent layout").len, n);

    let latent = summarize(&fit.store, "xtrue", 0.95).expect("latent summary");
    let first = latent[0].mean;
    assert!(
        x_true[0] < first && first < x_observed[0],
        "posterior {first} not between {} and {}",
        x_true[0],
        x_observed[0]
    );
    assert!(first - x_true[0] < 1.0, "shrinkage too weak: {first}");

    let beta = summarize(&fit.store, "beta", 0.95).expect("beta");
    assert!((beta[0].mean - 2.0).abs() < 0.3, "slope {}", beta[0].mean);

    let jags = render_jags(&model).expect("model text");
    assert!(jags.contains("x[i] ~ dnorm(xtrue[i], pow(err_x[i], -2))"));
}

#[test]
fn errors_in_both_coordinates_denoise_the_response() {
    let n = 60;
    let mut rng = StdRng::seed_from_u64(23);
    let x_true: Vec<f64> = (0..n)
        .map(|_| 5.0 + 2.0 * sample_standard_normal(&mut rng))
        .collect();
    let y_true: Vec<f64> = x_true
        .iter()
        .map(|x| 2.0 + 1.5 * x + 0.3 * sample_standard_normal(&mut rng))
        .collect();
    let x: Vec<f64> = x_true
        .iter()
        .map(|x| x + 0.2 * sample_standard_normal(&mut rng))
        .collect();
    let y: Vec<f64> = y_true
        .iter()
        .map(|y| y + 0.5 * sample_standard_normal(&mut rng))
        .collect();

    let raw = RawColumns::new("y", y.clone())
        .with_predictor("x", x)
        .with_measurement_error("x", vec![0.2; n])
        .with_measurement_error("y", vec![0.5; n]);
    let dataset = Dataset::build(&raw, &DesignOptions::default()).expect("valid data");

    let mut builder = ModelBuilder::for_dataset(&dataset);
    builder
        .add_parameter("alpha", Prior::normal(0.0, 1.0e3))
        .expect("alpha")
        .add_parameter("beta", Prior::normal(0.0, 1.0e3))
        .expect("beta")
        .add_parameter("scatter", Prior::uniform(0.0, 10.0))
        .expect("scatter")
        .add_latent("xtrue", Density::normal(0.0, 100.0), "x")
        .expect("xtrue")
        .add_latent(
            "ytrue",
            Density::normal(Expr::sym("alpha") + Expr::sym("beta") * "xtrue", "scatter"),
            "y",
        )
        .expect("ytrue");
    let model = builder.build().expect("model");

    let config = McmcConfig {
        iterations: 6_000,
        warmup: 2_000,
        ..config(29)
    };
    let fit = run(&BackendRegistry::with_defaults(), &model, &dataset, &config)
        .expect("sampling succeeds");
    assert_eq!(fit.store.layout("ytrue").expect("y latent").len, n);

    let beta = summarize(&fit.store, "beta", 0.99).expect("beta");
    assert!(
        beta[0].contains(1.5),
        "slope interval [{}, {}]",
        beta[0].lower,
        beta[0].upper
    );

    let ytrue = summarize(&fit.store, "ytrue", 0.95).expect("y latent");
    let posterior_error: f64 = ytrue
        .iter()
        .zip(&y_true)
        .map(|(latent, truth)| (latent.mean - truth).powi(2))
        .sum();
    let observed_error: f64 = y
        .iter()
        .zip(&y_true)
        .map(|(observed, truth)| (observed - truth).powi(2))
        .sum();
    assert!(
        posterior_error < observed_error,
        "posterior {posterior_error} vs observed {observed_error}"
    );

    let jags = render_jags(&model).expect("model text");
    assert!(jags.contains("y[i] ~ dnorm(ytrue[i], pow(err_y[i], -2))"));
}

#[test]
fn autoregressive_model_recovers_persistence() {
    let n = 300;
    let mut rng = StdRng::seed_from_u64(31);
    let mut series = vec![1.5];
    for _ in 1..n {
        let previous = series[series.len() - 1];
        series.push(0.5 + 0.7 * previous + 0.3 * sample_standard_normal(&mut rng));
    }
    let raw = RawColumns::new("y", series.clone());
    let dataset = Dataset::build(&raw, &DesignOptions::default()).expect("valid data");

    let mut builder = ModelBuilder::for_dataset(&dataset);
    let mean = Expr::sym("alpha") + Expr::sym("phi") * Expr::lag("y", 1);
    builder
        .add_parameter("alpha", Prior::normal(0.0, 10.0))
        .expect("alpha")
        .add_parameter("phi", Prior::uniform(-1.0, 1.0))
        .expect("phi")
        .add_parameter("sigma", Prior::uniform(0.0, 10.0))
        .expect("sigma")
        .set_likelihood("y", Density::normal(mean.clone(), "sigma"))
        .expect("likelihood")
        .add_generated_quantity("fitted", mean)
        .expect("fitted");
    let model = builder.build().expect("model");
    assert_eq!(model.start_row(), 1);

    let fit = run(&BackendRegistry::with_defaults(), &model, &dataset, &config(9))
        .expect("sampling succeeds");
    let phi = summarize(&fit.store, "phi", 0.95).expect("phi");
    assert!((phi[0].mean - 0.7).abs() < 0.1, "phi {}", phi[0].mean);

    let observed = PredictionGrid::observed(&dataset);
    let fitted = Predictor::new(&fit.store, &model)
        .evaluate_quantity("fitted", &observed, None)
        .expect("in-sample fit");
    assert_eq!(fitted.grid_len(), n);
    let bands = fitted.bands(0.95).expect("bands");
    let expected = 0.5 + 0.7 * series[41];
    assert!((bands[42].mean - expected).abs() < 0.3);
}

#[test]
fn logistic_regression_predicts_rising_probability_on_grid() {
    let n = 400;
    let mut rng = StdRng::seed_from_u64(13);
    let x: Vec<f64> = (0..n).map(|i| 6.0 * idx_to_f64(i) / idx_to_f64(n - 1) - 3.0).collect();
    let z: Vec<f64> = x
        .iter()
        .map(|x| {
            let p = 1.0 / (1.0 + (0.5 - 1.5 * x).exp());
            if rng.random::<f64>() < p { 1.0 } else { 0.0 }
        })
        .collect();
    let raw = RawColumns::new("z", z).with_predictor("x", x);
    let dataset = Dataset::build(&raw, &DesignOptions::default()).expect("valid data");
    let grid = dataset.grid_over("x", 5).expect("grid");
    let dataset = dataset.with_prediction_grid(grid.clone());

    let mut builder = ModelBuilder::for_dataset(&dataset);
    builder
        .add_vector_parameter("beta", 2, Prior::normal(0.0, 10.0))
        .expect("beta")
        .set_likelihood("z", Density::bernoulli_logit(Expr::linear_predictor("beta")))
        .expect("likelihood")
        .add_predictive_quantity("znew", Density::bernoulli_logit(Expr::linear_predictor("beta")))
        .expect("znew");
    let model = builder.build().expect("model");

    let fit = run(&BackendRegistry::with_defaults(), &model, &dataset, &config(3))
        .expect("sampling succeeds");
    let beta = summarize(&fit.store, "beta", 0.95).expect("beta");
    assert!((beta[1].mean - 1.5).abs() < 0.5, "slope {}", beta[1].mean);

    let predictions = Predictor::new(&fit.store, &model)
        .predict(&grid, None)
        .expect("stored predictive draws");
    let znew = &predictions[0];
    assert_eq!(znew.grid_len(), 5);
    assert!(znew.at(2).iter().all(|value| *value == 0.0 || *value == 1.0));
    let bands = znew.bands(0.9).expect("bands");
    assert!(bands[0].mean < 0.2, "left end {}", bands[0].mean);
    assert!(bands[4].mean > 0.8, "right end {}", bands[4].mean);
    assert!(bands.windows(2).all(|pair| pair[0].mean <= pair[1].mean + 0.05));
}

#[test]
fn invalid_models_never_reach_a_backend() {
    let raw = RawColumns::new("y", vec![1.0, 2.0, 3.0]).with_predictor("x", vec![0.0, 1.0, 2.0]);
    let dataset = Dataset::build(&raw, &DesignOptions::default()).expect("valid data");

    let mut builder = ModelBuilder::for_dataset(&dataset);
    builder
        .add_parameter("sigma", Prior::uniform(0.0, 10.0))
        .expect("sigma");
    assert_eq!(
        builder
            .set_likelihood("y", Density::normal(Expr::linear_predictor("beta"), "sigma"))
            .err(),
        Some(ModelError::UndeclaredSymbol {
            name: "beta".to_string(),
            context: "likelihood of `y`".to_string(),
        })
    );
    assert_eq!(
        builder
            .add_parameter("sigma", Prior::uniform(0.0, 1.0))
            .err(),
        Some(ModelError::DuplicateName {
            name: "sigma".to_string()
        })
    );

    let mut cyclic = ModelBuilder::for_dataset(&dataset);
    cyclic
        .add_parameter("sigma", Prior::uniform(0.0, 10.0))
        .expect("sigma")
        .add_deterministic("mu", Expr::sym("y") * 0.5)
        .expect("mu")
        .set_likelihood("y", Density::normal("mu", "sigma"))
        .expect("likelihood");
    assert!(matches!(
        cyclic.build(),
        Err(ModelError::CyclicDependency { .. })
    ));
}
